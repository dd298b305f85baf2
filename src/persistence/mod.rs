//! # Persistence Module
//!
//! ## Why This Module Exists
//! The relay keeps two small pieces of durable state: the printer connection
//! settings the dashboard edits, and the cloud account token used for the
//! model summary. Both are whole-file JSON documents that the dashboard reads
//! back verbatim, so the field names on disk match the ones the UI sends.
//!
//! ## Key Abstractions
//! - **Storage seam**: [`storage::Storage`] hides where the bytes live, so the
//!   stores can run against a file in production and memory in tests
//! - **Patch-and-persist**: updates are partial documents merged onto the
//!   current value, then written out in full
//!
//! ## Error Handling Strategy
//! Loading never fails: a missing or corrupt file degrades to defaults. Saving
//! reports [`storage::StorageError`] so the HTTP layer can answer with a
//! failure response.

pub mod config_store;
pub mod storage;
pub mod token_store;

pub use config_store::ConfigStore;
pub use storage::{FileStorage, MemoryStorage, Storage, StorageError};
pub use token_store::TokenStore;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Default MQTT-over-TLS port exposed by the printers.
pub const DEFAULT_PRINTER_PORT: u16 = 8883;

const ENV_PRINTER_URL: &str = "BAMBUBOARD_PRINTER_URL";
const ENV_PRINTER_PORT: &str = "BAMBUBOARD_PRINTER_PORT";
const ENV_PRINTER_SN: &str = "BAMBUBOARD_PRINTER_SN";
const ENV_PRINTER_ACCESS_CODE: &str = "BAMBUBOARD_PRINTER_ACCESS_CODE";
const ENV_PRINTER_TYPE: &str = "BAMBUBOARD_PRINTER_TYPE";

/// Printer product line, which decides how often full status is re-requested.
///
/// Unknown names are kept verbatim so a round trip through the config file
/// never rewrites what the operator typed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PrinterFamily {
    #[default]
    X1,
    P1,
    P1P,
    A1,
    Other(String),
}

impl PrinterFamily {
    pub fn as_str(&self) -> &str {
        match self {
            PrinterFamily::X1 => "X1",
            PrinterFamily::P1 => "P1",
            PrinterFamily::P1P => "P1P",
            PrinterFamily::A1 => "A1",
            PrinterFamily::Other(name) => name,
        }
    }
}

impl From<String> for PrinterFamily {
    fn from(value: String) -> Self {
        match value.as_str() {
            "X1" => PrinterFamily::X1,
            "P1" => PrinterFamily::P1,
            "P1P" => PrinterFamily::P1P,
            "A1" => PrinterFamily::A1,
            _ => PrinterFamily::Other(value),
        }
    }
}

impl From<&str> for PrinterFamily {
    fn from(value: &str) -> Self {
        PrinterFamily::from(value.to_string())
    }
}

impl From<PrinterFamily> for String {
    fn from(value: PrinterFamily) -> Self {
        match value {
            PrinterFamily::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for PrinterFamily {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Connection parameters for the printer plus the dashboard's display flags.
///
/// Serialized with the field names the dashboard already uses
/// (`printerURL`, `printerSN`, ...).
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrinterConfig {
    #[serde(rename = "printerURL", default)]
    pub host: String,
    #[serde(
        rename = "printerPort",
        default = "default_port",
        deserialize_with = "port_value::deserialize"
    )]
    pub port: u16,
    #[serde(rename = "printerSN", default)]
    pub serial_number: String,
    #[serde(rename = "printerAccessCode", default)]
    pub access_code: String,
    #[serde(rename = "printerType", default)]
    pub family: PrinterFamily,
    #[serde(default)]
    pub display_fan_percentages: bool,
    #[serde(default = "default_true")]
    pub display_fan_icons: bool,
}

fn default_port() -> u16 {
    DEFAULT_PRINTER_PORT
}

fn default_true() -> bool {
    true
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PRINTER_PORT,
            serial_number: String::new(),
            access_code: String::new(),
            family: PrinterFamily::default(),
            display_fan_percentages: false,
            display_fan_icons: true,
        }
    }
}

// Access code stays out of logs.
impl fmt::Debug for PrinterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrinterConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("serial_number", &self.serial_number)
            .field(
                "access_code",
                &if self.access_code.is_empty() { "" } else { "***" },
            )
            .field("family", &self.family)
            .field("display_fan_percentages", &self.display_fan_percentages)
            .field("display_fan_icons", &self.display_fan_icons)
            .finish()
    }
}

impl PrinterConfig {
    /// Built-in defaults with the `BAMBUBOARD_*` environment variables applied.
    pub fn from_env() -> Self {
        Self::defaults_with(|key| std::env::var(key).ok())
    }

    /// Built-in defaults with overrides pulled from `lookup`.
    ///
    /// An unparseable port override is ignored with a warning.
    pub fn defaults_with<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = lookup(ENV_PRINTER_URL) {
            config.host = host;
        }
        if let Some(port) = lookup(ENV_PRINTER_PORT) {
            match port.trim().parse::<u16>() {
                Ok(port) => config.port = port,
                Err(e) => tracing::warn!("Ignoring {}={:?}: {}", ENV_PRINTER_PORT, port, e),
            }
        }
        if let Some(serial) = lookup(ENV_PRINTER_SN) {
            config.serial_number = serial;
        }
        if let Some(code) = lookup(ENV_PRINTER_ACCESS_CODE) {
            config.access_code = code;
        }
        if let Some(family) = lookup(ENV_PRINTER_TYPE) {
            config.family = PrinterFamily::from(family);
        }

        config
    }

    /// True when every identity field needed to open a device session is set.
    pub fn is_complete(&self) -> bool {
        !self.host.trim().is_empty()
            && self.port != 0
            && !self.serial_number.trim().is_empty()
            && !self.access_code.is_empty()
    }

    /// Overwrites exactly the fields present in `patch`.
    pub fn apply(&mut self, patch: PrinterConfigPatch) {
        if let Some(host) = patch.host {
            self.host = host;
        }
        if let Some(port) = patch.port {
            self.port = port;
        }
        if let Some(serial) = patch.serial_number {
            self.serial_number = serial;
        }
        if let Some(code) = patch.access_code {
            self.access_code = code;
        }
        if let Some(family) = patch.family {
            self.family = family;
        }
        if let Some(flag) = patch.display_fan_percentages {
            self.display_fan_percentages = flag;
        }
        if let Some(flag) = patch.display_fan_icons {
            self.display_fan_icons = flag;
        }
    }
}

/// Partial [`PrinterConfig`] as sent by the settings panel.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrinterConfigPatch {
    #[serde(rename = "printerURL", default)]
    pub host: Option<String>,
    #[serde(
        rename = "printerPort",
        default,
        deserialize_with = "port_value::deserialize_option"
    )]
    pub port: Option<u16>,
    #[serde(rename = "printerSN", default)]
    pub serial_number: Option<String>,
    #[serde(rename = "printerAccessCode", default)]
    pub access_code: Option<String>,
    #[serde(rename = "printerType", default)]
    pub family: Option<PrinterFamily>,
    #[serde(default)]
    pub display_fan_percentages: Option<bool>,
    #[serde(default)]
    pub display_fan_icons: Option<bool>,
}

/// Ports arrive as numbers from the UI and as strings from the environment.
/// Anything that is not a usable port is kept as 0, which leaves the config
/// incomplete instead of failing the whole save.
mod port_value {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    fn convert(raw: Raw) -> u16 {
        let port = match &raw {
            Raw::Number(n) => u16::try_from(*n).ok(),
            Raw::Text(s) if s.trim().is_empty() => Some(0),
            Raw::Text(s) => s.trim().parse::<u16>().ok(),
        };
        port.unwrap_or_else(|| {
            match raw {
                Raw::Number(n) => tracing::warn!("Port {} out of range, keeping it unset", n),
                Raw::Text(s) => tracing::warn!("Invalid port {:?}, keeping it unset", s),
            }
            0
        })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
        Ok(convert(Raw::deserialize(deserializer)?))
    }

    pub fn deserialize_option<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<u16>, D::Error> {
        Ok(Option::<Raw>::deserialize(deserializer)?.map(convert))
    }
}

/// Cloud account token as persisted in `bambu-token.json`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenInfo {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    /// Expiry as epoch milliseconds.
    #[serde(default)]
    pub token_expiration: i64,
}

impl fmt::Debug for TokenInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenInfo")
            .field("access_token", &"***")
            .field("refresh_token", &"***")
            .field("token_expiration", &self.token_expiration)
            .finish()
    }
}

impl TokenInfo {
    /// Builds a token that expires `expires_in_secs` after `issued_at`.
    pub fn issued(
        access_token: String,
        refresh_token: String,
        expires_in_secs: i64,
        issued_at: DateTime<Utc>,
    ) -> Self {
        let lifetime = Duration::try_seconds(expires_in_secs).unwrap_or_else(Duration::zero);
        let expires_at = issued_at.checked_add_signed(lifetime).unwrap_or(issued_at);
        Self {
            access_token,
            refresh_token,
            token_expiration: expires_at.timestamp_millis(),
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.access_token.is_empty() && self.token_expiration > now.timestamp_millis()
    }
}
