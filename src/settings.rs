use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cloud::DEFAULT_API_BASE;
use crate::mqtt::LinkOptions;

const CONFIG_DIR: &str = ".config/deskrelay";
const SETTINGS_FILE: &str = "relay.toml";
const CONFIG_FILE: &str = "bambu-config.json";
const TOKEN_FILE: &str = "bambu-token.json";

const ENV_SETTINGS: &str = "DESKRELAY_SETTINGS";
const ENV_DATA_DIR: &str = "DESKRELAY_DATA_DIR";
const ENV_PORT: &str = "PORT";

/// Process-level settings of the relay itself, read once at startup.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RelaySettings {
    pub listen_addr: String,
    pub data_dir: PathBuf,
    pub connect_timeout_secs: u64,
    pub keep_alive_secs: u64,
    pub cloud_api_base: String,
    pub log_level: String,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:3001".to_string(),
            data_dir: config_dir(),
            connect_timeout_secs: 5,
            keep_alive_secs: 30,
            cloud_api_base: DEFAULT_API_BASE.to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl RelaySettings {
    /// Reads the settings file (if any) and applies environment overrides.
    pub async fn load() -> Result<Self> {
        let path = std::env::var(ENV_SETTINGS)
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join(SETTINGS_FILE));

        let mut settings = Self::from_file(&path).await?;
        settings.apply_env(|key| std::env::var(key).ok());
        debug!("Relay settings: {:?}", settings);
        Ok(settings)
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check settings file {}: {}", path.display(), e))?
        {
            info!("No settings file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read settings file {}: {}", path.display(), e))?;

        toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse settings file {}: {}", path.display(), e))
    }

    /// `PORT` replaces the port of `listen_addr`; `DESKRELAY_DATA_DIR` replaces
    /// `data_dir`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup(ENV_PORT) {
            match port.trim().parse::<u16>() {
                Ok(port) => {
                    let host = self
                        .listen_addr
                        .rsplit_once(':')
                        .map(|(host, _)| host.to_string())
                        .unwrap_or_else(|| self.listen_addr.clone());
                    self.listen_addr = format!("{}:{}", host, port);
                }
                Err(e) => warn!("Ignoring {}={:?}: {}", ENV_PORT, port, e),
            }
        }

        if let Some(dir) = lookup(ENV_DATA_DIR).filter(|dir| !dir.trim().is_empty()) {
            self.data_dir = PathBuf::from(dir);
        }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.listen_addr
            .parse()
            .map_err(|e| eyre!("Invalid listen address {:?}: {}", self.listen_addr, e))
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE)
    }

    pub fn token_path(&self) -> PathBuf {
        self.data_dir.join(TOKEN_FILE)
    }

    pub fn link_options(&self) -> LinkOptions {
        LinkOptions {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
            keep_alive: Duration::from_secs(self.keep_alive_secs.max(1)),
        }
    }
}

fn config_dir() -> PathBuf {
    let mut path = dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    });
    path.push(CONFIG_DIR);
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let settings: RelaySettings = toml::from_str(
            r#"
            listen_addr = "0.0.0.0:8080"
            connect_timeout_secs = 10
            "#,
        )
        .unwrap();

        assert_eq!(settings.listen_addr, "0.0.0.0:8080");
        assert_eq!(settings.connect_timeout_secs, 10);
        assert_eq!(settings.keep_alive_secs, 30);
        assert_eq!(settings.cloud_api_base, DEFAULT_API_BASE);
    }

    #[test]
    fn port_env_replaces_listen_port() {
        let mut settings = RelaySettings::default();
        settings.apply_env(env(&[("PORT", "4000"), ("DESKRELAY_DATA_DIR", "/var/lib/relay")]));

        assert_eq!(settings.listen_addr, "127.0.0.1:4000");
        assert_eq!(settings.data_dir, PathBuf::from("/var/lib/relay"));
        assert_eq!(
            settings.config_path(),
            PathBuf::from("/var/lib/relay/bambu-config.json")
        );
        assert_eq!(
            settings.token_path(),
            PathBuf::from("/var/lib/relay/bambu-token.json")
        );
    }

    #[test]
    fn bad_port_env_is_ignored() {
        let mut settings = RelaySettings::default();
        settings.apply_env(env(&[("PORT", "http")]));

        assert_eq!(settings.listen_addr, "127.0.0.1:3001");
        assert!(settings.socket_addr().is_ok());
    }

    #[test]
    fn link_options_never_drop_below_one_second() {
        let settings = RelaySettings {
            connect_timeout_secs: 0,
            keep_alive_secs: 0,
            ..RelaySettings::default()
        };
        let options = settings.link_options();

        assert_eq!(options.connect_timeout, Duration::from_secs(1));
        assert_eq!(options.keep_alive, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let path = std::env::temp_dir().join(format!(
            "deskrelay-settings-{}.toml",
            uuid::Uuid::new_v4().simple()
        ));
        let settings = RelaySettings::from_file(&path).await.unwrap();

        assert_eq!(settings, RelaySettings::default());
    }
}
