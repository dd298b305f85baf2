//! Printer topic names and payload shapes.

use serde::Serialize;
use serde_json::Value;

use crate::telemetry::StatusPayload;

/// First value of a session's request sequence; the first request uses the
/// next number.
pub const REQUEST_SEQUENCE_BASE: u64 = 20_000;

/// Username the printers expect in LAN mode; the access code is the password.
pub const DEVICE_USERNAME: &str = "bblp";

/// Field inside `print` that marks a report as a status update.
const STATUS_MARKER: &str = "gcode_state";

pub fn report_topic(serial: &str) -> String {
    format!("device/{}/report", serial)
}

pub fn request_topic(serial: &str) -> String {
    format!("device/{}/request", serial)
}

/// Asks the printer to publish its complete state instead of a delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushAllRequest {
    pushing: Pushing,
    user_id: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct Pushing {
    sequence_id: u64,
    command: &'static str,
}

impl PushAllRequest {
    pub fn new(sequence_id: u64) -> Self {
        Self {
            pushing: Pushing {
                sequence_id,
                command: "pushall",
            },
            user_id: "0",
        }
    }

    pub fn sequence_id(&self) -> u64 {
        self.pushing.sequence_id
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Report is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A decoded report message.
#[derive(Debug, Clone, PartialEq)]
pub enum Report {
    /// Carries a `print` object with a `gcode_state` field.
    Status(StatusPayload),
    /// Valid JSON without a status update (info, system and ams replies).
    Other,
}

pub fn decode_report(payload: &[u8]) -> Result<Report, DecodeError> {
    let value: Value = serde_json::from_slice(payload)?;

    match value {
        Value::Object(mut root) => match root.remove("print") {
            Some(Value::Object(print)) if print.contains_key(STATUS_MARKER) => {
                Ok(Report::Status(print))
            }
            _ => Ok(Report::Other),
        },
        _ => Ok(Report::Other),
    }
}
