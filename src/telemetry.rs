//! Latest printer status, shared between the device link and the HTTP layer.
//!
//! The cache holds exactly one value. Every accepted report replaces it
//! wholesale; nothing is merged and nothing is ever cleared, so after a
//! reconnect the previous status stays visible until the new session delivers
//! its first report.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;

/// Decoded `print` object of a device report.
pub type StatusPayload = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySnapshot {
    pub status: StatusPayload,
    pub received_at: DateTime<Utc>,
}

/// Cheap to clone; all clones share one slot.
#[derive(Debug, Clone)]
pub struct TelemetryCache {
    slot: Arc<watch::Sender<Option<Arc<TelemetrySnapshot>>>>,
}

impl Default for TelemetryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryCache {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            slot: Arc::new(slot),
        }
    }

    /// Latest snapshot, or `None` until the first report arrives.
    pub fn get(&self) -> Option<Arc<TelemetrySnapshot>> {
        self.slot.borrow().clone()
    }

    pub fn replace(&self, status: StatusPayload) {
        self.slot.send_replace(Some(Arc::new(TelemetrySnapshot {
            status,
            received_at: Utc::now(),
        })));
    }

    /// Change notifications for long-polling consumers.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<TelemetrySnapshot>>> {
        self.slot.subscribe()
    }
}
