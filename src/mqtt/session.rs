//! One device session with statum typestates.
//!
//! # State Machine
//!
//! ```text
//! Connecting ──(ConnAck)──► Subscribing ──(SubAck)──► Streaming
//!     │                         │                        │
//!     └─────────────────────────┴────── close() ─────────┘
//! ```
//!
//! Each transition consumes the session, so a report can only be handled
//! once the initial full refresh went out.

use statum::{machine, state};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::message::{
    decode_report, report_topic, request_topic, PushAllRequest, Report, REQUEST_SEQUENCE_BASE,
};
use super::throttle::{RefreshPolicy, RefreshThrottle};
use super::transport::{DeviceConnection, LinkError, SessionId};
use crate::persistence::PrinterFamily;
use crate::telemetry::TelemetryCache;

#[state]
#[derive(Debug, Clone)]
pub enum SessionPhase {
    Connecting,  // Waiting for the broker to accept us
    Subscribing, // Report subscription requested
    Streaming,   // Initial pushall sent, handling reports
}

#[machine]
pub struct DeviceSession<S: SessionPhase> {
    id: SessionId,
    serial: String,
    connection: Box<dyn DeviceConnection>,
    sequence: u64,
    throttle: RefreshThrottle,
}

/// What handling one report did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportOutcome {
    pub cached: bool,
    pub refreshed: bool,
}

impl<S: SessionPhase> DeviceSession<S> {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Tears the connection down without waiting for the broker.
    pub fn close(self) {
        debug!("Closing device session {}", self.id);
        self.connection.abort();
    }

    async fn send_pushall(&mut self, now: Instant) -> Result<(), LinkError> {
        self.sequence += 1;
        let request = PushAllRequest::new(self.sequence);
        let payload = request.to_payload()?;

        self.connection
            .publish(&request_topic(&self.serial), payload)
            .await?;
        self.throttle.record(now);

        debug!(
            "Requested full status on {} (sequence {})",
            self.id,
            request.sequence_id()
        );
        Ok(())
    }
}

impl DeviceSession<Connecting> {
    pub fn open(
        id: SessionId,
        serial: String,
        family: &PrinterFamily,
        connection: Box<dyn DeviceConnection>,
    ) -> Self {
        let throttle = RefreshThrottle::new(RefreshPolicy::for_family(family));
        debug!(
            "Opening device session {} for {} ({:?})",
            id,
            serial,
            throttle.policy()
        );

        Self::new(
            id,
            serial,
            connection,
            REQUEST_SEQUENCE_BASE, // sequence
            throttle,
        )
    }

    /// Subscribes to the report topic once the broker accepted the session.
    pub async fn connected(mut self) -> Result<DeviceSession<Subscribing>, LinkError> {
        info!("Device session {} connected", self.id);
        self.sequence += 1;

        self.connection
            .subscribe(&report_topic(&self.serial))
            .await?;
        Ok(self.transition())
    }
}

impl DeviceSession<Subscribing> {
    /// Sends the initial full refresh with the current sequence number.
    pub async fn subscribed(mut self, now: Instant) -> Result<DeviceSession<Streaming>, LinkError> {
        let request = PushAllRequest::new(self.sequence);
        let payload = request.to_payload()?;

        self.connection
            .publish(&request_topic(&self.serial), payload)
            .await?;
        self.throttle.record(now);

        info!(
            "Device session {} subscribed, initial full status requested (sequence {})",
            self.id, self.sequence
        );
        Ok(self.transition())
    }
}

impl DeviceSession<Streaming> {
    /// Caches a status report and sends a refresh if the throttle allows.
    ///
    /// Undecodable reports are logged and skipped without touching the cache
    /// or the throttle. Only a failed refresh publish is an error.
    pub async fn handle_report(
        &mut self,
        payload: &[u8],
        now: Instant,
        cache: &TelemetryCache,
    ) -> Result<ReportOutcome, LinkError> {
        let mut outcome = ReportOutcome::default();

        match decode_report(payload) {
            Ok(Report::Status(status)) => {
                cache.replace(status);
                outcome.cached = true;
            }
            Ok(Report::Other) => debug!("Report on {} carries no status", self.id),
            Err(e) => {
                warn!("Skipping report on {}: {}", self.id, e);
                return Ok(outcome);
            }
        }

        if self.throttle.is_due(now) {
            self.send_pushall(now).await?;
            outcome.refreshed = true;
        }

        Ok(outcome)
    }
}
