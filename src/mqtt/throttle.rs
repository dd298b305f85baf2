//! When to re-request full status after a report.
//!
//! Flagship printers push partial deltas and get a full refresh after every
//! report. Budget printers are rate limited to one refresh per
//! [`BUDGET_REFRESH_INTERVAL`]. Unrecognized families are never refreshed
//! automatically.

use std::time::Duration;
use tokio::time::Instant;

use crate::persistence::PrinterFamily;

pub const BUDGET_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPolicy {
    EveryMessage,
    AtMostEvery(Duration),
    Never,
}

impl RefreshPolicy {
    pub fn for_family(family: &PrinterFamily) -> Self {
        match family {
            PrinterFamily::X1 => RefreshPolicy::EveryMessage,
            PrinterFamily::P1 | PrinterFamily::P1P | PrinterFamily::A1 => {
                RefreshPolicy::AtMostEvery(BUDGET_REFRESH_INTERVAL)
            }
            PrinterFamily::Other(_) => RefreshPolicy::Never,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefreshThrottle {
    policy: RefreshPolicy,
    last_request: Option<Instant>,
}

impl RefreshThrottle {
    pub fn new(policy: RefreshPolicy) -> Self {
        Self {
            policy,
            last_request: None,
        }
    }

    pub fn policy(&self) -> RefreshPolicy {
        self.policy
    }

    pub fn last_request(&self) -> Option<Instant> {
        self.last_request
    }

    /// Whether a refresh may be sent at `now`. The window boundary itself is
    /// allowed.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.policy {
            RefreshPolicy::EveryMessage => true,
            RefreshPolicy::AtMostEvery(interval) => match self.last_request {
                Some(last) => now.saturating_duration_since(last) >= interval,
                None => true,
            },
            RefreshPolicy::Never => false,
        }
    }

    /// Stamps a request sent at `now`, whatever triggered it.
    pub fn record(&mut self, now: Instant) {
        self.last_request = Some(now);
    }
}
