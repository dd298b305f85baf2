//! # Device Link Module
//!
//! Keeps one live MQTT session to the printer and turns its report stream
//! into the cached status served over HTTP.
//!
//! ## Why This Module Exists
//!
//! The printer only talks MQTT over TLS with a self-signed certificate, and
//! several models only publish deltas unless asked for a full status push.
//! This module owns that conversation: connecting, subscribing to reports,
//! requesting full status at the right rate, and dropping everything from a
//! session once it has been replaced.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── link.rs             - Actor owning the current session, driven by one ordered queue
//! ├── session.rs          - Typestate session: Connecting → Subscribing → Streaming
//! ├── throttle.rs         - Per-family policy for full status refreshes
//! ├── message.rs          - Topics, pushall request, report decoding
//! ├── transport.rs        - Transport seam and session-tagged events
//! └── rumqtt_transport.rs - rumqttc + rustls implementation of the seam
//! ```
//!
//! ## Integration
//!
//! The relay service spawns a [`LinkHandle`] with the real transport and a
//! shared [`TelemetryCache`](crate::telemetry::TelemetryCache), then calls
//! `connect` at startup and `reconnect` after every config change. Tests swap
//! the transport for an in-memory fake.

pub mod link;
pub mod message;
pub mod rumqtt_transport;
pub mod session;
pub mod throttle;
pub mod transport;

pub use link::{LinkHandle, LinkOptions, LinkState, LinkStatus};
pub use rumqtt_transport::RumqttTransport;
pub use transport::{
    ConnectParams, DeviceConnection, DeviceTransport, LinkError, SessionEvent, SessionEvents,
    SessionId,
};
