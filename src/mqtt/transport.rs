//! The seam between the device link and the network.
//!
//! A [`DeviceTransport`] opens one connection per session and reports what
//! happens on it through [`SessionEvents`]. Every event is stamped with the
//! session that produced it, so the link can drop anything that arrives from
//! a session it already tore down.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use super::link::LinkInput;

/// MQTT client identifier; also identifies the session inside the relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(format!("deskrelay_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything a transport needs to open one session.
#[derive(Clone)]
pub struct ConnectParams {
    pub session: SessionId,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("session", &self.session)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("connect_timeout", &self.connect_timeout)
            .field("keep_alive", &self.keep_alive)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Broker acknowledged the connection.
    Connected,
    /// Broker confirmed the report subscription.
    Subscribed,
    Message { topic: String, payload: Vec<u8> },
    /// The connection is gone and will not come back on its own.
    Closed { reason: String },
}

/// Sender half handed to a transport for a single session.
#[derive(Debug, Clone)]
pub struct SessionEvents {
    session: SessionId,
    tx: mpsc::Sender<LinkInput>,
}

impl SessionEvents {
    pub(crate) fn new(session: SessionId, tx: mpsc::Sender<LinkInput>) -> Self {
        Self { session, tx }
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Queues `event` for the link. Returns `false` once the link has stopped.
    pub async fn emit(&self, event: SessionEvent) -> bool {
        let input = LinkInput::Session {
            session: self.session.clone(),
            event,
        };
        match self.tx.send(input).await {
            Ok(()) => true,
            Err(_) => {
                debug!("Device link stopped, dropping event from {}", self.session);
                false
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Connection closed: {0}")]
    Closed(String),

    #[error("Failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Device link is not running")]
    Stopped,
}

#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Starts connecting and returns immediately; progress arrives on
    /// `events`. An error here means no connection attempt was made.
    async fn open(
        &self,
        params: ConnectParams,
        events: SessionEvents,
    ) -> Result<Box<dyn DeviceConnection>, LinkError>;
}

#[async_trait]
pub trait DeviceConnection: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<(), LinkError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), LinkError>;

    /// Drops the connection immediately, without a graceful disconnect.
    fn abort(&self);
}
