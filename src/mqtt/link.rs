//! Device link actor: owns the current session and applies config changes.
//!
//! Operator commands and transport events share one queue and are handled by
//! a single task in arrival order. That ordering is what keeps cache
//! overwrites race free and lets a reconnect cleanly orphan the old session:
//! once the new session id is installed, anything still queued from the old
//! one is dropped.
//!
//! # Link States
//!
//! ```text
//! Disabled ◄──(incomplete config)── connect() ──► Connecting ──► Connected ──► Subscribed
//!                                       ▲                                         │
//!                                       └──────── Terminated ◄──(failure/shutdown)┘
//! ```
//!
//! Failures never trigger a retry. The link stays `Terminated` until the
//! next explicit `connect()`/`reconnect()`.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::message::DEVICE_USERNAME;
use super::session::{Connecting, DeviceSession, Streaming, Subscribing};
use super::transport::{
    ConnectParams, DeviceTransport, LinkError, SessionEvent, SessionEvents, SessionId,
};
use crate::persistence::PrinterConfig;
use crate::telemetry::TelemetryCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum LinkState {
    /// Printer settings are incomplete; nothing is attempted.
    #[default]
    Disabled,
    Connecting,
    Connected,
    Subscribed,
    /// Session torn down after a failure or shutdown.
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkStatus {
    pub state: LinkState,
    pub session: Option<SessionId>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            keep_alive: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
pub(crate) enum LinkCommand {
    Connect {
        config: PrinterConfig,
        done: oneshot::Sender<LinkStatus>,
    },
    Status {
        reply: oneshot::Sender<LinkStatus>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Everything the link task consumes, in one ordered stream.
#[derive(Debug)]
pub(crate) enum LinkInput {
    Command(LinkCommand),
    Session {
        session: SessionId,
        event: SessionEvent,
    },
}

enum ActiveSession {
    Connecting(DeviceSession<Connecting>),
    Subscribing(DeviceSession<Subscribing>),
    Streaming(DeviceSession<Streaming>),
}

impl ActiveSession {
    fn id(&self) -> &SessionId {
        match self {
            ActiveSession::Connecting(s) => s.id(),
            ActiveSession::Subscribing(s) => s.id(),
            ActiveSession::Streaming(s) => s.id(),
        }
    }

    fn close(self) {
        match self {
            ActiveSession::Connecting(s) => s.close(),
            ActiveSession::Subscribing(s) => s.close(),
            ActiveSession::Streaming(s) => s.close(),
        }
    }
}

/// Cloneable handle to the link task.
#[derive(Clone)]
pub struct LinkHandle {
    inputs: mpsc::Sender<LinkInput>,
    status: watch::Receiver<LinkStatus>,
}

impl LinkHandle {
    /// Spawns the link task. It starts `Disabled` and does nothing until the
    /// first [`connect`](Self::connect).
    pub fn spawn(
        transport: Arc<dyn DeviceTransport>,
        cache: TelemetryCache,
        options: LinkOptions,
    ) -> Self {
        let (inputs, input_rx) = mpsc::channel(256);
        let (status_tx, status) = watch::channel(LinkStatus::default());

        let link = DeviceLink {
            transport,
            cache,
            options,
            session: None,
            status: status_tx,
            inputs: inputs.downgrade(),
        };

        info!("Spawning device link");
        tokio::spawn(link.run(input_rx));

        Self { inputs, status }
    }

    /// Tears down any current session and starts a new one from `config`.
    ///
    /// Returns once the link applied the command, with the resulting status
    /// (`Disabled` for incomplete settings, `Connecting` or `Terminated`
    /// otherwise). Connection progress is reported through
    /// [`status`](Self::status).
    pub async fn connect(&self, config: PrinterConfig) -> Result<LinkStatus, LinkError> {
        let (done, rx) = oneshot::channel();
        self.send(LinkCommand::Connect { config, done }).await?;
        rx.await.map_err(|_| LinkError::Stopped)
    }

    /// Same as [`connect`](Self::connect); always rebuilds the session even
    /// when nothing changed.
    pub async fn reconnect(&self, config: PrinterConfig) -> Result<LinkStatus, LinkError> {
        self.connect(config).await
    }

    /// Last published status, without waiting for the link.
    pub fn status(&self) -> LinkStatus {
        self.status.borrow().clone()
    }

    /// Status after every input queued before this call has been handled.
    pub async fn settled_status(&self) -> Result<LinkStatus, LinkError> {
        let (reply, rx) = oneshot::channel();
        self.send(LinkCommand::Status { reply }).await?;
        rx.await.map_err(|_| LinkError::Stopped)
    }

    /// Closes the current session and stops the link task.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.send(LinkCommand::Shutdown { done }).await.is_err() {
            debug!("Device link already stopped");
            return;
        }
        let _ = rx.await;
    }

    async fn send(&self, command: LinkCommand) -> Result<(), LinkError> {
        self.inputs
            .send(LinkInput::Command(command))
            .await
            .map_err(|_| LinkError::Stopped)
    }
}

struct DeviceLink {
    transport: Arc<dyn DeviceTransport>,
    cache: TelemetryCache,
    options: LinkOptions,
    session: Option<ActiveSession>,
    status: watch::Sender<LinkStatus>,
    // Weak so the task ends once every handle is dropped.
    inputs: mpsc::WeakSender<LinkInput>,
}

impl DeviceLink {
    async fn run(mut self, mut inputs: mpsc::Receiver<LinkInput>) {
        info!("Device link running");

        while let Some(input) = inputs.recv().await {
            match input {
                LinkInput::Command(LinkCommand::Connect { config, done }) => {
                    self.connect(config).await;
                    let _ = done.send(self.status.borrow().clone());
                }
                LinkInput::Command(LinkCommand::Status { reply }) => {
                    let _ = reply.send(self.status.borrow().clone());
                }
                LinkInput::Command(LinkCommand::Shutdown { done }) => {
                    self.teardown();
                    self.set_status(LinkState::Terminated, None);
                    info!("Device link stopped");
                    let _ = done.send(());
                    return;
                }
                LinkInput::Session { session, event } => {
                    self.on_session_event(session, event, Instant::now()).await;
                }
            }
        }

        self.teardown();
        debug!("Device link input closed");
    }

    async fn connect(&mut self, config: PrinterConfig) {
        self.teardown();

        if !config.is_complete() {
            warn!("Incomplete printer settings, device link disabled");
            self.set_status(LinkState::Disabled, None);
            return;
        }

        let id = SessionId::generate();
        let params = ConnectParams {
            session: id.clone(),
            host: config.host.clone(),
            port: config.port,
            username: DEVICE_USERNAME.to_string(),
            password: config.access_code.clone(),
            connect_timeout: self.options.connect_timeout,
            keep_alive: self.options.keep_alive,
        };
        info!(
            "Connecting to printer {} at {}:{} as {}",
            config.serial_number, config.host, config.port, id
        );

        let Some(inputs) = self.inputs.upgrade() else {
            self.set_status(LinkState::Terminated, Some(LinkError::Stopped.to_string()));
            return;
        };
        let events = SessionEvents::new(id.clone(), inputs);
        match self.transport.open(params, events).await {
            Ok(connection) => {
                let session = DeviceSession::open(
                    id.clone(),
                    config.serial_number.clone(),
                    &config.family,
                    connection,
                );
                self.session = Some(ActiveSession::Connecting(session));
                self.set_status(LinkState::Connecting, None);
            }
            Err(e) => {
                error!("Failed to open printer connection: {}", e);
                self.set_status(LinkState::Terminated, Some(e.to_string()));
            }
        }
    }

    async fn on_session_event(&mut self, session: SessionId, event: SessionEvent, now: Instant) {
        let current = match self.session.take() {
            Some(current) if *current.id() == session => current,
            other => {
                debug!("Discarding {:?} from stale session {}", event, session);
                self.session = other;
                return;
            }
        };

        let next = match (current, event) {
            (ActiveSession::Connecting(s), SessionEvent::Connected) => s
                .connected()
                .await
                .map(|s| (ActiveSession::Subscribing(s), Some(LinkState::Connected))),
            (ActiveSession::Subscribing(s), SessionEvent::Subscribed) => s
                .subscribed(now)
                .await
                .map(|s| (ActiveSession::Streaming(s), Some(LinkState::Subscribed))),
            (ActiveSession::Streaming(mut s), SessionEvent::Message { topic, payload })
                if topic.ends_with("/report") =>
            {
                match s.handle_report(&payload, now, &self.cache).await {
                    Ok(outcome) => {
                        debug!("Report on {} handled: {:?}", topic, outcome);
                        Ok((ActiveSession::Streaming(s), None))
                    }
                    Err(e) => {
                        s.close();
                        Err(e)
                    }
                }
            }
            // Transport is already gone; dropping the session releases the rest.
            (_, SessionEvent::Closed { reason }) => Err(LinkError::Closed(reason)),
            (current, event) => {
                debug!("Ignoring {:?} on session {}", event, current.id());
                Ok((current, None))
            }
        };

        match next {
            Ok((active, state)) => {
                self.session = Some(active);
                if let Some(state) = state {
                    self.set_status(state, None);
                }
            }
            Err(e) => {
                error!("Device session {} failed: {}", session, e);
                self.set_status(LinkState::Terminated, Some(e.to_string()));
            }
        }
    }

    fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            info!("Tearing down device session {}", session.id());
            session.close();
        }
    }

    fn set_status(&self, state: LinkState, last_error: Option<String>) {
        let session = match state {
            LinkState::Disabled | LinkState::Terminated => None,
            _ => self.session.as_ref().map(|s| s.id().clone()),
        };
        self.status.send_replace(LinkStatus {
            state,
            session,
            last_error,
        });
    }
}
