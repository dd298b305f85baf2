#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use deskrelay::cloud::{CloudApi, CloudError, LoginOutcome, ModelSummary, TokenGrant};
use deskrelay::mqtt::{
    ConnectParams, DeviceConnection, DeviceTransport, LinkError, LinkOptions, SessionEvent,
    SessionEvents,
};
use deskrelay::persistence::{MemoryStorage, PrinterConfig};
use deskrelay::{server, RelayDeps, RelayService};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;

#[derive(Clone, Default)]
pub struct FakeTransport {
    pub opens: Arc<Mutex<Vec<ConnectParams>>>,
    pub events: Arc<Mutex<Vec<SessionEvents>>>,
    pub publishes: Arc<Mutex<Vec<(String, Value)>>>,
}

impl FakeTransport {
    pub fn open_count(&self) -> usize {
        self.opens.lock().unwrap().len()
    }

    pub fn last_events(&self) -> SessionEvents {
        self.events.lock().unwrap().last().cloned().unwrap()
    }
}

struct FakeConnection {
    publishes: Arc<Mutex<Vec<(String, Value)>>>,
}

#[async_trait]
impl DeviceTransport for FakeTransport {
    async fn open(
        &self,
        params: ConnectParams,
        events: SessionEvents,
    ) -> Result<Box<dyn DeviceConnection>, LinkError> {
        self.opens.lock().unwrap().push(params);
        self.events.lock().unwrap().push(events);
        Ok(Box::new(FakeConnection {
            publishes: self.publishes.clone(),
        }))
    }
}

#[async_trait]
impl DeviceConnection for FakeConnection {
    async fn subscribe(&self, _topic: &str) -> Result<(), LinkError> {
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), LinkError> {
        let body: Value = serde_json::from_slice(&payload)?;
        self.publishes.lock().unwrap().push((topic.to_string(), body));
        Ok(())
    }

    fn abort(&self) {}
}

/// Scripted cloud account.
pub struct FakeCloud {
    pub login: LoginOutcome,
    pub verify_error: Option<String>,
    pub task_error: Option<(u16, String)>,
    pub tokens_seen: Mutex<Vec<String>>,
}

impl Default for FakeCloud {
    fn default() -> Self {
        Self {
            login: LoginOutcome::Authenticated(grant()),
            verify_error: None,
            task_error: None,
            tokens_seen: Mutex::new(Vec::new()),
        }
    }
}

pub fn grant() -> TokenGrant {
    TokenGrant {
        access_token: "cloud-access".into(),
        refresh_token: "cloud-refresh".into(),
        expires_in: 3600,
    }
}

pub fn summary() -> ModelSummary {
    ModelSummary {
        image_url: "https://img.example/benchy.png".into(),
        model_title: "Benchy".into(),
        model_weight: 12.into(),
        model_cost_time: 3600.into(),
        total_prints: 7,
    }
}

#[async_trait]
impl CloudApi for FakeCloud {
    async fn login(&self, _account: &str, _password: &str) -> Result<LoginOutcome, CloudError> {
        Ok(self.login.clone())
    }

    async fn verify(&self, _account: &str, _code: &str) -> Result<TokenGrant, CloudError> {
        match &self.verify_error {
            Some(text) => Err(CloudError::VerificationFailed(text.clone())),
            None => Ok(grant()),
        }
    }

    async fn latest_task(&self, access_token: &str) -> Result<ModelSummary, CloudError> {
        self.tokens_seen
            .lock()
            .unwrap()
            .push(access_token.to_string());
        match &self.task_error {
            Some((status, body)) => Err(CloudError::Upstream {
                status: *status,
                body: body.clone(),
            }),
            None => Ok(summary()),
        }
    }
}

pub fn complete_config_json() -> Value {
    json!({
        "printerURL": "10.0.0.5",
        "printerPort": "8883",
        "printerSN": "ABC123",
        "printerAccessCode": "secret",
        "printerType": "X1"
    })
}

pub fn valid_token_json() -> Value {
    json!({
        "accessToken": "stored-access",
        "refreshToken": "stored-refresh",
        "tokenExpiration": 4_102_444_800_000i64
    })
}

pub struct Harness {
    pub relay: Arc<RelayService>,
    pub app: Router,
    pub transport: FakeTransport,
    pub cloud: Arc<FakeCloud>,
    pub config_storage: Arc<MemoryStorage>,
    pub token_storage: Arc<MemoryStorage>,
}

pub struct HarnessBuilder {
    config: Option<Value>,
    token: Option<Value>,
    cloud: FakeCloud,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            token: None,
            cloud: FakeCloud::default(),
        }
    }

    pub fn stored_config(mut self, config: Value) -> Self {
        self.config = Some(config);
        self
    }

    pub fn stored_token(mut self, token: Value) -> Self {
        self.token = Some(token);
        self
    }

    pub fn cloud(mut self, cloud: FakeCloud) -> Self {
        self.cloud = cloud;
        self
    }

    pub async fn start(self) -> Harness {
        let config_storage = Arc::new(match self.config {
            Some(config) => MemoryStorage::with_contents(config.to_string()),
            None => MemoryStorage::new(),
        });
        let token_storage = Arc::new(match self.token {
            Some(token) => MemoryStorage::with_contents(token.to_string()),
            None => MemoryStorage::new(),
        });
        let transport = FakeTransport::default();
        let cloud = Arc::new(self.cloud);

        let relay = Arc::new(RelayService::new(RelayDeps {
            config_storage: config_storage.clone(),
            token_storage: token_storage.clone(),
            transport: Arc::new(transport.clone()),
            cloud: cloud.clone(),
            defaults: PrinterConfig::default(),
            link_options: LinkOptions::default(),
        }));
        relay.start().await.unwrap();

        Harness {
            app: server::router(relay.clone()),
            relay,
            transport,
            cloud,
            config_storage,
            token_storage,
        }
    }
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Option<Value>,
}

impl Harness {
    pub async fn get(&self, uri: &str) -> Reply {
        self.send(Request::get(uri).body(Body::empty()).unwrap())
            .await
    }

    pub async fn post(&self, uri: &str, body: Value) -> Reply {
        self.post_raw(uri, &body.to_string()).await
    }

    pub async fn post_raw(&self, uri: &str, body: &str) -> Reply {
        self.send(
            Request::post(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    async fn send(&self, request: Request<Body>) -> Reply {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            None
        } else {
            Some(serde_json::from_slice(&bytes).unwrap())
        };
        Reply {
            status,
            headers,
            body,
        }
    }

    /// Drives the current session to streaming and feeds it `reports`,
    /// returning once the last one is cached.
    pub async fn stream_reports(&self, reports: &[Value]) {
        let events = self.transport.last_events();
        let mut cache = self.relay.telemetry_cache().subscribe();

        events.emit(SessionEvent::Connected).await;
        events.emit(SessionEvent::Subscribed).await;
        for report in reports {
            let _ = cache.borrow_and_update();
            events
                .emit(SessionEvent::Message {
                    topic: "device/ABC123/report".into(),
                    payload: report.to_string().into_bytes(),
                })
                .await;
            tokio::time::timeout(Duration::from_secs(5), cache.changed())
                .await
                .expect("report was not cached")
                .unwrap();
        }
    }
}

pub fn report(state: &str) -> Value {
    json!({ "print": { "gcode_state": state, "mc_percent": 50 } })
}
