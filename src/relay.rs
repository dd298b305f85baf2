//! The relay service: one owned instance tying stores, cache, device link
//! and cloud client together.
//!
//! Everything that touches the outside world comes in through
//! [`RelayDeps`], so the HTTP tests build the same service with in-memory
//! storage and fake transports.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::cloud::{CloudApi, CloudError, LoginOutcome, ModelSummary};
use crate::mqtt::{DeviceTransport, LinkError, LinkHandle, LinkOptions, LinkStatus};
use crate::persistence::{
    ConfigStore, PrinterConfig, PrinterConfigPatch, Storage, StorageError, TokenStore,
};
use crate::telemetry::{TelemetryCache, TelemetrySnapshot};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error("Cloud token missing or expired")]
    UpstreamAuthExpired,
}

pub struct RelayDeps {
    pub config_storage: Arc<dyn Storage>,
    pub token_storage: Arc<dyn Storage>,
    pub transport: Arc<dyn DeviceTransport>,
    pub cloud: Arc<dyn CloudApi>,
    /// What the printer config degrades to, usually [`PrinterConfig::from_env`].
    pub defaults: PrinterConfig,
    pub link_options: LinkOptions,
}

pub struct RelayService {
    config: ConfigStore,
    tokens: TokenStore,
    cache: TelemetryCache,
    link: LinkHandle,
    cloud: Arc<dyn CloudApi>,
    // Keeps save and reconnect of one update together, so the link always
    // ends up on the last saved config.
    updates: Mutex<()>,
}

impl RelayService {
    /// Builds the service and spawns the (idle) device link. Must run inside
    /// a tokio runtime.
    pub fn new(deps: RelayDeps) -> Self {
        let cache = TelemetryCache::new();
        let link = LinkHandle::spawn(deps.transport, cache.clone(), deps.link_options);

        Self {
            config: ConfigStore::new(deps.config_storage, deps.defaults),
            tokens: TokenStore::new(deps.token_storage),
            cache,
            link,
            cloud: deps.cloud,
            updates: Mutex::new(()),
        }
    }

    /// Loads persisted state and makes the first connection attempt.
    pub async fn start(&self) -> Result<LinkStatus, RelayError> {
        let config = self.config.load().await;
        if self.tokens.load().await.is_some() {
            info!("Restored cloud token");
        }

        let status = self.link.connect(config).await?;
        info!("Relay started, device link {:?}", status.state);
        Ok(status)
    }

    pub async fn printer_config(&self) -> PrinterConfig {
        self.config.current().await
    }

    /// Persists `patch` and always reconnects with the result, even when
    /// nothing changed. A failed save leaves both config and link untouched.
    pub async fn update_config(
        &self,
        patch: PrinterConfigPatch,
    ) -> Result<PrinterConfig, RelayError> {
        let _update = self.updates.lock().await;
        let config = self.config.save(patch).await?;
        let status = self.link.reconnect(config.clone()).await?;
        info!("Printer config updated, device link {:?}", status.state);
        Ok(config)
    }

    pub async fn reconnect(&self) -> Result<LinkStatus, RelayError> {
        let _update = self.updates.lock().await;
        let config = self.config.current().await;
        Ok(self.link.reconnect(config).await?)
    }

    pub fn telemetry(&self) -> Option<Arc<TelemetrySnapshot>> {
        self.cache.get()
    }

    pub fn telemetry_cache(&self) -> &TelemetryCache {
        &self.cache
    }

    pub fn link_status(&self) -> LinkStatus {
        self.link.status()
    }

    pub async fn token_status(&self) -> bool {
        self.tokens.valid_token(Utc::now()).await.is_some()
    }

    /// Logs into the cloud account; a granted token is stored before
    /// returning.
    pub async fn login(&self, account: &str, password: &str) -> Result<LoginOutcome, RelayError> {
        let outcome = self.cloud.login(account, password).await?;
        if let LoginOutcome::Authenticated(grant) = &outcome {
            self.tokens.save(grant.clone().into_token(Utc::now())).await?;
        }
        Ok(outcome)
    }

    pub async fn verify(&self, account: &str, code: &str) -> Result<(), RelayError> {
        let grant = self.cloud.verify(account, code).await?;
        self.tokens.save(grant.into_token(Utc::now())).await?;
        info!("Cloud account verified");
        Ok(())
    }

    pub async fn model_summary(&self) -> Result<ModelSummary, RelayError> {
        let token = self
            .tokens
            .valid_token(Utc::now())
            .await
            .ok_or(RelayError::UpstreamAuthExpired)?;

        self.cloud
            .latest_task(&token.access_token)
            .await
            .map_err(|e| {
                warn!("Fetching latest task failed: {}", e);
                e.into()
            })
    }

    pub async fn shutdown(&self) {
        info!("Shutting down relay");
        self.link.shutdown().await;
    }
}
