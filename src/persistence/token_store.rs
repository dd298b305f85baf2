//! Cloud account token, persisted as `bambu-token.json`.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::storage::{Storage, StorageError};
use super::TokenInfo;

#[derive(Debug)]
pub struct TokenStore {
    storage: Arc<dyn Storage>,
    current: RwLock<Option<TokenInfo>>,
}

impl TokenStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            current: RwLock::new(None),
        }
    }

    /// Reads the stored token. Anything unreadable counts as "not logged in".
    pub async fn load(&self) -> Option<TokenInfo> {
        let token = match self.storage.load().await {
            Ok(Some(bytes)) => match serde_json::from_slice::<TokenInfo>(&bytes) {
                Ok(token) if token.access_token.is_empty() => {
                    warn!("Ignoring token without access token in {}", self.storage.describe());
                    None
                }
                Ok(token) => Some(token),
                Err(e) => {
                    warn!("Ignoring unreadable token in {}: {}", self.storage.describe(), e);
                    None
                }
            },
            Ok(None) => {
                debug!("No stored cloud token");
                None
            }
            Err(e) => {
                warn!("Could not read cloud token: {}", e);
                None
            }
        };

        *self.current.write().await = token.clone();
        token
    }

    pub async fn save(&self, token: TokenInfo) -> Result<(), StorageError> {
        let mut current = self.current.write().await;
        let contents = serde_json::to_vec_pretty(&token)?;
        self.storage.store(&contents).await?;
        *current = Some(token);

        info!("Cloud token saved to {}", self.storage.describe());
        Ok(())
    }

    /// The stored token, only if it has not expired at `now`.
    pub async fn valid_token(&self, now: DateTime<Utc>) -> Option<TokenInfo> {
        self.current
            .read()
            .await
            .as_ref()
            .filter(|token| token.is_valid_at(now))
            .cloned()
    }
}
