//! Printer connection settings, persisted as `bambu-config.json`.

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::storage::{Storage, StorageError};
use super::{PrinterConfig, PrinterConfigPatch};

/// Holds the current [`PrinterConfig`] and writes every change through to
/// storage.
#[derive(Debug)]
pub struct ConfigStore {
    storage: Arc<dyn Storage>,
    defaults: PrinterConfig,
    current: RwLock<PrinterConfig>,
}

impl ConfigStore {
    /// `defaults` is what an absent or unreadable file degrades to, usually
    /// [`PrinterConfig::from_env`].
    pub fn new(storage: Arc<dyn Storage>, defaults: PrinterConfig) -> Self {
        Self {
            storage,
            current: RwLock::new(defaults.clone()),
            defaults,
        }
    }

    /// Reads the stored document and overlays it onto the defaults.
    ///
    /// Fields missing from the file keep their default. A missing, unreadable
    /// or unparseable file is replaced by the defaults; failing to write them
    /// is only logged.
    pub async fn load(&self) -> PrinterConfig {
        let loaded = match self.storage.load().await {
            Ok(Some(bytes)) => match serde_json::from_slice::<PrinterConfigPatch>(&bytes) {
                Ok(stored) => {
                    let mut config = self.defaults.clone();
                    config.apply(stored);
                    Some(config)
                }
                Err(e) => {
                    warn!(
                        "Printer config in {} is not valid, using defaults: {}",
                        self.storage.describe(),
                        e
                    );
                    None
                }
            },
            Ok(None) => {
                info!(
                    "No printer config in {}, writing defaults",
                    self.storage.describe()
                );
                None
            }
            Err(e) => {
                warn!("Could not read printer config, using defaults: {}", e);
                None
            }
        };

        let config = match loaded {
            Some(config) => config,
            None => {
                let defaults = self.defaults.clone();
                if let Err(e) = self.persist(&defaults).await {
                    warn!("Could not write default printer config: {}", e);
                }
                defaults
            }
        };

        debug!("Loaded printer config: {:?}", config);
        *self.current.write().await = config.clone();
        config
    }

    /// Merges `patch` into the current config and persists the result.
    ///
    /// The in-memory value only changes once the write succeeded. Concurrent
    /// saves are serialized by the write lock.
    pub async fn save(&self, patch: PrinterConfigPatch) -> Result<PrinterConfig, StorageError> {
        let mut current = self.current.write().await;
        let mut merged = current.clone();
        merged.apply(patch);

        self.persist(&merged).await?;
        *current = merged.clone();

        info!("Printer config saved to {}", self.storage.describe());
        Ok(merged)
    }

    pub async fn current(&self) -> PrinterConfig {
        self.current.read().await.clone()
    }

    async fn persist(&self, config: &PrinterConfig) -> Result<(), StorageError> {
        let contents = serde_json::to_vec_pretty(config)?;
        self.storage.store(&contents).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{MemoryStorage, PrinterFamily};
    use pretty_assertions::assert_eq;

    fn env_defaults() -> PrinterConfig {
        PrinterConfig {
            host: "10.0.0.5".into(),
            serial_number: "ENV-SN".into(),
            ..PrinterConfig::default()
        }
    }

    fn stored(storage: &MemoryStorage) -> serde_json::Value {
        serde_json::from_slice(&storage.snapshot().expect("document written")).unwrap()
    }

    #[tokio::test]
    async fn missing_file_writes_and_returns_defaults() {
        let storage = Arc::new(MemoryStorage::new());
        let store = ConfigStore::new(storage.clone(), env_defaults());

        let config = store.load().await;

        assert_eq!(config, env_defaults());
        assert_eq!(stored(&storage)["printerURL"], "10.0.0.5");
        assert_eq!(stored(&storage)["printerSN"], "ENV-SN");
    }

    #[tokio::test]
    async fn stored_fields_override_defaults_one_by_one() {
        let storage = Arc::new(MemoryStorage::with_contents(
            r#"{"printerSN":"FILE-SN","printerAccessCode":"code","printerType":"P1P"}"#,
        ));
        let store = ConfigStore::new(storage, env_defaults());

        let config = store.load().await;

        assert_eq!(config.host, "10.0.0.5");
        assert_eq!(config.serial_number, "FILE-SN");
        assert_eq!(config.access_code, "code");
        assert_eq!(config.family, PrinterFamily::P1P);
        assert_eq!(store.current().await, config);
    }

    #[tokio::test]
    async fn corrupt_file_is_replaced_by_defaults() {
        let storage = Arc::new(MemoryStorage::with_contents("{not json"));
        let store = ConfigStore::new(storage.clone(), env_defaults());

        assert_eq!(store.load().await, env_defaults());
        assert_eq!(stored(&storage)["printerSN"], "ENV-SN");
    }

    #[tokio::test]
    async fn unwritable_storage_still_loads_defaults() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set_fail_writes(true);
        let store = ConfigStore::new(storage, env_defaults());

        assert_eq!(store.load().await, env_defaults());
    }

    #[tokio::test]
    async fn save_merges_and_persists_whole_document() {
        let storage = Arc::new(MemoryStorage::new());
        let store = ConfigStore::new(storage.clone(), env_defaults());
        store.load().await;

        let patch = PrinterConfigPatch {
            access_code: Some("12345678".into()),
            family: Some(PrinterFamily::A1),
            ..PrinterConfigPatch::default()
        };
        let saved = store.save(patch).await.unwrap();

        assert_eq!(saved.host, "10.0.0.5");
        assert_eq!(saved.access_code, "12345678");
        assert_eq!(stored(&storage)["printerType"], "A1");
        assert_eq!(stored(&storage)["printerAccessCode"], "12345678");
        assert_eq!(stored(&storage)["displayFanIcons"], true);
    }

    #[tokio::test]
    async fn failed_save_propagates_and_keeps_previous_config() {
        let storage = Arc::new(MemoryStorage::new());
        let store = ConfigStore::new(storage.clone(), env_defaults());
        store.load().await;
        storage.set_fail_writes(true);

        let patch = PrinterConfigPatch {
            host: Some("10.0.0.9".into()),
            ..PrinterConfigPatch::default()
        };
        let err = store.save(patch).await.unwrap_err();

        assert!(matches!(err, StorageError::Unavailable(_)));
        assert_eq!(store.current().await.host, "10.0.0.5");
    }
}
