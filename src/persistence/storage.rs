//! Byte-level storage behind the config and token stores.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to {op} {target}: {source}")]
    Io {
        op: &'static str,
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to serialize document: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// A single whole-document slot.
///
/// `store` replaces the previous contents as one unit; readers never observe
/// a half-written document.
#[async_trait]
pub trait Storage: Send + Sync + fmt::Debug {
    /// Returns `None` when nothing has been stored yet.
    async fn load(&self) -> Result<Option<Vec<u8>>, StorageError>;

    async fn store(&self, contents: &[u8]) -> Result<(), StorageError>;

    /// Human readable location, used in log lines.
    fn describe(&self) -> String;
}

/// File-backed slot, written through a sibling temp file and a rename.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_error(&self, op: &'static str, source: io::Error) -> StorageError {
        StorageError::Io {
            op,
            target: self.path.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn load(&self) -> Result<Option<Vec<u8>>, StorageError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_error("read", e)),
        }
    }

    async fn store(&self, contents: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| self.io_error("create directory for", e))?;
            }
        }

        let temp = self.temp_path();
        tokio::fs::write(&temp, contents)
            .await
            .map_err(|e| self.io_error("write", e))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| self.io_error("replace", e))?;

        debug!("Stored {} bytes in {}", contents.len(), self.path.display());
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory slot for tests and ephemeral runs. Writes can be made to fail.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    contents: Mutex<Option<Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contents(contents: impl Into<Vec<u8>>) -> Self {
        Self {
            contents: Mutex::new(Some(contents.into())),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Current contents, if any.
    pub fn snapshot(&self) -> Option<Vec<u8>> {
        self.contents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn load(&self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.snapshot())
    }

    async fn store(&self, contents: &[u8]) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory storage is read-only".into()));
        }
        *self
            .contents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(contents.to_vec());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("deskrelay-storage-{}", uuid::Uuid::new_v4().simple()))
            .join("doc.json")
    }

    #[tokio::test]
    async fn file_storage_replaces_whole_document() {
        let path = scratch_path();
        let storage = FileStorage::new(&path);

        assert!(storage.load().await.unwrap().is_none());

        storage.store(b"{\"a\":1}").await.unwrap();
        storage.store(b"{}").await.unwrap();

        assert_eq!(storage.load().await.unwrap().as_deref(), Some(&b"{}"[..]));
        assert!(!storage.temp_path().exists());

        let _ = tokio::fs::remove_dir_all(path.parent().unwrap()).await;
    }

    #[tokio::test]
    async fn memory_storage_can_refuse_writes() {
        let storage = MemoryStorage::with_contents("old");
        storage.set_fail_writes(true);

        let err = storage.store(b"new").await.unwrap_err();
        assert!(matches!(err, StorageError::Unavailable(_)));
        assert_eq!(storage.snapshot().as_deref(), Some(&b"old"[..]));
    }
}
