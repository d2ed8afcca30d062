use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod filesystem;

pub use filesystem::FilesystemStorage;

/// Longest key accepted by [`validate_key`]
pub const MAX_KEY_LEN: usize = 128;

/// Error type for storage operations
#[derive(Debug)]
pub enum StorageError {
    Io(std::io::Error),
    InvalidKey(String),
    NotFound(String),
    Config(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "IO error: {}", e),
            StorageError::InvalidKey(key) => write!(f, "Invalid payload key: '{}'", key),
            StorageError::NotFound(key) => write!(f, "No payload stored under '{}'", key),
            StorageError::Config(e) => write!(f, "Configuration error: {}", e),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err)
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Where received payloads are persisted, keyed by instance identifier.
///
/// Keys are validated with [`validate_key`] so a key can never name a path
/// outside the store.
#[async_trait]
pub trait PayloadStore: Send + Sync + std::fmt::Debug {
    /// Root under which payloads are kept
    fn base_path(&self) -> &Path;

    /// Path a payload with this key lives at
    fn locate(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.base_path().join(key))
    }

    /// Check if a payload is stored under `key`
    fn contains(&self, key: &str) -> bool {
        self.locate(key).map(|path| path.is_file()).unwrap_or(false)
    }

    /// Persist `payload` under `key`, replacing any earlier payload
    async fn store(&self, key: &str, payload: Bytes) -> StorageResult<PathBuf>;

    /// Read back the payload stored under `key`
    async fn load(&self, key: &str) -> StorageResult<Vec<u8>> {
        let path = self.locate(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(StorageError::from(e)),
        }
    }

    /// Remove the payload stored under `key`
    async fn remove(&self, key: &str) -> StorageResult<()> {
        let path = self.locate(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(StorageError::from(e)),
        }
    }
}

/// Accept keys made of ASCII letters, digits, '.', '-' and '_' only
pub fn validate_key(key: &str) -> StorageResult<()> {
    let valid = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key != "."
        && key != ".."
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

/// Configuration for storage backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub options: std::collections::HashMap<String, serde_json::Value>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let mut options = std::collections::HashMap::new();
        options.insert(
            "path".to_string(),
            serde_json::Value::String("./data".to_string()),
        );

        Self {
            backend: default_backend(),
            options,
        }
    }
}

fn default_backend() -> String {
    "filesystem".to_string()
}

/// Create a payload store from configuration
pub fn create_payload_store(config: &StorageConfig) -> StorageResult<Arc<dyn PayloadStore>> {
    match config.backend.as_str() {
        "filesystem" => {
            let path = config
                .options
                .get("path")
                .and_then(|v| v.as_str())
                .unwrap_or("./data");

            let storage = FilesystemStorage::new(path)?;
            Ok(Arc::new(storage))
        }
        _ => Err(StorageError::Config(format!(
            "Unknown storage backend: {}",
            config.backend
        ))),
    }
}
