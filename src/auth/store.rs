//! Credential persistence
//!
//! [`SecureStorage`] is the scoped key-value boundary (OS keychain, file
//! directory, memory). [`TokenStore`] keeps the single [`TokenRecord`] under
//! one well-known key on top of it.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::tokens::TokenRecord;

/// Storage key holding the serialized token record
pub const TOKEN_STORAGE_KEY: &str = "auth_tokens";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("token record serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid token record: {0}")]
    InvalidRecord(String),
}

/// Scoped asynchronous key-value storage
#[async_trait]
pub trait SecureStorage: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;
    /// Deleting a missing key is not an error.
    async fn delete_item(&self, key: &str) -> Result<(), StorageError>;
}

/// One file per key under a private directory
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

#[async_trait]
impl SecureStorage for FileStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key);
        tokio::fs::write(&path, value).await?;

        // Contains tokens
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&path, perms).await?;
        }

        Ok(())
    }

    async fn delete_item(&self, key: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local storage, lost on exit
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    items: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SecureStorage for MemoryStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.items().get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.items().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_item(&self, key: &str) -> Result<(), StorageError> {
        self.items().remove(key);
        Ok(())
    }
}

/// Durable home of the session's [`TokenRecord`]
#[derive(Clone)]
pub struct TokenStore {
    storage: Arc<dyn SecureStorage>,
}

impl TokenStore {
    pub fn new(storage: Arc<dyn SecureStorage>) -> Self {
        Self { storage }
    }

    /// Load the stored record. Any failure reads as "no record".
    pub async fn load(&self) -> Option<TokenRecord> {
        let raw = match self.storage.get_item(TOKEN_STORAGE_KEY).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!("Failed to read stored tokens: {}", e);
                return None;
            }
        };

        let record = match serde_json::from_str::<TokenRecord>(&raw) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Failed to parse stored tokens: {}", e);
                return None;
            }
        };

        match record.validate() {
            Ok(()) => Some(record),
            Err(e) => {
                tracing::warn!("Ignoring stored tokens: {}", e);
                None
            }
        }
    }

    pub async fn save(&self, record: &TokenRecord) -> Result<(), StorageError> {
        record.validate()?;
        let json = serde_json::to_string(record)?;
        self.storage.set_item(TOKEN_STORAGE_KEY, &json).await
    }

    pub async fn clear(&self) -> Result<(), StorageError> {
        self.storage.delete_item(TOKEN_STORAGE_KEY).await
    }
}
