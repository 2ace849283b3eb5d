//! Durable key/value area the stores snapshot themselves into.
//!
//! Each store writes one JSON blob under its own key, wrapped in a versioned
//! envelope (`{"state": ..., "version": 0}`). A blob that does not decode or
//! carries another version is treated as absent.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs;
use uuid::Uuid;

use crate::error::Result;

/// Current envelope version; bump when a persisted shape changes.
pub const STATE_VERSION: u32 = 0;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    state: T,
    version: u32,
}

/// Write `state` under `key`.
pub async fn save<T: Serialize>(store: &dyn KeyValueStore, key: &str, state: &T) -> Result<()> {
    let blob = serde_json::to_string(&Envelope {
        state,
        version: STATE_VERSION,
    })?;
    store.set(key, blob).await
}

/// Read the state stored under `key`. Missing, stale and corrupt blobs all
/// come back as `Ok(None)`; only storage failures are errors.
pub async fn load<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>> {
    let Some(blob) = store.get(key).await? else {
        return Ok(None);
    };
    match serde_json::from_str::<Envelope<T>>(&blob) {
        Ok(envelope) if envelope.version == STATE_VERSION => Ok(Some(envelope.state)),
        Ok(envelope) => {
            tracing::warn!(
                "Discarding persisted {} (version {}, expected {})",
                key,
                envelope.version,
                STATE_VERSION
            );
            Ok(None)
        }
        Err(e) => {
            tracing::warn!("Discarding unreadable persisted {}: {}", key, e);
            Ok(None)
        }
    }
}

// ============================================================================
// Filesystem
// ============================================================================

/// One `<key>.json` file per key under a base directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    base_path: PathBuf,
}

impl FileStorage {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    fn key_file(&self, key: &str) -> PathBuf {
        self.base_path.join(format!("{key}.json"))
    }
}

#[async_trait]
impl KeyValueStore for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.key_file(key)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        fs::create_dir_all(&self.base_path).await?;
        // Write then rename so a crash never leaves a half-written blob.
        // Each write gets its own temp file; concurrent writers never share one.
        let path = self.key_file(key);
        let tmp = self
            .base_path
            .join(format!(".{key}.{}.tmp", Uuid::new_v4().simple()));
        fs::write(&tmp, value).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

// ============================================================================
// Memory
// ============================================================================

/// Process-local storage for tests and ephemeral sessions.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw blob stored under `key`, bypassing the envelope.
    pub fn raw(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        // A poisoned map still holds consistent strings.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.lock().insert(key.to_string(), value);
        Ok(())
    }
}
