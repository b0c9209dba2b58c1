//! Key-value persistence for the registry's address set.
//!
//! The registry only needs two operations, `get` and `set`, over JSON
//! values. [`JsonFileStore`] keeps every key in one JSON object on disk;
//! [`MemoryStore`] is the in-process variant used by tests and embedders
//! that do not persist.

use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dashmap::DashMap;
use protocol::{Address, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

/// Asynchronous key-value store.
pub trait KeyValueStore: Send + Sync + 'static {
    /// Read the value stored under `key`.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Value>>> + Send;

    /// Replace the value stored under `key`.
    fn set(&self, key: &str, value: Value) -> impl Future<Output = Result<()>> + Send;
}

/// Store kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: DashMap<String, Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.values.get(key).map(|value| value.clone()))
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }
}

/// Store backed by a single JSON object file.
///
/// Writes go to a temporary file that is then renamed over the original,
/// so a crash never leaves a half-written store behind.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    /// Creates a store persisting to the given path. Nothing is read yet.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    /// Returns the path to the store file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Map<String, Value>> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            tracing::debug!("Store file not found at {:?}, starting empty", self.path);
            return Ok(Map::new());
        }

        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read store: {}", self.path.display()))?;

        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse store: {}", self.path.display()))
    }

    async fn write_all(&self, values: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create store directory: {}", parent.display())
            })?;
        }

        let contents = serde_json::to_string_pretty(values).context("Failed to serialize store")?;

        let temp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, &contents)
            .await
            .with_context(|| format!("Failed to write temp store: {}", temp_path.display()))?;

        tokio::fs::rename(&temp_path, &self.path)
            .await
            .with_context(|| {
                format!(
                    "Failed to rename temp store {} to {}",
                    temp_path.display(),
                    self.path.display()
                )
            })?;

        tracing::debug!("Saved {} keys to {:?}", values.len(), self.path);
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.remove(key))
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut values = self.read_all().await?;
        values.insert(key.to_string(), value);
        self.write_all(&values).await
    }
}

/// One session-bound registry entry as it is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedAddress {
    pub logical_name: String,
    pub session_id: SessionId,
}

impl PersistedAddress {
    pub fn new(logical_name: impl Into<String>, session_id: SessionId) -> Self {
        Self {
            logical_name: logical_name.into(),
            session_id,
        }
    }

    /// The base-frame address this entry stands for.
    pub fn address(&self) -> Address {
        Address::new(self.logical_name.clone(), Some(self.session_id))
    }
}

/// Read the persisted address set. A missing key is an empty set.
pub async fn load_address_set<S: KeyValueStore>(
    store: &S,
    key: &str,
) -> Result<Vec<PersistedAddress>> {
    match store.get(key).await? {
        Some(value) => serde_json::from_value(value)
            .with_context(|| format!("Stored address set under '{key}' is malformed")),
        None => Ok(Vec::new()),
    }
}

/// Replace the persisted address set.
pub async fn save_address_set<S: KeyValueStore>(
    store: &S,
    key: &str,
    addresses: &[PersistedAddress],
) -> Result<()> {
    let value = serde_json::to_value(addresses).context("Failed to serialize address set")?;
    store.set(key, value).await
}
