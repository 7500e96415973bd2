//! # Persistent Store
//!
//! The string key/value seam under the slow cache tier and the sync queue.
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐
//! │ TieredCache  │     │  SyncQueue   │
//! └──────┬───────┘     └──────┬───────┘
//!        │   get / set / remove / keys_with_prefix
//!        ▼                    ▼
//! ┌─────────────────────────────────────┐
//! │      dyn PersistentStore            │
//! │  ├── SqliteStore  (production)      │
//! │  └── MemoryStore  (tests, fallback) │
//! └─────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreResult;

/// Durable string key/value storage.
///
/// Keys are already namespaced by the caller.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Returns the stored value, if any.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Inserts or replaces a value.
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Removes a value. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> StoreResult<()>;

    /// Lists every key starting with `prefix`, in key order.
    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;
}

/// In-process [`PersistentStore`].
///
/// Survives nothing; used by tests and when no database is configured.
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// Stored entries.
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Returns the number of stored keys.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns true if nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .entries
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
