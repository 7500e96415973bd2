//! # Tiered Cache
//!
//! Two-level cache in front of the gateway API.
//!
//! ## Read Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           get(key)                                      │
//! │                                                                         │
//! │  ┌──────────────────────┐   hit (fresh)                                 │
//! │  │ Fast tier (HashMap)  │ ─────────────► touch, return clone            │
//! │  │ bounded, in memory   │                                               │
//! │  └──────────┬───────────┘   hit (expired) ► delete both tiers, absent   │
//! │             │ miss                                                      │
//! │             ▼                                                           │
//! │  ┌──────────────────────┐   hit (fresh)                                 │
//! │  │ Slow tier            │ ─────────────► promote unless Low, return     │
//! │  │ dyn PersistentStore  │   hit (expired) ► delete, absent              │
//! │  │ <namespace><key>     │   corrupt ► delete, absent                    │
//! │  └──────────┬───────────┘                                               │
//! │             │ miss                                                      │
//! │             ▼                                                           │
//! │          absent                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Write Path
//! Every `set` lands in the fast tier. It also lands in the slow tier when
//! `persist` is set or the priority is High/Critical; otherwise any older
//! slow-tier copy of the key is removed. Either tier evicts by
//! `(priority asc, written_at asc)` once over capacity.
//!
//! ## Fetch Coalescing
//! `with_cache` and `with_stale_while_revalidate` share one in-flight fetch
//! per key. The shared future removes itself from the in-flight map when it
//! completes, successful or not.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use gatewatch_core::cache::{select_evictions, CacheEntry, Priority};
use gatewatch_core::clock::{Clock, SystemClock};

use crate::error::{StoreError, StoreResult};
use crate::persistent::PersistentStore;

// =============================================================================
// Configuration
// =============================================================================

/// Tiered cache sizing and namespace.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum entries in the fast tier.
    /// Default: 500
    pub fast_capacity: usize,

    /// Maximum entries in the slow tier.
    /// Default: 2000
    pub slow_capacity: usize,

    /// Prefix of every slow-tier key.
    /// Default: `gatewatch:cache:`
    pub namespace: String,

    /// How long past expiry an entry may still be served by
    /// `with_stale_while_revalidate`. Plain reads never see expired entries.
    /// Default: 0
    pub stale_grace: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            fast_capacity: 500,
            slow_capacity: 2000,
            namespace: "gatewatch:cache:".to_string(),
            stale_grace: Duration::ZERO,
        }
    }
}

/// Per-write options.
///
/// ## Example
/// ```rust,ignore
/// let options = CacheOptions::new(Duration::from_secs(30))
///     .priority(Priority::High)
///     .tags(["sessions"]);
/// cache.set("sessions:list", &sessions, options).await?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    /// Time to live. Zero means no expiry.
    pub ttl: Duration,
    /// Eviction and persistence priority.
    pub priority: Priority,
    /// Labels for bulk invalidation.
    pub tags: BTreeSet<String>,
    /// Write through to the slow tier regardless of priority.
    pub persist: bool,
}

impl CacheOptions {
    /// Options with the given TTL and defaults otherwise.
    pub fn new(ttl: Duration) -> Self {
        CacheOptions {
            ttl,
            ..Default::default()
        }
    }

    /// Sets the priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Adds tags.
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Forces a slow-tier write.
    pub fn persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }
}

/// Counters reported by [`TieredCache::stats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Entries currently in the fast tier.
    pub fast_entries: usize,
    /// Slow-tier entries known to this instance.
    pub slow_entries: usize,
    /// Reads served by the fast tier.
    pub fast_hits: u64,
    /// Reads served by the slow tier.
    pub slow_hits: u64,
    /// Expired values served by stale-while-revalidate.
    pub stale_hits: u64,
    /// Reads that found nothing.
    pub misses: u64,
    /// Entries dropped for capacity.
    pub evictions: u64,
    /// Fetcher invocations.
    pub fetches: u64,
    /// Callers that joined an in-flight fetch.
    pub coalesced: u64,
}

#[derive(Debug, Default)]
struct Counters {
    fast_hits: AtomicU64,
    slow_hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    fetches: AtomicU64,
    coalesced: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

type SharedFetch = Shared<BoxFuture<'static, Result<Value, StoreError>>>;

/// Outcome of a tier lookup.
struct Found {
    entry: CacheEntry<Value>,
    stale: bool,
}

// =============================================================================
// Tiered Cache
// =============================================================================

struct Inner {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    fast: RwLock<HashMap<String, CacheEntry<Value>>>,
    slow: Arc<dyn PersistentStore>,
    /// Metadata of slow-tier entries, used for capacity eviction.
    slow_index: RwLock<HashMap<String, CacheEntry<()>>>,
    in_flight: Mutex<HashMap<String, SharedFetch>>,
    counters: Counters,
}

/// Fast in-memory tier over a persistent slow tier.
///
/// Cheap to clone; clones share the same tiers.
#[derive(Clone)]
pub struct TieredCache {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl TieredCache {
    /// Creates a cache on the system clock.
    pub fn new(config: CacheConfig, slow: Arc<dyn PersistentStore>) -> Self {
        TieredCache::with_clock(config, slow, Arc::new(SystemClock))
    }

    /// Creates a cache on an explicit clock.
    pub fn with_clock(
        config: CacheConfig,
        slow: Arc<dyn PersistentStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        TieredCache {
            inner: Arc::new(Inner {
                config,
                clock,
                fast: RwLock::new(HashMap::new()),
                slow,
                slow_index: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                counters: Counters::default(),
            }),
        }
    }

    /// Returns the cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    fn slow_key(&self, key: &str) -> String {
        format!("{}{}", self.inner.config.namespace, key)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Stores a serializable value.
    ///
    /// Only fails if `value` cannot be serialized. Slow-tier failures are
    /// logged and the fast tier still holds the value.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: CacheOptions,
    ) -> StoreResult<()> {
        let value = serde_json::to_value(value)?;
        self.set_value(key, value, options).await;
        Ok(())
    }

    /// Stores a JSON value.
    pub async fn set_value(&self, key: &str, value: Value, options: CacheOptions) {
        let now = self.inner.clock.now();
        let persist = options.persist || options.priority.persists();
        let entry = CacheEntry::new(value, now, options.ttl, options.priority, options.tags);

        if persist {
            self.persist_entry(key, &entry).await;
        } else {
            // The slow tier never holds an older value than the fast tier.
            self.remove_slow(key).await;
        }
        self.insert_fast(key.to_string(), entry).await;
    }

    async fn insert_fast(&self, key: String, entry: CacheEntry<Value>) {
        let mut fast = self.inner.fast.write().await;
        fast.insert(key, entry);

        let capacity = self.inner.config.fast_capacity;
        if fast.len() > capacity {
            let victims = select_evictions(fast.iter(), capacity);
            for victim in &victims {
                fast.remove(victim);
                Counters::bump(&self.inner.counters.evictions);
            }
            debug!(evicted = victims.len(), tier = "fast", "Evicted cache entries");
        }
    }

    async fn persist_entry(&self, key: &str, entry: &CacheEntry<Value>) {
        let text = match serde_json::to_string(entry) {
            Ok(text) => text,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to serialize cache entry");
                return;
            }
        };

        if let Err(e) = self.inner.slow.set(&self.slow_key(key), &text).await {
            warn!(key = %key, error = %e, "Slow tier write failed");
            return;
        }

        let victims = {
            let mut index = self.inner.slow_index.write().await;
            index.insert(key.to_string(), metadata(entry));
            let victims = select_evictions(index.iter(), self.inner.config.slow_capacity);
            for victim in &victims {
                index.remove(victim);
            }
            victims
        };

        for victim in victims {
            Counters::bump(&self.inner.counters.evictions);
            if let Err(e) = self.inner.slow.remove(&self.slow_key(&victim)).await {
                warn!(key = %victim, error = %e, "Slow tier eviction failed");
            }
        }
    }

    async fn remove_slow(&self, key: &str) {
        self.inner.slow_index.write().await.remove(key);
        if let Err(e) = self.inner.slow.remove(&self.slow_key(key)).await {
            warn!(key = %key, error = %e, "Slow tier delete failed");
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Reads and deserializes a value. Absent, expired, or of another shape
    /// all read as `None`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get_value(key).await?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                debug!(key = %key, error = %e, "Cached value has unexpected shape");
                None
            }
        }
    }

    /// Reads a JSON value.
    pub async fn get_value(&self, key: &str) -> Option<Value> {
        self.lookup(key, None).await.map(|found| found.entry.value)
    }

    /// Looks a key up in both tiers.
    ///
    /// With `grace`, entries expired for less than `grace` are returned with
    /// `stale = true`. Entries expired beyond the grace are deleted from both
    /// tiers.
    async fn lookup(&self, key: &str, grace: Option<Duration>) -> Option<Found> {
        let now = self.inner.clock.now();
        let purge_grace = self.inner.config.stale_grace;
        let counters = &self.inner.counters;

        {
            let mut fast = self.inner.fast.write().await;
            if let Some(entry) = fast.get_mut(key) {
                if !entry.is_expired(now) {
                    entry.touch(now);
                    Counters::bump(&counters.fast_hits);
                    return Some(Found {
                        entry: entry.clone(),
                        stale: false,
                    });
                }
                if !entry.is_expired_beyond(now, purge_grace) {
                    if let Some(g) = grace {
                        if !entry.is_expired_beyond(now, g) {
                            Counters::bump(&counters.stale_hits);
                            return Some(Found {
                                entry: entry.clone(),
                                stale: true,
                            });
                        }
                    }
                    Counters::bump(&counters.misses);
                    return None;
                }
                fast.remove(key);
                drop(fast);
                debug!(key = %key, "Expired entry removed");
                self.remove_slow(key).await;
                Counters::bump(&counters.misses);
                return None;
            }
        }

        let text = match self.inner.slow.get(&self.slow_key(key)).await {
            Ok(Some(text)) => text,
            Ok(None) => {
                Counters::bump(&counters.misses);
                return None;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Slow tier read failed");
                Counters::bump(&counters.misses);
                return None;
            }
        };

        let mut entry: CacheEntry<Value> = match serde_json::from_str(&text) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding corrupt cache entry");
                self.remove_slow(key).await;
                Counters::bump(&counters.misses);
                return None;
            }
        };

        if entry.is_expired(now) {
            if entry.is_expired_beyond(now, purge_grace) {
                self.remove_slow(key).await;
            } else if let Some(g) = grace {
                if !entry.is_expired_beyond(now, g) {
                    Counters::bump(&counters.stale_hits);
                    return Some(Found { entry, stale: true });
                }
            }
            Counters::bump(&counters.misses);
            return None;
        }

        Counters::bump(&counters.slow_hits);
        self.inner
            .slow_index
            .write()
            .await
            .insert(key.to_string(), metadata(&entry));

        if entry.priority.promotes() {
            entry.touch(now);
            self.insert_fast(key.to_string(), entry.clone()).await;
        }

        Some(Found {
            entry,
            stale: false,
        })
    }

    // =========================================================================
    // Deletes
    // =========================================================================

    /// Removes a key from both tiers.
    pub async fn delete(&self, key: &str) {
        self.inner.fast.write().await.remove(key);
        self.remove_slow(key).await;
    }

    /// Removes every entry carrying any of `tags`. Returns the number of
    /// distinct keys removed.
    pub async fn delete_by_tags<S: AsRef<str>>(&self, tags: &[S]) -> usize {
        self.delete_where(|_, entry| entry.has_any_tag(tags)).await
    }

    /// Removes every entry whose key starts with `prefix`.
    pub async fn delete_by_prefix(&self, prefix: &str) -> usize {
        self.delete_where(|key, _| key.starts_with(prefix)).await
    }

    /// Removes every entry tagged `scope` or keyed under `scope`.
    pub async fn invalidate(&self, scope: &str) -> usize {
        let removed = self.delete_where(|key, entry| entry.in_scope(key, scope)).await;
        debug!(scope = %scope, removed, "Invalidated cache scope");
        removed
    }

    /// Empties both tiers.
    pub async fn clear(&self) {
        self.inner.fast.write().await.clear();
        self.inner.slow_index.write().await.clear();

        match self.inner.slow.keys_with_prefix(&self.inner.config.namespace).await {
            Ok(keys) => {
                for key in keys {
                    if let Err(e) = self.inner.slow.remove(&key).await {
                        warn!(key = %key, error = %e, "Slow tier delete failed");
                    }
                }
            }
            Err(e) => warn!(error = %e, "Slow tier scan failed"),
        }
    }

    async fn delete_where<F>(&self, mut matches: F) -> usize
    where
        F: FnMut(&str, &CacheEntry<Value>) -> bool,
    {
        let mut removed: HashSet<String> = HashSet::new();

        {
            let mut fast = self.inner.fast.write().await;
            fast.retain(|key, entry| {
                if matches(key, entry) {
                    removed.insert(key.clone());
                    false
                } else {
                    true
                }
            });
        }

        for (key, entry) in self.scan_slow().await {
            if matches(&key, &entry) {
                self.remove_slow(&key).await;
                removed.insert(key);
            }
        }

        removed.len()
    }

    /// Loads every slow-tier entry. Corrupt entries are deleted on the way.
    async fn scan_slow(&self) -> Vec<(String, CacheEntry<Value>)> {
        let namespace = &self.inner.config.namespace;
        let keys = match self.inner.slow.keys_with_prefix(namespace).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Slow tier scan failed");
                return Vec::new();
            }
        };

        let mut entries = Vec::with_capacity(keys.len());
        for slow_key in keys {
            let Some(key) = slow_key.strip_prefix(namespace.as_str()) else {
                continue;
            };
            match self.inner.slow.get(&slow_key).await {
                Ok(Some(text)) => match serde_json::from_str::<CacheEntry<Value>>(&text) {
                    Ok(entry) => entries.push((key.to_string(), entry)),
                    Err(e) => {
                        warn!(key = %key, error = %e, "Discarding corrupt cache entry");
                        self.remove_slow(key).await;
                    }
                },
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "Slow tier read failed"),
            }
        }
        entries
    }

    // =========================================================================
    // In-place Updates
    // =========================================================================

    /// Applies `patch` to every live entry in `scope` (tag or key prefix) in
    /// both tiers. `patch` returns true when it changed the value; changed
    /// slow-tier entries are written back. Returns the number of distinct
    /// keys changed.
    pub async fn update_matching<F>(&self, scope: &str, mut patch: F) -> usize
    where
        F: FnMut(&str, &mut Value) -> bool,
    {
        let now = self.inner.clock.now();
        let mut changed: HashSet<String> = HashSet::new();

        {
            let mut fast = self.inner.fast.write().await;
            for (key, entry) in fast.iter_mut() {
                if entry.in_scope(key, scope) && !entry.is_expired(now) && patch(key, &mut entry.value)
                {
                    changed.insert(key.clone());
                }
            }
        }

        for (key, mut entry) in self.scan_slow().await {
            if entry.in_scope(&key, scope) && !entry.is_expired(now) && patch(&key, &mut entry.value) {
                self.write_back(&key, &entry).await;
                changed.insert(key);
            }
        }

        changed.len()
    }

    async fn write_back(&self, key: &str, entry: &CacheEntry<Value>) {
        match serde_json::to_string(entry) {
            Ok(text) => {
                if let Err(e) = self.inner.slow.set(&self.slow_key(key), &text).await {
                    warn!(key = %key, error = %e, "Slow tier write failed");
                }
            }
            Err(e) => warn!(key = %key, error = %e, "Failed to serialize cache entry"),
        }
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Removes expired entries from both tiers and rebuilds the slow-tier
    /// index, evicting down to capacity. Run once at startup and
    /// periodically. Returns the number of entries removed.
    pub async fn sweep(&self) -> usize {
        let now = self.inner.clock.now();
        let grace = self.inner.config.stale_grace;
        let mut removed = 0usize;

        {
            let mut fast = self.inner.fast.write().await;
            let before = fast.len();
            fast.retain(|_, entry| !entry.is_expired_beyond(now, grace));
            removed += before - fast.len();
        }

        let mut index: HashMap<String, CacheEntry<()>> = HashMap::new();
        for (key, entry) in self.scan_slow().await {
            if entry.is_expired_beyond(now, grace) {
                self.remove_slow(&key).await;
                removed += 1;
            } else {
                index.insert(key, metadata(&entry));
            }
        }

        let victims = select_evictions(index.iter(), self.inner.config.slow_capacity);
        for victim in &victims {
            index.remove(victim);
            Counters::bump(&self.inner.counters.evictions);
            if let Err(e) = self.inner.slow.remove(&self.slow_key(victim)).await {
                warn!(key = %victim, error = %e, "Slow tier eviction failed");
            }
        }
        *self.inner.slow_index.write().await = index;

        debug!(removed, evicted = victims.len(), "Cache sweep complete");
        removed
    }

    /// Returns current counters.
    pub async fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            fast_entries: self.inner.fast.read().await.len(),
            slow_entries: self.inner.slow_index.read().await.len(),
            fast_hits: c.fast_hits.load(Ordering::Relaxed),
            slow_hits: c.slow_hits.load(Ordering::Relaxed),
            stale_hits: c.stale_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            fetches: c.fetches.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
        }
    }

    // =========================================================================
    // Read-through
    // =========================================================================

    /// Returns the cached value, or runs `fetcher` once, caches and returns
    /// its result.
    ///
    /// Concurrent callers for the same key share one fetch. A fetcher error
    /// propagates as [`StoreError::FetchFailed`] and nothing is cached.
    pub async fn with_cache<T, F, Fut, E>(
        &self,
        key: &str,
        options: CacheOptions,
        fetcher: F,
    ) -> StoreResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        if let Some(value) = self.get::<T>(key).await {
            return Ok(value);
        }

        let value = self.fetch_shared(key, options, fetcher).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Returns any cached value immediately (including one expired within
    /// `stale_grace`) and refreshes it in the background. With nothing
    /// cached, blocks on `fetcher` like [`with_cache`](Self::with_cache).
    ///
    /// A background refresh failure is logged and the cached value stays.
    pub async fn with_stale_while_revalidate<T, F, Fut, E>(
        &self,
        key: &str,
        options: CacheOptions,
        fetcher: F,
    ) -> StoreResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let cached = self
            .lookup(key, Some(self.inner.config.stale_grace))
            .await
            .and_then(|found| {
                serde_json::from_value::<T>(found.entry.value)
                    .ok()
                    .map(|v| (v, found.stale))
            });

        if let Some((value, stale)) = cached {
            let cache = self.clone();
            let key = key.to_string();
            debug!(key = %key, stale, "Serving cached value, revalidating");
            tokio::spawn(async move {
                if let Err(e) = cache.fetch_shared(&key, options, fetcher).await {
                    warn!(key = %key, error = %e, "Background revalidation failed");
                }
            });
            return Ok(value);
        }

        let value = self.fetch_shared(key, options, fetcher).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Joins the in-flight fetch for `key`, starting one if none exists.
    async fn fetch_shared<T, F, Fut, E>(
        &self,
        key: &str,
        options: CacheOptions,
        fetcher: F,
    ) -> StoreResult<Value>
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let shared = {
            let mut in_flight = self.inner.in_flight.lock().await;
            if let Some(existing) = in_flight.get(key) {
                Counters::bump(&self.inner.counters.coalesced);
                existing.clone()
            } else {
                let cache = self.clone();
                let owned_key = key.to_string();
                let fetch = async move {
                    Counters::bump(&cache.inner.counters.fetches);
                    let result = match fetcher().await {
                        Ok(value) => serde_json::to_value(value).map_err(StoreError::from),
                        Err(e) => Err(StoreError::fetch(&owned_key, e)),
                    };
                    if let Ok(value) = &result {
                        cache.set_value(&owned_key, value.clone(), options).await;
                    }
                    cache.inner.in_flight.lock().await.remove(&owned_key);
                    result
                }
                .boxed()
                .shared();
                in_flight.insert(key.to_string(), fetch.clone());
                fetch
            }
        };

        shared.await
    }
}

/// Strips the value, keeping what eviction needs.
fn metadata(entry: &CacheEntry<Value>) -> CacheEntry<()> {
    CacheEntry {
        value: (),
        written_at: entry.written_at,
        expires_at: entry.expires_at,
        priority: entry.priority,
        tags: entry.tags.clone(),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistent::MemoryStore;
    use gatewatch_core::clock::ManualClock;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn cache_with(config: CacheConfig) -> (TieredCache, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let cache = TieredCache::with_clock(config, store.clone(), clock.clone());
        (cache, store, clock)
    }

    fn cache() -> (TieredCache, Arc<MemoryStore>, Arc<ManualClock>) {
        cache_with(CacheConfig::default())
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let (cache, _, clock) = cache();
        cache
            .set("k", &1, CacheOptions::new(Duration::from_millis(100)))
            .await
            .unwrap();

        clock.advance(Duration::from_millis(99));
        assert_eq!(cache.get::<i32>("k").await, Some(1));

        clock.advance(Duration::from_millis(51));
        assert_eq!(cache.get::<i32>("k").await, None);
        assert_eq!(cache.stats().await.fast_entries, 0);
    }

    #[tokio::test]
    async fn test_zero_ttl_never_expires() {
        let (cache, _, clock) = cache();
        cache.set("k", "v", CacheOptions::default()).await.unwrap();

        clock.advance(Duration::from_secs(365 * 24 * 3600));
        assert_eq!(cache.get::<String>("k").await.as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_high_priority_writes_through() {
        let (cache, store, _) = cache();
        cache
            .set("a", &1, CacheOptions::new(Duration::from_secs(60)))
            .await
            .unwrap();
        cache
            .set(
                "b",
                &2,
                CacheOptions::new(Duration::from_secs(60)).priority(Priority::High),
            )
            .await
            .unwrap();
        cache
            .set("c", &3, CacheOptions::new(Duration::from_secs(60)).persist(true))
            .await
            .unwrap();

        assert!(store.get("gatewatch:cache:a").await.unwrap().is_none());
        assert!(store.get("gatewatch:cache:b").await.unwrap().is_some());
        assert!(store.get("gatewatch:cache:c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_overwrite_without_persist_drops_slow_copy() {
        let (cache, store, clock) = cache_with(CacheConfig {
            fast_capacity: 1,
            ..Default::default()
        });
        cache
            .set("k", &1, CacheOptions::default().persist(true))
            .await
            .unwrap();
        clock.advance(Duration::from_millis(10));
        cache.set("k", &2, CacheOptions::default()).await.unwrap();
        assert!(store.get("gatewatch:cache:k").await.unwrap().is_none());

        // Push "k" out of the fast tier.
        clock.advance(Duration::from_millis(10));
        cache
            .set("other", &0, CacheOptions::default().priority(Priority::High))
            .await
            .unwrap();

        assert_eq!(cache.get::<i32>("k").await, None);
        assert_eq!(cache.get::<i32>("other").await, Some(0));
    }

    #[tokio::test]
    async fn test_persisted_layout() {
        let (cache, store, _) = cache();
        cache
            .set(
                "sessions:list",
                &json!([1, 2]),
                CacheOptions::new(Duration::from_secs(30))
                    .priority(Priority::Critical)
                    .tags(["sessions"]),
            )
            .await
            .unwrap();

        let text = store.get("gatewatch:cache:sessions:list").await.unwrap().unwrap();
        let raw: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(raw["value"], json!([1, 2]));
        assert_eq!(raw["priority"], "critical");
        assert_eq!(raw["tags"], json!(["sessions"]));
        assert!(raw["writtenAt"].is_string());
        assert!(raw["expiresAt"].is_string());
    }

    #[tokio::test]
    async fn test_slow_hit_promotes_unless_low() {
        let (first, store, clock) = cache();
        first
            .set("n", &1, CacheOptions::default().persist(true))
            .await
            .unwrap();
        first
            .set(
                "l",
                &2,
                CacheOptions::default().persist(true).priority(Priority::Low),
            )
            .await
            .unwrap();

        // Fresh instance over the same slow tier, empty fast tier.
        let second = TieredCache::with_clock(CacheConfig::default(), store, clock);
        assert_eq!(second.get::<i32>("n").await, Some(1));
        assert_eq!(second.get::<i32>("l").await, Some(2));

        let stats = second.stats().await;
        assert_eq!(stats.fast_entries, 1);
        assert_eq!(stats.slow_hits, 2);

        assert_eq!(second.get::<i32>("n").await, Some(1));
        assert_eq!(second.stats().await.fast_hits, 1);
    }

    #[tokio::test]
    async fn test_expired_slow_entry_deleted_from_both_tiers() {
        let (cache, store, clock) = cache();
        cache
            .set(
                "k",
                &1,
                CacheOptions::new(Duration::from_secs(1)).priority(Priority::High),
            )
            .await
            .unwrap();

        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.get::<i32>("k").await, None);
        assert!(store.get("gatewatch:cache:k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_slow_entry_is_a_miss() {
        let (cache, store, _) = cache();
        store.set("gatewatch:cache:bad", "{not json").await.unwrap();

        assert_eq!(cache.get_value("bad").await, None);
        assert!(store.get("gatewatch:cache:bad").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eviction_prefers_low_priority() {
        let (cache, _, clock) = cache_with(CacheConfig {
            fast_capacity: 3,
            ..Default::default()
        });

        // The low entry is the newest, yet it goes first.
        for key in ["c1", "c2", "c3"] {
            cache
                .set(key, &key, CacheOptions::default().priority(Priority::Critical))
                .await
                .unwrap();
            clock.advance(Duration::from_millis(10));
        }
        cache
            .set("low", &0, CacheOptions::default().priority(Priority::Low))
            .await
            .unwrap();

        assert_eq!(cache.get::<i32>("low").await, None);
        for key in ["c1", "c2", "c3"] {
            assert!(cache.get::<String>(key).await.is_some());
        }
        assert_eq!(cache.stats().await.evictions, 1);
    }

    #[tokio::test]
    async fn test_slow_tier_capacity() {
        let (cache, store, clock) = cache_with(CacheConfig {
            slow_capacity: 2,
            ..Default::default()
        });

        for key in ["a", "b", "c"] {
            cache
                .set(key, &1, CacheOptions::default().priority(Priority::High))
                .await
                .unwrap();
            clock.advance(Duration::from_millis(10));
        }

        let keys = store.keys_with_prefix("gatewatch:cache:").await.unwrap();
        assert_eq!(
            keys,
            vec!["gatewatch:cache:b".to_string(), "gatewatch:cache:c".to_string()]
        );
    }

    #[tokio::test]
    async fn test_tag_purge() {
        let (cache, _, _) = cache();
        cache
            .set("a", &1, CacheOptions::default().tags(["sessions"]).persist(true))
            .await
            .unwrap();
        cache
            .set("b", &2, CacheOptions::default().tags(["cron"]))
            .await
            .unwrap();

        assert_eq!(cache.delete_by_tags(&["sessions"]).await, 1);
        assert_eq!(cache.get::<i32>("a").await, None);
        assert_eq!(cache.get::<i32>("b").await, Some(2));
    }

    #[tokio::test]
    async fn test_invalidate_by_tag_or_prefix() {
        let (cache, _, _) = cache();
        cache
            .set("sessions:list", &1, CacheOptions::default())
            .await
            .unwrap();
        cache
            .set("dash", &2, CacheOptions::default().tags(["sessions"]).persist(true))
            .await
            .unwrap();
        cache.set("agents", &3, CacheOptions::default()).await.unwrap();

        assert_eq!(cache.invalidate("sessions").await, 2);
        assert_eq!(cache.get::<i32>("agents").await, Some(3));
    }

    #[tokio::test]
    async fn test_update_matching_patches_both_tiers() {
        let (cache, store, _) = cache();
        cache
            .set(
                "sessions:s-1",
                &json!({"key": "s-1", "messageCount": 1}),
                CacheOptions::default().priority(Priority::High),
            )
            .await
            .unwrap();

        let changed = cache
            .update_matching("sessions", |_, value| {
                value["messageCount"] = json!(7);
                true
            })
            .await;
        assert_eq!(changed, 1);

        let value: Value = cache.get("sessions:s-1").await.unwrap();
        assert_eq!(value["messageCount"], 7);

        let text = store.get("gatewatch:cache:sessions:s-1").await.unwrap().unwrap();
        assert!(text.contains("\"messageCount\":7"));
    }

    #[tokio::test]
    async fn test_clear_and_sweep() {
        let (cache, store, clock) = cache();
        cache
            .set("old", &1, CacheOptions::new(Duration::from_secs(1)).persist(true))
            .await
            .unwrap();
        cache
            .set("keep", &2, CacheOptions::default().persist(true))
            .await
            .unwrap();
        store.set("gatewatch:sync-queue", "[]").await.unwrap();

        clock.advance(Duration::from_secs(5));
        // One fast copy and one slow copy of "old".
        assert_eq!(cache.sweep().await, 2);
        assert_eq!(cache.stats().await.slow_entries, 1);

        cache.clear().await;
        assert_eq!(cache.get::<i32>("keep").await, None);
        assert!(store.get("gatewatch:sync-queue").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_single_flight() {
        let (cache, _, _) = cache();
        let calls = Arc::new(AtomicUsize::new(0));

        let fetch = |calls: Arc<AtomicUsize>| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, String>(json!({"agents": 3}))
            }
        };

        let (a, b) = tokio::join!(
            cache.with_cache::<Value, _, _, _>("agents", CacheOptions::default(), fetch(calls.clone())),
            cache.with_cache::<Value, _, _, _>("agents", CacheOptions::default(), fetch(calls.clone())),
        );

        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().await.coalesced, 1);

        // Cached now, no further fetch.
        let c: Value = cache
            .with_cache("agents", CacheOptions::default(), fetch(calls.clone()))
            .await
            .unwrap();
        assert_eq!(c["agents"], 3);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cold_fetch_failure_propagates() {
        let (cache, _, _) = cache();
        let result: StoreResult<Value> = cache
            .with_cache("k", CacheOptions::default(), || async {
                Err::<Value, _>("gateway down")
            })
            .await;

        assert!(matches!(result, Err(StoreError::FetchFailed { .. })));
        assert_eq!(cache.get_value("k").await, None);
        assert!(cache.inner.in_flight.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_swr_serves_stale_and_refreshes() {
        let (cache, _, clock) = cache_with(CacheConfig {
            stale_grace: Duration::from_secs(60),
            ..Default::default()
        });
        cache
            .set("k", &1, CacheOptions::new(Duration::from_secs(1)))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(2));

        // Plain reads never see it.
        assert_eq!(cache.get::<i32>("k").await, None);

        let served: i32 = cache
            .with_stale_while_revalidate("k", CacheOptions::new(Duration::from_secs(30)), || async {
                Ok::<_, String>(2)
            })
            .await
            .unwrap();
        assert_eq!(served, 1);

        for _ in 0..50 {
            if cache.get::<i32>("k").await == Some(2) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("background refresh never landed");
    }

    #[tokio::test]
    async fn test_swr_refresh_failure_keeps_value() {
        let (cache, _, _) = cache();
        cache.set("k", &1, CacheOptions::default()).await.unwrap();

        let served: i32 = cache
            .with_stale_while_revalidate("k", CacheOptions::default(), || async {
                Err::<i32, _>("boom")
            })
            .await
            .unwrap();
        assert_eq!(served, 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get::<i32>("k").await, Some(1));
    }

    #[tokio::test]
    async fn test_swr_cold_blocks_on_fetcher() {
        let (cache, _, _) = cache();
        let value: i32 = cache
            .with_stale_while_revalidate("k", CacheOptions::default(), || async {
                Ok::<_, String>(9)
            })
            .await
            .unwrap();
        assert_eq!(value, 9);
        assert_eq!(cache.get::<i32>("k").await, Some(9));
    }
}
