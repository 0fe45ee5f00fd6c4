//! In-process cache tier backed by DashMap.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use parking_lot::RwLock;
use tiercache_core::{
    CacheHandle, CacheItem, CacheKey, CacheResult, CasOutcome, EvictionListener, EvictionNotice,
    EvictionReason, ExpirationMode, HandleCapabilities, Version, Versioned,
};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::debug;

/// Settings for a [`MemoryCacheHandle`].
#[derive(Debug, Clone)]
pub struct MemoryHandleOptions {
    pub name: String,
    /// Policy applied to items that inherit tier defaults.
    pub expiration_mode: ExpirationMode,
    pub expiration_timeout: Duration,
    pub capabilities: HandleCapabilities,
    /// Upper bound on held items; the least recently accessed item goes first.
    pub max_entries: Option<usize>,
}

impl Default for MemoryHandleOptions {
    fn default() -> Self {
        Self {
            name: "memory".to_string(),
            expiration_mode: ExpirationMode::None,
            expiration_timeout: Duration::ZERO,
            capabilities: HandleCapabilities::local(),
            max_entries: None,
        }
    }
}

impl MemoryHandleOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_expiration(mut self, mode: ExpirationMode, timeout: Duration) -> Self {
        self.expiration_mode = mode;
        self.expiration_timeout = timeout;
        self
    }

    pub fn with_capabilities(mut self, capabilities: HandleCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = Some(max);
        self
    }

    /// Marks the tier as shared, for setups where several caches hold the same instance.
    pub fn distributed(mut self) -> Self {
        self.capabilities.is_distributed = true;
        self
    }
}

struct Entry<V> {
    item: CacheItem<V>,
    version: Version,
}

/// Local in-memory cache tier.
///
/// Each entry carries a version bumped on every write, which gives the tier a
/// native compare-and-swap. Expired entries are dropped lazily on access and
/// by [`cleanup_expired`](Self::cleanup_expired).
pub struct MemoryCacheHandle<V> {
    options: MemoryHandleOptions,
    entries: DashMap<CacheKey, Entry<V>>,
    versions: AtomicU64,
    listener: RwLock<Option<EvictionListener>>,
}

impl<V> MemoryCacheHandle<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(options: MemoryHandleOptions) -> Self {
        Self {
            options,
            entries: DashMap::new(),
            versions: AtomicU64::new(0),
            listener: RwLock::new(None),
        }
    }

    /// A tier with default options under the given name.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(MemoryHandleOptions::new(name))
    }

    pub fn options(&self) -> &MemoryHandleOptions {
        &self.options
    }

    fn next_version(&self) -> Version {
        Version::new(self.versions.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn prepare(&self, item: CacheItem<V>) -> CacheItem<V> {
        item.with_default_expiration(self.options.expiration_mode, self.options.expiration_timeout)
    }

    fn notify(&self, key: CacheKey, reason: EvictionReason) {
        debug!(tier = %self.options.name, key = %key, reason = %reason, "item evicted by tier");
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener(EvictionNotice { key, reason });
        }
    }

    /// Drops an entry if it is (still) expired, then reports it.
    fn expire(&self, key: &CacheKey) {
        let now = OffsetDateTime::now_utc();
        if self
            .entries
            .remove_if(key, |_, entry| entry.item.is_expired_at(now))
            .is_some()
        {
            self.notify(key.clone(), EvictionReason::Expired);
        }
    }

    /// Reads a live entry and refreshes its access time.
    fn read(&self, key: &CacheKey) -> Option<(CacheItem<V>, Version)> {
        let now = OffsetDateTime::now_utc();
        let expired = match self.entries.get_mut(key) {
            None => return None,
            Some(mut entry) => {
                if entry.item.is_expired_at(now) {
                    true
                } else {
                    entry.item = entry.item.touched();
                    return Some((entry.item.clone(), entry.version));
                }
            }
        };
        if expired {
            self.expire(key);
        }
        None
    }

    fn enforce_capacity(&self) {
        let Some(max) = self.options.max_entries else {
            return;
        };
        while self.entries.len() > max {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.item.last_accessed_utc())
                .map(|e| e.key().clone());
            let Some(key) = oldest else {
                return;
            };
            if self.entries.remove(&key).is_some() {
                self.notify(key, EvictionReason::Capacity);
            }
        }
    }

    /// Removes every expired entry. Returns how many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let now = OffsetDateTime::now_utc();
        let expired: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|e| e.item.is_expired_at(now))
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for key in expired {
            if self
                .entries
                .remove_if(&key, |_, entry| entry.item.is_expired_at(now))
                .is_some()
            {
                removed += 1;
                self.notify(key, EvictionReason::Expired);
            }
        }
        removed
    }

    /// Spawns a task sweeping expired entries every `interval`.
    ///
    /// The task stops once the handle is dropped.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(handle) = weak.upgrade() else {
                    break;
                };
                let removed = handle.cleanup_expired();
                if removed > 0 {
                    debug!(tier = %handle.options.name, removed, "expired entries swept");
                }
            }
        })
    }
}

#[async_trait]
impl<V> CacheHandle<V> for MemoryCacheHandle<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.options.name
    }

    fn capabilities(&self) -> HandleCapabilities {
        self.options.capabilities
    }

    async fn add(&self, item: CacheItem<V>) -> CacheResult<bool> {
        let item = self.prepare(item);
        let key = item.key().clone();
        let now = OffsetDateTime::now_utc();
        let version = self.next_version();

        let replaced_expired = match self.entries.entry(key.clone()) {
            MapEntry::Occupied(mut occupied) => {
                if !occupied.get().item.is_expired_at(now) {
                    return Ok(false);
                }
                occupied.insert(Entry { item, version });
                true
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry { item, version });
                false
            }
        };

        if replaced_expired {
            self.notify(key, EvictionReason::Expired);
        }
        self.enforce_capacity();
        Ok(true)
    }

    async fn put(&self, item: CacheItem<V>) -> CacheResult<()> {
        let item = self.prepare(item);
        let version = self.next_version();
        self.entries
            .insert(item.key().clone(), Entry { item, version });
        self.enforce_capacity();
        Ok(())
    }

    async fn get(&self, key: &CacheKey) -> CacheResult<Option<CacheItem<V>>> {
        Ok(self.read(key).map(|(item, _)| item))
    }

    async fn remove(&self, key: &CacheKey) -> CacheResult<bool> {
        let now = OffsetDateTime::now_utc();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| !entry.item.is_expired_at(now)))
    }

    async fn clear(&self) -> CacheResult<()> {
        self.entries.clear();
        Ok(())
    }

    async fn clear_region(&self, region: &str) -> CacheResult<()> {
        self.entries.retain(|key, _| key.region() != Some(region));
        Ok(())
    }

    async fn count(&self) -> CacheResult<u64> {
        let now = OffsetDateTime::now_utc();
        Ok(self
            .entries
            .iter()
            .filter(|e| !e.item.is_expired_at(now))
            .count() as u64)
    }

    async fn exists(&self, key: &CacheKey) -> CacheResult<bool> {
        let now = OffsetDateTime::now_utc();
        Ok(self
            .entries
            .get(key)
            .is_some_and(|entry| !entry.item.is_expired_at(now)))
    }

    async fn get_versioned(&self, key: &CacheKey) -> CacheResult<Option<Versioned<V>>> {
        Ok(self
            .read(key)
            .map(|(item, version)| Versioned { item, version }))
    }

    async fn compare_and_swap(
        &self,
        item: CacheItem<V>,
        expected: Version,
    ) -> CacheResult<CasOutcome> {
        let item = self.prepare(item);
        let now = OffsetDateTime::now_utc();
        let Some(mut entry) = self.entries.get_mut(item.key()) else {
            return Ok(CasOutcome::Missing);
        };
        if entry.item.is_expired_at(now) {
            return Ok(CasOutcome::Missing);
        }
        if entry.version != expected {
            return Ok(CasOutcome::Conflict);
        }
        let version = self.next_version();
        *entry = Entry { item, version };
        Ok(CasOutcome::Stored(version))
    }

    fn set_eviction_listener(&self, listener: EvictionListener) {
        *self.listener.write() = Some(listener);
    }
}
