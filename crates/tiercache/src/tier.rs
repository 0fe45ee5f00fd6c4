//! A tier as seen by the manager: the handle, its position and its counters.
//!
//! Tiers without native regions get flattened keys (see [`CacheKey::flattened`]);
//! items read back from them are restored to the caller's key.

use std::borrow::Cow;

use async_trait::async_trait;
use tiercache_core::{
    CacheHandle, CacheItem, CacheKey, CacheResult, CacheStats, CacheStatsSnapshot, CasOutcome,
    DynCacheHandle, EvictionListener, HandleCapabilities, StatsCounter, Version, Versioned,
};

pub(crate) struct TierSlot<V> {
    handle: DynCacheHandle<V>,
    position: usize,
    capabilities: HandleCapabilities,
    stats: CacheStats,
}

impl<V> TierSlot<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(handle: DynCacheHandle<V>, position: usize) -> Self {
        let capabilities = handle.capabilities();
        Self {
            handle,
            position,
            capabilities,
            stats: CacheStats::new(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        self.handle.name()
    }

    pub(crate) fn position(&self) -> usize {
        self.position
    }

    pub(crate) fn handle(&self) -> &DynCacheHandle<V> {
        &self.handle
    }

    pub(crate) fn is_distributed(&self) -> bool {
        self.capabilities.is_distributed
    }

    pub(crate) fn supports_atomic_update(&self) -> bool {
        self.capabilities.supports_atomic_update
    }

    pub(crate) fn record(&self, counter: StatsCounter) {
        self.stats.record(counter);
    }

    pub(crate) fn stats(&self, items: u64) -> CacheStatsSnapshot {
        self.stats.snapshot(self.name(), self.position, items)
    }

    fn tier_key<'a>(&self, key: &'a CacheKey) -> Cow<'a, CacheKey> {
        if !self.capabilities.supports_regions {
            Cow::Owned(key.flattened())
        } else {
            Cow::Borrowed(key)
        }
    }

    fn tier_item(&self, item: &CacheItem<V>) -> CacheItem<V> {
        match self.tier_key(item.key()) {
            Cow::Owned(flat) => item.with_key(flat),
            Cow::Borrowed(_) => item.clone(),
        }
    }

    fn restore(&self, key: &CacheKey, item: CacheItem<V>) -> CacheItem<V> {
        if item.key() == key {
            item
        } else {
            item.with_key(key.clone())
        }
    }

    pub(crate) async fn add(&self, item: &CacheItem<V>) -> CacheResult<bool> {
        self.stats.record(StatsCounter::Add);
        self.handle.add(self.tier_item(item)).await
    }

    pub(crate) async fn put(&self, item: &CacheItem<V>) -> CacheResult<()> {
        self.stats.record(StatsCounter::Put);
        self.handle.put(self.tier_item(item)).await
    }

    pub(crate) async fn get(&self, key: &CacheKey) -> CacheResult<Option<CacheItem<V>>> {
        self.stats.record(StatsCounter::Get);
        let found = self.handle.get(&self.tier_key(key)).await?;
        self.stats.record(if found.is_some() {
            StatsCounter::Hit
        } else {
            StatsCounter::Miss
        });
        Ok(found.map(|item| self.restore(key, item)))
    }

    pub(crate) async fn exists(&self, key: &CacheKey) -> CacheResult<bool> {
        self.handle.exists(&self.tier_key(key)).await
    }

    pub(crate) async fn remove(&self, key: &CacheKey) -> CacheResult<bool> {
        self.stats.record(StatsCounter::Remove);
        self.handle.remove(&self.tier_key(key)).await
    }

    pub(crate) async fn clear(&self) -> CacheResult<()> {
        self.stats.record(StatsCounter::Clear);
        self.handle.clear().await
    }

    /// Tiers without regions cannot tell region members apart, so they clear everything.
    pub(crate) async fn clear_region(&self, region: &str) -> CacheResult<()> {
        self.stats.record(StatsCounter::ClearRegion);
        if self.capabilities.supports_regions {
            self.handle.clear_region(region).await
        } else {
            self.handle.clear().await
        }
    }

    pub(crate) async fn count(&self) -> CacheResult<u64> {
        self.handle.count().await
    }

    /// Key under which this tier stores `key`, for handing to the update coordinator.
    pub(crate) fn storage_key(&self, key: &CacheKey) -> CacheKey {
        self.tier_key(key).into_owned()
    }

    pub(crate) fn restore_item(&self, key: &CacheKey, item: CacheItem<V>) -> CacheItem<V> {
        self.restore(key, item)
    }

    /// Maps a key reported by the tier back to the caller's key.
    pub(crate) fn caller_key(&self, key: CacheKey) -> CacheKey {
        if self.capabilities.supports_regions {
            key
        } else {
            key.unflattened()
        }
    }

    /// View of the handle that counts reads and writes in this tier's stats.
    ///
    /// Keys pass through untouched; callers hand it [`storage_key`](Self::storage_key)s.
    pub(crate) fn recording(&self) -> RecordingHandle<'_, V> {
        RecordingHandle { slot: self }
    }
}

pub(crate) struct RecordingHandle<'a, V> {
    slot: &'a TierSlot<V>,
}

impl<V> RecordingHandle<'_, V> {
    fn record_lookup(&self, found: bool) {
        self.slot.stats.record(StatsCounter::Get);
        self.slot.stats.record(if found {
            StatsCounter::Hit
        } else {
            StatsCounter::Miss
        });
    }
}

#[async_trait]
impl<'a, V> CacheHandle<V> for RecordingHandle<'a, V>
where
    V: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        self.slot.handle.name()
    }

    fn capabilities(&self) -> HandleCapabilities {
        self.slot.capabilities
    }

    async fn add(&self, item: CacheItem<V>) -> CacheResult<bool> {
        self.slot.stats.record(StatsCounter::Add);
        self.slot.handle.add(item).await
    }

    async fn put(&self, item: CacheItem<V>) -> CacheResult<()> {
        self.slot.stats.record(StatsCounter::Put);
        self.slot.handle.put(item).await
    }

    async fn get(&self, key: &CacheKey) -> CacheResult<Option<CacheItem<V>>> {
        let found = self.slot.handle.get(key).await?;
        self.record_lookup(found.is_some());
        Ok(found)
    }

    async fn remove(&self, key: &CacheKey) -> CacheResult<bool> {
        self.slot.stats.record(StatsCounter::Remove);
        self.slot.handle.remove(key).await
    }

    async fn clear(&self) -> CacheResult<()> {
        self.slot.stats.record(StatsCounter::Clear);
        self.slot.handle.clear().await
    }

    async fn clear_region(&self, region: &str) -> CacheResult<()> {
        self.slot.stats.record(StatsCounter::ClearRegion);
        self.slot.handle.clear_region(region).await
    }

    async fn count(&self) -> CacheResult<u64> {
        self.slot.handle.count().await
    }

    async fn exists(&self, key: &CacheKey) -> CacheResult<bool> {
        self.slot.handle.exists(key).await
    }

    async fn get_versioned(&self, key: &CacheKey) -> CacheResult<Option<Versioned<V>>> {
        let found = self.slot.handle.get_versioned(key).await?;
        self.record_lookup(found.is_some());
        Ok(found)
    }

    async fn compare_and_swap(
        &self,
        item: CacheItem<V>,
        expected: Version,
    ) -> CacheResult<CasOutcome> {
        let outcome = self.slot.handle.compare_and_swap(item, expected).await?;
        if matches!(outcome, CasOutcome::Stored(_)) {
            self.slot.stats.record(StatsCounter::Put);
        }
        Ok(outcome)
    }

    fn set_eviction_listener(&self, listener: EvictionListener) {
        self.slot.handle.set_eviction_listener(listener);
    }
}
