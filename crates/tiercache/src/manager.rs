//! The cache manager: one logical cache over an ordered list of tiers.
//!
//! Tier 0 is the nearest and fastest tier. Reads walk the tiers in order and
//! copy a hit into every nearer tier that missed. Writes go to tier 0 first;
//! its outcome decides the result of the call, failures of farther tiers are
//! logged. Every mutation enqueues one backplane message so peer processes
//! can drop their now stale local copies.
//!
//! Updates run against the farthest distributed tier when there is one, so
//! managers in different processes contend on the same entry.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tiercache_core::backplane::{BackplaneAction, BackplaneTransport, ChangeAction, OwnerId};
use tiercache_core::update::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_TIMEOUT, KeyLocks};
use tiercache_core::{
    CacheError, CacheEvent, CacheHandle, CacheItem, CacheKey, CacheResult, CacheStatsSnapshot,
    DynCacheHandle, EventRegistry, EvictionNotice, ExpirationMode, Origin, UpdateCoordinator,
    UpdateFailureReason, UpdateItemResult, UpdateOutcome, validate_region,
};
use tracing::{debug, info, warn};

use crate::backplane::{Backplane, BackplaneOptions, BackplaneStatsSnapshot, InvalidationTarget};
use crate::config::{CacheManagerConfig, UpdateMode};
use crate::metrics;
use crate::registry::{RegistryContext, TierRegistry};
use crate::tier::TierSlot;

/// State shared between the manager and its backplane listener.
struct ManagerCore<V> {
    name: String,
    tiers: Vec<TierSlot<V>>,
    events: EventRegistry,
}

impl<V> ManagerCore<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn emit(&self, event: CacheEvent) {
        self.events.emit(&event);
    }

    fn on_evicted(&self, position: usize, notice: EvictionNotice) {
        let Some(tier) = self.tiers.get(position) else {
            return;
        };
        let key = tier.caller_key(notice.key);
        debug!(cache = %self.name, tier = %tier.name(), key = %key, reason = %notice.reason, "item evicted by tier");
        metrics::record_eviction(&self.name, tier.name(), &notice.reason.to_string());
        self.emit(CacheEvent::RemoveByHandle {
            key,
            reason: notice.reason,
            tier: position,
        });
    }

    fn local_tiers(&self) -> impl Iterator<Item = &TierSlot<V>> {
        self.tiers.iter().filter(|t| !t.is_distributed())
    }

    async fn evict_local(&self, key: &CacheKey) {
        for tier in self.local_tiers() {
            if let Err(e) = tier.remove(key).await {
                warn!(cache = %self.name, tier = %tier.name(), key = %key, error = %e, "remote invalidation failed");
            }
        }
    }

    async fn clear_local(&self, region: Option<&str>) {
        for tier in self.local_tiers() {
            let result = match region {
                Some(region) => tier.clear_region(region).await,
                None => tier.clear().await,
            };
            if let Err(e) = result {
                warn!(cache = %self.name, tier = %tier.name(), error = %e, "remote clear failed");
            }
        }
    }
}

#[async_trait]
impl<V> InvalidationTarget for ManagerCore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn apply_remote(&self, action: &BackplaneAction) {
        let origin = Origin::Remote;
        match action {
            BackplaneAction::Changed { key, change } => {
                self.evict_local(key).await;
                let key = key.clone();
                self.emit(match change {
                    ChangeAction::Add => CacheEvent::Add { key, origin },
                    ChangeAction::Put => CacheEvent::Put { key, origin },
                    ChangeAction::Update => CacheEvent::Update { key, origin },
                });
            }
            BackplaneAction::Removed { key } => {
                self.evict_local(key).await;
                self.emit(CacheEvent::Remove {
                    key: key.clone(),
                    origin,
                });
            }
            BackplaneAction::Clear => {
                self.clear_local(None).await;
                self.emit(CacheEvent::Clear { origin });
            }
            BackplaneAction::ClearRegion { region } => {
                self.clear_local(Some(region)).await;
                self.emit(CacheEvent::ClearRegion {
                    region: region.clone(),
                    origin,
                });
            }
        }
    }

    async fn resync(&self) {
        info!(cache = %self.name, "Backplane reconnected, clearing local tiers");
        self.clear_local(None).await;
    }
}

/// Builder for [`CacheManager`].
pub struct CacheManagerBuilder<V> {
    name: String,
    tiers: Vec<DynCacheHandle<V>>,
    update_mode: UpdateMode,
    max_retries: u32,
    retry_timeout: Duration,
    backplane: Option<(Arc<dyn BackplaneTransport>, BackplaneOptions)>,
}

impl<V> CacheManagerBuilder<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tiers: Vec::new(),
            update_mode: UpdateMode::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_timeout: DEFAULT_RETRY_TIMEOUT,
            backplane: None,
        }
    }

    /// Appends a tier behind the ones already added.
    pub fn tier(mut self, handle: DynCacheHandle<V>) -> Self {
        self.tiers.push(handle);
        self
    }

    pub fn update_mode(mut self, mode: UpdateMode) -> Self {
        self.update_mode = mode;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry_timeout = timeout;
        self
    }

    pub fn backplane(
        mut self,
        transport: Arc<dyn BackplaneTransport>,
        options: BackplaneOptions,
    ) -> Self {
        self.backplane = Some((transport, options));
        self
    }

    /// Assembles the manager and starts its backplane, if any.
    pub async fn build(self) -> CacheResult<CacheManager<V>> {
        if self.tiers.is_empty() {
            return Err(CacheError::configuration(format!(
                "cache '{}' needs at least one tier",
                self.name
            )));
        }

        let tiers: Vec<TierSlot<V>> = self
            .tiers
            .into_iter()
            .enumerate()
            .map(|(position, handle)| TierSlot::new(handle, position))
            .collect();
        let update_target = tiers
            .iter()
            .rposition(TierSlot::is_distributed)
            .or_else(|| tiers.iter().position(TierSlot::supports_atomic_update))
            .unwrap_or(0);

        let core = Arc::new(ManagerCore {
            name: self.name,
            tiers,
            events: EventRegistry::new(),
        });

        for tier in &core.tiers {
            let weak = Arc::downgrade(&core);
            let position = tier.position();
            tier.handle()
                .set_eviction_listener(Arc::new(move |notice: EvictionNotice| {
                    if let Some(core) = weak.upgrade() {
                        core.on_evicted(position, notice);
                    }
                }));
        }

        let owner = OwnerId::new_random();
        let backplane = match self.backplane {
            Some((transport, options)) => {
                let target: Arc<dyn InvalidationTarget> = core.clone();
                Some(Backplane::start(&core.name, owner, transport, options, target).await)
            }
            None => None,
        };

        info!(
            cache = %core.name,
            tiers = core.tiers.len(),
            update_target,
            update_mode = ?self.update_mode,
            backplane = backplane.is_some(),
            "Cache manager created"
        );

        Ok(CacheManager {
            core,
            coordinator: UpdateCoordinator::new(self.max_retries, self.retry_timeout),
            update_locks: KeyLocks::new(),
            update_mode: self.update_mode,
            update_target,
            owner,
            backplane,
        })
    }
}

/// A single logical cache over an ordered stack of tiers.
pub struct CacheManager<V> {
    core: Arc<ManagerCore<V>>,
    coordinator: UpdateCoordinator,
    update_locks: KeyLocks,
    update_mode: UpdateMode,
    update_target: usize,
    owner: OwnerId,
    backplane: Option<Backplane>,
}

impl<V> fmt::Debug for CacheManager<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager")
            .field("name", &self.core.name)
            .field("tiers", &self.core.tiers.len())
            .field("update_mode", &self.update_mode)
            .field("owner", &self.owner)
            .finish()
    }
}

impl<V> CacheManager<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn builder(name: impl Into<String>) -> CacheManagerBuilder<V> {
        CacheManagerBuilder::new(name)
    }

    /// Creates every tier and the backplane through `registry`.
    pub async fn from_config(
        config: &CacheManagerConfig,
        registry: &TierRegistry<V>,
    ) -> CacheResult<Self> {
        config.validate()?;
        let ctx = RegistryContext::from(config);

        let mut builder = CacheManagerBuilder::new(&config.name)
            .update_mode(config.update_mode)
            .max_retries(config.max_retries)
            .retry_timeout(config.retry_timeout());
        for tier in &config.tiers {
            builder = builder.tier(registry.create_tier(tier, ctx).await?);
        }
        if let Some(bp) = &config.backplane {
            let transport = registry.create_backplane(bp).await?;
            builder = builder.backplane(transport, BackplaneOptions::from(bp));
        }
        builder.build().await
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Identifier stamped on this manager's backplane messages.
    pub fn owner_id(&self) -> OwnerId {
        self.owner
    }

    pub fn update_mode(&self) -> UpdateMode {
        self.update_mode
    }

    /// The tiers, nearest first.
    pub fn handles(&self) -> Vec<DynCacheHandle<V>> {
        self.core.tiers.iter().map(|t| Arc::clone(t.handle())).collect()
    }

    /// Event subscriptions.
    pub fn events(&self) -> &EventRegistry {
        &self.core.events
    }

    fn publish(&self, action: BackplaneAction) {
        if let Some(backplane) = &self.backplane {
            backplane.send(action);
        }
    }

    fn emit(&self, event: CacheEvent) {
        self.core.emit(event);
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    /// Walks the tiers and back-fills nearer tiers with the first hit.
    async fn read_through(&self, key: &CacheKey) -> CacheResult<Option<CacheItem<V>>> {
        for (position, tier) in self.core.tiers.iter().enumerate() {
            let found = match tier.get(key).await {
                Ok(found) => found,
                Err(e) if position > 0 => {
                    warn!(cache = %self.core.name, tier = %tier.name(), key = %key, error = %e, "tier read failed, trying next tier");
                    continue;
                }
                Err(e) => return Err(e),
            };

            match found {
                Some(item) => {
                    metrics::record_cache_hit(&self.core.name, tier.name());
                    debug!(cache = %self.core.name, tier = %tier.name(), key = %key, "cache hit");
                    self.backfill(&item, position).await;
                    return Ok(Some(item));
                }
                None => metrics::record_cache_miss(&self.core.name, tier.name()),
            }
        }
        debug!(cache = %self.core.name, key = %key, "cache miss");
        Ok(None)
    }

    async fn backfill(&self, item: &CacheItem<V>, found_at: usize) {
        for tier in &self.core.tiers[..found_at] {
            match tier.add(item).await {
                Ok(true) => {
                    metrics::record_backfill(&self.core.name, tier.name());
                    debug!(cache = %self.core.name, tier = %tier.name(), key = %item.key(), "back-filled");
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(cache = %self.core.name, tier = %tier.name(), key = %item.key(), error = %e, "back-fill failed");
                }
            }
        }
    }

    async fn get_key(&self, key: &CacheKey) -> CacheResult<Option<CacheItem<V>>> {
        metrics::record_operation(&self.core.name, "get");
        let item = self.read_through(key).await?;
        if item.is_some() {
            self.emit(CacheEvent::Get {
                key: key.clone(),
                origin: Origin::Local,
            });
        }
        Ok(item)
    }

    /// Returns the value stored under `key`, reading through the tiers.
    pub async fn get(&self, key: &str, region: Option<&str>) -> CacheResult<Option<V>> {
        let key = CacheKey::new(key, region)?;
        Ok(self.get_key(&key).await?.map(CacheItem::into_value))
    }

    /// Like [`get`](Self::get) but returns the whole item.
    pub async fn get_cache_item(
        &self,
        key: &str,
        region: Option<&str>,
    ) -> CacheResult<Option<CacheItem<V>>> {
        let key = CacheKey::new(key, region)?;
        self.get_key(&key).await
    }

    /// True if any tier holds the key. Does not back-fill.
    pub async fn exists(&self, key: &str, region: Option<&str>) -> CacheResult<bool> {
        let key = CacheKey::new(key, region)?;
        for (position, tier) in self.core.tiers.iter().enumerate() {
            match tier.exists(&key).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) if position > 0 => {
                    warn!(cache = %self.core.name, tier = %tier.name(), key = %key, error = %e, "tier exists check failed");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    // ---------------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------------

    /// Adds the value if tier 0 does not hold the key yet.
    pub async fn add(&self, key: &str, value: V, region: Option<&str>) -> CacheResult<bool> {
        let key = CacheKey::new(key, region)?;
        self.add_item(CacheItem::new(key, value)).await
    }

    /// Adds a prepared item, keeping its expiration policy.
    pub async fn add_item(&self, item: CacheItem<V>) -> CacheResult<bool> {
        metrics::record_operation(&self.core.name, "add");
        let (first, rest) = self.split_tiers();

        if !first.add(&item).await? {
            debug!(cache = %self.core.name, key = %item.key(), "add rejected, key exists");
            return Ok(false);
        }
        for tier in rest {
            if let Err(e) = tier.add(&item).await {
                warn!(cache = %self.core.name, tier = %tier.name(), key = %item.key(), error = %e, "add to tier failed");
            }
        }

        self.publish(BackplaneAction::Changed {
            key: item.key().clone(),
            change: ChangeAction::Add,
        });
        self.emit(CacheEvent::Add {
            key: item.key().clone(),
            origin: Origin::Local,
        });
        Ok(true)
    }

    /// Stores the value unconditionally.
    pub async fn put(&self, key: &str, value: V, region: Option<&str>) -> CacheResult<()> {
        let key = CacheKey::new(key, region)?;
        self.put_item(CacheItem::new(key, value)).await
    }

    /// Stores a prepared item unconditionally.
    pub async fn put_item(&self, item: CacheItem<V>) -> CacheResult<()> {
        metrics::record_operation(&self.core.name, "put");
        self.write_through(&item, None).await?;

        self.publish(BackplaneAction::Changed {
            key: item.key().clone(),
            change: ChangeAction::Put,
        });
        self.emit(CacheEvent::Put {
            key: item.key().clone(),
            origin: Origin::Local,
        });
        Ok(())
    }

    /// Writes `item` according to the update mode, skipping `skip` if given.
    ///
    /// Tier 0 errors are returned, the others are logged.
    async fn write_through(&self, item: &CacheItem<V>, skip: Option<usize>) -> CacheResult<()> {
        for (position, tier) in self.core.tiers.iter().enumerate() {
            if Some(position) == skip {
                continue;
            }
            if self.update_mode == UpdateMode::Up && position > 0 {
                break;
            }
            match tier.put(item).await {
                Ok(()) => {}
                Err(e) if position == 0 => return Err(e),
                Err(e) => {
                    warn!(cache = %self.core.name, tier = %tier.name(), key = %item.key(), error = %e, "put to tier failed");
                }
            }
        }
        Ok(())
    }

    /// Removes the key from every tier. True if any tier held it.
    pub async fn remove(&self, key: &str, region: Option<&str>) -> CacheResult<bool> {
        metrics::record_operation(&self.core.name, "remove");
        let key = CacheKey::new(key, region)?;

        let mut removed = false;
        let mut first_error = None;
        for (position, tier) in self.core.tiers.iter().enumerate() {
            match tier.remove(&key).await {
                Ok(r) => removed |= r,
                Err(e) if position == 0 => first_error = Some(e),
                Err(e) => {
                    warn!(cache = %self.core.name, tier = %tier.name(), key = %key, error = %e, "remove from tier failed");
                }
            }
        }

        self.publish(BackplaneAction::Removed { key: key.clone() });
        if let Some(e) = first_error {
            return Err(e);
        }
        if removed {
            self.emit(CacheEvent::Remove {
                key,
                origin: Origin::Local,
            });
        }
        Ok(removed)
    }

    pub async fn clear(&self) -> CacheResult<()> {
        metrics::record_operation(&self.core.name, "clear");
        let result = self.clear_tiers(None).await;
        self.publish(BackplaneAction::Clear);
        self.emit(CacheEvent::Clear {
            origin: Origin::Local,
        });
        result
    }

    pub async fn clear_region(&self, region: &str) -> CacheResult<()> {
        validate_region(region)?;
        metrics::record_operation(&self.core.name, "clear_region");
        let result = self.clear_tiers(Some(region)).await;
        self.publish(BackplaneAction::ClearRegion {
            region: region.to_string(),
        });
        self.emit(CacheEvent::ClearRegion {
            region: region.to_string(),
            origin: Origin::Local,
        });
        result
    }

    async fn clear_tiers(&self, region: Option<&str>) -> CacheResult<()> {
        let mut first_error = None;
        for (position, tier) in self.core.tiers.iter().enumerate() {
            let result = match region {
                Some(region) => tier.clear_region(region).await,
                None => tier.clear().await,
            };
            match result {
                Ok(()) => {}
                Err(e) if position == 0 => first_error = Some(e),
                Err(e) => {
                    warn!(cache = %self.core.name, tier = %tier.name(), error = %e, "clear of tier failed");
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    // ---------------------------------------------------------------------
    // Updates
    // ---------------------------------------------------------------------

    /// Runs an optimistic update and reports how it went.
    ///
    /// Not-found, lost races and aborted updates are reported in the result,
    /// not as errors.
    pub async fn update_item<F>(
        &self,
        key: &str,
        region: Option<&str>,
        update_fn: F,
        max_retries: Option<u32>,
    ) -> CacheResult<UpdateItemResult<V>>
    where
        F: Fn(&V) -> Option<V> + Send + Sync,
    {
        let key = CacheKey::new(key, region)?;
        self.update_key(&key, &update_fn, max_retries).await
    }

    /// Returns the new value, or `None` if the update did not happen.
    pub async fn try_update<F>(
        &self,
        key: &str,
        region: Option<&str>,
        update_fn: F,
        max_retries: Option<u32>,
    ) -> CacheResult<Option<V>>
    where
        F: Fn(&V) -> Option<V> + Send + Sync,
    {
        let result = self.update_item(key, region, update_fn, max_retries).await?;
        Ok(result.into_item().map(CacheItem::into_value))
    }

    /// Returns the new value, or [`CacheError::UpdateFailed`] if none was stored.
    pub async fn update<F>(
        &self,
        key: &str,
        region: Option<&str>,
        update_fn: F,
        max_retries: Option<u32>,
    ) -> CacheResult<V>
    where
        F: Fn(&V) -> Option<V> + Send + Sync,
    {
        let cache_key = CacheKey::new(key, region)?;
        let result = self.update_key(&cache_key, &update_fn, max_retries).await?;
        into_updated_value(&cache_key, result)
    }

    async fn update_key<F>(
        &self,
        key: &CacheKey,
        update_fn: &F,
        max_retries: Option<u32>,
    ) -> CacheResult<UpdateItemResult<V>>
    where
        F: Fn(&V) -> Option<V> + Send + Sync,
    {
        metrics::record_operation(&self.core.name, "update");
        let target = &self.core.tiers[self.update_target];
        let storage_key = target.storage_key(key);
        let view: &dyn CacheHandle<V> = &target.recording();
        // Held through propagation so this process writes the other tiers in order.
        let _guard = self.update_locks.lock(key).await;

        let mut result = self
            .coordinator
            .update(view, &storage_key, update_fn, max_retries)
            .await?;

        // The item may only live in another tier; seed the target and try again.
        if matches!(result.outcome(), UpdateOutcome::NotFound) && self.core.tiers.len() > 1 {
            if let Some(found) = self.read_through(key).await? {
                target.add(&found).await?;
                let earlier = result.tries_used();
                let retry = self
                    .coordinator
                    .update(view, &storage_key, update_fn, max_retries)
                    .await?;
                result = UpdateItemResult::new(
                    retry.outcome().clone(),
                    retry.version_conflict_detected() || result.version_conflict_detected(),
                    earlier + retry.tries_used(),
                );
            }
        }

        let conflict = result.version_conflict_detected();
        let tries = result.tries_used();
        if !result.success() {
            debug!(cache = %self.core.name, key = %key, tries, conflict, outcome = ?result.failure_reason(), "update did not store a value");
            return Ok(result);
        }
        let Some(stored) = result.into_item() else {
            return Ok(UpdateItemResult::new(UpdateOutcome::NotFound, conflict, tries));
        };
        let item = target.restore_item(key, stored);

        self.propagate_update(&item).await;
        self.publish(BackplaneAction::Changed {
            key: key.clone(),
            change: ChangeAction::Update,
        });
        self.emit(CacheEvent::Update {
            key: key.clone(),
            origin: Origin::Local,
        });
        Ok(UpdateItemResult::new(
            UpdateOutcome::Updated(item),
            conflict,
            tries,
        ))
    }

    /// Brings the other tiers in line with the update target.
    ///
    /// Nearer tiers receive the new item, or lose their copy when the target
    /// is shared with other processes. Farther tiers receive it in `Full`
    /// mode only.
    async fn propagate_update(&self, item: &CacheItem<V>) {
        let shared = self.core.tiers[self.update_target].is_distributed();
        for (position, tier) in self.core.tiers.iter().enumerate() {
            let result = match position.cmp(&self.update_target) {
                Ordering::Equal => continue,
                // A peer may have stored a newer value in the shared tier already.
                Ordering::Less if shared => tier.remove(item.key()).await.map(drop),
                Ordering::Less => tier.put(item).await,
                Ordering::Greater if self.update_mode == UpdateMode::Up => break,
                Ordering::Greater => tier.put(item).await,
            };
            if let Err(e) = result {
                warn!(cache = %self.core.name, tier = %tier.name(), key = %item.key(), error = %e, "update propagation failed");
            }
        }
    }

    /// Returns the cached value, adding `value` if the key is absent.
    pub async fn get_or_add(&self, key: &str, value: V, region: Option<&str>) -> CacheResult<V> {
        self.get_or_add_with(key, region, move || value).await
    }

    /// Returns the cached value, adding the factory's value if the key is absent.
    ///
    /// The factory runs at most once.
    pub async fn get_or_add_with<F>(
        &self,
        key: &str,
        region: Option<&str>,
        factory: F,
    ) -> CacheResult<V>
    where
        F: FnOnce() -> V + Send,
    {
        let cache_key = CacheKey::new(key, region)?;
        if let Some(item) = self.get_key(&cache_key).await? {
            return Ok(item.into_value());
        }

        let value = factory();
        let max = self.coordinator.max_retries();
        for _ in 0..max {
            if self
                .add_item(CacheItem::new(cache_key.clone(), value.clone()))
                .await?
            {
                return Ok(value);
            }
            // Lost the race against another writer; take theirs unless it vanished again.
            if let Some(item) = self.get_key(&cache_key).await? {
                return Ok(item.into_value());
            }
        }
        Err(CacheError::update_failed(
            cache_key.key(),
            cache_key.region().map(str::to_string),
            UpdateFailureReason::TooManyRetries,
            max,
        ))
    }

    /// Adds `add_value`, or updates the existing value with `update_fn`.
    pub async fn add_or_update<F>(
        &self,
        key: &str,
        region: Option<&str>,
        add_value: V,
        update_fn: F,
        max_retries: Option<u32>,
    ) -> CacheResult<V>
    where
        F: Fn(&V) -> Option<V> + Send + Sync,
    {
        let cache_key = CacheKey::new(key, region)?;
        let max = max_retries.unwrap_or(self.coordinator.max_retries()).max(1);
        let mut tries = 0;

        while tries < max {
            if self
                .add_item(CacheItem::new(cache_key.clone(), add_value.clone()))
                .await?
            {
                return Ok(add_value);
            }
            let result = self
                .update_key(&cache_key, &update_fn, Some(max - tries))
                .await?;
            tries += result.tries_used();
            match result.outcome() {
                UpdateOutcome::NotFound => continue,
                _ => return into_updated_value(&cache_key, result),
            }
        }
        Err(CacheError::update_failed(
            cache_key.key(),
            cache_key.region().map(str::to_string),
            UpdateFailureReason::TooManyRetries,
            tries,
        ))
    }

    // ---------------------------------------------------------------------
    // Expiration
    // ---------------------------------------------------------------------

    /// Gives an existing item a new expiration policy in every tier holding it.
    ///
    /// Returns false if no tier holds the key.
    pub async fn expire(
        &self,
        key: &str,
        region: Option<&str>,
        mode: ExpirationMode,
        timeout: Duration,
    ) -> CacheResult<bool> {
        metrics::record_operation(&self.core.name, "expire");
        let key = CacheKey::new(key, region)?;

        let mut found = false;
        for (position, tier) in self.core.tiers.iter().enumerate() {
            let item = match tier.get(&key).await {
                Ok(Some(item)) => item,
                Ok(None) => continue,
                Err(e) if position > 0 => {
                    warn!(cache = %self.core.name, tier = %tier.name(), key = %key, error = %e, "expire read failed");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let updated = item.with_expiration_policy(mode, timeout)?;
            match tier.put(&updated).await {
                Ok(()) => found = true,
                Err(e) if position == 0 => return Err(e),
                Err(e) => {
                    warn!(cache = %self.core.name, tier = %tier.name(), key = %key, error = %e, "expire write failed");
                }
            }
        }

        if found {
            self.publish(BackplaneAction::Changed {
                key,
                change: ChangeAction::Put,
            });
        }
        Ok(found)
    }

    /// Makes an existing item never expire.
    pub async fn remove_expiration(&self, key: &str, region: Option<&str>) -> CacheResult<bool> {
        self.expire(key, region, ExpirationMode::None, Duration::ZERO)
            .await
    }

    // ---------------------------------------------------------------------
    // Introspection and lifecycle
    // ---------------------------------------------------------------------

    /// Counters of every tier, nearest first.
    pub async fn stats(&self) -> Vec<CacheStatsSnapshot> {
        let mut out = Vec::with_capacity(self.core.tiers.len());
        for tier in &self.core.tiers {
            let items = match tier.count().await {
                Ok(n) => n,
                Err(e) => {
                    warn!(cache = %self.core.name, tier = %tier.name(), error = %e, "tier count failed");
                    0
                }
            };
            metrics::set_cache_entries(&self.core.name, tier.name(), items);
            out.push(tier.stats(items));
        }
        out
    }

    pub fn backplane_stats(&self) -> Option<BackplaneStatsSnapshot> {
        self.backplane.as_ref().map(Backplane::stats)
    }

    /// Stops the backplane after publishing queued messages.
    pub async fn shutdown(&self) {
        if let Some(backplane) = &self.backplane {
            backplane.shutdown().await;
        }
        info!(cache = %self.core.name, "Cache manager shut down");
    }

    fn split_tiers(&self) -> (&TierSlot<V>, &[TierSlot<V>]) {
        // build() guarantees at least one tier.
        let (first, rest) = self.core.tiers.split_at(1);
        (&first[0], rest)
    }
}

fn into_updated_value<V>(key: &CacheKey, result: UpdateItemResult<V>) -> CacheResult<V> {
    let tries = result.tries_used();
    match result.failure_reason() {
        None => result
            .into_item()
            .map(CacheItem::into_value)
            .ok_or_else(|| {
                CacheError::update_failed(
                    key.key(),
                    key.region().map(str::to_string),
                    UpdateFailureReason::NotFound,
                    tries,
                )
            }),
        Some(reason) => Err(CacheError::update_failed(
            key.key(),
            key.region().map(str::to_string),
            reason,
            tries,
        )),
    }
}
