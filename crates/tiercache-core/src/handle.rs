//! The contract every cache tier implements.
//!
//! The orchestrator drives an ordered list of handles and never looks behind
//! this trait. Handles report misses as `Ok(None)` / `Ok(false)`; an `Err` is
//! reserved for infrastructure or encoding failures.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CacheError;
use crate::item::CacheItem;
use crate::key::CacheKey;
use crate::CacheResult;

/// What a tier can do natively. Fixed for the lifetime of the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandleCapabilities {
    /// Regions are stored natively; otherwise keys are flattened.
    pub supports_regions: bool,
    /// `compare_and_swap` is implemented.
    pub supports_atomic_update: bool,
    /// The tier is shared by every process using the same backplane.
    pub is_distributed: bool,
}

impl HandleCapabilities {
    /// Capabilities of a process-local tier with native regions and CAS.
    pub const fn local() -> Self {
        Self {
            supports_regions: true,
            supports_atomic_update: true,
            is_distributed: false,
        }
    }

    /// Capabilities of a shared tier with native regions and CAS.
    pub const fn distributed() -> Self {
        Self {
            supports_regions: true,
            supports_atomic_update: true,
            is_distributed: true,
        }
    }
}

/// Opaque version token used for compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version(u64);

impl Version {
    /// Token handed out by tiers that do not track versions.
    pub const UNVERSIONED: Version = Version(0);

    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An item read together with the version it was stored under.
#[derive(Debug, Clone)]
pub struct Versioned<V> {
    pub item: CacheItem<V>,
    pub version: Version,
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write happened; the entry now carries this version.
    Stored(Version),
    /// Another writer changed the entry since it was read.
    Conflict,
    /// The entry disappeared since it was read.
    Missing,
}

/// Why a tier dropped an item on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvictionReason {
    /// The item's expiration policy elapsed.
    Expired,
    /// The tier ran out of room.
    Capacity,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expired => write!(f, "expired"),
            Self::Capacity => write!(f, "capacity"),
        }
    }
}

/// Notification a tier emits when it evicts an item autonomously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionNotice {
    pub key: CacheKey,
    pub reason: EvictionReason,
}

/// Callback registered by the orchestrator on each tier.
pub type EvictionListener = Arc<dyn Fn(EvictionNotice) + Send + Sync>;

/// A single cache tier.
#[async_trait]
pub trait CacheHandle<V>: Send + Sync
where
    V: Send + Sync + 'static,
{
    /// Name used in logs, metrics and statistics.
    fn name(&self) -> &str;

    fn capabilities(&self) -> HandleCapabilities;

    /// Stores the item only if the key is absent. Returns `false` if it exists.
    async fn add(&self, item: CacheItem<V>) -> CacheResult<bool>;

    /// Stores the item unconditionally.
    async fn put(&self, item: CacheItem<V>) -> CacheResult<()>;

    /// Reads an item. Expired items are reported as absent.
    async fn get(&self, key: &CacheKey) -> CacheResult<Option<CacheItem<V>>>;

    /// Removes an item. Returns `true` if it was present.
    async fn remove(&self, key: &CacheKey) -> CacheResult<bool>;

    async fn clear(&self) -> CacheResult<()>;

    async fn clear_region(&self, region: &str) -> CacheResult<()>;

    /// Number of items currently held.
    async fn count(&self) -> CacheResult<u64>;

    async fn exists(&self, key: &CacheKey) -> CacheResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Reads an item with its version token.
    ///
    /// Tiers without native versions report [`Version::UNVERSIONED`].
    async fn get_versioned(&self, key: &CacheKey) -> CacheResult<Option<Versioned<V>>> {
        Ok(self.get(key).await?.map(|item| Versioned {
            item,
            version: Version::UNVERSIONED,
        }))
    }

    /// Writes the item only if the stored version still equals `expected`.
    async fn compare_and_swap(
        &self,
        item: CacheItem<V>,
        expected: Version,
    ) -> CacheResult<CasOutcome> {
        let _ = (item, expected);
        Err(CacheError::unsupported(self.name(), "compare_and_swap"))
    }

    /// Registers the callback invoked when the tier evicts an item by itself.
    fn set_eviction_listener(&self, listener: EvictionListener) {
        let _ = listener;
    }
}

/// Shared handle as held by the orchestrator.
pub type DynCacheHandle<V> = Arc<dyn CacheHandle<V>>;
