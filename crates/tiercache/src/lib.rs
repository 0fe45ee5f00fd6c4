//! # tiercache
//!
//! A multi-tier cache: an ordered stack of tiers (in-process first, shared
//! stores behind) presented as one logical cache, kept coherent across
//! processes by an invalidation backplane.
//!
//! ## Overview
//!
//! - [`CacheManager`]: reads through the tiers, back-fills nearer tiers and
//!   fans writes out according to the [`UpdateMode`]
//! - optimistic updates with bounded retries, on the first tier that
//!   supports compare-and-swap
//! - [`Backplane`]: batched, deduplicated invalidation messages between
//!   managers sharing a distributed tier
//! - [`TierRegistry`]: builds tiers and transports from [`CacheManagerConfig`]
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tiercache::{CacheManager, MemoryCacheHandle};
//!
//! let cache = CacheManager::<String>::builder("users")
//!     .tier(Arc::new(MemoryCacheHandle::named("local")))
//!     .build()
//!     .await?;
//!
//! cache.put("42", "alice".to_string(), None).await?;
//! let name = cache.update("42", None, |v| Some(v.to_uppercase()), None).await?;
//! ```

mod backplane;
pub mod config;
mod manager;
pub mod metrics;
mod registry;
mod tier;

pub use backplane::{Backplane, BackplaneOptions, BackplaneStatsSnapshot};
pub use config::{
    BackplaneConfig, CacheManagerConfig, ConfigError, TierConfig, UpdateMode, load_config,
};
pub use manager::{CacheManager, CacheManagerBuilder};
pub use registry::{BackplaneFactory, RegistryContext, TierFactory, TierRegistry};

pub use tiercache_core::backplane::{BackplaneTransport, OwnerId};
pub use tiercache_core::{
    CacheError, CacheEvent, CacheEventKind, CacheHandle, CacheItem, CacheKey, CacheResult,
    CacheStatsSnapshot, DynCacheHandle, EvictionReason, ExpirationMode, HandleCapabilities, Origin,
    SubscriptionId, UpdateFailureReason, UpdateItemResult, UpdateOutcome,
};
pub use tiercache_memory::{MemoryBackplaneHub, MemoryCacheHandle, MemoryHandleOptions};
pub use tiercache_redis::{RedisCacheHandle, RedisHandleOptions, RedisPoolConfig};
