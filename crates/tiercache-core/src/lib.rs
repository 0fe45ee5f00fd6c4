//! # tiercache-core
//!
//! Building blocks shared by every tiercache crate.
//!
//! This crate defines the data model and the contracts the orchestrator drives;
//! it contains no tier implementations.
//!
//! ## Overview
//!
//! - [`CacheItem`] / [`CacheKey`]: the value wrapper and its identity
//! - [`CacheHandle`]: the contract each tier implements
//! - [`UpdateCoordinator`]: the bounded-retry optimistic update loop
//! - [`backplane`]: invalidation messages, their chunk codec and the transport contract
//! - [`CacheSerializer`]: byte encoding for tiers that need it
//! - [`EventRegistry`] / [`CacheStats`]: events and counters
//!
//! ## Implementing a tier
//!
//! ```ignore
//! use async_trait::async_trait;
//! use tiercache_core::{CacheHandle, CacheItem, CacheKey, CacheResult, HandleCapabilities};
//!
//! struct MyTier { /* ... */ }
//!
//! #[async_trait]
//! impl CacheHandle<String> for MyTier {
//!     fn name(&self) -> &str { "my-tier" }
//!     fn capabilities(&self) -> HandleCapabilities { HandleCapabilities::local() }
//!     async fn get(&self, key: &CacheKey) -> CacheResult<Option<CacheItem<String>>> {
//!         // ...
//!     }
//!     // ... other methods
//! }
//! ```

pub mod backplane;
mod error;
pub mod events;
mod handle;
mod item;
mod key;
pub mod serializer;
mod stats;
pub mod update;

pub use error::{CacheError, ErrorCategory, UpdateFailureReason};
pub use events::{CacheEvent, CacheEventKind, EventRegistry, Origin, SubscriptionId};
pub use handle::{
    CacheHandle, CasOutcome, DynCacheHandle, EvictionListener, EvictionNotice, EvictionReason,
    HandleCapabilities, Version, Versioned,
};
pub use item::{CacheItem, ExpirationMode};
pub use key::{CacheKey, validate_region};
pub use serializer::{CacheSerializer, JsonSerializer, MessagePackSerializer};
pub use stats::{CacheStats, CacheStatsSnapshot, StatsCounter};
pub use update::{UpdateCoordinator, UpdateItemResult, UpdateOutcome};

/// Type alias for a cache result.
pub type CacheResult<T> = Result<T, CacheError>;
