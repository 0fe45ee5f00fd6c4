//! Factories that turn configuration descriptors into tiers and transports.
//!
//! The registry is an ordinary value owned by whoever assembles the cache;
//! there is no process-wide table of named configurations.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tiercache_core::backplane::BackplaneTransport;
use tiercache_core::{
    CacheError, CacheResult, DynCacheHandle, HandleCapabilities, JsonSerializer,
    MessagePackSerializer,
};
use tiercache_memory::{MemoryBackplaneHub, MemoryCacheHandle, MemoryHandleOptions};
use tiercache_redis::{
    RedisBackplaneTransport, RedisCacheHandle, RedisHandleOptions, RedisPoolConfig, create_pool,
};

use crate::config::{BackplaneConfig, CacheManagerConfig, TierConfig};

pub type TierFactory<V> =
    Arc<dyn Fn(TierConfig, RegistryContext) -> BoxFuture<'static, CacheResult<DynCacheHandle<V>>> + Send + Sync>;

pub type BackplaneFactory = Arc<
    dyn Fn(BackplaneConfig) -> BoxFuture<'static, CacheResult<Arc<dyn BackplaneTransport>>>
        + Send
        + Sync,
>;

/// Manager-wide settings handed to tier factories.
#[derive(Debug, Clone, Copy)]
pub struct RegistryContext {
    pub max_retries: u32,
    pub retry_timeout: Duration,
}

impl From<&CacheManagerConfig> for RegistryContext {
    fn from(cfg: &CacheManagerConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            retry_timeout: cfg.retry_timeout(),
        }
    }
}

/// Named tier and backplane factories.
pub struct TierRegistry<V> {
    tiers: HashMap<String, TierFactory<V>>,
    backplanes: HashMap<String, BackplaneFactory>,
}

impl<V> Default for TierRegistry<V> {
    fn default() -> Self {
        Self {
            tiers: HashMap::new(),
            backplanes: HashMap::new(),
        }
    }
}

impl<V> fmt::Debug for TierRegistry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TierRegistry")
            .field("tiers", &self.tiers.keys().collect::<Vec<_>>())
            .field("backplanes", &self.backplanes.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<V> TierRegistry<V>
where
    V: Send + Sync + 'static,
{
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_tier<F, Fut>(&mut self, kind: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(TierConfig, RegistryContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CacheResult<DynCacheHandle<V>>> + Send + 'static,
    {
        self.tiers
            .insert(kind.into(), Arc::new(move |cfg, ctx| factory(cfg, ctx).boxed()));
        self
    }

    pub fn register_backplane<F, Fut>(&mut self, kind: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(BackplaneConfig) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CacheResult<Arc<dyn BackplaneTransport>>> + Send + 'static,
    {
        self.backplanes
            .insert(kind.into(), Arc::new(move |cfg| factory(cfg).boxed()));
        self
    }

    /// Registers the in-process hub as the "memory" backplane.
    pub fn register_memory_hub(&mut self, hub: MemoryBackplaneHub) -> &mut Self {
        self.register_backplane("memory", move |_cfg| {
            let transport: Arc<dyn BackplaneTransport> = Arc::new(hub.transport());
            async move { Ok(transport) }
        })
    }

    pub fn has_tier(&self, kind: &str) -> bool {
        self.tiers.contains_key(kind)
    }

    pub fn has_backplane(&self, kind: &str) -> bool {
        self.backplanes.contains_key(kind)
    }

    pub(crate) async fn create_tier(
        &self,
        cfg: &TierConfig,
        ctx: RegistryContext,
    ) -> CacheResult<DynCacheHandle<V>> {
        let factory = self.tiers.get(&cfg.kind).ok_or_else(|| {
            CacheError::configuration(format!(
                "no tier factory registered for kind '{}' (tier '{}')",
                cfg.kind, cfg.name
            ))
        })?;
        factory(cfg.clone(), ctx).await
    }

    pub(crate) async fn create_backplane(
        &self,
        cfg: &BackplaneConfig,
    ) -> CacheResult<Arc<dyn BackplaneTransport>> {
        let factory = self.backplanes.get(&cfg.kind).ok_or_else(|| {
            CacheError::configuration(format!(
                "no backplane factory registered for kind '{}'",
                cfg.kind
            ))
        })?;
        factory(cfg.clone()).await
    }
}

impl<V> TierRegistry<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// A registry with the "memory" and "redis" tiers and the "redis" backplane.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register_tier("memory", |cfg, _ctx| async move { Ok(memory_tier::<V>(&cfg)) })
            .register_tier("redis", |cfg, ctx| async move { redis_tier::<V>(&cfg, ctx).await })
            .register_backplane("redis", |cfg| async move { redis_backplane(&cfg).await });
        registry
    }
}

fn override_capabilities(mut caps: HandleCapabilities, cfg: &TierConfig) -> HandleCapabilities {
    if let Some(v) = cfg.supports_regions {
        caps.supports_regions = v;
    }
    if let Some(v) = cfg.atomic_updates {
        caps.supports_atomic_update = v;
    }
    if let Some(v) = cfg.is_distributed {
        caps.is_distributed = v;
    }
    caps
}

fn memory_tier<V>(cfg: &TierConfig) -> DynCacheHandle<V>
where
    V: Clone + Send + Sync + 'static,
{
    let mut options = MemoryHandleOptions::new(&cfg.name)
        .with_expiration(cfg.expiration_mode, cfg.expiration_timeout())
        .with_capabilities(override_capabilities(HandleCapabilities::local(), cfg));
    if let Some(max) = cfg.max_entries {
        options = options.with_max_entries(max);
    }

    let handle = Arc::new(MemoryCacheHandle::new(options));
    if let Some(ms) = cfg.cleanup_interval_ms {
        handle.spawn_cleanup(Duration::from_millis(ms));
    }
    handle
}

fn redis_url(url: Option<&str>, what: &str) -> CacheResult<String> {
    url.map(str::to_string)
        .ok_or_else(|| CacheError::configuration(format!("{what} requires a url")))
}

async fn redis_tier<V>(cfg: &TierConfig, ctx: RegistryContext) -> CacheResult<DynCacheHandle<V>>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    let url = redis_url(cfg.url.as_deref(), &format!("redis tier '{}'", cfg.name))?;
    let mut pool_config = RedisPoolConfig::from_url(url);
    if let Some(size) = cfg.pool_size {
        pool_config.pool_size = size;
    }
    let pool = create_pool(&pool_config).await?;

    let mut options = RedisHandleOptions::new(&cfg.name)
        .with_expiration(cfg.expiration_mode, cfg.expiration_timeout())
        .with_capabilities(override_capabilities(HandleCapabilities::distributed(), cfg))
        .with_retries(ctx.max_retries, ctx.retry_timeout);
    if let Some(prefix) = &cfg.prefix {
        options = options.with_prefix(prefix);
    }

    let handle: DynCacheHandle<V> = match cfg.serializer.as_str() {
        "msgpack" => Arc::new(RedisCacheHandle::with_serializer(
            pool,
            MessagePackSerializer,
            options,
        )),
        _ => Arc::new(RedisCacheHandle::with_serializer(pool, JsonSerializer, options)),
    };
    Ok(handle)
}

async fn redis_backplane(cfg: &BackplaneConfig) -> CacheResult<Arc<dyn BackplaneTransport>> {
    let url = redis_url(cfg.url.as_deref(), "redis backplane")?;
    let pool = create_pool(&RedisPoolConfig::from_url(url.clone())).await?;
    Ok(Arc::new(RedisBackplaneTransport::new(
        pool,
        url,
        cfg.channel.clone(),
    )))
}

#[cfg(test)]
mod tests {
    use tiercache_core::{CacheHandle, CacheItem, CacheKey, ExpirationMode};

    use super::*;

    fn ctx() -> RegistryContext {
        RegistryContext::from(&CacheManagerConfig::default())
    }

    #[tokio::test]
    async fn test_memory_tier_from_config() {
        let registry = TierRegistry::<String>::with_defaults();
        let mut cfg = TierConfig::new("local", "memory");
        cfg.expiration_mode = ExpirationMode::Absolute;
        cfg.expiration_timeout_ms = 60_000;
        cfg.is_distributed = Some(true);

        let tier = registry.create_tier(&cfg, ctx()).await.unwrap();
        assert_eq!(tier.name(), "local");
        assert!(tier.capabilities().is_distributed);

        let key = CacheKey::plain("k").unwrap();
        tier.put(CacheItem::new(key.clone(), "v".into())).await.unwrap();
        let stored = tier.get(&key).await.unwrap().unwrap();
        assert_eq!(stored.expiration_mode(), ExpirationMode::Absolute);
    }

    #[tokio::test]
    async fn test_unknown_kind_is_a_configuration_error() {
        let registry = TierRegistry::<String>::with_defaults();
        let err = registry
            .create_tier(&TierConfig::new("x", "memcached"), ctx())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CacheError::Configuration { .. }));

        let err = registry
            .create_backplane(&BackplaneConfig {
                kind: "memory".into(),
                ..Default::default()
            })
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CacheError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_redis_tier_requires_url() {
        let registry = TierRegistry::<String>::with_defaults();
        let err = registry
            .create_tier(&TierConfig::new("shared", "redis"), ctx())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("requires a url"));
    }

    #[tokio::test]
    async fn test_custom_factories() {
        let mut registry = TierRegistry::<i64>::new();
        registry.register_tier("custom", |cfg, _| async move {
            let handle: DynCacheHandle<i64> = Arc::new(MemoryCacheHandle::named(cfg.name));
            Ok(handle)
        });
        registry.register_memory_hub(MemoryBackplaneHub::new());

        assert!(registry.has_tier("custom"));
        assert!(!registry.has_tier("memory"));
        assert!(registry.has_backplane("memory"));

        let tier = registry
            .create_tier(&TierConfig::new("mine", "custom"), ctx())
            .await
            .unwrap();
        assert_eq!(tier.name(), "mine");
    }
}
