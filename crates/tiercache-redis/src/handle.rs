//! Shared cache tier on Redis.
//!
//! Each item lives in a hash with two fields: `item`, the serialized item
//! envelope, and `version`, a counter bumped on every write. Conditional
//! writes run as Lua scripts so check and write are one atomic step on the
//! server. Expiration is delegated to Redis with `PEXPIRE`.

use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::{AsyncCommands, Script};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tiercache_core::{
    CacheError, CacheHandle, CacheItem, CacheKey, CacheResult, CacheSerializer, CasOutcome,
    ExpirationMode, HandleCapabilities, JsonSerializer, Version, Versioned,
};
use time::OffsetDateTime;

use crate::keys;

const ADD_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('HSET', KEYS[1], 'item', ARGV[1], 'version', 1)
if tonumber(ARGV[2]) > 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 1
";

const PUT_SCRIPT: &str = r"
redis.call('HSET', KEYS[1], 'item', ARGV[1])
local version = redis.call('HINCRBY', KEYS[1], 'version', 1)
if tonumber(ARGV[2]) > 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
  redis.call('PERSIST', KEYS[1])
end
return version
";

// Returns -1 when the key is gone, 0 on a version mismatch, the new version otherwise.
const CAS_SCRIPT: &str = r"
local current = redis.call('HGET', KEYS[1], 'version')
if not current then
  return -1
end
if current ~= ARGV[3] then
  return 0
end
redis.call('HSET', KEYS[1], 'item', ARGV[1])
local version = redis.call('HINCRBY', KEYS[1], 'version', 1)
if tonumber(ARGV[2]) > 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
  redis.call('PERSIST', KEYS[1])
end
return version
";

const SCAN_BATCH: usize = 500;

/// Settings for a [`RedisCacheHandle`].
#[derive(Debug, Clone)]
pub struct RedisHandleOptions {
    pub name: String,
    /// Namespace for every key this tier writes.
    pub prefix: String,
    pub expiration_mode: ExpirationMode,
    pub expiration_timeout: Duration,
    pub capabilities: HandleCapabilities,
    /// Attempts per operation when Redis is unreachable.
    pub max_retries: u32,
    pub retry_timeout: Duration,
}

impl RedisHandleOptions {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            prefix: format!("tiercache:{name}"),
            name,
            expiration_mode: ExpirationMode::None,
            expiration_timeout: Duration::ZERO,
            capabilities: HandleCapabilities::distributed(),
            max_retries: 5,
            retry_timeout: Duration::from_millis(100),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
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

    pub fn with_retries(mut self, max_retries: u32, retry_timeout: Duration) -> Self {
        self.max_retries = max_retries.max(1);
        self.retry_timeout = retry_timeout;
        self
    }
}

/// Distributed cache tier backed by Redis.
pub struct RedisCacheHandle<V, S = JsonSerializer> {
    pool: Pool,
    serializer: S,
    options: RedisHandleOptions,
    add_script: Script,
    put_script: Script,
    cas_script: Script,
    _value: PhantomData<fn() -> V>,
}

impl<V> RedisCacheHandle<V, JsonSerializer>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// A handle storing items as JSON.
    pub fn new(pool: Pool, options: RedisHandleOptions) -> Self {
        Self::with_serializer(pool, JsonSerializer, options)
    }
}

impl<V, S> RedisCacheHandle<V, S>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    S: CacheSerializer,
{
    pub fn with_serializer(pool: Pool, serializer: S, options: RedisHandleOptions) -> Self {
        Self {
            pool,
            serializer,
            options,
            add_script: Script::new(ADD_SCRIPT),
            put_script: Script::new(PUT_SCRIPT),
            cas_script: Script::new(CAS_SCRIPT),
            _value: PhantomData,
        }
    }

    pub fn options(&self) -> &RedisHandleOptions {
        &self.options
    }

    fn unavailable(&self, e: impl std::fmt::Display) -> CacheError {
        CacheError::tier_unavailable(&self.options.name, e.to_string())
    }

    async fn connection(&self) -> CacheResult<deadpool_redis::Connection> {
        self.pool.get().await.map_err(|e| self.unavailable(e))
    }

    /// Runs `op`, retrying transient failures.
    async fn retry<T, F, Fut>(&self, operation: &'static str, op: F) -> CacheResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = CacheResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Err(e) if e.is_transient() && attempt < self.options.max_retries => {
                    tracing::warn!(
                        tier = %self.options.name,
                        operation,
                        attempt,
                        error = %e,
                        "Redis operation failed, retrying"
                    );
                    tokio::time::sleep(self.options.retry_timeout).await;
                }
                other => return other,
            }
        }
    }

    fn encode(&self, item: &CacheItem<V>) -> CacheResult<(Vec<u8>, u64)> {
        let bytes = self.serializer.serialize_cache_item(item)?;
        Ok((bytes, ttl_millis(item)))
    }

    fn prepare(&self, item: CacheItem<V>) -> CacheResult<CacheItem<V>> {
        let item = item.with_default_expiration(
            self.options.expiration_mode,
            self.options.expiration_timeout,
        );
        if item.expiration_mode() != ExpirationMode::None && item.expiration_timeout().is_zero() {
            return Err(CacheError::configuration(format!(
                "tier '{}' expiration timeout must be positive",
                self.options.name
            )));
        }
        Ok(item)
    }

    async fn add_once(&self, redis_key: &str, bytes: &[u8], ttl: u64) -> CacheResult<bool> {
        let mut conn = self.connection().await?;
        let added: i64 = self
            .add_script
            .key(redis_key)
            .arg(bytes)
            .arg(ttl)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.unavailable(e))?;
        Ok(added == 1)
    }

    async fn put_once(&self, redis_key: &str, bytes: &[u8], ttl: u64) -> CacheResult<()> {
        let mut conn = self.connection().await?;
        let _version: i64 = self
            .put_script
            .key(redis_key)
            .arg(bytes)
            .arg(ttl)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.unavailable(e))?;
        Ok(())
    }

    async fn cas_once(
        &self,
        redis_key: &str,
        bytes: &[u8],
        ttl: u64,
        expected: Version,
    ) -> CacheResult<i64> {
        let mut conn = self.connection().await?;
        self.cas_script
            .key(redis_key)
            .arg(bytes)
            .arg(ttl)
            .arg(expected.get())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.unavailable(e))
    }

    async fn read_once(&self, redis_key: &str) -> CacheResult<(Option<Vec<u8>>, Option<u64>)> {
        let mut conn = self.connection().await?;
        let (item, version): (Option<Vec<u8>>, Option<u64>) = redis::cmd("HMGET")
            .arg(redis_key)
            .arg("item")
            .arg("version")
            .query_async(&mut conn)
            .await
            .map_err(|e| self.unavailable(e))?;
        Ok((item, version))
    }

    async fn touch_once(&self, redis_key: &str, ttl: u64) -> CacheResult<()> {
        let mut conn = self.connection().await?;
        let _: bool = conn
            .pexpire(redis_key, ttl as i64)
            .await
            .map_err(|e| self.unavailable(e))?;
        Ok(())
    }

    async fn delete_once(&self, redis_keys: &[String]) -> CacheResult<u64> {
        if redis_keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        conn.del::<_, u64>(redis_keys.to_vec())
            .await
            .map_err(|e| self.unavailable(e))
    }

    async fn exists_once(&self, redis_key: &str) -> CacheResult<bool> {
        let mut conn = self.connection().await?;
        conn.exists::<_, bool>(redis_key)
            .await
            .map_err(|e| self.unavailable(e))
    }

    async fn scan_once(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let mut conn = self.connection().await?;
        let mut cursor = 0u64;
        let mut found = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| self.unavailable(e))?;
            found.extend(batch);
            if next == 0 {
                return Ok(found);
            }
            cursor = next;
        }
    }

    async fn delete_matching(&self, pattern: &str) -> CacheResult<u64> {
        let found = self.retry("scan", || self.scan_once(pattern)).await?;
        let mut deleted = 0;
        for batch in found.chunks(SCAN_BATCH) {
            deleted += self.retry("del", || self.delete_once(batch)).await?;
        }
        Ok(deleted)
    }

    async fn read(&self, key: &CacheKey) -> CacheResult<Option<Versioned<V>>> {
        let redis_key = keys::item_key(&self.options.prefix, key);
        let (bytes, version) = self.retry("get", || self.read_once(&redis_key)).await?;
        let (Some(bytes), Some(version)) = (bytes, version) else {
            return Ok(None);
        };

        let item: CacheItem<V> = self.serializer.deserialize_cache_item(&bytes)?;
        // Sliding items are only refreshed through PEXPIRE, so Redis owns their TTL.
        if item.expiration_mode() == ExpirationMode::Absolute && item.is_expired() {
            return Ok(None);
        }
        let item = if item.expiration_mode() == ExpirationMode::Sliding {
            let ttl = ttl_millis(&item);
            if ttl > 0 {
                self.retry("pexpire", || self.touch_once(&redis_key, ttl)).await?;
            }
            item.touched()
        } else {
            item
        };

        Ok(Some(Versioned {
            item,
            version: Version::new(version),
        }))
    }
}

/// Longest TTL handed to the server; anything beyond is stored without one.
const MAX_TTL_MS: u128 = (i64::MAX / 2) as u128;

/// Milliseconds until the item should expire, 0 for no expiration.
fn ttl_millis(item: &CacheItem<impl Sized>) -> u64 {
    match item.expiration_mode() {
        ExpirationMode::None => 0,
        ExpirationMode::Sliding => {
            let ms = item.expiration_timeout().as_millis();
            if ms > MAX_TTL_MS { 0 } else { ms.max(1) as u64 }
        }
        ExpirationMode::Absolute => match item.expires_at() {
            None => 0,
            Some(at) => {
                let remaining = (at - OffsetDateTime::now_utc()).whole_milliseconds();
                if remaining > MAX_TTL_MS as i128 {
                    0
                } else {
                    remaining.max(1) as u64
                }
            }
        },
    }
}

#[async_trait]
impl<V, S> CacheHandle<V> for RedisCacheHandle<V, S>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    S: CacheSerializer,
{
    fn name(&self) -> &str {
        &self.options.name
    }

    fn capabilities(&self) -> HandleCapabilities {
        self.options.capabilities
    }

    async fn add(&self, item: CacheItem<V>) -> CacheResult<bool> {
        let item = self.prepare(item)?;
        let redis_key = keys::item_key(&self.options.prefix, item.key());
        let (bytes, ttl) = self.encode(&item)?;
        let added = self
            .retry("add", || self.add_once(&redis_key, &bytes, ttl))
            .await?;
        tracing::debug!(tier = %self.options.name, key = %item.key(), added, "redis add");
        Ok(added)
    }

    async fn put(&self, item: CacheItem<V>) -> CacheResult<()> {
        let item = self.prepare(item)?;
        let redis_key = keys::item_key(&self.options.prefix, item.key());
        let (bytes, ttl) = self.encode(&item)?;
        self.retry("put", || self.put_once(&redis_key, &bytes, ttl))
            .await?;
        tracing::debug!(tier = %self.options.name, key = %item.key(), ttl_ms = ttl, "redis put");
        Ok(())
    }

    async fn get(&self, key: &CacheKey) -> CacheResult<Option<CacheItem<V>>> {
        Ok(self.read(key).await?.map(|v| v.item))
    }

    async fn remove(&self, key: &CacheKey) -> CacheResult<bool> {
        let redis_key = [keys::item_key(&self.options.prefix, key)];
        let deleted = self
            .retry("del", || self.delete_once(&redis_key))
            .await?;
        Ok(deleted > 0)
    }

    async fn clear(&self) -> CacheResult<()> {
        let deleted = self
            .delete_matching(&keys::all_pattern(&self.options.prefix))
            .await?;
        tracing::debug!(tier = %self.options.name, deleted, "redis tier cleared");
        Ok(())
    }

    async fn clear_region(&self, region: &str) -> CacheResult<()> {
        let deleted = self
            .delete_matching(&keys::region_pattern(&self.options.prefix, region))
            .await?;
        tracing::debug!(tier = %self.options.name, region, deleted, "redis region cleared");
        Ok(())
    }

    async fn count(&self) -> CacheResult<u64> {
        let pattern = keys::all_pattern(&self.options.prefix);
        let found = self.retry("scan", || self.scan_once(&pattern)).await?;
        Ok(found.len() as u64)
    }

    async fn exists(&self, key: &CacheKey) -> CacheResult<bool> {
        let redis_key = keys::item_key(&self.options.prefix, key);
        self.retry("exists", || self.exists_once(&redis_key)).await
    }

    async fn get_versioned(&self, key: &CacheKey) -> CacheResult<Option<Versioned<V>>> {
        self.read(key).await
    }

    async fn compare_and_swap(
        &self,
        item: CacheItem<V>,
        expected: Version,
    ) -> CacheResult<CasOutcome> {
        let item = self.prepare(item)?;
        let redis_key = keys::item_key(&self.options.prefix, item.key());
        let (bytes, ttl) = self.encode(&item)?;
        let result = self
            .retry("cas", || self.cas_once(&redis_key, &bytes, ttl, expected))
            .await?;
        Ok(match result {
            -1 => CasOutcome::Missing,
            0 => CasOutcome::Conflict,
            version => CasOutcome::Stored(Version::new(version as u64)),
        })
    }
}
