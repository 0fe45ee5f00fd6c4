//! Integration tests for the Redis tier and backplane transport.
//!
//! Tests use testcontainers to spin up a real Redis instance, so they need
//! Docker and are ignored by default: `cargo test -- --ignored`.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tiercache_core::backplane::BackplaneTransport;
use tiercache_core::{
    CacheHandle, CacheItem, CacheKey, CasOutcome, ExpirationMode, MessagePackSerializer,
    UpdateCoordinator,
};
use tiercache_redis::{
    RedisBackplaneTransport, RedisCacheHandle, RedisHandleOptions, RedisPoolConfig, create_pool,
};
use tokio::sync::OnceCell;

// Shared Redis container for all tests
static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

/// Get or create the shared Redis container
async fn get_redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");

            let host_port = container.get_host_port_ipv4(6379).await.expect("get port");
            let url = format!("redis://127.0.0.1:{}", host_port);

            (container, url)
        })
        .await;

    url.clone()
}

/// Each test gets its own key prefix so they can share one server.
async fn handle(prefix: &str) -> RedisCacheHandle<i64> {
    let pool = create_pool(&RedisPoolConfig::from_url(get_redis_url().await))
        .await
        .expect("create pool");
    RedisCacheHandle::new(pool, RedisHandleOptions::new("shared").with_prefix(prefix))
}

fn key(k: &str) -> CacheKey {
    CacheKey::plain(k).unwrap()
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_add_put_get_remove() {
    let tier = handle("t-basic").await;

    assert!(tier.add(CacheItem::new(key("a"), 1)).await.unwrap());
    assert!(!tier.add(CacheItem::new(key("a"), 2)).await.unwrap());
    assert_eq!(*tier.get(&key("a")).await.unwrap().unwrap().value(), 1);

    tier.put(CacheItem::new(key("a"), 3)).await.unwrap();
    assert_eq!(*tier.get(&key("a")).await.unwrap().unwrap().value(), 3);
    assert!(tier.exists(&key("a")).await.unwrap());

    assert!(tier.remove(&key("a")).await.unwrap());
    assert!(!tier.remove(&key("a")).await.unwrap());
    assert!(tier.get(&key("a")).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_compare_and_swap_detects_conflicts() {
    let tier = handle("t-cas").await;
    tier.put(CacheItem::new(key("c"), 10)).await.unwrap();

    let read = tier.get_versioned(&key("c")).await.unwrap().unwrap();
    let first = tier
        .compare_and_swap(read.item.with_value(11), read.version)
        .await
        .unwrap();
    assert!(matches!(first, CasOutcome::Stored(_)));

    let stale = tier
        .compare_and_swap(read.item.with_value(12), read.version)
        .await
        .unwrap();
    assert_eq!(stale, CasOutcome::Conflict);

    tier.remove(&key("c")).await.unwrap();
    let gone = tier
        .compare_and_swap(read.item.with_value(13), read.version)
        .await
        .unwrap();
    assert_eq!(gone, CasOutcome::Missing);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires Docker"]
async fn test_concurrent_updates_converge() {
    let tier = Arc::new(handle("t-update").await);
    tier.put(CacheItem::new(key("counter"), 0)).await.unwrap();
    let coordinator = Arc::new(UpdateCoordinator::default());

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let tier = Arc::clone(&tier);
        let coordinator = Arc::clone(&coordinator);
        tasks.push(tokio::spawn(async move {
            for _ in 0..25 {
                let result = coordinator
                    .update(tier.as_ref(), &key("counter"), |v: &i64| Some(v + 1), None)
                    .await
                    .unwrap();
                assert!(result.success());
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(*tier.get(&key("counter")).await.unwrap().unwrap().value(), 100);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_regions_clear_independently() {
    let tier = handle("t-region").await;
    let a = CacheKey::in_region("id", "a").unwrap();
    let ab = CacheKey::in_region("id", "a:b").unwrap();
    tier.put(CacheItem::new(a.clone(), 1)).await.unwrap();
    tier.put(CacheItem::new(ab.clone(), 2)).await.unwrap();
    tier.put(CacheItem::new(key("id"), 3)).await.unwrap();
    assert_eq!(tier.count().await.unwrap(), 3);

    tier.clear_region("a").await.unwrap();
    assert!(!tier.exists(&a).await.unwrap());
    assert!(tier.exists(&ab).await.unwrap());
    assert!(tier.exists(&key("id")).await.unwrap());

    tier.clear().await.unwrap();
    assert_eq!(tier.count().await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_absolute_expiration() {
    let tier = handle("t-expire").await;
    let item = CacheItem::with_expiration(
        key("short"),
        1,
        ExpirationMode::Absolute,
        Duration::from_millis(100),
    )
    .unwrap();
    tier.put(item).await.unwrap();
    assert!(tier.get(&key("short")).await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(tier.get(&key("short")).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_msgpack_serializer() {
    let pool = create_pool(&RedisPoolConfig::from_url(get_redis_url().await))
        .await
        .unwrap();
    let tier: RedisCacheHandle<String, MessagePackSerializer> = RedisCacheHandle::with_serializer(
        pool,
        MessagePackSerializer,
        RedisHandleOptions::new("packed").with_prefix("t-msgpack"),
    );
    tier.put(CacheItem::new(key("s"), "hello".to_string()))
        .await
        .unwrap();
    assert_eq!(tier.get(&key("s")).await.unwrap().unwrap().value(), "hello");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_backplane_transport_roundtrip() {
    let url = get_redis_url().await;
    let pool = create_pool(&RedisPoolConfig::from_url(url.clone()))
        .await
        .unwrap();
    let transport = RedisBackplaneTransport::new(pool, url, "tiercache:test-backplane");

    let mut stream = transport.subscribe().await.unwrap();
    transport
        .publish(Bytes::from_static(b"\x00\x00\x00\x00"))
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("message within timeout")
        .expect("stream open");
    assert_eq!(received, Bytes::from_static(b"\x00\x00\x00\x00"));
}
