//! Configuration files and managers assembled from them.

use std::time::Duration;

use tempfile::TempDir;
use tiercache::{
    CacheHandle, CacheManager, CacheManagerConfig, ExpirationMode, MemoryBackplaneHub, TierRegistry,
    UpdateMode, load_config,
};

const CONFIG: &str = r#"
name = "catalog"
update_mode = "up"
max_retries = 7
retry_timeout_ms = 25

[[tiers]]
name = "local"
kind = "memory"
expiration_mode = "sliding"
expiration_timeout_ms = 60000
max_entries = 1000

[[tiers]]
name = "shared"
kind = "memory"
is_distributed = true

[backplane]
kind = "memory"
channel = "catalog-invalidation"
flush_interval_ms = 1
reconnect_min_ms = 10
reconnect_max_ms = 100
"#;

#[test]
fn test_load_config_from_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cache.toml");
    std::fs::write(&path, CONFIG).unwrap();

    let cfg = load_config(Some(&path)).unwrap();
    assert_eq!(cfg.name, "catalog");
    assert_eq!(cfg.update_mode, UpdateMode::Up);
    assert_eq!(cfg.max_retries, 7);
    assert_eq!(cfg.retry_timeout(), Duration::from_millis(25));
    assert_eq!(cfg.tiers.len(), 2);
    assert_eq!(cfg.tiers[0].expiration_mode, ExpirationMode::Sliding);
    assert_eq!(cfg.tiers[0].max_entries, Some(1000));
    assert_eq!(cfg.tiers[1].is_distributed, Some(true));

    let bp = cfg.backplane.unwrap();
    assert_eq!(bp.channel, "catalog-invalidation");
    assert_eq!(bp.queue_capacity, 1024);
    assert_eq!(bp.reconnect_max_ms, 100);
}

#[test]
fn test_load_config_without_tiers_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cache.toml");
    std::fs::write(&path, "name = \"bare\"\n").unwrap();

    assert!(load_config(Some(&path)).is_err());
}

#[test]
fn test_from_toml_str_rejects_unknown_serializer() {
    let err = CacheManagerConfig::from_toml_str(
        r#"
[[tiers]]
name = "shared"
kind = "redis"
serializer = "bincode"
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("serializer"));
}

#[tokio::test]
async fn test_manager_from_config() {
    let cfg = CacheManagerConfig::from_toml_str(CONFIG).unwrap();
    let mut registry = TierRegistry::<String>::with_defaults();
    registry.register_memory_hub(MemoryBackplaneHub::new());

    let cache = CacheManager::from_config(&cfg, &registry).await.unwrap();
    assert_eq!(cache.name(), "catalog");
    assert_eq!(cache.update_mode(), UpdateMode::Up);

    let handles = cache.handles();
    assert_eq!(handles.len(), 2);
    assert_eq!(handles[0].name(), "local");
    assert!(handles[1].capabilities().is_distributed);

    cache.put("sku-1", "widget".to_string(), None).await.unwrap();
    assert_eq!(
        cache.get("sku-1", None).await.unwrap().as_deref(),
        Some("widget")
    );
    // Up mode writes the nearest tier only.
    assert_eq!(cache.stats().await[1].items, 0);
    assert!(cache.backplane_stats().is_some());
    cache.shutdown().await;
}

#[tokio::test]
async fn test_from_config_with_unregistered_backplane_fails() {
    let cfg = CacheManagerConfig::from_toml_str(CONFIG).unwrap();
    let registry = TierRegistry::<String>::with_defaults();
    assert!(CacheManager::from_config(&cfg, &registry).await.is_err());
}
