//! Cache manager configuration.
//!
//! Loaded from an optional TOML file and `TIERCACHE__*` environment
//! overrides, e.g. `TIERCACHE__MAX_RETRIES=10`.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tiercache_core::{CacheError, ExpirationMode};
use tiercache_core::update::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_TIMEOUT};

/// Errors raised while loading or checking configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config build error: {0}")]
    Build(String),

    #[error("config deserialize error: {0}")]
    Deserialize(String),

    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl From<ConfigError> for CacheError {
    fn from(e: ConfigError) -> Self {
        CacheError::configuration(e.to_string())
    }
}

/// How writes propagate through the tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    /// Write to the nearest tier only; farther tiers catch up through eviction.
    Up,
    /// Write to every tier.
    #[default]
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheManagerConfig {
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default)]
    pub update_mode: UpdateMode,

    /// Attempts allowed for optimistic updates
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Wait between attempts after a transient failure, in milliseconds
    #[serde(default = "default_retry_timeout_ms")]
    pub retry_timeout_ms: u64,

    /// Tiers, nearest first
    #[serde(default)]
    pub tiers: Vec<TierConfig>,

    #[serde(default)]
    pub backplane: Option<BackplaneConfig>,
}

fn default_name() -> String {
    "default".to_string()
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_timeout_ms() -> u64 {
    DEFAULT_RETRY_TIMEOUT.as_millis() as u64
}

impl Default for CacheManagerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            update_mode: UpdateMode::default(),
            max_retries: default_max_retries(),
            retry_timeout_ms: default_retry_timeout_ms(),
            tiers: Vec::new(),
            backplane: None,
        }
    }
}

/// One tier of the stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub name: String,

    /// Factory name in the [`TierRegistry`](crate::TierRegistry), e.g. "memory" or "redis"
    pub kind: String,

    /// Default policy for items that do not set their own
    #[serde(default)]
    pub expiration_mode: ExpirationMode,

    #[serde(default)]
    pub expiration_timeout_ms: u64,

    /// Capability overrides; the tier's own defaults apply when unset
    #[serde(default)]
    pub supports_regions: Option<bool>,
    #[serde(default)]
    pub atomic_updates: Option<bool>,
    #[serde(default)]
    pub is_distributed: Option<bool>,

    /// Redis connection URL
    #[serde(default)]
    pub url: Option<String>,

    /// Redis key prefix, defaults to "tiercache:{name}"
    #[serde(default)]
    pub prefix: Option<String>,

    #[serde(default)]
    pub pool_size: Option<usize>,

    /// Value codec for tiers storing bytes: "json" or "msgpack"
    #[serde(default = "default_serializer")]
    pub serializer: String,

    /// Capacity bound for in-process tiers
    #[serde(default)]
    pub max_entries: Option<usize>,

    /// Sweep interval for expired in-process items, in milliseconds
    #[serde(default)]
    pub cleanup_interval_ms: Option<u64>,
}

fn default_serializer() -> String {
    "json".to_string()
}

impl TierConfig {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            expiration_mode: ExpirationMode::None,
            expiration_timeout_ms: 0,
            supports_regions: None,
            atomic_updates: None,
            is_distributed: None,
            url: None,
            prefix: None,
            pool_size: None,
            serializer: default_serializer(),
            max_entries: None,
            cleanup_interval_ms: None,
        }
    }

    pub fn expiration_timeout(&self) -> Duration {
        Duration::from_millis(self.expiration_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackplaneConfig {
    /// Transport factory name, e.g. "redis" or "memory"
    #[serde(default = "default_backplane_kind")]
    pub kind: String,

    #[serde(default = "default_channel")]
    pub channel: String,

    #[serde(default)]
    pub url: Option<String>,

    /// Outbound messages held before the queue collapses into a full clear
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Messages per published chunk
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,

    /// Time to gather a batch before publishing, in milliseconds
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Initial reconnect delay, doubled on each failure
    #[serde(default = "default_reconnect_min_ms")]
    pub reconnect_min_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

fn default_backplane_kind() -> String {
    "redis".to_string()
}

fn default_channel() -> String {
    "tiercache:backplane".to_string()
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_max_batch() -> usize {
    256
}

fn default_flush_interval_ms() -> u64 {
    10
}

fn default_reconnect_min_ms() -> u64 {
    1000
}

fn default_reconnect_max_ms() -> u64 {
    300_000
}

impl Default for BackplaneConfig {
    fn default() -> Self {
        Self {
            kind: default_backplane_kind(),
            channel: default_channel(),
            url: None,
            queue_capacity: default_queue_capacity(),
            max_batch: default_max_batch(),
            flush_interval_ms: default_flush_interval_ms(),
            reconnect_min_ms: default_reconnect_min_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

impl CacheManagerConfig {
    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_timeout_ms)
    }

    /// Parses a TOML document and validates it.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(s).map_err(|e| ConfigError::Deserialize(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tiers.is_empty() {
            return Err(ConfigError::Validation("at least one tier is required".into()));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Validation("max_retries must be > 0".into()));
        }
        if self.retry_timeout_ms == 0 {
            return Err(ConfigError::Validation("retry_timeout_ms must be > 0".into()));
        }

        let mut names = HashSet::new();
        for tier in &self.tiers {
            if tier.name.is_empty() {
                return Err(ConfigError::Validation("tier name must not be empty".into()));
            }
            if !names.insert(tier.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate tier name '{}'",
                    tier.name
                )));
            }
            if tier.kind.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "tier '{}' has no kind",
                    tier.name
                )));
            }
            if tier.expiration_mode != ExpirationMode::None && tier.expiration_timeout_ms == 0 {
                return Err(ConfigError::Validation(format!(
                    "tier '{}' expiration_timeout_ms must be > 0 when expiration_mode is set",
                    tier.name
                )));
            }
            if tier.max_entries == Some(0) {
                return Err(ConfigError::Validation(format!(
                    "tier '{}' max_entries must be > 0",
                    tier.name
                )));
            }
            let codecs = ["json", "msgpack"];
            if !codecs.contains(&tier.serializer.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "tier '{}' serializer must be one of {codecs:?}",
                    tier.name
                )));
            }
        }

        if let Some(bp) = &self.backplane {
            if bp.channel.is_empty() {
                return Err(ConfigError::Validation("backplane.channel must not be empty".into()));
            }
            if bp.queue_capacity == 0 || bp.max_batch == 0 {
                return Err(ConfigError::Validation(
                    "backplane.queue_capacity and backplane.max_batch must be > 0".into(),
                ));
            }
            if bp.reconnect_min_ms == 0 || bp.reconnect_min_ms > bp.reconnect_max_ms {
                return Err(ConfigError::Validation(
                    "backplane reconnect delays must satisfy 0 < reconnect_min_ms <= reconnect_max_ms"
                        .into(),
                ));
            }
        }
        Ok(())
    }
}

/// Loads configuration from `path` (if it exists) and the environment.
///
/// Environment variables use the `TIERCACHE` prefix and `__` as separator.
pub fn load_config(path: Option<&Path>) -> Result<CacheManagerConfig, ConfigError> {
    let mut builder = Config::builder();
    if let Some(p) = path {
        if p.exists() {
            builder = builder.add_source(File::from(p));
        }
    }
    builder = builder.add_source(
        Environment::with_prefix("TIERCACHE")
            .try_parsing(true)
            .separator("__"),
    );
    let cfg = builder
        .build()
        .map_err(|e| ConfigError::Build(e.to_string()))?;
    let merged: CacheManagerConfig = cfg
        .try_deserialize()
        .map_err(|e| ConfigError::Deserialize(e.to_string()))?;
    merged.validate()?;
    Ok(merged)
}
