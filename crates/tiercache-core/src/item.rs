//! The value wrapper stored in every tier.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::CacheError;
use crate::key::CacheKey;
use crate::CacheResult;

/// How an item expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpirationMode {
    /// Never expires on its own.
    #[default]
    None,
    /// Expires a fixed time after creation.
    Absolute,
    /// Expires a fixed time after the last access.
    Sliding,
}

impl ExpirationMode {
    pub fn as_byte(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Absolute => 1,
            Self::Sliding => 2,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::None),
            1 => Some(Self::Absolute),
            2 => Some(Self::Sliding),
            _ => None,
        }
    }
}

/// A cached value together with its key and expiration policy.
///
/// Items are never mutated once handed to a tier. Every `with_*` method
/// returns a new instance so concurrent readers always see a complete item.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheItem<V> {
    key: CacheKey,
    value: V,
    expiration_mode: ExpirationMode,
    expiration_timeout: Duration,
    created_utc: OffsetDateTime,
    last_accessed_utc: OffsetDateTime,
    uses_expiration_defaults: bool,
}

impl<V> CacheItem<V> {
    /// Creates an item that inherits the expiration defaults of whatever tier stores it.
    pub fn new(key: CacheKey, value: V) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            key,
            value,
            expiration_mode: ExpirationMode::None,
            expiration_timeout: Duration::ZERO,
            created_utc: now,
            last_accessed_utc: now,
            uses_expiration_defaults: true,
        }
    }

    /// Creates an item with an explicit expiration policy.
    pub fn with_expiration(
        key: CacheKey,
        value: V,
        mode: ExpirationMode,
        timeout: Duration,
    ) -> CacheResult<Self> {
        validate_expiration(mode, timeout)?;
        let mut item = Self::new(key, value);
        item.expiration_mode = mode;
        item.expiration_timeout = if mode == ExpirationMode::None {
            Duration::ZERO
        } else {
            timeout
        };
        item.uses_expiration_defaults = false;
        Ok(item)
    }

    /// Rebuilds an item from stored parts, as a serializer does.
    pub fn from_parts(
        key: CacheKey,
        value: V,
        expiration_mode: ExpirationMode,
        expiration_timeout: Duration,
        created_utc: OffsetDateTime,
        last_accessed_utc: OffsetDateTime,
        uses_expiration_defaults: bool,
    ) -> Self {
        Self {
            key,
            value,
            expiration_mode,
            expiration_timeout,
            created_utc,
            last_accessed_utc,
            uses_expiration_defaults,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn into_value(self) -> V {
        self.value
    }

    pub fn expiration_mode(&self) -> ExpirationMode {
        self.expiration_mode
    }

    pub fn expiration_timeout(&self) -> Duration {
        self.expiration_timeout
    }

    pub fn created_utc(&self) -> OffsetDateTime {
        self.created_utc
    }

    pub fn last_accessed_utc(&self) -> OffsetDateTime {
        self.last_accessed_utc
    }

    pub fn uses_expiration_defaults(&self) -> bool {
        self.uses_expiration_defaults
    }

    /// Same entry with a new value. Creation time is kept, access time refreshed.
    #[must_use]
    pub fn with_value(&self, value: V) -> Self {
        Self {
            key: self.key.clone(),
            value,
            expiration_mode: self.expiration_mode,
            expiration_timeout: self.expiration_timeout,
            created_utc: self.created_utc,
            last_accessed_utc: OffsetDateTime::now_utc(),
            uses_expiration_defaults: self.uses_expiration_defaults,
        }
    }

    /// Same item stored under another key (used for region flattening).
    #[must_use]
    pub fn with_key(&self, key: CacheKey) -> Self
    where
        V: Clone,
    {
        Self {
            key,
            ..self.clone()
        }
    }

    /// Same item with its own expiration policy, no longer following tier defaults.
    pub fn with_expiration_policy(&self, mode: ExpirationMode, timeout: Duration) -> CacheResult<Self>
    where
        V: Clone,
    {
        validate_expiration(mode, timeout)?;
        Ok(Self {
            expiration_mode: mode,
            expiration_timeout: if mode == ExpirationMode::None {
                Duration::ZERO
            } else {
                timeout
            },
            uses_expiration_defaults: false,
            ..self.clone()
        })
    }

    /// Applies a tier's default policy if the item asked to inherit it.
    #[must_use]
    pub fn with_default_expiration(self, mode: ExpirationMode, timeout: Duration) -> Self {
        if !self.uses_expiration_defaults {
            return self;
        }
        Self {
            expiration_mode: mode,
            expiration_timeout: timeout,
            ..self
        }
    }

    /// Same item with its access time set to now.
    #[must_use]
    pub fn touched(&self) -> Self
    where
        V: Clone,
    {
        Self {
            last_accessed_utc: OffsetDateTime::now_utc(),
            ..self.clone()
        }
    }

    /// Instant the item lapses. `None` if it never does, including when the
    /// timeout reaches past the representable date range.
    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        let from = match self.expiration_mode {
            ExpirationMode::None => return None,
            ExpirationMode::Absolute => self.created_utc,
            ExpirationMode::Sliding => self.last_accessed_utc,
        };
        let timeout = time::Duration::try_from(self.expiration_timeout).ok()?;
        from.checked_add(timeout)
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at().is_some_and(|at| at <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }
}

fn validate_expiration(mode: ExpirationMode, timeout: Duration) -> CacheResult<()> {
    if mode != ExpirationMode::None && timeout.is_zero() {
        return Err(CacheError::invalid_key(format!(
            "expiration mode {mode:?} requires a non-zero timeout"
        )));
    }
    Ok(())
}
