//! Serializer contract for tiers that store bytes.
//!
//! Cache items are written as an envelope: item metadata plus a type tag and
//! the value encoded separately. The tag is checked on the way back so a
//! payload written for one value type is never silently decoded as another.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::CacheError;
use crate::item::{CacheItem, ExpirationMode};
use crate::key::CacheKey;
use crate::CacheResult;

/// Encodes values and cache items to bytes.
pub trait CacheSerializer: Send + Sync + 'static {
    /// Short codec name for logs.
    fn name(&self) -> &'static str;

    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> CacheResult<Vec<u8>>;

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> CacheResult<T>;

    fn serialize_cache_item<V: Serialize>(&self, item: &CacheItem<V>) -> CacheResult<Vec<u8>> {
        let envelope = ItemEnvelope {
            value_type: std::any::type_name::<V>().to_string(),
            key: item.key().key().to_string(),
            region: item.key().region().map(str::to_string),
            expiration_mode: item.expiration_mode(),
            expiration_timeout_ms: item.expiration_timeout().as_millis() as u64,
            created_utc: item.created_utc(),
            last_accessed_utc: item.last_accessed_utc(),
            uses_expiration_defaults: item.uses_expiration_defaults(),
            payload: self.serialize(item.value())?,
        };
        self.serialize(&envelope)
    }

    fn deserialize_cache_item<V: DeserializeOwned>(&self, bytes: &[u8]) -> CacheResult<CacheItem<V>> {
        let envelope: ItemEnvelope = self.deserialize(bytes)?;
        let expected = std::any::type_name::<V>();
        if envelope.value_type != expected {
            return Err(CacheError::serialization(format!(
                "stored value type '{}' does not match requested type '{expected}'",
                envelope.value_type
            )));
        }
        let key = CacheKey::new(envelope.key, envelope.region.as_deref())?;
        let value: V = self.deserialize(&envelope.payload)?;
        Ok(CacheItem::from_parts(
            key,
            value,
            envelope.expiration_mode,
            Duration::from_millis(envelope.expiration_timeout_ms),
            envelope.created_utc,
            envelope.last_accessed_utc,
            envelope.uses_expiration_defaults,
        ))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ItemEnvelope {
    value_type: String,
    key: String,
    region: Option<String>,
    expiration_mode: ExpirationMode,
    expiration_timeout_ms: u64,
    #[serde(with = "time::serde::rfc3339")]
    created_utc: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    last_accessed_utc: OffsetDateTime,
    uses_expiration_defaults: bool,
    payload: Vec<u8>,
}

/// JSON codec (serde_json).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl CacheSerializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> CacheResult<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> CacheResult<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Compact binary codec (MessagePack via rmp-serde).
#[derive(Debug, Clone, Copy, Default)]
pub struct MessagePackSerializer;

impl CacheSerializer for MessagePackSerializer {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> CacheResult<Vec<u8>> {
        rmp_serde::to_vec_named(value).map_err(|e| CacheError::serialization(e.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> CacheResult<T> {
        rmp_serde::from_slice(bytes).map_err(|e| CacheError::serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        visits: u32,
    }

    fn sample() -> CacheItem<Profile> {
        CacheItem::with_expiration(
            CacheKey::in_region("user:1", "profiles").unwrap(),
            Profile {
                name: "ada".into(),
                visits: 3,
            },
            ExpirationMode::Sliding,
            Duration::from_secs(30),
        )
        .unwrap()
    }

    fn assert_item_survives<S: CacheSerializer>(serializer: S) {
        let item = sample();
        let bytes = serializer.serialize_cache_item(&item).unwrap();
        let back: CacheItem<Profile> = serializer.deserialize_cache_item(&bytes).unwrap();

        assert_eq!(back.key(), item.key());
        assert_eq!(back.value(), item.value());
        assert_eq!(back.expiration_mode(), ExpirationMode::Sliding);
        assert_eq!(back.expiration_timeout(), Duration::from_secs(30));
        assert!(!back.uses_expiration_defaults());
        assert_eq!(
            back.created_utc().unix_timestamp(),
            item.created_utc().unix_timestamp()
        );
    }

    #[test]
    fn test_json_cache_item() {
        assert_item_survives(JsonSerializer);
    }

    #[test]
    fn test_msgpack_cache_item() {
        assert_item_survives(MessagePackSerializer);
    }

    #[test]
    fn test_type_tag_mismatch_is_rejected() {
        let bytes = JsonSerializer.serialize_cache_item(&sample()).unwrap();
        let err = JsonSerializer
            .deserialize_cache_item::<String>(&bytes)
            .unwrap_err();
        assert!(matches!(err, CacheError::Serialization { .. }));
    }

    #[test]
    fn test_garbage_is_serialization_error() {
        let err = MessagePackSerializer
            .deserialize::<Profile>(b"\xc1\xc1")
            .unwrap_err();
        assert!(matches!(err, CacheError::Serialization { .. }));
    }
}
