//! Cache keys and regions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::CacheResult;

/// Identity of a cache entry: a key, optionally scoped to a region.
///
/// The same key string in two regions (or in a region and outside of any
/// region) names two different entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    key: String,
    region: Option<String>,
}

impl CacheKey {
    /// Creates a validated key.
    ///
    /// The key must be non-empty; a region, when given, must be non-empty too.
    pub fn new(key: impl Into<String>, region: Option<&str>) -> CacheResult<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(CacheError::invalid_key("key must not be empty"));
        }
        if let Some(region) = region {
            validate_region(region)?;
        }
        Ok(Self {
            key,
            region: region.map(str::to_string),
        })
    }

    /// Creates a key outside of any region.
    pub fn plain(key: impl Into<String>) -> CacheResult<Self> {
        Self::new(key, None)
    }

    /// Creates a key inside `region`.
    pub fn in_region(key: impl Into<String>, region: &str) -> CacheResult<Self> {
        Self::new(key, Some(region))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    /// Folds the region into the key for tiers without native region support.
    ///
    /// The mapping is reversible: the region is escaped so it never contains
    /// `:`, and plain keys are escaped so they never contain one either.
    #[must_use]
    pub fn flattened(&self) -> Self {
        let key = match &self.region {
            Some(region) => format!("{}:{}", escape(region), self.key),
            None => escape(&self.key),
        };
        Self { key, region: None }
    }

    /// Inverse of [`flattened`](Self::flattened).
    #[must_use]
    pub fn unflattened(&self) -> Self {
        if self.region.is_some() {
            return self.clone();
        }
        match self.key.split_once(':') {
            Some((region, key)) => Self {
                key: key.to_string(),
                region: Some(unescape(region)),
            },
            None => Self {
                key: unescape(&self.key),
                region: None,
            },
        }
    }
}

fn escape(part: &str) -> String {
    part.replace('%', "%25").replace(':', "%3A")
}

fn unescape(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    let mut rest = part;
    while let Some(at) = rest.find('%') {
        out.push_str(&rest[..at]);
        let tail = &rest[at..];
        if let Some(after) = tail.strip_prefix("%3A") {
            out.push(':');
            rest = after;
        } else if let Some(after) = tail.strip_prefix("%25") {
            out.push('%');
            rest = after;
        } else {
            out.push('%');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.region {
            Some(region) => write!(f, "{region}:{}", self.key),
            None => write!(f, "{}", self.key),
        }
    }
}

/// Rejects empty region names.
pub fn validate_region(region: &str) -> CacheResult<()> {
    if region.is_empty() {
        return Err(CacheError::invalid_key("region must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_validation() {
        assert!(CacheKey::plain("").is_err());
        assert!(CacheKey::new("k", Some("")).is_err());
        assert!(CacheKey::new("k", Some("users")).is_ok());
    }

    #[test]
    fn test_regions_partition_keys() {
        let plain = CacheKey::plain("id").unwrap();
        let a = CacheKey::in_region("id", "a").unwrap();
        let b = CacheKey::in_region("id", "b").unwrap();
        assert_ne!(plain, a);
        assert_ne!(a, b);
    }

    #[test]
    fn test_flattened() {
        let key = CacheKey::in_region("id", "users").unwrap();
        let flat = key.flattened();
        assert_eq!(flat.key(), "users:id");
        assert_eq!(flat.region(), None);
        assert_eq!(key.to_string(), "users:id");
        assert_eq!(flat.unflattened(), key);

        let plain = CacheKey::plain("id").unwrap();
        assert_eq!(plain.flattened(), plain);
        assert_eq!(plain.flattened().unflattened(), plain);
    }

    #[test]
    fn test_flattened_keys_do_not_collide() {
        let regioned = CacheKey::in_region("x", "a").unwrap();
        let plain = CacheKey::plain("a:x").unwrap();
        assert_ne!(regioned.flattened(), plain.flattened());

        let nested = CacheKey::in_region("b:x", "a").unwrap();
        let colon_region = CacheKey::in_region("x", "a:b").unwrap();
        assert_ne!(nested.flattened(), colon_region.flattened());

        for key in [
            regioned,
            plain,
            nested,
            colon_region,
            CacheKey::in_region("50%", "r%3A").unwrap(),
            CacheKey::plain("%25:%").unwrap(),
        ] {
            assert_eq!(key.flattened().unflattened(), key);
        }
    }
}
