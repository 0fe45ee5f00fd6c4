//! Redis key layout.
//!
//! ```text
//! {prefix}:k:{key}             item without region
//! {prefix}:r:{region}:{key}    item in a region
//! ```
//!
//! `:` and `%` in region names are percent-encoded so the region segment
//! never contains the separator.

use tiercache_core::CacheKey;

pub(crate) fn item_key(prefix: &str, key: &CacheKey) -> String {
    match key.region() {
        Some(region) => format!("{prefix}:r:{}:{}", encode_region(region), key.key()),
        None => format!("{prefix}:k:{}", key.key()),
    }
}

/// SCAN pattern matching every item under `prefix`.
pub(crate) fn all_pattern(prefix: &str) -> String {
    format!("{}:*", escape_glob(prefix))
}

/// SCAN pattern matching every item of `region`.
pub(crate) fn region_pattern(prefix: &str, region: &str) -> String {
    format!("{}:r:{}:*", escape_glob(prefix), escape_glob(&encode_region(region)))
}

fn encode_region(region: &str) -> String {
    region.replace('%', "%25").replace(':', "%3A")
}

fn escape_glob(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
