//! Metrics for tiercache.
//!
//! Thin helpers over the `metrics` facade. Nothing is recorded unless the
//! application installs a recorder (Prometheus exporter or similar).

use metrics::{counter, gauge};

/// Metric names as constants for consistency.
pub mod names {
    // Tier metrics
    pub const CACHE_HITS_TOTAL: &str = "tiercache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "tiercache_misses_total";
    pub const CACHE_BACKFILLS_TOTAL: &str = "tiercache_backfills_total";
    pub const CACHE_OPERATIONS_TOTAL: &str = "tiercache_operations_total";
    pub const CACHE_ENTRIES: &str = "tiercache_entries";
    pub const CACHE_EVICTIONS_TOTAL: &str = "tiercache_evictions_total";

    // Backplane metrics
    pub const BACKPLANE_SENT_TOTAL: &str = "tiercache_backplane_messages_sent_total";
    pub const BACKPLANE_RECEIVED_TOTAL: &str = "tiercache_backplane_messages_received_total";
    pub const BACKPLANE_DROPPED_TOTAL: &str = "tiercache_backplane_messages_dropped_total";
    pub const BACKPLANE_DECODE_ERRORS_TOTAL: &str = "tiercache_backplane_decode_errors_total";
    pub const BACKPLANE_SEND_FAILURES_TOTAL: &str = "tiercache_backplane_send_failures_total";
}

// =============================================================================
// Tier Metrics
// =============================================================================

/// Record a cache hit.
pub fn record_cache_hit(cache: &str, tier: &str) {
    counter!(names::CACHE_HITS_TOTAL, "cache" => cache.to_string(), "tier" => tier.to_string())
        .increment(1);
}

/// Record a cache miss.
pub fn record_cache_miss(cache: &str, tier: &str) {
    counter!(names::CACHE_MISSES_TOTAL, "cache" => cache.to_string(), "tier" => tier.to_string())
        .increment(1);
}

/// Record an item copied into a nearer tier after a read.
pub fn record_backfill(cache: &str, tier: &str) {
    counter!(names::CACHE_BACKFILLS_TOTAL, "cache" => cache.to_string(), "tier" => tier.to_string())
        .increment(1);
}

/// Record a public cache operation.
pub fn record_operation(cache: &str, operation: &'static str) {
    counter!(
        names::CACHE_OPERATIONS_TOTAL,
        "cache" => cache.to_string(),
        "operation" => operation
    )
    .increment(1);
}

/// Record an item a tier dropped on its own.
pub fn record_eviction(cache: &str, tier: &str, reason: &str) {
    counter!(
        names::CACHE_EVICTIONS_TOTAL,
        "cache" => cache.to_string(),
        "tier" => tier.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Set the number of items held by a tier.
pub fn set_cache_entries(cache: &str, tier: &str, count: u64) {
    gauge!(names::CACHE_ENTRIES, "cache" => cache.to_string(), "tier" => tier.to_string())
        .set(count as f64);
}

// =============================================================================
// Backplane Metrics
// =============================================================================

pub fn record_backplane_sent(cache: &str, messages: usize) {
    counter!(names::BACKPLANE_SENT_TOTAL, "cache" => cache.to_string()).increment(messages as u64);
}

pub fn record_backplane_received(cache: &str) {
    counter!(names::BACKPLANE_RECEIVED_TOTAL, "cache" => cache.to_string()).increment(1);
}

/// Record outbound messages discarded because the queue overflowed.
pub fn record_backplane_dropped(cache: &str, messages: usize) {
    counter!(names::BACKPLANE_DROPPED_TOTAL, "cache" => cache.to_string())
        .increment(messages as u64);
}

pub fn record_backplane_decode_error(cache: &str) {
    counter!(names::BACKPLANE_DECODE_ERRORS_TOTAL, "cache" => cache.to_string()).increment(1);
}

pub fn record_backplane_send_failure(cache: &str) {
    counter!(names::BACKPLANE_SEND_FAILURES_TOTAL, "cache" => cache.to_string()).increment(1);
}
