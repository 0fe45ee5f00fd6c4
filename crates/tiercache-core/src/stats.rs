//! Per-tier statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counter kinds tracked for each tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatsCounter {
    Add,
    Put,
    Get,
    Hit,
    Miss,
    Remove,
    Clear,
    ClearRegion,
}

/// Lock-free counters for one tier.
#[derive(Debug, Default)]
pub struct CacheStats {
    adds: AtomicU64,
    puts: AtomicU64,
    gets: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    removes: AtomicU64,
    clears: AtomicU64,
    clear_regions: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, counter: StatsCounter) {
        self.counter(counter).fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, counter: StatsCounter) -> u64 {
        self.counter(counter).load(Ordering::Relaxed)
    }

    fn counter(&self, counter: StatsCounter) -> &AtomicU64 {
        match counter {
            StatsCounter::Add => &self.adds,
            StatsCounter::Put => &self.puts,
            StatsCounter::Get => &self.gets,
            StatsCounter::Hit => &self.hits,
            StatsCounter::Miss => &self.misses,
            StatsCounter::Remove => &self.removes,
            StatsCounter::Clear => &self.clears,
            StatsCounter::ClearRegion => &self.clear_regions,
        }
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self, tier: &str, position: usize, items: u64) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            tier: tier.to_string(),
            position,
            items,
            adds: self.get(StatsCounter::Add),
            puts: self.get(StatsCounter::Put),
            gets: self.get(StatsCounter::Get),
            hits: self.get(StatsCounter::Hit),
            misses: self.get(StatsCounter::Miss),
            removes: self.get(StatsCounter::Remove),
            clears: self.get(StatsCounter::Clear),
            clear_regions: self.get(StatsCounter::ClearRegion),
        }
    }
}

/// Cache statistics for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    /// Tier name.
    pub tier: String,
    /// Position in the tier list, 0 being the nearest.
    pub position: usize,
    /// Items currently held by the tier.
    pub items: u64,
    pub adds: u64,
    pub puts: u64,
    pub gets: u64,
    pub hits: u64,
    pub misses: u64,
    pub removes: u64,
    pub clears: u64,
    pub clear_regions: u64,
}

impl CacheStatsSnapshot {
    /// Calculate hit rate as a percentage.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}
