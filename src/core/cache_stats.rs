//! Per-job cache counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache statistics for monitoring performance
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    chunk_fetches: AtomicU64,
    prefetches: AtomicU64,
    stale: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Any chunk network fetch, prefetches included
    pub fn record_chunk_fetch(&self) {
        self.chunk_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_prefetch(&self) {
        self.prefetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale(&self) {
        self.stale.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            chunk_fetches: self.chunk_fetches.load(Ordering::Relaxed),
            prefetches: self.prefetches.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.chunk_fetches.store(0, Ordering::Relaxed);
        self.prefetches.store(0, Ordering::Relaxed);
        self.stale.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub chunk_fetches: u64,
    pub prefetches: u64,
    pub stale: u64,
}

impl CacheStatsSnapshot {
    pub fn total(&self) -> u64 {
        self.hits + self.misses
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 { 0.0 } else { self.hits as f64 / total as f64 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats::new();
        assert_eq!(stats.snapshot().hit_rate(), 0.0);
        stats.record_hit();
        stats.record_miss();
        stats.record_chunk_fetch();
        let snap = stats.snapshot();
        assert_eq!(snap.hit_rate(), 0.5);
        assert_eq!(snap.chunk_fetches, 1);

        stats.reset();
        assert_eq!(stats.snapshot(), CacheStatsSnapshot::default());
    }
}
