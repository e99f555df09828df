use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by both cache tiers and the warmer.
#[derive(Default)]
pub struct CacheMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub local_hits: AtomicU64,
    pub remote_hits: AtomicU64,
    pub inserts: AtomicU64,
    pub invalidations: AtomicU64,
    pub ttl_evictions: AtomicU64,
    pub lru_evictions: AtomicU64,
    pub remote_errors: AtomicU64,
    pub timeouts: AtomicU64,
    pub warm_runs: AtomicU64,
    pub warmed_entries: AtomicU64,
}

impl CacheMetrics {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            local_hits: self.local_hits.load(Ordering::Relaxed),
            remote_hits: self.remote_hits.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            ttl_evictions: self.ttl_evictions.load(Ordering::Relaxed),
            lru_evictions: self.lru_evictions.load(Ordering::Relaxed),
            remote_errors: self.remote_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            warm_runs: self.warm_runs.load(Ordering::Relaxed),
            warmed_entries: self.warmed_entries.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub local_hits: u64,
    pub remote_hits: u64,
    pub inserts: u64,
    pub invalidations: u64,
    pub ttl_evictions: u64,
    pub lru_evictions: u64,
    pub remote_errors: u64,
    pub timeouts: u64,
    pub warm_runs: u64,
    pub warmed_entries: u64,
}

impl CacheMetricsSnapshot {
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = self.hits as f64 / total as f64;
        rate
    }
}
