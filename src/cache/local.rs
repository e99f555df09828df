use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::RwLock;

use super::CacheEntry;
use crate::bench::{self, BenchEvent};
use super::metrics::CacheMetrics;
use super::pattern::glob_match;

struct Slot {
    entry: CacheEntry,
    expires_at: Instant,
}

/// In-process tier: capacity-bounded LRU whose entries also carry a deadline.
/// Expired entries are dropped lazily on access, by [`LocalCache::purge_expired_now`],
/// and ahead of LRU victims when the cache is full.
pub struct LocalCache {
    slots: RwLock<LruCache<String, Slot>>,
    metrics: Arc<CacheMetrics>,
}

impl LocalCache {
    pub fn new(capacity: usize, metrics: Arc<CacheMetrics>) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self { slots: RwLock::new(LruCache::new(cap)), metrics }
    }

    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut guard = self.slots.write();
        let expired = match guard.get(key) {
            Some(slot) if slot.expires_at > Instant::now() => return Some(slot.entry.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            guard.pop(key);
            CacheMetrics::bump(&self.metrics.ttl_evictions);
        }
        None
    }

    /// Stores `entry` for `ttl`. A zero TTL stores nothing.
    pub fn insert(&self, entry: CacheEntry, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let key = entry.fingerprint.clone();
        let mut guard = self.slots.write();
        if guard.len() >= guard.cap().get() && !guard.contains(&key) {
            let freed = purge(&mut guard);
            self.add_ttl_evictions(freed);
        }
        let slot = Slot { entry, expires_at: Instant::now() + ttl };
        if let Some((evicted, _)) = guard.push(key.clone(), slot)
            && evicted != key
        {
            CacheMetrics::bump(&self.metrics.lru_evictions);
            bench::emit(BenchEvent::LruEvict { key: evicted });
        }
        CacheMetrics::bump(&self.metrics.inserts);
    }

    pub fn remove(&self, key: &str) -> bool {
        self.slots.write().pop(key).is_some()
    }

    /// Removes every key matching the glob pattern; returns the removed keys.
    pub fn remove_matching(&self, pattern: &str) -> Vec<String> {
        let mut guard = self.slots.write();
        let keys: Vec<String> = guard.iter().map(|(k, _)| k.clone()).filter(|k| glob_match(pattern, k)).collect();
        for k in &keys {
            guard.pop(k);
        }
        keys
    }

    /// Drops every expired entry now; returns how many were dropped.
    pub fn purge_expired_now(&self) -> usize {
        let freed = purge(&mut self.slots.write());
        self.add_ttl_evictions(freed);
        freed
    }

    pub fn clear(&self) -> usize {
        let mut guard = self.slots.write();
        let n = guard.len();
        guard.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn add_ttl_evictions(&self, n: usize) {
        if n > 0 {
            self.metrics.ttl_evictions.fetch_add(n as u64, std::sync::atomic::Ordering::Relaxed);
        }
    }
}

fn purge(cache: &mut LruCache<String, Slot>) -> usize {
    let now = Instant::now();
    let expired: Vec<String> =
        cache.iter().filter(|(_, s)| s.expires_at <= now).map(|(k, _)| k.clone()).collect();
    for k in &expired {
        cache.pop(k);
    }
    expired.len()
}
