use std::num::NonZeroUsize;

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;

use super::pattern::glob_match;
use crate::query::QueryPlan;

/// How often a fingerprint has been filled from the store or flagged as used.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageCounter {
    pub fingerprint: String,
    pub count: u64,
    pub last_seen: DateTime<Utc>,
}

struct Tracked {
    counter: UsageCounter,
    plan: Option<QueryPlan>,
}

/// Usage counts per fingerprint plus the plan needed to re-run each one.
///
/// Bounded like the local tier: once `capacity` fingerprints are tracked the
/// least recently used one is forgotten.
pub struct UsageTracker {
    entries: Mutex<LruCache<String, Tracked>>,
}

impl Default for UsageTracker {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl UsageTracker {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self { entries: Mutex::new(LruCache::new(cap)) }
    }

    /// Increments the counter and returns the new count.
    pub fn record(&self, fingerprint: &str) -> u64 {
        let mut guard = self.entries.lock();
        let now = Utc::now();
        if let Some(t) = guard.get_mut(fingerprint) {
            t.counter.count += 1;
            t.counter.last_seen = now;
            return t.counter.count;
        }
        if let Some((evicted, _)) = guard.push(
            fingerprint.to_string(),
            Tracked {
                counter: UsageCounter { fingerprint: fingerprint.to_string(), count: 1, last_seen: now },
                plan: None,
            },
        ) && evicted != fingerprint
        {
            log::trace!("usage tracker full, forgot {evicted}");
        }
        1
    }

    /// Attaches the plan behind an already tracked fingerprint.
    pub fn register_plan(&self, fingerprint: &str, plan: &QueryPlan) {
        if let Some(t) = self.entries.lock().peek_mut(fingerprint)
            && t.plan.is_none()
        {
            t.plan = Some(plan.clone());
        }
    }

    pub fn plan(&self, fingerprint: &str) -> Option<QueryPlan> {
        self.entries.lock().peek(fingerprint).and_then(|t| t.plan.clone())
    }

    pub fn count(&self, fingerprint: &str) -> u64 {
        self.entries.lock().peek(fingerprint).map_or(0, |t| t.counter.count)
    }

    /// Up to `limit` counters with at least `min_count` uses, most used first.
    pub fn popular(&self, limit: usize, min_count: u64) -> Vec<UsageCounter> {
        let mut out: Vec<UsageCounter> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, t)| t.counter.count >= min_count)
            .map(|(_, t)| t.counter.clone())
            .collect();
        out.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| b.last_seen.cmp(&a.last_seen))
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        out.truncate(limit);
        out
    }

    /// Forgets counters and plans whose fingerprint matches the glob pattern.
    pub fn clear_matching(&self, pattern: &str) -> usize {
        let mut guard = self.entries.lock();
        let keys: Vec<String> = guard.iter().map(|(k, _)| k.clone()).filter(|k| glob_match(pattern, k)).collect();
        for k in &keys {
            guard.pop(k);
        }
        keys.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }
}
