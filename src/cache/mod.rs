//! Two-tier result cache keyed by plan fingerprints, with usage tracking and
//! a warming scheduler for popular plans.

mod local;
mod manager;
mod metrics;
mod pattern;
mod remote;
mod usage;

pub use local::LocalCache;
pub use manager::{CacheManager, Loaded, TaskHandle, WarmReport, WarmerHandle};
pub use metrics::{CacheMetrics, CacheMetricsSnapshot};
pub use pattern::glob_match;
pub use remote::{InMemoryRemoteCache, RemoteCache};
pub use usage::{UsageCounter, UsageTracker};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A cached read result. Serialized as JSON in the remote tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub payload: Value,
    pub stored_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl CacheEntry {
    #[must_use]
    pub fn new(fingerprint: &str, payload: Value, ttl_secs: u64) -> Self {
        Self { fingerprint: fingerprint.to_string(), payload, stored_at: Utc::now(), ttl_secs }
    }

    /// Time left before the remote copy expires.
    #[must_use]
    pub fn remaining(&self) -> std::time::Duration {
        let age = (Utc::now() - self.stored_at).to_std().unwrap_or_default();
        std::time::Duration::from_secs(self.ttl_secs).saturating_sub(age)
    }
}
