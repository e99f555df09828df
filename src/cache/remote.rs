use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::pattern::glob_match;
use crate::errors::{RepoError, RepoResult};

/// Shared key/value cache service (the second tier). Keys are fingerprints,
/// values are serialized cache entries.
#[async_trait]
pub trait RemoteCache: Send + Sync {
    async fn get(&self, key: &str) -> RepoResult<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> RepoResult<()>;
    async fn delete(&self, key: &str) -> RepoResult<bool>;
    /// Keys matching a glob pattern such as `prefix:users:*`.
    async fn scan_prefix(&self, pattern: &str) -> RepoResult<Vec<String>>;
}

/// Process-local stand-in for a remote cache service. It can be taken
/// offline or slowed down to exercise the degrade-to-store path.
pub struct InMemoryRemoteCache {
    entries: DashMap<String, (Vec<u8>, Instant)>,
    available: AtomicBool,
    latency_ms: AtomicU64,
    ops: AtomicU64,
}

impl Default for InMemoryRemoteCache {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            ops: AtomicU64::new(0),
        }
    }
}

impl InMemoryRemoteCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, up: bool) {
        self.available.store(up, Ordering::Relaxed);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    /// Operations attempted, including failed ones.
    pub fn ops(&self) -> u64 {
        self.ops.load(Ordering::Relaxed)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.get(key).is_some_and(|e| e.1 > Instant::now())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    async fn enter(&self) -> RepoResult<()> {
        self.ops.fetch_add(1, Ordering::Relaxed);
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(RepoError::CacheUnavailable("remote cache offline".into()))
        }
    }
}

#[async_trait]
impl RemoteCache for InMemoryRemoteCache {
    async fn get(&self, key: &str) -> RepoResult<Option<Vec<u8>>> {
        self.enter().await?;
        let live = self.entries.get(key).filter(|e| e.1 > Instant::now()).map(|e| e.0.clone());
        if live.is_none() {
            self.entries.remove_if(key, |_, e| e.1 <= Instant::now());
        }
        Ok(live)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> RepoResult<()> {
        self.enter().await?;
        self.entries.insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> RepoResult<bool> {
        self.enter().await?;
        Ok(self.entries.remove(key).is_some())
    }

    async fn scan_prefix(&self, pattern: &str) -> RepoResult<Vec<String>> {
        self.enter().await?;
        let mut keys: Vec<String> =
            self.entries.iter().map(|e| e.key().clone()).filter(|k| glob_match(pattern, k)).collect();
        keys.sort();
        Ok(keys)
    }
}
