use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::local::LocalCache;
use super::metrics::{CacheMetrics, CacheMetricsSnapshot};
use super::remote::RemoteCache;
use super::usage::{UsageCounter, UsageTracker};
use super::CacheEntry;
use crate::bench::{self, BenchEvent};
use crate::config::{CacheSettings, WarmSettings};
use crate::errors::{RepoError, RepoResult};
use crate::query::{Fingerprint, QueryPlan};
use crate::store::{StoreAdapter, run_plan};

/// Outcome of one warming pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WarmReport {
    pub candidates: usize,
    pub refreshed: usize,
    pub failed: usize,
}

/// Result of a cached read.
#[derive(Debug, Clone, PartialEq)]
pub struct Loaded {
    pub value: Value,
    pub fingerprint: Fingerprint,
    pub from_cache: bool,
}

/// Stops a background task spawned by the cache manager.
pub struct TaskHandle {
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

pub type WarmerHandle = TaskHandle;

impl TaskHandle {
    fn spawn<F, Fut>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop, mut rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => tick().await,
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        Self { stop, join }
    }

    /// Signals the task and waits for it to finish its current tick.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.join.await;
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Owns both cache tiers and the usage counters.
///
/// Remote-tier failures and timeouts never surface: they are logged, counted
/// and treated as a miss (reads) or skipped (writes).
pub struct CacheManager {
    settings: CacheSettings,
    warm: WarmSettings,
    local: LocalCache,
    remote: Option<Arc<dyn RemoteCache>>,
    usage: UsageTracker,
    metrics: Arc<CacheMetrics>,
    inflight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    // bumped by every invalidation; loads that straddle one are not cached
    epoch: AtomicU64,
}

impl CacheManager {
    #[must_use]
    pub fn new(settings: CacheSettings, warm: WarmSettings, remote: Option<Arc<dyn RemoteCache>>) -> Self {
        let metrics = Arc::new(CacheMetrics::default());
        Self {
            local: LocalCache::new(settings.local_capacity, Arc::clone(&metrics)),
            usage: UsageTracker::new(settings.local_capacity),
            settings,
            warm,
            remote,
            metrics,
            inflight: DashMap::new(),
            epoch: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.settings.key_prefix
    }

    #[must_use]
    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    pub fn metrics(&self) -> CacheMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn local(&self) -> &LocalCache {
        &self.local
    }

    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }

    async fn remote_call<T>(&self, op: &str, fut: impl Future<Output = RepoResult<T>>) -> RepoResult<T> {
        let res = match tokio::time::timeout(self.settings.io_timeout(), fut).await {
            Ok(r) => r,
            Err(_) => {
                CacheMetrics::bump(&self.metrics.timeouts);
                Err(RepoError::Timeout(format!("remote cache {op} exceeded {}ms", self.settings.io_timeout_ms)))
            }
        };
        if let Err(e) = &res {
            CacheMetrics::bump(&self.metrics.remote_errors);
            log::warn!("remote cache {op} failed, falling back: {e}");
        }
        res
    }

    /// Local tier first, then the remote tier (backfilling local on a hit).
    pub async fn get(&self, fp: &Fingerprint) -> Option<CacheEntry> {
        let key = fp.as_str();
        if let Some(entry) = self.local.get(key) {
            CacheMetrics::bump(&self.metrics.hits);
            CacheMetrics::bump(&self.metrics.local_hits);
            return Some(entry);
        }
        if let Some(remote) = &self.remote
            && let Ok(Some(bytes)) = self.remote_call("get", remote.get(key)).await
        {
            match serde_json::from_slice::<CacheEntry>(&bytes) {
                Ok(entry) => {
                    let ttl = self.settings.local_ttl().min(entry.remaining());
                    self.local.insert(entry.clone(), ttl);
                    CacheMetrics::bump(&self.metrics.hits);
                    CacheMetrics::bump(&self.metrics.remote_hits);
                    return Some(entry);
                }
                Err(e) => log::warn!("discarding undecodable remote entry {key}: {e}"),
            }
        }
        CacheMetrics::bump(&self.metrics.misses);
        None
    }

    /// Writes both tiers: remote for `remote_ttl`, local for the shorter `local_ttl`.
    pub async fn set(&self, fp: &Fingerprint, payload: Value) {
        let entry = CacheEntry::new(fp.as_str(), payload, self.settings.remote_ttl_secs);
        if let Some(remote) = &self.remote {
            match serde_json::to_vec(&entry) {
                Ok(bytes) => {
                    let _ = self.remote_call("set", remote.set(fp.as_str(), bytes, self.settings.remote_ttl())).await;
                }
                Err(e) => log::warn!("cannot serialize cache entry {fp}: {e}"),
            }
        }
        self.local.insert(entry, self.settings.local_ttl());
    }

    /// Drops one fingerprint from both tiers; usage is kept.
    pub async fn evict(&self, fp: &Fingerprint) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.local.remove(fp.as_str());
        if let Some(remote) = &self.remote {
            let _ = self.remote_call("delete", remote.delete(fp.as_str())).await;
        }
    }

    /// Removes every entry whose fingerprint matches the glob pattern from both
    /// tiers, together with its usage counter, and returns the number of
    /// distinct cache keys removed.
    pub async fn invalidate(&self, pattern: &str) -> usize {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let forgotten = self.usage.clear_matching(pattern);
        let mut removed: BTreeSet<String> = self.local.remove_matching(pattern).into_iter().collect();
        if let Some(remote) = &self.remote
            && let Ok(keys) = self.remote_call("scan", remote.scan_prefix(pattern)).await
        {
            for key in keys {
                if let Ok(true) = self.remote_call("delete", remote.delete(&key)).await {
                    removed.insert(key);
                }
            }
        }
        CacheMetrics::bump(&self.metrics.invalidations);
        log::debug!("invalidated {} cache keys and {forgotten} usage counters for {pattern}", removed.len());
        removed.len()
    }

    /// Invalidates every fingerprint of one entity type.
    pub async fn invalidate_entity(&self, entity_type: &str) -> usize {
        self.invalidate(&Fingerprint::entity_pattern(self.prefix(), entity_type)).await
    }

    /// Explicit "used" signal, independent of hits and misses.
    pub fn record_usage(&self, fp: &Fingerprint) -> u64 {
        self.usage.record(fp.as_str())
    }

    fn record_fill(&self, fp: &Fingerprint, plan: &QueryPlan) {
        self.usage.record(fp.as_str());
        self.usage.register_plan(fp.as_str(), plan);
    }

    /// Forgets usage history for matching fingerprints.
    pub fn reset_usage(&self, pattern: &str) -> usize {
        self.usage.clear_matching(pattern)
    }

    /// Cached read of `plan`. On a miss, concurrent callers with the same
    /// fingerprint wait for a single load; usage is counted once per fill.
    ///
    /// # Errors
    /// Propagates the loader's error; cache faults never fail the call.
    pub async fn get_or_load<F, Fut>(&self, plan: &QueryPlan, load: F) -> RepoResult<Loaded>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RepoResult<Value>>,
    {
        let fp = plan.fingerprint(self.prefix());
        if let Some(entry) = self.get(&fp).await {
            return Ok(Loaded { value: entry.payload, fingerprint: fp, from_cache: true });
        }
        let key = fp.as_str().to_string();
        let gate = Arc::clone(self.inflight.entry(key.clone()).or_default().value());
        let result = {
            let _turn = gate.lock().await;
            if let Some(entry) = self.local.get(&key) {
                Ok((entry.payload, true))
            } else {
                let epoch = self.epoch.load(Ordering::SeqCst);
                let loaded = load().await;
                if let Ok(value) = &loaded
                    && self.epoch.load(Ordering::SeqCst) == epoch
                {
                    self.set(&fp, value.clone()).await;
                    self.record_fill(&fp, plan);
                }
                loaded.map(|v| (v, false))
            }
        };
        self.inflight.remove_if(&key, |_, g| Arc::strong_count(g) <= 2);
        let (value, from_cache) = result?;
        Ok(Loaded { value, fingerprint: fp, from_cache })
    }

    /// Re-runs the most popular tracked plans against `store` and refreshes
    /// their entries.
    pub async fn warm_cache(&self, store: &dyn StoreAdapter) -> WarmReport {
        let started = Instant::now();
        let candidates: Vec<UsageCounter> =
            self.usage.popular(self.warm.popular_queries_limit, self.warm.min_usage_count);
        let mut report = WarmReport { candidates: candidates.len(), ..WarmReport::default() };
        for counter in candidates {
            let Some(plan) = self.usage.plan(&counter.fingerprint) else {
                report.failed += 1;
                continue;
            };
            match run_plan(store, &plan).await {
                Ok(value) => {
                    self.set(&Fingerprint(counter.fingerprint.clone()), value).await;
                    report.refreshed += 1;
                }
                Err(e) => {
                    log::warn!("warming {} failed: {e}", counter.fingerprint);
                    report.failed += 1;
                }
            }
        }
        CacheMetrics::bump(&self.metrics.warm_runs);
        self.metrics.warmed_entries.fetch_add(report.refreshed as u64, Ordering::Relaxed);
        bench::emit(BenchEvent::WarmPass {
            candidates: report.candidates,
            refreshed: report.refreshed,
            failed: report.failed,
            ms: bench::elapsed_ms(started),
        });
        report
    }

    /// Runs [`Self::warm_cache`] every `warm_interval_seconds` until the handle is shut down.
    pub fn spawn_warmer(self: &Arc<Self>, store: Arc<dyn StoreAdapter>) -> WarmerHandle {
        let mgr = Arc::clone(self);
        let period = Duration::from_secs(self.warm.warm_interval_seconds.max(1));
        TaskHandle::spawn(period, move || {
            let mgr = Arc::clone(&mgr);
            let store = Arc::clone(&store);
            async move {
                let report = mgr.warm_cache(store.as_ref()).await;
                log::debug!("warm pass: {report:?}");
            }
        })
    }

    /// Purges expired local entries every `purge_interval_secs`.
    pub fn spawn_purger(self: &Arc<Self>) -> TaskHandle {
        let mgr = Arc::clone(self);
        let period = Duration::from_secs(self.settings.purge_interval_secs.max(1));
        TaskHandle::spawn(period, move || {
            let mgr = Arc::clone(&mgr);
            async move {
                let n = mgr.local.purge_expired_now();
                if n > 0 {
                    log::trace!("purged {n} expired cache entries");
                }
            }
        })
    }

    /// Empties the local tier; the remote tier is left to its own TTLs.
    pub fn flush_local(&self) -> usize {
        self.local.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryRemoteCache;
    use crate::query::{FilterCompiler, PlanKind, parse_filter_value};
    use crate::schema::SchemaRegistry;
    use serde_json::json;

    fn plan(v: Value) -> QueryPlan {
        let c = FilterCompiler::new(Arc::new(SchemaRegistry::new()));
        QueryPlan::new("users", PlanKind::List, c.compile("users", &parse_filter_value(&v).unwrap()).unwrap())
    }

    fn manager(remote: Option<Arc<dyn RemoteCache>>) -> CacheManager {
        CacheManager::new(CacheSettings { key_prefix: "t".into(), ..CacheSettings::default() }, WarmSettings::default(), remote)
    }

    #[tokio::test]
    async fn remote_hit_backfills_local() {
        let remote = Arc::new(InMemoryRemoteCache::new());
        let a = manager(Some(remote.clone()));
        let b = manager(Some(remote.clone()));
        let fp = plan(json!({"x": 1})).fingerprint("t");
        a.set(&fp, json!([1])).await;
        assert_eq!(b.get(&fp).await.unwrap().payload, json!([1]));
        assert_eq!(b.metrics().remote_hits, 1);
        assert_eq!(b.get(&fp).await.unwrap().payload, json!([1]));
        assert_eq!(b.metrics().local_hits, 1);
    }

    #[tokio::test]
    async fn get_or_load_loads_once() {
        let m = manager(None);
        let p = plan(json!({"x": 1}));
        let calls = AtomicU64::new(0);
        for _ in 0..3 {
            let loaded = m
                .get_or_load(&p, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(["row"]))
                })
                .await
                .unwrap();
            assert_eq!(loaded.value, json!(["row"]));
            assert_eq!(loaded.fingerprint, p.fingerprint("t"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(m.usage().count(p.fingerprint("t").as_str()), 1);
        assert_eq!(m.record_usage(&p.fingerprint("t")), 2);
        assert!(m.inflight.is_empty());
    }

    #[tokio::test]
    async fn invalidate_clears_both_tiers_and_usage() {
        let remote = Arc::new(InMemoryRemoteCache::new());
        let m = manager(Some(remote.clone()));
        let p = plan(json!({}));
        m.get_or_load(&p, || async { Ok(json!([])) }).await.unwrap();
        let other = Fingerprint("t:orders:list:0".into());
        m.set(&other, json!(1)).await;
        assert_eq!(m.invalidate_entity("users").await, 1);
        assert!(m.local().get(p.fingerprint("t").as_str()).is_none());
        assert!(!remote.contains(p.fingerprint("t").as_str()));
        assert!(remote.contains(other.as_str()));
        assert_eq!(m.usage().count(p.fingerprint("t").as_str()), 0);
        assert!(m.usage().plan(p.fingerprint("t").as_str()).is_none());
    }

    #[tokio::test]
    async fn evict_keeps_usage_for_the_warmer() {
        let m = manager(None);
        let p = plan(json!({"x": 2}));
        m.get_or_load(&p, || async { Ok(json!([1])) }).await.unwrap();
        let fp = p.fingerprint("t");
        for _ in 0..4 {
            m.record_usage(&fp);
        }
        m.evict(&fp).await;
        assert!(m.local().is_empty());
        assert_eq!(m.usage().count(fp.as_str()), 5);
        assert!(m.usage().plan(fp.as_str()).is_some());
    }

    #[tokio::test]
    async fn warm_pass_reports_a_bench_event() {
        let m = manager(None);
        let cap = bench::capture();
        let report = m.warm_cache(&crate::store::InMemoryStore::new()).await;
        assert_eq!(report, WarmReport::default());
        let events = cap.take();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], BenchEvent::WarmPass { candidates: 0, refreshed: 0, failed: 0, .. }));
    }

    #[tokio::test]
    async fn usage_stays_within_local_capacity() {
        let m = CacheManager::new(
            CacheSettings { key_prefix: "t".into(), local_capacity: 4, ..CacheSettings::default() },
            WarmSettings::default(),
            None,
        );
        for i in 0..20 {
            m.get_or_load(&plan(json!({"id": i})), || async { Ok(json!([])) }).await.unwrap();
        }
        assert_eq!(m.usage().len(), 4);
        assert_eq!(m.usage().capacity(), 4);
    }

    #[tokio::test]
    async fn offline_remote_degrades_to_loader() {
        let remote = Arc::new(InMemoryRemoteCache::new());
        remote.set_available(false);
        let m = manager(Some(remote));
        let loaded = m.get_or_load(&plan(json!({})), || async { Ok(json!(7)) }).await.unwrap();
        assert_eq!(loaded.value, json!(7));
        assert!(!loaded.from_cache);
        assert!(m.metrics().remote_errors >= 2);
        assert_eq!(m.invalidate("t:*").await, 1);
    }

    #[tokio::test]
    async fn loader_errors_are_not_cached() {
        let m = manager(None);
        let p = plan(json!({}));
        let err = m.get_or_load(&p, || async { Err(RepoError::Store("down".into())) }).await;
        assert!(err.is_err());
        assert!(m.local().is_empty());
    }
}
