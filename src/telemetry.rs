use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;

use crate::cache::CacheMetricsSnapshot;
use crate::config::TelemetrySettings;
use crate::logger::{AUDIT_TARGET, METRICS_TARGET};

#[derive(Default)]
pub struct TelemetryMetrics {
    pub queries_total: AtomicU64,
    pub queries_slow_total: AtomicU64,
    pub queries_cached_total: AtomicU64,
    pub writes_total: AtomicU64,
    pub audits_total: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
    pub queries_total: u64,
    pub queries_slow_total: u64,
    pub queries_cached_total: u64,
    pub writes_total: u64,
    pub audits_total: u64,
}

/// Per-engine query and write accounting. Slow reads go to the metrics log,
/// mutations to the audit log.
pub struct Telemetry {
    cfg: TelemetrySettings,
    metrics: TelemetryMetrics,
    // lets tests read audit lines without a global logger
    audit_capture: RwLock<Option<Arc<RwLock<Vec<String>>>>>,
}

fn now_ts() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[must_use]
pub fn sha256_hex(input: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut h = Sha256::new();
    h.update(input.as_bytes());
    hex::encode(h.finalize())
}

impl Telemetry {
    #[must_use]
    pub fn new(cfg: TelemetrySettings) -> Self {
        Self { cfg, metrics: TelemetryMetrics::default(), audit_capture: RwLock::new(None) }
    }

    pub fn set_audit_capture(&self, sink: Arc<RwLock<Vec<String>>>) {
        *self.audit_capture.write() = Some(sink);
    }

    /// Counts one read; returns whether it crossed the slow-query threshold.
    pub fn record_query(&self, entity_type: &str, kind: &str, fingerprint: &str, elapsed: Duration, cached: bool) -> bool {
        self.metrics.queries_total.fetch_add(1, Ordering::Relaxed);
        if cached {
            self.metrics.queries_cached_total.fetch_add(1, Ordering::Relaxed);
        }
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        let slow = ms >= self.cfg.slow_query_ms;
        if slow {
            self.metrics.queries_slow_total.fetch_add(1, Ordering::Relaxed);
            let line = serde_json::json!({
                "ts": now_ts(),
                "entity_type": entity_type,
                "kind": kind,
                "fingerprint": fingerprint,
                "duration_ms": ms,
                "cached": cached,
            });
            log::warn!(target: METRICS_TARGET, "slow_query {line}");
        } else {
            log::trace!(target: METRICS_TARGET, "query {entity_type} {kind} {ms}ms cached={cached}");
        }
        slow
    }

    /// Counts a mutation and, when auditing is on, writes an audit line.
    /// `filter` is hashed before it is logged.
    pub fn record_write(&self, op: &str, entity_type: &str, affected: u64, filter: Option<&str>) {
        self.metrics.writes_total.fetch_add(1, Ordering::Relaxed);
        if !self.cfg.audit_enabled {
            return;
        }
        self.metrics.audits_total.fetch_add(1, Ordering::Relaxed);
        let line = serde_json::json!({
            "ts": now_ts(),
            "op": op,
            "entity_type": entity_type,
            "affected": affected,
            "filter_hash": filter.map(sha256_hex),
        })
        .to_string();
        log::info!(target: AUDIT_TARGET, "{line}");
        if let Some(sink) = self.audit_capture.read().clone() {
            sink.write().push(line);
        }
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let m = &self.metrics;
        TelemetrySnapshot {
            queries_total: m.queries_total.load(Ordering::Relaxed),
            queries_slow_total: m.queries_slow_total.load(Ordering::Relaxed),
            queries_cached_total: m.queries_cached_total.load(Ordering::Relaxed),
            writes_total: m.writes_total.load(Ordering::Relaxed),
            audits_total: m.audits_total.load(Ordering::Relaxed),
        }
    }

    /// Prometheus text exposition of query, write and cache counters.
    #[must_use]
    pub fn metrics_text(&self, cache: &CacheMetricsSnapshot) -> String {
        let t = self.snapshot();
        format!(
            "repolite_queries_total {}\n\
             repolite_queries_slow_total {}\n\
             repolite_queries_cached_total {}\n\
             repolite_writes_total {}\n\
             repolite_audits_total {}\n\
             repolite_cache_hits_total {}\n\
             repolite_cache_misses_total {}\n\
             repolite_cache_invalidations_total {}\n\
             repolite_cache_remote_errors_total {}\n\
             repolite_cache_warmed_entries_total {}\n",
            t.queries_total,
            t.queries_slow_total,
            t.queries_cached_total,
            t.writes_total,
            t.audits_total,
            cache.hits,
            cache.misses,
            cache.invalidations,
            cache.remote_errors,
            cache.warmed_entries,
        )
    }
}
