//! Structured timing events for bulk batches and cache maintenance.
//!
//! Events are serialized to JSON on the `repolite::bench` log target (routed to
//! `bench.log` when enabled) and can be captured per thread with [`capture`],
//! so tests can inspect what a call did without installing a logger.

use std::cell::RefCell;
use std::time::Instant;

use serde::Serialize;

use crate::logger::BENCH_TARGET;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkOp {
    Create,
    Update,
    SoftDelete,
    HardDelete,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BenchEvent {
    /// One bulk batch after it was attempted.
    BulkBatch { op: BulkOp, entity_type: String, batch: usize, rows: usize, ok: usize, failed: usize, ms: u64 },
    /// One warming pass.
    WarmPass { candidates: usize, refreshed: usize, failed: usize, ms: u64 },
    /// A live local-tier entry pushed out by capacity.
    LruEvict { key: String },
}

impl BenchEvent {
    #[must_use]
    pub fn is_bulk(&self, op: BulkOp) -> bool {
        matches!(self, Self::BulkBatch { op: o, .. } if *o == op)
    }
}

thread_local! {
    static CAPTURED: RefCell<Option<Vec<BenchEvent>>> = const { RefCell::new(None) };
}

/// Milliseconds since `started`, saturating.
#[must_use]
pub fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Records `event`: logged at TRACE on the bench target and appended to the
/// current thread's capture, if one is active.
pub fn emit(event: BenchEvent) {
    if log::log_enabled!(target: BENCH_TARGET, log::Level::Trace)
        && let Ok(line) = serde_json::to_string(&event)
    {
        log::trace!(target: BENCH_TARGET, "{line}");
    }
    CAPTURED.with(|c| {
        if let Some(buf) = c.borrow_mut().as_mut() {
            buf.push(event);
        }
    });
}

/// Captures events emitted on this thread until the guard drops.
pub struct Capture {
    _private: (),
}

#[must_use]
pub fn capture() -> Capture {
    CAPTURED.with(|c| *c.borrow_mut() = Some(Vec::new()));
    Capture { _private: () }
}

impl Capture {
    /// Events captured so far, leaving the buffer empty.
    pub fn take(&self) -> Vec<BenchEvent> {
        CAPTURED.with(|c| c.borrow_mut().as_mut().map(std::mem::take).unwrap_or_default())
    }

    pub fn len(&self) -> usize {
        CAPTURED.with(|c| c.borrow().as_ref().map_or(0, Vec::len))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        CAPTURED.with(|c| *c.borrow_mut() = None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn warm(n: usize) -> BenchEvent {
        BenchEvent::WarmPass { candidates: n, refreshed: n, failed: 0, ms: 1 }
    }

    #[test]
    fn capture_collects_until_dropped() {
        {
            let cap = capture();
            emit(warm(3));
            emit(BenchEvent::LruEvict { key: "p:users:get:1".into() });
            assert_eq!(cap.len(), 2);
            assert_eq!(cap.take()[0], warm(3));
            assert!(cap.is_empty());
        }
        emit(warm(1));
        let cap = capture();
        assert!(cap.is_empty());
    }

    #[test]
    fn other_threads_are_not_captured() {
        let cap = capture();
        std::thread::spawn(|| emit(warm(9))).join().unwrap();
        emit(warm(1));
        assert_eq!(cap.take(), vec![warm(1)]);
    }

    #[test]
    fn events_serialize_with_their_kind() {
        let e = BenchEvent::BulkBatch {
            op: BulkOp::SoftDelete,
            entity_type: "users".into(),
            batch: 2,
            rows: 5,
            ok: 4,
            failed: 1,
            ms: 0,
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["event"], "bulk_batch");
        assert_eq!(v["op"], "soft_delete");
        assert!(e.is_bulk(BulkOp::SoftDelete));
        assert!(!e.is_bulk(BulkOp::HardDelete));
    }
}
