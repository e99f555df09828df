//! Batched mutations with partial-success accounting.
//!
//! Every batch is attempted as a unit and failures stay inside it: a rejected
//! batch adds its rows to `error_count` and processing moves on to the next
//! one. The entity type's cache entries are invalidated once per call, after
//! the last batch. Bulk update and delete do not run per-row hooks.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{BulkOperationResult, BulkOptions, Bulkable, Repository};
use crate::bench::{self, BenchEvent, BulkOp};
use crate::errors::{RepoError, RepoResult};
use crate::query::{FilterInput, PlanKind, Predicate, QueryPlan};
use crate::store::InsertMode;
use crate::types::{Entity, EntityId, Patch};

impl Repository {
    fn batch_size(&self, opts: &BulkOptions) -> RepoResult<usize> {
        match opts.batch_size.unwrap_or(self.shared.batch_size) {
            0 => Err(RepoError::Validation("batch_size must be at least 1".into())),
            n => Ok(n),
        }
    }

    /// Records the rows left after a cancellation as errors.
    fn cancelled(result: &mut BulkOperationResult, remaining: usize) {
        result.error_count += remaining;
        result.errors.push(format!("{remaining} rows not attempted: {}", RepoError::Cancelled));
    }

    async fn finish(&self, op: &str, result: &BulkOperationResult, filter: Option<&Predicate>, started: Instant) {
        if result.success_count > 0 {
            self.invalidate().await;
        }
        let filter = filter.and_then(|p| serde_json::to_string(p).ok());
        self.shared
            .telemetry
            .record_write(op, &self.entity_type, result.success_count as u64, filter.as_deref());
        log::debug!(
            "{op} on {}: {} ok, {} failed in {}ms",
            self.entity_type,
            result.success_count,
            result.error_count,
            started.elapsed().as_millis()
        );
    }

    fn batch_event(&self, op: BulkOp, batch: usize, rows: usize, before: (usize, usize), result: &BulkOperationResult, started: Instant) {
        bench::emit(BenchEvent::BulkBatch {
            op,
            entity_type: self.entity_type.clone(),
            batch,
            rows,
            ok: result.success_count - before.0,
            failed: result.error_count - before.1,
            ms: bench::elapsed_ms(started),
        });
    }

    /// Re-reads committed rows for hooks and events. The write already stands,
    /// so a failed read only costs the events and is noted in `errors`.
    async fn fetch_for_events(&self, ids: &[EntityId], batch_no: usize, result: &mut BulkOperationResult) -> Vec<Entity> {
        match self.fetch_fresh(ids, true).await {
            Ok(rows) => rows,
            Err(e) => {
                log::warn!("{} batch {batch_no}: events skipped, re-read failed: {e}", self.entity_type);
                result.errors.push(format!("batch {batch_no}: events skipped: {e}"));
                Vec::new()
            }
        }
    }

    /// Snapshot of the ids that match `base` right now, in id order.
    async fn snapshot_ids(&self, base: &QueryPlan) -> RepoResult<Vec<EntityId>> {
        let plan = base.clone().project(Some(vec!["id".into()]));
        Ok(self.shared.store.execute(&plan).await?.into_iter().map(|e| e.id).collect())
    }
}

#[async_trait]
impl Bulkable for Repository {
    async fn bulk_create(&self, rows: Vec<Map<String, Value>>, opts: &BulkOptions) -> RepoResult<BulkOperationResult> {
        let batch_size = self.batch_size(opts)?;
        let started = Instant::now();
        let events = &self.shared.events;
        let schema = self.schema();
        let mode = if opts.ignore_conflicts { InsertMode::SkipConflicts } else { InsertMode::Atomic };
        let mut result = BulkOperationResult::default();
        let mut pending = rows.into_iter();
        let mut offset = 0usize;
        let mut batch_no = 0usize;
        loop {
            let batch: Vec<Map<String, Value>> = pending.by_ref().take(batch_size).collect();
            if batch.is_empty() {
                break;
            }
            if opts.is_cancelled() {
                Self::cancelled(&mut result, batch.len() + pending.len());
                break;
            }
            batch_no += 1;
            let batch_started = Instant::now();
            let before = (result.success_count, result.error_count);
            let batch_len = batch.len();

            let mut prepared: Vec<Entity> = Vec::with_capacity(batch_len);
            let mut positions: Vec<usize> = Vec::with_capacity(batch_len);
            let mut rejected: Vec<String> = Vec::new();
            for (i, mut data) in batch.into_iter().enumerate() {
                let checked = match events.before_create(&self.entity_type, &mut data).await {
                    Ok(()) => schema.validate_data(&data),
                    Err(e) => Err(e),
                };
                match checked {
                    Ok(()) => {
                        positions.push(offset + i);
                        prepared.push(Entity::new(data));
                    }
                    Err(e) => rejected.push(format!("row {}: {e}", offset + i)),
                }
            }
            offset += batch_len;

            if !rejected.is_empty() && mode == InsertMode::Atomic {
                result.error_count += batch_len;
                result.errors.push(format!("batch {batch_no} rejected: {}", rejected[0]));
                continue;
            }
            let outcome = if prepared.is_empty() {
                Ok(Default::default())
            } else {
                self.shared.store.insert(&self.entity_type, prepared, mode).await
            };
            match outcome {
                Ok(outcome) => {
                    for c in &outcome.conflicts {
                        let row = positions.get(c.index).copied().unwrap_or(c.index);
                        log::debug!("bulk_create skipped row {row} of {}: {}={} exists", self.entity_type, c.field, c.value);
                        rejected.push(format!("row {row}: conflict on {}: {} already exists", c.field, c.value));
                    }
                    result.success_count += outcome.inserted.len();
                    result.error_count += batch_len - outcome.inserted.len();
                    result.errors.extend(rejected);
                    result.created_ids.extend(outcome.inserted.iter().copied());
                    if opts.emit_events || events.has_hooks() {
                        let fresh = self.fetch_for_events(&outcome.inserted, batch_no, &mut result).await;
                        let by_id: HashMap<EntityId, &Entity> = fresh.iter().map(|e| (e.id, e)).collect();
                        for id in &outcome.inserted {
                            let Some(created) = by_id.get(id) else { continue };
                            events.after_create(&self.entity_type, created).await;
                            if opts.emit_events {
                                events.emit_created(&self.entity_type, created).await;
                            }
                        }
                    }
                }
                Err(e) => {
                    log::debug!("bulk_create batch {batch_no} of {} rejected: {e}", self.entity_type);
                    result.error_count += batch_len;
                    result.errors.push(format!("batch {batch_no} rejected: {e}"));
                }
            }
            self.batch_event(BulkOp::Create, batch_no, batch_len, before, &result, batch_started);
        }
        self.finish("bulk_create", &result, None, started).await;
        Ok(result)
    }

    async fn bulk_update(&self, filters: &FilterInput, patch: Patch, opts: &BulkOptions) -> RepoResult<BulkOperationResult> {
        let batch_size = self.batch_size(opts)?;
        if patch.is_empty() {
            return Err(RepoError::Validation("bulk update needs a non-empty patch".into()));
        }
        self.check_patch(&patch)?;
        let started = Instant::now();
        let base = self.plan(PlanKind::List, filters, false)?;
        let ids = self.snapshot_ids(&base).await?;
        let mut result = BulkOperationResult::default();
        for (batch_no, chunk) in ids.chunks(batch_size).enumerate() {
            if opts.is_cancelled() {
                Self::cancelled(&mut result, ids.len() - batch_no * batch_size);
                break;
            }
            let batch_started = Instant::now();
            let before = (result.success_count, result.error_count);
            let live = match self.still_matching(chunk, &base.predicate).await {
                Ok(live) => live,
                Err(e) => {
                    result.error_count += chunk.len();
                    result.errors.push(format!("batch {} rejected: {e}", batch_no + 1));
                    continue;
                }
            };
            let live_ids: Vec<EntityId> = live.iter().map(|e| e.id).collect();
            let gone = chunk.len() - live_ids.len();
            if gone > 0 {
                result.error_count += gone;
                result.errors.push(format!("batch {}: {gone} rows no longer match", batch_no + 1));
            }
            if live_ids.is_empty() {
                continue;
            }
            let plan = base.clone().restrict(Predicate::id_in(&live_ids));
            match self.shared.store.update_matching(&plan, &patch).await {
                Ok(_) => {
                    result.success_count += live_ids.len();
                    result.updated_ids.extend(live_ids.iter().copied());
                    if opts.emit_events {
                        let fresh = self.fetch_for_events(&live_ids, batch_no + 1, &mut result).await;
                        let by_id: HashMap<EntityId, &Entity> = fresh.iter().map(|e| (e.id, e)).collect();
                        for old in &live {
                            if let Some(new) = by_id.get(&old.id) {
                                self.shared.events.emit_updated(&self.entity_type, old, new).await;
                            }
                        }
                    }
                }
                Err(e) => {
                    result.error_count += live_ids.len();
                    result.errors.push(format!("batch {} rejected: {e}", batch_no + 1));
                }
            }
            self.batch_event(BulkOp::Update, batch_no + 1, chunk.len(), before, &result, batch_started);
        }
        self.finish("bulk_update", &result, Some(&base.predicate), started).await;
        Ok(result)
    }

    async fn bulk_delete(&self, filters: &FilterInput, soft_delete: bool, opts: &BulkOptions) -> RepoResult<BulkOperationResult> {
        let batch_size = self.batch_size(opts)?;
        let started = Instant::now();
        let hard = !soft_delete;
        let base = self.plan(PlanKind::List, filters, hard)?;
        let ids = self.snapshot_ids(&base).await?;
        let mut result = BulkOperationResult::default();
        for (batch_no, chunk) in ids.chunks(batch_size).enumerate() {
            if opts.is_cancelled() {
                Self::cancelled(&mut result, ids.len() - batch_no * batch_size);
                break;
            }
            let batch_started = Instant::now();
            let before = (result.success_count, result.error_count);
            let live = match self.still_matching(chunk, &base.predicate).await {
                Ok(live) => live,
                Err(e) => {
                    result.error_count += chunk.len();
                    result.errors.push(format!("batch {} rejected: {e}", batch_no + 1));
                    continue;
                }
            };
            let live_ids: Vec<EntityId> = live.iter().map(|e| e.id).collect();
            let gone = chunk.len() - live_ids.len();
            if gone > 0 {
                result.error_count += gone;
                result.errors.push(format!("batch {}: {gone} rows no longer match", batch_no + 1));
            }
            if live_ids.is_empty() {
                continue;
            }
            let plan = base.clone().restrict(Predicate::id_in(&live_ids));
            match self.shared.store.delete_matching(&plan, hard).await {
                Ok(_) => {
                    result.success_count += live_ids.len();
                    result.deleted_ids.extend(live_ids.iter().copied());
                    if opts.emit_events {
                        let stamped = if soft_delete {
                            self.fetch_for_events(&live_ids, batch_no + 1, &mut result).await
                        } else {
                            Vec::new()
                        };
                        let by_id: HashMap<EntityId, &Entity> = stamped.iter().map(|e| (e.id, e)).collect();
                        for old in &live {
                            let new = by_id.get(&old.id).copied();
                            self.shared.events.emit_deleted(&self.entity_type, old, new).await;
                        }
                    }
                }
                Err(e) => {
                    result.error_count += live_ids.len();
                    result.errors.push(format!("batch {} rejected: {e}", batch_no + 1));
                }
            }
            let op = if hard { BulkOp::HardDelete } else { BulkOp::SoftDelete };
            self.batch_event(op, batch_no + 1, chunk.len(), before, &result, batch_started);
        }
        let op = if soft_delete { "bulk_soft_delete" } else { "bulk_hard_delete" };
        self.finish(op, &result, Some(&base.predicate), started).await;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Engine;
    use crate::config::EngineConfig;
    use crate::bench::{self, BulkOp};
    use crate::events::{CapturingSink, EventKind};
    use crate::query::FilterExpression;
    use crate::repository::{CancelFlag, Creatable};
    use crate::store::InMemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    fn rows(n: usize) -> Vec<Map<String, Value>> {
        (0..n).map(|i| json!({"email": format!("u{i}@x.com"), "n": i}).as_object().cloned().unwrap()).collect()
    }

    fn setup() -> (Arc<InMemoryStore>, Arc<CapturingSink>, Repository) {
        let store = Arc::new(InMemoryStore::new().with_unique("users", &["email"]));
        let sink = Arc::new(CapturingSink::new());
        let engine = Engine::new(EngineConfig::default(), store.clone(), None)
            .unwrap()
            .with_event_sink(sink.clone());
        (store, sink, engine.repository("users").unwrap())
    }

    #[tokio::test]
    async fn atomic_batches_fail_independently() {
        let (store, _, repo) = setup();
        let mut input = rows(6);
        // second batch carries a duplicate of the first row
        input[4] = input[0].clone();
        let cap = bench::capture();
        let r = repo.bulk_create(input, &BulkOptions::new().batch_size(3)).await.unwrap();
        assert_eq!((r.success_count, r.error_count), (3, 3));
        assert_eq!(r.errors.len(), 1);
        assert!(r.errors[0].starts_with("batch 2 rejected"));
        assert_eq!(store.len("users"), 3);
        let batches: Vec<_> = cap.take().into_iter().filter(|e| e.is_bulk(BulkOp::Create)).collect();
        assert_eq!(batches.len(), 2);
        assert!(matches!(batches[1], bench::BenchEvent::BulkBatch { batch: 2, ok: 0, failed: 3, .. }));
    }

    #[tokio::test]
    async fn skip_mode_reports_conflicting_rows() {
        let (_, sink, repo) = setup();
        let dup = json!({"email": "a@x.com"}).as_object().cloned().unwrap();
        repo.create(dup.clone(), false).await.unwrap();
        let r = repo
            .bulk_create(vec![dup.clone(), dup], &BulkOptions::new().ignore_conflicts().emit_events())
            .await
            .unwrap();
        assert_eq!((r.success_count, r.error_count, r.errors.len()), (0, 2, 2));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn cancellation_stops_before_the_next_batch() {
        let (_, _, repo) = setup();
        let flag = CancelFlag::new();
        flag.cancel();
        let r = repo.bulk_create(rows(10), &BulkOptions::new().batch_size(4).cancel(flag)).await.unwrap();
        assert_eq!((r.success_count, r.error_count), (0, 10));
        assert!(r.errors[0].contains(&RepoError::Cancelled.to_string()));
    }

    #[tokio::test]
    async fn bulk_update_and_delete_follow_the_filter() {
        let (_, sink, repo) = setup();
        repo.bulk_create(rows(7), &BulkOptions::new()).await.unwrap();
        let small: FilterInput = FilterExpression::new()
            .with_op("n", crate::query::Operator::parse("lt").unwrap(), 5)
            .into();
        let r = repo
            .bulk_update(&small, Patch::default().set("tier", "low"), &BulkOptions::new().batch_size(2).emit_events())
            .await
            .unwrap();
        assert_eq!((r.success_count, r.error_count, r.updated_ids.len()), (5, 0, 5));
        assert_eq!(sink.take().iter().filter(|e| e.kind == EventKind::Update).count(), 5);

        let low: FilterInput = FilterExpression::new().with("tier", "low").into();
        assert_eq!(repo.count(&low).await.unwrap(), 5);
        let r = repo.bulk_delete(&low, true, &BulkOptions::new().batch_size(3)).await.unwrap();
        assert_eq!(r.deleted_ids.len(), 5);
        assert_eq!(repo.count(&low).await.unwrap(), 0);
        assert_eq!(repo.count(&FilterInput::default()).await.unwrap(), 2);

        let r = repo.bulk_delete(&low, false, &BulkOptions::new()).await.unwrap();
        assert_eq!(r.success_count, 5);
    }

    #[tokio::test]
    async fn zero_batch_size_is_rejected() {
        let (_, _, repo) = setup();
        let err = repo.bulk_create(rows(1), &BulkOptions::new().batch_size(0)).await.unwrap_err();
        assert!(matches!(err, RepoError::Validation(_)));
    }
}
