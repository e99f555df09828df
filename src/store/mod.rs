//! Persistence seam. The repository layer talks to a [`StoreAdapter`]; the
//! in-memory implementation evaluates plans directly and backs the tests.

mod memory;

pub use memory::InMemoryStore;

use crate::errors::RepoResult;
use crate::query::{AggregateOp, AggregationRow, PlanKind, QueryPlan};
use crate::types::{Entity, EntityId, Patch};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a multi-row insert treats unique-constraint violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InsertMode {
    /// Any conflict rejects the whole call and nothing is written.
    Atomic,
    /// Conflicting rows are skipped and reported; the rest are written.
    SkipConflicts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowConflict {
    pub index: usize,
    pub field: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertOutcome {
    pub inserted: Vec<EntityId>,
    pub conflicts: Vec<RowConflict>,
}

/// Search hit with its relevance score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedEntity {
    pub entity: Entity,
    pub rank: f64,
}

#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Rows matching the plan, ordered and windowed.
    async fn execute(&self, plan: &QueryPlan) -> RepoResult<Vec<Entity>>;

    /// Aggregation rows for count and aggregate plans.
    async fn execute_scalar(&self, plan: &QueryPlan) -> RepoResult<Vec<AggregationRow>>;

    /// Full-text matches for search plans with their rank.
    async fn search(&self, plan: &QueryPlan) -> RepoResult<Vec<RankedEntity>>;

    async fn insert(&self, entity_type: &str, rows: Vec<Entity>, mode: InsertMode) -> RepoResult<InsertOutcome>;

    /// Applies the patch to every row matching the plan's predicate; returns rows matched.
    async fn update_matching(&self, plan: &QueryPlan, patch: &Patch) -> RepoResult<u64>;

    /// Soft-deletes (stamps `deleted_at`) or removes matching rows; returns rows affected.
    async fn delete_matching(&self, plan: &QueryPlan, hard: bool) -> RepoResult<u64>;
}

/// Runs a read plan and returns its result in the JSON shape the cache stores.
///
/// # Errors
/// Propagates store failures.
pub async fn run_plan(store: &dyn StoreAdapter, plan: &QueryPlan) -> RepoResult<Value> {
    let value = match plan.kind {
        PlanKind::Get | PlanKind::List | PlanKind::Page => serde_json::to_value(store.execute(plan).await?)?,
        PlanKind::Exists => Value::Bool(!store.execute(plan).await?.is_empty()),
        PlanKind::Count => {
            let rows = store.execute_scalar(plan).await?;
            rows.first().and_then(|r| r.get(AggregateOp::Count)).cloned().unwrap_or_else(|| Value::from(0))
        }
        PlanKind::Aggregate => serde_json::to_value(store.execute_scalar(plan).await?)?,
        PlanKind::Search => serde_json::to_value(store.search(plan).await?)?,
    };
    Ok(value)
}
