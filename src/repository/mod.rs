//! Entity repositories. A [`Repository`] is bound to one entity type and
//! exposes its operations through small capability traits:
//! [`Creatable`] (CRUD), [`Searchable`] (full-text, complex filters,
//! aggregation, cursor pages), [`Bulkable`] (batched mutations) and
//! [`Eventable`] (access to the event bridge).

mod bulk;
mod crud;
mod search;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cache::CacheManager;
use crate::errors::{RepoError, RepoResult};
use crate::events::EventBridge;
use crate::query::{
    AggregateOp, AggregationRow, ComplexFilter, CompiledFilter, CursorPage, Direction, FilterCompiler,
    FilterInput, Language, MAX_SORT_FIELDS, Order, PlanKind, Predicate, QueryPlan, SearchMode, SortSpec,
};
use crate::schema::{EntitySchema, FieldType, SchemaRegistry};
use crate::store::{StoreAdapter, run_plan};
use crate::telemetry::Telemetry;
use crate::types::{BUILTIN_FIELDS, Entity, EntityId, Patch};

/// Ordering, window and scope of a list read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListOptions {
    pub order_by: Vec<SortSpec>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub include_deleted: bool,
    pub fields: Option<Vec<String>>,
}

impl ListOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn order_by(mut self, spec: SortSpec) -> Self {
        self.order_by.push(spec);
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    #[must_use]
    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    #[must_use]
    pub fn fields(mut self, fields: &[&str]) -> Self {
        self.fields = Some(fields.iter().map(|f| (*f).to_string()).collect());
        self
    }
}

/// Full-text query. Empty `fields` falls back to the schema's search fields.
#[derive(Debug, Clone, PartialEq)]
pub struct FulltextRequest {
    pub fields: Vec<String>,
    pub query: String,
    pub mode: SearchMode,
    pub language: Language,
    pub min_rank: Option<f64>,
    pub include_rank: bool,
    pub limit: Option<usize>,
    pub filters: FilterInput,
    /// Overrides the default rank-descending order.
    pub order_by: Vec<SortSpec>,
}

impl FulltextRequest {
    #[must_use]
    pub fn new(query: &str) -> Self {
        Self {
            fields: Vec::new(),
            query: query.to_string(),
            mode: SearchMode::default(),
            language: Language::default(),
            min_rank: None,
            include_rank: true,
            limit: None,
            filters: FilterInput::default(),
            order_by: Vec::new(),
        }
    }

    #[must_use]
    pub fn fields(mut self, fields: &[&str]) -> Self {
        self.fields = fields.iter().map(|f| (*f).to_string()).collect();
        self
    }

    #[must_use]
    pub fn mode(mut self, mode: SearchMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn language(mut self, language: Language) -> Self {
        self.language = language;
        self
    }

    #[must_use]
    pub fn min_rank(mut self, min_rank: f64) -> Self {
        self.min_rank = Some(min_rank);
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn filters(mut self, filters: FilterInput) -> Self {
        self.filters = filters;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub entity: Entity,
    pub rank: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRequest {
    /// Column to aggregate; `*` counts rows.
    pub field: String,
    pub operations: Vec<AggregateOp>,
    pub group_by: Vec<String>,
    pub filters: FilterInput,
}

impl AggregateRequest {
    #[must_use]
    pub fn new(field: &str, operations: &[AggregateOp]) -> Self {
        Self {
            field: field.to_string(),
            operations: operations.to_vec(),
            group_by: Vec::new(),
            filters: FilterInput::default(),
        }
    }

    #[must_use]
    pub fn group_by(mut self, fields: &[&str]) -> Self {
        self.group_by = fields.iter().map(|f| (*f).to_string()).collect();
        self
    }

    #[must_use]
    pub fn filters(mut self, filters: FilterInput) -> Self {
        self.filters = filters;
        self
    }
}

/// Keyset page request. With a `cursor`, the direction recorded in the token
/// wins; without one, `Next` starts at the first row and `Prev` at the last.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorRequest {
    pub field: String,
    pub order: Order,
    pub cursor: Option<String>,
    pub direction: Direction,
    pub limit: usize,
    pub filters: FilterInput,
}

impl CursorRequest {
    #[must_use]
    pub fn new(field: &str, limit: usize) -> Self {
        Self {
            field: field.to_string(),
            order: Order::Asc,
            cursor: None,
            direction: Direction::Next,
            limit,
            filters: FilterInput::default(),
        }
    }

    #[must_use]
    pub fn order(mut self, order: Order) -> Self {
        self.order = order;
        self
    }

    #[must_use]
    pub fn cursor(mut self, cursor: Option<String>) -> Self {
        self.cursor = cursor;
        self
    }

    #[must_use]
    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    #[must_use]
    pub fn filters(mut self, filters: FilterInput) -> Self {
        self.filters = filters;
        self
    }
}

/// Cooperative cancellation flag checked between bulk batches.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BulkOptions {
    /// Rows per batch; the engine default when `None`.
    pub batch_size: Option<usize>,
    pub emit_events: bool,
    /// Skip conflicting rows instead of failing their whole batch.
    pub ignore_conflicts: bool,
    pub cancel: Option<CancelFlag>,
}

impl BulkOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = Some(n);
        self
    }

    #[must_use]
    pub fn emit_events(mut self) -> Self {
        self.emit_events = true;
        self
    }

    #[must_use]
    pub fn ignore_conflicts(mut self) -> Self {
        self.ignore_conflicts = true;
        self
    }

    #[must_use]
    pub fn cancel(mut self, flag: CancelFlag) -> Self {
        self.cancel = Some(flag);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelFlag::is_cancelled)
    }
}

/// Per-call accounting of a bulk mutation. Row failures land in `errors`
/// instead of failing the call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkOperationResult {
    pub success_count: usize,
    pub error_count: usize,
    pub created_ids: Vec<EntityId>,
    pub updated_ids: Vec<EntityId>,
    pub deleted_ids: Vec<EntityId>,
    pub errors: Vec<String>,
}

impl BulkOperationResult {
    #[must_use]
    pub fn total(&self) -> usize {
        self.success_count + self.error_count
    }

    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.success_count > 0 && self.error_count > 0
    }
}

#[async_trait]
pub trait Creatable: Send + Sync {
    /// # Errors
    /// `Conflict` on a unique violation; validation and hook errors before the write.
    async fn create(&self, data: Map<String, Value>, emit_event: bool) -> RepoResult<Entity>;
    async fn get(&self, id: EntityId, include_deleted: bool) -> RepoResult<Option<Entity>>;
    /// Applies `patch` to the stored row; fields absent from the patch are untouched.
    async fn update(&self, entity: &Entity, patch: Patch, emit_event: bool) -> RepoResult<Entity>;
    async fn remove(&self, id: EntityId, soft_delete: bool, emit_event: bool) -> RepoResult<Entity>;
    async fn restore(&self, id: EntityId, emit_event: bool) -> RepoResult<Entity>;
    async fn list(&self, filters: &FilterInput, opts: &ListOptions) -> RepoResult<Vec<Entity>>;
    async fn count(&self, filters: &FilterInput) -> RepoResult<u64>;
    async fn exists(&self, filters: &FilterInput) -> RepoResult<bool>;
    /// Exactly-one lookup: `MultipleResults` when more than one row matches.
    async fn get_by(&self, filters: &FilterInput) -> RepoResult<Option<Entity>>;
}

#[async_trait]
pub trait Searchable: Send + Sync {
    async fn fulltext_search(&self, req: &FulltextRequest) -> RepoResult<Vec<SearchHit>>;
    async fn list_with_complex_filters(
        &self,
        filter: &ComplexFilter,
        order_by: Vec<SortSpec>,
        limit: Option<usize>,
    ) -> RepoResult<Vec<Entity>>;
    async fn aggregate(&self, req: &AggregateRequest) -> RepoResult<Vec<AggregationRow>>;
    async fn paginate_cursor(&self, req: &CursorRequest) -> RepoResult<CursorPage>;
}

#[async_trait]
pub trait Bulkable: Send + Sync {
    async fn bulk_create(&self, rows: Vec<Map<String, Value>>, opts: &BulkOptions) -> RepoResult<BulkOperationResult>;
    async fn bulk_update(&self, filters: &FilterInput, patch: Patch, opts: &BulkOptions) -> RepoResult<BulkOperationResult>;
    async fn bulk_delete(&self, filters: &FilterInput, soft_delete: bool, opts: &BulkOptions) -> RepoResult<BulkOperationResult>;
}

pub trait Eventable {
    fn events(&self) -> &EventBridge;
}

/// Collaborators shared by every repository of one engine.
#[derive(Clone)]
pub(crate) struct Shared {
    pub store: Arc<dyn StoreAdapter>,
    pub cache: Arc<CacheManager>,
    pub registry: Arc<SchemaRegistry>,
    pub events: EventBridge,
    pub telemetry: Arc<Telemetry>,
    pub default_limit: usize,
    pub max_limit: usize,
    pub batch_size: usize,
}

/// Repository for one entity type.
#[derive(Clone)]
pub struct Repository {
    entity_type: String,
    shared: Shared,
    compiler: FilterCompiler,
}

impl Eventable for Repository {
    fn events(&self) -> &EventBridge {
        &self.shared.events
    }
}

impl Repository {
    pub(crate) fn new(entity_type: &str, shared: Shared) -> Self {
        let compiler = FilterCompiler::new(Arc::clone(&shared.registry));
        Self { entity_type: entity_type.to_string(), shared, compiler }
    }

    #[must_use]
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    #[must_use]
    pub fn schema(&self) -> Arc<EntitySchema> {
        self.shared.registry.get(&self.entity_type)
    }

    pub(crate) fn compile(&self, filters: &FilterInput) -> RepoResult<CompiledFilter> {
        self.compiler.compile(&self.entity_type, filters)
    }

    /// Plan over `filters` with the soft-delete scope applied unless requested otherwise.
    pub(crate) fn plan(&self, kind: PlanKind, filters: &FilterInput, include_deleted: bool) -> RepoResult<QueryPlan> {
        Ok(QueryPlan::new(&self.entity_type, kind, self.compile(filters)?).scoped(include_deleted))
    }

    /// Plan addressing rows by id, bypassing filter compilation.
    pub(crate) fn id_plan(&self, ids: &[EntityId], include_deleted: bool) -> QueryPlan {
        let filter = CompiledFilter { predicate: Predicate::id_in(ids), joins: Vec::new() };
        QueryPlan::new(&self.entity_type, PlanKind::List, filter).scoped(include_deleted)
    }

    fn effective_limit(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.shared.default_limit).min(self.shared.max_limit)
    }

    /// Resolves a top-level column; nested paths are rejected.
    fn check_column(schema: &EntitySchema, field: &str) -> RepoResult<Option<FieldType>> {
        if field.contains('.') || field.contains("__") {
            return Err(RepoError::Validation(format!("{field} must be a top-level column")));
        }
        schema.resolve_field(field)
    }

    /// Checks that `field` is a top-level column the store can order by.
    fn check_sort_field(&self, schema: &EntitySchema, field: &str) -> RepoResult<Option<FieldType>> {
        let ty = Self::check_column(schema, field)?;
        if let Some(t) = ty
            && !t.is_orderable()
        {
            return Err(RepoError::Validation(format!("{field} ({}) is not orderable", t.name())));
        }
        Ok(ty)
    }

    fn check_order(&self, order_by: &[SortSpec]) -> RepoResult<()> {
        if order_by.len() > MAX_SORT_FIELDS {
            return Err(RepoError::Validation(format!("at most {MAX_SORT_FIELDS} sort fields")));
        }
        let schema = self.schema();
        for spec in order_by {
            self.check_sort_field(&schema, &spec.field)?;
        }
        Ok(())
    }

    /// Validates a patch against the schema before it reaches the store.
    fn check_patch(&self, patch: &Patch) -> RepoResult<()> {
        let schema = self.schema();
        schema.validate_data(&patch.set)?;
        for (field, _) in &patch.inc {
            let top = field.split('.').next().unwrap_or(field);
            if BUILTIN_FIELDS.contains(&top) {
                return Err(RepoError::Validation(format!("{top} is generated and cannot be written")));
            }
            if let Some(ty) = schema.resolve_field(top)?
                && top == field.as_str()
                && !ty.is_numeric()
            {
                return Err(RepoError::TypeMismatch {
                    field: field.clone(),
                    expected: "number".into(),
                    found: ty.name().to_string(),
                });
            }
        }
        for field in &patch.unset {
            let top = field.split('.').next().unwrap_or(field);
            if BUILTIN_FIELDS.contains(&top) {
                return Err(RepoError::Validation(format!("{top} is generated and cannot be removed")));
            }
            schema.resolve_field(top)?;
        }
        Ok(())
    }

    /// Cached execution of a read plan, recorded in telemetry.
    pub(crate) async fn read(&self, plan: &QueryPlan) -> RepoResult<Value> {
        let started = Instant::now();
        let store = self.shared.store.as_ref();
        let loaded = self.shared.cache.get_or_load(plan, || run_plan(store, plan)).await?;
        self.shared.telemetry.record_query(
            &self.entity_type,
            plan.kind.name(),
            loaded.fingerprint.as_str(),
            started.elapsed(),
            loaded.from_cache,
        );
        Ok(loaded.value)
    }

    pub(crate) async fn read_entities(&self, plan: &QueryPlan) -> RepoResult<Vec<Entity>> {
        Ok(serde_json::from_value(self.read(plan).await?)?)
    }

    /// Uncached rows by id, straight from the store.
    pub(crate) async fn fetch_fresh(&self, ids: &[EntityId], include_deleted: bool) -> RepoResult<Vec<Entity>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.shared.store.execute(&self.id_plan(ids, include_deleted)).await
    }

    pub(crate) async fn fetch_one(&self, id: EntityId, include_deleted: bool) -> RepoResult<Entity> {
        self.fetch_fresh(&[id], include_deleted)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RepoError::not_found(&self.entity_type, id))
    }

    /// Drops every cached read of this entity type before a mutation returns.
    pub(crate) async fn invalidate(&self) {
        self.shared.cache.invalidate_entity(&self.entity_type).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_result_accounting() {
        let r = BulkOperationResult { success_count: 3, error_count: 1, ..Default::default() };
        assert_eq!(r.total(), 4);
        assert!(r.is_partial());
        assert!(!BulkOperationResult::default().is_partial());
    }

    #[test]
    fn cancel_flag_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let opts = BulkOptions::new().cancel(flag.clone());
        assert!(!opts.is_cancelled());
        flag.cancel();
        assert!(opts.is_cancelled());
    }
}
