use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};

use super::{InsertMode, InsertOutcome, RankedEntity, RowConflict, StoreAdapter};
use crate::errors::{RepoError, RepoResult};
use crate::query::fulltext::{analyze, parse_query};
use crate::query::{
    AggregateOp, AggregationRow, AggregationSpec, Order, QueryPlan, Row, SortSpec, compare_values,
    eval_predicate,
};
use crate::types::{self, Entity, EntityId, Patch};

type Table = BTreeMap<EntityId, Entity>;
type Tables = HashMap<String, Table>;

/// Reference store keeping every entity type in an ordered map.
///
/// Plans are evaluated row by row with the same predicate semantics the SQL
/// renderer emits. Unique constraints are declared per entity type with
/// [`InMemoryStore::with_unique`] and checked across live and soft-deleted rows.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    unique: RwLock<HashMap<String, Vec<String>>>,
    calls: AtomicU64,
    clock: Mutex<DateTime<Utc>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_unique(self, entity_type: &str, fields: &[&str]) -> Self {
        self.unique
            .write()
            .insert(entity_type.to_string(), fields.iter().map(|f| (*f).to_string()).collect());
        self
    }

    /// Number of adapter calls served so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(AtomicOrdering::Relaxed)
    }

    pub fn reset_calls(&self) {
        self.calls.store(0, AtomicOrdering::Relaxed);
    }

    /// Rows stored for an entity type, soft-deleted ones included.
    pub fn len(&self, entity_type: &str) -> usize {
        self.tables.read().get(entity_type).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, entity_type: &str) -> bool {
        self.len(entity_type) == 0
    }

    pub fn snapshot(&self, entity_type: &str) -> Vec<Entity> {
        self.tables.read().get(entity_type).map(|t| t.values().cloned().collect()).unwrap_or_default()
    }

    fn hit(&self) {
        self.calls.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Strictly increasing timestamp so `created_at` orders insertion.
    fn tick(&self) -> DateTime<Utc> {
        let mut last = self.clock.lock();
        let now = types::now();
        let next = if now > *last { now } else { *last + TimeDelta::microseconds(1) };
        *last = next;
        next
    }

    fn unique_fields(&self, entity_type: &str) -> Vec<String> {
        self.unique.read().get(entity_type).cloned().unwrap_or_default()
    }
}

fn joined_rows(tables: &Tables, plan: &QueryPlan, entity: &Entity) -> HashMap<String, Entity> {
    let mut joined = HashMap::new();
    for join in &plan.joins {
        let Some(related) = tables.get(&join.entity_type) else { continue };
        let Some(key) = entity.data.get(&join.local_key).and_then(Value::as_str) else { continue };
        let Ok(id) = EntityId::parse(key) else { continue };
        if let Some(row) = related.get(&id) {
            joined.insert(join.relation.clone(), row.clone());
        }
    }
    joined
}

fn matching(tables: &Tables, plan: &QueryPlan) -> Vec<Entity> {
    let Some(table) = tables.get(&plan.entity_type) else { return Vec::new() };
    table
        .values()
        .filter(|e| {
            let joined = joined_rows(tables, plan, e);
            eval_predicate(&Row { entity: e, joined: &joined }, &plan.predicate)
        })
        .cloned()
        .collect()
}

fn compare_by(order: &[SortSpec], a: &Entity, b: &Entity) -> Ordering {
    for spec in order {
        let av = a.field(&spec.field).unwrap_or(Value::Null);
        let bv = b.field(&spec.field).unwrap_or(Value::Null);
        let mut ord = compare_values(&av, &bv);
        if spec.order == Order::Desc {
            ord = ord.reverse();
        }
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn window<T>(rows: Vec<T>, plan: &QueryPlan) -> Vec<T> {
    let (offset, limit) = plan.pagination.window();
    let it = rows.into_iter().skip(offset);
    match limit {
        Some(n) => it.take(n).collect(),
        None => it.collect(),
    }
}

fn unique_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// First unique field whose value collides with a row in `others`.
fn find_conflict<'a>(
    unique: &[String],
    row: &Entity,
    others: impl Iterator<Item = &'a Entity> + Clone,
) -> Option<(String, String)> {
    for field in unique {
        let Some(v) = row.data.get(field).filter(|v| !v.is_null()) else { continue };
        if others.clone().any(|o| o.id != row.id && o.data.get(field) == Some(v)) {
            return Some((field.clone(), unique_key(v)));
        }
    }
    None
}

fn sum_values(values: &[&Value]) -> Value {
    let nums: Vec<&serde_json::Number> = values
        .iter()
        .filter_map(|v| if let Value::Number(n) = v { Some(n) } else { None })
        .collect();
    if nums.is_empty() {
        return Value::Null;
    }
    if nums.iter().all(|n| n.is_i64()) {
        let total = nums.iter().try_fold(0i64, |acc, n| acc.checked_add(n.as_i64().unwrap_or(0)));
        if let Some(total) = total {
            return Value::from(total);
        }
    }
    Value::from(nums.iter().filter_map(|n| n.as_f64()).sum::<f64>())
}

fn aggregate_group(spec: &AggregationSpec, rows: &[&Entity]) -> BTreeMap<AggregateOp, Value> {
    let owned: Vec<Value> = if spec.field == "*" {
        Vec::new()
    } else {
        rows.iter().filter_map(|e| e.field(&spec.field)).filter(|v| !v.is_null()).collect()
    };
    let values: Vec<&Value> = owned.iter().collect();
    let mut out = BTreeMap::new();
    for op in &spec.operations {
        let v = match op {
            AggregateOp::Count if spec.field == "*" => Value::from(rows.len()),
            AggregateOp::Count => Value::from(values.len()),
            AggregateOp::Sum => sum_values(&values),
            AggregateOp::Avg => {
                let nums: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();
                if nums.is_empty() {
                    Value::Null
                } else {
                    #[allow(clippy::cast_precision_loss)]
                    let n = nums.len() as f64;
                    Value::from(nums.iter().sum::<f64>() / n)
                }
            }
            AggregateOp::Min => {
                values.iter().min_by(|a, b| compare_values(a, b)).map_or(Value::Null, |v| (*v).clone())
            }
            AggregateOp::Max => {
                values.iter().max_by(|a, b| compare_values(a, b)).map_or(Value::Null, |v| (*v).clone())
            }
        };
        out.insert(*op, v);
    }
    out
}

#[async_trait]
impl StoreAdapter for InMemoryStore {
    async fn execute(&self, plan: &QueryPlan) -> RepoResult<Vec<Entity>> {
        self.hit();
        let mut rows = matching(&self.tables.read(), plan);
        let order = plan.effective_order();
        rows.sort_by(|a, b| compare_by(&order, a, b));
        let mut rows = window(rows, plan);
        if let Some(fields) = &plan.projection {
            for row in &mut rows {
                row.project(fields);
            }
        }
        Ok(rows)
    }

    async fn execute_scalar(&self, plan: &QueryPlan) -> RepoResult<Vec<AggregationRow>> {
        self.hit();
        let rows = matching(&self.tables.read(), plan);
        let spec = plan.aggregation.clone().unwrap_or_else(|| AggregationSpec {
            field: "*".into(),
            operations: vec![AggregateOp::Count],
            group_by: Vec::new(),
        });
        if spec.group_by.is_empty() {
            let refs: Vec<&Entity> = rows.iter().collect();
            return Ok(vec![AggregationRow { group: Map::new(), values: aggregate_group(&spec, &refs) }]);
        }
        let mut groups: Vec<(Vec<Value>, Vec<&Entity>)> = Vec::new();
        for row in &rows {
            let key: Vec<Value> =
                spec.group_by.iter().map(|g| row.field(g).unwrap_or(Value::Null)).collect();
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, members)) => members.push(row),
                None => groups.push((key, vec![row])),
            }
        }
        groups.sort_by(|(a, _), (b, _)| compare_values(&Value::Array(a.clone()), &Value::Array(b.clone())));
        Ok(groups
            .into_iter()
            .map(|(key, members)| AggregationRow {
                group: spec.group_by.iter().cloned().zip(key).collect(),
                values: aggregate_group(&spec, &members),
            })
            .collect())
    }

    async fn search(&self, plan: &QueryPlan) -> RepoResult<Vec<RankedEntity>> {
        self.hit();
        let spec = plan
            .search
            .as_ref()
            .ok_or_else(|| RepoError::Validation("search plan without search clause".into()))?;
        let query = parse_query(&spec.query, spec.mode, spec.language)?;
        let rows = matching(&self.tables.read(), plan);
        let mut hits: Vec<RankedEntity> = rows
            .into_iter()
            .filter_map(|entity| {
                let text = spec
                    .fields
                    .iter()
                    .filter_map(|f| entity.field(f))
                    .map(|v| match v {
                        Value::String(s) => s,
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(" ");
                let rank = query.rank(&analyze(&text, spec.language))?;
                (rank >= spec.min_rank.unwrap_or(0.0)).then_some(RankedEntity { entity, rank })
            })
            .collect();
        if plan.order_by.is_empty() {
            hits.sort_by(|a, b| b.rank.total_cmp(&a.rank).then_with(|| a.entity.id.cmp(&b.entity.id)));
        } else {
            let order = plan.effective_order();
            hits.sort_by(|a, b| compare_by(&order, &a.entity, &b.entity));
        }
        Ok(window(hits, plan))
    }

    async fn insert(&self, entity_type: &str, rows: Vec<Entity>, mode: InsertMode) -> RepoResult<InsertOutcome> {
        self.hit();
        let unique = self.unique_fields(entity_type);
        let mut tables = self.tables.write();
        let table = tables.entry(entity_type.to_string()).or_default();
        let mut accepted: Vec<Entity> = Vec::with_capacity(rows.len());
        let mut conflicts = Vec::new();
        for (index, mut row) in rows.into_iter().enumerate() {
            let at = self.tick();
            row.created_at = at;
            row.updated_at = at;
            match find_conflict(&unique, &row, table.values().chain(accepted.iter())) {
                Some((field, value)) => match mode {
                    InsertMode::Atomic => {
                        return Err(RepoError::Conflict { entity_type: entity_type.to_string(), field, value });
                    }
                    InsertMode::SkipConflicts => conflicts.push(RowConflict { index, field, value }),
                },
                None => accepted.push(row),
            }
        }
        let inserted = accepted.iter().map(|e| e.id).collect();
        for row in accepted {
            table.insert(row.id, row);
        }
        Ok(InsertOutcome { inserted, conflicts })
    }

    async fn update_matching(&self, plan: &QueryPlan, patch: &Patch) -> RepoResult<u64> {
        self.hit();
        let unique = self.unique_fields(&plan.entity_type);
        let mut tables = self.tables.write();
        let targets = matching(&tables, plan);
        if targets.is_empty() {
            return Ok(0);
        }
        let at = self.tick();
        let staged: Vec<Entity> = targets
            .into_iter()
            .map(|mut e| {
                patch.apply(&mut e, at);
                e
            })
            .collect();
        let Some(table) = tables.get_mut(&plan.entity_type) else { return Ok(0) };
        for row in &staged {
            let untouched = table.values().filter(|o| !staged.iter().any(|s| s.id == o.id));
            if let Some((field, value)) = find_conflict(&unique, row, untouched.chain(staged.iter())) {
                return Err(RepoError::Conflict { entity_type: plan.entity_type.clone(), field, value });
            }
        }
        let n = staged.len() as u64;
        for row in staged {
            table.insert(row.id, row);
        }
        Ok(n)
    }

    async fn delete_matching(&self, plan: &QueryPlan, hard: bool) -> RepoResult<u64> {
        self.hit();
        let mut tables = self.tables.write();
        let ids: Vec<EntityId> = matching(&tables, plan).into_iter().map(|e| e.id).collect();
        let at = self.tick();
        let Some(table) = tables.get_mut(&plan.entity_type) else { return Ok(0) };
        for id in &ids {
            if hard {
                table.remove(id);
            } else if let Some(row) = table.get_mut(id)
                && row.deleted_at.is_none()
            {
                row.deleted_at = Some(at);
                row.updated_at = at;
            }
        }
        Ok(ids.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{FilterCompiler, Pagination, PlanKind, parse_filter_value};
    use crate::schema::SchemaRegistry;
    use serde_json::json;
    use std::sync::Arc;

    fn entity(v: Value) -> Entity {
        Entity::new(v.as_object().cloned().unwrap())
    }

    fn plan(filter: Value, kind: PlanKind) -> QueryPlan {
        let c = FilterCompiler::new(Arc::new(SchemaRegistry::new()));
        let f = c.compile("items", &parse_filter_value(&filter).unwrap()).unwrap();
        QueryPlan::new("items", kind, f).scoped(false)
    }

    #[tokio::test]
    async fn insert_assigns_increasing_timestamps() {
        let store = InMemoryStore::new();
        let rows = (0..5).map(|i| entity(json!({"n": i}))).collect();
        store.insert("items", rows, InsertMode::Atomic).await.unwrap();
        let listed = store
            .execute(&plan(json!({}), PlanKind::List).order_by(vec![SortSpec::asc("created_at")]))
            .await
            .unwrap();
        let ns: Vec<i64> = listed.iter().map(|e| e.data["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![0, 1, 2, 3, 4]);
        assert_eq!(store.calls(), 2);
    }

    #[tokio::test]
    async fn atomic_insert_writes_nothing_on_conflict() {
        let store = InMemoryStore::new().with_unique("items", &["sku"]);
        store.insert("items", vec![entity(json!({"sku": "a"}))], InsertMode::Atomic).await.unwrap();
        let err = store
            .insert("items", vec![entity(json!({"sku": "b"})), entity(json!({"sku": "a"}))], InsertMode::Atomic)
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::Conflict { ref field, .. } if field == "sku"));
        assert_eq!(store.len("items"), 1);

        let out = store
            .insert("items", vec![entity(json!({"sku": "c"})), entity(json!({"sku": "c"}))], InsertMode::SkipConflicts)
            .await
            .unwrap();
        assert_eq!(out.inserted.len(), 1);
        assert_eq!(out.conflicts, vec![RowConflict { index: 1, field: "sku".into(), value: "c".into() }]);
    }

    #[tokio::test]
    async fn soft_delete_hides_rows_from_scoped_plans() {
        let store = InMemoryStore::new();
        let rows = vec![entity(json!({"n": 1})), entity(json!({"n": 2}))];
        store.insert("items", rows, InsertMode::Atomic).await.unwrap();
        let n = store.delete_matching(&plan(json!({"n": 1}), PlanKind::List), false).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(store.execute(&plan(json!({}), PlanKind::List)).await.unwrap().len(), 1);
        assert_eq!(store.len("items"), 2);
        let n = store.delete_matching(&plan(json!({}), PlanKind::List), true).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(store.len("items"), 1);
    }

    #[tokio::test]
    async fn grouped_aggregation() {
        let store = InMemoryStore::new();
        let rows = vec![
            entity(json!({"cat": "a", "price": 10})),
            entity(json!({"cat": "a", "price": 5})),
            entity(json!({"cat": "b", "price": 2.5})),
            entity(json!({"cat": "b"})),
        ];
        store.insert("items", rows, InsertMode::Atomic).await.unwrap();
        let spec = AggregationSpec {
            field: "price".into(),
            operations: vec![AggregateOp::Count, AggregateOp::Sum, AggregateOp::Max],
            group_by: vec!["cat".into()],
        };
        let out = store.execute_scalar(&plan(json!({}), PlanKind::Aggregate).aggregate(spec)).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].group["cat"], json!("a"));
        assert_eq!(out[0].get(AggregateOp::Sum), Some(&json!(15)));
        assert_eq!(out[1].get(AggregateOp::Count), Some(&json!(1)));
        assert_eq!(out[1].get(AggregateOp::Max), Some(&json!(2.5)));
    }

    #[tokio::test]
    async fn update_respects_unique_fields() {
        let store = InMemoryStore::new().with_unique("items", &["sku"]);
        let rows = vec![entity(json!({"sku": "a", "n": 1})), entity(json!({"sku": "b", "n": 2}))];
        store.insert("items", rows, InsertMode::Atomic).await.unwrap();
        let err = store
            .update_matching(&plan(json!({"n": 2}), PlanKind::List), &Patch::default().set("sku", "a"))
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::Conflict { .. }));
        let n = store
            .update_matching(&plan(json!({}), PlanKind::List), &Patch::default().inc("n", 1.0))
            .await
            .unwrap();
        assert_eq!(n, 2);
        let paged = store
            .execute(
                &plan(json!({}), PlanKind::List)
                    .order_by(vec![SortSpec::desc("n")])
                    .paginate(Pagination::Offset { limit: 1, offset: 0 }),
            )
            .await
            .unwrap();
        assert_eq!(paged[0].data["n"], json!(3));
    }
}
