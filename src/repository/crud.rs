use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{Creatable, ListOptions, Repository};
use crate::errors::{RepoError, RepoResult};
use crate::query::{CompiledFilter, FilterInput, Pagination, PlanKind, Predicate, QueryPlan};
use crate::store::InsertMode;
use crate::types::{DeletedAtChange, Entity, EntityId, Patch};

impl Repository {
    fn audit(&self, op: &str, affected: u64) {
        self.shared.telemetry.record_write(op, &self.entity_type, affected, None);
    }
}

#[async_trait]
impl Creatable for Repository {
    async fn create(&self, mut data: Map<String, Value>, emit_event: bool) -> RepoResult<Entity> {
        let events = &self.shared.events;
        events.before_create(&self.entity_type, &mut data).await?;
        self.schema().validate_data(&data)?;
        let entity = Entity::new(data);
        let id = entity.id;
        self.shared.store.insert(&self.entity_type, vec![entity], InsertMode::Atomic).await?;
        self.invalidate().await;
        let created = self.fetch_one(id, true).await?;
        self.audit("create", 1);
        events.after_create(&self.entity_type, &created).await;
        if emit_event {
            events.emit_created(&self.entity_type, &created).await;
        }
        Ok(created)
    }

    async fn get(&self, id: EntityId, include_deleted: bool) -> RepoResult<Option<Entity>> {
        let filter = CompiledFilter { predicate: Predicate::id_eq(&id), joins: Vec::new() };
        let plan = QueryPlan::new(&self.entity_type, PlanKind::Get, filter)
            .scoped(include_deleted)
            .paginate(Pagination::Offset { limit: 1, offset: 0 });
        Ok(self.read_entities(&plan).await?.into_iter().next())
    }

    async fn update(&self, entity: &Entity, mut patch: Patch, emit_event: bool) -> RepoResult<Entity> {
        let events = &self.shared.events;
        let current = self.fetch_one(entity.id, false).await?;
        events.before_update(&self.entity_type, &current, &mut patch).await?;
        self.check_patch(&patch)?;
        if patch.is_empty() {
            return Ok(current);
        }
        let matched = self.shared.store.update_matching(&self.id_plan(&[current.id], false), &patch).await?;
        if matched == 0 {
            return Err(RepoError::not_found(&self.entity_type, current.id));
        }
        self.invalidate().await;
        let updated = self.fetch_one(current.id, true).await?;
        self.audit("update", matched);
        events.after_update(&self.entity_type, &current, &updated).await;
        if emit_event {
            events.emit_updated(&self.entity_type, &current, &updated).await;
        }
        Ok(updated)
    }

    /// Soft removal needs a live row; hard removal also purges soft-deleted ones.
    async fn remove(&self, id: EntityId, soft_delete: bool, emit_event: bool) -> RepoResult<Entity> {
        let events = &self.shared.events;
        let hard = !soft_delete;
        let current = self.fetch_one(id, hard).await?;
        events.before_delete(&self.entity_type, &current, soft_delete).await?;
        let affected = self.shared.store.delete_matching(&self.id_plan(&[id], hard), hard).await?;
        if affected == 0 {
            return Err(RepoError::not_found(&self.entity_type, id));
        }
        self.invalidate().await;
        let stamped = if soft_delete { Some(self.fetch_one(id, true).await?) } else { None };
        self.audit(if soft_delete { "soft_delete" } else { "hard_delete" }, affected);
        let result = stamped.clone().unwrap_or_else(|| current.clone());
        events.after_delete(&self.entity_type, &result, soft_delete).await;
        if emit_event {
            events.emit_deleted(&self.entity_type, &current, stamped.as_ref()).await;
        }
        Ok(result)
    }

    async fn restore(&self, id: EntityId, emit_event: bool) -> RepoResult<Entity> {
        let events = &self.shared.events;
        let current = self.fetch_one(id, true).await?;
        if !current.is_deleted() {
            return Ok(current);
        }
        let mut patch = Patch { deleted_at: DeletedAtChange::Clear, ..Patch::default() };
        events.before_update(&self.entity_type, &current, &mut patch).await?;
        self.check_patch(&patch)?;
        self.shared.store.update_matching(&self.id_plan(&[id], true), &patch).await?;
        self.invalidate().await;
        let restored = self.fetch_one(id, true).await?;
        self.audit("restore", 1);
        events.after_update(&self.entity_type, &current, &restored).await;
        if emit_event {
            events.emit_updated(&self.entity_type, &current, &restored).await;
        }
        Ok(restored)
    }

    async fn list(&self, filters: &FilterInput, opts: &ListOptions) -> RepoResult<Vec<Entity>> {
        self.check_order(&opts.order_by)?;
        if let Some(fields) = &opts.fields {
            let schema = self.schema();
            for f in fields {
                schema.resolve_field(f.split('.').next().unwrap_or(f))?;
            }
        }
        let limit = self.effective_limit(opts.limit);
        let plan = self
            .plan(PlanKind::List, filters, opts.include_deleted)?
            .order_by(opts.order_by.clone())
            .paginate(Pagination::Offset { limit, offset: opts.offset })
            .project(opts.fields.clone());
        self.read_entities(&plan).await
    }

    async fn count(&self, filters: &FilterInput) -> RepoResult<u64> {
        let plan = self.plan(PlanKind::Count, filters, false)?;
        let value = self.read(&plan).await?;
        value
            .as_u64()
            .ok_or_else(|| RepoError::Store(format!("count returned non-integer {value}")))
    }

    async fn exists(&self, filters: &FilterInput) -> RepoResult<bool> {
        let plan = self
            .plan(PlanKind::Exists, filters, false)?
            .paginate(Pagination::Offset { limit: 1, offset: 0 });
        Ok(self.read(&plan).await?.as_bool().unwrap_or(false))
    }

    async fn get_by(&self, filters: &FilterInput) -> RepoResult<Option<Entity>> {
        let plan = self
            .plan(PlanKind::List, filters, false)?
            .paginate(Pagination::Offset { limit: 2, offset: 0 });
        let mut rows = self.read_entities(&plan).await?;
        if rows.len() > 1 {
            let count = self.count(filters).await?;
            return Err(RepoError::MultipleResults { entity_type: self.entity_type.clone(), count });
        }
        Ok(rows.pop())
    }
}

impl Repository {
    /// Like [`Creatable::get`] but fails with `NotFound` instead of returning `None`.
    ///
    /// # Errors
    /// `NotFound` when no live row has this id.
    pub async fn get_or_fail(&self, id: EntityId) -> RepoResult<Entity> {
        self.get(id, false).await?.ok_or_else(|| RepoError::not_found(&self.entity_type, id))
    }

    /// Like [`Creatable::get_by`] but fails with `NotFoundBy` when nothing matches.
    ///
    /// # Errors
    /// `NotFoundBy` on no match, `MultipleResults` on more than one.
    pub async fn get_one_by(&self, filters: &FilterInput) -> RepoResult<Entity> {
        self.get_by(filters).await?.ok_or_else(|| RepoError::NotFoundBy {
            entity_type: self.entity_type.clone(),
            filter: format!("{filters:?}"),
        })
    }

    /// Ids of every live row matching `filters`, in id order.
    pub(crate) async fn matching_ids(&self, filters: &FilterInput, include_deleted: bool) -> RepoResult<Vec<EntityId>> {
        let plan = self.plan(PlanKind::List, filters, include_deleted)?.project(Some(vec!["id".into()]));
        Ok(self.shared.store.execute(&plan).await?.into_iter().map(|e| e.id).collect())
    }

    /// Rows addressed by `ids` that still match `predicate`.
    pub(crate) async fn still_matching(&self, ids: &[EntityId], predicate: &Predicate) -> RepoResult<Vec<Entity>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let plan = self.id_plan(ids, true).restrict(predicate.clone());
        self.shared.store.execute(&plan).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Engine;
    use crate::config::EngineConfig;
    use crate::events::CapturingSink;
    use crate::query::{FilterExpression, Operator};
    use crate::store::InMemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    fn setup() -> (Arc<InMemoryStore>, Arc<CapturingSink>, Repository) {
        let store = Arc::new(InMemoryStore::new().with_unique("users", &["email"]));
        let sink = Arc::new(CapturingSink::new());
        let engine = Engine::new(EngineConfig::default(), store.clone(), None)
            .unwrap()
            .with_event_sink(sink.clone());
        let repo = engine.repository("users").unwrap();
        (store, sink, repo)
    }

    #[tokio::test]
    async fn create_then_get_reads_through_cache() {
        let (store, sink, repo) = setup();
        let e = repo.create(obj(json!({"email": "a@x.com", "age": 30})), true).await.unwrap();
        assert_eq!(sink.len(), 1);
        let first = repo.get(e.id, false).await.unwrap().unwrap();
        let calls = store.calls();
        let second = repo.get(e.id, false).await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(store.calls(), calls);
    }

    #[tokio::test]
    async fn update_touches_only_patched_fields() {
        let (_, sink, repo) = setup();
        let e = repo.create(obj(json!({"email": "a@x.com", "age": 30, "name": "A"})), false).await.unwrap();
        let cached = repo.get(e.id, false).await.unwrap().unwrap();
        let u = repo.update(&e, Patch::default().set("age", 31).inc("logins", 1.0), true).await.unwrap();
        assert_eq!(u.data["age"], json!(31));
        assert_eq!(u.data["name"], json!("A"));
        assert_eq!(u.data["logins"], json!(1));
        assert!(u.updated_at > cached.updated_at);
        assert_eq!(repo.get(e.id, false).await.unwrap().unwrap(), u);
        let ev = sink.take();
        assert_eq!(ev.len(), 1);
        assert_eq!(ev[0].changed_fields, vec!["age", "logins"]);
    }

    #[tokio::test]
    async fn soft_delete_hides_row_and_restore_brings_it_back() {
        let (_, _, repo) = setup();
        let e = repo.create(obj(json!({"email": "a@x.com"})), false).await.unwrap();
        let by_id: FilterInput = FilterExpression::new().with("id", e.id.to_string()).into();
        assert!(repo.exists(&by_id).await.unwrap());

        let removed = repo.remove(e.id, true, false).await.unwrap();
        assert!(removed.deleted_at.is_some());
        assert!(!repo.exists(&by_id).await.unwrap());
        assert!(repo.get(e.id, false).await.unwrap().is_none());
        assert!(repo.get(e.id, true).await.unwrap().unwrap().is_deleted());
        assert!(matches!(repo.remove(e.id, true, false).await, Err(RepoError::NotFound { .. })));

        let restored = repo.restore(e.id, false).await.unwrap();
        assert!(restored.deleted_at.is_none());
        assert!(repo.exists(&by_id).await.unwrap());
    }

    #[tokio::test]
    async fn hard_delete_is_final() {
        let (store, sink, repo) = setup();
        let e = repo.create(obj(json!({"email": "a@x.com"})), false).await.unwrap();
        repo.remove(e.id, true, false).await.unwrap();
        repo.remove(e.id, false, true).await.unwrap();
        assert!(store.is_empty("users"));
        assert!(matches!(repo.restore(e.id, false).await, Err(RepoError::NotFound { .. })));
        let ev = sink.take();
        assert_eq!(ev.len(), 1);
        assert!(ev[0].new.is_none());
    }

    #[tokio::test]
    async fn get_by_requires_a_single_match() {
        let (_, _, repo) = setup();
        for (email, team) in [("a@x.com", "red"), ("b@x.com", "red"), ("c@x.com", "blue")] {
            repo.create(obj(json!({"email": email, "team": team})), false).await.unwrap();
        }
        let red: FilterInput = FilterExpression::new().with("team", "red").into();
        let err = repo.get_by(&red).await.unwrap_err();
        assert!(matches!(err, RepoError::MultipleResults { count: 2, .. }));
        let blue: FilterInput = FilterExpression::new().with("team", "blue").into();
        assert_eq!(repo.get_by(&blue).await.unwrap().unwrap().data["email"], json!("c@x.com"));
        let none: FilterInput = FilterExpression::new().with("team", "green").into();
        assert!(repo.get_by(&none).await.unwrap().is_none());
        assert!(matches!(repo.get_one_by(&none).await, Err(RepoError::NotFoundBy { .. })));
    }

    #[tokio::test]
    async fn duplicate_unique_field_conflicts() {
        let (_, sink, repo) = setup();
        repo.create(obj(json!({"email": "a@x.com"})), true).await.unwrap();
        let err = repo.create(obj(json!({"email": "a@x.com"})), true).await.unwrap_err();
        assert!(matches!(err, RepoError::Conflict { ref field, .. } if field == "email"));
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn writes_invalidate_cached_lists() {
        let (_, _, repo) = setup();
        let all = FilterInput::default();
        repo.create(obj(json!({"email": "a@x.com", "age": 20})), false).await.unwrap();
        assert_eq!(repo.count(&all).await.unwrap(), 1);
        repo.create(obj(json!({"email": "b@x.com", "age": 40})), false).await.unwrap();
        assert_eq!(repo.count(&all).await.unwrap(), 2);
        let adults: FilterInput = FilterExpression::new().with_op("age", Operator::parse("gte").unwrap(), 30).into();
        let rows = repo.list(&adults, &ListOptions::new()).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn list_rejects_nested_sort_keys() {
        let (_, _, repo) = setup();
        let opts = ListOptions::new().order_by(crate::query::SortSpec::asc("profile.age"));
        assert!(matches!(repo.list(&FilterInput::default(), &opts).await, Err(RepoError::Validation(_))));
    }

    #[tokio::test]
    async fn generated_fields_are_read_only() {
        let (_, _, repo) = setup();
        let err = repo.create(obj(json!({"id": "x"})), false).await.unwrap_err();
        assert!(matches!(err, RepoError::Validation(_)));
    }
}
