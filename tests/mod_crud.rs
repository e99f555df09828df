mod common;

use std::sync::Arc;

use async_trait::async_trait;
use common::{Fixture, obj};
use repolite::events::{EventKind, RepositoryHook};
use repolite::query::Operator;
use repolite::{Creatable, FilterExpression, FilterInput, ListOptions, Patch, RepoError, RepoResult, SortSpec};
use serde_json::{Map, Value, json};

fn by_id(id: repolite::EntityId) -> FilterInput {
    FilterExpression::new().with("id", id.to_string()).into()
}

#[tokio::test]
async fn create_get_round_trip() {
    let fx = Fixture::new();
    let users = fx.users();
    let data = obj(json!({"email": "ada@x.com", "name": "Ada", "age": 36, "profile": {"lang": "en"}}));
    let created = users.create(data.clone(), false).await.unwrap();
    assert_eq!(created.data, data);
    assert!(created.deleted_at.is_none());
    let fetched = users.get(created.id, false).await.unwrap().unwrap();
    assert_eq!(fetched, created);
}

#[tokio::test]
async fn soft_delete_exclusion_and_restore() {
    let fx = Fixture::new();
    let users = fx.users();
    let e = users.create(obj(json!({"email": "a@x.com"})), false).await.unwrap();
    users.remove(e.id, true, true).await.unwrap();
    assert!(!users.exists(&by_id(e.id)).await.unwrap());
    let hidden = users.get(e.id, true).await.unwrap().unwrap();
    assert!(hidden.deleted_at.is_some());
    assert_eq!(users.list(&FilterInput::default(), &ListOptions::new()).await.unwrap().len(), 0);
    assert_eq!(users.list(&FilterInput::default(), &ListOptions::new().include_deleted()).await.unwrap().len(), 1);

    let restored = users.restore(e.id, true).await.unwrap();
    assert!(restored.deleted_at.is_none());
    assert!(users.exists(&by_id(e.id)).await.unwrap());

    let kinds: Vec<EventKind> = fx.sink.events().iter().map(|ev| ev.kind).collect();
    assert_eq!(kinds, vec![EventKind::Delete, EventKind::Update]);
    assert_eq!(fx.sink.events()[1].changed_fields, vec!["deleted_at"]);
}

#[tokio::test]
async fn restore_of_missing_row_is_not_found() {
    let fx = Fixture::new();
    let err = fx.users().restore(repolite::EntityId::new(), false).await.unwrap_err();
    assert!(matches!(err, RepoError::NotFound { .. }));
}

#[tokio::test]
async fn type_mismatch_is_reported_before_writing() {
    let fx = Fixture::new();
    let users = fx.users();
    let err = users.create(obj(json!({"email": "a@x.com", "age": "old"})), false).await.unwrap_err();
    assert!(matches!(err, RepoError::TypeMismatch { ref field, .. } if field == "age"));
    assert!(fx.store.is_empty("users"));

    let filter: FilterInput = FilterExpression::new().with_op("age", Operator::parse("gt").unwrap(), "ten").into();
    assert!(matches!(users.count(&filter).await, Err(RepoError::TypeMismatch { .. })));
    let bad = repolite::parse_filter_json(r#"{"age__around": 3}"#).unwrap();
    assert!(matches!(users.count(&bad).await, Err(RepoError::UnsupportedOperator(op)) if op == "around"));
}

#[tokio::test]
async fn list_orders_pages_and_projects() {
    let fx = Fixture::new();
    let users = fx.users();
    for (i, name) in ["cy", "ab", "bo", "da"].iter().enumerate() {
        users.create(obj(json!({"email": format!("{name}@x.com"), "name": name, "age": 20 + i})), false).await.unwrap();
    }
    let opts = ListOptions::new().order_by(SortSpec::asc("name")).limit(2).offset(1).fields(&["name"]);
    let rows = users.list(&FilterInput::default(), &opts).await.unwrap();
    let names: Vec<&Value> = rows.iter().map(|e| &e.data["name"]).collect();
    assert_eq!(names, vec![&json!("bo"), &json!("cy")]);
    assert!(rows.iter().all(|e| !e.data.contains_key("email")));
}

#[tokio::test]
async fn update_invalidates_so_writer_reads_fresh() {
    let fx = Fixture::new();
    let users = fx.users();
    let e = users.create(obj(json!({"email": "a@x.com", "status": "new"})), false).await.unwrap();
    let active: FilterInput = FilterExpression::new().with("status", "active").into();
    assert_eq!(users.count(&active).await.unwrap(), 0);
    users.update(&e, Patch::default().set("status", "active"), false).await.unwrap();
    assert_eq!(users.count(&active).await.unwrap(), 1);
}

struct StampCreator;

#[async_trait]
impl RepositoryHook for StampCreator {
    async fn before_create(&self, _entity_type: &str, data: &mut Map<String, Value>) -> RepoResult<()> {
        data.insert("created_by".into(), json!("system"));
        Ok(())
    }
}

struct Veto;

#[async_trait]
impl RepositoryHook for Veto {
    async fn before_delete(&self, _entity_type: &str, _entity: &repolite::Entity, soft: bool) -> RepoResult<()> {
        if soft { Ok(()) } else { Err(RepoError::Hook("hard deletes are disabled".into())) }
    }
}

#[tokio::test]
async fn hooks_stamp_and_veto() {
    let fx = Fixture::new();
    let engine = fx.engine.with_hook(Arc::new(StampCreator)).with_hook(Arc::new(Veto));
    let users = engine.repository("users").unwrap();
    let e = users.create(obj(json!({"email": "a@x.com"})), true).await.unwrap();
    assert_eq!(e.data["created_by"], json!("system"));
    let err = users.remove(e.id, false, true).await.unwrap_err();
    assert!(matches!(err, RepoError::Hook(_)));
    assert_eq!(fx.store.len("users"), 1);
}

#[tokio::test]
async fn sink_failure_keeps_the_write() {
    let fx = Fixture::new();
    fx.sink.set_failing(true);
    let users = fx.users();
    let e = users.create(obj(json!({"email": "a@x.com"})), true).await.unwrap();
    assert!(users.get(e.id, false).await.unwrap().is_some());
    assert!(fx.sink.is_empty());
}

#[tokio::test]
async fn get_by_and_unique_conflicts() {
    let fx = Fixture::new();
    let users = fx.users();
    users.create(obj(json!({"email": "a@x.com", "role": "admin"})), false).await.unwrap();
    users.create(obj(json!({"email": "b@x.com", "role": "admin"})), false).await.unwrap();
    let admins: FilterInput = FilterExpression::new().with("role", "admin").into();
    let err = users.get_by(&admins).await.unwrap_err();
    assert!(matches!(err, RepoError::MultipleResults { count: 2, .. }));

    let one: FilterInput = FilterExpression::new().with("email", "b@x.com").into();
    assert_eq!(users.get_one_by(&one).await.unwrap().data["email"], json!("b@x.com"));
    let none: FilterInput = FilterExpression::new().with("email", "c@x.com").into();
    assert!(users.get_by(&none).await.unwrap().is_none());
    assert!(matches!(users.get_one_by(&none).await, Err(RepoError::NotFoundBy { .. })));

    let err = users.create(obj(json!({"email": "a@x.com"})), true).await.unwrap_err();
    assert!(matches!(err, RepoError::Conflict { ref field, ref value, .. } if field == "email" && value == "a@x.com"));
    assert_eq!(fx.store.len("users"), 2);
    assert!(fx.sink.is_empty());
}
