mod common;

use common::{Fixture, obj};
use repolite::query::AggregateOp;
use repolite::{AggregateRequest, Creatable, FilterExpression, RepoError, Repository, Searchable};
use serde_json::json;

async fn seed(users: &Repository) {
    let rows = [
        ("a", "admin", 40, 1.5),
        ("b", "user", 20, 2.5),
        ("c", "user", 30, 3.0),
        ("d", "user", 25, 4.0),
        ("e", "admin", 50, 0.5),
    ];
    for (name, role, age, score) in rows {
        let data = json!({"email": format!("{name}@x.com"), "name": name, "role": role, "age": age, "score": score});
        users.create(obj(data), false).await.unwrap();
    }
}

#[tokio::test]
async fn whole_table_aggregates() {
    let fx = Fixture::new();
    let users = fx.users();
    seed(&users).await;
    let ops = [AggregateOp::Count, AggregateOp::Sum, AggregateOp::Avg, AggregateOp::Min, AggregateOp::Max];
    let rows = users.aggregate(&AggregateRequest::new("age", &ops)).await.unwrap();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert!(row.group.is_empty());
    assert_eq!(row.get(AggregateOp::Count), Some(&json!(5)));
    assert_eq!(row.get(AggregateOp::Sum), Some(&json!(165)));
    assert_eq!(row.get(AggregateOp::Avg), Some(&json!(33.0)));
    assert_eq!(row.get(AggregateOp::Min), Some(&json!(20)));
    assert_eq!(row.get(AggregateOp::Max), Some(&json!(50)));
}

#[tokio::test]
async fn grouped_and_filtered() {
    let fx = Fixture::new();
    let users = fx.users();
    seed(&users).await;
    let req = AggregateRequest::new("score", &[AggregateOp::Sum, AggregateOp::Count]).group_by(&["role"]);
    let rows = users.aggregate(&req).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].group["role"], json!("admin"));
    assert_eq!(rows[0].get(AggregateOp::Sum), Some(&json!(2.0)));
    assert_eq!(rows[1].get(AggregateOp::Count), Some(&json!(3)));

    let older = FilterExpression::new().with_op("age", repolite::query::Operator::parse("gte").unwrap(), 30);
    let req = AggregateRequest::new("*", &[AggregateOp::Count]).filters(older.into());
    let rows = users.aggregate(&req).await.unwrap();
    assert_eq!(rows[0].get(AggregateOp::Count), Some(&json!(3)));
}

#[tokio::test]
async fn soft_deleted_rows_are_not_aggregated() {
    let fx = Fixture::new();
    let users = fx.users();
    seed(&users).await;
    let admins = users.list(&FilterExpression::new().with("role", "admin").into(), &Default::default()).await.unwrap();
    users.remove(admins[0].id, true, false).await.unwrap();
    let rows = users.aggregate(&AggregateRequest::new("*", &[AggregateOp::Count])).await.unwrap();
    assert_eq!(rows[0].get(AggregateOp::Count), Some(&json!(4)));
}

#[tokio::test]
async fn invalid_requests() {
    let fx = Fixture::new();
    let users = fx.users();
    seed(&users).await;
    let err = users.aggregate(&AggregateRequest::new("name", &[AggregateOp::Sum])).await.unwrap_err();
    assert!(matches!(err, RepoError::TypeMismatch { .. }));
    // min and max work on any orderable column
    let rows = users.aggregate(&AggregateRequest::new("name", &[AggregateOp::Max])).await.unwrap();
    assert_eq!(rows[0].get(AggregateOp::Max), Some(&json!("e")));
    let err = users.aggregate(&AggregateRequest::new("*", &[AggregateOp::Avg])).await.unwrap_err();
    assert!(matches!(err, RepoError::Validation(_)));
}
