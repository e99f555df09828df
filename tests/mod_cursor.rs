mod common;

use common::{Fixture, obj};
use repolite::query::{Direction, Order};
use repolite::{Creatable, CursorRequest, EntityId, FilterInput, ListOptions, Repository, Searchable, SortSpec};
use serde_json::json;

async fn seed(users: &Repository, n: usize) {
    for i in 0..n {
        users.create(obj(json!({"email": format!("u{i}@x.com"), "age": i})), false).await.unwrap();
    }
}

fn ids(items: &[repolite::Entity]) -> Vec<EntityId> {
    items.iter().map(|e| e.id).collect()
}

#[tokio::test]
async fn forward_pages_cover_every_row_once() {
    let fx = Fixture::new();
    let users = fx.users();
    seed(&users, 25).await;
    let expected = users
        .list(&FilterInput::default(), &ListOptions::new().order_by(SortSpec::asc("created_at")).limit(25))
        .await
        .unwrap();

    let first = users.paginate_cursor(&CursorRequest::new("created_at", 10)).await.unwrap();
    assert_eq!(first.items.len(), 10);
    assert!(first.has_next);
    assert!(!first.has_prev);
    assert!(first.prev_cursor.is_none());

    let second = users
        .paginate_cursor(&CursorRequest::new("created_at", 10).cursor(first.next_cursor.clone()))
        .await
        .unwrap();
    assert_eq!(second.items.len(), 10);
    assert!(second.has_next && second.has_prev);

    let third = users
        .paginate_cursor(&CursorRequest::new("created_at", 10).cursor(second.next_cursor.clone()))
        .await
        .unwrap();
    assert_eq!(third.items.len(), 5);
    assert!(!third.has_next);
    assert!(third.has_prev);
    assert!(third.next_cursor.is_none());

    let mut walked = ids(&first.items);
    walked.extend(ids(&second.items));
    walked.extend(ids(&third.items));
    assert_eq!(walked, ids(&expected));
}

#[tokio::test]
async fn prev_cursor_returns_the_preceding_page() {
    let fx = Fixture::new();
    let users = fx.users();
    seed(&users, 12).await;
    let req = |cursor: Option<String>| CursorRequest::new("age", 5).order(Order::Desc).cursor(cursor);

    let first = users.paginate_cursor(&req(None)).await.unwrap();
    let ages: Vec<i64> = first.items.iter().map(|e| e.data["age"].as_i64().unwrap()).collect();
    assert_eq!(ages, vec![11, 10, 9, 8, 7]);
    let second = users.paginate_cursor(&req(first.next_cursor.clone())).await.unwrap();
    let back = users.paginate_cursor(&req(second.prev_cursor.clone())).await.unwrap();
    assert_eq!(ids(&back.items), ids(&first.items));
    assert!(back.has_next);
    assert!(!back.has_prev);
}

#[tokio::test]
async fn prev_without_cursor_starts_at_the_end() {
    let fx = Fixture::new();
    let users = fx.users();
    seed(&users, 7).await;
    let page = users
        .paginate_cursor(&CursorRequest::new("age", 3).direction(Direction::Prev))
        .await
        .unwrap();
    let ages: Vec<i64> = page.items.iter().map(|e| e.data["age"].as_i64().unwrap()).collect();
    assert_eq!(ages, vec![4, 5, 6]);
    assert!(page.has_prev);
    assert!(!page.has_next);
}

#[tokio::test]
async fn rows_without_the_cursor_field_are_skipped() {
    let fx = Fixture::new();
    let users = fx.users();
    seed(&users, 3).await;
    users.create(obj(json!({"email": "noage@x.com"})), false).await.unwrap();
    let page = users.paginate_cursor(&CursorRequest::new("age", 10)).await.unwrap();
    assert_eq!(page.items.len(), 3);
    assert!(!page.has_next);
}

#[tokio::test]
async fn tampered_cursor_is_rejected() {
    let fx = Fixture::new();
    let users = fx.users();
    seed(&users, 3).await;
    let err = users
        .paginate_cursor(&CursorRequest::new("age", 2).cursor(Some("not-hex".into())))
        .await
        .unwrap_err();
    assert!(matches!(err, repolite::RepoError::Validation(_)));
}
