mod common;

use common::{Fixture, obj};
use repolite::query::SearchMode;
use repolite::{Creatable, FilterExpression, FilterInput, FulltextRequest, RepoError, Searchable, SortSpec, parse_filter_json};
use serde_json::json;

#[tokio::test]
async fn complex_filter_combines_and_or() {
    let fx = Fixture::new();
    let users = fx.users();
    let rows = [
        json!({"email": "1@x.com", "status": "active", "role": "admin", "permissions": []}),
        json!({"email": "2@x.com", "status": "active", "role": "user", "permissions": ["read", "write"]}),
        json!({"email": "3@x.com", "status": "active", "role": "user", "permissions": ["read"]}),
        json!({"email": "4@x.com", "status": "inactive", "role": "admin", "permissions": ["write"]}),
    ];
    for r in rows {
        users.create(obj(r), false).await.unwrap();
    }
    let filter = parse_filter_json(
        r#"{"and_filters":{"status":"active"},"or_filters":[{"role":"admin"},{"permissions__contains":"write"}]}"#,
    )
    .unwrap();
    let FilterInput::Complex(complex) = filter else { panic!("expected a complex filter") };
    let found = users.list_with_complex_filters(&complex, vec![SortSpec::asc("email")], None).await.unwrap();
    let emails: Vec<&str> = found.iter().map(|e| e.data["email"].as_str().unwrap()).collect();
    assert_eq!(emails, vec!["1@x.com", "2@x.com"]);
}

#[tokio::test]
async fn not_filters_exclude_each_term() {
    let fx = Fixture::new();
    let users = fx.users();
    for (email, role, status) in [("a@x.com", "admin", "active"), ("b@x.com", "user", "banned"), ("c@x.com", "user", "active")] {
        users.create(obj(json!({"email": email, "role": role, "status": status})), false).await.unwrap();
    }
    let filter = parse_filter_json(r#"{"not_filters":{"role":"admin","status":"banned"}}"#).unwrap();
    let found = users.list(&filter, &repolite::ListOptions::new()).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].data["email"], json!("c@x.com"));
}

#[tokio::test]
async fn fulltext_ranks_and_filters_by_min_rank() {
    let fx = Fixture::new();
    let users = fx.users();
    users
        .create(obj(json!({"email": "a@x.com", "name": "Rust Fan", "bio": "rust every day, rust forever"})), false)
        .await
        .unwrap();
    users
        .create(
            obj(json!({
                "email": "b@x.com",
                "name": "Bo",
                "bio": "tried rust once during a long winding career writing many different languages"
            })),
            false,
        )
        .await
        .unwrap();
    users.create(obj(json!({"email": "c@x.com", "name": "Cy", "bio": "gardening"})), false).await.unwrap();

    let hits = users.fulltext_search(&FulltextRequest::new("rust")).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].entity.data["email"], json!("a@x.com"));
    let top = hits[0].rank.unwrap();
    let low = hits[1].rank.unwrap();
    assert!(top > low);

    let strict = FulltextRequest::new("rust").min_rank((top + low) / 2.0);
    let hits = users.fulltext_search(&strict).await.unwrap();
    assert_eq!(hits.len(), 1);

    let mut unranked = FulltextRequest::new("rust");
    unranked.include_rank = false;
    assert!(users.fulltext_search(&unranked).await.unwrap().iter().all(|h| h.rank.is_none()));

    let scoped = FulltextRequest::new("rust").filters(FilterExpression::new().with("name", "Bo").into());
    assert_eq!(users.fulltext_search(&scoped).await.unwrap().len(), 1);
}

#[tokio::test]
async fn fulltext_modes_and_bad_raw_syntax() {
    let fx = Fixture::new();
    let users = fx.users();
    users.create(obj(json!({"email": "a@x.com", "bio": "quick brown fox"})), false).await.unwrap();
    users.create(obj(json!({"email": "b@x.com", "bio": "brown quick fox"})), false).await.unwrap();

    let phrase = FulltextRequest::new("quick brown").mode(SearchMode::Phrase);
    assert_eq!(users.fulltext_search(&phrase).await.unwrap().len(), 1);
    let plain = FulltextRequest::new("quick brown");
    assert_eq!(users.fulltext_search(&plain).await.unwrap().len(), 2);
    let web = FulltextRequest::new("\"brown quick\" fox").mode(SearchMode::Websearch);
    let hits = users.fulltext_search(&web).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].entity.data["email"], json!("b@x.com"));

    let broken = FulltextRequest::new("(fox &").mode(SearchMode::Raw);
    assert!(matches!(users.fulltext_search(&broken).await, Err(RepoError::Validation(_))));
}

#[tokio::test]
async fn search_operator_in_plain_filters() {
    let fx = Fixture::new();
    let users = fx.users();
    users.create(obj(json!({"email": "a@x.com", "bio": "loves databases"})), false).await.unwrap();
    users.create(obj(json!({"email": "b@x.com", "bio": "loves cats"})), false).await.unwrap();
    let filter = parse_filter_json(r#"{"bio__search": "databases"}"#).unwrap();
    assert_eq!(users.count(&filter).await.unwrap(), 1);
}
