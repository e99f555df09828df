use async_trait::async_trait;
use serde_json::Value;

use super::{AggregateRequest, Creatable, CursorRequest, FulltextRequest, ListOptions, Repository, SearchHit, Searchable};
use crate::errors::{RepoError, RepoResult};
use crate::query::fulltext::parse_query;
use crate::query::{
    AggregateOp, AggregationRow, AggregationSpec, ComplexFilter, CursorPage, CursorToken, Direction, FilterInput,
    Operator, Pagination, PlanKind, Predicate, ResolvedPath, SearchSpec, SortSpec,
};
use crate::schema::FieldType;
use crate::store::RankedEntity;
use crate::types::Entity;

#[async_trait]
impl Searchable for Repository {
    async fn fulltext_search(&self, req: &FulltextRequest) -> RepoResult<Vec<SearchHit>> {
        if req.query.trim().is_empty() {
            return Err(RepoError::Validation("search query is empty".into()));
        }
        parse_query(&req.query, req.mode, req.language)?;
        let schema = self.schema();
        let fields = if req.fields.is_empty() { schema.search_fields.clone() } else { req.fields.clone() };
        if fields.is_empty() {
            return Err(RepoError::Validation(format!("no searchable fields declared for {}", self.entity_type)));
        }
        for field in &fields {
            if let Some(ty) = schema.resolve_field(field)?
                && !matches!(ty, FieldType::Text | FieldType::Json)
            {
                return Err(RepoError::TypeMismatch {
                    field: field.clone(),
                    expected: "text".into(),
                    found: ty.name().to_string(),
                });
            }
        }
        self.check_order(&req.order_by)?;
        let limit = self.effective_limit(req.limit);
        let plan = self
            .plan(PlanKind::Search, &req.filters, false)?
            .search(SearchSpec {
                fields,
                query: req.query.clone(),
                mode: req.mode,
                language: req.language,
                min_rank: req.min_rank,
            })
            .order_by(req.order_by.clone())
            .paginate(Pagination::Offset { limit, offset: 0 });
        let ranked: Vec<RankedEntity> = serde_json::from_value(self.read(&plan).await?)?;
        Ok(ranked
            .into_iter()
            .map(|r| SearchHit { entity: r.entity, rank: req.include_rank.then_some(r.rank) })
            .collect())
    }

    async fn list_with_complex_filters(
        &self,
        filter: &ComplexFilter,
        order_by: Vec<SortSpec>,
        limit: Option<usize>,
    ) -> RepoResult<Vec<Entity>> {
        let opts = ListOptions { order_by, limit, ..ListOptions::default() };
        self.list(&FilterInput::Complex(filter.clone()), &opts).await
    }

    async fn aggregate(&self, req: &AggregateRequest) -> RepoResult<Vec<AggregationRow>> {
        if req.operations.is_empty() {
            return Err(RepoError::Validation("aggregate needs at least one operation".into()));
        }
        let schema = self.schema();
        if req.field == "*" {
            if let Some(op) = req.operations.iter().find(|op| **op != AggregateOp::Count) {
                return Err(RepoError::Validation(format!("{} needs a concrete field, not *", op.name())));
            }
        } else {
            let ty = if req.operations.iter().any(|op| matches!(op, AggregateOp::Min | AggregateOp::Max)) {
                self.check_sort_field(&schema, &req.field)?
            } else {
                Self::check_column(&schema, &req.field)?
            };
            if let Some(ty) = ty
                && !ty.is_numeric()
                && let Some(op) = req.operations.iter().find(|op| op.needs_numeric())
            {
                return Err(RepoError::TypeMismatch {
                    field: req.field.clone(),
                    expected: format!("number for {}", op.name()),
                    found: ty.name().to_string(),
                });
            }
        }
        for g in &req.group_by {
            Self::check_column(&schema, g)?;
        }
        let mut operations = req.operations.clone();
        operations.sort();
        operations.dedup();
        let plan = self.plan(PlanKind::Aggregate, &req.filters, false)?.aggregate(AggregationSpec {
            field: req.field.clone(),
            operations,
            group_by: req.group_by.clone(),
        });
        Ok(serde_json::from_value(self.read(&plan).await?)?)
    }

    async fn paginate_cursor(&self, req: &CursorRequest) -> RepoResult<CursorPage> {
        if req.limit == 0 || req.limit > self.shared.max_limit {
            return Err(RepoError::Validation(format!(
                "cursor limit must be between 1 and {}",
                self.shared.max_limit
            )));
        }
        let schema = self.schema();
        let field_type = self.check_sort_field(&schema, &req.field)?;
        let token = req.cursor.as_deref().map(CursorToken::decode).transpose()?;
        if let Some(t) = &token
            && (t.field != req.field || t.order != req.order)
        {
            return Err(RepoError::Validation(format!(
                "cursor was issued for {} {:?} but the page is ordered by {} {:?}",
                t.field, t.order, req.field, req.order
            )));
        }
        let direction = token.as_ref().map_or(req.direction, |t| t.direction);
        let scan_order = match direction {
            Direction::Next => req.order,
            Direction::Prev => req.order.reverse(),
        };
        let column = ResolvedPath::column(&req.field);
        let mut plan = self
            .plan(PlanKind::Page, &req.filters, false)?
            .restrict(Predicate::term(column, Operator::IsNotNull, Value::Bool(true), field_type));
        if let Some(t) = &token {
            plan = plan.restrict(t.keyset_predicate(field_type));
        }
        let plan = plan
            .order_by(vec![SortSpec { field: req.field.clone(), order: scan_order }])
            .paginate(Pagination::Cursor { token: req.cursor.clone(), direction, limit: req.limit + 1 });
        let rows = self.read_entities(&plan).await?;
        Ok(CursorPage::assemble(rows, req.limit, direction, token.is_some(), &req.field, req.order))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Engine;
    use crate::config::EngineConfig;
    use crate::query::{FilterExpression, Order, parse_filter_value};
    use crate::repository::Creatable;
    use crate::schema::EntitySchema;
    use crate::store::InMemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    async fn seeded() -> Repository {
        let engine = Engine::new(EngineConfig::default(), Arc::new(InMemoryStore::new()), None).unwrap();
        engine.register_schema(
            EntitySchema::new("posts")
                .field("title", FieldType::Text)
                .field("body", FieldType::Text)
                .field("score", FieldType::Integer)
                .field("topic", FieldType::Text)
                .search_fields(&["title", "body"]),
        );
        let repo = engine.repository("posts").unwrap();
        let rows = [
            ("Rust ownership", "borrowing and lifetimes", 5, "rust"),
            ("Async Rust", "tokio runtimes and futures", 8, "rust"),
            ("Gardening", "tomatoes need sun", 3, "home"),
        ];
        for (title, body, score, topic) in rows {
            let data = json!({"title": title, "body": body, "score": score, "topic": topic});
            repo.create(data.as_object().cloned().unwrap(), false).await.unwrap();
        }
        repo
    }

    #[tokio::test]
    async fn fulltext_defaults_to_schema_fields_and_ranks() {
        let repo = seeded().await;
        let hits = repo.fulltext_search(&FulltextRequest::new("rust")).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.rank.is_some()));
        assert!(hits[0].rank >= hits[1].rank);
        let err = repo.fulltext_search(&FulltextRequest::new("rust").fields(&["score"])).await.unwrap_err();
        assert!(matches!(err, RepoError::TypeMismatch { .. }));
        assert!(repo.fulltext_search(&FulltextRequest::new("  ")).await.is_err());
    }

    #[tokio::test]
    async fn aggregate_groups_and_validates() {
        let repo = seeded().await;
        let rows = repo
            .aggregate(&AggregateRequest::new("score", &[AggregateOp::Sum, AggregateOp::Count]).group_by(&["topic"]))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].group["topic"], json!("home"));
        assert_eq!(rows[1].get(AggregateOp::Sum), Some(&json!(13)));

        let err = repo.aggregate(&AggregateRequest::new("title", &[AggregateOp::Avg])).await.unwrap_err();
        assert!(matches!(err, RepoError::TypeMismatch { .. }));
        let err = repo.aggregate(&AggregateRequest::new("*", &[AggregateOp::Sum])).await.unwrap_err();
        assert!(matches!(err, RepoError::Validation(_)));
        assert!(repo.aggregate(&AggregateRequest::new("score", &[])).await.is_err());
    }

    #[tokio::test]
    async fn complex_filters_route_through_list() {
        let repo = seeded().await;
        let filter = match parse_filter_value(&json!({
            "or_filters": [{"topic": "home"}, {"score__gte": 8}]
        }))
        .unwrap()
        {
            FilterInput::Complex(c) => c,
            FilterInput::Simple(_) => panic!("expected complex filter"),
        };
        let rows = repo.list_with_complex_filters(&filter, vec![SortSpec::asc("score")], None).await.unwrap();
        let scores: Vec<i64> = rows.iter().map(|e| e.data["score"].as_i64().unwrap()).collect();
        assert_eq!(scores, vec![3, 8]);
    }

    #[tokio::test]
    async fn cursor_rejects_bad_requests() {
        let repo = seeded().await;
        assert!(matches!(repo.paginate_cursor(&CursorRequest::new("score", 0)).await, Err(RepoError::Validation(_))));
        assert!(repo.paginate_cursor(&CursorRequest::new("meta.x", 2)).await.is_err());
        let page = repo.paginate_cursor(&CursorRequest::new("score", 2).order(Order::Desc)).await.unwrap();
        let token = page.next_cursor.clone().unwrap();
        let err = repo.paginate_cursor(&CursorRequest::new("title", 2).cursor(Some(token.clone()))).await.unwrap_err();
        assert!(matches!(err, RepoError::Validation(_)));
        // same field, other order
        let err = repo.paginate_cursor(&CursorRequest::new("score", 2).cursor(Some(token.clone()))).await.unwrap_err();
        assert!(matches!(err, RepoError::Validation(_)));
        let next = CursorRequest::new("score", 2).order(Order::Desc).cursor(Some(token));
        assert!(repo.paginate_cursor(&next).await.is_ok());
        let scoped = CursorRequest::new("score", 5).filters(FilterExpression::new().with("topic", "rust").into());
        assert_eq!(repo.paginate_cursor(&scoped).await.unwrap().items.len(), 2);
    }
}
