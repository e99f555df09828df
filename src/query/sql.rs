//! PostgreSQL rendering of query plans: parameterised SQL text plus ordered bind values.

use serde::Serialize;
use serde_json::Value;

use super::plan::{AggregateOp, PlanKind, QueryPlan};
use super::predicate::{CompiledTerm, Predicate, ResolvedPath};
use super::types::{Comparison, Operator, Order, SearchMode, TemporalPart};
use crate::schema::FieldType;

const BASE_ALIAS: &str = "t0";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum SqlParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Json(Value),
}

impl SqlParam {
    #[must_use]
    pub fn from_json(v: &Value) -> Self {
        match v {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => n.as_i64().map_or_else(|| Self::Float(n.as_f64().unwrap_or(0.0)), Self::Int),
            Value::String(s) => Self::Text(s.clone()),
            other => Self::Json(other.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SqlQuery {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn json_path_literal(path: &[String]) -> String {
    let parts: Vec<String> = path
        .iter()
        .map(|p| format!("\"{}\"", p.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    format!("{{{}}}", parts.join(","))
}

/// Renders plans for a PostgreSQL backend where each entity type is a table,
/// declared fields are columns and JSON sub-paths use `#>>`.
#[derive(Default)]
pub struct SqlRenderer {
    params: Vec<SqlParam>,
}

impl SqlRenderer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn render(plan: &QueryPlan) -> SqlQuery {
        let mut r = Self::new();
        let sql = r.statement(plan);
        SqlQuery { sql, params: r.params }
    }

    /// Renders only the boolean condition of a predicate.
    #[must_use]
    pub fn render_predicate(predicate: &Predicate) -> SqlQuery {
        let mut r = Self::new();
        let sql = r.predicate(predicate);
        SqlQuery { sql, params: r.params }
    }

    fn bind(&mut self, p: SqlParam) -> String {
        self.params.push(p);
        format!("${}", self.params.len())
    }

    fn statement(&mut self, plan: &QueryPlan) -> String {
        let from = self.from_clause(plan);
        let mut where_sql = self.predicate(&plan.predicate);
        let mut select = match &plan.projection {
            Some(fields) => {
                let mut cols: Vec<String> = ["id", "created_at", "updated_at", "deleted_at"]
                    .iter()
                    .map(|c| format!("{BASE_ALIAS}.{}", quote_ident(c)))
                    .collect();
                cols.extend(fields.iter().map(|f| format!("{BASE_ALIAS}.{}", quote_ident(f))));
                cols.join(", ")
            }
            None => format!("{BASE_ALIAS}.*"),
        };
        let mut rank_order = None;
        if plan.kind == PlanKind::Search
            && let Some(spec) = &plan.search
        {
            let cfg = spec.language.pg_config();
            let doc = spec
                .fields
                .iter()
                .map(|f| format!("coalesce({BASE_ALIAS}.{}, '')", quote_ident(f)))
                .collect::<Vec<_>>()
                .join(" || ' ' || ");
            let vector = format!("to_tsvector('{cfg}', {doc})");
            let q = self.bind(SqlParam::Text(spec.query.clone()));
            let query = format!("{}('{cfg}', {q})", tsquery_fn(spec.mode));
            let rank = format!("ts_rank({vector}, {query})");
            where_sql = format!("({where_sql}) AND {vector} @@ {query}");
            if let Some(min) = spec.min_rank {
                let m = self.bind(SqlParam::Float(min));
                where_sql = format!("{where_sql} AND {rank} >= {m}");
            }
            select = format!("{select}, {rank} AS \"rank\"");
            rank_order = Some("\"rank\" DESC".to_string());
        }
        match plan.kind {
            PlanKind::Count => format!("SELECT COUNT(*) AS \"count\" FROM {from} WHERE {where_sql}"),
            PlanKind::Exists => format!("SELECT EXISTS (SELECT 1 FROM {from} WHERE {where_sql}) AS \"exists\""),
            PlanKind::Aggregate => self.aggregate(plan, &from, &where_sql),
            _ => {
                let mut sql = format!("SELECT {select} FROM {from} WHERE {where_sql}");
                let order = if plan.order_by.is_empty()
                    && let Some(r) = rank_order
                {
                    vec![r, format!("{BASE_ALIAS}.\"id\" ASC")]
                } else {
                    plan.effective_order()
                        .iter()
                        .map(|s| {
                            let dir = if s.order == Order::Asc { "ASC" } else { "DESC" };
                            format!("{BASE_ALIAS}.{} {dir}", quote_ident(&s.field))
                        })
                        .collect()
                };
                sql.push_str(&format!(" ORDER BY {}", order.join(", ")));
                let (offset, limit) = plan.pagination.window();
                if let Some(limit) = limit {
                    sql.push_str(&format!(" LIMIT {limit}"));
                }
                if offset > 0 {
                    sql.push_str(&format!(" OFFSET {offset}"));
                }
                sql
            }
        }
    }

    fn from_clause(&self, plan: &QueryPlan) -> String {
        let mut from = format!("{} AS {BASE_ALIAS}", quote_ident(&plan.entity_type));
        for j in &plan.joins {
            let alias = quote_ident(&format!("j_{}", j.relation));
            from.push_str(&format!(
                " LEFT JOIN {} AS {alias} ON {alias}.\"id\" = {BASE_ALIAS}.{}",
                quote_ident(&j.entity_type),
                quote_ident(&j.local_key)
            ));
        }
        from
    }

    fn aggregate(&mut self, plan: &QueryPlan, from: &str, where_sql: &str) -> String {
        let Some(spec) = &plan.aggregation else {
            return format!("SELECT COUNT(*) AS \"count\" FROM {from} WHERE {where_sql}");
        };
        let col = format!("{BASE_ALIAS}.{}", quote_ident(&spec.field));
        let groups: Vec<String> =
            spec.group_by.iter().map(|g| format!("{BASE_ALIAS}.{}", quote_ident(g))).collect();
        let mut select: Vec<String> =
            groups.iter().zip(&spec.group_by).map(|(c, g)| format!("{c} AS {}", quote_ident(g))).collect();
        for op in &spec.operations {
            let func = match op {
                AggregateOp::Count => "COUNT",
                AggregateOp::Sum => "SUM",
                AggregateOp::Avg => "AVG",
                AggregateOp::Min => "MIN",
                AggregateOp::Max => "MAX",
            };
            select.push(format!("{func}({col}) AS {}", quote_ident(op.name())));
        }
        let mut sql = format!("SELECT {} FROM {from} WHERE {where_sql}", select.join(", "));
        if !groups.is_empty() {
            sql.push_str(&format!(" GROUP BY {} ORDER BY {}", groups.join(", "), groups.join(", ")));
        }
        sql
    }

    fn column(&mut self, path: &ResolvedPath, numeric: bool) -> String {
        let table = match &path.join {
            Some(rel) => quote_ident(&format!("j_{rel}")),
            None => BASE_ALIAS.to_string(),
        };
        let base = format!("{table}.{}", quote_ident(&path.column));
        if path.json_path.is_empty() {
            return base;
        }
        let p = self.bind(SqlParam::Text(json_path_literal(&path.json_path)));
        if numeric { format!("({base} #>> {p})::numeric") } else { format!("({base} #>> {p})") }
    }

    fn predicate(&mut self, p: &Predicate) -> String {
        match p {
            Predicate::True => "TRUE".to_string(),
            Predicate::And(parts) => self.join(parts, " AND "),
            Predicate::Or(parts) => self.join(parts, " OR "),
            Predicate::Not(inner) => format!("NOT ({})", self.predicate(inner)),
            Predicate::Term(t) => self.term(t),
        }
    }

    fn join(&mut self, parts: &[Predicate], sep: &str) -> String {
        let rendered: Vec<String> = parts.iter().map(|q| format!("({})", self.predicate(q))).collect();
        rendered.join(sep)
    }

    fn list(&mut self, items: &[Value]) -> String {
        items.iter().map(|i| self.bind(SqlParam::from_json(i))).collect::<Vec<_>>().join(", ")
    }

    fn term(&mut self, t: &CompiledTerm) -> String {
        let numeric = t.value.is_number()
            || t.value.as_array().is_some_and(|a| a.first().is_some_and(Value::is_number));
        let value_text = || t.value.as_str().unwrap_or_default().to_string();
        match t.operator {
            Operator::Cmp(Comparison::Eq) if t.value.is_null() => format!("{} IS NULL", self.column(&t.path, false)),
            Operator::Cmp(Comparison::Ne) if t.value.is_null() => {
                format!("{} IS NOT NULL", self.column(&t.path, false))
            }
            Operator::Cmp(c) => {
                let col = self.column(&t.path, numeric);
                let v = self.bind(SqlParam::from_json(&t.value));
                format!("{col} {} {v}", c.sql())
            }
            Operator::In | Operator::NotIn => {
                let items = t.value.as_array().cloned().unwrap_or_default();
                let col = self.column(&t.path, numeric);
                match (t.operator == Operator::In, items.is_empty()) {
                    (true, true) => "FALSE".to_string(),
                    (false, true) => format!("{col} IS NOT NULL"),
                    (true, false) => format!("{col} IN ({})", self.list(&items)),
                    (false, false) => format!("{col} NOT IN ({})", self.list(&items)),
                }
            }
            Operator::Between | Operator::NotBetween => {
                let col = self.column(&t.path, numeric);
                let bounds = t.value.as_array().cloned().unwrap_or_default();
                let lo = self.bind(SqlParam::from_json(bounds.first().unwrap_or(&Value::Null)));
                let hi = self.bind(SqlParam::from_json(bounds.get(1).unwrap_or(&Value::Null)));
                let not = if t.operator == Operator::NotBetween { "NOT " } else { "" };
                format!("{col} {not}BETWEEN {lo} AND {hi}")
            }
            Operator::Like | Operator::Ilike => {
                let col = self.column(&t.path, false);
                let v = self.bind(SqlParam::Text(value_text()));
                let kw = if t.operator == Operator::Like { "LIKE" } else { "ILIKE" };
                format!("{col} {kw} {v}")
            }
            Operator::StartsWith | Operator::EndsWith => {
                let col = self.column(&t.path, false);
                let text = escape_like(&value_text());
                let pattern = if t.operator == Operator::StartsWith { format!("{text}%") } else { format!("%{text}") };
                let v = self.bind(SqlParam::Text(pattern));
                format!("{col} LIKE {v}")
            }
            Operator::Contains => {
                let col = self.column(&t.path, false);
                if t.field_type == Some(FieldType::Array) {
                    let v = self.bind(SqlParam::from_json(&t.value));
                    format!("{v} = ANY({col})")
                } else {
                    let v = self.bind(SqlParam::Text(format!("%{}%", escape_like(&value_text()))));
                    format!("{col} LIKE {v}")
                }
            }
            Operator::Regex => {
                let col = self.column(&t.path, false);
                let v = self.bind(SqlParam::Text(value_text()));
                format!("{col} ~ {v}")
            }
            Operator::IsNull => format!("{} IS NULL", self.column(&t.path, false)),
            Operator::IsNotNull => format!("{} IS NOT NULL", self.column(&t.path, false)),
            Operator::Temporal(part, c) => {
                let col = self.column(&t.path, false);
                let v = self.bind(SqlParam::from_json(&t.value));
                let expr = match part {
                    TemporalPart::Date => return format!("CAST({col} AS DATE) {} {v}::date", c.sql()),
                    TemporalPart::Year => "YEAR",
                    TemporalPart::Month => "MONTH",
                    TemporalPart::Day => "DAY",
                    TemporalPart::Week => "WEEK",
                    TemporalPart::Quarter => "QUARTER",
                };
                format!("EXTRACT({expr} FROM {col}) {} {v}", c.sql())
            }
            Operator::JsonContains => {
                let col = self.column(&t.path, false);
                let v = self.bind(SqlParam::Json(t.value.clone()));
                format!("{col} @> {v}::jsonb")
            }
            Operator::JsonHasKey => {
                let col = self.column(&t.path, false);
                let v = self.bind(SqlParam::Text(value_text()));
                format!("{col} ? {v}")
            }
            Operator::JsonExtract => {
                let col = self.column(&t.path, false);
                let path: Vec<String> = t
                    .value
                    .get("path")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .split('.')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                let cmp = t.value.get("op").and_then(Value::as_str).and_then(Comparison::parse).unwrap_or(Comparison::Eq);
                let operand = t.value.get("value").cloned().unwrap_or(Value::Null);
                let p = self.bind(SqlParam::Text(json_path_literal(&path)));
                if operand.is_null() {
                    return format!("({col} #>> {p}) IS NULL");
                }
                let cast = if operand.is_number() { "::numeric" } else { "" };
                let v = self.bind(SqlParam::from_json(&operand));
                format!("({col} #>> {p}){cast} {} {v}", cmp.sql())
            }
            Operator::Search(mode, lang) => {
                let col = self.column(&t.path, false);
                let v = self.bind(SqlParam::Text(value_text()));
                let cfg = lang.pg_config();
                format!("to_tsvector('{cfg}', coalesce({col}, '')) @@ {}('{cfg}', {v})", tsquery_fn(mode))
            }
        }
    }
}

fn tsquery_fn(mode: SearchMode) -> &'static str {
    match mode {
        SearchMode::Plain => "plainto_tsquery",
        SearchMode::Phrase => "phraseto_tsquery",
        SearchMode::Websearch => "websearch_to_tsquery",
        SearchMode::Raw => "to_tsquery",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::plan::{AggregationSpec, Pagination, SearchSpec};
    use crate::query::types::{Language, SortSpec};
    use crate::query::{FilterCompiler, parse_filter_value};
    use crate::schema::{EntitySchema, SchemaRegistry};
    use serde_json::json;
    use std::sync::Arc;

    fn plan(kind: PlanKind, filter: Value) -> QueryPlan {
        let reg = SchemaRegistry::new();
        reg.register(
            EntitySchema::new("posts")
                .field("title", FieldType::Text)
                .field("tags", FieldType::Array)
                .field("meta", FieldType::Json)
                .relation("author", "users", "author_id"),
        );
        let compiled = FilterCompiler::new(Arc::new(reg))
            .compile("posts", &parse_filter_value(&filter).unwrap())
            .unwrap();
        QueryPlan::new("posts", kind, compiled)
    }

    #[test]
    fn list_with_join_order_and_window() {
        let p = plan(PlanKind::List, json!({"author__name__startswith": "A_"}))
            .scoped(false)
            .order_by(vec![SortSpec::desc("created_at")])
            .paginate(Pagination::Offset { limit: 10, offset: 20 });
        let q = SqlRenderer::render(&p);
        assert!(q.sql.starts_with("SELECT t0.* FROM \"posts\" AS t0 LEFT JOIN \"users\" AS \"j_author\""));
        assert!(q.sql.contains("\"j_author\".\"name\" LIKE $"));
        assert!(q.sql.contains("t0.\"deleted_at\" IS NULL"));
        assert!(q.sql.ends_with("ORDER BY t0.\"created_at\" DESC, t0.\"id\" DESC LIMIT 10 OFFSET 20"));
        assert!(q.params.contains(&SqlParam::Text("A\\_%".into())));
    }

    #[test]
    fn parameters_are_numbered_in_order() {
        let p = plan(PlanKind::Count, json!({"title__in": ["a", "b"], "tags__contains": "x"}));
        let q = SqlRenderer::render(&p);
        assert!(q.sql.starts_with("SELECT COUNT(*)"));
        assert_eq!(q.params.len(), 3);
        for i in 1..=3 {
            assert!(q.sql.contains(&format!("${i}")));
        }
        assert!(q.sql.contains("= ANY(t0.\"tags\")"));
    }

    #[test]
    fn complex_filter_renders_or_and_not() {
        let p = plan(
            PlanKind::List,
            json!({"or_filters": [{"title": "a"}, {"title": "b"}], "not_filters": {"meta__json_has_key": "x"}}),
        );
        let q = SqlRenderer::render_predicate(&p.predicate);
        assert!(q.sql.contains(" OR "));
        assert!(q.sql.contains("NOT (t0.\"meta\" ? $"));
    }

    #[test]
    fn aggregate_groups() {
        let p = plan(PlanKind::Aggregate, json!({})).aggregate(AggregationSpec {
            field: "views".into(),
            operations: vec![AggregateOp::Sum, AggregateOp::Count],
            group_by: vec!["status".into()],
        });
        let q = SqlRenderer::render(&p);
        assert_eq!(
            q.sql,
            "SELECT t0.\"status\" AS \"status\", SUM(t0.\"views\") AS \"sum\", COUNT(t0.\"views\") AS \"count\" \
             FROM \"posts\" AS t0 WHERE TRUE GROUP BY t0.\"status\" ORDER BY t0.\"status\""
        );
    }

    #[test]
    fn search_ranks_and_filters() {
        let p = plan(PlanKind::Search, json!({})).search(SearchSpec {
            fields: vec!["title".into()],
            query: "rust".into(),
            mode: SearchMode::Websearch,
            language: Language::English,
            min_rank: Some(0.1),
        });
        let q = SqlRenderer::render(&p);
        assert!(q.sql.contains("websearch_to_tsquery('english', $1)"));
        assert!(q.sql.contains(">= $2"));
        assert!(q.sql.contains("ORDER BY \"rank\" DESC"));
    }

    #[test]
    fn nested_json_and_temporal() {
        let p = plan(PlanKind::List, json!({"meta__owner__id__gt": 3, "created_at__year": 2024}));
        let q = SqlRenderer::render_predicate(&p.predicate);
        assert!(q.sql.contains("(t0.\"meta\" #>> $"));
        assert!(q.sql.contains("::numeric >"));
        assert!(q.sql.contains("EXTRACT(YEAR FROM t0.\"created_at\") = $"));
        assert!(q.params.contains(&SqlParam::Text("{\"owner\",\"id\"}".into())));
    }
}
