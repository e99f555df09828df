use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use super::compile::CompiledFilter;
use super::predicate::{JoinSpec, Predicate};
use super::types::{Direction, Language, SearchMode, SortSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanKind {
    Get,
    List,
    Count,
    Exists,
    Aggregate,
    Search,
    Page,
}

impl PlanKind {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::List => "list",
            Self::Count => "count",
            Self::Exists => "exists",
            Self::Aggregate => "aggregate",
            Self::Search => "search",
            Self::Page => "page",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Pagination {
    #[default]
    Unbounded,
    Offset { limit: usize, offset: usize },
    /// Keyset page; the keyset bound is already folded into the predicate.
    /// `limit` includes the look-ahead row.
    Cursor { token: Option<String>, direction: Direction, limit: usize },
}

impl Pagination {
    /// `(offset, limit)` window the store applies after ordering.
    #[must_use]
    pub fn window(&self) -> (usize, Option<usize>) {
        match self {
            Self::Unbounded => (0, None),
            Self::Offset { limit, offset } => (*offset, Some(*limit)),
            Self::Cursor { limit, .. } => (0, Some(*limit)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateOp {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateOp {
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "count" => Self::Count,
            "sum" => Self::Sum,
            "avg" => Self::Avg,
            "min" => Self::Min,
            "max" => Self::Max,
            _ => return None,
        })
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Min => "min",
            Self::Max => "max",
        }
    }

    #[must_use]
    pub fn needs_numeric(self) -> bool {
        matches!(self, Self::Sum | Self::Avg)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregationSpec {
    pub field: String,
    pub operations: Vec<AggregateOp>,
    pub group_by: Vec<String>,
}

/// One output row of an aggregation: the group key values plus one value per operation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AggregationRow {
    pub group: Map<String, Value>,
    pub values: BTreeMap<AggregateOp, Value>,
}

impl AggregationRow {
    #[must_use]
    pub fn get(&self, op: AggregateOp) -> Option<&Value> {
        self.values.get(&op)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpec {
    pub fields: Vec<String>,
    pub query: String,
    pub mode: SearchMode,
    pub language: Language,
    pub min_rank: Option<f64>,
}

/// Normalised, serializable description of a read; its fingerprint keys the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub entity_type: String,
    pub kind: PlanKind,
    pub predicate: Predicate,
    pub joins: Vec<JoinSpec>,
    pub order_by: Vec<SortSpec>,
    pub pagination: Pagination,
    pub projection: Option<Vec<String>>,
    pub aggregation: Option<AggregationSpec>,
    pub search: Option<SearchSpec>,
}

impl QueryPlan {
    #[must_use]
    pub fn new(entity_type: &str, kind: PlanKind, filter: CompiledFilter) -> Self {
        let mut joins = filter.joins;
        joins.sort_by(|a, b| a.relation.cmp(&b.relation));
        Self {
            entity_type: entity_type.to_string(),
            kind,
            predicate: filter.predicate.canonical(),
            joins,
            order_by: Vec::new(),
            pagination: Pagination::Unbounded,
            projection: None,
            aggregation: None,
            search: None,
        }
    }

    /// Adds the soft-delete scope unless deleted rows were requested.
    #[must_use]
    pub fn scoped(mut self, include_deleted: bool) -> Self {
        if !include_deleted {
            let pred = std::mem::replace(&mut self.predicate, Predicate::True);
            self.predicate = Predicate::and(vec![pred, Predicate::not_deleted()]).canonical();
        }
        self
    }

    /// ANDs an extra condition into the plan.
    #[must_use]
    pub fn restrict(mut self, extra: Predicate) -> Self {
        let pred = std::mem::replace(&mut self.predicate, Predicate::True);
        self.predicate = Predicate::and(vec![pred, extra]).canonical();
        self
    }

    #[must_use]
    pub fn order_by(mut self, order_by: Vec<SortSpec>) -> Self {
        self.order_by = order_by;
        self
    }

    #[must_use]
    pub fn paginate(mut self, pagination: Pagination) -> Self {
        self.pagination = pagination;
        self
    }

    #[must_use]
    pub fn project(mut self, fields: Option<Vec<String>>) -> Self {
        self.projection = fields.map(|mut f| {
            f.sort();
            f.dedup();
            f
        });
        self
    }

    #[must_use]
    pub fn aggregate(mut self, spec: AggregationSpec) -> Self {
        self.aggregation = Some(spec);
        self
    }

    #[must_use]
    pub fn search(mut self, spec: SearchSpec) -> Self {
        self.search = Some(spec);
        self
    }

    /// Deterministic cache key: `{prefix}:{entity_type}:{kind}:{sha256 of the plan}`.
    #[must_use]
    pub fn fingerprint(&self, prefix: &str) -> Fingerprint {
        use sha2::{Digest, Sha256};
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let mut h = Sha256::new();
        h.update(&canonical);
        let digest = hex::encode(h.finalize());
        Fingerprint(format!("{prefix}:{}:{}:{digest}", self.entity_type, self.kind.name()))
    }

    /// Order used by the store: requested keys followed by the `id` tie-break.
    #[must_use]
    pub fn effective_order(&self) -> Vec<SortSpec> {
        let mut order = self.order_by.clone();
        if !order.iter().any(|s| s.field == "id") {
            let tie = order.last().map_or(super::types::Order::Asc, |s| s.order);
            order.push(SortSpec { field: "id".into(), order: tie });
        }
        order
    }
}

/// Cache key derived from a [`QueryPlan`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Pattern matching every fingerprint of an entity type.
    #[must_use]
    pub fn entity_pattern(prefix: &str, entity_type: &str) -> String {
        format!("{prefix}:{entity_type}:*")
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
