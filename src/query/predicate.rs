use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{Comparison, Operator};
use crate::schema::FieldType;

/// Where a compiled term reads its value from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolvedPath {
    /// Relation name when the column lives on a joined entity.
    pub join: Option<String>,
    pub column: String,
    /// Path inside a JSON column.
    pub json_path: Vec<String>,
}

impl ResolvedPath {
    #[must_use]
    pub fn column(name: &str) -> Self {
        Self { join: None, column: name.to_string(), json_path: Vec::new() }
    }

    #[must_use]
    pub fn display(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        if let Some(j) = &self.join {
            parts.push(j);
        }
        parts.push(&self.column);
        parts.extend(self.json_path.iter().map(String::as_str));
        parts.join(".")
    }
}

/// An implicit to-one join introduced by a relation path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JoinSpec {
    pub relation: String,
    pub entity_type: String,
    pub local_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledTerm {
    pub path: ResolvedPath,
    pub operator: Operator,
    pub value: Value,
    pub field_type: Option<FieldType>,
}

/// Boolean predicate tree produced by the filter compiler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    True,
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    Term(CompiledTerm),
}

impl Predicate {
    /// Conjunction with `True` removed and nested conjunctions flattened.
    #[must_use]
    pub fn and(parts: Vec<Self>) -> Self {
        let mut out = Vec::with_capacity(parts.len());
        for p in parts {
            match p {
                Self::True => {}
                Self::And(inner) => out.extend(inner),
                other => out.push(other),
            }
        }
        match out.len() {
            0 => Self::True,
            1 => out.pop().unwrap_or(Self::True),
            _ => Self::And(out),
        }
    }

    /// Disjunction; an empty list matches everything.
    #[must_use]
    pub fn or(parts: Vec<Self>) -> Self {
        if parts.iter().any(|p| matches!(p, Self::True)) {
            return Self::True;
        }
        let mut out = Vec::with_capacity(parts.len());
        for p in parts {
            match p {
                Self::Or(inner) => out.extend(inner),
                other => out.push(other),
            }
        }
        match out.len() {
            0 => Self::True,
            1 => out.pop().unwrap_or(Self::True),
            _ => Self::Or(out),
        }
    }

    #[must_use]
    pub fn negate(p: Self) -> Self {
        match p {
            Self::Not(inner) => *inner,
            other => Self::Not(Box::new(other)),
        }
    }

    #[must_use]
    pub fn term(path: ResolvedPath, operator: Operator, value: Value, field_type: Option<FieldType>) -> Self {
        Self::Term(CompiledTerm { path, operator, value, field_type })
    }

    /// Soft-delete scope: `deleted_at IS NULL`.
    #[must_use]
    pub fn not_deleted() -> Self {
        Self::term(
            ResolvedPath::column("deleted_at"),
            Operator::IsNull,
            Value::Bool(true),
            Some(FieldType::Timestamp),
        )
    }

    #[must_use]
    pub fn id_in(ids: &[crate::types::EntityId]) -> Self {
        let values = ids.iter().map(|id| Value::String(id.to_string())).collect();
        Self::term(ResolvedPath::column("id"), Operator::In, Value::Array(values), Some(FieldType::Text))
    }

    #[must_use]
    pub fn id_eq(id: &crate::types::EntityId) -> Self {
        Self::term(
            ResolvedPath::column("id"),
            Operator::Cmp(Comparison::Eq),
            Value::String(id.to_string()),
            Some(FieldType::Text),
        )
    }

    /// Reorders AND/OR children so logically identical trees compare (and hash) equal.
    #[must_use]
    pub fn canonical(self) -> Self {
        fn sort_children(mut parts: Vec<Predicate>) -> Vec<Predicate> {
            let mut keyed: Vec<(String, Predicate)> = parts
                .drain(..)
                .map(Predicate::canonical)
                .map(|p| (serde_json::to_string(&p).unwrap_or_default(), p))
                .collect();
            keyed.sort_by(|a, b| a.0.cmp(&b.0));
            keyed.dedup_by(|a, b| a.0 == b.0);
            keyed.into_iter().map(|(_, p)| p).collect()
        }
        match self {
            Self::And(parts) => Self::And(sort_children(parts)),
            Self::Or(parts) => Self::Or(sort_children(parts)),
            Self::Not(inner) => Self::Not(Box::new(inner.canonical())),
            other => other,
        }
    }

    /// Number of term leaves.
    #[must_use]
    pub fn term_count(&self) -> usize {
        match self {
            Self::True => 0,
            Self::Term(_) => 1,
            Self::Not(inner) => inner.term_count(),
            Self::And(parts) | Self::Or(parts) => parts.iter().map(Self::term_count).sum(),
        }
    }
}
