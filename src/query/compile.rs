use crate::errors::{RepoError, RepoResult};
use crate::schema::{EntitySchema, FieldType, SchemaRegistry};
use crate::types::{format_timestamp, parse_timestamp};
use serde_json::{Map, Value};
use std::sync::Arc;

use super::predicate::{JoinSpec, Predicate, ResolvedPath};
use super::types::{
    Comparison, ComplexFilter, FieldPath, FilterExpression, FilterInput, FilterTerm, MAX_IN_SET,
    Operator, TemporalPart,
};

/// Output of compilation: the predicate tree and the joins it needs, deduplicated.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFilter {
    pub predicate: Predicate,
    pub joins: Vec<JoinSpec>,
}

/// Compiles filter expressions into typed predicates, checking operators and
/// values against the entity schema.
#[derive(Clone)]
pub struct FilterCompiler {
    registry: Arc<SchemaRegistry>,
}

impl FilterCompiler {
    #[must_use]
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self { registry }
    }

    /// # Errors
    /// `UnsupportedOperator`, `TypeMismatch`, `UnknownField` or `Validation` for rejected input.
    pub fn compile(&self, entity_type: &str, input: &FilterInput) -> RepoResult<CompiledFilter> {
        match input {
            FilterInput::Simple(expr) => self.compile_expression(entity_type, expr),
            FilterInput::Complex(c) => self.compile_complex(entity_type, c),
        }
    }

    /// # Errors
    /// See [`FilterCompiler::compile`].
    pub fn compile_expression(
        &self,
        entity_type: &str,
        expr: &FilterExpression,
    ) -> RepoResult<CompiledFilter> {
        let schema = self.registry.get(entity_type);
        let mut joins = Vec::new();
        let parts = self.compile_terms(&schema, &expr.terms, &mut joins)?;
        Ok(CompiledFilter { predicate: Predicate::and(parts), joins })
    }

    /// # Errors
    /// See [`FilterCompiler::compile`].
    pub fn compile_complex(&self, entity_type: &str, filter: &ComplexFilter) -> RepoResult<CompiledFilter> {
        let schema = self.registry.get(entity_type);
        let mut joins = Vec::new();
        let and_part = Predicate::and(self.compile_terms(&schema, &filter.and_filters.terms, &mut joins)?);
        let or_part = if filter.or_filters.is_empty() {
            Predicate::True
        } else {
            let mut alternatives = Vec::with_capacity(filter.or_filters.len());
            for alt in &filter.or_filters {
                alternatives.push(Predicate::and(self.compile_terms(&schema, &alt.terms, &mut joins)?));
            }
            Predicate::or(alternatives)
        };
        let not_part = Predicate::and(
            self.compile_terms(&schema, &filter.not_filters.terms, &mut joins)?
                .into_iter()
                .map(Predicate::negate)
                .collect(),
        );
        Ok(CompiledFilter { predicate: Predicate::and(vec![and_part, or_part, not_part]), joins })
    }

    fn compile_terms(
        &self,
        schema: &EntitySchema,
        terms: &[FilterTerm],
        joins: &mut Vec<JoinSpec>,
    ) -> RepoResult<Vec<Predicate>> {
        terms.iter().map(|t| self.compile_term(schema, t, joins)).collect()
    }

    fn compile_term(
        &self,
        schema: &EntitySchema,
        term: &FilterTerm,
        joins: &mut Vec<JoinSpec>,
    ) -> RepoResult<Predicate> {
        let (path, ty) = self.resolve_path(schema, &term.field, joins)?;
        let field = path.display();
        let value = check_value(&field, term.operator, ty, &term.value)?;
        log::trace!("compiled {field}__{} on {}", term.operator.name(), schema.entity_type);
        Ok(Predicate::term(path, term.operator, value, ty))
    }

    /// Resolves a dotted path to a column (possibly on a joined relation) plus
    /// a JSON sub-path. Returns the column type when the path ends at a column.
    ///
    /// # Errors
    /// `UnknownField` for undeclared columns of strict schemas, `UnsupportedOperator`
    /// when anything but a JSON or array column is followed by an unrecognised suffix.
    pub fn resolve_path(
        &self,
        schema: &EntitySchema,
        path: &FieldPath,
        joins: &mut Vec<JoinSpec>,
    ) -> RepoResult<(ResolvedPath, Option<FieldType>)> {
        let head = path.head();
        let (join, column, rest, ty) = match schema.relations.get(head) {
            Some(rel) if path.segments.len() >= 2 => {
                let related = self.registry.get(&rel.entity_type);
                let column = &path.segments[1];
                let ty = related.resolve_field(column)?;
                if !joins.iter().any(|j| j.relation == head) {
                    joins.push(JoinSpec {
                        relation: head.to_string(),
                        entity_type: rel.entity_type.clone(),
                        local_key: rel.local_key.clone(),
                    });
                }
                (Some(head.to_string()), column.clone(), &path.segments[2..], ty)
            }
            _ => (None, head.to_string(), &path.segments[1..], schema.resolve_field(head)?),
        };
        // a sub-path needs a declared JSON or array column; anywhere else the
        // trailing segment is an operator nobody recognised
        if !rest.is_empty() && !matches!(ty, Some(FieldType::Json | FieldType::Array)) {
            let suffix = rest.last().map_or(String::new(), Clone::clone);
            return Err(RepoError::UnsupportedOperator(suffix));
        }
        let effective = if rest.is_empty() { ty } else { None };
        Ok((ResolvedPath { join, column, json_path: rest.to_vec() }, effective))
    }
}

fn require(field: &str, ty: Option<FieldType>, allowed: &[FieldType], expected: &str) -> RepoResult<()> {
    match ty {
        Some(t) if !allowed.contains(&t) => Err(RepoError::TypeMismatch {
            field: field.to_string(),
            expected: expected.to_string(),
            found: t.name().to_string(),
        }),
        _ => Ok(()),
    }
}

fn expect_str<'a>(field: &str, v: &'a Value) -> RepoResult<&'a str> {
    v.as_str().ok_or_else(|| RepoError::mismatch(field, "text", v))
}

/// Checks a scalar operand against the column type; timestamps are normalised
/// to their fixed-width rendering.
fn scalar(field: &str, ty: Option<FieldType>, v: &Value) -> RepoResult<Value> {
    match ty {
        Some(FieldType::Timestamp) => match v {
            Value::Null => Ok(Value::Null),
            Value::String(s) => parse_timestamp(s)
                .map(|ts| Value::String(format_timestamp(&ts)))
                .ok_or_else(|| RepoError::mismatch(field, "timestamp", v)),
            other => Err(RepoError::mismatch(field, "timestamp", other)),
        },
        Some(t) => {
            t.check(field, v)?;
            Ok(canonical_json(v.clone()))
        }
        None => Ok(canonical_json(v.clone())),
    }
}

fn check_value(field: &str, op: Operator, ty: Option<FieldType>, v: &Value) -> RepoResult<Value> {
    use FieldType as T;
    match op {
        Operator::Cmp(c) => {
            if v.is_null() && !matches!(c, Comparison::Eq | Comparison::Ne) {
                return Err(RepoError::Validation(format!("{field}: {} null is undefined", c.name())));
            }
            scalar(field, ty, v)
        }
        Operator::In | Operator::NotIn => {
            let items = v.as_array().ok_or_else(|| RepoError::mismatch(field, "array", v))?;
            if items.len() > MAX_IN_SET {
                return Err(RepoError::Validation(format!("{field}: in-list exceeds {MAX_IN_SET} values")));
            }
            let element_ty = if matches!(ty, Some(T::Array | T::Json)) { None } else { ty };
            let checked = items.iter().map(|i| scalar(field, element_ty, i)).collect::<RepoResult<Vec<_>>>()?;
            Ok(Value::Array(checked))
        }
        Operator::Between | Operator::NotBetween => match v.as_array().map(Vec::as_slice) {
            Some([lo, hi]) if !lo.is_null() && !hi.is_null() => {
                Ok(Value::Array(vec![scalar(field, ty, lo)?, scalar(field, ty, hi)?]))
            }
            _ => Err(RepoError::Validation(format!("{field}: between expects [low, high]"))),
        },
        Operator::Like | Operator::Ilike | Operator::StartsWith | Operator::EndsWith => {
            require(field, ty, &[T::Text], "text")?;
            Ok(Value::String(expect_str(field, v)?.to_string()))
        }
        Operator::Contains => {
            if ty == Some(T::Array) {
                return Ok(canonical_json(v.clone()));
            }
            require(field, ty, &[T::Text], "text or array")?;
            if ty == Some(T::Text) {
                expect_str(field, v)?;
            }
            Ok(canonical_json(v.clone()))
        }
        Operator::Regex => {
            require(field, ty, &[T::Text], "text")?;
            let pattern = expect_str(field, v)?;
            regex::Regex::new(pattern)
                .map_err(|e| RepoError::Validation(format!("{field}: invalid regex: {e}")))?;
            Ok(Value::String(pattern.to_string()))
        }
        Operator::IsNull | Operator::IsNotNull => Ok(Value::Bool(true)),
        Operator::Temporal(part, _) => {
            require(field, ty, &[T::Timestamp], "timestamp")?;
            if part == TemporalPart::Date {
                let s = expect_str(field, v)?;
                let ts = parse_timestamp(s).ok_or_else(|| RepoError::mismatch(field, "date", v))?;
                Ok(Value::String(ts.format("%Y-%m-%d").to_string()))
            } else if v.is_i64() || v.is_u64() {
                Ok(v.clone())
            } else {
                Err(RepoError::mismatch(field, "integer", v))
            }
        }
        Operator::JsonContains => {
            require(field, ty, &[T::Json, T::Array], "json")?;
            Ok(canonical_json(v.clone()))
        }
        Operator::JsonHasKey => {
            require(field, ty, &[T::Json], "json")?;
            Ok(Value::String(expect_str(field, v)?.to_string()))
        }
        Operator::JsonExtract => {
            require(field, ty, &[T::Json], "json")?;
            let spec = v.as_object().ok_or_else(|| {
                RepoError::Validation(format!("{field}: json_extract expects {{path, value}}"))
            })?;
            let path = spec.get("path").and_then(Value::as_str).ok_or_else(|| {
                RepoError::Validation(format!("{field}: json_extract requires a string path"))
            })?;
            let op = match spec.get("op").and_then(Value::as_str) {
                Some(name) => Comparison::parse(name)
                    .ok_or_else(|| RepoError::UnsupportedOperator(name.to_string()))?,
                None => Comparison::Eq,
            };
            let mut out = Map::new();
            out.insert("op".into(), Value::String(op.name().into()));
            out.insert("path".into(), Value::String(path.to_string()));
            out.insert("value".into(), canonical_json(spec.get("value").cloned().unwrap_or(Value::Null)));
            Ok(Value::Object(out))
        }
        Operator::Search(mode, lang) => {
            require(field, ty, &[T::Text], "text")?;
            let q = expect_str(field, v)?;
            if q.trim().is_empty() {
                return Err(RepoError::Validation(format!("{field}: empty search query")));
            }
            super::fulltext::parse_query(q, mode, lang)?;
            Ok(Value::String(q.to_string()))
        }
    }
}

/// Recursively sorts object keys so equal documents serialize identically.
#[must_use]
pub fn canonical_json(v: Value) -> Value {
    match v {
        Value::Object(m) => {
            let mut entries: Vec<(String, Value)> = m.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k, canonical_json(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonical_json).collect()),
        other => other,
    }
}
