use crate::errors::{RepoError, RepoResult};
use serde_json::{Map, Value};

use super::types::{
    Comparison, ComplexFilter, FieldPath, FilterExpression, FilterInput, FilterTerm,
    MAX_PATH_DEPTH, MAX_TERMS, Operator, TemporalPart,
};

/// Splits `field__op` keys. Keys without a recognised suffix compare for equality;
/// `created_at__year__gte` chains a temporal extraction with a comparison.
/// An unrecognised suffix stays on the path, where compilation either reads it
/// as a JSON sub-path or rejects it as an unsupported operator.
///
/// # Errors
/// Returns `Validation` for empty or overly deep paths.
pub fn parse_key(key: &str) -> RepoResult<(FieldPath, Operator)> {
    let parts: Vec<&str> = key.split("__").collect();
    let n = parts.len();
    let (path_parts, op) = if n >= 3
        && let (Some(part), Some(cmp)) =
            (TemporalPart::parse(parts[n - 2]), Comparison::parse(parts[n - 1]))
    {
        (&parts[..n - 2], Operator::Temporal(part, cmp))
    } else if n >= 2
        && let Some(op) = Operator::parse(parts[n - 1])
    {
        (&parts[..n - 1], op)
    } else {
        (&parts[..], Operator::Cmp(Comparison::Eq))
    };
    let path = FieldPath::new(&path_parts.join("__"));
    if path.segments.is_empty() {
        return Err(RepoError::Validation(format!("filter key {key:?} has no field")));
    }
    if path.segments.len() > MAX_PATH_DEPTH {
        return Err(RepoError::Validation(format!("filter key {key:?} is nested too deeply")));
    }
    Ok((path, op))
}

/// Parses one filter term from a `field__op` key and its value.
///
/// # Errors
/// See [`parse_key`].
pub fn parse_term(key: &str, value: &Value) -> RepoResult<FilterTerm> {
    let (field, mut operator) = parse_key(key)?;
    let mut value = value.clone();
    // `isnull: false` reads as "is not null"
    if operator == Operator::IsNull && value == Value::Bool(false) {
        operator = Operator::IsNotNull;
        value = Value::Bool(true);
    }
    Ok(FilterTerm { field, operator, value })
}

/// Parses a flat filter object into a conjunction of terms.
///
/// # Errors
/// Returns `Validation` when the map is too large or a key is malformed.
pub fn parse_filter_map(map: &Map<String, Value>) -> RepoResult<FilterExpression> {
    if map.len() > MAX_TERMS {
        return Err(RepoError::Validation(format!("too many filter terms ({})", map.len())));
    }
    let terms = map.iter().map(|(k, v)| parse_term(k, v)).collect::<RepoResult<Vec<_>>>()?;
    Ok(FilterExpression { terms })
}

fn expect_object<'a>(v: &'a Value, what: &str) -> RepoResult<&'a Map<String, Value>> {
    v.as_object().ok_or_else(|| RepoError::Validation(format!("{what} must be a JSON object")))
}

/// Parses `{and_filters, or_filters, not_filters}`.
///
/// # Errors
/// Returns `Validation` for structurally invalid input.
pub fn parse_complex(map: &Map<String, Value>) -> RepoResult<ComplexFilter> {
    let mut out = ComplexFilter::default();
    for (k, v) in map {
        match k.as_str() {
            "and_filters" => out.and_filters = parse_filter_map(expect_object(v, "and_filters")?)?,
            "not_filters" => out.not_filters = parse_filter_map(expect_object(v, "not_filters")?)?,
            "or_filters" => match v {
                Value::Array(items) => {
                    for item in items {
                        out.or_filters.push(parse_filter_map(expect_object(item, "or_filters entry")?)?);
                    }
                }
                // a single object means one alternative per key
                Value::Object(m) => {
                    for (ok, ov) in m {
                        out.or_filters.push(FilterExpression { terms: vec![parse_term(ok, ov)?] });
                    }
                }
                _ => return Err(RepoError::Validation("or_filters must be an array".into())),
            },
            other => {
                return Err(RepoError::Validation(format!("unexpected complex filter key {other:?}")));
            }
        }
    }
    Ok(out)
}

/// Parses either a flat filter map or a complex filter.
///
/// # Errors
/// Returns `Validation` for non-object input or malformed keys.
pub fn parse_filter_value(v: &Value) -> RepoResult<FilterInput> {
    let map = expect_object(v, "filter")?;
    let is_complex = ["and_filters", "or_filters", "not_filters"].iter().any(|k| map.contains_key(*k));
    if is_complex {
        Ok(FilterInput::Complex(parse_complex(map)?))
    } else {
        Ok(FilterInput::Simple(parse_filter_map(map)?))
    }
}

/// # Errors
/// Returns `Json` for invalid JSON text, otherwise see [`parse_filter_value`].
pub fn parse_filter_json(json: &str) -> RepoResult<FilterInput> {
    let v: Value = serde_json::from_str(json)?;
    parse_filter_value(&v)
}

impl TryFrom<&Value> for FilterExpression {
    type Error = RepoError;
    fn try_from(v: &Value) -> Result<Self, Self::Error> {
        parse_filter_map(expect_object(v, "filter")?)
    }
}

impl TryFrom<&Value> for ComplexFilter {
    type Error = RepoError;
    fn try_from(v: &Value) -> Result<Self, Self::Error> {
        parse_complex(expect_object(v, "complex filter")?)
    }
}
