use crate::types::{Entity, parse_timestamp};
use chrono::Datelike;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;

use super::predicate::{CompiledTerm, Predicate, ResolvedPath};
use super::types::{Comparison, Operator, TemporalPart};

const MAX_CACHED_PATTERNS: usize = 1024;

static PATTERNS: Lazy<Mutex<HashMap<String, Regex>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// A row under evaluation together with the rows its joins resolved to.
pub struct Row<'a> {
    pub entity: &'a Entity,
    pub joined: &'a HashMap<String, Entity>,
}

impl Row<'_> {
    #[must_use]
    pub fn value(&self, path: &ResolvedPath) -> Option<Value> {
        let source = match &path.join {
            Some(rel) => self.joined.get(rel)?,
            None => self.entity,
        };
        source.lookup(&path.column, &path.json_path)
    }
}

#[must_use]
pub fn eval_predicate(row: &Row<'_>, p: &Predicate) -> bool {
    match p {
        Predicate::True => true,
        Predicate::And(parts) => parts.iter().all(|q| eval_predicate(row, q)),
        Predicate::Or(parts) => parts.iter().any(|q| eval_predicate(row, q)),
        Predicate::Not(inner) => !eval_predicate(row, inner),
        Predicate::Term(t) => eval_term(row.value(&t.path), t),
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn cmp_numbers(a: &serde_json::Number, b: &serde_json::Number) -> Ordering {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x.cmp(&y);
    }
    let (x, y) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
    x.partial_cmp(&y).unwrap_or(Ordering::Equal)
}

/// Order used for sorting: by type first, then by value. Strings compare as in [`compare_operands`].
#[must_use]
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => cmp_numbers(x, y),
        (Value::String(x), Value::String(y)) => compare_strings(x, y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y) {
                let ord = compare_values(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(_), Value::Object(_)) => a.to_string().cmp(&b.to_string()),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Ordering between a column value and a filter operand; `None` when they are not comparable.
/// Strings that both parse as timestamps compare chronologically.
#[must_use]
pub fn compare_operands(field: &Value, operand: &Value) -> Option<Ordering> {
    match (field, operand) {
        (Value::Number(x), Value::Number(y)) => Some(cmp_numbers(x, y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::String(x), Value::String(y)) => Some(compare_strings(x, y)),
        (l, r) if l == r => Some(Ordering::Equal),
        _ => None,
    }
}

/// Shared by sorting and filtering so keyset bounds agree with page order:
/// two timestamps compare chronologically, anything else by text.
fn compare_strings(x: &str, y: &str) -> Ordering {
    if x == y {
        return Ordering::Equal;
    }
    match (parse_timestamp(x), parse_timestamp(y)) {
        (Some(l), Some(r)) => l.cmp(&r),
        _ => x.cmp(y),
    }
}

fn is_equal(field: &Value, operand: &Value) -> bool {
    compare_operands(field, operand) == Some(Ordering::Equal)
}

fn compare(field: Option<&Value>, c: Comparison, operand: &Value) -> bool {
    let field = field.unwrap_or(&Value::Null);
    match (c, operand.is_null()) {
        (Comparison::Eq, true) => field.is_null(),
        (Comparison::Ne, true) => !field.is_null(),
        _ if field.is_null() => false,
        (Comparison::Ne, false) => !is_equal(field, operand),
        _ => compare_operands(field, operand).is_some_and(|ord| c.holds(ord)),
    }
}

fn cached_regex(key: String, build: impl FnOnce() -> String) -> Option<Regex> {
    let mut cache = PATTERNS.lock();
    if let Some(r) = cache.get(&key) {
        return Some(r.clone());
    }
    let re = Regex::new(&build()).ok()?;
    if cache.len() >= MAX_CACHED_PATTERNS {
        cache.clear();
    }
    cache.insert(key, re.clone());
    Some(re)
}

/// Translates a SQL `LIKE` pattern (`%`, `_`, backslash escapes) into an anchored regex.
#[must_use]
pub fn like_to_regex(pattern: &str, case_insensitive: bool) -> String {
    let mut out = String::from(if case_insensitive { "(?is)^" } else { "(?s)^" });
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            '\\' => {
                if let Some(next) = chars.next() {
                    out.push_str(&regex::escape(&next.to_string()));
                }
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

fn like(field: &str, pattern: &str, case_insensitive: bool) -> bool {
    let key = format!("like:{case_insensitive}:{pattern}");
    cached_regex(key, || like_to_regex(pattern, case_insensitive)).is_some_and(|re| re.is_match(field))
}

fn temporal(field: &Value, part: TemporalPart, c: Comparison, operand: &Value) -> bool {
    let Some(ts) = field.as_str().and_then(parse_timestamp) else {
        return false;
    };
    let extracted = match part {
        TemporalPart::Date => Value::String(ts.format("%Y-%m-%d").to_string()),
        TemporalPart::Year => Value::from(ts.year()),
        TemporalPart::Month => Value::from(ts.month()),
        TemporalPart::Day => Value::from(ts.day()),
        TemporalPart::Week => Value::from(ts.iso_week().week()),
        TemporalPart::Quarter => Value::from((ts.month() - 1) / 3 + 1),
    };
    compare(Some(&extracted), c, operand)
}

/// Containment in the sense of `jsonb @>`.
#[must_use]
pub fn json_contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::Object(h), Value::Object(n)) => {
            n.iter().all(|(k, nv)| h.get(k).is_some_and(|hv| json_contains(hv, nv)))
        }
        (Value::Array(h), Value::Array(n)) => {
            n.iter().all(|nv| h.iter().any(|hv| json_contains(hv, nv)))
        }
        (Value::Array(h), scalar) => h.iter().any(|hv| is_equal(hv, scalar)),
        (h, n) => is_equal(h, n),
    }
}

fn extract(field: &Value, spec: &Value) -> bool {
    let Some(path) = spec.get("path").and_then(Value::as_str) else {
        return false;
    };
    let op = spec.get("op").and_then(Value::as_str).and_then(Comparison::parse).unwrap_or(Comparison::Eq);
    let mut cur = field;
    for seg in path.split('.').filter(|s| !s.is_empty()) {
        let next = match cur {
            Value::Object(m) => m.get(seg),
            Value::Array(a) => seg.parse::<usize>().ok().and_then(|i| a.get(i)),
            _ => None,
        };
        match next {
            Some(v) => cur = v,
            None => return compare(None, op, spec.get("value").unwrap_or(&Value::Null)),
        }
    }
    compare(Some(cur), op, spec.get("value").unwrap_or(&Value::Null))
}

fn between(field: &Value, bounds: &Value) -> Option<bool> {
    let [lo, hi] = bounds.as_array()?.as_slice() else {
        return None;
    };
    let above = compare_operands(field, lo)? != Ordering::Less;
    let below = compare_operands(field, hi)? != Ordering::Greater;
    Some(above && below)
}

fn eval_term(field: Option<Value>, t: &CompiledTerm) -> bool {
    let present = field.as_ref().filter(|v| !v.is_null());
    match t.operator {
        Operator::Cmp(c) => compare(field.as_ref(), c, &t.value),
        Operator::IsNull => present.is_none(),
        Operator::IsNotNull => present.is_some(),
        Operator::In => match (present, t.value.as_array()) {
            (Some(f), Some(items)) => items.iter().any(|i| is_equal(f, i)),
            _ => false,
        },
        Operator::NotIn => match (present, t.value.as_array()) {
            (Some(f), Some(items)) => !items.iter().any(|i| is_equal(f, i)),
            _ => false,
        },
        Operator::Between => present.and_then(|f| between(f, &t.value)).unwrap_or(false),
        Operator::NotBetween => present.and_then(|f| between(f, &t.value)).is_some_and(|b| !b),
        Operator::Like | Operator::Ilike => match (present.and_then(Value::as_str), t.value.as_str()) {
            (Some(f), Some(p)) => like(f, p, t.operator == Operator::Ilike),
            _ => false,
        },
        Operator::StartsWith => match (present.and_then(Value::as_str), t.value.as_str()) {
            (Some(f), Some(p)) => f.starts_with(p),
            _ => false,
        },
        Operator::EndsWith => match (present.and_then(Value::as_str), t.value.as_str()) {
            (Some(f), Some(p)) => f.ends_with(p),
            _ => false,
        },
        Operator::Contains => match present {
            Some(Value::String(f)) => t.value.as_str().is_some_and(|p| f.contains(p)),
            Some(Value::Array(items)) => items.iter().any(|i| is_equal(i, &t.value)),
            _ => false,
        },
        Operator::Regex => match (present.and_then(Value::as_str), t.value.as_str()) {
            (Some(f), Some(p)) => cached_regex(format!("re:{p}"), || p.to_string()).is_some_and(|re| re.is_match(f)),
            _ => false,
        },
        Operator::Temporal(part, c) => present.is_some_and(|f| temporal(f, part, c, &t.value)),
        Operator::JsonContains => present.is_some_and(|f| json_contains(f, &t.value)),
        Operator::JsonHasKey => match (present, t.value.as_str()) {
            (Some(Value::Object(m)), Some(k)) => m.contains_key(k),
            (Some(Value::Array(items)), Some(k)) => items.iter().any(|i| i.as_str() == Some(k)),
            _ => false,
        },
        Operator::JsonExtract => present.is_some_and(|f| extract(f, &t.value)),
        Operator::Search(mode, lang) => match (present.and_then(Value::as_str), t.value.as_str()) {
            (Some(f), Some(q)) => super::fulltext::text_matches(f, q, mode, lang),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{FilterCompiler, parse_filter_value};
    use crate::schema::{EntitySchema, FieldType, SchemaRegistry};
    use serde_json::json;
    use std::sync::Arc;

    fn matches(data: Value, filter: Value) -> bool {
        let reg = SchemaRegistry::new();
        reg.register(
            EntitySchema::new("users")
                .field("name", FieldType::Text)
                .field("age", FieldType::Integer)
                .field("tags", FieldType::Array)
                .field("meta", FieldType::Json),
        );
        let compiled = FilterCompiler::new(Arc::new(reg))
            .compile("users", &parse_filter_value(&filter).unwrap())
            .unwrap();
        let mut e = Entity::new(data.as_object().cloned().unwrap());
        e.created_at = parse_timestamp("2024-05-17T08:30:00Z").unwrap();
        let joined = HashMap::new();
        eval_predicate(&Row { entity: &e, joined: &joined }, &compiled.predicate)
    }

    #[test]
    fn comparisons_and_nulls() {
        assert!(matches(json!({"age": 30}), json!({"age__gte": 18, "age__lt": 65})));
        assert!(!matches(json!({"age": 30}), json!({"age__gt": 30})));
        assert!(matches(json!({"age": 30}), json!({"nickname": null})));
        assert!(!matches(json!({"age": 30}), json!({"age__ne": 30})));
        // SQL semantics: null never satisfies ne/not_in
        assert!(!matches(json!({}), json!({"age__ne": 30})));
        assert!(!matches(json!({}), json!({"age__not_in": [1, 2]})));
        assert!(matches(json!({"age": 3}), json!({"age__not_in": [1, 2]})));
        assert!(matches(json!({"age": 2}), json!({"age__in": [1, 2]})));
        assert!(matches(json!({"age": 5}), json!({"age__between": [5, 9]})));
        assert!(matches(json!({"age": 10}), json!({"age__not_between": [5, 9]})));
    }

    #[test]
    fn string_operators() {
        let d = json!({"name": "Ada Lovelace"});
        assert!(matches(d.clone(), json!({"name__like": "Ada%"})));
        assert!(!matches(d.clone(), json!({"name__like": "ada%"})));
        assert!(matches(d.clone(), json!({"name__ilike": "ada _ovelace"})));
        assert!(matches(d.clone(), json!({"name__startswith": "Ada"})));
        assert!(matches(d.clone(), json!({"name__endswith": "lace"})));
        assert!(matches(d.clone(), json!({"name__contains": "Love"})));
        assert!(matches(d.clone(), json!({"name__regex": "^A.a\\s"})));
        assert!(matches(d, json!({"name__isnotnull": true})));
    }

    #[test]
    fn like_escapes_literals() {
        assert_eq!(like_to_regex("50\\%", false), "(?s)^50%$");
        assert!(like("a.b", "a.b", false));
        assert!(!like("axb", "a.b", false));
    }

    #[test]
    fn temporal_extraction() {
        assert!(matches(json!({}), json!({"created_at__year": 2024})));
        assert!(matches(json!({}), json!({"created_at__month": 5, "created_at__day": 17})));
        assert!(matches(json!({}), json!({"created_at__quarter": 2})));
        assert!(matches(json!({}), json!({"created_at__week": 20})));
        assert!(matches(json!({}), json!({"created_at__date": "2024-05-17"})));
        assert!(matches(json!({}), json!({"created_at__year__gte": 2020})));
        assert!(matches(json!({}), json!({"created_at__gt": "2024-05-01"})));
    }

    #[test]
    fn json_and_array_operators() {
        let d = json!({"tags": ["a", "b"], "meta": {"owner": {"id": 7}, "flags": ["x"]}});
        assert!(matches(d.clone(), json!({"tags__contains": "b"})));
        assert!(matches(d.clone(), json!({"meta__json_contains": {"owner": {"id": 7}}})));
        assert!(!matches(d.clone(), json!({"meta__json_contains": {"owner": {"id": 8}}})));
        assert!(matches(d.clone(), json!({"meta__json_has_key": "flags"})));
        assert!(matches(d.clone(), json!({"meta__json_extract": {"path": "owner.id", "op": "gt", "value": 5}})));
        assert!(matches(d, json!({"meta__owner__id": 7})));
    }

    #[test]
    fn search_operator() {
        let d = json!({"name": "Running with wolves"});
        assert!(matches(d.clone(), json!({"name__search": "wolves"})));
        assert!(matches(d.clone(), json!({"name__search_phrase": "running with"})));
        assert!(!matches(d, json!({"name__search_raw": "wolf & !run"})));
    }

    #[test]
    fn sort_order_is_total() {
        let mut vals = vec![json!("b"), json!(null), json!(2), json!(1.5), json!(true), json!("a")];
        vals.sort_by(compare_values);
        assert_eq!(vals, vec![json!(null), json!(true), json!(1.5), json!(2), json!("a"), json!("b")]);
    }

    #[test]
    fn mixed_offset_timestamps_sort_like_they_filter() {
        // 10:00+02:00 is 08:00Z, earlier than 09:00Z though it sorts later as text
        let early = json!("2024-05-17T10:00:00+02:00");
        let late = json!("2024-05-17T09:00:00Z");
        assert_eq!(compare_values(&early, &late), Ordering::Less);
        assert_eq!(compare_operands(&early, &late), Some(Ordering::Less));
        let mut vals = vec![late.clone(), early.clone()];
        vals.sort_by(compare_values);
        assert_eq!(vals, vec![early, late]);
    }
}
