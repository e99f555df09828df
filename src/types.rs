use crate::errors::{RepoError, RepoResult};
use chrono::{DateTime, NaiveDate, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Built-in columns every entity carries alongside its data fields.
pub const BUILTIN_FIELDS: [&str; 4] = ["id", "created_at", "updated_at", "deleted_at"];

/// Unique identifier for an entity row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub Uuid);

impl EntityId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// # Errors
    /// Returns `Validation` when the input is not a UUID.
    pub fn parse(s: &str) -> RepoResult<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| RepoError::Validation(format!("invalid entity id {s:?}: {e}")))
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current time truncated to microseconds, the resolution timestamps are compared at.
#[must_use]
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339 rendering; lexicographic order matches chronological order.
#[must_use]
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Accepts RFC 3339 timestamps and bare `YYYY-MM-DD` dates (midnight UTC).
#[must_use]
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[must_use]
pub fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "text",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A persisted row: generated columns plus the caller-supplied data map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub data: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Entity {
    #[must_use]
    pub fn new(data: Map<String, Value>) -> Self {
        let ts = now();
        Self { id: EntityId::new(), data, created_at: ts, updated_at: ts, deleted_at: None }
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Value of a top-level column; built-ins are rendered as JSON strings.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::String(self.id.to_string())),
            "created_at" => Some(Value::String(format_timestamp(&self.created_at))),
            "updated_at" => Some(Value::String(format_timestamp(&self.updated_at))),
            "deleted_at" => {
                Some(self.deleted_at.as_ref().map_or(Value::Null, |ts| Value::String(format_timestamp(ts))))
            }
            _ => self.data.get(name).cloned(),
        }
    }

    /// Column value followed by a nested JSON path inside it.
    #[must_use]
    pub fn lookup(&self, column: &str, json_path: &[String]) -> Option<Value> {
        let mut cur = self.field(column)?;
        for seg in json_path {
            cur = match cur {
                Value::Object(mut m) => m.remove(seg)?,
                Value::Array(mut a) => {
                    let idx = seg.parse::<usize>().ok()?;
                    if idx >= a.len() {
                        return None;
                    }
                    a.swap_remove(idx)
                }
                _ => return None,
            };
        }
        Some(cur)
    }

    /// Keep only the listed data fields; built-in columns are always retained.
    pub fn project(&mut self, fields: &[String]) {
        self.data.retain(|k, _| fields.iter().any(|f| f == k));
    }
}

/// Change applied to the soft-delete marker by a patch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletedAtChange {
    #[default]
    Keep,
    Set(DateTime<Utc>),
    Clear,
}

/// Partial update: `$set`, `$inc` and `$unset` over dotted data paths.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    #[serde(default)]
    pub set: Map<String, Value>,
    #[serde(default)]
    pub inc: Vec<(String, f64)>,
    #[serde(default)]
    pub unset: Vec<String>,
    #[serde(default)]
    pub deleted_at: DeletedAtChange,
}

impl Patch {
    #[must_use]
    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.set.insert(field.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn inc(mut self, field: &str, by: f64) -> Self {
        self.inc.push((field.to_string(), by));
        self
    }

    #[must_use]
    pub fn unset(mut self, field: &str) -> Self {
        self.unset.push(field.to_string());
        self
    }

    #[must_use]
    pub fn from_map(set: Map<String, Value>) -> Self {
        Self { set, ..Self::default() }
    }

    /// Parses either a plain object (treated as `$set`) or an operator
    /// document with `$set`, `$inc` and `$unset` keys.
    ///
    /// # Errors
    /// Returns `Validation` for non-object input or malformed operator values.
    pub fn from_json(v: &Value) -> RepoResult<Self> {
        let obj = v
            .as_object()
            .ok_or_else(|| RepoError::Validation("update must be a JSON object".into()))?;
        if !obj.keys().any(|k| k.starts_with('$')) {
            return Ok(Self::from_map(obj.clone()));
        }
        let mut patch = Self::default();
        for (k, val) in obj {
            match k.as_str() {
                "$set" => {
                    let m = val
                        .as_object()
                        .ok_or_else(|| RepoError::Validation("$set must be an object".into()))?;
                    patch.set.extend(m.clone());
                }
                "$inc" => {
                    let m = val
                        .as_object()
                        .ok_or_else(|| RepoError::Validation("$inc must be an object".into()))?;
                    for (field, by) in m {
                        let by = by.as_f64().ok_or_else(|| {
                            RepoError::Validation(format!("$inc.{field} must be numeric"))
                        })?;
                        patch.inc.push((field.clone(), by));
                    }
                }
                "$unset" => {
                    let arr = val
                        .as_array()
                        .ok_or_else(|| RepoError::Validation("$unset must be an array".into()))?;
                    for f in arr {
                        let f = f.as_str().ok_or_else(|| {
                            RepoError::Validation("$unset entries must be strings".into())
                        })?;
                        patch.unset.push(f.to_string());
                    }
                }
                other => return Err(RepoError::UnsupportedOperator(other.to_string())),
            }
        }
        Ok(patch)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
            && self.inc.is_empty()
            && self.unset.is_empty()
            && self.deleted_at == DeletedAtChange::Keep
    }

    /// Field names touched by this patch, first path segment only.
    #[must_use]
    pub fn touched_fields(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .set
            .keys()
            .chain(self.inc.iter().map(|(k, _)| k))
            .chain(self.unset.iter())
            .map(|k| k.split('.').next().unwrap_or(k).to_string())
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Applies the patch in place, bumping `updated_at` when anything changed.
    pub fn apply(&self, entity: &mut Entity, at: DateTime<Utc>) -> bool {
        let mut changed = false;
        for (k, v) in &self.set {
            changed |= set_path(&mut entity.data, k, v.clone());
        }
        for (k, by) in &self.inc {
            let cur = get_path(&entity.data, k);
            let next = match cur {
                Some(Value::Number(n)) if n.is_i64() && by.fract() == 0.0 => {
                    #[allow(clippy::cast_possible_truncation)]
                    let by_i = *by as i64;
                    Value::from(n.as_i64().unwrap_or(0).saturating_add(by_i))
                }
                Some(Value::Number(n)) => Value::from(n.as_f64().unwrap_or(0.0) + by),
                _ if by.fract() == 0.0 => {
                    #[allow(clippy::cast_possible_truncation)]
                    let by_i = *by as i64;
                    Value::from(by_i)
                }
                _ => Value::from(*by),
            };
            changed |= set_path(&mut entity.data, k, next);
        }
        for k in &self.unset {
            changed |= unset_path(&mut entity.data, k);
        }
        match self.deleted_at {
            DeletedAtChange::Keep => {}
            DeletedAtChange::Set(ts) => {
                if entity.deleted_at.is_none() {
                    entity.deleted_at = Some(ts);
                    changed = true;
                }
            }
            DeletedAtChange::Clear => {
                if entity.deleted_at.take().is_some() {
                    changed = true;
                }
            }
        }
        if changed {
            entity.updated_at = at;
        }
        changed
    }
}

fn get_path(root: &Map<String, Value>, path: &str) -> Option<Value> {
    let mut cur = root;
    let mut iter = path.split('.').peekable();
    while let Some(seg) = iter.next() {
        if iter.peek().is_none() {
            return cur.get(seg).cloned();
        }
        match cur.get(seg) {
            Some(Value::Object(m)) => cur = m,
            _ => return None,
        }
    }
    None
}

fn parent_mut<'a>(root: &'a mut Map<String, Value>, path: &str) -> (&'a mut Map<String, Value>, String) {
    let segs: Vec<&str> = path.split('.').collect();
    let (last, parents) = match segs.split_last() {
        Some((last, parents)) => (*last, parents),
        None => (path, &[][..]),
    };
    let mut cur = root;
    for seg in parents {
        let slot = cur.entry((*seg).to_string()).or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        cur = match slot {
            Value::Object(m) => m,
            _ => unreachable!("slot was just made an object"),
        };
    }
    (cur, last.to_string())
}

fn set_path(root: &mut Map<String, Value>, path: &str, value: Value) -> bool {
    let (parent, last) = parent_mut(root, path);
    let old = parent.insert(last, value.clone());
    old.as_ref() != Some(&value)
}

fn unset_path(root: &mut Map<String, Value>, path: &str) -> bool {
    if get_path(root, path).is_none() {
        return false;
    }
    let (parent, last) = parent_mut(root, path);
    parent.remove(&last).is_some()
}

/// Top-level fields whose values differ between two versions of a row.
#[must_use]
pub fn changed_fields(old: &Entity, new: &Entity) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for (k, v) in &new.data {
        if old.data.get(k) != Some(v) {
            out.push(k.clone());
        }
    }
    for k in old.data.keys() {
        if !new.data.contains_key(k) {
            out.push(k.clone());
        }
    }
    if old.deleted_at != new.deleted_at {
        out.push("deleted_at".to_string());
    }
    out.sort();
    out.dedup();
    out
}
