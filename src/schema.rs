//! Per-entity-type metadata: declared field types, relations used for
//! implicit joins, and the default full-text search fields.

use crate::errors::{RepoError, RepoResult};
use crate::types::{json_type_name, parse_timestamp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Json,
    Array,
}

impl FieldType {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Timestamp => "timestamp",
            Self::Json => "json",
            Self::Array => "array",
        }
    }

    /// Whether a JSON value may be stored in (or compared against) a column of this type.
    /// `null` is accepted everywhere.
    #[must_use]
    pub fn accepts(self, v: &Value) -> bool {
        match (self, v) {
            (_, Value::Null) | (Self::Json, _) => true,
            (Self::Text, Value::String(_)) => true,
            (Self::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (Self::Float, Value::Number(_)) => true,
            (Self::Boolean, Value::Bool(_)) => true,
            (Self::Timestamp, Value::String(s)) => parse_timestamp(s).is_some(),
            (Self::Array, Value::Array(_)) => true,
            _ => false,
        }
    }

    #[must_use]
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::Float)
    }

    /// Types with a total order usable for sorting and keyset pagination.
    #[must_use]
    pub fn is_orderable(self) -> bool {
        matches!(self, Self::Text | Self::Integer | Self::Float | Self::Timestamp)
    }

    /// # Errors
    /// Returns `TypeMismatch` when the value does not fit the column.
    pub fn check(self, field: &str, v: &Value) -> RepoResult<()> {
        if self.accepts(v) {
            Ok(())
        } else {
            Err(RepoError::TypeMismatch {
                field: field.to_string(),
                expected: self.name().to_string(),
                found: json_type_name(v).to_string(),
            })
        }
    }
}

/// A to-one relation: `local_key` on this entity holds the id of a row of `entity_type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub entity_type: String,
    pub local_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntitySchema {
    pub entity_type: String,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldType>,
    #[serde(default)]
    pub relations: BTreeMap<String, Relation>,
    #[serde(default)]
    pub search_fields: Vec<String>,
    /// Reject fields that are neither declared nor built in.
    #[serde(default)]
    pub strict: bool,
}

impl EntitySchema {
    #[must_use]
    pub fn new(entity_type: &str) -> Self {
        Self { entity_type: entity_type.to_string(), ..Self::default() }
    }

    #[must_use]
    pub fn field(mut self, name: &str, ty: FieldType) -> Self {
        self.fields.insert(name.to_string(), ty);
        self
    }

    #[must_use]
    pub fn relation(mut self, name: &str, entity_type: &str, local_key: &str) -> Self {
        self.relations.insert(
            name.to_string(),
            Relation { entity_type: entity_type.to_string(), local_key: local_key.to_string() },
        );
        self
    }

    #[must_use]
    pub fn search_fields(mut self, fields: &[&str]) -> Self {
        self.search_fields = fields.iter().map(|s| (*s).to_string()).collect();
        self
    }

    #[must_use]
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// # Errors
    /// Returns `Config` when the TOML is malformed.
    pub fn from_toml_str(s: &str) -> RepoResult<Self> {
        toml::from_str(s).map_err(|e| RepoError::Config(e.to_string()))
    }

    /// Declared or built-in type of a top-level column.
    #[must_use]
    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        match name {
            "id" => Some(FieldType::Text),
            "created_at" | "updated_at" | "deleted_at" => Some(FieldType::Timestamp),
            _ => self.fields.get(name).copied(),
        }
    }

    /// Resolves a column name, rejecting unknown names in strict mode.
    ///
    /// # Errors
    /// Returns `UnknownField` for undeclared columns of a strict schema.
    pub fn resolve_field(&self, name: &str) -> RepoResult<Option<FieldType>> {
        match self.field_type(name) {
            Some(ty) => Ok(Some(ty)),
            None if self.strict => Err(RepoError::UnknownField {
                entity_type: self.entity_type.clone(),
                field: name.to_string(),
            }),
            None => Ok(None),
        }
    }

    /// Type-checks a data map before it is written.
    ///
    /// # Errors
    /// `Validation` for writes to generated columns, `UnknownField` and `TypeMismatch` otherwise.
    pub fn validate_data(&self, data: &serde_json::Map<String, Value>) -> RepoResult<()> {
        for (k, v) in data {
            let top = k.split('.').next().unwrap_or(k);
            if crate::types::BUILTIN_FIELDS.contains(&top) {
                return Err(RepoError::Validation(format!("{top} is generated and cannot be written")));
            }
            if top != k {
                // nested write into a JSON column
                if let Some(ty) = self.resolve_field(top)? {
                    if ty != FieldType::Json {
                        return Err(RepoError::TypeMismatch {
                            field: top.to_string(),
                            expected: "json".into(),
                            found: ty.name().to_string(),
                        });
                    }
                }
                continue;
            }
            if let Some(ty) = self.resolve_field(k)? {
                ty.check(k, v)?;
            }
        }
        Ok(())
    }
}

/// Registry of schemas by entity type. Unregistered types get a permissive empty schema.
#[derive(Default)]
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<String, Arc<EntitySchema>>>,
}

impl SchemaRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, schema: EntitySchema) {
        log::debug!("registering schema for {}", schema.entity_type);
        self.schemas.write().insert(schema.entity_type.clone(), Arc::new(schema));
    }

    #[must_use]
    pub fn get(&self, entity_type: &str) -> Arc<EntitySchema> {
        if let Some(s) = self.schemas.read().get(entity_type) {
            return s.clone();
        }
        Arc::new(EntitySchema::new(entity_type))
    }

    #[must_use]
    pub fn contains(&self, entity_type: &str) -> bool {
        self.schemas.read().contains_key(entity_type)
    }

    #[must_use]
    pub fn entity_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.schemas.read().keys().cloned().collect();
        names.sort();
        names
    }
}
