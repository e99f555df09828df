use crate::errors::{RepoError, RepoResult};
use crate::schema::FieldType;
use crate::types::Entity;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::predicate::{Predicate, ResolvedPath};
use super::types::{Comparison, Direction, Operator, Order};

/// Opaque keyset position: the cursor field, the order it was issued under,
/// the boundary row's field value and id. Hex-encoded JSON on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorToken {
    #[serde(rename = "f")]
    pub field: String,
    #[serde(rename = "o")]
    pub order: Order,
    #[serde(rename = "v")]
    pub value: Value,
    pub id: String,
    #[serde(rename = "d")]
    pub direction: Direction,
}

impl CursorToken {
    #[must_use]
    pub fn for_entity(field: &str, order: Order, entity: &Entity, direction: Direction) -> Self {
        Self {
            field: field.to_string(),
            order,
            value: entity.field(field).unwrap_or(Value::Null),
            id: entity.id.to_string(),
            direction,
        }
    }

    #[must_use]
    pub fn encode(&self) -> String {
        hex::encode(serde_json::to_vec(self).unwrap_or_default())
    }

    /// # Errors
    /// Returns `Validation` when the token is not one this crate produced.
    pub fn decode(token: &str) -> RepoResult<Self> {
        let bytes =
            hex::decode(token).map_err(|e| RepoError::Validation(format!("malformed cursor: {e}")))?;
        serde_json::from_slice(&bytes).map_err(|e| RepoError::Validation(format!("malformed cursor: {e}")))
    }

    /// Rows strictly beyond this token in its own order, with `id` as tie-break.
    #[must_use]
    pub fn keyset_predicate(&self, field_type: Option<FieldType>) -> Predicate {
        let forward = match (self.order, self.direction) {
            (Order::Asc, Direction::Next) | (Order::Desc, Direction::Prev) => Comparison::Gt,
            (Order::Asc, Direction::Prev) | (Order::Desc, Direction::Next) => Comparison::Lt,
        };
        let field = ResolvedPath::column(&self.field);
        let id = ResolvedPath::column("id");
        let id_value = Value::String(self.id.clone());
        Predicate::or(vec![
            Predicate::term(field.clone(), Operator::Cmp(forward), self.value.clone(), field_type),
            Predicate::and(vec![
                Predicate::term(field, Operator::Cmp(Comparison::Eq), self.value.clone(), field_type),
                Predicate::term(id, Operator::Cmp(forward), id_value, Some(FieldType::Text)),
            ]),
        ])
    }
}

/// One page of a keyset traversal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorPage {
    pub items: Vec<Entity>,
    pub has_next: bool,
    pub has_prev: bool,
    pub next_cursor: Option<String>,
    pub prev_cursor: Option<String>,
}

impl CursorPage {
    /// Builds a page from rows fetched in scan order with one look-ahead row.
    /// Backward scans are flipped so items are always in forward order.
    #[must_use]
    pub fn assemble(
        mut rows: Vec<Entity>,
        limit: usize,
        direction: Direction,
        had_token: bool,
        field: &str,
        order: Order,
    ) -> Self {
        let more = rows.len() > limit;
        rows.truncate(limit);
        let (has_next, has_prev) = match direction {
            Direction::Next => (more, had_token),
            Direction::Prev => {
                rows.reverse();
                (had_token, more)
            }
        };
        let next_cursor = rows
            .last()
            .filter(|_| has_next)
            .map(|e| CursorToken::for_entity(field, order, e, Direction::Next).encode());
        let prev_cursor = rows
            .first()
            .filter(|_| has_prev)
            .map(|e| CursorToken::for_entity(field, order, e, Direction::Prev).encode());
        Self { items: rows, has_next, has_prev, next_cursor, prev_cursor }
    }
}
