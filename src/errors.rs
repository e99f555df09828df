use thiserror::Error;

/// Errors surfaced by the repository layer.
///
/// Cache tier failures are logged and swallowed by the cache manager; the
/// `CacheUnavailable` variant only travels between the remote tier and the
/// manager.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("{entity_type} not found: {id}")]
    NotFound { entity_type: String, id: String },
    #[error("no {entity_type} matched filter {filter}")]
    NotFoundBy { entity_type: String, filter: String },
    #[error("expected exactly one {entity_type}, found {count}")]
    MultipleResults { entity_type: String, count: u64 },
    #[error("conflict on {entity_type}.{field}: {value} already exists")]
    Conflict { entity_type: String, field: String, value: String },
    #[error("unsupported operator: {0}")]
    UnsupportedOperator(String),
    #[error("type mismatch on {field}: expected {expected}, found {found}")]
    TypeMismatch { field: String, expected: String, found: String },
    #[error("unknown field {field} on {entity_type}")]
    UnknownField { entity_type: String, field: String },
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("hook rejected operation: {0}")]
    Hook(String),
    #[error("event sink error: {0}")]
    Sink(String),
    #[error("Serde JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

impl From<std::io::Error> for RepoError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl RepoError {
    pub(crate) fn not_found(entity_type: &str, id: impl ToString) -> Self {
        Self::NotFound { entity_type: entity_type.to_string(), id: id.to_string() }
    }

    pub(crate) fn mismatch(field: &str, expected: &str, found: &serde_json::Value) -> Self {
        Self::TypeMismatch {
            field: field.to_string(),
            expected: expected.to_string(),
            found: crate::types::json_type_name(found).to_string(),
        }
    }

    /// Rejected input, as opposed to a failure while talking to a backend.
    #[must_use]
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedOperator(_)
                | Self::TypeMismatch { .. }
                | Self::UnknownField { .. }
                | Self::Validation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let e = RepoError::MultipleResults { entity_type: "users".into(), count: 3 };
        assert_eq!(e.to_string(), "expected exactly one users, found 3");
        let e = RepoError::not_found("users", "abc");
        assert!(e.to_string().contains("abc"));
        assert!(!e.is_input_error());
        assert!(RepoError::UnsupportedOperator("foo".into()).is_input_error());
    }
}
