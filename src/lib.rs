//! Data-access engine for entity repositories: a filter language compiled to
//! predicate trees, CRUD with soft delete, full-text search, aggregation,
//! keyset pagination, batched writes, and a two-tier result cache keyed by
//! query-plan fingerprints with usage-driven warming.

pub mod bench;
pub mod cache;
pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
pub mod logger;
pub mod query;
pub mod repository;
pub mod schema;
pub mod store;
pub mod telemetry;
pub mod types;

pub use config::EngineConfig;
pub use engine::Engine;
pub use errors::{RepoError, RepoResult};
pub use query::{ComplexFilter, FilterExpression, FilterInput, SortSpec, parse_filter_json, parse_filter_value};
pub use repository::{
    AggregateRequest, BulkOperationResult, BulkOptions, Bulkable, CancelFlag, Creatable, CursorRequest, Eventable,
    FulltextRequest, ListOptions, Repository, SearchHit, Searchable,
};
pub use schema::{EntitySchema, FieldType};
pub use types::{Entity, EntityId, Patch};

/// Configures logging from the `REPOLITE_LOG_*` environment variables.
///
/// # Errors
/// Returns an error when the log directory cannot be created.
pub fn init() -> RepoResult<()> {
    logger::configure_from_env()
}
