use std::path::PathBuf;

/// Developer commands. None of them touch a store; they show what the engine
/// would send to one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Render a filter as PostgreSQL text with bind parameters.
    Compile {
        entity: String,
        filter_json: String,
        schema: Option<PathBuf>,
        include_deleted: bool,
    },
    /// Print the cache fingerprint of a list read.
    Fingerprint {
        entity: String,
        filter_json: String,
        schema: Option<PathBuf>,
        order_by: Vec<String>,
        limit: Option<usize>,
        offset: Option<usize>,
        prefix: Option<String>,
    },
    /// Parse and validate an engine configuration file.
    CheckConfig {
        path: PathBuf,
    },
}
