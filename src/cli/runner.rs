use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use crate::config::{CacheSettings, EngineConfig};
use crate::errors::RepoResult;
use crate::query::{FilterCompiler, Pagination, PlanKind, QueryPlan, SortSpec, SqlRenderer, parse_filter_json};
use crate::schema::{EntitySchema, SchemaRegistry};

use super::command::Command;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OutputMode {
    Human,
    Plain,
    Json,
}

fn registry(schema: Option<&Path>) -> RepoResult<Arc<SchemaRegistry>> {
    let registry = Arc::new(SchemaRegistry::new());
    if let Some(path) = schema {
        let text = std::fs::read_to_string(path)?;
        registry.register(EntitySchema::from_toml_str(&text)?);
    }
    Ok(registry)
}

fn list_plan(entity: &str, filter_json: &str, schema: Option<&Path>, include_deleted: bool) -> RepoResult<QueryPlan> {
    let compiler = FilterCompiler::new(registry(schema)?);
    let filter = compiler.compile(entity, &parse_filter_json(filter_json)?)?;
    Ok(QueryPlan::new(entity, PlanKind::List, filter).scoped(include_deleted))
}

/// Runs `cmd` with human-readable output on stdout.
///
/// # Errors
/// Whatever the command fails with.
pub fn run(cmd: Command) -> RepoResult<()> {
    run_with_format(cmd, OutputMode::Human, &mut std::io::stdout())
}

/// # Errors
/// Filter, schema and config errors, or I/O failures writing `out`.
pub fn run_with_format(cmd: Command, mode: OutputMode, out: &mut dyn Write) -> RepoResult<()> {
    match cmd {
        Command::Compile { entity, filter_json, schema, include_deleted } => {
            let plan = list_plan(&entity, &filter_json, schema.as_deref(), include_deleted)?;
            let q = SqlRenderer::render(&plan);
            match mode {
                OutputMode::Json => writeln!(out, "{}", serde_json::to_string(&q)?)?,
                OutputMode::Plain => {
                    writeln!(out, "{}", q.sql)?;
                    for p in &q.params {
                        writeln!(out, "{}", serde_json::to_string(p)?)?;
                    }
                }
                OutputMode::Human => {
                    writeln!(out, "sql: {}", q.sql)?;
                    for (i, p) in q.params.iter().enumerate() {
                        writeln!(out, "  ${} = {}", i + 1, serde_json::to_string(p)?)?;
                    }
                }
            }
        }
        Command::Fingerprint { entity, filter_json, schema, order_by, limit, offset, prefix } => {
            let defaults = EngineConfig::default();
            let order: Vec<SortSpec> = order_by.iter().map(|s| SortSpec::parse(s)).collect();
            let plan = list_plan(&entity, &filter_json, schema.as_deref(), false)?
                .order_by(order)
                .paginate(Pagination::Offset {
                    limit: limit.unwrap_or(defaults.default_limit).min(defaults.max_limit),
                    offset: offset.unwrap_or(0),
                });
            let prefix = prefix.unwrap_or_else(|| CacheSettings::default().key_prefix);
            let fp = plan.fingerprint(&prefix);
            match mode {
                OutputMode::Json => {
                    let json = serde_json::json!({"fingerprint": fp.as_str(), "entity_type": entity, "kind": "list"});
                    writeln!(out, "{json}")?;
                }
                OutputMode::Plain => writeln!(out, "{fp}")?,
                OutputMode::Human => writeln!(out, "fingerprint={fp}")?,
            }
        }
        Command::CheckConfig { path } => {
            let cfg = EngineConfig::from_file(&path)?.validate()?;
            match mode {
                OutputMode::Json => writeln!(out, "{}", serde_json::to_string_pretty(&cfg)?)?,
                OutputMode::Plain => writeln!(out, "ok")?,
                OutputMode::Human => writeln!(
                    out,
                    "config ok: prefix={} local_ttl={}s remote_ttl={}s warm={} batch={}",
                    cfg.cache.key_prefix,
                    cfg.cache.local_ttl_secs,
                    cfg.cache.remote_ttl_secs,
                    cfg.warm.enabled,
                    cfg.bulk.default_batch_size
                )?,
            }
        }
    }
    Ok(())
}
