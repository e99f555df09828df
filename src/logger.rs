use std::path::{Path, PathBuf};

use log::LevelFilter;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::append::rolling_file::policy::compound::{
    CompoundPolicy, roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger,
};
use log4rs::config::{Appender, Config, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;

use crate::errors::{RepoError, RepoResult};

pub const AUDIT_TARGET: &str = "repolite::audit";
pub const METRICS_TARGET: &str = "repolite::metrics";
pub const BENCH_TARGET: &str = "repolite::bench";

const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {t} - {m}{n}";
const ROLL_BYTES: u64 = 10 * 1024 * 1024;

/// Loads a log4rs YAML file. An already-installed logger is left in place.
///
/// # Errors
/// Returns `Config` when the file cannot be read or parsed.
pub fn init_file(path: &Path) -> RepoResult<()> {
    match log4rs::init_file(path, log4rs::config::Deserializers::default()) {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("already") => Ok(()),
        Err(e) => Err(RepoError::Config(format!("log config {}: {e}", path.display()))),
    }
}

fn parse_level(level: Option<&str>) -> LevelFilter {
    match level.unwrap_or("info").to_ascii_lowercase().as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

fn rolling(base: &Path, name: &str, keep: u32) -> RepoResult<RollingFileAppender> {
    let roller = FixedWindowRoller::builder()
        .build(&format!("{}", base.join(format!("{name}.{{}}.log")).display()), keep)
        .map_err(|e| RepoError::Config(format!("{name} roller: {e}")))?;
    let policy = CompoundPolicy::new(Box::new(SizeTrigger::new(ROLL_BYTES)), Box::new(roller));
    Ok(RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build(base.join(format!("{name}.log")), Box::new(policy))?)
}

/// Routes application logs to `app.log`, audit lines to `audit.log` and
/// metrics lines to `metrics.log` under `dir` (current directory when `None`).
/// With `enable_bench`, bulk and cache timing events go to `bench.log` as well.
///
/// Only the first successful call in a process installs the logger.
///
/// # Errors
/// Returns `Config`/`Io` when the directory or an appender cannot be created.
pub fn configure_logging(
    dir: Option<&Path>,
    level: Option<&str>,
    retention: Option<usize>,
    enable_bench: bool,
) -> RepoResult<()> {
    let base = match dir {
        Some(d) => d.to_path_buf(),
        None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };
    std::fs::create_dir_all(&base)?;
    let keep = u32::try_from(retention.unwrap_or(7)).unwrap_or(u32::MAX);
    let lvl = parse_level(level);

    let mut builder = Config::builder()
        .appender(Appender::builder().build("app", Box::new(rolling(&base, "app", keep)?)))
        .appender(Appender::builder().build("audit", Box::new(rolling(&base, "audit", keep)?)))
        .appender(Appender::builder().build("metrics", Box::new(rolling(&base, "metrics", keep)?)))
        .logger(Logger::builder().appender("audit").additive(false).build(AUDIT_TARGET, lvl))
        .logger(Logger::builder().appender("metrics").additive(false).build(METRICS_TARGET, lvl));

    builder = if enable_bench {
        builder
            .appender(Appender::builder().build("bench", Box::new(rolling(&base, "bench", keep)?)))
            .logger(Logger::builder().appender("bench").additive(false).build(BENCH_TARGET, LevelFilter::Trace))
    } else {
        builder.logger(Logger::builder().additive(false).build(BENCH_TARGET, LevelFilter::Off))
    };

    let config = builder
        .build(Root::builder().appender("app").build(lvl))
        .map_err(|e| RepoError::Config(format!("log config: {e}")))?;
    let _ = log4rs::init_config(config);
    Ok(())
}

/// Same as [`configure_logging`] with values taken from the environment:
/// `REPOLITE_LOG_DIR`, `REPOLITE_LOG_LEVEL`, `REPOLITE_LOG_RETENTION`, `REPOLITE_BENCH`.
///
/// # Errors
/// See [`configure_logging`].
pub fn configure_from_env() -> RepoResult<()> {
    let dir = std::env::var("REPOLITE_LOG_DIR").ok().map(PathBuf::from);
    let level = std::env::var("REPOLITE_LOG_LEVEL").ok();
    let retention = std::env::var("REPOLITE_LOG_RETENTION").ok().and_then(|s| s.parse::<usize>().ok());
    let bench = std::env::var("REPOLITE_BENCH")
        .map(|s| matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);
    configure_logging(dir.as_deref(), level.as_deref(), retention, bench)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names() {
        assert_eq!(parse_level(Some("WARN")), LevelFilter::Warn);
        assert_eq!(parse_level(Some("bogus")), LevelFilter::Info);
        assert_eq!(parse_level(None), LevelFilter::Info);
    }

    #[test]
    fn creates_log_files_in_directory() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        configure_logging(Some(&logs), Some("debug"), Some(2), true).unwrap();
        for name in ["app.log", "audit.log", "metrics.log", "bench.log"] {
            assert!(logs.join(name).exists(), "{name} missing");
        }
    }

    #[test]
    fn missing_yaml_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = init_file(&dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(err, RepoError::Config(_)));
    }
}
