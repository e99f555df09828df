use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{RepoError, RepoResult};

/// Engine-wide settings. Supplied once to [`crate::Engine::new`] and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub warm: WarmSettings,
    #[serde(default)]
    pub bulk: BulkSettings,
    #[serde(default)]
    pub telemetry: TelemetrySettings,
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "max_limit")]
    pub max_limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSettings {
    #[serde(default = "local_capacity")]
    pub local_capacity: usize,
    #[serde(default = "local_ttl_secs")]
    pub local_ttl_secs: u64,
    #[serde(default = "remote_ttl_secs")]
    pub remote_ttl_secs: u64,
    #[serde(default = "purge_interval_secs")]
    pub purge_interval_secs: u64,
    #[serde(default = "io_timeout_ms")]
    pub io_timeout_ms: u64,
    #[serde(default = "key_prefix")]
    pub key_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WarmSettings {
    #[serde(default = "popular_queries_limit")]
    pub popular_queries_limit: usize,
    #[serde(default = "min_usage_count")]
    pub min_usage_count: u64,
    #[serde(default = "warm_interval_seconds")]
    pub warm_interval_seconds: u64,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BulkSettings {
    #[serde(default = "default_batch_size")]
    pub default_batch_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetrySettings {
    #[serde(default = "slow_query_ms")]
    pub slow_query_ms: u64,
    #[serde(default = "audit_enabled")]
    pub audit_enabled: bool,
}

fn default_limit() -> usize {
    100
}
fn max_limit() -> usize {
    10_000
}
fn local_capacity() -> usize {
    1024
}
fn local_ttl_secs() -> u64 {
    60
}
fn remote_ttl_secs() -> u64 {
    300
}
fn purge_interval_secs() -> u64 {
    5
}
fn io_timeout_ms() -> u64 {
    250
}
fn key_prefix() -> String {
    "repolite".into()
}
fn popular_queries_limit() -> usize {
    10
}
fn min_usage_count() -> u64 {
    5
}
fn warm_interval_seconds() -> u64 {
    300
}
fn default_batch_size() -> usize {
    500
}
fn slow_query_ms() -> u64 {
    500
}
fn audit_enabled() -> bool {
    true
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            local_capacity: local_capacity(),
            local_ttl_secs: local_ttl_secs(),
            remote_ttl_secs: remote_ttl_secs(),
            purge_interval_secs: purge_interval_secs(),
            io_timeout_ms: io_timeout_ms(),
            key_prefix: key_prefix(),
        }
    }
}

impl Default for WarmSettings {
    fn default() -> Self {
        Self {
            popular_queries_limit: popular_queries_limit(),
            min_usage_count: min_usage_count(),
            warm_interval_seconds: warm_interval_seconds(),
            enabled: false,
        }
    }
}

impl Default for BulkSettings {
    fn default() -> Self {
        Self { default_batch_size: default_batch_size() }
    }
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self { slow_query_ms: slow_query_ms(), audit_enabled: audit_enabled() }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache: CacheSettings::default(),
            warm: WarmSettings::default(),
            bulk: BulkSettings::default(),
            telemetry: TelemetrySettings::default(),
            default_limit: default_limit(),
            max_limit: max_limit(),
        }
    }
}

impl CacheSettings {
    #[must_use]
    pub fn local_ttl(&self) -> Duration {
        Duration::from_secs(self.local_ttl_secs)
    }

    #[must_use]
    pub fn remote_ttl(&self) -> Duration {
        Duration::from_secs(self.remote_ttl_secs)
    }

    #[must_use]
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

impl EngineConfig {
    /// Parses and validates a TOML document; absent keys take their defaults.
    ///
    /// # Errors
    /// Returns `Config` on syntax errors, unknown keys or failed validation.
    pub fn from_toml_str(s: &str) -> RepoResult<Self> {
        let cfg: Self = toml::from_str(s).map_err(|e| RepoError::Config(e.to_string()))?;
        cfg.validate()
    }

    /// # Errors
    /// Returns `Io` when the file cannot be read, otherwise as [`Self::from_toml_str`].
    pub fn from_file(path: &Path) -> RepoResult<Self> {
        let s = std::fs::read_to_string(path)?;
        Self::from_toml_str(&s)
    }

    /// Checks invariants between settings. A local TTL longer than the remote
    /// TTL is clamped rather than rejected.
    ///
    /// # Errors
    /// Returns `Config` naming the offending setting.
    pub fn validate(mut self) -> RepoResult<Self> {
        if self.cache.local_ttl_secs > self.cache.remote_ttl_secs {
            log::warn!(
                "cache.local_ttl_secs ({}) exceeds cache.remote_ttl_secs ({}); clamping",
                self.cache.local_ttl_secs,
                self.cache.remote_ttl_secs
            );
            self.cache.local_ttl_secs = self.cache.remote_ttl_secs;
        }
        if self.cache.local_capacity == 0 {
            return Err(RepoError::Config("cache.local_capacity must be at least 1".into()));
        }
        if self.cache.key_prefix.is_empty() || self.cache.key_prefix.contains(':') {
            return Err(RepoError::Config("cache.key_prefix must be non-empty and contain no ':'".into()));
        }
        if self.bulk.default_batch_size == 0 {
            return Err(RepoError::Config("bulk.default_batch_size must be at least 1".into()));
        }
        if self.warm.popular_queries_limit == 0 {
            return Err(RepoError::Config("warm.popular_queries_limit must be at least 1".into()));
        }
        if self.warm.enabled && self.warm.warm_interval_seconds == 0 {
            return Err(RepoError::Config("warm.warm_interval_seconds must be at least 1".into()));
        }
        if self.default_limit == 0 || self.default_limit > self.max_limit {
            return Err(RepoError::Config(format!(
                "default_limit ({}) must be between 1 and max_limit ({})",
                self.default_limit, self.max_limit
            )));
        }
        Ok(self)
    }
}
