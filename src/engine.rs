use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::cache::{CacheManager, CacheMetricsSnapshot, RemoteCache, TaskHandle, WarmReport};
use crate::config::EngineConfig;
use crate::errors::{RepoError, RepoResult};
use crate::events::{EventBridge, EventSink, RepositoryHook};
use crate::repository::{Repository, Shared};
use crate::schema::{EntitySchema, SchemaRegistry};
use crate::store::StoreAdapter;
use crate::telemetry::Telemetry;

/// Owns the store handle, both cache tiers, the schema registry and the event
/// bridge, and hands out [`Repository`] handles that share them.
///
/// Construct once at startup and call [`Engine::shutdown`] before exit.
pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn StoreAdapter>,
    cache: Arc<CacheManager>,
    registry: Arc<SchemaRegistry>,
    events: RwLock<EventBridge>,
    telemetry: Arc<Telemetry>,
    // warmer and purger, when started
    tasks: Mutex<Vec<TaskHandle>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("schemas", &self.registry.entity_types())
            .field("remote_cache", &self.cache.has_remote())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Validates `config` and wires the engine around `store`. Without a
    /// remote cache only the local tier is used. With `warm.enabled` the
    /// warmer starts right away when called inside a tokio runtime; outside
    /// one, call [`Engine::start_warmer`] later.
    ///
    /// # Errors
    /// `Config` when the configuration does not validate.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn StoreAdapter>,
        remote: Option<Arc<dyn RemoteCache>>,
    ) -> RepoResult<Self> {
        let config = config.validate()?;
        let cache = Arc::new(CacheManager::new(config.cache.clone(), config.warm.clone(), remote));
        let telemetry = Arc::new(Telemetry::new(config.telemetry.clone()));
        log::info!(
            "engine ready: prefix={} remote_cache={} warm_enabled={}",
            config.cache.key_prefix,
            cache.has_remote(),
            config.warm.enabled
        );
        let engine = Self {
            events: RwLock::new(EventBridge::new(&config.cache.key_prefix)),
            config,
            store,
            cache,
            registry: Arc::new(SchemaRegistry::new()),
            telemetry,
            tasks: Mutex::new(Vec::new()),
        };
        if engine.config.warm.enabled {
            if tokio::runtime::Handle::try_current().is_ok() {
                engine.start_warmer();
            } else {
                log::warn!("warm.enabled is set but no tokio runtime is running; call start_warmer() once one is");
            }
        }
        Ok(engine)
    }

    /// Sends mutation events to `sink`. Repositories created afterwards pick it up.
    #[must_use]
    pub fn with_event_sink(self, sink: Arc<dyn EventSink>) -> Self {
        {
            let mut events = self.events.write();
            *events = std::mem::take(&mut *events).with_sink(sink);
        }
        self
    }

    #[must_use]
    pub fn with_hook(self, hook: Arc<dyn RepositoryHook>) -> Self {
        {
            let mut events = self.events.write();
            *events = std::mem::take(&mut *events).with_hook(hook);
        }
        self
    }

    pub fn register_schema(&self, schema: EntitySchema) {
        self.registry.register(schema);
    }

    /// Repository bound to `entity_type`.
    ///
    /// # Errors
    /// `Validation` for names that would break fingerprint patterns.
    pub fn repository(&self, entity_type: &str) -> RepoResult<Repository> {
        if entity_type.is_empty() || entity_type.contains([':', '*', '?']) {
            return Err(RepoError::Validation(format!("invalid entity type {entity_type:?}")));
        }
        let shared = Shared {
            store: Arc::clone(&self.store),
            cache: Arc::clone(&self.cache),
            registry: Arc::clone(&self.registry),
            events: self.events.read().clone(),
            telemetry: Arc::clone(&self.telemetry),
            default_limit: self.config.default_limit,
            max_limit: self.config.max_limit,
            batch_size: self.config.bulk.default_batch_size,
        };
        Ok(Repository::new(entity_type, shared))
    }

    /// Starts the warming scheduler and the local purge task. Must be called
    /// inside a tokio runtime; a second call is a no-op.
    pub fn start_warmer(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        tasks.push(self.cache.spawn_warmer(Arc::clone(&self.store)));
        tasks.push(self.cache.spawn_purger());
        log::info!(
            "cache warmer started: every {}s, top {} plans with >= {} uses",
            self.config.warm.warm_interval_seconds,
            self.config.warm.popular_queries_limit,
            self.config.warm.min_usage_count
        );
    }

    /// One warming pass, outside the scheduler.
    pub async fn warm_cache(&self) -> WarmReport {
        self.cache.warm_cache(self.store.as_ref()).await
    }

    /// Stops background tasks and flushes the local tier. The remote tier is
    /// left to expire on its own.
    pub async fn shutdown(&self) {
        let tasks: Vec<TaskHandle> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.shutdown().await;
        }
        let flushed = self.cache.flush_local();
        log::info!("engine shut down, {flushed} local cache entries flushed");
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    #[must_use]
    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn StoreAdapter> {
        &self.store
    }

    #[must_use]
    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn cache_metrics(&self) -> CacheMetricsSnapshot {
        self.cache.metrics()
    }

    /// Prometheus text for query, write and cache counters.
    pub fn metrics_text(&self) -> String {
        self.telemetry.metrics_text(&self.cache.metrics())
    }
}
