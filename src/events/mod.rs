//! Mutation events and repository hooks.
//!
//! Events are handed to an injected [`EventSink`] after the store write has
//! succeeded. Sink failures are logged and never undo the write. Hooks run
//! around each mutation; a failing `before_*` hook aborts the operation
//! before anything is written, a failing `after_*` hook is only logged.

mod sinks;

pub use sinks::{CapturingSink, ChannelSink, LogSink};

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::RepoResult;
use crate::types::{Entity, EntityId, Patch, changed_fields};

/// Version of the event payload layout.
pub const EVENT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityEvent {
    pub kind: EventKind,
    pub entity_type: String,
    pub entity_id: EntityId,
    pub old: Option<Entity>,
    pub new: Option<Entity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_fields: Vec<String>,
    pub source: String,
    pub version: u32,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait EventSink: Send + Sync {
    /// Delivers one event. Retrying is the sink's business.
    async fn publish(&self, event: EntityEvent) -> RepoResult<()>;
}

/// Extension points around repository mutations. Every method defaults to a no-op.
#[async_trait]
pub trait RepositoryHook: Send + Sync {
    async fn before_create(&self, _entity_type: &str, _data: &mut Map<String, Value>) -> RepoResult<()> {
        Ok(())
    }

    async fn after_create(&self, _entity_type: &str, _entity: &Entity) -> RepoResult<()> {
        Ok(())
    }

    async fn before_update(&self, _entity_type: &str, _current: &Entity, _patch: &mut Patch) -> RepoResult<()> {
        Ok(())
    }

    async fn after_update(&self, _entity_type: &str, _old: &Entity, _new: &Entity) -> RepoResult<()> {
        Ok(())
    }

    async fn before_delete(&self, _entity_type: &str, _entity: &Entity, _soft: bool) -> RepoResult<()> {
        Ok(())
    }

    async fn after_delete(&self, _entity_type: &str, _entity: &Entity, _soft: bool) -> RepoResult<()> {
        Ok(())
    }
}

/// Runs hooks and forwards events to the configured sink.
#[derive(Clone, Default)]
pub struct EventBridge {
    sink: Option<Arc<dyn EventSink>>,
    hooks: Vec<Arc<dyn RepositoryHook>>,
    source: String,
}

impl EventBridge {
    #[must_use]
    pub fn new(source: &str) -> Self {
        Self { sink: None, hooks: Vec::new(), source: source.to_string() }
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn RepositoryHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    #[must_use]
    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    #[must_use]
    pub fn has_hooks(&self) -> bool {
        !self.hooks.is_empty()
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    fn event(
        &self,
        kind: EventKind,
        entity_type: &str,
        entity_id: EntityId,
        old: Option<&Entity>,
        new: Option<&Entity>,
    ) -> EntityEvent {
        let changed = match (old, new) {
            (Some(o), Some(n)) => changed_fields(o, n),
            _ => Vec::new(),
        };
        EntityEvent {
            kind,
            entity_type: entity_type.to_string(),
            entity_id,
            old: old.cloned(),
            new: new.cloned(),
            changed_fields: changed,
            source: self.source.clone(),
            version: EVENT_VERSION,
            timestamp: Utc::now(),
        }
    }

    pub async fn emit_created(&self, entity_type: &str, entity: &Entity) {
        self.emit(self.event(EventKind::Create, entity_type, entity.id, None, Some(entity))).await;
    }

    pub async fn emit_updated(&self, entity_type: &str, old: &Entity, new: &Entity) {
        self.emit(self.event(EventKind::Update, entity_type, new.id, Some(old), Some(new))).await;
    }

    /// Soft deletes carry the stamped row as `new`; hard deletes carry only `old`.
    pub async fn emit_deleted(&self, entity_type: &str, old: &Entity, new: Option<&Entity>) {
        self.emit(self.event(EventKind::Delete, entity_type, old.id, Some(old), new)).await;
    }

    async fn emit(&self, event: EntityEvent) {
        let Some(sink) = &self.sink else { return };
        let (kind, id) = (event.kind, event.entity_id);
        if let Err(e) = sink.publish(event).await {
            log::warn!("event sink rejected {kind:?} for {id}: {e}");
        }
    }

    /// # Errors
    /// The first failing hook's error; later hooks do not run.
    pub async fn before_create(&self, entity_type: &str, data: &mut Map<String, Value>) -> RepoResult<()> {
        for hook in &self.hooks {
            hook.before_create(entity_type, data).await?;
        }
        Ok(())
    }

    /// # Errors
    /// The first failing hook's error; later hooks do not run.
    pub async fn before_update(&self, entity_type: &str, current: &Entity, patch: &mut Patch) -> RepoResult<()> {
        for hook in &self.hooks {
            hook.before_update(entity_type, current, patch).await?;
        }
        Ok(())
    }

    /// # Errors
    /// The first failing hook's error; later hooks do not run.
    pub async fn before_delete(&self, entity_type: &str, entity: &Entity, soft: bool) -> RepoResult<()> {
        for hook in &self.hooks {
            hook.before_delete(entity_type, entity, soft).await?;
        }
        Ok(())
    }

    pub async fn after_create(&self, entity_type: &str, entity: &Entity) {
        for hook in &self.hooks {
            if let Err(e) = hook.after_create(entity_type, entity).await {
                log::warn!("after_create hook failed for {entity_type}/{}: {e}", entity.id);
            }
        }
    }

    pub async fn after_update(&self, entity_type: &str, old: &Entity, new: &Entity) {
        for hook in &self.hooks {
            if let Err(e) = hook.after_update(entity_type, old, new).await {
                log::warn!("after_update hook failed for {entity_type}/{}: {e}", new.id);
            }
        }
    }

    pub async fn after_delete(&self, entity_type: &str, entity: &Entity, soft: bool) {
        for hook in &self.hooks {
            if let Err(e) = hook.after_delete(entity_type, entity, soft).await {
                log::warn!("after_delete hook failed for {entity_type}/{}: {e}", entity.id);
            }
        }
    }
}
