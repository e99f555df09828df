use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{EntityEvent, EventSink};
use crate::errors::{RepoError, RepoResult};
use crate::logger::AUDIT_TARGET;

/// Keeps every published event in memory. Can be told to fail.
#[derive(Default)]
pub struct CapturingSink {
    events: Mutex<Vec<EntityEvent>>,
    failing: AtomicBool,
}

impl CapturingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn events(&self) -> Vec<EntityEvent> {
        self.events.lock().clone()
    }

    pub fn take(&self) -> Vec<EntityEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventSink for CapturingSink {
    async fn publish(&self, event: EntityEvent) -> RepoResult<()> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(RepoError::Sink("capturing sink set to fail".into()));
        }
        self.events.lock().push(event);
        Ok(())
    }
}

/// Forwards events into an unbounded tokio channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<EntityEvent>,
}

impl ChannelSink {
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EntityEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn publish(&self, event: EntityEvent) -> RepoResult<()> {
        self.tx.send(event).map_err(|_| RepoError::Sink("event receiver dropped".into()))
    }
}

/// Writes each event as one JSON line on the audit target.
#[derive(Default)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn publish(&self, event: EntityEvent) -> RepoResult<()> {
        let line = serde_json::to_string(&event)?;
        log::info!(target: AUDIT_TARGET, "event {line}");
        Ok(())
    }
}
