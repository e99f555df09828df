#![allow(dead_code)]

use std::sync::Arc;

use repolite::cache::InMemoryRemoteCache;
use repolite::events::CapturingSink;
use repolite::store::InMemoryStore;
use repolite::{Engine, EngineConfig, EntitySchema, FieldType, Repository};
use serde_json::{Map, Value};

pub fn obj(v: Value) -> Map<String, Value> {
    v.as_object().cloned().expect("object literal")
}

pub fn users_schema() -> EntitySchema {
    EntitySchema::new("users")
        .field("email", FieldType::Text)
        .field("name", FieldType::Text)
        .field("age", FieldType::Integer)
        .field("status", FieldType::Text)
        .field("role", FieldType::Text)
        .field("bio", FieldType::Text)
        .field("score", FieldType::Float)
        .field("profile", FieldType::Json)
        .search_fields(&["name", "bio"])
}

pub struct Fixture {
    pub engine: Engine,
    pub store: Arc<InMemoryStore>,
    pub sink: Arc<CapturingSink>,
    pub remote: Option<Arc<InMemoryRemoteCache>>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with(EngineConfig::default(), false)
    }

    pub fn with(config: EngineConfig, with_remote: bool) -> Self {
        let store = Arc::new(InMemoryStore::new().with_unique("users", &["email"]));
        let sink = Arc::new(CapturingSink::new());
        let remote = with_remote.then(|| Arc::new(InMemoryRemoteCache::new()));
        let remote_dyn = remote.clone().map(|r| r as Arc<dyn repolite::cache::RemoteCache>);
        let engine = Engine::new(config, store.clone(), remote_dyn)
            .expect("valid config")
            .with_event_sink(sink.clone());
        engine.register_schema(users_schema());
        Self { engine, store, sink, remote }
    }

    pub fn users(&self) -> Repository {
        self.engine.repository("users").expect("repository")
    }
}
