//! Shared fixtures for the integration tests

#![allow(dead_code)]

use callcache::{CacheEngine, MetadataStore, Registry, Settings};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tracing::Subscriber;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt};

/// A captured event with its metadata
#[derive(Debug, Clone)]
pub struct CapturedEvent {
    /// Module that emitted the event
    pub target: String,
    /// The tracing level
    pub level: tracing::Level,
    /// The `message` field
    pub message: String,
    /// Other fields as (key, value) pairs
    pub fields: Vec<(String, String)>,
}

/// A tracing layer that collects events for test assertions
pub struct EventCollector {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl EventCollector {
    /// Create a collector and return both the layer and a handle to the events
    pub fn new() -> (Self, Arc<Mutex<Vec<CapturedEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                events: Arc::clone(&events),
            },
            events,
        )
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields
                .push((field.name().to_string(), format!("{value:?}")));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields
                .push((field.name().to_string(), value.to_string()));
        }
    }
}

impl<S: Subscriber> Layer<S> for EventCollector {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        let captured = CapturedEvent {
            target: event.metadata().target().to_string(),
            level: *event.metadata().level(),
            message: visitor.message,
            fields: visitor.fields,
        };
        if let Ok(mut events) = self.events.lock() {
            events.push(captured);
        }
    }
}

/// Run `f` with an event collector installed on this thread
pub fn capture_events<T>(f: impl FnOnce() -> T) -> (T, Vec<CapturedEvent>) {
    let (layer, events) = EventCollector::new();
    let subscriber = tracing_subscriber::registry().with(layer);
    let out = tracing::subscriber::with_default(subscriber, f);
    let events = events.lock().map(|e| e.clone()).unwrap_or_default();
    (out, events)
}

/// Warnings among captured events
pub fn warnings(events: &[CapturedEvent]) -> Vec<&CapturedEvent> {
    events
        .iter()
        .filter(|e| e.level == tracing::Level::WARN)
        .collect()
}

/// Engine over `store` with its blob root under `tmp`
pub fn engine_with(tmp: &TempDir, store: Arc<dyn MetadataStore>) -> CacheEngine {
    CacheEngine::new(
        Settings::with_cache_dir(tmp.path().join("files")),
        store,
        Arc::new(Registry::with_defaults()),
    )
    .unwrap()
}

/// Write `content` to a fresh file under `dir`
pub fn write_file(dir: &Path, name: &str, content: &[u8]) -> std::path::PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}
