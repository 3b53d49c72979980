//! Records `courier::*` log events so tests can assert on what the engine logged.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::{dispatcher, Dispatch, Level, Metadata, Subscriber};
use tracing_subscriber::filter::{filter_fn, LevelFilter};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::prelude::*;

const ENGINE_TARGET_PREFIX: &str = "courier";

#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: Level,
    pub target: String,
    pub message: String,
    /// Structured fields other than `message`, rendered as text.
    pub fields: BTreeMap<String, String>,
}

impl CapturedEvent {
    pub fn field(&self, key: &str) -> Option<String> {
        self.fields.get(key).map(|v| v.trim_matches('"').to_string())
    }
}

/// Shared handle to everything the engine logged while the guard is held.
#[derive(Clone, Default)]
pub struct CapturedLogs {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl CapturedLogs {
    pub fn all(&self) -> Vec<CapturedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn matching(&self, target: &str, message: &str) -> Vec<CapturedEvent> {
        let events = self.events.lock().unwrap();
        events
            .iter()
            .filter(|e| e.target == target && e.message == message)
            .cloned()
            .collect()
    }

    pub fn contains(&self, target: &str, message: &str) -> bool {
        !self.matching(target, message).is_empty()
    }

    fn push(&self, event: CapturedEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[derive(Default)]
struct Recorded {
    message: Option<String>,
    fields: BTreeMap<String, String>,
}

impl Recorded {
    fn put(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = Some(value);
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for Recorded {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field, format!("{value:?}"));
    }
}

struct Recorder {
    logs: CapturedLogs,
}

impl<S: Subscriber> Layer<S> for Recorder {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut recorded = Recorded::default();
        event.record(&mut recorded);
        let meta = event.metadata();
        self.logs.push(CapturedEvent {
            level: *meta.level(),
            target: meta.target().to_string(),
            message: recorded.message.unwrap_or_default(),
            fields: recorded.fields,
        });
    }
}

fn is_engine_event(meta: &Metadata<'_>) -> bool {
    meta.target().starts_with(ENGINE_TARGET_PREFIX)
}

/// Install a thread-local subscriber recording engine events at every level.
///
/// Only the test's own thread is observed, so drive the engine with
/// `consume_once` instead of the spawned loops while the guard is held.
pub fn install_tracing_capture() -> (CapturedLogs, dispatcher::DefaultGuard) {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::registry()
        .with(Recorder { logs: logs.clone() }.with_filter(filter_fn(is_engine_event)))
        .with(LevelFilter::TRACE);
    let guard = dispatcher::set_default(&Dispatch::new(subscriber));
    (logs, guard)
}
