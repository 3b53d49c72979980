//! Shared fixture for engine integration tests: in-memory store and queue,
//! a recording channel and a recording event sink.

#![allow(dead_code)]

pub mod fault_injection;
pub mod tracing_capture;

pub use fault_injection::{HookedQueue, HookedStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use courier::channel::{ChannelError, ChannelTarget, ServerMessage, WorkerChannel, WorkerServerMessage};
use courier::client::{Client, TriggerOptions};
use courier::env_vars::InMemoryEnvironmentVariables;
use courier::errors::TaskRunError;
use courier::events::{EventSink, SinkError};
use courier::model::{
    BackgroundWorker, BackgroundWorkerTask, EnvironmentType, OrganizationRef, ProjectRef, RuntimeEnvironment,
    TaskRun, TaskRunAttempt, TaskRunExecutionPayload,
};
use courier::providers::in_memory::{InMemoryStore, InMemoryWorkQueue};
use courier::providers::{QueueScope, Store, WorkQueue};
use courier::retry::RetryOptions;
use courier::runtime::{ConsumeOutcome, Engine, EngineOptions, QueueConsumer};

pub const PROD_ENV: &str = "env_prod";
pub const DEV_ENV: &str = "env_dev";
pub const NAMESPACE: &str = "workers";

// ---------------------------------------------------------------------------
// Channel and sink doubles
// ---------------------------------------------------------------------------

/// Records every frame the engine sends.
#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<(ChannelTarget, ServerMessage)>>,
}

impl RecordingChannel {
    pub fn sent(&self) -> Vec<(ChannelTarget, ServerMessage)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.sent.lock().unwrap().iter().map(|(_, m)| m.kind()).collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.kinds().into_iter().filter(|k| *k == kind).count()
    }

    /// Frames of `kind` with their targets.
    pub fn of_kind(&self, kind: &str) -> Vec<(ChannelTarget, ServerMessage)> {
        self.sent().into_iter().filter(|(_, m)| m.kind() == kind).collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }

    /// Execution payloads pushed for dispatch, in send order.
    pub fn dispatched_payloads(&self) -> Vec<TaskRunExecutionPayload> {
        self.sent()
            .into_iter()
            .filter_map(|(_, m)| match m {
                ServerMessage::BackgroundWorkerMessage { data, .. } => Some(data),
                _ => None,
            })
            .flat_map(|data| match data {
                WorkerServerMessage::ExecuteRuns { payloads } => payloads,
                WorkerServerMessage::ScheduleAttempt { payload, .. } => vec![payload],
            })
            .collect()
    }
}

#[async_trait]
impl WorkerChannel for RecordingChannel {
    async fn send(&self, target: &ChannelTarget, message: ServerMessage) -> Result<(), ChannelError> {
        self.sent.lock().unwrap().push((target.clone(), message));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkRecord {
    Event { run_id: String, name: String },
    Complete { run_id: String },
    Cancel { run_id: String, reason: String },
    Crash { run_id: String },
}

#[derive(Default)]
pub struct RecordingSink {
    records: Mutex<Vec<SinkRecord>>,
}

impl RecordingSink {
    pub fn records(&self) -> Vec<SinkRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Names of point events recorded for `run_id`.
    pub fn event_names(&self, run_id: &str) -> Vec<String> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                SinkRecord::Event { run_id: id, name } if id == run_id => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn contains(&self, record: &SinkRecord) -> bool {
        self.records().contains(record)
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn record_event(&self, run_id: &str, name: &str, _properties: serde_json::Value) -> Result<(), SinkError> {
        self.records.lock().unwrap().push(SinkRecord::Event {
            run_id: run_id.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }

    async fn complete_event(&self, run_id: &str, _at: DateTime<Utc>) -> Result<(), SinkError> {
        self.records.lock().unwrap().push(SinkRecord::Complete {
            run_id: run_id.to_string(),
        });
        Ok(())
    }

    async fn cancel_event(&self, run_id: &str, reason: &str, _at: DateTime<Utc>) -> Result<(), SinkError> {
        self.records.lock().unwrap().push(SinkRecord::Cancel {
            run_id: run_id.to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn crash_event(&self, run_id: &str, _error: &TaskRunError, _at: DateTime<Utc>) -> Result<(), SinkError> {
        self.records.lock().unwrap().push(SinkRecord::Crash {
            run_id: run_id.to_string(),
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

pub fn environment(id: &str, env_type: EnvironmentType) -> RuntimeEnvironment {
    RuntimeEnvironment {
        id: id.to_string(),
        slug: id.trim_start_matches("env_").to_string(),
        env_type,
        organization: OrganizationRef {
            id: "org_1".to_string(),
            slug: "acme".to_string(),
            title: "Acme".to_string(),
        },
        project: ProjectRef {
            id: "proj_1".to_string(),
            slug: "mailer".to_string(),
            name: "Mailer".to_string(),
            external_ref: "proj_mailer".to_string(),
        },
    }
}

pub fn task(slug: &str) -> BackgroundWorkerTask {
    BackgroundWorkerTask {
        id: format!("task-{slug}"),
        slug: slug.to_string(),
        file_path: format!("src/trigger/{slug}.ts"),
        export_name: slug.replace('-', "_"),
        retry_config: None,
        machine_config: None,
        max_duration_secs: None,
    }
}

/// Deterministic backoff: the first retry waits exactly `min_timeout_ms`.
pub fn retry_config(max_attempts: u32, min_timeout_ms: u64) -> RetryOptions {
    RetryOptions {
        max_attempts: Some(max_attempts),
        factor: Some(2.0),
        min_timeout_in_ms: Some(min_timeout_ms),
        max_timeout_in_ms: Some(60_000),
        randomize: Some(false),
        out_of_memory: None,
    }
}

pub fn with_retry(mut task: BackgroundWorkerTask, retry: RetryOptions) -> BackgroundWorkerTask {
    task.retry_config = Some(retry);
    task
}

/// A current-SDK worker that supports lazy attempts.
pub fn worker(environment_id: &str, id: &str, version: &str, tasks: Vec<BackgroundWorkerTask>) -> BackgroundWorker {
    BackgroundWorker {
        id: id.to_string(),
        friendly_id: format!("worker_{id}"),
        environment_id: environment_id.to_string(),
        version: version.to_string(),
        sdk_version: "3.1.0".to_string(),
        deprecated: false,
        supports_lazy_attempts: true,
        tasks,
        created_at: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

/// Options for tests driving `consume_once` by hand.
pub fn test_options() -> EngineOptions {
    EngineOptions {
        pool_size: 1,
        handled_delay_ms: 5,
        empty_delay_ms: 5,
        jitter_ms: 0,
        push_failure_nack_delay_ms: 60_000,
        ..EngineOptions::default()
    }
}

pub struct Fixture {
    pub engine: Arc<Engine>,
    pub store: Arc<InMemoryStore>,
    pub queue: Arc<InMemoryWorkQueue>,
    pub channel: Arc<RecordingChannel>,
    pub sink: Arc<RecordingSink>,
    pub env_vars: Arc<InMemoryEnvironmentVariables>,
    pub client: Client,
    /// A production consumer on the shared scope, driven by hand.
    pub consumer: QueueConsumer,
}

pub async fn fixture() -> Fixture {
    fixture_with(test_options()).await
}

pub async fn fixture_with(options: EngineOptions) -> Fixture {
    let channel = Arc::new(RecordingChannel::default());
    fixture_with_channel(options, channel.clone(), channel).await
}

/// `engine_channel` is what the engine sends through; `channel` is the
/// recorder the test asserts on (usually behind `engine_channel`).
pub async fn fixture_with_channel(
    options: EngineOptions,
    engine_channel: Arc<dyn WorkerChannel>,
    channel: Arc<RecordingChannel>,
) -> Fixture {
    let queue = Arc::new(InMemoryWorkQueue::new());
    let store = Arc::new(InMemoryStore::new());
    build_fixture(options, engine_channel, channel, queue.clone(), queue, store.clone(), store).await
}

/// The engine goes through a [`HookedQueue`] over the fixture's queue.
pub async fn fixture_with_hooked_queue(options: EngineOptions) -> (Fixture, Arc<HookedQueue>) {
    let channel = Arc::new(RecordingChannel::default());
    let queue = Arc::new(InMemoryWorkQueue::new());
    let hooked = Arc::new(HookedQueue::new(queue.clone()));
    let store = Arc::new(InMemoryStore::new());
    let fx = build_fixture(options, channel.clone(), channel, hooked.clone(), queue, store.clone(), store).await;
    (fx, hooked)
}

/// The engine goes through a [`HookedStore`] over the fixture's store.
pub async fn fixture_with_hooked_store(options: EngineOptions) -> (Fixture, Arc<HookedStore>) {
    let channel = Arc::new(RecordingChannel::default());
    let queue = Arc::new(InMemoryWorkQueue::new());
    let store = Arc::new(InMemoryStore::new());
    let hooked = Arc::new(HookedStore::new(store.clone()));
    let fx = build_fixture(options, channel.clone(), channel, queue.clone(), queue, hooked.clone(), store).await;
    (fx, hooked)
}

async fn build_fixture(
    options: EngineOptions,
    engine_channel: Arc<dyn WorkerChannel>,
    channel: Arc<RecordingChannel>,
    engine_queue: Arc<dyn WorkQueue>,
    queue: Arc<InMemoryWorkQueue>,
    engine_store: Arc<dyn Store>,
    store: Arc<InMemoryStore>,
) -> Fixture {
    let sink = Arc::new(RecordingSink::default());
    let env_vars = Arc::new(InMemoryEnvironmentVariables::new());

    store
        .upsert_environment(environment(PROD_ENV, EnvironmentType::Production))
        .await
        .unwrap();
    store
        .upsert_environment(environment(DEV_ENV, EnvironmentType::Development))
        .await
        .unwrap();

    let engine = Engine::builder()
        .store(engine_store)
        .queue(engine_queue)
        .channel(engine_channel)
        .events(sink.clone())
        .env_vars(env_vars.clone())
        .options(options)
        .build()
        .unwrap();
    let client = Client::new(store.clone(), queue.clone());
    let consumer = QueueConsumer::new(
        "test-consumer",
        QueueScope::Shared,
        ChannelTarget::Namespace(NAMESPACE.to_string()),
        Arc::new(AtomicBool::new(false)),
    );
    Fixture {
        engine,
        store,
        queue,
        channel,
        sink,
        env_vars,
        client,
        consumer,
    }
}

impl Fixture {
    /// Deploy a production worker carrying `tasks` at version `20240101.1`.
    pub async fn deploy(&self, tasks: Vec<BackgroundWorkerTask>) -> BackgroundWorker {
        let w = worker(PROD_ENV, "worker-1", "20240101.1", tasks);
        self.store.create_worker(w.clone()).await.unwrap();
        w
    }

    pub async fn deploy_worker(&self, w: BackgroundWorker) -> BackgroundWorker {
        self.store.create_worker(w.clone()).await.unwrap();
        w
    }

    pub async fn trigger(&self, task: &str) -> TaskRun {
        self.trigger_with(task, TriggerOptions::default()).await
    }

    pub async fn trigger_with(&self, task: &str, options: TriggerOptions) -> TaskRun {
        self.client
            .trigger(PROD_ENV, task, Some(r#"{"to":"a@example.com"}"#.to_string()), options)
            .await
            .unwrap()
            .run
    }

    pub async fn consume(&self) -> ConsumeOutcome {
        self.engine.consume_once(&self.consumer).await.unwrap()
    }

    /// Consume one message that must dispatch; returns `(run_id, attempt_id)`.
    pub async fn dispatch_next(&self) -> (String, String) {
        match self.consume().await {
            ConsumeOutcome::Dispatched { run_id, attempt_id } => (run_id, attempt_id),
            other => panic!("expected a dispatch, got {other:?}"),
        }
    }

    /// Trigger `task` and dispatch its first attempt.
    pub async fn start(&self, task: &str) -> (TaskRun, TaskRunAttempt) {
        let run = self.trigger(task).await;
        let (run_id, attempt_id) = self.dispatch_next().await;
        assert_eq!(run_id, run.id);
        (self.run(&run.id).await, self.attempt(&attempt_id).await)
    }

    pub async fn run(&self, id: &str) -> TaskRun {
        self.store.get_run(id).await.unwrap().expect("run exists")
    }

    pub async fn attempt(&self, id: &str) -> TaskRunAttempt {
        self.store.get_attempt(id).await.unwrap().expect("attempt exists")
    }

    pub async fn attempts(&self, run_id: &str) -> Vec<TaskRunAttempt> {
        self.store.list_attempts(run_id).await.unwrap()
    }

    pub async fn latest_attempt(&self, run_id: &str) -> TaskRunAttempt {
        self.store
            .latest_attempt(run_id)
            .await
            .unwrap()
            .expect("run has an attempt")
    }

    pub async fn message(&self, run_id: &str) -> Option<courier::providers::QueueMessage> {
        self.queue.peek(run_id).await.unwrap()
    }
}

/// Poll `check` until it returns true or `timeout_ms` passes.
pub async fn wait_until<F, Fut>(timeout_ms: u64, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if check().await {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
