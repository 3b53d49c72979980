//! The engine context and its services.
//!
//! [`Engine`] holds every collaborator handle. Services are `impl Engine`
//! blocks spread over the submodules:
//!
//! - `consumer`: dequeue loop and message handling
//! - `lifecycle`: attempt creation/revert and the finalization path
//! - `completion`: attempt completion, retry and crash decisions
//! - `checkpoint`: checkpoint creation and restore
//! - `dependencies`: waking parents blocked on finished runs
//! - `cancellation`: cancelling runs and everything waiting under them
//! - `heartbeat`: lease extension from worker heartbeats
//! - `sessions`: worker connections and inbound message routing

use chrono::{DateTime, Utc};
use rand::RngExt;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::channel::{ChannelTarget, ServerMessage, WorkerChannel};
use crate::env_vars::{EnvironmentVariables, InMemoryEnvironmentVariables};
use crate::errors::{EngineError, TaskRunError};
use crate::events::{EventSink, TracingEventSink};
use crate::limits::MAX_TASK_RUN_ATTEMPTS;
use crate::machines::MachinePresetName;
use crate::model::{RuntimeEnvironment, TaskRun};
use crate::observability::{EngineMetrics, MetricsSnapshot};
use crate::providers::{MessageBody, NewMessage, QueueScope, Store, WorkQueue};

pub mod cancellation;
pub mod checkpoint;
pub mod completion;
pub mod consumer;
pub mod dependencies;
pub mod heartbeat;
pub mod lifecycle;
pub mod sessions;

pub use cancellation::{CancelOptions, CancelOutcome};
pub use checkpoint::{CheckpointOutcome, CreateCheckpointRequest, RestoreOutcome};
pub use completion::{CompleteAttemptRequest, CompletionOutcome, RetryDispatch};
pub use consumer::{ConsumeOutcome, InFlightIndex, QueueConsumer};
pub use lifecycle::{CrashOptions, FinalizeDetails};
pub use sessions::MessageOrigin;

/// Engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Production consumer slots sharing the shared scope.
    pub pool_size: usize,
    /// Sleep after a handled message.
    pub handled_delay_ms: u64,
    /// Sleep after an empty dequeue.
    pub empty_delay_ms: u64,
    /// Upper bound of the random extra added to either sleep.
    pub jitter_ms: u64,
    /// Lease granted by a dequeue.
    pub visibility_timeout_ms: u64,
    /// Lease extension granted by a heartbeat or restore.
    pub heartbeat_extension_ms: u64,
    /// Iterations recorded under one consumer span.
    pub span_item_budget: u32,
    pub span_timeout_ms: u64,
    /// Retry delays above this go through the queue when the worker cannot checkpoint.
    pub retry_checkpoint_threshold_ms: u64,
    /// Hard ceiling across all retry configs.
    pub max_attempts_ceiling: u32,
    /// Retry delays, computed or reported by the worker, are clamped to this.
    pub max_retry_delay_ms: u64,
    /// Delay before a message whose dispatch failed is redelivered.
    pub push_failure_nack_delay_ms: u64,
    pub default_machine: MachinePresetName,
    /// Grace period passed with REQUEST_RUN_CANCELLATION.
    pub cancellation_grace_ms: u64,
    /// Namespace of the production worker pool.
    pub shared_namespace: String,
    /// Larger successful outputs fail the attempt with TASK_OUTPUT_ERROR.
    pub max_output_bytes: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            pool_size: 4,
            handled_delay_ms: 10,
            empty_delay_ms: 250,
            jitter_ms: 25,
            visibility_timeout_ms: 120_000,
            heartbeat_extension_ms: 120_000,
            span_item_budget: 50,
            span_timeout_ms: 10_000,
            retry_checkpoint_threshold_ms: 30_000,
            max_attempts_ceiling: MAX_TASK_RUN_ATTEMPTS,
            max_retry_delay_ms: 30 * 24 * 60 * 60 * 1000,
            push_failure_nack_delay_ms: 5_000,
            default_machine: MachinePresetName::Small1x,
            cancellation_grace_ms: 30_000,
            shared_namespace: "workers".to_string(),
            max_output_bytes: 3 * 1024 * 1024,
        }
    }
}

impl EngineOptions {
    /// Load options from a JSON document; missing keys take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    pub fn heartbeat_extension(&self) -> Duration {
        Duration::from_millis(self.heartbeat_extension_ms)
    }
}

/// Explicit context passed to every service. Nothing in the crate is global.
pub struct Engine {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) queue: Arc<dyn WorkQueue>,
    pub(crate) channel: Arc<dyn WorkerChannel>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) env_vars: Arc<dyn EnvironmentVariables>,
    pub(crate) options: EngineOptions,
    pub(crate) metrics: EngineMetrics,
    pub(crate) sessions: sessions::DevConsumerRegistry,
    engine_id: String,
    shutdown_flag: Arc<AtomicBool>,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

/// Builder for [`Engine`]. Store, queue and channel are required.
#[derive(Default)]
pub struct EngineBuilder {
    store: Option<Arc<dyn Store>>,
    queue: Option<Arc<dyn WorkQueue>>,
    channel: Option<Arc<dyn WorkerChannel>>,
    events: Option<Arc<dyn EventSink>>,
    env_vars: Option<Arc<dyn EnvironmentVariables>>,
    options: EngineOptions,
    #[cfg(feature = "observability")]
    meter: Option<opentelemetry::metrics::Meter>,
}

impl EngineBuilder {
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn queue(mut self, queue: Arc<dyn WorkQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn channel(mut self, channel: Arc<dyn WorkerChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn env_vars(mut self, env_vars: Arc<dyn EnvironmentVariables>) -> Self {
        self.env_vars = Some(env_vars);
        self
    }

    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Mirror the engine counters to instruments on `meter`.
    #[cfg(feature = "observability")]
    pub fn meter(mut self, meter: opentelemetry::metrics::Meter) -> Self {
        self.meter = Some(meter);
        self
    }

    pub fn build(self) -> Result<Arc<Engine>, String> {
        let store = self.store.ok_or("engine requires a store")?;
        let queue = self.queue.ok_or("engine requires a work queue")?;
        let channel = self.channel.ok_or("engine requires a worker channel")?;
        #[cfg(feature = "observability")]
        let metrics = self.meter.as_ref().map(EngineMetrics::with_meter).unwrap_or_default();
        #[cfg(not(feature = "observability"))]
        let metrics = EngineMetrics::default();
        Ok(Arc::new(Engine {
            store,
            queue,
            channel,
            events: self.events.unwrap_or_else(|| Arc::new(TracingEventSink)),
            env_vars: self
                .env_vars
                .unwrap_or_else(|| Arc::new(InMemoryEnvironmentVariables::new())),
            options: self.options,
            metrics,
            sessions: sessions::DevConsumerRegistry::default(),
            engine_id: crate::friendly_id::internal_id(),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            joins: Mutex::new(Vec::new()),
        }))
    }
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn WorkQueue> {
        &self.queue
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn sessions(&self) -> &sessions::DevConsumerRegistry {
        &self.sessions
    }

    /// Spawn the production consumer pool on the shared scope.
    pub async fn start(self: &Arc<Self>) {
        let mut joins = self.joins.lock().await;
        for slot in 0..self.options.pool_size {
            let consumer = QueueConsumer::new(
                format!("prod-{slot}-{}", self.engine_id),
                QueueScope::Shared,
                ChannelTarget::Namespace(self.options.shared_namespace.clone()),
                self.shutdown_flag.clone(),
            );
            joins.push(self.clone().spawn_consumer(Arc::new(consumer)));
        }
        tracing::info!(
            target: "courier::consumer",
            engine_id = %self.engine_id,
            pool_size = self.options.pool_size,
            "Consumer pool started"
        );
    }

    /// Stop every consumer loop and wait for them to exit.
    pub async fn shutdown(self: &Arc<Self>) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
        self.sessions.stop_all().await;
        let joins: Vec<_> = self.joins.lock().await.drain(..).collect();
        futures::future::join_all(joins).await;
        tracing::info!(target: "courier::consumer", engine_id = %self.engine_id, "Consumer pool stopped");
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// `now` plus `ms`, saturating at the latest representable instant.
    pub(crate) fn after_ms(&self, ms: u64) -> DateTime<Utc> {
        let now = self.now();
        i64::try_from(ms)
            .ok()
            .and_then(chrono::Duration::try_milliseconds)
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// `base` plus up to `jitter_ms` of random extra.
    pub(crate) fn jittered(&self, base_ms: u64) -> Duration {
        let extra = if self.options.jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=self.options.jitter_ms)
        };
        Duration::from_millis(base_ms + extra)
    }

    pub(crate) async fn environment(&self, id: &str) -> Result<RuntimeEnvironment, EngineError> {
        self.store
            .get_environment(id)
            .await?
            .ok_or_else(|| EngineError::EnvironmentNotFound(id.to_string()))
    }

    pub(crate) async fn enqueue_run(
        &self,
        run: &TaskRun,
        env: &RuntimeEnvironment,
        body: MessageBody,
        available_at: Option<DateTime<Utc>>,
    ) -> Result<(), EngineError> {
        self.queue.enqueue(run_message(run, env, body, available_at)).await?;
        Ok(())
    }

    /// Where per-run control frames for `run` go: the dev session holding its
    /// attempt, or the coordinator.
    pub(crate) async fn control_target(&self, env: &RuntimeEnvironment, attempt_id: &str) -> Option<ChannelTarget> {
        if env.is_development() {
            self.sessions
                .session_for_attempt(&env.id, attempt_id)
                .await
                .map(ChannelTarget::Session)
        } else {
            Some(ChannelTarget::Coordinator)
        }
    }

    /// Send and log; used where a lost frame is recovered by lease expiry.
    pub(crate) async fn send_logged(&self, target: &ChannelTarget, message: ServerMessage, run_id: &str) -> bool {
        let kind = message.kind();
        match self.channel.send(target, message).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    target: "courier::channel",
                    run_id = %run_id,
                    message_type = kind,
                    target_kind = ?target,
                    error = %e,
                    "Failed to send worker frame"
                );
                false
            }
        }
    }

    pub(crate) async fn emit_event(&self, run_id: &str, name: &str, properties: serde_json::Value) {
        if let Err(e) = self.events.record_event(run_id, name, properties).await {
            tracing::warn!(target: "courier::events", run_id = %run_id, event = %name, error = %e, "Event sink failed");
        }
    }

    pub(crate) async fn emit_complete(&self, run_id: &str) {
        if let Err(e) = self.events.complete_event(run_id, self.now()).await {
            tracing::warn!(target: "courier::events", run_id = %run_id, error = %e, "Event sink failed");
        }
    }

    pub(crate) async fn emit_cancel(&self, run_id: &str, reason: &str) {
        if let Err(e) = self.events.cancel_event(run_id, reason, self.now()).await {
            tracing::warn!(target: "courier::events", run_id = %run_id, error = %e, "Event sink failed");
        }
    }

    pub(crate) async fn emit_crash(&self, run_id: &str, error: &TaskRunError) {
        if let Err(e) = self.events.crash_event(run_id, error, self.now()).await {
            tracing::warn!(target: "courier::events", run_id = %run_id, error = %e, "Event sink failed");
        }
    }
}

/// Scope a run's messages live in.
pub fn scope_for(env: &RuntimeEnvironment) -> QueueScope {
    if env.is_development() {
        QueueScope::environment(&env.id)
    } else {
        QueueScope::Shared
    }
}

/// Queue message for `run`, keyed by the run id.
pub fn run_message(
    run: &TaskRun,
    env: &RuntimeEnvironment,
    body: MessageBody,
    available_at: Option<DateTime<Utc>>,
) -> NewMessage {
    NewMessage {
        id: run.id.clone(),
        scope: scope_for(env),
        queue: run.queue.clone(),
        body,
        priority_ms: run.priority_ms,
        concurrency_key: run.concurrency_key.clone(),
        available_at,
    }
}
