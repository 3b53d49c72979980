use std::sync::Arc;

use chrono::Duration as ChronoDuration;

use crate::errors::EngineError;
use crate::friendly_id;
use crate::limits::DEFAULT_IDEMPOTENCY_KEY_TTL_SECS;
use crate::machines::MachinePresetName;
use crate::model::{
    BackgroundWorker, BatchItemStatus, BatchStatus, BatchTaskRun, BatchTaskRunItem, RunPatch, RuntimeEnvironment,
    TaskQueue, TaskRun, TaskRunDependency,
};
use crate::providers::{MessageBody, Store, WorkQueue};
use crate::runtime::run_message;
use crate::status::RunStatus;

/// Per-trigger options. Everything is optional.
#[derive(Debug, Clone, Default)]
pub struct TriggerOptions {
    /// Defaults to `task/<task identifier>`.
    pub queue: Option<String>,
    pub idempotency_key: Option<String>,
    pub idempotency_key_ttl_secs: Option<u64>,
    /// Milliseconds of queue-time advantage.
    pub priority_ms: i64,
    pub tags: Vec<String>,
    pub concurrency_key: Option<String>,
    pub machine: Option<MachinePresetName>,
    /// Expire the run if it has not started this many seconds after queueing.
    pub ttl_secs: Option<u64>,
    /// Pin the run to a worker version id.
    pub lock_to_version: Option<String>,
    pub max_duration_secs: Option<u64>,
    pub payload_type: Option<String>,
    /// Do not dispatch before this many milliseconds have passed.
    pub delay_ms: Option<u64>,
    pub is_test: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriggerResult {
    pub run: TaskRun,
    /// An existing run was returned for the idempotency key.
    pub is_cached: bool,
}

#[derive(Debug, Clone)]
pub struct BatchItem {
    pub task_identifier: String,
    pub payload: Option<String>,
    pub options: TriggerOptions,
}

#[derive(Debug, Clone)]
pub struct BatchTriggerResult {
    pub batch: BatchTaskRun,
    pub runs: Vec<TaskRun>,
}

/// Control-plane client. Writes rows and queue messages directly; the engine
/// picks the work up from the queue.
pub struct Client {
    store: Arc<dyn Store>,
    queue: Arc<dyn WorkQueue>,
}

impl Client {
    pub fn new(store: Arc<dyn Store>, queue: Arc<dyn WorkQueue>) -> Self {
        Self { store, queue }
    }

    /// Queue a new run, or return the live run holding the same idempotency key.
    pub async fn trigger(
        &self,
        environment_id: &str,
        task_identifier: &str,
        payload: Option<String>,
        options: TriggerOptions,
    ) -> Result<TriggerResult, EngineError> {
        let env = self.environment(environment_id).await?;
        if let Some(cached) = self.cached_run(&env, task_identifier, &options).await? {
            return Ok(cached);
        }
        let run = self.new_run(&env, task_identifier, payload, &options).await?;
        self.store.create_run(run.clone()).await?;
        self.enqueue(&run, &env, &options).await?;
        Ok(TriggerResult { run, is_cached: false })
    }

    /// Queue a child run that `parent_attempt_id` will wait on. The dependency
    /// exists before the child can be dequeued.
    pub async fn trigger_and_wait(
        &self,
        parent_attempt_id: &str,
        environment_id: &str,
        task_identifier: &str,
        payload: Option<String>,
        options: TriggerOptions,
    ) -> Result<TriggerResult, EngineError> {
        let env = self.environment(environment_id).await?;
        if let Some(cached) = self.cached_run(&env, task_identifier, &options).await? {
            return Ok(cached);
        }
        let run = self.new_run(&env, task_identifier, payload, &options).await?;
        self.store.create_run(run.clone()).await?;
        self.store
            .create_dependency(TaskRunDependency {
                id: friendly_id::internal_id(),
                task_run_id: run.id.clone(),
                dependent_attempt_id: Some(parent_attempt_id.to_string()),
                dependent_batch_id: None,
                checkpoint_event_id: None,
                resumed_at: None,
                created_at: chrono::Utc::now(),
            })
            .await?;
        self.enqueue(&run, &env, &options).await?;
        tracing::debug!(
            target: "courier::client",
            run_id = %run.id,
            parent_attempt_id = %parent_attempt_id,
            "Triggered child run"
        );
        Ok(TriggerResult { run, is_cached: false })
    }

    /// Queue a batch. With `parent_attempt_id`, that attempt waits for every item.
    pub async fn batch_trigger(
        &self,
        parent_attempt_id: Option<&str>,
        environment_id: &str,
        items: Vec<BatchItem>,
    ) -> Result<BatchTriggerResult, EngineError> {
        let env = self.environment(environment_id).await?;
        let now = chrono::Utc::now();
        let batch = BatchTaskRun {
            id: friendly_id::internal_id(),
            friendly_id: friendly_id::generate("batch"),
            environment_id: env.id.clone(),
            status: BatchStatus::Pending,
            dependent_attempt_id: parent_attempt_id.map(str::to_string),
            checkpoint_event_id: None,
            resumed_at: None,
            created_at: now,
        };

        let mut runs = Vec::with_capacity(items.len());
        for item in &items {
            let run = self
                .new_run(&env, &item.task_identifier, item.payload.clone(), &item.options)
                .await?;
            self.store.create_run(run.clone()).await?;
            runs.push(run);
        }
        let batch_items = runs
            .iter()
            .map(|run| BatchTaskRunItem {
                id: friendly_id::internal_id(),
                batch_id: batch.id.clone(),
                task_run_id: run.id.clone(),
                status: BatchItemStatus::Pending,
                task_run_attempt_id: None,
            })
            .collect();
        self.store.create_batch(batch.clone(), batch_items).await?;

        for (run, item) in runs.iter().zip(&items) {
            self.store
                .create_dependency(TaskRunDependency {
                    id: friendly_id::internal_id(),
                    task_run_id: run.id.clone(),
                    dependent_attempt_id: None,
                    dependent_batch_id: Some(batch.id.clone()),
                    checkpoint_event_id: None,
                    resumed_at: None,
                    created_at: now,
                })
                .await?;
            self.enqueue(run, &env, &item.options).await?;
        }
        tracing::debug!(
            target: "courier::client",
            batch_id = %batch.id,
            items = runs.len(),
            "Triggered batch"
        );
        Ok(BatchTriggerResult { batch, runs })
    }

    /// Register a deployed worker version and re-queue runs that were waiting
    /// for one. Returns how many runs were re-queued.
    pub async fn register_worker(&self, worker: BackgroundWorker) -> Result<usize, EngineError> {
        let env = self.environment(&worker.environment_id).await?;
        self.store.create_worker(worker.clone()).await?;

        let mut requeued = 0;
        for run in self
            .store
            .list_runs_with_status(&env.id, RunStatus::WaitingForDeploy)
            .await?
        {
            let Some(run) = self
                .store
                .update_run(&run.id, &[RunStatus::WaitingForDeploy], RunPatch::status(RunStatus::Pending))
                .await?
            else {
                continue;
            };
            let body = MessageBody::Execute {
                task_identifier: run.task_identifier.clone(),
                checkpoint_event_id: None,
            };
            self.queue.enqueue(run_message(&run, &env, body, None)).await?;
            requeued += 1;
        }
        tracing::info!(
            target: "courier::client",
            background_worker_id = %worker.id,
            version = %worker.version,
            requeued,
            "Worker registered"
        );
        Ok(requeued)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<TaskRun>, EngineError> {
        Ok(self.store.get_run(run_id).await?)
    }

    async fn environment(&self, id: &str) -> Result<RuntimeEnvironment, EngineError> {
        self.store
            .get_environment(id)
            .await?
            .ok_or_else(|| EngineError::EnvironmentNotFound(id.to_string()))
    }

    async fn cached_run(
        &self,
        env: &RuntimeEnvironment,
        task_identifier: &str,
        options: &TriggerOptions,
    ) -> Result<Option<TriggerResult>, EngineError> {
        let Some(key) = options.idempotency_key.as_deref() else {
            return Ok(None);
        };
        let found = self
            .store
            .find_run_by_idempotency_key(&env.id, task_identifier, key, chrono::Utc::now())
            .await?;
        Ok(found.map(|run| {
            tracing::debug!(target: "courier::client", run_id = %run.id, "Idempotency key hit");
            TriggerResult { run, is_cached: true }
        }))
    }

    async fn new_run(
        &self,
        env: &RuntimeEnvironment,
        task_identifier: &str,
        payload: Option<String>,
        options: &TriggerOptions,
    ) -> Result<TaskRun, EngineError> {
        let queue_name = options
            .queue
            .clone()
            .unwrap_or_else(|| format!("task/{task_identifier}"));
        let queue = self
            .store
            .upsert_queue(TaskQueue {
                id: friendly_id::internal_id(),
                name: queue_name,
                environment_id: env.id.clone(),
                concurrency_limit: None,
            })
            .await?;

        let now = chrono::Utc::now();
        let key_ttl = options.idempotency_key_ttl_secs.unwrap_or(DEFAULT_IDEMPOTENCY_KEY_TTL_SECS);
        Ok(TaskRun {
            id: friendly_id::internal_id(),
            friendly_id: friendly_id::generate("run"),
            task_identifier: task_identifier.to_string(),
            queue: queue.name,
            status: RunStatus::Pending,
            payload,
            payload_type: options
                .payload_type
                .clone()
                .unwrap_or_else(|| "application/json".to_string()),
            idempotency_key: options.idempotency_key.clone(),
            idempotency_key_expires_at: options
                .idempotency_key
                .as_ref()
                .map(|_| now + ChronoDuration::seconds(key_ttl as i64)),
            priority_ms: options.priority_ms,
            tags: options.tags.clone(),
            concurrency_key: options.concurrency_key.clone(),
            machine_preset: options.machine,
            ttl_secs: options.ttl_secs,
            locked_to_version_id: options.lock_to_version.clone(),
            locked_by_id: None,
            locked_at: None,
            attempt_count: 0,
            start_attempt_at_zero: false,
            max_duration_secs: options.max_duration_secs,
            environment_id: env.id.clone(),
            is_test: options.is_test,
            output: None,
            output_type: "application/json".to_string(),
            error: None,
            created_at: now,
            queued_at: Some(now),
            started_at: None,
            completed_at: None,
            expired_at: None,
            updated_at: now,
        })
    }

    async fn enqueue(&self, run: &TaskRun, env: &RuntimeEnvironment, options: &TriggerOptions) -> Result<(), EngineError> {
        let body = MessageBody::Execute {
            task_identifier: run.task_identifier.clone(),
            checkpoint_event_id: None,
        };
        let available_at = options
            .delay_ms
            .map(|ms| chrono::Utc::now() + ChronoDuration::milliseconds(ms as i64));
        self.queue.enqueue(run_message(run, env, body, available_at)).await?;
        Ok(())
    }
}
