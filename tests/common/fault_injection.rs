//! Channel, queue and store wrappers that fail or interleave on demand.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use courier::channel::{ChannelError, ChannelTarget, ServerMessage, WorkerChannel};
use courier::model::{
    AttemptPatch, BackgroundWorker, BatchItemStatus, BatchTaskRun, BatchTaskRunItem, Checkpoint,
    CheckpointRestoreEvent, RunPatch, RuntimeEnvironment, TaskQueue, TaskRun, TaskRunAttempt, TaskRunDependency,
};
use courier::providers::in_memory::{InMemoryStore, InMemoryWorkQueue};
use courier::providers::{MessageBody, NewMessage, ProviderError, QueueMessage, QueueScope, Store, WorkQueue};
use courier::status::{AttemptStatus, RunStatus};

use super::RecordingChannel;

/// Records every frame that gets through; fails all sends while `failing` is set.
pub struct FailingChannel {
    inner: Arc<RecordingChannel>,
    failing: AtomicBool,
}

impl FailingChannel {
    pub fn new(inner: Arc<RecordingChannel>) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
        }
    }

    pub fn fail_sends(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkerChannel for FailingChannel {
    async fn send(&self, target: &ChannelTarget, message: ServerMessage) -> Result<(), ChannelError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ChannelError::NotConnected(format!("{target:?}")));
        }
        self.inner.send(target, message).await
    }
}

type Hook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// A hook armed for one key that fires at most once.
#[derive(Default)]
struct HookSlot(Mutex<Option<(String, Hook)>>);

impl HookSlot {
    fn arm<F, Fut>(&self, key: &str, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: Hook = Box::new(move || Box::pin(hook()));
        *self.0.lock().unwrap() = Some((key.to_string(), hook));
    }

    async fn fire(&self, key: &str) {
        let hook = {
            let mut slot = self.0.lock().unwrap();
            if slot.as_ref().is_some_and(|(armed, _)| armed == key) {
                slot.take().map(|(_, hook)| hook)
            } else {
                None
            }
        };
        if let Some(hook) = hook {
            hook().await;
        }
    }
}

/// Delegates to an in-memory queue, running a one-shot hook right before
/// `cancel_heartbeat` reaches the chosen message.
pub struct HookedQueue {
    inner: Arc<InMemoryWorkQueue>,
    before_cancel_heartbeat: HookSlot,
    panic_on_dequeue: AtomicBool,
    dequeue_panicked: AtomicBool,
}

impl HookedQueue {
    pub fn new(inner: Arc<InMemoryWorkQueue>) -> Self {
        Self {
            inner,
            before_cancel_heartbeat: HookSlot::default(),
            panic_on_dequeue: AtomicBool::new(false),
            dequeue_panicked: AtomicBool::new(false),
        }
    }

    /// Make every following dequeue panic, taking its consumer task down.
    pub fn panic_on_dequeue(&self) {
        self.panic_on_dequeue.store(true, Ordering::SeqCst);
    }

    pub fn dequeue_panicked(&self) -> bool {
        self.dequeue_panicked.load(Ordering::SeqCst)
    }

    pub fn before_cancel_heartbeat<F, Fut>(&self, message_id: &str, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.before_cancel_heartbeat.arm(message_id, hook);
    }
}

#[async_trait]
impl WorkQueue for HookedQueue {
    async fn enqueue(&self, message: NewMessage) -> Result<(), ProviderError> {
        self.inner.enqueue(message).await
    }

    async fn dequeue(
        &self,
        scope: &QueueScope,
        visibility_timeout: Duration,
    ) -> Result<Option<QueueMessage>, ProviderError> {
        if self.panic_on_dequeue.load(Ordering::SeqCst) {
            self.dequeue_panicked.store(true, Ordering::SeqCst);
            panic!("dequeue failed for {scope:?}");
        }
        self.inner.dequeue(scope, visibility_timeout).await
    }

    async fn acknowledge(&self, message_id: &str) -> Result<bool, ProviderError> {
        self.inner.acknowledge(message_id).await
    }

    async fn nack(&self, message_id: &str, not_before: Option<DateTime<Utc>>) -> Result<bool, ProviderError> {
        self.inner.nack(message_id, not_before).await
    }

    async fn heartbeat(&self, message_id: &str, extension: Duration) -> Result<bool, ProviderError> {
        self.inner.heartbeat(message_id, extension).await
    }

    async fn cancel_heartbeat(&self, message_id: &str) -> Result<bool, ProviderError> {
        self.before_cancel_heartbeat.fire(message_id).await;
        self.inner.cancel_heartbeat(message_id).await
    }

    async fn replace(
        &self,
        message_id: &str,
        body: MessageBody,
        available_at: Option<DateTime<Utc>>,
    ) -> Result<bool, ProviderError> {
        self.inner.replace(message_id, body, available_at).await
    }

    async fn peek(&self, message_id: &str) -> Result<Option<QueueMessage>, ProviderError> {
        self.inner.peek(message_id).await
    }
}

/// Delegates to an in-memory store, running a one-shot hook right before
/// `update_run` reaches the chosen run.
pub struct HookedStore {
    inner: Arc<InMemoryStore>,
    before_update_run: HookSlot,
}

impl HookedStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            before_update_run: HookSlot::default(),
        }
    }

    pub fn before_update_run<F, Fut>(&self, run_id: &str, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.before_update_run.arm(run_id, hook);
    }
}

#[async_trait]
impl Store for HookedStore {
    async fn upsert_environment(&self, environment: RuntimeEnvironment) -> Result<(), ProviderError> {
        self.inner.upsert_environment(environment).await
    }

    async fn get_environment(&self, id: &str) -> Result<Option<RuntimeEnvironment>, ProviderError> {
        self.inner.get_environment(id).await
    }

    async fn upsert_queue(&self, queue: TaskQueue) -> Result<TaskQueue, ProviderError> {
        self.inner.upsert_queue(queue).await
    }

    async fn get_queue(&self, environment_id: &str, name: &str) -> Result<Option<TaskQueue>, ProviderError> {
        self.inner.get_queue(environment_id, name).await
    }

    async fn create_worker(&self, worker: BackgroundWorker) -> Result<(), ProviderError> {
        self.inner.create_worker(worker).await
    }

    async fn get_worker(&self, id: &str) -> Result<Option<BackgroundWorker>, ProviderError> {
        self.inner.get_worker(id).await
    }

    async fn list_workers(&self, environment_id: &str) -> Result<Vec<BackgroundWorker>, ProviderError> {
        self.inner.list_workers(environment_id).await
    }

    async fn set_worker_deprecated(&self, id: &str) -> Result<bool, ProviderError> {
        self.inner.set_worker_deprecated(id).await
    }

    async fn create_run(&self, run: TaskRun) -> Result<(), ProviderError> {
        self.inner.create_run(run).await
    }

    async fn get_run(&self, id: &str) -> Result<Option<TaskRun>, ProviderError> {
        self.inner.get_run(id).await
    }

    async fn get_run_by_friendly_id(&self, friendly_id: &str) -> Result<Option<TaskRun>, ProviderError> {
        self.inner.get_run_by_friendly_id(friendly_id).await
    }

    async fn find_run_by_idempotency_key(
        &self,
        environment_id: &str,
        task_identifier: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRun>, ProviderError> {
        self.inner
            .find_run_by_idempotency_key(environment_id, task_identifier, key, now)
            .await
    }

    async fn list_runs_with_status(
        &self,
        environment_id: &str,
        status: RunStatus,
    ) -> Result<Vec<TaskRun>, ProviderError> {
        self.inner.list_runs_with_status(environment_id, status).await
    }

    async fn update_run(
        &self,
        id: &str,
        expected: &[RunStatus],
        patch: RunPatch,
    ) -> Result<Option<TaskRun>, ProviderError> {
        self.before_update_run.fire(id).await;
        self.inner.update_run(id, expected, patch).await
    }

    async fn lock_run_and_create_attempt(
        &self,
        run_id: &str,
        expected: &[RunStatus],
        run_patch: RunPatch,
        attempt: TaskRunAttempt,
    ) -> Result<Option<(TaskRun, TaskRunAttempt)>, ProviderError> {
        self.inner
            .lock_run_and_create_attempt(run_id, expected, run_patch, attempt)
            .await
    }

    async fn revert_attempt(&self, attempt_id: &str) -> Result<Option<TaskRun>, ProviderError> {
        self.inner.revert_attempt(attempt_id).await
    }

    async fn get_attempt(&self, id: &str) -> Result<Option<TaskRunAttempt>, ProviderError> {
        self.inner.get_attempt(id).await
    }

    async fn list_attempts(&self, run_id: &str) -> Result<Vec<TaskRunAttempt>, ProviderError> {
        self.inner.list_attempts(run_id).await
    }

    async fn update_attempt(
        &self,
        id: &str,
        expected: &[AttemptStatus],
        patch: AttemptPatch,
    ) -> Result<Option<TaskRunAttempt>, ProviderError> {
        self.inner.update_attempt(id, expected, patch).await
    }

    async fn create_dependency(&self, dependency: TaskRunDependency) -> Result<(), ProviderError> {
        self.inner.create_dependency(dependency).await
    }

    async fn get_dependency(&self, id: &str) -> Result<Option<TaskRunDependency>, ProviderError> {
        self.inner.get_dependency(id).await
    }

    async fn dependency_for_run(&self, task_run_id: &str) -> Result<Option<TaskRunDependency>, ProviderError> {
        self.inner.dependency_for_run(task_run_id).await
    }

    async fn dependencies_of_attempt(&self, attempt_id: &str) -> Result<Vec<TaskRunDependency>, ProviderError> {
        self.inner.dependencies_of_attempt(attempt_id).await
    }

    async fn set_dependency_checkpoint_event(&self, id: &str, event_id: &str) -> Result<bool, ProviderError> {
        self.inner.set_dependency_checkpoint_event(id, event_id).await
    }

    async fn mark_dependency_resumed(&self, id: &str, at: DateTime<Utc>) -> Result<bool, ProviderError> {
        self.inner.mark_dependency_resumed(id, at).await
    }

    async fn create_batch(&self, batch: BatchTaskRun, items: Vec<BatchTaskRunItem>) -> Result<(), ProviderError> {
        self.inner.create_batch(batch, items).await
    }

    async fn get_batch(&self, id: &str) -> Result<Option<BatchTaskRun>, ProviderError> {
        self.inner.get_batch(id).await
    }

    async fn get_batch_by_friendly_id(&self, friendly_id: &str) -> Result<Option<BatchTaskRun>, ProviderError> {
        self.inner.get_batch_by_friendly_id(friendly_id).await
    }

    async fn batches_of_attempt(&self, attempt_id: &str) -> Result<Vec<BatchTaskRun>, ProviderError> {
        self.inner.batches_of_attempt(attempt_id).await
    }

    async fn list_batch_items(&self, batch_id: &str) -> Result<Vec<BatchTaskRunItem>, ProviderError> {
        self.inner.list_batch_items(batch_id).await
    }

    async fn finish_batch_item(
        &self,
        batch_id: &str,
        task_run_id: &str,
        status: BatchItemStatus,
        attempt_id: Option<&str>,
    ) -> Result<Option<BatchTaskRunItem>, ProviderError> {
        self.inner
            .finish_batch_item(batch_id, task_run_id, status, attempt_id)
            .await
    }

    async fn set_batch_checkpoint_event(&self, id: &str, event_id: &str) -> Result<bool, ProviderError> {
        self.inner.set_batch_checkpoint_event(id, event_id).await
    }

    async fn mark_batch_resumed(&self, id: &str, at: DateTime<Utc>) -> Result<bool, ProviderError> {
        self.inner.mark_batch_resumed(id, at).await
    }

    async fn create_checkpoint(
        &self,
        checkpoint: Checkpoint,
        event: CheckpointRestoreEvent,
    ) -> Result<(), ProviderError> {
        self.inner.create_checkpoint(checkpoint, event).await
    }

    async fn get_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>, ProviderError> {
        self.inner.get_checkpoint(id).await
    }

    async fn get_checkpoint_event(&self, id: &str) -> Result<Option<CheckpointRestoreEvent>, ProviderError> {
        self.inner.get_checkpoint_event(id).await
    }

    async fn checkpoint_event_for(
        &self,
        checkpoint_id: &str,
    ) -> Result<Option<CheckpointRestoreEvent>, ProviderError> {
        self.inner.checkpoint_event_for(checkpoint_id).await
    }

    async fn create_restore_event(&self, event: CheckpointRestoreEvent) -> Result<bool, ProviderError> {
        self.inner.create_restore_event(event).await
    }

    async fn delete_restore_event(&self, id: &str) -> Result<bool, ProviderError> {
        self.inner.delete_restore_event(id).await
    }
}
