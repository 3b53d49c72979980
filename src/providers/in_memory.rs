use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

use super::{Lease, MessageBody, NewMessage, ProviderError, QueueMessage, QueueScope, Store, WorkQueue};
use crate::model::{
    AttemptPatch, BackgroundWorker, BatchItemStatus, BatchStatus, BatchTaskRun, BatchTaskRunItem, Checkpoint,
    CheckpointEventKind, CheckpointRestoreEvent, RunPatch, RuntimeEnvironment, TaskQueue, TaskRun, TaskRunAttempt,
    TaskRunDependency,
};
use crate::status::{AttemptStatus, RunStatus};

#[derive(Default)]
struct StoreState {
    environments: HashMap<String, RuntimeEnvironment>,
    queues: HashMap<(String, String), TaskQueue>,
    workers: HashMap<String, BackgroundWorker>,
    runs: HashMap<String, TaskRun>,
    attempts: HashMap<String, TaskRunAttempt>,
    dependencies: HashMap<String, TaskRunDependency>,
    batches: HashMap<String, BatchTaskRun>,
    batch_items: HashMap<String, BatchTaskRunItem>,
    checkpoints: HashMap<String, Checkpoint>,
    checkpoint_events: HashMap<String, CheckpointRestoreEvent>,
}

/// Reference [`Store`]: every call holds one lock, so multi-row operations are atomic.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn duplicate(operation: &str, id: &str) -> ProviderError {
    ProviderError::permanent(operation, format!("duplicate id: {id}"))
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_environment(&self, environment: RuntimeEnvironment) -> Result<(), ProviderError> {
        self.inner
            .lock()
            .await
            .environments
            .insert(environment.id.clone(), environment);
        Ok(())
    }

    async fn get_environment(&self, id: &str) -> Result<Option<RuntimeEnvironment>, ProviderError> {
        Ok(self.inner.lock().await.environments.get(id).cloned())
    }

    async fn upsert_queue(&self, queue: TaskQueue) -> Result<TaskQueue, ProviderError> {
        let mut g = self.inner.lock().await;
        let key = (queue.environment_id.clone(), queue.name.clone());
        let stored = g.queues.entry(key).or_insert(queue.clone());
        stored.concurrency_limit = queue.concurrency_limit;
        Ok(stored.clone())
    }

    async fn get_queue(&self, environment_id: &str, name: &str) -> Result<Option<TaskQueue>, ProviderError> {
        let g = self.inner.lock().await;
        Ok(g.queues.get(&(environment_id.to_string(), name.to_string())).cloned())
    }

    async fn create_worker(&self, worker: BackgroundWorker) -> Result<(), ProviderError> {
        let mut g = self.inner.lock().await;
        if g.workers.contains_key(&worker.id) {
            return Err(duplicate("create_worker", &worker.id));
        }
        g.workers.insert(worker.id.clone(), worker);
        Ok(())
    }

    async fn get_worker(&self, id: &str) -> Result<Option<BackgroundWorker>, ProviderError> {
        Ok(self.inner.lock().await.workers.get(id).cloned())
    }

    async fn list_workers(&self, environment_id: &str) -> Result<Vec<BackgroundWorker>, ProviderError> {
        let g = self.inner.lock().await;
        let mut out: Vec<_> = g
            .workers
            .values()
            .filter(|w| w.environment_id == environment_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn set_worker_deprecated(&self, id: &str) -> Result<bool, ProviderError> {
        let mut g = self.inner.lock().await;
        match g.workers.get_mut(id) {
            Some(w) if !w.deprecated => {
                w.deprecated = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn create_run(&self, run: TaskRun) -> Result<(), ProviderError> {
        let mut g = self.inner.lock().await;
        if g.runs.contains_key(&run.id) {
            return Err(duplicate("create_run", &run.id));
        }
        g.runs.insert(run.id.clone(), run);
        Ok(())
    }

    async fn get_run(&self, id: &str) -> Result<Option<TaskRun>, ProviderError> {
        Ok(self.inner.lock().await.runs.get(id).cloned())
    }

    async fn get_run_by_friendly_id(&self, friendly_id: &str) -> Result<Option<TaskRun>, ProviderError> {
        let g = self.inner.lock().await;
        Ok(g.runs.values().find(|r| r.friendly_id == friendly_id).cloned())
    }

    async fn find_run_by_idempotency_key(
        &self,
        environment_id: &str,
        task_identifier: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRun>, ProviderError> {
        let g = self.inner.lock().await;
        Ok(g.runs
            .values()
            .find(|r| {
                r.environment_id == environment_id
                    && r.task_identifier == task_identifier
                    && r.idempotency_key.as_deref() == Some(key)
                    && r.idempotency_key_expires_at.is_none_or(|exp| exp > now)
            })
            .cloned())
    }

    async fn list_runs_with_status(
        &self,
        environment_id: &str,
        status: RunStatus,
    ) -> Result<Vec<TaskRun>, ProviderError> {
        let g = self.inner.lock().await;
        let mut out: Vec<_> = g
            .runs
            .values()
            .filter(|r| r.environment_id == environment_id && r.status == status)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn update_run(
        &self,
        id: &str,
        expected: &[RunStatus],
        patch: RunPatch,
    ) -> Result<Option<TaskRun>, ProviderError> {
        let mut g = self.inner.lock().await;
        match g.runs.get_mut(id) {
            Some(run) if expected.contains(&run.status) => {
                patch.apply(run, Utc::now());
                Ok(Some(run.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn lock_run_and_create_attempt(
        &self,
        run_id: &str,
        expected: &[RunStatus],
        run_patch: RunPatch,
        attempt: TaskRunAttempt,
    ) -> Result<Option<(TaskRun, TaskRunAttempt)>, ProviderError> {
        let mut g = self.inner.lock().await;
        if g.attempts.contains_key(&attempt.id) {
            return Err(duplicate("lock_run_and_create_attempt", &attempt.id));
        }
        let open_attempt = g
            .attempts
            .values()
            .any(|a| a.run_id == run_id && !a.status.is_final());
        if open_attempt {
            return Ok(None);
        }
        let Some(run) = g.runs.get_mut(run_id) else {
            return Ok(None);
        };
        if !expected.contains(&run.status) {
            return Ok(None);
        }
        run_patch.apply(run, Utc::now());
        let run = run.clone();
        g.attempts.insert(attempt.id.clone(), attempt.clone());
        Ok(Some((run, attempt)))
    }

    async fn revert_attempt(&self, attempt_id: &str) -> Result<Option<TaskRun>, ProviderError> {
        let mut g = self.inner.lock().await;
        let Some(attempt) = g.attempts.remove(attempt_id) else {
            return Ok(None);
        };
        let Some(run) = g.runs.get_mut(&attempt.run_id) else {
            return Ok(None);
        };
        RunPatch {
            status: Some(RunStatus::Pending),
            locked_to_version_id: Some(None),
            locked_by_id: Some(None),
            locked_at: Some(None),
            attempt_count: Some(run.attempt_count.saturating_sub(1)),
            ..Default::default()
        }
        .apply(run, Utc::now());
        Ok(Some(run.clone()))
    }

    async fn get_attempt(&self, id: &str) -> Result<Option<TaskRunAttempt>, ProviderError> {
        Ok(self.inner.lock().await.attempts.get(id).cloned())
    }

    async fn list_attempts(&self, run_id: &str) -> Result<Vec<TaskRunAttempt>, ProviderError> {
        let g = self.inner.lock().await;
        let mut out: Vec<_> = g.attempts.values().filter(|a| a.run_id == run_id).cloned().collect();
        out.sort_by_key(|a| a.number);
        Ok(out)
    }

    async fn update_attempt(
        &self,
        id: &str,
        expected: &[AttemptStatus],
        patch: AttemptPatch,
    ) -> Result<Option<TaskRunAttempt>, ProviderError> {
        let mut g = self.inner.lock().await;
        match g.attempts.get_mut(id) {
            Some(attempt) if expected.contains(&attempt.status) => {
                patch.apply(attempt, Utc::now());
                Ok(Some(attempt.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn create_dependency(&self, dependency: TaskRunDependency) -> Result<(), ProviderError> {
        let mut g = self.inner.lock().await;
        let taken = g
            .dependencies
            .values()
            .any(|d| d.task_run_id == dependency.task_run_id);
        if taken || g.dependencies.contains_key(&dependency.id) {
            return Err(duplicate("create_dependency", &dependency.task_run_id));
        }
        g.dependencies.insert(dependency.id.clone(), dependency);
        Ok(())
    }

    async fn get_dependency(&self, id: &str) -> Result<Option<TaskRunDependency>, ProviderError> {
        Ok(self.inner.lock().await.dependencies.get(id).cloned())
    }

    async fn dependency_for_run(&self, task_run_id: &str) -> Result<Option<TaskRunDependency>, ProviderError> {
        let g = self.inner.lock().await;
        Ok(g.dependencies.values().find(|d| d.task_run_id == task_run_id).cloned())
    }

    async fn dependencies_of_attempt(&self, attempt_id: &str) -> Result<Vec<TaskRunDependency>, ProviderError> {
        let g = self.inner.lock().await;
        let mut out: Vec<_> = g
            .dependencies
            .values()
            .filter(|d| d.dependent_attempt_id.as_deref() == Some(attempt_id))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn set_dependency_checkpoint_event(&self, id: &str, event_id: &str) -> Result<bool, ProviderError> {
        let mut g = self.inner.lock().await;
        match g.dependencies.get_mut(id) {
            Some(d) => {
                d.checkpoint_event_id = Some(event_id.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_dependency_resumed(&self, id: &str, at: DateTime<Utc>) -> Result<bool, ProviderError> {
        let mut g = self.inner.lock().await;
        match g.dependencies.get_mut(id) {
            Some(d) if d.resumed_at.is_none() => {
                d.resumed_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn create_batch(&self, batch: BatchTaskRun, items: Vec<BatchTaskRunItem>) -> Result<(), ProviderError> {
        let mut g = self.inner.lock().await;
        if g.batches.contains_key(&batch.id) {
            return Err(duplicate("create_batch", &batch.id));
        }
        for item in items {
            g.batch_items.insert(item.id.clone(), item);
        }
        g.batches.insert(batch.id.clone(), batch);
        Ok(())
    }

    async fn get_batch(&self, id: &str) -> Result<Option<BatchTaskRun>, ProviderError> {
        Ok(self.inner.lock().await.batches.get(id).cloned())
    }

    async fn get_batch_by_friendly_id(&self, friendly_id: &str) -> Result<Option<BatchTaskRun>, ProviderError> {
        let g = self.inner.lock().await;
        Ok(g.batches.values().find(|b| b.friendly_id == friendly_id).cloned())
    }

    async fn batches_of_attempt(&self, attempt_id: &str) -> Result<Vec<BatchTaskRun>, ProviderError> {
        let g = self.inner.lock().await;
        Ok(g.batches
            .values()
            .filter(|b| b.dependent_attempt_id.as_deref() == Some(attempt_id))
            .cloned()
            .collect())
    }

    async fn list_batch_items(&self, batch_id: &str) -> Result<Vec<BatchTaskRunItem>, ProviderError> {
        let g = self.inner.lock().await;
        let mut out: Vec<_> = g
            .batch_items
            .values()
            .filter(|i| i.batch_id == batch_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn finish_batch_item(
        &self,
        batch_id: &str,
        task_run_id: &str,
        status: BatchItemStatus,
        attempt_id: Option<&str>,
    ) -> Result<Option<BatchTaskRunItem>, ProviderError> {
        let mut g = self.inner.lock().await;
        let item = g
            .batch_items
            .values_mut()
            .find(|i| i.batch_id == batch_id && i.task_run_id == task_run_id);
        match item {
            Some(item) if item.status == BatchItemStatus::Pending => {
                item.status = status;
                item.task_run_attempt_id = attempt_id.map(str::to_string);
                Ok(Some(item.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn set_batch_checkpoint_event(&self, id: &str, event_id: &str) -> Result<bool, ProviderError> {
        let mut g = self.inner.lock().await;
        match g.batches.get_mut(id) {
            Some(b) => {
                b.checkpoint_event_id = Some(event_id.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_batch_resumed(&self, id: &str, at: DateTime<Utc>) -> Result<bool, ProviderError> {
        let mut g = self.inner.lock().await;
        match g.batches.get_mut(id) {
            Some(b) if b.resumed_at.is_none() => {
                b.resumed_at = Some(at);
                b.status = BatchStatus::Completed;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn create_checkpoint(
        &self,
        checkpoint: Checkpoint,
        event: CheckpointRestoreEvent,
    ) -> Result<(), ProviderError> {
        let mut g = self.inner.lock().await;
        if g.checkpoints.contains_key(&checkpoint.id) {
            return Err(duplicate("create_checkpoint", &checkpoint.id));
        }
        g.checkpoints.insert(checkpoint.id.clone(), checkpoint);
        g.checkpoint_events.insert(event.id.clone(), event);
        Ok(())
    }

    async fn get_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>, ProviderError> {
        Ok(self.inner.lock().await.checkpoints.get(id).cloned())
    }

    async fn get_checkpoint_event(&self, id: &str) -> Result<Option<CheckpointRestoreEvent>, ProviderError> {
        Ok(self.inner.lock().await.checkpoint_events.get(id).cloned())
    }

    async fn create_restore_event(&self, event: CheckpointRestoreEvent) -> Result<bool, ProviderError> {
        let mut g = self.inner.lock().await;
        let exists = g
            .checkpoint_events
            .values()
            .any(|e| e.checkpoint_id == event.checkpoint_id && e.kind == CheckpointEventKind::Restore);
        if exists {
            return Ok(false);
        }
        g.checkpoint_events.insert(event.id.clone(), event);
        Ok(true)
    }

    async fn checkpoint_event_for(&self, checkpoint_id: &str) -> Result<Option<CheckpointRestoreEvent>, ProviderError> {
        let g = self.inner.lock().await;
        Ok(g
            .checkpoint_events
            .values()
            .find(|e| e.checkpoint_id == checkpoint_id && e.kind == CheckpointEventKind::Checkpoint)
            .cloned())
    }

    async fn delete_restore_event(&self, id: &str) -> Result<bool, ProviderError> {
        let mut g = self.inner.lock().await;
        let is_restore = g
            .checkpoint_events
            .get(id)
            .is_some_and(|e| e.kind == CheckpointEventKind::Restore);
        Ok(is_restore && g.checkpoint_events.remove(id).is_some())
    }
}

// ---------------------------------------------------------------------------
// Work queue
// ---------------------------------------------------------------------------

/// Reference [`WorkQueue`] keeping messages in a map keyed by run id.
#[derive(Default)]
pub struct InMemoryWorkQueue {
    messages: Mutex<HashMap<String, QueueMessage>>,
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored messages, leased or not.
    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.lock().await.is_empty()
    }
}

/// `from` plus `d`, saturating at the latest representable instant.
fn lease_until(from: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| from.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(&self, message: NewMessage) -> Result<(), ProviderError> {
        let now = Utc::now();
        let body = message.body.encode()?;
        let mut g = self.messages.lock().await;
        let delivery_count = g.get(&message.id).map(|m| m.delivery_count).unwrap_or(0);
        g.insert(
            message.id.clone(),
            QueueMessage {
                id: message.id,
                scope: message.scope,
                queue: message.queue,
                body,
                priority_ms: message.priority_ms,
                concurrency_key: message.concurrency_key,
                available_at: message.available_at.unwrap_or(now),
                lease: None,
                delivery_count,
                enqueued_at: now,
            },
        );
        Ok(())
    }

    async fn dequeue(
        &self,
        scope: &QueueScope,
        visibility_timeout: Duration,
    ) -> Result<Option<QueueMessage>, ProviderError> {
        let now = Utc::now();
        let mut g = self.messages.lock().await;
        let next = g
            .values()
            .filter(|m| &m.scope == scope && m.is_visible(now))
            .min_by(|a, b| a.score().cmp(&b.score()).then(a.enqueued_at.cmp(&b.enqueued_at)))
            .map(|m| m.id.clone());
        let Some(id) = next else {
            return Ok(None);
        };
        let Some(message) = g.get_mut(&id) else {
            return Ok(None);
        };
        message.lease = Some(Lease::Until(lease_until(now, visibility_timeout)));
        message.delivery_count += 1;
        Ok(Some(message.clone()))
    }

    async fn acknowledge(&self, message_id: &str) -> Result<bool, ProviderError> {
        Ok(self.messages.lock().await.remove(message_id).is_some())
    }

    async fn nack(&self, message_id: &str, not_before: Option<DateTime<Utc>>) -> Result<bool, ProviderError> {
        let mut g = self.messages.lock().await;
        match g.get_mut(message_id) {
            Some(m) => {
                m.lease = None;
                m.available_at = not_before.unwrap_or_else(Utc::now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn heartbeat(&self, message_id: &str, extension: Duration) -> Result<bool, ProviderError> {
        let mut g = self.messages.lock().await;
        match g.get_mut(message_id) {
            Some(m) if m.lease.is_some() => {
                m.lease = Some(Lease::Until(lease_until(Utc::now(), extension)));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel_heartbeat(&self, message_id: &str) -> Result<bool, ProviderError> {
        let mut g = self.messages.lock().await;
        match g.get_mut(message_id) {
            Some(m) if is_pending_resume(&m.body) => Ok(false),
            Some(m) => {
                m.lease = Some(Lease::Parked);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn replace(
        &self,
        message_id: &str,
        body: MessageBody,
        available_at: Option<DateTime<Utc>>,
    ) -> Result<bool, ProviderError> {
        let encoded = body.encode()?;
        let mut g = self.messages.lock().await;
        match g.get_mut(message_id) {
            Some(m) => {
                m.body = encoded;
                if let Some(at) = available_at {
                    m.lease = None;
                    m.available_at = at;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn peek(&self, message_id: &str) -> Result<Option<QueueMessage>, ProviderError> {
        Ok(self.messages.lock().await.get(message_id).cloned())
    }
}

fn is_pending_resume(raw: &str) -> bool {
    matches!(MessageBody::decode(raw), Ok(MessageBody::Resume { .. }))
}
