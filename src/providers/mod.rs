//! Storage and queue abstractions.
//!
//! The engine talks to two providers:
//!
//! - [`Store`]: durable rows for runs, attempts, workers, dependencies,
//!   batches and checkpoints. Every status write is guarded by the set of
//!   statuses the caller expects the row to be in; a guard miss returns
//!   `Ok(None)` and leaves the row untouched.
//! - [`WorkQueue`]: a peek-lock queue keyed by run id. A dequeued message is
//!   invisible until its lease expires, it is acknowledged, nacked, or replaced.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::model::{
    AttemptPatch, BackgroundWorker, BatchTaskRun, BatchTaskRunItem, Checkpoint, CheckpointRestoreEvent, RunPatch,
    RuntimeEnvironment, TaskQueue, TaskRun, TaskRunAttempt, TaskRunDependency,
};
use crate::status::{AttemptStatus, RunStatus};

pub mod error;
pub mod in_memory;
pub mod sqlite;

pub use error::ProviderError;

// ---------------------------------------------------------------------------
// Queue types
// ---------------------------------------------------------------------------

/// Which consumers may dequeue a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueScope {
    /// Development environments: only that environment's session consumers.
    Environment { environment_id: String },
    /// Every non-development environment shares one scope.
    Shared,
}

impl QueueScope {
    pub fn environment(id: impl Into<String>) -> Self {
        QueueScope::Environment {
            environment_id: id.into(),
        }
    }

    /// Stable string form used as a column value.
    pub fn key(&self) -> String {
        match self {
            QueueScope::Environment { environment_id } => format!("env:{environment_id}"),
            QueueScope::Shared => "shared".to_string(),
        }
    }
}

/// Message body. The message id is always the run id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageBody {
    #[serde(rename_all = "camelCase")]
    Execute {
        task_identifier: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checkpoint_event_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Resume {
        completed_attempt_ids: Vec<String>,
        resumable_attempt_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checkpoint_event_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ResumeAfterDuration {
        resumable_attempt_id: String,
        checkpoint_event_id: String,
    },
}

impl MessageBody {
    pub fn encode(&self) -> Result<String, ProviderError> {
        serde_json::to_string(self).map_err(|e| ProviderError::permanent("encode_body", e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, ProviderError> {
        serde_json::from_str(raw).map_err(|e| ProviderError::permanent("decode_body", e.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Execute { .. } => "EXECUTE",
            MessageBody::Resume { .. } => "RESUME",
            MessageBody::ResumeAfterDuration { .. } => "RESUME_AFTER_DURATION",
        }
    }
}

/// A message as handed to [`WorkQueue::enqueue`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub id: String,
    pub scope: QueueScope,
    pub queue: String,
    pub body: MessageBody,
    pub priority_ms: i64,
    pub concurrency_key: Option<String>,
    /// Earliest visibility; `None` means now.
    pub available_at: Option<DateTime<Utc>>,
}

/// Lease held on a dequeued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lease {
    /// Redelivered once the deadline passes.
    Until(DateTime<Utc>),
    /// Held with no deadline after heartbeats were cancelled.
    Parked,
}

/// A message as stored or returned from [`WorkQueue::dequeue`].
///
/// `body` is the raw encoding so undecodable bodies still reach the consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub id: String,
    pub scope: QueueScope,
    pub queue: String,
    pub body: String,
    pub priority_ms: i64,
    pub concurrency_key: Option<String>,
    pub available_at: DateTime<Utc>,
    pub lease: Option<Lease>,
    pub delivery_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueMessage {
    pub fn decode(&self) -> Result<MessageBody, ProviderError> {
        MessageBody::decode(&self.body)
    }

    /// Dequeue ordering key: lower is served first.
    pub fn score(&self) -> i64 {
        self.available_at.timestamp_millis() - self.priority_ms
    }

    pub fn is_visible(&self, now: DateTime<Utc>) -> bool {
        match self.lease {
            None => self.available_at <= now,
            Some(Lease::Until(deadline)) => deadline <= now,
            Some(Lease::Parked) => false,
        }
    }
}

/// Peek-lock work queue. Message id == run id, so at most one message per run exists.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Insert or overwrite the message with `message.id`, clearing any lease.
    async fn enqueue(&self, message: NewMessage) -> Result<(), ProviderError>;

    /// Lease the visible message with the lowest score in `scope`.
    async fn dequeue(&self, scope: &QueueScope, visibility_timeout: Duration)
        -> Result<Option<QueueMessage>, ProviderError>;

    /// Delete the message. Returns false when it no longer exists.
    async fn acknowledge(&self, message_id: &str) -> Result<bool, ProviderError>;

    /// Release the lease; the message becomes visible at `not_before` (or now).
    async fn nack(&self, message_id: &str, not_before: Option<DateTime<Utc>>) -> Result<bool, ProviderError>;

    /// Extend the lease deadline to now + `extension`.
    async fn heartbeat(&self, message_id: &str, extension: Duration) -> Result<bool, ProviderError>;

    /// Keep the message leased but drop the deadline so it is never redelivered
    /// until it is replaced, nacked or re-enqueued. A message whose body is
    /// already a RESUME stays as it is and `false` is returned.
    async fn cancel_heartbeat(&self, message_id: &str) -> Result<bool, ProviderError>;

    /// Swap the body. With `available_at` the lease is released and the message
    /// becomes visible at that time; without it the lease state is kept.
    async fn replace(
        &self,
        message_id: &str,
        body: MessageBody,
        available_at: Option<DateTime<Utc>>,
    ) -> Result<bool, ProviderError>;

    async fn peek(&self, message_id: &str) -> Result<Option<QueueMessage>, ProviderError>;
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Durable rows owned by the engine.
#[async_trait]
pub trait Store: Send + Sync {
    // Environments, queues and workers --------------------------------------

    async fn upsert_environment(&self, environment: RuntimeEnvironment) -> Result<(), ProviderError>;
    async fn get_environment(&self, id: &str) -> Result<Option<RuntimeEnvironment>, ProviderError>;

    async fn upsert_queue(&self, queue: TaskQueue) -> Result<TaskQueue, ProviderError>;
    async fn get_queue(&self, environment_id: &str, name: &str) -> Result<Option<TaskQueue>, ProviderError>;

    async fn create_worker(&self, worker: BackgroundWorker) -> Result<(), ProviderError>;
    async fn get_worker(&self, id: &str) -> Result<Option<BackgroundWorker>, ProviderError>;
    async fn list_workers(&self, environment_id: &str) -> Result<Vec<BackgroundWorker>, ProviderError>;
    async fn set_worker_deprecated(&self, id: &str) -> Result<bool, ProviderError>;

    // Runs ------------------------------------------------------------------

    async fn create_run(&self, run: TaskRun) -> Result<(), ProviderError>;
    async fn get_run(&self, id: &str) -> Result<Option<TaskRun>, ProviderError>;
    async fn get_run_by_friendly_id(&self, friendly_id: &str) -> Result<Option<TaskRun>, ProviderError>;

    /// Run with a live (unexpired) idempotency key for this task.
    async fn find_run_by_idempotency_key(
        &self,
        environment_id: &str,
        task_identifier: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRun>, ProviderError>;

    async fn list_runs_with_status(
        &self,
        environment_id: &str,
        status: RunStatus,
    ) -> Result<Vec<TaskRun>, ProviderError>;

    /// Apply `patch` when the run's status is in `expected`.
    async fn update_run(
        &self,
        id: &str,
        expected: &[RunStatus],
        patch: RunPatch,
    ) -> Result<Option<TaskRun>, ProviderError>;

    // Attempts --------------------------------------------------------------

    /// Atomically apply `run_patch` (guarded on `expected`) and insert `attempt`.
    async fn lock_run_and_create_attempt(
        &self,
        run_id: &str,
        expected: &[RunStatus],
        run_patch: RunPatch,
        attempt: TaskRunAttempt,
    ) -> Result<Option<(TaskRun, TaskRunAttempt)>, ProviderError>;

    /// Delete a just-created attempt and put its run back to PENDING, unlocked,
    /// with the attempt counter decremented.
    async fn revert_attempt(&self, attempt_id: &str) -> Result<Option<TaskRun>, ProviderError>;

    async fn get_attempt(&self, id: &str) -> Result<Option<TaskRunAttempt>, ProviderError>;
    async fn list_attempts(&self, run_id: &str) -> Result<Vec<TaskRunAttempt>, ProviderError>;

    /// Highest-numbered attempt of a run.
    async fn latest_attempt(&self, run_id: &str) -> Result<Option<TaskRunAttempt>, ProviderError> {
        Ok(self.list_attempts(run_id).await?.into_iter().max_by_key(|a| a.number))
    }

    async fn update_attempt(
        &self,
        id: &str,
        expected: &[AttemptStatus],
        patch: AttemptPatch,
    ) -> Result<Option<TaskRunAttempt>, ProviderError>;

    // Dependencies ----------------------------------------------------------

    async fn create_dependency(&self, dependency: TaskRunDependency) -> Result<(), ProviderError>;
    async fn get_dependency(&self, id: &str) -> Result<Option<TaskRunDependency>, ProviderError>;
    /// Dependency whose child is `task_run_id`.
    async fn dependency_for_run(&self, task_run_id: &str) -> Result<Option<TaskRunDependency>, ProviderError>;
    /// Single dependencies an attempt waits on.
    async fn dependencies_of_attempt(&self, attempt_id: &str) -> Result<Vec<TaskRunDependency>, ProviderError>;
    async fn set_dependency_checkpoint_event(&self, id: &str, event_id: &str) -> Result<bool, ProviderError>;
    /// Set `resumed_at` when unset. Only the first caller gets `true`.
    async fn mark_dependency_resumed(&self, id: &str, at: DateTime<Utc>) -> Result<bool, ProviderError>;

    // Batches ---------------------------------------------------------------

    async fn create_batch(&self, batch: BatchTaskRun, items: Vec<BatchTaskRunItem>) -> Result<(), ProviderError>;
    async fn get_batch(&self, id: &str) -> Result<Option<BatchTaskRun>, ProviderError>;
    async fn get_batch_by_friendly_id(&self, friendly_id: &str) -> Result<Option<BatchTaskRun>, ProviderError>;
    async fn batches_of_attempt(&self, attempt_id: &str) -> Result<Vec<BatchTaskRun>, ProviderError>;
    async fn list_batch_items(&self, batch_id: &str) -> Result<Vec<BatchTaskRunItem>, ProviderError>;
    /// Finish a PENDING item. Returns the item when the write happened.
    async fn finish_batch_item(
        &self,
        batch_id: &str,
        task_run_id: &str,
        status: crate::model::BatchItemStatus,
        attempt_id: Option<&str>,
    ) -> Result<Option<BatchTaskRunItem>, ProviderError>;
    async fn set_batch_checkpoint_event(&self, id: &str, event_id: &str) -> Result<bool, ProviderError>;
    /// Set the batch COMPLETED with `resumed_at` when unset. Only the first caller gets `true`.
    async fn mark_batch_resumed(&self, id: &str, at: DateTime<Utc>) -> Result<bool, ProviderError>;

    // Checkpoints -----------------------------------------------------------

    /// Persist the checkpoint and its CHECKPOINT event together.
    async fn create_checkpoint(&self, checkpoint: Checkpoint, event: CheckpointRestoreEvent)
        -> Result<(), ProviderError>;
    async fn get_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>, ProviderError>;
    async fn get_checkpoint_event(&self, id: &str) -> Result<Option<CheckpointRestoreEvent>, ProviderError>;
    /// The CHECKPOINT event recorded with `checkpoint_id`.
    async fn checkpoint_event_for(&self, checkpoint_id: &str) -> Result<Option<CheckpointRestoreEvent>, ProviderError>;
    /// Insert the RESTORE event unless the checkpoint already has one.
    async fn create_restore_event(&self, event: CheckpointRestoreEvent) -> Result<bool, ProviderError>;
    /// Drop a RESTORE event whose restore never reached the provider.
    async fn delete_restore_event(&self, id: &str) -> Result<bool, ProviderError>;
}
