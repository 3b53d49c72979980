//! Durable rows and the execution payload built from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::errors::TaskRunError;
use crate::machines::{MachineConfig, MachinePreset, MachinePresetName};
use crate::retry::RetryOptions;
use crate::status::{AttemptStatus, RunStatus};

pub type Timestamp = DateTime<Utc>;

/// One triggered unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRun {
    pub id: String,
    pub friendly_id: String,
    pub task_identifier: String,
    pub queue: String,
    pub status: RunStatus,
    pub payload: Option<String>,
    pub payload_type: String,
    pub idempotency_key: Option<String>,
    pub idempotency_key_expires_at: Option<Timestamp>,
    /// Milliseconds of queue-time advantage over runs enqueued at the same instant.
    pub priority_ms: i64,
    pub tags: Vec<String>,
    pub concurrency_key: Option<String>,
    /// Set by an OOM upgrade or at trigger time; otherwise the task config decides.
    pub machine_preset: Option<MachinePresetName>,
    pub ttl_secs: Option<u64>,
    pub locked_to_version_id: Option<String>,
    pub locked_by_id: Option<String>,
    pub locked_at: Option<Timestamp>,
    pub attempt_count: u32,
    pub start_attempt_at_zero: bool,
    pub max_duration_secs: Option<u64>,
    pub environment_id: String,
    pub is_test: bool,
    pub output: Option<String>,
    pub output_type: String,
    pub error: Option<TaskRunError>,
    pub created_at: Timestamp,
    pub queued_at: Option<Timestamp>,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub expired_at: Option<Timestamp>,
    pub updated_at: Timestamp,
}

impl TaskRun {
    /// Number the next attempt will carry.
    pub fn next_attempt_number(&self) -> u32 {
        if self.start_attempt_at_zero {
            self.attempt_count
        } else {
            self.attempt_count + 1
        }
    }

    pub fn ttl_elapsed(&self, now: Timestamp) -> bool {
        match (self.ttl_secs, self.queued_at) {
            (Some(ttl), Some(queued)) => now >= queued + chrono::Duration::seconds(ttl as i64),
            _ => false,
        }
    }
}

/// Partial update applied by a guarded run write. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct RunPatch {
    pub status: Option<RunStatus>,
    pub locked_to_version_id: Option<Option<String>>,
    pub locked_by_id: Option<Option<String>>,
    pub locked_at: Option<Option<Timestamp>>,
    pub attempt_count: Option<u32>,
    pub machine_preset: Option<MachinePresetName>,
    pub output: Option<Option<String>>,
    pub output_type: Option<String>,
    pub error: Option<Option<TaskRunError>>,
    pub queued_at: Option<Timestamp>,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub expired_at: Option<Timestamp>,
}

impl RunPatch {
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn apply(self, run: &mut TaskRun, now: Timestamp) {
        if let Some(v) = self.status {
            run.status = v;
        }
        if let Some(v) = self.locked_to_version_id {
            run.locked_to_version_id = v;
        }
        if let Some(v) = self.locked_by_id {
            run.locked_by_id = v;
        }
        if let Some(v) = self.locked_at {
            run.locked_at = v;
        }
        if let Some(v) = self.attempt_count {
            run.attempt_count = v;
        }
        if let Some(v) = self.machine_preset {
            run.machine_preset = Some(v);
        }
        if let Some(v) = self.output {
            run.output = v;
        }
        if let Some(v) = self.output_type {
            run.output_type = v;
        }
        if let Some(v) = self.error {
            run.error = v;
        }
        if let Some(v) = self.queued_at {
            run.queued_at = Some(v);
        }
        if let Some(v) = self.started_at {
            run.started_at.get_or_insert(v);
        }
        if let Some(v) = self.completed_at {
            run.completed_at = Some(v);
        }
        if let Some(v) = self.expired_at {
            run.expired_at = Some(v);
        }
        run.updated_at = now;
    }
}

/// One execution try of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunAttempt {
    pub id: String,
    pub friendly_id: String,
    pub run_id: String,
    pub number: u32,
    pub status: AttemptStatus,
    pub background_worker_id: String,
    pub background_worker_task_id: String,
    pub queue_id: Option<String>,
    pub machine_preset: MachinePresetName,
    pub checkpoint_id: Option<String>,
    pub error: Option<TaskRunError>,
    pub output: Option<String>,
    pub output_type: String,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, Default)]
pub struct AttemptPatch {
    pub status: Option<AttemptStatus>,
    pub output: Option<Option<String>>,
    pub output_type: Option<String>,
    pub error: Option<Option<TaskRunError>>,
    pub checkpoint_id: Option<String>,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}

impl AttemptPatch {
    pub fn status(status: AttemptStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn apply(self, attempt: &mut TaskRunAttempt, now: Timestamp) {
        if let Some(v) = self.status {
            attempt.status = v;
        }
        if let Some(v) = self.output {
            attempt.output = v;
        }
        if let Some(v) = self.output_type {
            attempt.output_type = v;
        }
        if let Some(v) = self.error {
            attempt.error = v;
        }
        if let Some(v) = self.checkpoint_id {
            attempt.checkpoint_id = Some(v);
        }
        if let Some(v) = self.started_at {
            attempt.started_at = Some(v);
        }
        if let Some(v) = self.completed_at {
            attempt.completed_at = Some(v);
        }
        attempt.updated_at = now;
    }
}

/// A deployed worker version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundWorker {
    pub id: String,
    pub friendly_id: String,
    pub environment_id: String,
    /// Dot-separated integers, e.g. `20240101.3`.
    pub version: String,
    /// Semver of the SDK the worker was built with.
    pub sdk_version: String,
    pub deprecated: bool,
    pub supports_lazy_attempts: bool,
    pub tasks: Vec<BackgroundWorkerTask>,
    pub created_at: Timestamp,
}

impl BackgroundWorker {
    pub fn task(&self, slug: &str) -> Option<&BackgroundWorkerTask> {
        self.tasks.iter().find(|t| t.slug == slug)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundWorkerTask {
    pub id: String,
    pub slug: String,
    pub file_path: String,
    pub export_name: String,
    pub retry_config: Option<RetryOptions>,
    pub machine_config: Option<MachineConfig>,
    pub max_duration_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvironmentType {
    Development,
    Staging,
    Preview,
    Production,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationRef {
    pub id: String,
    pub slug: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRef {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub external_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeEnvironment {
    pub id: String,
    pub slug: String,
    #[serde(rename = "type")]
    pub env_type: EnvironmentType,
    pub organization: OrganizationRef,
    pub project: ProjectRef,
}

impl RuntimeEnvironment {
    pub fn is_development(&self) -> bool {
        self.env_type == EnvironmentType::Development
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskQueue {
    pub id: String,
    pub name: String,
    pub environment_id: String,
    pub concurrency_limit: Option<u32>,
}

/// Links a child run to the attempt (or batch) waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunDependency {
    pub id: String,
    pub task_run_id: String,
    pub dependent_attempt_id: Option<String>,
    pub dependent_batch_id: Option<String>,
    pub checkpoint_event_id: Option<String>,
    pub resumed_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Pending,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchTaskRun {
    pub id: String,
    pub friendly_id: String,
    pub environment_id: String,
    pub status: BatchStatus,
    pub dependent_attempt_id: Option<String>,
    pub checkpoint_event_id: Option<String>,
    pub resumed_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchItemStatus {
    Pending,
    Completed,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchTaskRunItem {
    pub id: String,
    pub batch_id: String,
    pub task_run_id: String,
    pub status: BatchItemStatus,
    pub task_run_attempt_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointType {
    Docker,
    Kubernetes,
}

/// Why an attempt was suspended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointReason {
    Manual,
    WaitForDuration {
        ms: u64,
        now: i64,
    },
    #[serde(rename_all = "camelCase")]
    WaitForTask {
        friendly_id: String,
    },
    #[serde(rename_all = "camelCase")]
    WaitForBatch {
        batch_friendly_id: String,
    },
    #[serde(rename_all = "camelCase")]
    RetryingAfterFailure {
        attempt_number: u32,
    },
}

impl CheckpointReason {
    pub fn is_retry(&self) -> bool {
        matches!(self, CheckpointReason::RetryingAfterFailure { .. })
    }
}

/// Durable pointer to a suspended attempt image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: String,
    pub friendly_id: String,
    pub run_id: String,
    pub attempt_id: String,
    pub attempt_number: u32,
    pub location: String,
    pub image_ref: String,
    pub checkpoint_type: CheckpointType,
    pub reason: CheckpointReason,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointEventKind {
    Checkpoint,
    Restore,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRestoreEvent {
    pub id: String,
    pub checkpoint_id: String,
    pub run_id: String,
    pub attempt_id: String,
    pub kind: CheckpointEventKind,
    pub created_at: Timestamp,
}

/// Location a worker reports when it has frozen an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointLocation {
    pub location: String,
    pub image_ref: String,
    pub checkpoint_type: CheckpointType,
}

// ---------------------------------------------------------------------------
// Execution payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionTask {
    pub id: String,
    pub file_path: String,
    pub export_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionAttempt {
    pub id: String,
    pub number: u32,
    pub started_at: Option<Timestamp>,
    pub status: AttemptStatus,
    pub background_worker_id: String,
    pub background_worker_task_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRun {
    pub id: String,
    pub friendly_id: String,
    pub payload: Option<String>,
    pub payload_type: String,
    pub tags: Vec<String>,
    pub is_test: bool,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub idempotency_key: Option<String>,
    pub max_attempts: Option<u32>,
    pub max_duration_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionQueue {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEnvironment {
    pub id: String,
    pub slug: String,
    #[serde(rename = "type")]
    pub env_type: EnvironmentType,
}

/// Everything a worker needs to run one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunExecution {
    pub task: ExecutionTask,
    pub attempt: ExecutionAttempt,
    pub run: ExecutionRun,
    pub queue: ExecutionQueue,
    pub environment: ExecutionEnvironment,
    pub organization: OrganizationRef,
    pub project: ProjectRef,
    pub batch_id: Option<String>,
    pub machine: MachinePreset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunExecutionPayload {
    pub execution: TaskRunExecution,
    pub environment: HashMap<String, String>,
}

/// Retry directive a worker attaches to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryDirective {
    /// Epoch milliseconds of the next attempt.
    pub timestamp: i64,
    pub delay: u64,
}

/// Result of one attempt as reported by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionResult {
    #[serde(rename_all = "camelCase")]
    Success {
        id: String,
        output: Option<String>,
        output_type: String,
    },
    #[serde(rename_all = "camelCase")]
    Failure {
        id: String,
        error: TaskRunError,
        #[serde(default)]
        retry: Option<RetryDirective>,
        #[serde(default)]
        skipped_retrying: bool,
    },
}

impl ExecutionResult {
    pub fn attempt_id(&self) -> &str {
        match self {
            ExecutionResult::Success { id, .. } | ExecutionResult::Failure { id, .. } => id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success { .. })
    }
}
