//! Attempt creation, revert and the single path into a final run status.

use serde_json::json;

use super::Engine;
use crate::errors::{EngineError, InternalErrorCode, TaskRunError};
use crate::friendly_id;
use crate::machines::MachinePresetName;
use crate::model::{
    AttemptPatch, BackgroundWorker, BackgroundWorkerTask, RunPatch, TaskQueue, TaskRun, TaskRunAttempt,
};
use crate::status::{AttemptStatus, RunStatus};

/// Fields written alongside a final status.
#[derive(Debug, Clone, Default)]
pub struct FinalizeDetails {
    pub error: Option<TaskRunError>,
    pub output: Option<String>,
    pub output_type: Option<String>,
    /// Fail outstanding non-final attempts when the status is a failure.
    pub fail_open_attempts: bool,
}

impl FinalizeDetails {
    pub fn failed(error: TaskRunError) -> Self {
        Self {
            error: Some(error),
            fail_open_attempts: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CrashOptions {
    /// Defaults to TASK_RUN_CRASHED.
    pub code: Option<InternalErrorCode>,
    pub message: Option<String>,
    /// Finish as SYSTEM_FAILURE instead of CRASHED.
    pub system_failure: bool,
}

/// Run statuses from which a new attempt may be created.
pub(crate) const EXECUTABLE: [RunStatus; 3] = [
    RunStatus::Pending,
    RunStatus::WaitingForDeploy,
    RunStatus::RetryingAfterFailure,
];

impl Engine {
    /// Lock `run` to `worker`/`task`, bump its attempt counter and insert the
    /// next attempt, all in one guarded write.
    ///
    /// Returns `None` when the run is no longer executable or still has an
    /// open attempt.
    pub async fn create_attempt(
        &self,
        run: &TaskRun,
        worker: &BackgroundWorker,
        task: &BackgroundWorkerTask,
        queue: Option<&TaskQueue>,
        machine: MachinePresetName,
    ) -> Result<Option<(TaskRun, TaskRunAttempt)>, EngineError> {
        let now = self.now();
        let attempt = TaskRunAttempt {
            id: friendly_id::internal_id(),
            friendly_id: friendly_id::generate("attempt"),
            run_id: run.id.clone(),
            number: run.next_attempt_number(),
            status: AttemptStatus::Executing,
            background_worker_id: worker.id.clone(),
            background_worker_task_id: task.id.clone(),
            queue_id: queue.map(|q| q.id.clone()),
            machine_preset: machine,
            checkpoint_id: None,
            error: None,
            output: None,
            output_type: "application/json".to_string(),
            started_at: Some(now),
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        let patch = RunPatch {
            status: Some(RunStatus::Executing),
            locked_to_version_id: Some(Some(worker.id.clone())),
            locked_by_id: Some(Some(task.id.clone())),
            locked_at: Some(Some(now)),
            attempt_count: Some(run.attempt_count + 1),
            started_at: Some(now),
            ..Default::default()
        };
        let created = self
            .store
            .lock_run_and_create_attempt(&run.id, &EXECUTABLE, patch, attempt)
            .await?;
        match &created {
            Some((run, attempt)) => {
                self.metrics.record_attempt_created();
                tracing::debug!(
                    target: "courier::lifecycle",
                    run_id = %run.id,
                    attempt_id = %attempt.id,
                    attempt_number = attempt.number,
                    worker_version = %worker.version,
                    "Attempt created"
                );
            }
            None => tracing::debug!(
                target: "courier::lifecycle",
                run_id = %run.id,
                status = %run.status,
                "Attempt creation rejected"
            ),
        }
        Ok(created)
    }

    /// Undo [`Engine::create_attempt`] after a failed dispatch.
    pub async fn revert_attempt(&self, attempt_id: &str) -> Result<Option<TaskRun>, EngineError> {
        let reverted = self.store.revert_attempt(attempt_id).await?;
        if let Some(run) = &reverted {
            tracing::debug!(
                target: "courier::lifecycle",
                run_id = %run.id,
                attempt_id = %attempt_id,
                "Attempt reverted"
            );
        }
        Ok(reverted)
    }

    /// Move a run into `status` (which must be final) exactly once.
    ///
    /// Writes the status guarded on non-final, acknowledges the run's queue
    /// message, fails open attempts for failed statuses and hands off to the
    /// dependency resolver. A run that is already final, or that moved out of
    /// the expected statuses, is returned as is.
    pub async fn finalize_run(
        &self,
        run_id: &str,
        status: RunStatus,
        details: FinalizeDetails,
    ) -> Result<TaskRun, EngineError> {
        self.finalize_run_from(run_id, &RunStatus::non_final(), status, details)
            .await
    }

    pub(crate) async fn finalize_run_from(
        &self,
        run_id: &str,
        expected: &[RunStatus],
        status: RunStatus,
        details: FinalizeDetails,
    ) -> Result<TaskRun, EngineError> {
        debug_assert!(status.is_final(), "{status} is not final");
        let now = self.now();
        let fail_open_attempts = details.fail_open_attempts && status.is_failed();
        let attempt_error = details.error.clone();
        let patch = RunPatch {
            status: Some(status),
            completed_at: Some(now),
            expired_at: (status == RunStatus::Expired).then_some(now),
            error: details.error.map(Some),
            output: details.output.map(Some),
            output_type: details.output_type,
            ..Default::default()
        };

        let Some(run) = self.store.update_run(run_id, expected, patch).await? else {
            let current = self
                .store
                .get_run(run_id)
                .await?
                .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
            if current.status.is_final() {
                tracing::debug!(
                    target: "courier::lifecycle",
                    run_id = %run_id,
                    status = %current.status,
                    requested = %status,
                    "Run already final"
                );
                self.queue.acknowledge(run_id).await?;
                return Ok(current);
            }
            tracing::warn!(
                target: "courier::lifecycle",
                run_id = %run_id,
                status = %current.status,
                requested = %status,
                "Finalize rejected"
            );
            return Ok(current);
        };

        self.queue.acknowledge(run_id).await?;

        if fail_open_attempts {
            for attempt in self.store.list_attempts(run_id).await? {
                if attempt.status.is_final() {
                    continue;
                }
                let patch = AttemptPatch {
                    status: Some(AttemptStatus::Failed),
                    error: Some(attempt_error.clone()),
                    completed_at: Some(now),
                    ..Default::default()
                };
                self.store
                    .update_attempt(&attempt.id, &AttemptStatus::non_final(), patch)
                    .await?;
                self.sessions.forget_attempt(&attempt.id).await;
            }
        }

        if status.is_failed() {
            self.metrics.record_run_failed();
        } else if status == RunStatus::CompletedSuccessfully {
            self.metrics.record_run_succeeded();
        }
        tracing::info!(
            target: "courier::lifecycle",
            run_id = %run.id,
            status = %status,
            attempt_count = run.attempt_count,
            "Run finalized"
        );

        self.resolve_dependencies(&run).await?;
        Ok(run)
    }

    /// Expire a queued run whose TTL elapsed before it started.
    pub async fn expire_run(&self, run_id: &str) -> Result<Option<TaskRun>, EngineError> {
        let expirable = [RunStatus::Pending, RunStatus::WaitingForDeploy];
        let Some(run) = self.store.get_run(run_id).await? else {
            return Err(EngineError::RunNotFound(run_id.to_string()));
        };
        if !expirable.contains(&run.status) {
            tracing::debug!(target: "courier::lifecycle", run_id = %run_id, status = %run.status, "Expire rejected");
            return Ok(None);
        }
        let run = self
            .finalize_run_from(run_id, &expirable, RunStatus::Expired, FinalizeDetails::default())
            .await?;
        if run.status != RunStatus::Expired {
            return Ok(None);
        }
        self.emit_event(&run.id, "expired", json!({ "ttlSecs": run.ttl_secs }))
            .await;
        Ok(Some(run))
    }

    /// Crash a live run. Rejected (Ok(None)) unless the run is crashable.
    pub async fn crash_run(&self, run_id: &str, options: CrashOptions) -> Result<Option<TaskRun>, EngineError> {
        let Some(run) = self.store.get_run(run_id).await? else {
            return Err(EngineError::RunNotFound(run_id.to_string()));
        };
        if !run.status.is_crashable() {
            tracing::debug!(target: "courier::lifecycle", run_id = %run_id, status = %run.status, "Crash rejected");
            return Ok(None);
        }
        let code = options.code.unwrap_or(InternalErrorCode::TaskRunCrashed);
        let error = TaskRunError::InternalError {
            code,
            message: options.message,
            stack_trace: None,
        };
        let status = if options.system_failure {
            RunStatus::SystemFailure
        } else {
            RunStatus::Crashed
        };
        let crashable = RunStatus::matching(|c| c.crashable);
        let run = self
            .finalize_run_from(run_id, &crashable, status, FinalizeDetails::failed(error.clone()))
            .await?;
        if run.status != status {
            return Ok(None);
        }
        self.emit_crash(&run.id, &error).await;
        Ok(Some(run))
    }
}
