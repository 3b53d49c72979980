//! Attempt completion: success, failure, retry and the final-status decision.

use serde_json::json;
use std::time::Duration;

use super::cancellation::CancelOptions;
use super::checkpoint::{CheckpointOutcome, CreateCheckpointRequest};
use super::lifecycle::FinalizeDetails;
use super::Engine;
use crate::channel::ServerMessage;
use crate::errors::{sanitize_error, EngineError, InternalErrorCode, TaskRunError};
use crate::machines::MachinePresetName;
use crate::model::{
    AttemptPatch, BackgroundWorkerTask, CheckpointLocation, CheckpointReason, ExecutionResult,
    RetryDirective, RunPatch, RuntimeEnvironment, TaskRun, TaskRunAttempt,
};
use crate::providers::MessageBody;
use crate::retry::calculate_next_retry_delay;
use crate::status::{AttemptStatus, RunStatus};
use crate::versions::WorkerCapabilities;

/// A worker's report that an attempt finished.
#[derive(Debug, Clone)]
pub struct CompleteAttemptRequest {
    pub attempt_id: String,
    /// Lets a run whose attempt row is gone still be finalized.
    pub run_id: Option<String>,
    pub result: ExecutionResult,
    /// Checkpoint taken while the worker waits to retry.
    pub checkpoint: Option<CheckpointLocation>,
    /// Overrides the capabilities derived from the attempt's worker.
    pub capabilities: Option<WorkerCapabilities>,
    pub is_crash: bool,
    pub is_system_failure: bool,
}

impl CompleteAttemptRequest {
    pub fn new(attempt_id: &str, result: ExecutionResult) -> Self {
        Self {
            attempt_id: attempt_id.to_string(),
            run_id: None,
            result,
            checkpoint: None,
            capabilities: None,
            is_crash: false,
            is_system_failure: false,
        }
    }

    pub fn success(attempt_id: &str, output: Option<String>) -> Self {
        Self::new(
            attempt_id,
            ExecutionResult::Success {
                id: attempt_id.to_string(),
                output,
                output_type: "application/json".to_string(),
            },
        )
    }

    pub fn failure(attempt_id: &str, run_id: Option<&str>, error: TaskRunError) -> Self {
        let mut request = Self::new(
            attempt_id,
            ExecutionResult::Failure {
                id: attempt_id.to_string(),
                error,
                retry: None,
                skipped_retrying: false,
            },
        );
        request.run_id = run_id.map(str::to_string);
        request
    }

    pub fn with_checkpoint(mut self, checkpoint: CheckpointLocation) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn with_capabilities(mut self, capabilities: WorkerCapabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }
}

/// How the next attempt of a retried run gets started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDispatch {
    /// Queued with the retry checkpoint attached.
    Checkpoint,
    /// The worker cannot create attempts lazily.
    NoLazyAttempts,
    /// The worker was told to exit (machine upgrade).
    ForcedRequeue,
    /// Too long to wait without a checkpoint.
    DelayOverThreshold,
    /// The worker does not know the delay.
    InferredDelay,
    /// READY_FOR_RETRY sent to the running worker.
    Direct,
}

impl RetryDispatch {
    pub fn as_str(self) -> &'static str {
        match self {
            RetryDispatch::Checkpoint => "checkpoint",
            RetryDispatch::NoLazyAttempts => "no_lazy_attempts",
            RetryDispatch::ForcedRequeue => "forced_requeue",
            RetryDispatch::DelayOverThreshold => "delay_over_threshold",
            RetryDispatch::InferredDelay => "inferred_delay",
            RetryDispatch::Direct => "direct",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    Completed { status: RunStatus },
    AlreadyCompleted,
    Retried { dispatch: RetryDispatch, delay_ms: u64 },
    Cancelled,
}

struct RetryPlan {
    delay_ms: u64,
    inferred: bool,
    upgrade_to: Option<MachinePresetName>,
}

impl Engine {
    pub async fn complete_attempt(&self, request: CompleteAttemptRequest) -> Result<CompletionOutcome, EngineError> {
        let Some(attempt) = self.store.get_attempt(&request.attempt_id).await? else {
            return self.complete_lost_attempt(&request).await;
        };
        let run = self
            .store
            .get_run(&attempt.run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound(attempt.run_id.clone()))?;

        if attempt.status.is_final() || run.status.is_final() {
            tracing::debug!(
                target: "courier::completion",
                run_id = %run.id,
                attempt_id = %attempt.id,
                run_status = %run.status,
                attempt_status = %attempt.status,
                "Completion for finished attempt ignored"
            );
            return Ok(CompletionOutcome::AlreadyCompleted);
        }

        match request.result.clone() {
            ExecutionResult::Success { output, output_type, .. } => {
                let too_large = output.as_ref().is_some_and(|o| o.len() > self.options.max_output_bytes);
                if too_large {
                    let error = TaskRunError::internal_with_message(
                        InternalErrorCode::TaskOutputError,
                        format!("output exceeds {} bytes", self.options.max_output_bytes),
                    );
                    return self.complete_failure(&request, run, attempt, error, None, true).await;
                }
                self.complete_success(run, attempt, output, output_type).await
            }
            ExecutionResult::Failure {
                error,
                retry,
                skipped_retrying,
                ..
            } => {
                self.complete_failure(&request, run, attempt, error, retry, skipped_retrying)
                    .await
            }
        }
    }

    async fn complete_lost_attempt(&self, request: &CompleteAttemptRequest) -> Result<CompletionOutcome, EngineError> {
        let missing = || EngineError::AttemptNotFound(request.attempt_id.clone());
        let run_id = request.run_id.as_deref().ok_or_else(missing)?;
        let run = self.store.get_run(run_id).await?.ok_or_else(missing)?;
        if run.status.is_final() {
            return Ok(CompletionOutcome::AlreadyCompleted);
        }
        tracing::warn!(
            target: "courier::completion",
            run_id = %run.id,
            attempt_id = %request.attempt_id,
            "Completion for unknown attempt, failing run"
        );
        let error = TaskRunError::internal_with_message(
            InternalErrorCode::TaskRunCrashed,
            format!("attempt {} not found", request.attempt_id),
        );
        let run = self
            .finalize_run(&run.id, RunStatus::SystemFailure, FinalizeDetails::failed(error))
            .await?;
        Ok(CompletionOutcome::Completed { status: run.status })
    }

    async fn complete_success(
        &self,
        run: TaskRun,
        attempt: TaskRunAttempt,
        output: Option<String>,
        output_type: String,
    ) -> Result<CompletionOutcome, EngineError> {
        let patch = AttemptPatch {
            status: Some(AttemptStatus::Completed),
            output: Some(output.clone()),
            output_type: Some(output_type.clone()),
            completed_at: Some(self.now()),
            ..Default::default()
        };
        if self
            .store
            .update_attempt(&attempt.id, &AttemptStatus::non_final(), patch)
            .await?
            .is_none()
        {
            return Ok(CompletionOutcome::AlreadyCompleted);
        }

        let details = FinalizeDetails {
            output,
            output_type: Some(output_type),
            ..Default::default()
        };
        let run = self
            .finalize_run(&run.id, RunStatus::CompletedSuccessfully, details)
            .await?;
        self.sessions.forget_attempt(&attempt.id).await;
        self.emit_complete(&run.id).await;
        tracing::info!(
            target: "courier::completion",
            run_id = %run.id,
            attempt_id = %attempt.id,
            "Attempt succeeded"
        );
        Ok(CompletionOutcome::Completed { status: run.status })
    }

    async fn complete_failure(
        &self,
        request: &CompleteAttemptRequest,
        run: TaskRun,
        attempt: TaskRunAttempt,
        error: TaskRunError,
        directive: Option<RetryDirective>,
        skipped_retrying: bool,
    ) -> Result<CompletionOutcome, EngineError> {
        let error = sanitize_error(error);

        if error.is_cancellation() {
            let options = CancelOptions {
                cancel_attempts: true,
                reason: "Attempt reported cancellation".to_string(),
            };
            self.cancel_run(&run.id, options).await?;
            let patch = AttemptPatch {
                error: Some(Some(error)),
                ..Default::default()
            };
            self.store
                .update_attempt(&attempt.id, &[AttemptStatus::Canceled], patch)
                .await?;
            return Ok(CompletionOutcome::Cancelled);
        }

        let patch = AttemptPatch {
            status: Some(AttemptStatus::Failed),
            error: Some(Some(error.clone())),
            completed_at: Some(self.now()),
            ..Default::default()
        };
        let Some(attempt) = self
            .store
            .update_attempt(&attempt.id, &AttemptStatus::non_final(), patch)
            .await?
        else {
            return Ok(CompletionOutcome::AlreadyCompleted);
        };

        let worker = self.store.get_worker(&attempt.background_worker_id).await?;
        let task = worker
            .as_ref()
            .and_then(|w| w.tasks.iter().find(|t| t.id == attempt.background_worker_task_id))
            .cloned();
        let capabilities = request
            .capabilities
            .or_else(|| worker.as_ref().map(WorkerCapabilities::for_worker))
            .unwrap_or_default();

        let ceiling_hit = run.attempt_count >= self.options.max_attempts_ceiling;
        let plan = if skipped_retrying || ceiling_hit {
            None
        } else {
            self.plan_retry(&run, &attempt, task.as_ref(), &error, directive)
        };

        if let Some(plan) = plan {
            let outcome = self
                .retry_run(run, attempt.clone(), plan, request.checkpoint.clone(), capabilities)
                .await?;
            self.sessions.forget_attempt(&attempt.id).await;
            return Ok(outcome);
        }

        let status = if request.is_system_failure || ceiling_hit {
            RunStatus::SystemFailure
        } else if request.is_crash || error.is_crash() {
            RunStatus::Crashed
        } else if error.internal_code() == Some(InternalErrorCode::MaxDurationExceeded) {
            RunStatus::TimedOut
        } else {
            RunStatus::CompletedWithErrors
        };
        if ceiling_hit {
            tracing::warn!(
                target: "courier::completion",
                run_id = %run.id,
                attempt_count = run.attempt_count,
                ceiling = self.options.max_attempts_ceiling,
                "Attempt ceiling reached"
            );
        }

        let run = self
            .finalize_run(&run.id, status, FinalizeDetails::failed(error.clone()))
            .await?;
        self.sessions.forget_attempt(&attempt.id).await;
        self.emit_event(
            &run.id,
            "failed",
            json!({ "status": run.status, "attemptNumber": attempt.number, "error": error.summary() }),
        )
        .await;
        if run.status == RunStatus::Crashed {
            self.emit_crash(&run.id, &error).await;
        }
        tracing::info!(
            target: "courier::completion",
            run_id = %run.id,
            attempt_id = %attempt.id,
            status = %run.status,
            error = %error,
            "Attempt failed, not retrying"
        );
        Ok(CompletionOutcome::Completed { status: run.status })
    }

    fn plan_retry(
        &self,
        run: &TaskRun,
        attempt: &TaskRunAttempt,
        task: Option<&BackgroundWorkerTask>,
        error: &TaskRunError,
        directive: Option<RetryDirective>,
    ) -> Option<RetryPlan> {
        let config = task.and_then(|t| t.retry_config.as_ref());
        let current = run.machine_preset.unwrap_or(attempt.machine_preset);
        let upgrade_to = config
            .and_then(|c| c.out_of_memory_machine())
            .filter(|m| error.is_out_of_memory() && m.is_larger_than(current));

        if !error.is_retryable() && upgrade_to.is_none() {
            return None;
        }
        if let Some(config) = config {
            if run.attempt_count >= config.resolved().max_attempts {
                return None;
            }
        }

        let (delay, inferred) = match directive {
            Some(d) => (Some(Duration::from_millis(d.delay)), false),
            None => (config.and_then(|c| calculate_next_retry_delay(c, run.attempt_count)), true),
        };
        let delay = match (delay, upgrade_to) {
            (None, Some(_)) => Some(Duration::ZERO),
            (delay, _) => delay,
        }?;
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        Some(RetryPlan {
            delay_ms: delay_ms.min(self.options.max_retry_delay_ms),
            inferred,
            upgrade_to,
        })
    }

    async fn retry_run(
        &self,
        run: TaskRun,
        attempt: TaskRunAttempt,
        plan: RetryPlan,
        checkpoint: Option<CheckpointLocation>,
        capabilities: WorkerCapabilities,
    ) -> Result<CompletionOutcome, EngineError> {
        let patch = RunPatch {
            status: Some(RunStatus::RetryingAfterFailure),
            machine_preset: plan.upgrade_to,
            ..Default::default()
        };
        let Some(run) = self.store.update_run(&run.id, &[RunStatus::Executing], patch).await? else {
            tracing::debug!(target: "courier::completion", run_id = %run.id, "Run changed before retry");
            return Ok(CompletionOutcome::AlreadyCompleted);
        };
        let env = self.environment(&run.environment_id).await?;
        let run_at = self.after_ms(plan.delay_ms);
        let execute = |checkpoint_event_id: Option<String>| MessageBody::Execute {
            task_identifier: run.task_identifier.clone(),
            checkpoint_event_id,
        };

        let mut dispatch = None;
        if let Some(location) = checkpoint {
            let request = CreateCheckpointRequest {
                attempt_id: attempt.id.clone(),
                location,
                reason: CheckpointReason::RetryingAfterFailure {
                    attempt_number: attempt.number,
                },
            };
            if let CheckpointOutcome::Accepted { event, .. } = self.create_checkpoint(request).await? {
                self.enqueue_run(&run, &env, execute(Some(event.id)), Some(run_at)).await?;
                dispatch = Some(RetryDispatch::Checkpoint);
            }
        }

        let dispatch = match dispatch {
            Some(d) => d,
            None => {
                let queued = if !capabilities.supports_lazy_attempts {
                    Some(RetryDispatch::NoLazyAttempts)
                } else if plan.upgrade_to.is_some() {
                    if let Some(target) = self.control_target(&env, &attempt.id).await {
                        let exit = ServerMessage::RequestExit {
                            run_id: run.id.clone(),
                            attempt_id: attempt.id.clone(),
                        };
                        self.send_logged(&target, exit, &run.id).await;
                    }
                    Some(RetryDispatch::ForcedRequeue)
                } else if !capabilities.supports_retry_checkpoints
                    && plan.delay_ms > self.options.retry_checkpoint_threshold_ms
                {
                    Some(RetryDispatch::DelayOverThreshold)
                } else if plan.inferred {
                    Some(RetryDispatch::InferredDelay)
                } else {
                    None
                };
                match queued {
                    Some(d) => {
                        self.enqueue_run(&run, &env, execute(None), Some(run_at)).await?;
                        d
                    }
                    None => self.retry_direct(&run, &env, &attempt, plan.delay_ms, &execute).await?,
                }
            }
        };

        self.metrics.record_retry();
        self.emit_event(
            &run.id,
            "retrying",
            json!({
                "attemptNumber": attempt.number,
                "delayMs": plan.delay_ms,
                "dispatch": dispatch.as_str(),
                "machine": plan.upgrade_to,
            }),
        )
        .await;
        tracing::info!(
            target: "courier::completion",
            run_id = %run.id,
            attempt_id = %attempt.id,
            delay_ms = plan.delay_ms,
            dispatch = dispatch.as_str(),
            "Retry scheduled"
        );
        Ok(CompletionOutcome::Retried {
            dispatch,
            delay_ms: plan.delay_ms,
        })
    }

    /// Tell the running worker to retry in place. The run's message stays
    /// leased until the delay passes, then the consumer creates the next
    /// attempt. Falls back to the queue when the worker cannot be reached.
    async fn retry_direct(
        &self,
        run: &TaskRun,
        env: &RuntimeEnvironment,
        attempt: &TaskRunAttempt,
        delay_ms: u64,
        execute: &impl Fn(Option<String>) -> MessageBody,
    ) -> Result<RetryDispatch, EngineError> {
        let sent = match self.control_target(env, &attempt.id).await {
            Some(target) => {
                self.send_logged(&target, ServerMessage::ReadyForRetry { run_id: run.id.clone() }, &run.id)
                    .await
            }
            None => false,
        };
        let leased = sent && self.queue.heartbeat(&run.id, Duration::from_millis(delay_ms)).await?;
        if !leased {
            let run_at = self.after_ms(delay_ms);
            self.enqueue_run(run, env, execute(None), Some(run_at)).await?;
        }
        Ok(RetryDispatch::Direct)
    }
}
