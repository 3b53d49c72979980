//! Checkpoint creation and restore.
//!
//! A checkpoint freezes a live attempt so its process can exit while it
//! waits. Restoring flips the run and attempt back to EXECUTING and asks the
//! provider namespace to bring the image back.

use chrono::TimeZone;
use serde_json::json;

use super::Engine;
use crate::channel::{ChannelTarget, ServerMessage};
use crate::errors::EngineError;
use crate::friendly_id;
use crate::model::{
    AttemptPatch, Checkpoint, CheckpointEventKind, CheckpointLocation, CheckpointReason, CheckpointRestoreEvent,
    RunPatch, TaskRun, TaskRunAttempt, TaskRunExecutionPayload,
};
use crate::providers::MessageBody;
use crate::status::{AttemptStatus, RunStatus};

#[derive(Debug, Clone)]
pub struct CreateCheckpointRequest {
    pub attempt_id: String,
    pub location: CheckpointLocation,
    pub reason: CheckpointReason,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointOutcome {
    Accepted {
        checkpoint: Checkpoint,
        event: CheckpointRestoreEvent,
    },
    /// The worker keeps running; nothing changed.
    Rejected { reason: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RestoreOutcome {
    Restored { run: TaskRun, attempt: TaskRunAttempt },
    Rejected { reason: &'static str },
}

/// What an accepted checkpoint waits on.
enum Awaited {
    Nothing,
    Duration { resume_at_ms: i64 },
    Task { dependency_id: String, child_id: String },
    Batch { batch_id: String },
}

impl Engine {
    pub async fn create_checkpoint(&self, request: CreateCheckpointRequest) -> Result<CheckpointOutcome, EngineError> {
        let attempt = self
            .store
            .get_attempt(&request.attempt_id)
            .await?
            .ok_or_else(|| EngineError::AttemptNotFound(request.attempt_id.clone()))?;
        let run = self
            .store
            .get_run(&attempt.run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound(attempt.run_id.clone()))?;

        let awaited = match self.checkpoint_precondition(&run, &attempt, &request.reason).await? {
            Ok(awaited) => awaited,
            Err(reason) => return Ok(self.reject_checkpoint(&run, &attempt, reason)),
        };

        let now = self.now();
        let checkpoint = Checkpoint {
            id: friendly_id::internal_id(),
            friendly_id: friendly_id::generate("checkpoint"),
            run_id: run.id.clone(),
            attempt_id: attempt.id.clone(),
            attempt_number: attempt.number,
            location: request.location.location,
            image_ref: request.location.image_ref,
            checkpoint_type: request.location.checkpoint_type,
            reason: request.reason,
            created_at: now,
        };
        let event = CheckpointRestoreEvent {
            id: friendly_id::internal_id(),
            checkpoint_id: checkpoint.id.clone(),
            run_id: run.id.clone(),
            attempt_id: attempt.id.clone(),
            kind: CheckpointEventKind::Checkpoint,
            created_at: now,
        };

        if !checkpoint.reason.is_retry() {
            let paused = AttemptPatch {
                status: Some(AttemptStatus::Paused),
                checkpoint_id: Some(checkpoint.id.clone()),
                ..Default::default()
            };
            let freezable = AttemptStatus::matching(|c| c.freezable);
            if self.store.update_attempt(&attempt.id, &freezable, paused).await?.is_none() {
                return Ok(self.reject_checkpoint(&run, &attempt, "attempt changed"));
            }
            let waiting = RunPatch::status(RunStatus::WaitingToResume);
            let freezable = RunStatus::matching(|c| c.freezable);
            if self.store.update_run(&run.id, &freezable, waiting).await?.is_none() {
                self.store
                    .update_attempt(&attempt.id, &[AttemptStatus::Paused], AttemptPatch::status(AttemptStatus::Executing))
                    .await?;
                return Ok(self.reject_checkpoint(&run, &attempt, "run changed"));
            }
        }
        self.store.create_checkpoint(checkpoint.clone(), event.clone()).await?;
        self.metrics.record_checkpoint();

        match awaited {
            Awaited::Nothing if checkpoint.reason.is_retry() => {}
            Awaited::Nothing => {
                self.queue.cancel_heartbeat(&run.id).await?;
            }
            Awaited::Duration { resume_at_ms } => {
                let env = self.environment(&run.environment_id).await?;
                let at = chrono::Utc.timestamp_millis_opt(resume_at_ms).single();
                let body = MessageBody::ResumeAfterDuration {
                    resumable_attempt_id: attempt.id.clone(),
                    checkpoint_event_id: event.id.clone(),
                };
                self.enqueue_run(&run, &env, body, at).await?;
            }
            // Park before publishing the event so a RESUME from a finishing child is never parked.
            Awaited::Task { dependency_id, child_id } => {
                self.queue.cancel_heartbeat(&run.id).await?;
                self.store
                    .set_dependency_checkpoint_event(&dependency_id, &event.id)
                    .await?;
                if let Some(child) = self.store.get_run(&child_id).await? {
                    if child.status.is_final() {
                        self.resolve_dependencies(&child).await?;
                    }
                }
            }
            Awaited::Batch { batch_id } => {
                self.queue.cancel_heartbeat(&run.id).await?;
                self.store.set_batch_checkpoint_event(&batch_id, &event.id).await?;
                self.try_resume_batch(&batch_id).await?;
            }
        }

        self.emit_event(
            &run.id,
            "checkpoint",
            json!({ "attemptId": attempt.id, "reason": checkpoint.reason, "checkpointId": checkpoint.id }),
        )
        .await;
        tracing::info!(
            target: "courier::checkpoint",
            run_id = %run.id,
            attempt_id = %attempt.id,
            checkpoint_id = %checkpoint.id,
            "Checkpoint created"
        );
        Ok(CheckpointOutcome::Accepted { checkpoint, event })
    }

    /// `Ok(Err(reason))` rejects the checkpoint without touching any row.
    async fn checkpoint_precondition(
        &self,
        run: &TaskRun,
        attempt: &TaskRunAttempt,
        reason: &CheckpointReason,
    ) -> Result<Result<Awaited, &'static str>, EngineError> {
        if let CheckpointReason::RetryingAfterFailure { .. } = reason {
            if run.status != RunStatus::RetryingAfterFailure || attempt.status != AttemptStatus::Failed {
                return Ok(Err("run is not retrying"));
            }
            let latest = self.store.latest_attempt(&run.id).await?;
            if !latest.is_some_and(|a| a.id == attempt.id) {
                return Ok(Err("attempt is not current"));
            }
            return Ok(Ok(Awaited::Nothing));
        }

        if !run.status.is_freezable() || !attempt.status.is_freezable() {
            return Ok(Err("not freezable"));
        }

        Ok(match reason {
            CheckpointReason::Manual | CheckpointReason::RetryingAfterFailure { .. } => Ok(Awaited::Nothing),
            CheckpointReason::WaitForDuration { ms, now } => Ok(Awaited::Duration {
                resume_at_ms: now.saturating_add(i64::try_from(*ms).unwrap_or(i64::MAX)),
            }),
            CheckpointReason::WaitForTask { friendly_id } => {
                let Some(child) = self.store.get_run_by_friendly_id(friendly_id).await? else {
                    return Ok(Err("awaited run not found"));
                };
                match self.store.dependency_for_run(&child.id).await? {
                    Some(dep) if dep.dependent_attempt_id.as_deref() != Some(attempt.id.as_str()) => {
                        Err("dependency belongs to another attempt")
                    }
                    Some(dep) if dep.resumed_at.is_some() => Err("dependency already resumed"),
                    Some(dep) => Ok(Awaited::Task {
                        dependency_id: dep.id,
                        child_id: child.id,
                    }),
                    None => Err("dependency not found"),
                }
            }
            CheckpointReason::WaitForBatch { batch_friendly_id } => {
                match self.store.get_batch_by_friendly_id(batch_friendly_id).await? {
                    Some(batch) if batch.dependent_attempt_id.as_deref() != Some(attempt.id.as_str()) => {
                        Err("batch belongs to another attempt")
                    }
                    Some(batch) if batch.resumed_at.is_some() => Err("batch already resumed"),
                    Some(batch) => Ok(Awaited::Batch { batch_id: batch.id }),
                    None => Err("batch not found"),
                }
            }
        })
    }

    fn reject_checkpoint(&self, run: &TaskRun, attempt: &TaskRunAttempt, reason: &'static str) -> CheckpointOutcome {
        self.metrics.record_checkpoint_rejected();
        tracing::debug!(
            target: "courier::checkpoint",
            run_id = %run.id,
            attempt_id = %attempt.id,
            run_status = %run.status,
            attempt_status = %attempt.status,
            reason = reason,
            "Checkpoint rejected"
        );
        CheckpointOutcome::Rejected { reason }
    }

    /// Restore the checkpoint behind `event_id`. `execution` is attached when
    /// the restore starts a new attempt.
    pub async fn restore_checkpoint(
        &self,
        event_id: &str,
        execution: Option<TaskRunExecutionPayload>,
    ) -> Result<RestoreOutcome, EngineError> {
        let event = self
            .store
            .get_checkpoint_event(event_id)
            .await?
            .ok_or_else(|| EngineError::CheckpointEventNotFound(event_id.to_string()))?;
        if event.kind != CheckpointEventKind::Checkpoint {
            return Ok(reject_restore(event_id, "not a checkpoint event"));
        }
        let checkpoint = self
            .store
            .get_checkpoint(&event.checkpoint_id)
            .await?
            .ok_or_else(|| EngineError::CheckpointEventNotFound(event_id.to_string()))?;
        let run = self
            .store
            .get_run(&event.run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound(event.run_id.clone()))?;

        let attempt = if checkpoint.reason.is_retry() {
            // The consumer has just locked the run for the next attempt.
            if run.status != RunStatus::Executing {
                return Ok(reject_restore(event_id, "run not re-locked for retry"));
            }
            match self.store.latest_attempt(&run.id).await? {
                Some(a) if a.status == AttemptStatus::Executing => a,
                _ => return Ok(reject_restore(event_id, "no attempt to restore into")),
            }
        } else {
            let attempt = self
                .store
                .get_attempt(&event.attempt_id)
                .await?
                .ok_or_else(|| EngineError::AttemptNotFound(event.attempt_id.clone()))?;
            if !run.status.is_restorable() || !attempt.status.is_restorable() {
                return Ok(reject_restore(event_id, "not restorable"));
            }
            attempt
        };

        let restore = CheckpointRestoreEvent {
            id: friendly_id::internal_id(),
            checkpoint_id: checkpoint.id.clone(),
            run_id: run.id.clone(),
            attempt_id: attempt.id.clone(),
            kind: CheckpointEventKind::Restore,
            created_at: self.now(),
        };
        let restore_id = restore.id.clone();
        if !self.store.create_restore_event(restore).await? {
            return Ok(reject_restore(event_id, "already restored"));
        }

        let (run, attempt) = if checkpoint.reason.is_retry() {
            (run, attempt)
        } else {
            let Some(attempt) = self
                .store
                .update_attempt(&attempt.id, &[AttemptStatus::Paused], AttemptPatch::status(AttemptStatus::Executing))
                .await?
            else {
                self.store.delete_restore_event(&restore_id).await?;
                return Ok(reject_restore(event_id, "attempt changed"));
            };
            let Some(run) = self
                .store
                .update_run(&run.id, &[RunStatus::WaitingToResume], RunPatch::status(RunStatus::Executing))
                .await?
            else {
                self.store
                    .update_attempt(&attempt.id, &[AttemptStatus::Executing], AttemptPatch::status(AttemptStatus::Paused))
                    .await?;
                self.store.delete_restore_event(&restore_id).await?;
                return Ok(reject_restore(event_id, "run changed"));
            };
            (run, attempt)
        };

        self.queue
            .heartbeat(&run.id, self.options.heartbeat_extension())
            .await?;

        let machine = run.machine_preset.unwrap_or(attempt.machine_preset).preset();
        let frame = ServerMessage::Restore {
            checkpoint_id: checkpoint.id.clone(),
            run_id: run.id.clone(),
            attempt_id: attempt.id.clone(),
            location: checkpoint.location.clone(),
            image_ref: checkpoint.image_ref.clone(),
            checkpoint_type: checkpoint.checkpoint_type,
            machine,
            execution: execution.map(Box::new),
        };
        if let Err(e) = self.channel.send(&ChannelTarget::Provider, frame).await {
            self.undo_restore(&restore_id, &run, &attempt, checkpoint.reason.is_retry())
                .await?;
            return Err(e.into());
        }

        self.metrics.record_restore();
        self.emit_event(
            &run.id,
            "restored",
            json!({ "attemptId": attempt.id, "checkpointId": checkpoint.id, "machine": machine.name }),
        )
        .await;
        tracing::info!(
            target: "courier::checkpoint",
            run_id = %run.id,
            attempt_id = %attempt.id,
            checkpoint_id = %checkpoint.id,
            "Checkpoint restored"
        );
        Ok(RestoreOutcome::Restored { run, attempt })
    }

    /// Put the run back to where it was before a restore the provider never
    /// received, so the next delivery restores from scratch.
    async fn undo_restore(
        &self,
        restore_id: &str,
        run: &TaskRun,
        attempt: &TaskRunAttempt,
        retry: bool,
    ) -> Result<(), EngineError> {
        if !retry {
            self.store
                .update_attempt(&attempt.id, &[AttemptStatus::Executing], AttemptPatch::status(AttemptStatus::Paused))
                .await?;
            self.store
                .update_run(&run.id, &[RunStatus::Executing], RunPatch::status(RunStatus::WaitingToResume))
                .await?;
            self.queue.cancel_heartbeat(&run.id).await?;
        }
        self.store.delete_restore_event(restore_id).await?;
        tracing::warn!(
            target: "courier::checkpoint",
            run_id = %run.id,
            attempt_id = %attempt.id,
            "Restore not delivered, checkpoint state reverted"
        );
        Ok(())
    }
}

fn reject_restore(event_id: &str, reason: &'static str) -> RestoreOutcome {
    tracing::debug!(target: "courier::checkpoint", event_id = %event_id, reason = reason, "Restore rejected");
    RestoreOutcome::Rejected { reason }
}
