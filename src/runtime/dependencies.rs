//! Waking attempts blocked on finished runs.
//!
//! Every resume first claims the resumed-once flag on its dependency or batch
//! row, so concurrent finalizations produce exactly one RESUME.

use super::Engine;
use crate::errors::EngineError;
use crate::model::{BatchItemStatus, TaskRun, TaskRunAttempt, TaskRunDependency};
use crate::providers::MessageBody;
use crate::status::{AttemptStatus, RunStatus};

/// Row whose resumed-once flag guards a resume.
enum ResumeClaim<'a> {
    Dependency(&'a str),
    Batch(&'a str),
}

impl Engine {
    /// Called after `run` reached a final status.
    pub async fn resolve_dependencies(&self, run: &TaskRun) -> Result<(), EngineError> {
        if !run.status.is_final() {
            return Ok(());
        }
        let Some(dependency) = self.store.dependency_for_run(&run.id).await? else {
            return Ok(());
        };

        if let Some(attempt_id) = dependency.dependent_attempt_id.as_deref() {
            self.resume_single(&dependency, attempt_id, run).await?;
        } else if let Some(batch_id) = dependency.dependent_batch_id.as_deref() {
            let status = match run.status {
                RunStatus::Canceled | RunStatus::Interrupted | RunStatus::Expired => BatchItemStatus::Canceled,
                _ => BatchItemStatus::Completed,
            };
            let finishing = self.store.latest_attempt(&run.id).await?.map(|a| a.id);
            let item = self
                .store
                .finish_batch_item(batch_id, &run.id, status, finishing.as_deref())
                .await?;
            if item.is_none() {
                tracing::debug!(target: "courier::dependencies", run_id = %run.id, batch_id = %batch_id, "Batch item already finished");
            }
            self.try_resume_batch(batch_id).await?;
        }
        Ok(())
    }

    async fn resume_single(
        &self,
        dependency: &TaskRunDependency,
        attempt_id: &str,
        child: &TaskRun,
    ) -> Result<(), EngineError> {
        if dependency.resumed_at.is_some() {
            tracing::debug!(target: "courier::dependencies", dependency_id = %dependency.id, "Dependency already resumed");
            return Ok(());
        }
        let Some(attempt) = self.store.get_attempt(attempt_id).await? else {
            tracing::warn!(target: "courier::dependencies", attempt_id = %attempt_id, "Dependent attempt not found");
            return Ok(());
        };
        let completed: Vec<String> = self
            .store
            .latest_attempt(&child.id)
            .await?
            .map(|a| a.id)
            .into_iter()
            .collect();
        self.resume_waiter(
            &attempt,
            completed,
            dependency.checkpoint_event_id.clone(),
            ResumeClaim::Dependency(&dependency.id),
        )
        .await?;
        Ok(())
    }

    /// Resume the batch's waiter once no item is pending. Returns whether
    /// this call performed the resume.
    pub async fn try_resume_batch(&self, batch_id: &str) -> Result<bool, EngineError> {
        let batch = self
            .store
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| EngineError::BatchNotFound(batch_id.to_string()))?;
        if batch.resumed_at.is_some() {
            return Ok(false);
        }
        let items = self.store.list_batch_items(batch_id).await?;
        let pending = items.iter().filter(|i| i.status == BatchItemStatus::Pending).count();
        if pending > 0 {
            tracing::debug!(
                target: "courier::dependencies",
                batch_id = %batch_id,
                pending,
                total = items.len(),
                "Batch still running"
            );
            return Ok(false);
        }

        let completed: Vec<String> = items.into_iter().filter_map(|i| i.task_run_attempt_id).collect();
        let Some(attempt_id) = batch.dependent_attempt_id.as_deref() else {
            return Ok(self.store.mark_batch_resumed(batch_id, self.now()).await?);
        };
        let Some(attempt) = self.store.get_attempt(attempt_id).await? else {
            tracing::warn!(target: "courier::dependencies", attempt_id = %attempt_id, "Batch waiter not found");
            return Ok(false);
        };
        self.resume_waiter(&attempt, completed, batch.checkpoint_event_id.clone(), ResumeClaim::Batch(batch_id))
            .await
    }

    async fn claim(&self, claim: &ResumeClaim<'_>) -> Result<bool, EngineError> {
        let now = self.now();
        let won = match claim {
            ResumeClaim::Dependency(id) => self.store.mark_dependency_resumed(id, now).await?,
            ResumeClaim::Batch(id) => self.store.mark_batch_resumed(id, now).await?,
        };
        if !won {
            tracing::debug!(target: "courier::dependencies", "Resume already claimed");
        }
        Ok(won)
    }

    /// Paused with a checkpoint: queue a cold RESUME. Still executing: turn
    /// its in-flight message into a warm RESUME. Paused without a checkpoint
    /// event: the checkpoint will trigger the resume.
    async fn resume_waiter(
        &self,
        attempt: &TaskRunAttempt,
        completed_attempt_ids: Vec<String>,
        checkpoint_event_id: Option<String>,
        claim: ResumeClaim<'_>,
    ) -> Result<bool, EngineError> {
        let Some(parent) = self.store.get_run(&attempt.run_id).await? else {
            return Ok(false);
        };
        if parent.status.is_final() {
            tracing::debug!(target: "courier::dependencies", run_id = %parent.id, "Waiting run already final");
            return Ok(false);
        }

        let body = |checkpoint_event_id| MessageBody::Resume {
            completed_attempt_ids: completed_attempt_ids.clone(),
            resumable_attempt_id: attempt.id.clone(),
            checkpoint_event_id,
        };
        match (attempt.status, checkpoint_event_id) {
            (AttemptStatus::Paused, Some(event_id)) => {
                if !self.claim(&claim).await? {
                    return Ok(false);
                }
                let env = self.environment(&parent.environment_id).await?;
                self.enqueue_run(&parent, &env, body(Some(event_id)), None).await?;
            }
            (AttemptStatus::Paused, None) => {
                tracing::debug!(
                    target: "courier::dependencies",
                    run_id = %parent.id,
                    attempt_id = %attempt.id,
                    "Waiter paused without checkpoint yet"
                );
                return Ok(false);
            }
            (AttemptStatus::Executing, _) => {
                if !self.claim(&claim).await? {
                    return Ok(false);
                }
                if !self.queue.replace(&parent.id, body(None), Some(self.now())).await? {
                    let env = self.environment(&parent.environment_id).await?;
                    self.enqueue_run(&parent, &env, body(None), None).await?;
                }
            }
            (status, _) => {
                tracing::debug!(
                    target: "courier::dependencies",
                    attempt_id = %attempt.id,
                    status = %status,
                    "Waiter not resumable"
                );
                return Ok(false);
            }
        }
        tracing::info!(
            target: "courier::dependencies",
            run_id = %parent.id,
            attempt_id = %attempt.id,
            completed = completed_attempt_ids.len(),
            "Waiter resumed"
        );
        Ok(true)
    }
}
