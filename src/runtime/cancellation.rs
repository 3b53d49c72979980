//! Cancelling a run and every run its attempts wait on.

use std::collections::{HashSet, VecDeque};

use super::lifecycle::FinalizeDetails;
use super::Engine;
use crate::channel::{ChannelTarget, ServerMessage};
use crate::errors::EngineError;
use crate::model::{AttemptPatch, TaskRun};
use crate::status::{AttemptStatus, RunStatus};

#[derive(Debug, Clone)]
pub struct CancelOptions {
    /// Also cancel open attempts and cascade to the runs they wait on.
    pub cancel_attempts: bool,
    pub reason: String,
}

impl Default for CancelOptions {
    fn default() -> Self {
        Self {
            cancel_attempts: true,
            reason: "Canceled by user".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    Cancelled {
        run: TaskRun,
        /// Ids of descendant runs cancelled along with it, in visit order.
        cascaded: Vec<String>,
    },
    Rejected { status: RunStatus },
}

impl Engine {
    pub async fn cancel_run(&self, run_id: &str, options: CancelOptions) -> Result<CancelOutcome, EngineError> {
        let root = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
        if !root.status.is_cancellable() {
            tracing::debug!(target: "courier::cancellation", run_id = %run_id, status = %root.status, "Cancel rejected");
            return Ok(CancelOutcome::Rejected { status: root.status });
        }

        let mut pending = VecDeque::from([root.id.clone()]);
        let mut visited = HashSet::new();
        let mut cascaded = Vec::new();
        let mut cancelled_root = root.clone();

        while let Some(id) = pending.pop_front() {
            if !visited.insert(id.clone()) {
                continue;
            }
            let Some(run) = self.store.get_run(&id).await? else {
                continue;
            };
            if !run.status.is_cancellable() {
                continue;
            }
            let (run, children) = self.cancel_one(run, &options).await?;
            let Some(children) = children else {
                if id == root.id {
                    return Ok(CancelOutcome::Rejected { status: run.status });
                }
                continue;
            };
            if id == root.id {
                cancelled_root = run;
            } else {
                cascaded.push(id);
            }
            pending.extend(children);
        }

        tracing::info!(
            target: "courier::cancellation",
            run_id = %root.id,
            status = %cancelled_root.status,
            cascaded = cascaded.len(),
            reason = %options.reason,
            "Run cancelled"
        );
        Ok(CancelOutcome::Cancelled {
            run: cancelled_root,
            cascaded,
        })
    }

    /// Cancel one run. Returns it with the ids of the runs its attempts wait on,
    /// or with `None` when the run left the cancellable statuses first.
    async fn cancel_one(
        &self,
        run: TaskRun,
        options: &CancelOptions,
    ) -> Result<(TaskRun, Option<Vec<String>>), EngineError> {
        let status = if run.status == RunStatus::RetryingAfterFailure {
            RunStatus::Interrupted
        } else {
            RunStatus::Canceled
        };
        let env = self.environment(&run.environment_id).await?;
        let cancellable = RunStatus::matching(|c| c.cancellable);
        let cancelled = self
            .finalize_run_from(&run.id, &cancellable, status, FinalizeDetails::default())
            .await?;
        if cancelled.status != status {
            tracing::debug!(
                target: "courier::cancellation",
                run_id = %run.id,
                status = %cancelled.status,
                "Cancel lost to a concurrent transition"
            );
            return Ok((cancelled, None));
        }
        let attempts = self.store.list_attempts(&run.id).await?;
        self.emit_cancel(&run.id, &options.reason).await;
        self.metrics.record_cancellation();

        let mut children = Vec::new();
        if options.cancel_attempts {
            let now = self.now();
            for attempt in attempts.into_iter().filter(|a| a.status.is_cancellable()) {
                if attempt.status == AttemptStatus::Executing {
                    if let Some(target) = self.control_target(&env, &attempt.id).await {
                        let frame = ServerMessage::RequestAttemptCancellation {
                            attempt_id: attempt.id.clone(),
                            task_run_id: run.id.clone(),
                        };
                        self.send_logged(&target, frame, &run.id).await;
                    }
                }
                let patch = AttemptPatch {
                    status: Some(AttemptStatus::Canceled),
                    completed_at: Some(now),
                    ..Default::default()
                };
                let cancellable = AttemptStatus::matching(|c| c.cancellable);
                self.store.update_attempt(&attempt.id, &cancellable, patch).await?;
                self.sessions.forget_attempt(&attempt.id).await;

                for dependency in self.store.dependencies_of_attempt(&attempt.id).await? {
                    children.push(dependency.task_run_id);
                }
                for batch in self.store.batches_of_attempt(&attempt.id).await? {
                    for item in self.store.list_batch_items(&batch.id).await? {
                        children.push(item.task_run_id);
                    }
                }
            }
        }

        if !env.is_development() {
            let lazy = match run.locked_to_version_id.as_deref() {
                Some(worker_id) => self
                    .store
                    .get_worker(worker_id)
                    .await?
                    .is_some_and(|w| w.supports_lazy_attempts),
                None => false,
            };
            let frame = ServerMessage::RequestRunCancellation {
                run_id: run.id.clone(),
                delay_in_ms: lazy.then_some(self.options.cancellation_grace_ms),
            };
            self.send_logged(&ChannelTarget::Coordinator, frame, &run.id).await;
        }

        tracing::debug!(
            target: "courier::cancellation",
            run_id = %run.id,
            status = %cancelled.status,
            children = children.len(),
            "Run cancelled in cascade"
        );
        Ok((cancelled, Some(children)))
    }
}
