//! Lease extension from worker heartbeats.

use super::Engine;
use crate::errors::EngineError;
use crate::status::{AttemptStatus, RunStatus};

impl Engine {
    /// `TASK_HEARTBEAT`: extend the lease of the attempt's run while it executes.
    pub async fn heartbeat_attempt(&self, attempt_id: &str) -> Result<bool, EngineError> {
        let Some(attempt) = self.store.get_attempt(attempt_id).await? else {
            tracing::debug!(target: "courier::heartbeat", attempt_id = %attempt_id, "Heartbeat for unknown attempt");
            return Ok(false);
        };
        if attempt.status != AttemptStatus::Executing {
            tracing::debug!(
                target: "courier::heartbeat",
                attempt_id = %attempt_id,
                status = %attempt.status,
                "Heartbeat for attempt not executing"
            );
            return Ok(false);
        }
        self.heartbeat_run(&attempt.run_id).await
    }

    /// `TASK_RUN_HEARTBEAT`. Suspended and retrying runs keep their lease state.
    pub async fn heartbeat_run(&self, run_id: &str) -> Result<bool, EngineError> {
        let Some(run) = self.store.get_run(run_id).await? else {
            return Ok(false);
        };
        if run.status != RunStatus::Executing {
            tracing::debug!(target: "courier::heartbeat", run_id = %run_id, status = %run.status, "Heartbeat ignored");
            return Ok(false);
        }
        let extended = self
            .queue
            .heartbeat(run_id, self.options.heartbeat_extension())
            .await?;
        tracing::trace!(target: "courier::heartbeat", run_id = %run_id, extended, "Heartbeat");
        Ok(extended)
    }
}
