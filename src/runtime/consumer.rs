//! Queue consumer: one polling loop per slot.
//!
//! Each iteration dequeues one message and drives it to one of the
//! [`ConsumeOutcome`]s. Handlers are idempotent because a message whose lease
//! expired is delivered again.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::completion::{CompleteAttemptRequest, CompletionOutcome};
use super::lifecycle::EXECUTABLE;
use super::checkpoint::RestoreOutcome;
use super::Engine;
use crate::channel::{ChannelTarget, ServerMessage, WorkerServerMessage};
use crate::errors::{EngineError, InternalErrorCode, TaskRunError};
use crate::limits::IN_FLIGHT_INDEX_CAPACITY;
use crate::machines::machine_preset_for_run;
use crate::model::{
    BackgroundWorker, BackgroundWorkerTask, ExecutionAttempt, ExecutionEnvironment, ExecutionQueue, ExecutionResult,
    ExecutionRun, ExecutionTask, RunPatch, RuntimeEnvironment, TaskQueue, TaskRun, TaskRunAttempt, TaskRunExecution,
    TaskRunExecutionPayload,
};
use crate::providers::{MessageBody, QueueMessage, QueueScope};
use crate::status::{AttemptStatus, RunStatus};
use crate::versions::resolve_worker;

#[derive(Debug, Clone, PartialEq, Eq)]
struct InFlightEntry {
    message_id: String,
    attempt_id: String,
    run_id: String,
}

#[derive(Default)]
struct InFlightState {
    order: VecDeque<String>,
    by_attempt: HashMap<String, InFlightEntry>,
}

/// Bounded map of dispatched attempts owned by one consumer. The oldest entry
/// is evicted once capacity is reached.
pub struct InFlightIndex {
    capacity: usize,
    inner: Mutex<InFlightState>,
}

impl Default for InFlightIndex {
    fn default() -> Self {
        Self::with_capacity(IN_FLIGHT_INDEX_CAPACITY)
    }
}

impl InFlightIndex {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(InFlightState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, InFlightState> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn insert(&self, message_id: &str, attempt_id: &str, run_id: &str) {
        let mut s = self.state();
        if s.by_attempt.contains_key(attempt_id) {
            return;
        }
        while s.order.len() >= self.capacity {
            if let Some(oldest) = s.order.pop_front() {
                s.by_attempt.remove(&oldest);
            }
        }
        s.order.push_back(attempt_id.to_string());
        s.by_attempt.insert(
            attempt_id.to_string(),
            InFlightEntry {
                message_id: message_id.to_string(),
                attempt_id: attempt_id.to_string(),
                run_id: run_id.to_string(),
            },
        );
    }

    pub fn contains_attempt(&self, attempt_id: &str) -> bool {
        self.state().by_attempt.contains_key(attempt_id)
    }

    pub fn message_for_attempt(&self, attempt_id: &str) -> Option<String> {
        self.state().by_attempt.get(attempt_id).map(|e| e.message_id.clone())
    }

    pub fn attempt_for_run(&self, run_id: &str) -> Option<String> {
        let s = self.state();
        s.order
            .iter()
            .rev()
            .filter_map(|id| s.by_attempt.get(id))
            .find(|e| e.run_id == run_id)
            .map(|e| e.attempt_id.clone())
    }

    pub fn remove_attempt(&self, attempt_id: &str) {
        let mut s = self.state();
        if s.by_attempt.remove(attempt_id).is_some() {
            s.order.retain(|id| id != attempt_id);
        }
    }

    pub fn len(&self) -> usize {
        self.state().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One consumer slot.
pub struct QueueConsumer {
    pub id: String,
    pub scope: QueueScope,
    /// Where execution payloads are pushed.
    pub target: ChannelTarget,
    pub index: Arc<InFlightIndex>,
    stop: Arc<AtomicBool>,
}

impl QueueConsumer {
    pub fn new(id: impl Into<String>, scope: QueueScope, target: ChannelTarget, stop: Arc<AtomicBool>) -> Self {
        Self {
            id: id.into(),
            scope,
            target,
            index: Arc::new(InFlightIndex::default()),
            stop,
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn is_session(&self) -> bool {
        matches!(self.target, ChannelTarget::Session(_))
    }
}

/// What one iteration did.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumeOutcome {
    Empty,
    /// Acknowledged without doing anything.
    Dropped { message_id: String, reason: &'static str },
    Dispatched { run_id: String, attempt_id: String },
    /// Next attempt dispatched by restoring a retry checkpoint.
    Restored { run_id: String, attempt_id: String },
    Resumed { run_id: String, attempt_id: String },
    /// Redelivered EXECUTE for an executing attempt.
    HeartbeatTimeout {
        run_id: String,
        attempt_id: String,
        outcome: CompletionOutcome,
    },
    Expired { run_id: String },
    WaitingForDeploy { run_id: String },
    /// Nacked for redelivery after a failure.
    Requeued { message_id: String, reason: String },
}

impl ConsumeOutcome {
    fn is_failure(&self) -> bool {
        matches!(self, ConsumeOutcome::Requeued { .. })
    }
}

/// Groups consecutive iterations under one span.
struct SpanBatch {
    consumer_id: String,
    budget: u32,
    timeout: Duration,
    span: Option<tracing::Span>,
    started: Instant,
    remaining: u32,
    succeeded: u64,
    failed: u64,
}

impl SpanBatch {
    fn new(consumer_id: &str, budget: u32, timeout: Duration) -> Self {
        Self {
            consumer_id: consumer_id.to_string(),
            budget: budget.max(1),
            timeout,
            span: None,
            started: Instant::now(),
            remaining: 0,
            succeeded: 0,
            failed: 0,
        }
    }

    fn next(&mut self) -> tracing::Span {
        if self.span.is_none() || self.remaining == 0 || self.started.elapsed() >= self.timeout {
            self.close();
            self.span = Some(tracing::info_span!(
                target: "courier::consumer",
                "consumer_batch",
                consumer_id = %self.consumer_id,
                succeeded = tracing::field::Empty,
                failed = tracing::field::Empty,
            ));
            self.started = Instant::now();
            self.remaining = self.budget;
        }
        self.remaining -= 1;
        self.span.clone().unwrap_or_else(tracing::Span::none)
    }

    fn record(&mut self, ok: bool) {
        if ok {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }

    fn close(&mut self) {
        if let Some(span) = self.span.take() {
            span.record("succeeded", self.succeeded);
            span.record("failed", self.failed);
        }
        self.succeeded = 0;
        self.failed = 0;
    }
}

impl Engine {
    /// Run `consumer` until it or the engine is stopped.
    pub(crate) fn spawn_consumer(self: Arc<Self>, consumer: Arc<QueueConsumer>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut batch = SpanBatch::new(
                &consumer.id,
                self.options.span_item_budget,
                Duration::from_millis(self.options.span_timeout_ms),
            );
            tracing::debug!(target: "courier::consumer", consumer_id = %consumer.id, "Consumer started");
            loop {
                if consumer.is_stopped() || self.is_shutting_down() {
                    break;
                }
                let span = batch.next();
                let delay = match self.consume_once(&consumer).instrument(span).await {
                    Ok(ConsumeOutcome::Empty) => self.options.empty_delay_ms,
                    Ok(outcome) => {
                        batch.record(!outcome.is_failure());
                        self.options.handled_delay_ms
                    }
                    Err(e) => {
                        batch.record(false);
                        tracing::error!(
                            target: "courier::consumer",
                            consumer_id = %consumer.id,
                            error = %e,
                            "Consumer iteration failed"
                        );
                        self.options.empty_delay_ms
                    }
                };
                tokio::time::sleep(self.jittered(delay)).await;
            }
            batch.close();
            tracing::debug!(target: "courier::consumer", consumer_id = %consumer.id, "Consumer stopped");
        })
    }

    /// Dequeue and handle at most one message.
    ///
    /// Handler failures nack the message with the push-failure delay and are
    /// reported as [`ConsumeOutcome::Requeued`]; only a failing dequeue or
    /// nack is returned as an error.
    pub async fn consume_once(&self, consumer: &QueueConsumer) -> Result<ConsumeOutcome, EngineError> {
        let Some(message) = self
            .queue
            .dequeue(&consumer.scope, self.options.visibility_timeout())
            .await?
        else {
            return Ok(ConsumeOutcome::Empty);
        };
        self.metrics.record_dequeue();
        tracing::debug!(
            target: "courier::consumer",
            consumer_id = %consumer.id,
            message_id = %message.id,
            delivery_count = message.delivery_count,
            "Message dequeued"
        );

        match self.handle_message(consumer, &message).await {
            Ok(outcome) => {
                if let ConsumeOutcome::Dropped { reason, .. } = &outcome {
                    self.metrics.record_dropped();
                    tracing::debug!(
                        target: "courier::consumer",
                        message_id = %message.id,
                        reason = %reason,
                        "Message dropped"
                    );
                }
                Ok(outcome)
            }
            Err(e) => {
                tracing::warn!(
                    target: "courier::consumer",
                    consumer_id = %consumer.id,
                    message_id = %message.id,
                    error = %e,
                    "Message handling failed, nacking"
                );
                self.nack_later(&message.id).await?;
                Ok(ConsumeOutcome::Requeued {
                    message_id: message.id,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn nack_later(&self, message_id: &str) -> Result<(), EngineError> {
        let not_before = self.after_ms(self.options.push_failure_nack_delay_ms);
        self.queue.nack(message_id, Some(not_before)).await?;
        Ok(())
    }

    async fn drop_message(&self, message_id: &str, reason: &'static str) -> Result<ConsumeOutcome, EngineError> {
        self.queue.acknowledge(message_id).await?;
        Ok(ConsumeOutcome::Dropped {
            message_id: message_id.to_string(),
            reason,
        })
    }

    async fn handle_message(
        &self,
        consumer: &QueueConsumer,
        message: &QueueMessage,
    ) -> Result<ConsumeOutcome, EngineError> {
        let body = match message.decode() {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(target: "courier::consumer", message_id = %message.id, error = %e, "Undecodable body");
                return self.drop_message(&message.id, "undecodable body").await;
            }
        };
        let Some(run) = self.store.get_run(&message.id).await? else {
            return self.drop_message(&message.id, "run not found").await;
        };

        match body {
            MessageBody::Execute {
                task_identifier,
                checkpoint_event_id,
            } => {
                self.handle_execute(consumer, message, run, &task_identifier, checkpoint_event_id)
                    .await
            }
            MessageBody::Resume {
                completed_attempt_ids,
                resumable_attempt_id,
                checkpoint_event_id,
            } => {
                self.handle_resume(
                    consumer,
                    message,
                    run,
                    &completed_attempt_ids,
                    &resumable_attempt_id,
                    checkpoint_event_id,
                )
                .await
            }
            MessageBody::ResumeAfterDuration {
                resumable_attempt_id,
                checkpoint_event_id,
            } => {
                self.handle_resume_after_duration(consumer, message, run, &resumable_attempt_id, &checkpoint_event_id)
                    .await
            }
        }
    }

    async fn handle_execute(
        &self,
        consumer: &QueueConsumer,
        message: &QueueMessage,
        run: TaskRun,
        task_identifier: &str,
        checkpoint_event_id: Option<String>,
    ) -> Result<ConsumeOutcome, EngineError> {
        if run.status.is_final() {
            return self.drop_message(&message.id, "run already final").await;
        }

        if run.status == RunStatus::Executing {
            return self.handle_redelivered_execute(message, run).await;
        }

        if !EXECUTABLE.contains(&run.status) {
            return self.drop_message(&message.id, "run not executable").await;
        }
        // A reverted retry is back in PENDING and has lost its checkpoint.
        let checkpoint_event_id = checkpoint_event_id.filter(|_| run.status == RunStatus::RetryingAfterFailure);

        if run.status == RunStatus::Pending && run.ttl_elapsed(self.now()) {
            if self.expire_run(&run.id).await?.is_none() {
                self.nack_later(&message.id).await?;
                return Ok(ConsumeOutcome::Requeued {
                    message_id: message.id.clone(),
                    reason: "expire rejected".to_string(),
                });
            }
            return Ok(ConsumeOutcome::Expired { run_id: run.id });
        }

        let Some(env) = self.store.get_environment(&run.environment_id).await? else {
            return self.drop_message(&message.id, "environment not found").await;
        };

        let workers = self.store.list_workers(&env.id).await?;
        let Some(worker) = resolve_worker(&workers, run.locked_to_version_id.as_deref()).cloned() else {
            if matches!(run.status, RunStatus::Pending | RunStatus::WaitingForDeploy) {
                self.store
                    .update_run(
                        &run.id,
                        &[RunStatus::Pending, RunStatus::WaitingForDeploy],
                        RunPatch::status(RunStatus::WaitingForDeploy),
                    )
                    .await?;
                self.queue.acknowledge(&message.id).await?;
                tracing::info!(
                    target: "courier::consumer",
                    run_id = %run.id,
                    environment_id = %env.id,
                    "No worker deployed, run waiting for deploy"
                );
                return Ok(ConsumeOutcome::WaitingForDeploy { run_id: run.id });
            }
            return self.drop_message(&message.id, "locked worker not found").await;
        };

        let Some(task) = worker.task(task_identifier).cloned() else {
            return self.drop_message(&message.id, "task not found in worker").await;
        };

        let queue = self.store.get_queue(&env.id, &run.queue).await?;
        let machine =
            machine_preset_for_run(run.machine_preset, task.machine_config.as_ref(), self.options.default_machine);

        let Some((run, attempt)) = self
            .create_attempt(&run, &worker, &task, queue.as_ref(), machine.name)
            .await?
        else {
            return self.drop_message(&message.id, "attempt creation rejected").await;
        };

        let payload = match self.execution_payload(&run, &attempt, &worker, &task, &env, queue.as_ref()).await {
            Ok(p) => p,
            Err(e) => return self.dispatch_failed(message, &attempt, e.to_string()).await,
        };

        if let Some(event_id) = checkpoint_event_id {
            match self.restore_checkpoint(&event_id, Some(payload.clone())).await {
                Ok(RestoreOutcome::Restored { .. }) => {
                    consumer.index.insert(&message.id, &attempt.id, &run.id);
                    self.emit_event(&run.id, "attempt_restored", serde_json::json!({ "attemptId": attempt.id }))
                        .await;
                    return Ok(ConsumeOutcome::Restored {
                        run_id: run.id,
                        attempt_id: attempt.id,
                    });
                }
                Ok(RestoreOutcome::Rejected { reason }) => {
                    tracing::warn!(
                        target: "courier::consumer",
                        run_id = %run.id,
                        reason = %reason,
                        "Retry checkpoint not restorable, dispatching cold"
                    );
                }
                Err(e) => return self.dispatch_failed(message, &attempt, e.to_string()).await,
            }
        }

        let frame = ServerMessage::BackgroundWorkerMessage {
            background_worker_id: worker.id.clone(),
            data: if consumer.is_session() {
                WorkerServerMessage::ExecuteRuns {
                    payloads: vec![payload],
                }
            } else {
                WorkerServerMessage::ScheduleAttempt {
                    id: message.id.clone(),
                    version: worker.version.clone(),
                    payload,
                }
            },
        };
        if let Err(e) = self.channel.send(&consumer.target, frame).await {
            return self.dispatch_failed(message, &attempt, e.to_string()).await;
        }

        consumer.index.insert(&message.id, &attempt.id, &run.id);
        self.emit_event(
            &run.id,
            "attempt_started",
            serde_json::json!({ "attemptId": attempt.id, "number": attempt.number, "machine": machine.name }),
        )
        .await;
        tracing::info!(
            target: "courier::consumer",
            consumer_id = %consumer.id,
            run_id = %run.id,
            attempt_id = %attempt.id,
            attempt_number = attempt.number,
            "Attempt dispatched"
        );
        Ok(ConsumeOutcome::Dispatched {
            run_id: run.id,
            attempt_id: attempt.id,
        })
    }

    async fn handle_redelivered_execute(
        &self,
        message: &QueueMessage,
        run: TaskRun,
    ) -> Result<ConsumeOutcome, EngineError> {
        let Some(attempt) = self.store.latest_attempt(&run.id).await? else {
            return self.drop_message(&message.id, "executing run without attempt").await;
        };
        if attempt.status.is_final() {
            return self.drop_message(&message.id, "executing run without open attempt").await;
        }
        tracing::warn!(
            target: "courier::consumer",
            run_id = %run.id,
            attempt_id = %attempt.id,
            "Lease expired on executing attempt, treating as heartbeat timeout"
        );
        let request = CompleteAttemptRequest::failure(
            &attempt.id,
            Some(&run.id),
            TaskRunError::internal(InternalErrorCode::TaskRunHeartbeatTimeout),
        );
        let outcome = self.complete_attempt(request).await?;
        Ok(ConsumeOutcome::HeartbeatTimeout {
            run_id: run.id,
            attempt_id: attempt.id,
            outcome,
        })
    }

    async fn dispatch_failed(
        &self,
        message: &QueueMessage,
        attempt: &TaskRunAttempt,
        reason: String,
    ) -> Result<ConsumeOutcome, EngineError> {
        self.metrics.record_dispatch_failure();
        tracing::warn!(
            target: "courier::consumer",
            run_id = %attempt.run_id,
            attempt_id = %attempt.id,
            reason = %reason,
            "Dispatch failed, reverting attempt"
        );
        self.revert_attempt(&attempt.id).await?;
        self.nack_later(&message.id).await?;
        Ok(ConsumeOutcome::Requeued {
            message_id: message.id.clone(),
            reason,
        })
    }

    async fn handle_resume(
        &self,
        consumer: &QueueConsumer,
        message: &QueueMessage,
        run: TaskRun,
        completed_attempt_ids: &[String],
        resumable_attempt_id: &str,
        checkpoint_event_id: Option<String>,
    ) -> Result<ConsumeOutcome, EngineError> {
        if run.status.is_final() {
            return self.drop_message(&message.id, "run already final").await;
        }
        let Some(attempt) = self.store.get_attempt(resumable_attempt_id).await? else {
            return self.drop_message(&message.id, "resumable attempt not found").await;
        };
        let env = self.environment(&run.environment_id).await?;

        let checkpoint_event_id = match checkpoint_event_id {
            Some(event_id) => Some(event_id),
            None if attempt.status == AttemptStatus::Executing => None,
            // The waiter checkpointed after this warm resume was queued.
            None if attempt.status == AttemptStatus::Paused => match self.paused_checkpoint_event(&attempt).await? {
                Some(event_id) => Some(event_id),
                None => {
                    self.nack_later(&message.id).await?;
                    return Ok(ConsumeOutcome::Requeued {
                        message_id: message.id.clone(),
                        reason: "checkpoint not recorded yet".to_string(),
                    });
                }
            },
            None => return self.drop_message(&message.id, "warm resume for attempt not executing").await,
        };
        if let Some(event_id) = &checkpoint_event_id {
            if !self.ensure_restored(&run, &attempt, event_id).await? {
                return self.drop_message(&message.id, "checkpoint not restorable").await;
            }
        }

        let (completions, executions) = self.completed_attempt_payloads(completed_attempt_ids).await?;
        let target = self.resume_target(consumer, &env, &attempt.id).await;
        let frame = ServerMessage::ResumeAfterDependency {
            attempt_id: attempt.id.clone(),
            run_id: run.id.clone(),
            completions,
            executions,
        };
        if let Err(e) = self.channel.send(&target, frame).await {
            self.nack_later(&message.id).await?;
            return Ok(ConsumeOutcome::Requeued {
                message_id: message.id.clone(),
                reason: e.to_string(),
            });
        }

        self.mark_resumed_in_flight(consumer, message, &run, &attempt).await?;
        tracing::info!(
            target: "courier::consumer",
            run_id = %run.id,
            attempt_id = %attempt.id,
            completed = completed_attempt_ids.len(),
            cold = checkpoint_event_id.is_some(),
            "Resumed after dependency"
        );
        Ok(ConsumeOutcome::Resumed {
            run_id: run.id,
            attempt_id: attempt.id,
        })
    }

    async fn handle_resume_after_duration(
        &self,
        consumer: &QueueConsumer,
        message: &QueueMessage,
        run: TaskRun,
        resumable_attempt_id: &str,
        checkpoint_event_id: &str,
    ) -> Result<ConsumeOutcome, EngineError> {
        if run.status.is_final() {
            return self.drop_message(&message.id, "run already final").await;
        }
        let Some(attempt) = self.store.get_attempt(resumable_attempt_id).await? else {
            return self.drop_message(&message.id, "resumable attempt not found").await;
        };
        if !self.ensure_restored(&run, &attempt, checkpoint_event_id).await? {
            return self.drop_message(&message.id, "checkpoint not restorable").await;
        }
        let env = self.environment(&run.environment_id).await?;
        let target = self.resume_target(consumer, &env, &attempt.id).await;
        let frame = ServerMessage::ResumeAfterDuration {
            attempt_id: attempt.id.clone(),
            attempt_friendly_id: attempt.friendly_id.clone(),
            run_id: run.id.clone(),
        };
        if let Err(e) = self.channel.send(&target, frame).await {
            self.nack_later(&message.id).await?;
            return Ok(ConsumeOutcome::Requeued {
                message_id: message.id.clone(),
                reason: e.to_string(),
            });
        }
        self.mark_resumed_in_flight(consumer, message, &run, &attempt).await?;
        Ok(ConsumeOutcome::Resumed {
            run_id: run.id,
            attempt_id: attempt.id,
        })
    }

    async fn paused_checkpoint_event(&self, attempt: &TaskRunAttempt) -> Result<Option<String>, EngineError> {
        let Some(checkpoint_id) = attempt.checkpoint_id.as_deref() else {
            return Ok(None);
        };
        Ok(self.store.checkpoint_event_for(checkpoint_id).await?.map(|e| e.id))
    }

    /// Restore the checkpoint, or accept a redelivery whose restore already happened.
    async fn ensure_restored(
        &self,
        run: &TaskRun,
        attempt: &TaskRunAttempt,
        event_id: &str,
    ) -> Result<bool, EngineError> {
        match self.restore_checkpoint(event_id, None).await? {
            RestoreOutcome::Restored { .. } => Ok(true),
            RestoreOutcome::Rejected { reason } => {
                let current = self.store.get_run(&run.id).await?;
                let already = current.is_some_and(|r| r.status == RunStatus::Executing)
                    && self
                        .store
                        .get_attempt(&attempt.id)
                        .await?
                        .is_some_and(|a| a.status == AttemptStatus::Executing);
                if !already {
                    tracing::warn!(target: "courier::consumer", run_id = %run.id, reason = %reason, "Restore rejected");
                }
                Ok(already)
            }
        }
    }

    /// Swap the message back to EXECUTE so a later lease expiry reads as a
    /// heartbeat timeout, and extend the lease.
    async fn mark_resumed_in_flight(
        &self,
        consumer: &QueueConsumer,
        message: &QueueMessage,
        run: &TaskRun,
        attempt: &TaskRunAttempt,
    ) -> Result<(), EngineError> {
        self.queue
            .replace(
                &message.id,
                MessageBody::Execute {
                    task_identifier: run.task_identifier.clone(),
                    checkpoint_event_id: None,
                },
                None,
            )
            .await?;
        self.queue
            .heartbeat(&message.id, self.options.heartbeat_extension())
            .await?;
        consumer.index.insert(&message.id, &attempt.id, &run.id);
        self.metrics.record_resume();
        Ok(())
    }

    async fn resume_target(&self, consumer: &QueueConsumer, env: &RuntimeEnvironment, attempt_id: &str) -> ChannelTarget {
        if env.is_development() {
            if let Some(session) = self.sessions.session_for_attempt(&env.id, attempt_id).await {
                return ChannelTarget::Session(session);
            }
            if consumer.is_session() {
                return consumer.target.clone();
            }
        }
        ChannelTarget::Coordinator
    }

    /// Results and executions for the attempts a resumed attempt waited on.
    pub(crate) async fn completed_attempt_payloads(
        &self,
        attempt_ids: &[String],
    ) -> Result<(Vec<ExecutionResult>, Vec<TaskRunExecution>), EngineError> {
        let mut completions = Vec::with_capacity(attempt_ids.len());
        let mut executions = Vec::with_capacity(attempt_ids.len());
        for id in attempt_ids {
            let Some(attempt) = self.store.get_attempt(id).await? else {
                tracing::warn!(target: "courier::consumer", attempt_id = %id, "Completed attempt missing");
                continue;
            };
            let Some(run) = self.store.get_run(&attempt.run_id).await? else {
                continue;
            };
            completions.push(match attempt.status {
                AttemptStatus::Completed => ExecutionResult::Success {
                    id: attempt.id.clone(),
                    output: attempt.output.clone(),
                    output_type: attempt.output_type.clone(),
                },
                _ => ExecutionResult::Failure {
                    id: attempt.id.clone(),
                    error: attempt
                        .error
                        .clone()
                        .or_else(|| run.error.clone())
                        .unwrap_or_else(|| TaskRunError::internal(InternalErrorCode::TaskRunCrashed)),
                    retry: None,
                    skipped_retrying: false,
                },
            });

            let env = self.environment(&run.environment_id).await?;
            let Some(worker) = self.store.get_worker(&attempt.background_worker_id).await? else {
                continue;
            };
            let Some(task) = worker.tasks.iter().find(|t| t.id == attempt.background_worker_task_id) else {
                continue;
            };
            let queue = self.store.get_queue(&env.id, &run.queue).await?;
            executions.push(
                self.build_execution(&run, &attempt, &worker, task, &env, queue.as_ref())
                    .await?,
            );
        }
        Ok((completions, executions))
    }

    pub(crate) async fn build_execution(
        &self,
        run: &TaskRun,
        attempt: &TaskRunAttempt,
        worker: &BackgroundWorker,
        task: &BackgroundWorkerTask,
        env: &RuntimeEnvironment,
        queue: Option<&TaskQueue>,
    ) -> Result<TaskRunExecution, EngineError> {
        let batch_id = self
            .store
            .dependency_for_run(&run.id)
            .await?
            .and_then(|d| d.dependent_batch_id);
        Ok(TaskRunExecution {
            task: ExecutionTask {
                id: task.slug.clone(),
                file_path: task.file_path.clone(),
                export_name: task.export_name.clone(),
            },
            attempt: ExecutionAttempt {
                id: attempt.id.clone(),
                number: attempt.number,
                started_at: attempt.started_at,
                status: attempt.status,
                background_worker_id: worker.id.clone(),
                background_worker_task_id: task.id.clone(),
            },
            run: ExecutionRun {
                id: run.id.clone(),
                friendly_id: run.friendly_id.clone(),
                payload: run.payload.clone(),
                payload_type: run.payload_type.clone(),
                tags: run.tags.clone(),
                is_test: run.is_test,
                created_at: run.created_at,
                started_at: run.started_at,
                idempotency_key: run.idempotency_key.clone(),
                max_attempts: task.retry_config.as_ref().map(|r| r.resolved().max_attempts),
                max_duration_secs: run.max_duration_secs.or(task.max_duration_secs),
            },
            queue: ExecutionQueue {
                id: queue.map(|q| q.id.clone()).unwrap_or_else(|| run.queue.clone()),
                name: run.queue.clone(),
            },
            environment: ExecutionEnvironment {
                id: env.id.clone(),
                slug: env.slug.clone(),
                env_type: env.env_type,
            },
            organization: env.organization.clone(),
            project: env.project.clone(),
            batch_id,
            machine: attempt.machine_preset.preset(),
        })
    }

    pub(crate) async fn execution_payload(
        &self,
        run: &TaskRun,
        attempt: &TaskRunAttempt,
        worker: &BackgroundWorker,
        task: &BackgroundWorkerTask,
        env: &RuntimeEnvironment,
        queue: Option<&TaskQueue>,
    ) -> Result<TaskRunExecutionPayload, EngineError> {
        let execution = self.build_execution(run, attempt, worker, task, env, queue).await?;
        let environment = self.env_vars.for_environment(env).await?;
        Ok(TaskRunExecutionPayload {
            execution,
            environment,
        })
    }
}
