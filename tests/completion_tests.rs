//! Attempt completion: final statuses, retry dispatch paths and idempotency.

mod common;

use chrono::Utc;
use std::time::Duration;

use common::*;
use courier::channel::{ChannelTarget, ServerMessage};
use courier::errors::{EngineError, InternalErrorCode, TaskRunError};
use courier::machines::MachinePresetName;
use courier::model::{BackgroundWorkerTask, CheckpointLocation, CheckpointType, ExecutionResult, RetryDirective};
use courier::providers::Lease;
use courier::retry::{OutOfMemoryRetry, RetryOptions};
use courier::runtime::{CompleteAttemptRequest, CompletionOutcome, ConsumeOutcome, EngineOptions, RetryDispatch};
use courier::status::{AttemptStatus, RunStatus};
use courier::versions::WorkerCapabilities;

fn user_error(message: &str) -> TaskRunError {
    TaskRunError::BuiltInError {
        name: "Error".to_string(),
        message: message.to_string(),
        stack_trace: "Error: boom\n    at run (src/trigger/send-email.ts:12:9)".to_string(),
    }
}

fn failure(attempt_id: &str, error: TaskRunError) -> CompleteAttemptRequest {
    CompleteAttemptRequest::failure(attempt_id, None, error)
}

fn failure_with_delay(attempt_id: &str, error: TaskRunError, delay_ms: u64) -> CompleteAttemptRequest {
    CompleteAttemptRequest::new(
        attempt_id,
        ExecutionResult::Failure {
            id: attempt_id.to_string(),
            error,
            retry: Some(RetryDirective {
                timestamp: Utc::now().timestamp_millis() + delay_ms as i64,
                delay: delay_ms,
            }),
            skipped_retrying: false,
        },
    )
}

fn retrying(retry: RetryOptions) -> Vec<BackgroundWorkerTask> {
    vec![with_retry(task("send-email"), retry)]
}

#[tokio::test]
async fn success_completes_run_and_acknowledges() {
    let fx = fixture().await;
    fx.deploy(vec![task("send-email")]).await;
    let (run, attempt) = fx.start("send-email").await;

    let outcome = fx
        .engine
        .complete_attempt(CompleteAttemptRequest::success(&attempt.id, Some(r#"{"sent":true}"#.to_string())))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        CompletionOutcome::Completed {
            status: RunStatus::CompletedSuccessfully
        }
    );

    let run = fx.run(&run.id).await;
    assert_eq!(run.status, RunStatus::CompletedSuccessfully);
    assert_eq!(run.output.as_deref(), Some(r#"{"sent":true}"#));
    assert!(run.completed_at.is_some());
    let attempt = fx.attempt(&attempt.id).await;
    assert_eq!(attempt.status, AttemptStatus::Completed);
    assert_eq!(attempt.output.as_deref(), Some(r#"{"sent":true}"#));
    assert!(fx.message(&run.id).await.is_none());
    assert!(fx.sink.contains(&SinkRecord::Complete { run_id: run.id.clone() }));
    assert_eq!(fx.engine.metrics().runs_succeeded, 1);
}

#[tokio::test]
async fn repeated_completion_is_ignored() {
    let fx = fixture().await;
    fx.deploy(vec![task("send-email")]).await;
    let (run, attempt) = fx.start("send-email").await;

    fx.engine
        .complete_attempt(CompleteAttemptRequest::success(&attempt.id, None))
        .await
        .unwrap();
    let again = fx
        .engine
        .complete_attempt(CompleteAttemptRequest::success(&attempt.id, None))
        .await
        .unwrap();
    assert_eq!(again, CompletionOutcome::AlreadyCompleted);
    let late_failure = fx
        .engine
        .complete_attempt(failure(&attempt.id, user_error("late")))
        .await
        .unwrap();
    assert_eq!(late_failure, CompletionOutcome::AlreadyCompleted);

    assert_eq!(fx.run(&run.id).await.status, RunStatus::CompletedSuccessfully);
    assert_eq!(fx.engine.metrics().runs_succeeded, 1);
}

#[tokio::test]
async fn oversized_output_fails_attempt() {
    let options = EngineOptions {
        max_output_bytes: 16,
        ..test_options()
    };
    let fx = fixture_with(options).await;
    fx.deploy(retrying(retry_config(3, 10))).await;
    let (run, attempt) = fx.start("send-email").await;

    let output = format!(r#"{{"body":"{}"}}"#, "x".repeat(64));
    let outcome = fx
        .engine
        .complete_attempt(CompleteAttemptRequest::success(&attempt.id, Some(output)))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        CompletionOutcome::Completed {
            status: RunStatus::CompletedWithErrors
        }
    );
    let attempt = fx.attempt(&attempt.id).await;
    assert_eq!(attempt.status, AttemptStatus::Failed);
    assert_eq!(
        attempt.error.and_then(|e| e.internal_code()),
        Some(InternalErrorCode::TaskOutputError)
    );
    assert!(fx.run(&run.id).await.output.is_none());
}

#[tokio::test]
async fn inferred_retry_requeues_after_backoff() {
    let fx = fixture().await;
    fx.deploy(retrying(retry_config(3, 40))).await;
    let (run, first) = fx.start("send-email").await;

    let outcome = fx
        .engine
        .complete_attempt(failure(&first.id, user_error("smtp timeout")))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        CompletionOutcome::Retried {
            dispatch: RetryDispatch::InferredDelay,
            delay_ms: 40
        }
    );
    assert_eq!(fx.run(&run.id).await.status, RunStatus::RetryingAfterFailure);
    assert_eq!(fx.attempt(&first.id).await.status, AttemptStatus::Failed);
    let message = fx.message(&run.id).await.unwrap();
    assert_eq!(message.lease, None);
    assert!(message.available_at > Utc::now());
    assert_eq!(fx.consume().await, ConsumeOutcome::Empty);
    assert!(fx.sink.event_names(&run.id).contains(&"retrying".to_string()));

    tokio::time::sleep(Duration::from_millis(60)).await;
    let (_, second_id) = fx.dispatch_next().await;
    let second = fx.attempt(&second_id).await;
    assert_eq!(second.number, 2);
    let run = fx.run(&run.id).await;
    assert_eq!(run.status, RunStatus::Executing);
    assert_eq!(run.attempt_count, 2);
    assert_eq!(fx.engine.metrics().retries_scheduled, 1);

    fx.engine
        .complete_attempt(CompleteAttemptRequest::success(&second_id, None))
        .await
        .unwrap();
    assert_eq!(fx.run(&run.id).await.status, RunStatus::CompletedSuccessfully);
}

#[tokio::test]
async fn worker_known_delay_retries_in_place() {
    let fx = fixture().await;
    fx.deploy(retrying(retry_config(3, 10))).await;
    let (run, first) = fx.start("send-email").await;

    let outcome = fx
        .engine
        .complete_attempt(failure_with_delay(&first.id, user_error("rate limited"), 50))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        CompletionOutcome::Retried {
            dispatch: RetryDispatch::Direct,
            delay_ms: 50
        }
    );
    let ready = fx.channel.of_kind("READY_FOR_RETRY");
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].0, ChannelTarget::Coordinator);
    assert_eq!(ready[0].1, ServerMessage::ReadyForRetry { run_id: run.id.clone() });
    assert!(matches!(fx.message(&run.id).await.unwrap().lease, Some(Lease::Until(_))));
    assert_eq!(fx.consume().await, ConsumeOutcome::Empty);

    tokio::time::sleep(Duration::from_millis(80)).await;
    let (_, second_id) = fx.dispatch_next().await;
    assert_eq!(fx.attempt(&second_id).await.number, 2);
}

#[tokio::test]
async fn oversized_worker_delay_is_clamped() {
    let fx = fixture().await;
    fx.deploy(retrying(retry_config(3, 10))).await;
    let (run, first) = fx.start("send-email").await;
    let max_delay_ms = EngineOptions::default().max_retry_delay_ms;

    let outcome = fx
        .engine
        .complete_attempt(failure_with_delay(&first.id, user_error("rate limited"), u64::MAX))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        CompletionOutcome::Retried {
            dispatch: RetryDispatch::Direct,
            delay_ms: max_delay_ms
        }
    );
    let Some(Lease::Until(until)) = fx.message(&run.id).await.unwrap().lease else {
        panic!("retry should keep the message leased");
    };
    assert!(until > Utc::now() + chrono::Duration::days(29));
    assert!(until <= Utc::now() + chrono::Duration::days(31));
}

#[tokio::test]
async fn worker_without_lazy_attempts_requeues() {
    let fx = fixture().await;
    let mut w = worker(PROD_ENV, "worker-1", "20240101.1", retrying(retry_config(3, 10)));
    w.supports_lazy_attempts = false;
    fx.deploy_worker(w).await;
    let (run, attempt) = fx.start("send-email").await;

    let outcome = fx
        .engine
        .complete_attempt(failure_with_delay(&attempt.id, user_error("boom"), 20))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        CompletionOutcome::Retried {
            dispatch: RetryDispatch::NoLazyAttempts,
            delay_ms: 20
        }
    );
    assert_eq!(fx.channel.count("READY_FOR_RETRY"), 0);
    assert_eq!(fx.message(&run.id).await.unwrap().lease, None);
}

#[tokio::test]
async fn long_delay_without_retry_checkpoints_requeues() {
    let fx = fixture().await;
    let mut w = worker(PROD_ENV, "worker-1", "20240101.1", retrying(retry_config(3, 10)));
    w.sdk_version = "3.0.0-beta.10".to_string();
    fx.deploy_worker(w).await;
    let (run, attempt) = fx.start("send-email").await;

    let outcome = fx
        .engine
        .complete_attempt(failure_with_delay(&attempt.id, user_error("boom"), 60_000))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        CompletionOutcome::Retried {
            dispatch: RetryDispatch::DelayOverThreshold,
            delay_ms: 60_000
        }
    );
    let message = fx.message(&run.id).await.unwrap();
    assert_eq!(message.lease, None);
    assert!(message.available_at > Utc::now() + chrono::Duration::seconds(50));
}

#[tokio::test]
async fn capabilities_on_request_override_worker() {
    let fx = fixture().await;
    fx.deploy(retrying(retry_config(3, 10))).await;
    let (_, attempt) = fx.start("send-email").await;

    let request = failure_with_delay(&attempt.id, user_error("boom"), 10).with_capabilities(WorkerCapabilities {
        supports_retry_checkpoints: true,
        supports_exit_delay: true,
        supports_lazy_attempts: false,
    });
    let outcome = fx.engine.complete_attempt(request).await.unwrap();
    assert!(matches!(
        outcome,
        CompletionOutcome::Retried {
            dispatch: RetryDispatch::NoLazyAttempts,
            ..
        }
    ));
}

#[tokio::test]
async fn retry_checkpoint_restores_into_next_attempt() {
    let fx = fixture().await;
    fx.deploy(retrying(retry_config(3, 20))).await;
    let (run, first) = fx.start("send-email").await;

    let request = failure(&first.id, user_error("flaky")).with_checkpoint(CheckpointLocation {
        location: "s3://checkpoints/run-1".to_string(),
        image_ref: "registry.local/send-email:20240101.1".to_string(),
        checkpoint_type: CheckpointType::Docker,
    });
    let outcome = fx.engine.complete_attempt(request).await.unwrap();
    assert_eq!(
        outcome,
        CompletionOutcome::Retried {
            dispatch: RetryDispatch::Checkpoint,
            delay_ms: 20
        }
    );
    assert_eq!(fx.attempt(&first.id).await.status, AttemptStatus::Failed, "retry checkpoints do not pause");

    tokio::time::sleep(Duration::from_millis(40)).await;
    let outcome = fx.consume().await;
    let ConsumeOutcome::Restored { run_id, attempt_id } = outcome else {
        panic!("expected a restore, got {outcome:?}");
    };
    assert_eq!(run_id, run.id);
    assert_eq!(fx.attempt(&attempt_id).await.number, 2);

    let restores = fx.channel.of_kind("RESTORE");
    assert_eq!(restores.len(), 1);
    let (target, ServerMessage::Restore { location, execution, .. }) = &restores[0] else {
        unreachable!();
    };
    assert_eq!(*target, ChannelTarget::Provider);
    assert_eq!(location, "s3://checkpoints/run-1");
    let execution = execution.as_ref().expect("next attempt's payload travels with the restore");
    assert_eq!(execution.execution.attempt.id, attempt_id);
    assert_eq!(fx.channel.count("BACKGROUND_WORKER_MESSAGE"), 1, "no cold push for the retry");

    let metrics = fx.engine.metrics();
    assert_eq!(metrics.checkpoints_created, 1);
    assert_eq!(metrics.restores, 1);
}

#[tokio::test]
async fn out_of_memory_upgrades_machine_once() {
    let fx = fixture().await;
    let mut retry = retry_config(3, 10);
    retry.out_of_memory = Some(OutOfMemoryRetry {
        machine: Some(MachinePresetName::Large1x),
    });
    fx.deploy(retrying(retry)).await;
    let (run, first) = fx.start("send-email").await;
    assert_eq!(first.machine_preset, MachinePresetName::Small1x);

    let oom = TaskRunError::internal(InternalErrorCode::TaskProcessOomKilled);
    let outcome = fx.engine.complete_attempt(failure(&first.id, oom.clone())).await.unwrap();
    assert_eq!(
        outcome,
        CompletionOutcome::Retried {
            dispatch: RetryDispatch::ForcedRequeue,
            delay_ms: 10
        }
    );
    assert_eq!(fx.run(&run.id).await.machine_preset, Some(MachinePresetName::Large1x));
    let exits = fx.channel.of_kind("REQUEST_EXIT");
    assert_eq!(exits.len(), 1);
    assert_eq!(exits[0].0, ChannelTarget::Coordinator);

    tokio::time::sleep(Duration::from_millis(30)).await;
    let (_, second_id) = fx.dispatch_next().await;
    let second = fx.attempt(&second_id).await;
    assert_eq!(second.machine_preset, MachinePresetName::Large1x);
    let payloads = fx.channel.dispatched_payloads();
    assert_eq!(payloads.last().unwrap().execution.machine.name, MachinePresetName::Large1x);

    let outcome = fx.engine.complete_attempt(failure(&second_id, oom)).await.unwrap();
    assert_eq!(outcome, CompletionOutcome::Completed { status: RunStatus::Crashed });
}

#[tokio::test]
async fn attempt_ceiling_is_a_system_failure() {
    let options = EngineOptions {
        max_attempts_ceiling: 1,
        ..test_options()
    };
    let fx = fixture_with(options).await;
    fx.deploy(retrying(retry_config(5, 10))).await;
    let (run, attempt) = fx.start("send-email").await;

    let outcome = fx
        .engine
        .complete_attempt(failure(&attempt.id, user_error("boom")))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        CompletionOutcome::Completed {
            status: RunStatus::SystemFailure
        }
    );
    assert_eq!(fx.run(&run.id).await.status, RunStatus::SystemFailure);
}

#[tokio::test]
async fn attempt_ceiling_caps_task_retries() {
    let options = EngineOptions {
        max_attempts_ceiling: 3,
        ..test_options()
    };
    let fx = fixture_with(options).await;
    fx.deploy(retrying(retry_config(5, 20))).await;
    let (run, first) = fx.start("send-email").await;

    let mut attempt_id = first.id.clone();
    for number in 1..=2 {
        assert_eq!(fx.attempt(&attempt_id).await.number, number);
        let outcome = fx
            .engine
            .complete_attempt(failure(&attempt_id, user_error("smtp timeout")))
            .await
            .unwrap();
        assert!(
            matches!(
                outcome,
                CompletionOutcome::Retried {
                    dispatch: RetryDispatch::InferredDelay,
                    ..
                }
            ),
            "attempt {number} should retry, got {outcome:?}"
        );
        tokio::time::sleep(Duration::from_millis(120)).await;
        let (_, next) = fx.dispatch_next().await;
        attempt_id = next;
    }

    let last = fx.attempt(&attempt_id).await;
    assert_eq!(last.number, 3);
    let outcome = fx
        .engine
        .complete_attempt(failure(&attempt_id, user_error("smtp timeout")))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        CompletionOutcome::Completed {
            status: RunStatus::SystemFailure
        }
    );
    let run = fx.run(&run.id).await;
    assert_eq!(run.status, RunStatus::SystemFailure);
    assert_eq!(run.attempt_count, 3);
    assert_eq!(fx.attempts(&run.id).await.len(), 3);
    assert!(fx.message(&run.id).await.is_none());
    assert_eq!(fx.engine.metrics().retries_scheduled, 2);
}

#[tokio::test]
async fn exhausted_retries_complete_with_errors() {
    let fx = fixture().await;
    fx.deploy(retrying(retry_config(1, 10))).await;
    let (run, attempt) = fx.start("send-email").await;

    let outcome = fx
        .engine
        .complete_attempt(failure(&attempt.id, user_error("bad address")))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        CompletionOutcome::Completed {
            status: RunStatus::CompletedWithErrors
        }
    );
    let run = fx.run(&run.id).await;
    assert_eq!(run.error.as_ref().map(|e| e.summary()).as_deref(), Some("Error: bad address"));
    assert!(fx.message(&run.id).await.is_none());
    assert!(fx.sink.event_names(&run.id).contains(&"failed".to_string()));
    assert_eq!(fx.engine.metrics().runs_failed, 1);
}

#[tokio::test]
async fn skipped_retrying_finishes_run() {
    let fx = fixture().await;
    fx.deploy(retrying(retry_config(5, 10))).await;
    let (run, attempt) = fx.start("send-email").await;

    let request = CompleteAttemptRequest::new(
        &attempt.id,
        ExecutionResult::Failure {
            id: attempt.id.clone(),
            error: user_error("abort"),
            retry: None,
            skipped_retrying: true,
        },
    );
    let outcome = fx.engine.complete_attempt(request).await.unwrap();
    assert_eq!(
        outcome,
        CompletionOutcome::Completed {
            status: RunStatus::CompletedWithErrors
        }
    );
    assert_eq!(fx.run(&run.id).await.attempt_count, 1);
}

#[tokio::test]
async fn non_retryable_code_is_not_retried() {
    let fx = fixture().await;
    fx.deploy(retrying(retry_config(5, 10))).await;
    let (_, attempt) = fx.start("send-email").await;

    let outcome = fx
        .engine
        .complete_attempt(failure(
            &attempt.id,
            TaskRunError::internal(InternalErrorCode::CouldNotImportTask),
        ))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        CompletionOutcome::Completed {
            status: RunStatus::CompletedWithErrors
        }
    );
}

#[tokio::test]
async fn crash_code_without_retry_config_crashes() {
    let fx = fixture().await;
    fx.deploy(vec![task("send-email")]).await;
    let (run, attempt) = fx.start("send-email").await;

    let outcome = fx
        .engine
        .complete_attempt(failure(
            &attempt.id,
            TaskRunError::internal(InternalErrorCode::TaskProcessSigsegv),
        ))
        .await
        .unwrap();
    assert_eq!(outcome, CompletionOutcome::Completed { status: RunStatus::Crashed });
    assert!(fx.sink.contains(&SinkRecord::Crash { run_id: run.id.clone() }));
}

#[tokio::test]
async fn max_duration_exceeded_times_out() {
    let fx = fixture().await;
    fx.deploy(retrying(retry_config(5, 10))).await;
    let (run, attempt) = fx.start("send-email").await;

    let outcome = fx
        .engine
        .complete_attempt(failure(
            &attempt.id,
            TaskRunError::internal_with_message(InternalErrorCode::MaxDurationExceeded, "ran for 300s"),
        ))
        .await
        .unwrap();
    assert_eq!(outcome, CompletionOutcome::Completed { status: RunStatus::TimedOut });
    assert_eq!(fx.run(&run.id).await.status, RunStatus::TimedOut);
}

#[tokio::test]
async fn completion_for_unknown_attempt() {
    let fx = fixture().await;
    fx.deploy(vec![task("send-email")]).await;
    let (run, _) = fx.start("send-email").await;

    let err = fx
        .engine
        .complete_attempt(failure("attempt-gone", user_error("boom")))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AttemptNotFound(id) if id == "attempt-gone"));

    let outcome = fx
        .engine
        .complete_attempt(CompleteAttemptRequest::failure(
            "attempt-gone",
            Some(&run.id),
            user_error("boom"),
        ))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        CompletionOutcome::Completed {
            status: RunStatus::SystemFailure
        }
    );
    let attempts = fx.attempts(&run.id).await;
    assert!(attempts.iter().all(|a| a.status == AttemptStatus::Failed), "open attempts fail with the run");
}
