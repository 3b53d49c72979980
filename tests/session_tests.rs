//! Development sessions, inbound frame routing and heartbeats.

mod common;

use std::time::Duration;

use common::tracing_capture::install_tracing_capture;
use common::*;
use courier::channel::{ChannelTarget, ServerMessage, WorkerClientMessage, WorkerMessage, WorkerServerMessage};
use courier::client::TriggerOptions;
use courier::errors::{InternalErrorCode, TaskRunError};
use courier::model::{ExecutionResult, TaskRunExecutionPayload};
use courier::providers::Store;
use courier::runtime::{CancelOptions, ConsumeOutcome, EngineOptions, MessageOrigin};
use courier::status::{AttemptStatus, RunStatus};

const SESSION: &str = "sess-1";

async fn dev_fixture() -> Fixture {
    let fx = fixture().await;
    fx.deploy_worker(worker(DEV_ENV, "dev-worker", "20240101.1", vec![task("send-email")]))
        .await;
    fx
}

async fn trigger_dev(fx: &Fixture) -> courier::model::TaskRun {
    fx.client
        .trigger(DEV_ENV, "send-email", Some(r#"{"to":"dev@example.com"}"#.to_string()), TriggerOptions::default())
        .await
        .unwrap()
        .run
}

/// Wait until the session consumer has dispatched `run_id` and indexed its attempt.
async fn wait_for_dispatch(fx: &Fixture, run_id: &str) -> Vec<TaskRunExecutionPayload> {
    let sink = fx.sink.clone();
    let dispatched = wait_until(2_000, || {
        let started = sink.event_names(run_id).iter().any(|n| n == "attempt_started");
        async move { started }
    })
    .await;
    assert!(dispatched, "session consumer did not dispatch");
    fx.channel.dispatched_payloads()
}

fn worker_frame(worker_id: &str, data: WorkerClientMessage) -> WorkerMessage {
    WorkerMessage::BackgroundWorkerMessage {
        background_worker_id: worker_id.to_string(),
        data,
    }
}

#[tokio::test]
async fn connect_is_idempotent_and_disconnect_reports() {
    let fx = fixture().await;
    fx.engine.connect_dev_session(DEV_ENV, SESSION).await.unwrap();
    fx.engine.connect_dev_session(DEV_ENV, SESSION).await.unwrap();

    let ready = fx.channel.of_kind("SERVER_READY");
    assert_eq!(
        ready,
        vec![(
            ChannelTarget::Session(SESSION.to_string()),
            ServerMessage::ServerReady {
                environment_id: DEV_ENV.to_string(),
                session_id: SESSION.to_string(),
            }
        )]
    );

    assert!(fx.engine.disconnect_dev_session(SESSION).await);
    assert!(!fx.engine.disconnect_dev_session(SESSION).await);
}

#[tokio::test]
async fn failed_session_consumer_is_logged_on_disconnect() {
    let (logs, _guard) = install_tracing_capture();
    let (fx, hooked) = fixture_with_hooked_queue(test_options()).await;
    hooked.panic_on_dequeue();

    fx.engine.connect_dev_session(DEV_ENV, SESSION).await.unwrap();
    let queue = hooked.clone();
    assert!(wait_until(2_000, || {
        let panicked = queue.dequeue_panicked();
        async move { panicked }
    })
    .await);

    assert!(fx.engine.disconnect_dev_session(SESSION).await);
    let failed = logs.matching("courier::sessions", "Session consumer task failed");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].level, tracing::Level::WARN);
    assert_eq!(failed[0].field("session_id").as_deref(), Some(SESSION));
    assert!(logs.contains("courier::sessions", "Development session disconnected"));
}

#[tokio::test]
async fn session_consumer_dispatches_development_runs() {
    let fx = dev_fixture().await;
    let run = trigger_dev(&fx).await;

    // Production consumers never see development scopes.
    assert_eq!(fx.consume().await, ConsumeOutcome::Empty);

    fx.engine.connect_dev_session(DEV_ENV, SESSION).await.unwrap();
    let payloads = wait_for_dispatch(&fx, &run.id).await;
    assert_eq!(payloads[0].execution.run.id, run.id);

    let (target, frame) = &fx.channel.of_kind("BACKGROUND_WORKER_MESSAGE")[0];
    assert_eq!(*target, ChannelTarget::Session(SESSION.to_string()));
    match frame {
        ServerMessage::BackgroundWorkerMessage {
            background_worker_id,
            data: WorkerServerMessage::ExecuteRuns { payloads },
        } => {
            assert_eq!(background_worker_id, "dev-worker");
            assert_eq!(payloads.len(), 1);
        }
        other => panic!("unexpected frame {other:?}"),
    }
    assert_eq!(fx.run(&run.id).await.status, RunStatus::Executing);

    // A completion arriving as a wire envelope finishes the run.
    let attempt_id = payloads[0].execution.attempt.id.clone();
    assert_eq!(
        fx.engine.sessions().session_for_attempt(DEV_ENV, &attempt_id).await.as_deref(),
        Some(SESSION)
    );
    let completed = worker_frame(
        "dev-worker",
        WorkerClientMessage::TaskRunCompleted {
            completion: ExecutionResult::Success {
                id: attempt_id.clone(),
                output: Some(r#"{"sent":true}"#.to_string()),
                output_type: "application/json".to_string(),
            },
            execution: payloads[0].execution.clone(),
        },
    );
    fx.engine
        .handle_envelope(&MessageOrigin::session(DEV_ENV, SESSION), completed.to_envelope().unwrap())
        .await
        .unwrap();

    let run = fx.run(&run.id).await;
    assert_eq!(run.status, RunStatus::CompletedSuccessfully);
    assert_eq!(run.output.as_deref(), Some(r#"{"sent":true}"#));
    assert_eq!(fx.attempt(&attempt_id).await.status, AttemptStatus::Completed);
    assert_eq!(fx.engine.sessions().session_for_attempt(DEV_ENV, &attempt_id).await, None);

    fx.engine.shutdown().await;
}

#[tokio::test]
async fn development_cancellation_targets_the_session() {
    let fx = dev_fixture().await;
    let run = trigger_dev(&fx).await;
    fx.engine.connect_dev_session(DEV_ENV, SESSION).await.unwrap();
    let payloads = wait_for_dispatch(&fx, &run.id).await;
    let attempt_id = payloads[0].execution.attempt.id.clone();

    fx.engine.cancel_run(&run.id, CancelOptions::default()).await.unwrap();

    assert_eq!(
        fx.channel.of_kind("REQUEST_ATTEMPT_CANCELLATION"),
        vec![(
            ChannelTarget::Session(SESSION.to_string()),
            ServerMessage::RequestAttemptCancellation {
                attempt_id: attempt_id.clone(),
                task_run_id: run.id.clone(),
            }
        )]
    );
    assert_eq!(fx.channel.count("REQUEST_RUN_CANCELLATION"), 0);
    assert_eq!(fx.attempt(&attempt_id).await.status, AttemptStatus::Canceled);

    fx.engine.shutdown().await;
}

#[tokio::test]
async fn heartbeats_keep_the_lease_alive() {
    let options = EngineOptions {
        visibility_timeout_ms: 100,
        heartbeat_extension_ms: 5_000,
        ..test_options()
    };
    let fx = fixture_with(options).await;
    fx.deploy(vec![task("send-email")]).await;
    let (run, attempt) = fx.start("send-email").await;

    let heartbeat = worker_frame(
        "worker-1",
        WorkerClientMessage::TaskHeartbeat {
            attempt_id: attempt.id.clone(),
        },
    );
    fx.engine
        .handle_envelope(&MessageOrigin::pool(PROD_ENV), heartbeat.to_envelope().unwrap())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(fx.consume().await, ConsumeOutcome::Empty);
    assert_eq!(fx.run(&run.id).await.status, RunStatus::Executing);

    let run_heartbeat = worker_frame("worker-1", WorkerClientMessage::TaskRunHeartbeat { run_id: run.id.clone() });
    fx.engine
        .handle_worker_message(&MessageOrigin::pool(PROD_ENV), run_heartbeat)
        .await
        .unwrap();
    assert!(fx.engine.heartbeat_run(&run.id).await.unwrap());

    fx.engine
        .complete_attempt(courier::runtime::CompleteAttemptRequest::success(&attempt.id, None))
        .await
        .unwrap();
    assert!(!fx.engine.heartbeat_attempt(&attempt.id).await.unwrap());
    assert!(!fx.engine.heartbeat_run(&run.id).await.unwrap());
    assert!(!fx.engine.heartbeat_attempt("attempt-missing").await.unwrap());
}

#[tokio::test]
async fn deprecation_is_scoped_to_origin_environment() {
    let fx = fixture().await;
    fx.deploy(vec![task("send-email")]).await;
    let deprecate = WorkerMessage::BackgroundWorkerDeprecated {
        background_worker_id: "worker-1".to_string(),
    };

    fx.engine
        .handle_worker_message(&MessageOrigin::session(DEV_ENV, SESSION), deprecate.clone())
        .await
        .unwrap();
    assert!(!fx.store.get_worker("worker-1").await.unwrap().unwrap().deprecated);

    fx.engine
        .handle_worker_message(&MessageOrigin::pool(PROD_ENV), deprecate)
        .await
        .unwrap();
    assert!(fx.store.get_worker("worker-1").await.unwrap().unwrap().deprecated);
}

#[tokio::test]
async fn failed_to_run_is_a_system_failure() {
    let fx = fixture().await;
    fx.deploy(vec![with_retry(task("send-email"), retry_config(3, 40))]).await;
    let (run, attempt) = fx.start("send-email").await;

    let frame = worker_frame(
        "worker-1",
        WorkerClientMessage::TaskRunFailedToRun {
            completion: ExecutionResult::Failure {
                id: attempt.id.clone(),
                error: TaskRunError::internal(InternalErrorCode::CouldNotImportTask),
                retry: None,
                skipped_retrying: false,
            },
        },
    );
    fx.engine
        .handle_worker_message(&MessageOrigin::pool(PROD_ENV), frame)
        .await
        .unwrap();

    let run = fx.run(&run.id).await;
    assert_eq!(run.status, RunStatus::SystemFailure);
    assert_eq!(
        run.error.and_then(|e| e.internal_code()),
        Some(InternalErrorCode::CouldNotImportTask)
    );
    assert_eq!(fx.attempt(&attempt.id).await.status, AttemptStatus::Failed);
    assert!(fx.message(&run.id).await.is_none());
}

#[tokio::test]
async fn ready_for_tasks_is_accepted() {
    let fx = fixture().await;
    fx.engine
        .handle_worker_message(
            &MessageOrigin::session(DEV_ENV, SESSION),
            WorkerMessage::ReadyForTasks {
                background_worker_id: "dev-worker".to_string(),
            },
        )
        .await
        .unwrap();
    assert!(fx.channel.sent().is_empty());
}

#[tokio::test]
async fn shutdown_stops_pool_and_sessions() {
    let fx = dev_fixture().await;
    fx.engine.start().await;
    fx.engine.connect_dev_session(DEV_ENV, SESSION).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), fx.engine.shutdown())
        .await
        .expect("shutdown finishes");
    assert!(!fx.engine.disconnect_dev_session(SESSION).await);

    // Nothing consumes after shutdown.
    let run = trigger_dev(&fx).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(fx.run(&run.id).await.status, RunStatus::Pending);
}
