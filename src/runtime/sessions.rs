//! Worker connections and inbound frame routing.
//!
//! Each development session gets its own consumer on the environment scope.
//! Production pools are served by the consumers started with the engine.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::completion::CompleteAttemptRequest;
use super::consumer::QueueConsumer;
use super::Engine;
use crate::channel::{ChannelTarget, Envelope, ServerMessage, WorkerClientMessage, WorkerMessage};
use crate::errors::EngineError;
use crate::model::ExecutionResult;
use crate::providers::QueueScope;

/// Where an inbound frame came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageOrigin {
    pub environment_id: String,
    /// Set for development sessions.
    pub session_id: Option<String>,
}

impl MessageOrigin {
    pub fn session(environment_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            environment_id: environment_id.into(),
            session_id: Some(session_id.into()),
        }
    }

    pub fn pool(environment_id: impl Into<String>) -> Self {
        Self {
            environment_id: environment_id.into(),
            session_id: None,
        }
    }
}

struct DevSession {
    environment_id: String,
    consumer: Arc<QueueConsumer>,
    join: JoinHandle<()>,
}

/// Connected development sessions keyed by session id.
#[derive(Default)]
pub struct DevConsumerRegistry {
    sessions: Mutex<HashMap<String, DevSession>>,
}

impl DevConsumerRegistry {
    /// Session whose consumer dispatched `attempt_id`.
    pub async fn session_for_attempt(&self, environment_id: &str, attempt_id: &str) -> Option<String> {
        self.sessions
            .lock()
            .await
            .iter()
            .find(|(_, s)| s.environment_id == environment_id && s.consumer.index.contains_attempt(attempt_id))
            .map(|(id, _)| id.clone())
    }

    pub async fn is_connected(&self, session_id: &str) -> bool {
        self.sessions.lock().await.contains_key(session_id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Drop a finished attempt from every session's in-flight index.
    pub async fn forget_attempt(&self, attempt_id: &str) {
        for session in self.sessions.lock().await.values() {
            session.consumer.index.remove_attempt(attempt_id);
        }
    }

    async fn register(&self, session_id: String, session: DevSession) {
        self.sessions.lock().await.insert(session_id, session);
    }

    async fn unregister(&self, session_id: &str) -> Option<DevSession> {
        self.sessions.lock().await.remove(session_id)
    }

    /// Stop every session consumer and wait for it to exit.
    pub async fn stop_all(&self) {
        let drained: Vec<DevSession> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.consumer.stop();
        }
        let ids: Vec<String> = drained.iter().map(|s| s.consumer.id.clone()).collect();
        let joined = futures::future::join_all(drained.into_iter().map(|s| s.join)).await;
        for (consumer_id, result) in ids.iter().zip(joined) {
            if let Err(e) = result {
                tracing::warn!(target: "courier::sessions", consumer_id = %consumer_id, error = %e, "Session consumer task failed");
            }
        }
    }
}

impl Engine {
    /// Accept a development session: send SERVER_READY and start its consumer.
    pub async fn connect_dev_session(self: &Arc<Self>, environment_id: &str, session_id: &str) -> Result<(), EngineError> {
        let env = self.environment(environment_id).await?;
        if self.sessions.is_connected(session_id).await {
            tracing::debug!(target: "courier::sessions", session_id = %session_id, "Session already connected");
            return Ok(());
        }
        let target = ChannelTarget::Session(session_id.to_string());
        self.channel
            .send(
                &target,
                ServerMessage::ServerReady {
                    environment_id: env.id.clone(),
                    session_id: session_id.to_string(),
                },
            )
            .await?;

        let consumer = Arc::new(QueueConsumer::new(
            format!("dev-{session_id}"),
            QueueScope::environment(&env.id),
            target,
            Arc::new(AtomicBool::new(false)),
        ));
        let join = self.clone().spawn_consumer(consumer.clone());
        self.sessions
            .register(
                session_id.to_string(),
                DevSession {
                    environment_id: env.id.clone(),
                    consumer,
                    join,
                },
            )
            .await;
        tracing::info!(
            target: "courier::sessions",
            session_id = %session_id,
            environment_id = %env.id,
            "Development session connected"
        );
        Ok(())
    }

    /// Stop the session's consumer. Its in-flight attempts recover through
    /// lease expiry.
    pub async fn disconnect_dev_session(&self, session_id: &str) -> bool {
        let Some(session) = self.sessions.unregister(session_id).await else {
            return false;
        };
        session.consumer.stop();
        if let Err(e) = session.join.await {
            tracing::warn!(
                target: "courier::sessions",
                session_id = %session_id,
                error = %e,
                "Session consumer task failed"
            );
        }
        tracing::info!(
            target: "courier::sessions",
            session_id = %session_id,
            environment_id = %session.environment_id,
            "Development session disconnected"
        );
        true
    }

    /// Decode and route one inbound envelope.
    pub async fn handle_envelope(&self, origin: &MessageOrigin, envelope: Envelope) -> Result<(), EngineError> {
        let message = WorkerMessage::from_envelope(envelope)?;
        self.handle_worker_message(origin, message).await
    }

    pub async fn handle_worker_message(&self, origin: &MessageOrigin, message: WorkerMessage) -> Result<(), EngineError> {
        match message {
            WorkerMessage::ReadyForTasks { background_worker_id } => {
                tracing::debug!(
                    target: "courier::sessions",
                    environment_id = %origin.environment_id,
                    session_id = ?origin.session_id,
                    background_worker_id = %background_worker_id,
                    "Worker ready for tasks"
                );
                Ok(())
            }
            WorkerMessage::BackgroundWorkerDeprecated { background_worker_id } => {
                let worker = self.store.get_worker(&background_worker_id).await?;
                if !worker.is_some_and(|w| w.environment_id == origin.environment_id) {
                    tracing::warn!(
                        target: "courier::sessions",
                        background_worker_id = %background_worker_id,
                        environment_id = %origin.environment_id,
                        "Deprecation for worker outside origin environment ignored"
                    );
                    return Ok(());
                }
                self.store.set_worker_deprecated(&background_worker_id).await?;
                tracing::info!(target: "courier::sessions", background_worker_id = %background_worker_id, "Worker deprecated");
                Ok(())
            }
            WorkerMessage::BackgroundWorkerMessage { data, .. } => self.handle_worker_frame(data).await,
        }
    }

    async fn handle_worker_frame(&self, frame: WorkerClientMessage) -> Result<(), EngineError> {
        match frame {
            WorkerClientMessage::TaskRunCompleted { completion, execution } => {
                let mut request = completion_request(completion);
                request.run_id = Some(execution.run.id);
                self.complete_attempt(request).await?;
            }
            WorkerClientMessage::TaskRunFailedToRun { completion } => {
                let mut request = completion_request(completion);
                request.is_system_failure = true;
                self.complete_attempt(request).await?;
            }
            WorkerClientMessage::TaskHeartbeat { attempt_id } => {
                self.heartbeat_attempt(&attempt_id).await?;
            }
            WorkerClientMessage::TaskRunHeartbeat { run_id } => {
                self.heartbeat_run(&run_id).await?;
            }
        }
        Ok(())
    }
}

fn completion_request(completion: ExecutionResult) -> CompleteAttemptRequest {
    let attempt_id = completion.attempt_id().to_string();
    CompleteAttemptRequest::new(&attempt_id, completion)
}
