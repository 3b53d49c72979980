//! Worker channel protocol.
//!
//! Every frame is a versioned envelope `{version, type, payload}`. The
//! transport is external: the engine only needs [`WorkerChannel::send`], and
//! inbound frames are handed to the session router already decoded.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::limits::CHANNEL_PROTOCOL_VERSION;
use crate::machines::MachinePreset;
use crate::model::{CheckpointType, ExecutionResult, TaskRunExecution, TaskRunExecutionPayload};

/// Wire frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    fn wrap<T: Serialize>(message: &T) -> Result<Self, ChannelError> {
        let value = serde_json::to_value(message).map_err(|e| ChannelError::Encode(e.to_string()))?;
        let serde_json::Value::Object(mut map) = value else {
            return Err(ChannelError::Encode("message did not encode as an object".into()));
        };
        let kind = match map.remove("type") {
            Some(serde_json::Value::String(kind)) => kind,
            _ => return Err(ChannelError::Encode("message has no type tag".into())),
        };
        Ok(Self {
            version: CHANNEL_PROTOCOL_VERSION.to_string(),
            kind,
            payload: map.remove("payload").unwrap_or(serde_json::Value::Null),
        })
    }

    fn open<T: for<'de> Deserialize<'de>>(self) -> Result<T, ChannelError> {
        if self.version != CHANNEL_PROTOCOL_VERSION {
            return Err(ChannelError::UnsupportedVersion(self.version));
        }
        let value = serde_json::json!({ "type": self.kind, "payload": self.payload });
        serde_json::from_value(value).map_err(|e| ChannelError::Decode(e.to_string()))
    }
}

/// Work-level frames sent to workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerServerMessage {
    /// Development sessions: run these payloads now.
    ExecuteRuns { payloads: Vec<TaskRunExecutionPayload> },
    /// Production pools: a coordinator picks a worker for this attempt.
    #[serde(rename_all = "camelCase")]
    ScheduleAttempt {
        id: String,
        version: String,
        payload: TaskRunExecutionPayload,
    },
}

/// Frames the engine sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    ServerReady { environment_id: String, session_id: String },
    #[serde(rename_all = "camelCase")]
    BackgroundWorkerMessage {
        background_worker_id: String,
        data: WorkerServerMessage,
    },
    #[serde(rename_all = "camelCase")]
    RequestAttemptCancellation { attempt_id: String, task_run_id: String },
    #[serde(rename_all = "camelCase")]
    RequestRunCancellation {
        run_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay_in_ms: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    ResumeAfterDuration {
        attempt_id: String,
        attempt_friendly_id: String,
        run_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ResumeAfterDependency {
        attempt_id: String,
        run_id: String,
        completions: Vec<ExecutionResult>,
        executions: Vec<TaskRunExecution>,
    },
    #[serde(rename_all = "camelCase")]
    ReadyForRetry { run_id: String },
    #[serde(rename_all = "camelCase")]
    RequestExit { run_id: String, attempt_id: String },
    #[serde(rename_all = "camelCase")]
    Restore {
        checkpoint_id: String,
        run_id: String,
        attempt_id: String,
        location: String,
        image_ref: String,
        checkpoint_type: CheckpointType,
        machine: MachinePreset,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        execution: Option<Box<TaskRunExecutionPayload>>,
    },
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::ServerReady { .. } => "SERVER_READY",
            ServerMessage::BackgroundWorkerMessage { .. } => "BACKGROUND_WORKER_MESSAGE",
            ServerMessage::RequestAttemptCancellation { .. } => "REQUEST_ATTEMPT_CANCELLATION",
            ServerMessage::RequestRunCancellation { .. } => "REQUEST_RUN_CANCELLATION",
            ServerMessage::ResumeAfterDuration { .. } => "RESUME_AFTER_DURATION",
            ServerMessage::ResumeAfterDependency { .. } => "RESUME_AFTER_DEPENDENCY",
            ServerMessage::ReadyForRetry { .. } => "READY_FOR_RETRY",
            ServerMessage::RequestExit { .. } => "REQUEST_EXIT",
            ServerMessage::Restore { .. } => "RESTORE",
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope, ChannelError> {
        Envelope::wrap(self)
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self, ChannelError> {
        envelope.open()
    }
}

/// Work-level frames workers send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerClientMessage {
    TaskRunCompleted {
        completion: ExecutionResult,
        execution: TaskRunExecution,
    },
    TaskRunFailedToRun { completion: ExecutionResult },
    #[serde(rename_all = "camelCase")]
    TaskHeartbeat { attempt_id: String },
    #[serde(rename_all = "camelCase")]
    TaskRunHeartbeat { run_id: String },
}

/// Frames the engine receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    #[serde(rename_all = "camelCase")]
    ReadyForTasks { background_worker_id: String },
    #[serde(rename_all = "camelCase")]
    BackgroundWorkerDeprecated { background_worker_id: String },
    #[serde(rename_all = "camelCase")]
    BackgroundWorkerMessage {
        background_worker_id: String,
        data: WorkerClientMessage,
    },
}

impl WorkerMessage {
    pub fn to_envelope(&self) -> Result<Envelope, ChannelError> {
        Envelope::wrap(self)
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self, ChannelError> {
        envelope.open()
    }
}

/// Where a frame is delivered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelTarget {
    /// One development session connection.
    Session(String),
    /// A production worker pool.
    Namespace(String),
    /// Per-run process control.
    Coordinator,
    /// Infrastructure that restores checkpoints.
    Provider,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("no connection for {0}")]
    NotConnected(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(String),
}

/// Outbound half of the worker channel.
#[async_trait]
pub trait WorkerChannel: Send + Sync {
    async fn send(&self, target: &ChannelTarget, message: ServerMessage) -> Result<(), ChannelError>;
}
