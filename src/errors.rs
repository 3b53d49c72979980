//! Error taxonomy persisted on runs and attempts, plus the engine's own error type.
//!
//! [`TaskRunError`] is the tagged union workers report and the engine stores.
//! It is always passed through [`sanitize_error`] before persistence.
//! Classification helpers decide retryability, crash status and
//! out-of-memory handling from the error alone.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::channel::ChannelError;
use crate::limits::{MAX_ERROR_MESSAGE_BYTES, MAX_ERROR_RAW_BYTES, MAX_STACK_TRACE_LINES};
use crate::providers::ProviderError;

/// Engine-classified failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InternalErrorCode {
    CouldNotFindExecutor,
    CouldNotFindTask,
    CouldNotImportTask,
    ConfiguredIncorrectly,
    TaskAlreadyRunning,
    TaskExecutionFailed,
    TaskExecutionAborted,
    TaskProcessExitedWithNonZeroCode,
    TaskProcessSigkillTimeout,
    TaskProcessSigsegv,
    TaskProcessSigterm,
    TaskProcessOomKilled,
    TaskRunCancelled,
    TaskRunCrashed,
    TaskRunHeartbeatTimeout,
    TaskInputError,
    TaskOutputError,
    HandleErrorError,
    GracefulExitTimeout,
    MaxDurationExceeded,
    DiskSpaceExceeded,
    OutdatedSdkVersion,
    PodEvicted,
    PodUnknownError,
    RecursiveWaitDeadlock,
}

impl InternalErrorCode {
    /// Codes that never succeed on another attempt.
    pub fn is_retryable(self) -> bool {
        !matches!(
            self,
            InternalErrorCode::CouldNotFindExecutor
                | InternalErrorCode::CouldNotFindTask
                | InternalErrorCode::CouldNotImportTask
                | InternalErrorCode::ConfiguredIncorrectly
                | InternalErrorCode::TaskAlreadyRunning
                | InternalErrorCode::TaskProcessSigkillTimeout
                | InternalErrorCode::TaskProcessOomKilled
                | InternalErrorCode::TaskRunCancelled
                | InternalErrorCode::TaskInputError
                | InternalErrorCode::TaskOutputError
                | InternalErrorCode::GracefulExitTimeout
                | InternalErrorCode::MaxDurationExceeded
                | InternalErrorCode::DiskSpaceExceeded
                | InternalErrorCode::OutdatedSdkVersion
                | InternalErrorCode::RecursiveWaitDeadlock
        )
    }

    /// Codes whose terminal run status is CRASHED rather than COMPLETED_WITH_ERRORS.
    pub fn is_crash(self) -> bool {
        matches!(
            self,
            InternalErrorCode::TaskRunCrashed
                | InternalErrorCode::TaskProcessExitedWithNonZeroCode
                | InternalErrorCode::TaskProcessSigkillTimeout
                | InternalErrorCode::TaskProcessSigsegv
                | InternalErrorCode::TaskProcessSigterm
                | InternalErrorCode::TaskProcessOomKilled
                | InternalErrorCode::TaskRunHeartbeatTimeout
                | InternalErrorCode::GracefulExitTimeout
                | InternalErrorCode::PodEvicted
                | InternalErrorCode::PodUnknownError
        )
    }
}

/// Error reported for a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskRunError {
    #[serde(rename_all = "camelCase")]
    BuiltInError {
        name: String,
        message: String,
        #[serde(default)]
        stack_trace: String,
    },
    StringError { raw: String },
    CustomError { raw: String },
    #[serde(rename_all = "camelCase")]
    InternalError {
        code: InternalErrorCode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack_trace: Option<String>,
    },
}

impl TaskRunError {
    pub fn internal(code: InternalErrorCode) -> Self {
        TaskRunError::InternalError {
            code,
            message: None,
            stack_trace: None,
        }
    }

    pub fn internal_with_message(code: InternalErrorCode, message: impl Into<String>) -> Self {
        TaskRunError::InternalError {
            code,
            message: Some(message.into()),
            stack_trace: None,
        }
    }

    pub fn internal_code(&self) -> Option<InternalErrorCode> {
        match self {
            TaskRunError::InternalError { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// True when the worker reports the run was cancelled underneath it.
    pub fn is_cancellation(&self) -> bool {
        self.internal_code() == Some(InternalErrorCode::TaskRunCancelled)
    }

    /// Default retry classification, before any out-of-memory override.
    pub fn is_retryable(&self) -> bool {
        match self {
            TaskRunError::InternalError { code, .. } => code.is_retryable(),
            _ => true,
        }
    }

    pub fn is_crash(&self) -> bool {
        self.internal_code().is_some_and(InternalErrorCode::is_crash)
    }

    /// Whether the failure looks like the process ran out of memory.
    pub fn is_out_of_memory(&self) -> bool {
        match self {
            TaskRunError::InternalError { code, message, .. } => {
                *code == InternalErrorCode::TaskProcessOomKilled
                    || (*code == InternalErrorCode::TaskProcessExitedWithNonZeroCode
                        && message.as_deref().is_some_and(mentions_out_of_memory))
            }
            TaskRunError::BuiltInError { name, message, .. } => {
                mentions_out_of_memory(message) || (name == "RangeError" && message.contains("Array buffer allocation"))
            }
            TaskRunError::StringError { raw } => mentions_out_of_memory(raw),
            TaskRunError::CustomError { .. } => false,
        }
    }

    /// Short human-readable summary used in logs and trace events.
    pub fn summary(&self) -> String {
        match self {
            TaskRunError::BuiltInError { name, message, .. } => format!("{name}: {message}"),
            TaskRunError::StringError { raw } => raw.clone(),
            TaskRunError::CustomError { .. } => "custom error".to_string(),
            TaskRunError::InternalError { code, message, .. } => match message {
                Some(m) => format!("{code:?}: {m}"),
                None => format!("{code:?}"),
            },
        }
    }
}

fn mentions_out_of_memory(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.contains("out of memory") || lower.contains("heap out of memory") || lower.contains("oomkilled")
}

impl fmt::Display for TaskRunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// Strip NUL bytes, trim stack traces and bound sizes before an error is persisted.
pub fn sanitize_error(error: TaskRunError) -> TaskRunError {
    match error {
        TaskRunError::BuiltInError {
            name,
            message,
            stack_trace,
        } => TaskRunError::BuiltInError {
            name: truncate(&strip_nul(&name), MAX_ERROR_MESSAGE_BYTES),
            message: truncate(&strip_nul(&message), MAX_ERROR_MESSAGE_BYTES),
            stack_trace: trim_stack(&strip_nul(&stack_trace)),
        },
        TaskRunError::StringError { raw } => TaskRunError::StringError {
            raw: truncate(&strip_nul(&raw), MAX_ERROR_RAW_BYTES),
        },
        TaskRunError::CustomError { raw } => TaskRunError::CustomError {
            raw: truncate(&strip_nul(&raw), MAX_ERROR_RAW_BYTES),
        },
        TaskRunError::InternalError {
            code,
            message,
            stack_trace,
        } => TaskRunError::InternalError {
            code,
            message: message.map(|m| truncate(&strip_nul(&m), MAX_ERROR_MESSAGE_BYTES)),
            stack_trace: stack_trace.map(|s| trim_stack(&strip_nul(&s))),
        },
    }
}

fn strip_nul(s: &str) -> String {
    s.replace('\0', "")
}

fn trim_stack(stack: &str) -> String {
    let mut lines: Vec<&str> = stack.lines().take(MAX_STACK_TRACE_LINES + 1).collect();
    if lines.len() > MAX_STACK_TRACE_LINES {
        lines.truncate(MAX_STACK_TRACE_LINES);
        let mut out = lines.join("\n");
        out.push_str("\n    ...");
        return truncate(&out, MAX_ERROR_RAW_BYTES);
    }
    truncate(&lines.join("\n"), MAX_ERROR_RAW_BYTES)
}

fn truncate(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Errors surfaced by engine operations to their callers.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("attempt not found: {0}")]
    AttemptNotFound(String),
    #[error("checkpoint event not found: {0}")]
    CheckpointEventNotFound(String),
    #[error("environment not found: {0}")]
    EnvironmentNotFound(String),
    #[error("batch not found: {0}")]
    BatchNotFound(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether retrying the same call later can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Provider(e) => e.is_retryable(),
            EngineError::Channel(_) => true,
            _ => false,
        }
    }
}
