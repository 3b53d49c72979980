//! Run trace events.
//!
//! The trace/event pipeline is external; the engine reports into an
//! [`EventSink`] and only logs when the sink fails.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::TaskRunError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("event sink error: {0}")]
pub struct SinkError(pub String);

#[async_trait]
pub trait EventSink: Send + Sync {
    /// Point-in-time event on a run (attempt started, retry scheduled, ...).
    async fn record_event(&self, run_id: &str, name: &str, properties: serde_json::Value) -> Result<(), SinkError>;

    /// Close the run's open spans as successful.
    async fn complete_event(&self, run_id: &str, at: DateTime<Utc>) -> Result<(), SinkError>;

    async fn cancel_event(&self, run_id: &str, reason: &str, at: DateTime<Utc>) -> Result<(), SinkError>;

    async fn crash_event(&self, run_id: &str, error: &TaskRunError, at: DateTime<Utc>) -> Result<(), SinkError>;
}

/// Sink that writes every event as a `tracing` record under `courier::events`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn record_event(&self, run_id: &str, name: &str, properties: serde_json::Value) -> Result<(), SinkError> {
        tracing::info!(target: "courier::events", run_id = %run_id, event = %name, properties = %properties, "Run event");
        Ok(())
    }

    async fn complete_event(&self, run_id: &str, at: DateTime<Utc>) -> Result<(), SinkError> {
        tracing::info!(target: "courier::events", run_id = %run_id, at = %at, "Run spans completed");
        Ok(())
    }

    async fn cancel_event(&self, run_id: &str, reason: &str, at: DateTime<Utc>) -> Result<(), SinkError> {
        tracing::info!(target: "courier::events", run_id = %run_id, reason = %reason, at = %at, "Run spans cancelled");
        Ok(())
    }

    async fn crash_event(&self, run_id: &str, error: &TaskRunError, at: DateTime<Utc>) -> Result<(), SinkError> {
        tracing::warn!(target: "courier::events", run_id = %run_id, error = %error, at = %at, "Run spans crashed");
        Ok(())
    }
}
