//! # Courier
//!
//! Queue consumer and attempt lifecycle engine for background task runs.
//!
//! A client writes a run and an `EXECUTE` message keyed by the run id. The
//! engine's consumers dequeue it, create an attempt against the current
//! worker version, push the execution to a worker over the [`WorkerChannel`],
//! and then drive the attempt through completion, retry, checkpoint/restore,
//! dependency resumes and cancellation.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use courier::{Client, Engine, EngineOptions};
//! use courier::providers::in_memory::{InMemoryStore, InMemoryWorkQueue};
//! # use courier::channel::WorkerChannel;
//! # async fn demo(channel: Arc<dyn WorkerChannel>) -> Result<(), courier::EngineError> {
//! let store = Arc::new(InMemoryStore::new());
//! let queue = Arc::new(InMemoryWorkQueue::new());
//!
//! let engine = Engine::builder()
//!     .store(store.clone())
//!     .queue(queue.clone())
//!     .channel(channel)
//!     .options(EngineOptions::default())
//!     .build()
//!     .expect("store, queue and channel are set");
//! engine.start().await;
//!
//! let client = Client::new(store, queue);
//! let triggered = client.trigger("env_prod", "send-email", Some("{}".into()), Default::default()).await?;
//! println!("queued {}", triggered.run.friendly_id);
//!
//! engine.shutdown().await;
//! # Ok(()) }
//! ```
//!
//! ## Layout
//!
//! - [`status`], [`machines`], [`versions`], [`retry`]: pure tables and policies
//! - [`model`]: persisted rows and worker payloads
//! - [`providers`]: [`providers::Store`] and [`providers::WorkQueue`] with
//!   in-memory and SQLite implementations
//! - [`channel`]: wire frames exchanged with workers
//! - [`runtime`]: the [`Engine`] and its services
//! - [`client`]: triggering runs and registering workers

pub mod channel;
pub mod client;
pub mod env_vars;
pub mod errors;
pub mod events;
pub mod friendly_id;
pub mod limits;
pub mod machines;
pub mod model;
pub mod observability;
pub mod providers;
pub mod retry;
pub mod runtime;
pub mod status;
pub mod versions;

#[cfg(feature = "provider-test")]
pub mod provider_validation;
#[cfg(feature = "provider-test")]
pub mod provider_validations;

pub use channel::{ChannelError, ChannelTarget, Envelope, ServerMessage, WorkerChannel, WorkerMessage};
pub use client::{BatchItem, BatchTriggerResult, Client, TriggerOptions, TriggerResult};
pub use errors::{EngineError, InternalErrorCode, TaskRunError};
pub use observability::{init_logging, EngineMetrics, LogFormat, MetricsSnapshot, ObservabilityConfig};
#[cfg(feature = "observability")]
pub use observability::MetricsProvider;
pub use providers::{ProviderError, Store, WorkQueue};
pub use runtime::{
    CancelOptions, CancelOutcome, CheckpointOutcome, CompleteAttemptRequest, CompletionOutcome, ConsumeOutcome,
    CreateCheckpointRequest, Engine, EngineBuilder, EngineOptions, MessageOrigin, QueueConsumer, RestoreOutcome,
};
pub use status::{AttemptStatus, RunStatus};
