//! Reusable validation suite for [`WorkQueue`] implementations.
//!
//! Enable the `provider-test` feature to use it.
//!
//! # Example
//!
//! ```rust,ignore
//! use courier::providers::WorkQueue;
//! use courier::provider_validations::QueueFactory;
//! use std::sync::Arc;
//!
//! struct MyQueueFactory;
//!
//! #[async_trait::async_trait]
//! impl QueueFactory for MyQueueFactory {
//!     async fn create_queue(&self) -> Arc<dyn WorkQueue> {
//!         Arc::new(MyQueue::connect().await.unwrap())
//!     }
//! }
//!
//! #[tokio::test]
//! async fn my_queue_semantics() {
//!     courier::provider_validations::run_queue_semantics_tests(&MyQueueFactory).await;
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::providers::WorkQueue;

/// Creates fresh queues for the validation suite.
#[async_trait::async_trait]
pub trait QueueFactory: Send + Sync {
    /// Each call must return an empty queue isolated from earlier calls.
    async fn create_queue(&self) -> Arc<dyn WorkQueue>;

    /// Visibility timeout the lease tests dequeue with and then wait out.
    fn lease_timeout(&self) -> Duration {
        Duration::from_millis(500)
    }
}

/// Ordering, upsert, scope, visibility, acknowledge, nack and replace.
pub async fn run_queue_semantics_tests<F: QueueFactory>(factory: &F) {
    test_enqueue_upserts_by_message_id(factory).await;
    test_dequeue_orders_by_available_at(factory).await;
    test_priority_advances_message(factory).await;
    test_scopes_are_isolated(factory).await;
    test_delayed_visibility(factory).await;
    test_acknowledge_removes_message(factory).await;
    test_nack_releases_with_delay(factory).await;
    test_replace_without_time_keeps_lease(factory).await;
    test_replace_with_time_releases_lease(factory).await;
}

/// Lease expiry, heartbeats and parking.
pub async fn run_lease_tests<F: QueueFactory>(factory: &F) {
    test_lease_expires_after_timeout(factory).await;
    test_heartbeat_extends_lease(factory).await;
    test_heartbeat_requires_lease(factory).await;
    test_cancel_heartbeat_parks_message(factory).await;
    test_cancel_heartbeat_keeps_pending_resume(factory).await;
    test_enqueue_clears_lease(factory).await;
}

pub async fn run_all_tests<F: QueueFactory>(factory: &F) {
    run_queue_semantics_tests(factory).await;
    run_lease_tests(factory).await;
}

pub use crate::provider_validation::lease::{
    test_cancel_heartbeat_keeps_pending_resume, test_cancel_heartbeat_parks_message, test_enqueue_clears_lease, test_heartbeat_extends_lease,
    test_heartbeat_requires_lease, test_lease_expires_after_timeout,
};
pub use crate::provider_validation::queue_semantics::{
    test_acknowledge_removes_message, test_delayed_visibility, test_dequeue_orders_by_available_at,
    test_enqueue_upserts_by_message_id, test_nack_releases_with_delay, test_priority_advances_message,
    test_replace_with_time_releases_lease, test_replace_without_time_keeps_lease, test_scopes_are_isolated,
};
