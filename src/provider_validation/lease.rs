use chrono::Utc;
use std::time::Duration;

use crate::provider_validation::message;
use crate::provider_validations::QueueFactory;
use crate::providers::{Lease, MessageBody, QueueScope};

/// An unacknowledged message is redelivered once its lease passes.
pub async fn test_lease_expires_after_timeout<F: QueueFactory>(factory: &F) {
    tracing::info!("→ Testing lease: lease expires after timeout");
    let queue = factory.create_queue().await;
    let lease = factory.lease_timeout();

    queue.enqueue(message("run-A")).await.unwrap();
    let first = queue.dequeue(&QueueScope::Shared, lease).await.unwrap().unwrap();
    assert_eq!(first.delivery_count, 1);
    assert!(queue.dequeue(&QueueScope::Shared, lease).await.unwrap().is_none());

    tokio::time::sleep(lease + Duration::from_millis(100)).await;
    let second = queue.dequeue(&QueueScope::Shared, lease).await.unwrap().unwrap();
    assert_eq!(second.id, "run-A");
    assert_eq!(second.delivery_count, 2);
    tracing::info!("✓ Test passed: lease expiry verified");
}

pub async fn test_heartbeat_extends_lease<F: QueueFactory>(factory: &F) {
    tracing::info!("→ Testing lease: heartbeat extends lease");
    let queue = factory.create_queue().await;
    let lease = factory.lease_timeout();

    queue.enqueue(message("run-A")).await.unwrap();
    queue.dequeue(&QueueScope::Shared, lease).await.unwrap().unwrap();

    tokio::time::sleep(lease / 2).await;
    assert!(queue.heartbeat("run-A", lease * 3).await.unwrap());

    // Past the original deadline, inside the extended one.
    tokio::time::sleep(lease / 2 + Duration::from_millis(150)).await;
    assert!(queue.dequeue(&QueueScope::Shared, lease).await.unwrap().is_none());
    tracing::info!("✓ Test passed: heartbeat extension verified");
}

pub async fn test_heartbeat_requires_lease<F: QueueFactory>(factory: &F) {
    tracing::info!("→ Testing lease: heartbeat requires a lease");
    let queue = factory.create_queue().await;

    queue.enqueue(message("run-A")).await.unwrap();
    assert!(!queue.heartbeat("run-A", factory.lease_timeout()).await.unwrap());
    assert!(!queue.heartbeat("run-missing", factory.lease_timeout()).await.unwrap());
    let peeked = queue.peek("run-A").await.unwrap().unwrap();
    assert_eq!(peeked.lease, None);
    tracing::info!("✓ Test passed: heartbeat without lease verified");
}

/// A parked message outlives its deadline until something re-times it.
pub async fn test_cancel_heartbeat_parks_message<F: QueueFactory>(factory: &F) {
    tracing::info!("→ Testing lease: cancel_heartbeat parks message");
    let queue = factory.create_queue().await;
    let lease = factory.lease_timeout();

    queue.enqueue(message("run-A")).await.unwrap();
    queue.dequeue(&QueueScope::Shared, lease).await.unwrap().unwrap();
    assert!(queue.cancel_heartbeat("run-A").await.unwrap());

    tokio::time::sleep(lease + Duration::from_millis(100)).await;
    assert!(queue.dequeue(&QueueScope::Shared, lease).await.unwrap().is_none());
    let peeked = queue.peek("run-A").await.unwrap().unwrap();
    assert_eq!(peeked.lease, Some(Lease::Parked));

    // A heartbeat puts the deadline back.
    assert!(queue.heartbeat("run-A", lease).await.unwrap());
    let peeked = queue.peek("run-A").await.unwrap().unwrap();
    assert!(matches!(peeked.lease, Some(Lease::Until(_))));
    assert!(!queue.cancel_heartbeat("run-missing").await.unwrap());
    tracing::info!("✓ Test passed: parking verified");
}

/// A RESUME swapped in while the worker was checkpointing is not parked.
pub async fn test_cancel_heartbeat_keeps_pending_resume<F: QueueFactory>(factory: &F) {
    tracing::info!("→ Testing lease: cancel_heartbeat keeps a pending resume");
    let queue = factory.create_queue().await;
    let lease = factory.lease_timeout();

    queue.enqueue(message("run-A")).await.unwrap();
    queue.dequeue(&QueueScope::Shared, lease).await.unwrap().unwrap();
    let resume = MessageBody::Resume {
        completed_attempt_ids: vec!["attempt-child".to_string()],
        resumable_attempt_id: "attempt-parent".to_string(),
        checkpoint_event_id: None,
    };
    assert!(queue.replace("run-A", resume.clone(), Some(Utc::now())).await.unwrap());

    assert!(!queue.cancel_heartbeat("run-A").await.unwrap());
    let peeked = queue.peek("run-A").await.unwrap().unwrap();
    assert_eq!(peeked.lease, None);
    let again = queue.dequeue(&QueueScope::Shared, lease).await.unwrap().unwrap();
    assert_eq!(again.decode().unwrap(), resume);
    tracing::info!("✓ Test passed: pending resume kept visible");
}

pub async fn test_enqueue_clears_lease<F: QueueFactory>(factory: &F) {
    tracing::info!("→ Testing lease: enqueue clears lease");
    let queue = factory.create_queue().await;
    let lease = factory.lease_timeout();

    queue.enqueue(message("run-A")).await.unwrap();
    queue.dequeue(&QueueScope::Shared, lease).await.unwrap().unwrap();
    queue.cancel_heartbeat("run-A").await.unwrap();

    queue.enqueue(message("run-A")).await.unwrap();
    let again = queue.dequeue(&QueueScope::Shared, lease).await.unwrap().unwrap();
    assert_eq!(again.id, "run-A");
    assert_eq!(again.delivery_count, 2, "delivery count survives the upsert");
    tracing::info!("✓ Test passed: enqueue clearing lease verified");
}
