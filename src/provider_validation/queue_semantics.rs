use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;

use crate::provider_validation::{execute_body, message, message_at};
use crate::provider_validations::QueueFactory;
use crate::providers::{Lease, MessageBody, NewMessage, QueueScope};

const LEASE: Duration = Duration::from_secs(30);

fn resume_body() -> MessageBody {
    MessageBody::Resume {
        completed_attempt_ids: vec!["attempt-child".to_string()],
        resumable_attempt_id: "attempt-parent".to_string(),
        checkpoint_event_id: None,
    }
}

/// Enqueueing the same id twice keeps one message carrying the last body.
pub async fn test_enqueue_upserts_by_message_id<F: QueueFactory>(factory: &F) {
    tracing::info!("→ Testing queue semantics: enqueue upserts by message id");
    let queue = factory.create_queue().await;

    queue.enqueue(message("run-A")).await.unwrap();
    queue
        .enqueue(NewMessage {
            body: execute_body("second"),
            ..message("run-A")
        })
        .await
        .unwrap();

    let leased = queue.dequeue(&QueueScope::Shared, LEASE).await.unwrap().unwrap();
    assert_eq!(leased.id, "run-A");
    assert_eq!(leased.decode().unwrap(), execute_body("second"));
    assert!(queue.dequeue(&QueueScope::Shared, LEASE).await.unwrap().is_none());
    tracing::info!("✓ Test passed: enqueue upsert verified");
}

pub async fn test_dequeue_orders_by_available_at<F: QueueFactory>(factory: &F) {
    tracing::info!("→ Testing queue semantics: dequeue orders by available_at");
    let queue = factory.create_queue().await;
    let base = Utc::now() - ChronoDuration::seconds(10);

    // Enqueued out of order on purpose.
    for (id, offset) in [("run-3", 3), ("run-1", 1), ("run-2", 2)] {
        queue
            .enqueue(message_at(id, base + ChronoDuration::seconds(offset)))
            .await
            .unwrap();
    }

    for expected in ["run-1", "run-2", "run-3"] {
        let leased = queue.dequeue(&QueueScope::Shared, LEASE).await.unwrap().unwrap();
        assert_eq!(leased.id, expected);
    }
    assert!(queue.dequeue(&QueueScope::Shared, LEASE).await.unwrap().is_none());
    tracing::info!("✓ Test passed: available_at ordering verified");
}

pub async fn test_priority_advances_message<F: QueueFactory>(factory: &F) {
    tracing::info!("→ Testing queue semantics: priority advances message");
    let queue = factory.create_queue().await;
    let at = Utc::now() - ChronoDuration::seconds(1);

    queue.enqueue(message_at("run-normal", at)).await.unwrap();
    queue
        .enqueue(NewMessage {
            priority_ms: 5_000,
            ..message_at("run-urgent", at)
        })
        .await
        .unwrap();

    let first = queue.dequeue(&QueueScope::Shared, LEASE).await.unwrap().unwrap();
    assert_eq!(first.id, "run-urgent");
    let second = queue.dequeue(&QueueScope::Shared, LEASE).await.unwrap().unwrap();
    assert_eq!(second.id, "run-normal");
    tracing::info!("✓ Test passed: priority ordering verified");
}

pub async fn test_scopes_are_isolated<F: QueueFactory>(factory: &F) {
    tracing::info!("→ Testing queue semantics: scopes are isolated");
    let queue = factory.create_queue().await;
    let dev = QueueScope::environment("env-dev");

    queue
        .enqueue(NewMessage {
            scope: dev.clone(),
            ..message("run-dev")
        })
        .await
        .unwrap();
    queue.enqueue(message("run-prod")).await.unwrap();

    assert!(queue
        .dequeue(&QueueScope::environment("env-other"), LEASE)
        .await
        .unwrap()
        .is_none());
    let shared = queue.dequeue(&QueueScope::Shared, LEASE).await.unwrap().unwrap();
    assert_eq!(shared.id, "run-prod");
    assert!(queue.dequeue(&QueueScope::Shared, LEASE).await.unwrap().is_none());
    let dev_message = queue.dequeue(&dev, LEASE).await.unwrap().unwrap();
    assert_eq!(dev_message.id, "run-dev");
    assert_eq!(dev_message.scope, dev);
    tracing::info!("✓ Test passed: scope isolation verified");
}

pub async fn test_delayed_visibility<F: QueueFactory>(factory: &F) {
    tracing::info!("→ Testing queue semantics: delayed visibility");
    let queue = factory.create_queue().await;
    let delay = factory.lease_timeout();

    queue
        .enqueue(message_at("run-later", Utc::now() + ChronoDuration::from_std(delay).unwrap()))
        .await
        .unwrap();
    assert!(queue.dequeue(&QueueScope::Shared, LEASE).await.unwrap().is_none());

    tokio::time::sleep(delay + Duration::from_millis(100)).await;
    let leased = queue.dequeue(&QueueScope::Shared, LEASE).await.unwrap().unwrap();
    assert_eq!(leased.id, "run-later");
    tracing::info!("✓ Test passed: delayed visibility verified");
}

pub async fn test_acknowledge_removes_message<F: QueueFactory>(factory: &F) {
    tracing::info!("→ Testing queue semantics: acknowledge removes message");
    let queue = factory.create_queue().await;

    queue.enqueue(message("run-A")).await.unwrap();
    queue.dequeue(&QueueScope::Shared, LEASE).await.unwrap().unwrap();

    assert!(queue.acknowledge("run-A").await.unwrap());
    assert!(queue.peek("run-A").await.unwrap().is_none());
    assert!(!queue.acknowledge("run-A").await.unwrap(), "second acknowledge finds nothing");
    tracing::info!("✓ Test passed: acknowledge verified");
}

pub async fn test_nack_releases_with_delay<F: QueueFactory>(factory: &F) {
    tracing::info!("→ Testing queue semantics: nack releases with delay");
    let queue = factory.create_queue().await;
    let delay = factory.lease_timeout();

    queue.enqueue(message("run-A")).await.unwrap();
    queue.dequeue(&QueueScope::Shared, LEASE).await.unwrap().unwrap();

    let not_before = Utc::now() + ChronoDuration::from_std(delay).unwrap();
    assert!(queue.nack("run-A", Some(not_before)).await.unwrap());
    let peeked = queue.peek("run-A").await.unwrap().unwrap();
    assert_eq!(peeked.lease, None);
    assert!(queue.dequeue(&QueueScope::Shared, LEASE).await.unwrap().is_none());

    tokio::time::sleep(delay + Duration::from_millis(100)).await;
    let again = queue.dequeue(&QueueScope::Shared, LEASE).await.unwrap().unwrap();
    assert_eq!(again.delivery_count, 2);
    assert!(!queue.nack("run-missing", None).await.unwrap());
    tracing::info!("✓ Test passed: nack verified");
}

pub async fn test_replace_without_time_keeps_lease<F: QueueFactory>(factory: &F) {
    tracing::info!("→ Testing queue semantics: replace without time keeps lease");
    let queue = factory.create_queue().await;

    queue.enqueue(message("run-A")).await.unwrap();
    queue.dequeue(&QueueScope::Shared, LEASE).await.unwrap().unwrap();

    assert!(queue.replace("run-A", resume_body(), None).await.unwrap());
    assert!(queue.dequeue(&QueueScope::Shared, LEASE).await.unwrap().is_none());
    let peeked = queue.peek("run-A").await.unwrap().unwrap();
    assert!(matches!(peeked.lease, Some(Lease::Until(_))));
    assert_eq!(peeked.decode().unwrap(), resume_body());
    assert!(!queue.replace("run-missing", resume_body(), None).await.unwrap());
    tracing::info!("✓ Test passed: replace keeps lease verified");
}

pub async fn test_replace_with_time_releases_lease<F: QueueFactory>(factory: &F) {
    tracing::info!("→ Testing queue semantics: replace with time releases lease");
    let queue = factory.create_queue().await;

    queue.enqueue(message("run-A")).await.unwrap();
    queue.dequeue(&QueueScope::Shared, LEASE).await.unwrap().unwrap();

    assert!(queue.replace("run-A", resume_body(), Some(Utc::now())).await.unwrap());
    let leased = queue.dequeue(&QueueScope::Shared, LEASE).await.unwrap().unwrap();
    assert_eq!(leased.id, "run-A");
    assert_eq!(leased.decode().unwrap(), resume_body());
    tracing::info!("✓ Test passed: replace releases lease verified");
}
