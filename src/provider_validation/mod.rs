//! Queue validation tests, written against [`crate::provider_validations::QueueFactory`].

pub mod lease;
pub mod queue_semantics;

use chrono::{DateTime, Utc};

use crate::providers::{MessageBody, NewMessage, QueueScope};

pub(crate) fn execute_body(task: &str) -> MessageBody {
    MessageBody::Execute {
        task_identifier: task.to_string(),
        checkpoint_event_id: None,
    }
}

/// An EXECUTE message for `id` on the shared scope, visible now.
pub(crate) fn message(id: &str) -> NewMessage {
    NewMessage {
        id: id.to_string(),
        scope: QueueScope::Shared,
        queue: "task/validation".to_string(),
        body: execute_body("validation"),
        priority_ms: 0,
        concurrency_key: None,
        available_at: None,
    }
}

pub(crate) fn message_at(id: &str, available_at: DateTime<Utc>) -> NewMessage {
    NewMessage {
        available_at: Some(available_at),
        ..message(id)
    }
}
