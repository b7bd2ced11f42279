//! Message Timeout Sweep
//!
//! Expires messages that sat in the store past their deadline without being
//! delivered at all. Runs on the queue keeper's one second tick,
//! independently of delivery attempts.

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use super::message::QueueMessage;
use super::{Queue, QueueEvent};

/// One sweep pass over both sub-collections.
///
/// Insertion order is monotonic in deadline for messages sharing a timeout
/// policy, so scanning stops at the first head that has no deadline or is
/// not yet due. Due messages are unlinked first and their hook decisions
/// applied afterwards, so a put-back cannot re-feed the same pass.
pub(crate) async fn sweep_expired(queue: &Arc<Queue>) {
    let now = Instant::now();
    let mut expired: Vec<Arc<QueueMessage>> = Vec::new();

    loop {
        let Some(head) = queue.store().get_priority_next(false, false) else {
            break;
        };
        if !due(&head, now) || !queue.store().remove(&head) {
            break;
        }
        expired.push(head);
    }
    loop {
        let Some(head) = queue.store().get_regular_next(false, false) else {
            break;
        };
        if !due(&head, now) || !queue.store().remove(&head) {
            break;
        }
        expired.push(head);
    }

    for message in expired {
        message.mark_timed_out();
        debug!(queue = %queue.name(), message = %message.id(), "message timed out in store");

        let decision = queue.handler().message_timed_out(queue, &message).await;
        queue.apply_decision(decision, &message).await;
        queue.emit(QueueEvent::MessageTimedOut {
            message_id: message.id().to_string(),
        });
    }
}

fn due(message: &QueueMessage, now: Instant) -> bool {
    match message.deadline() {
        Some(deadline) => deadline <= now,
        None => false,
    }
}
