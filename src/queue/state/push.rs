//! Push (broadcast) dispatch state
//!
//! Sends each message to all currently connected subscribers. The message is
//! serialized once; per-client failures are folded into a final decision
//! with most-restrictive-wins, so one bad consumer never blocks delivery to
//! the others.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{error, trace};

use crate::queue::message::QueueMessage;
use crate::queue::tracker::MessageDelivery;
use crate::queue::{AckMode, Queue, QueueEvent};

use super::{PushResult, QueueState, StateAction};
use crate::queue::QueueType;

pub struct PushState {
    processing: Mutex<Option<Arc<QueueMessage>>>,
}

impl PushState {
    pub fn new() -> Self {
        Self {
            processing: Mutex::new(None),
        }
    }

    async fn deliver(&self, queue: &Arc<Queue>, message: &Arc<QueueMessage>) -> PushResult {
        // Subscribed-but-disconnected clients cannot take the message; an
        // all-disconnected list parks it the same as an empty one
        let clients: Vec<_> = queue
            .client_snapshot()
            .into_iter()
            .filter(|c| c.is_connected())
            .collect();
        if clients.is_empty() {
            // Keep the message available for a future pull or a later
            // subscriber
            return match queue.store().put(message.clone()) {
                Ok(()) => PushResult::NoConsumers,
                Err(e) => {
                    error!(queue = %queue.name(), error = %e, "failed to store message");
                    PushResult::Error
                }
            };
        }

        message.begin_delivery_pass();

        let mut final_decision = queue.handler().begin_send(queue, message).await;
        if !queue.apply_decision(final_decision, message).await {
            // The hook itself decided; nothing further for this pass
            return PushResult::Success;
        }

        let bytes = match message.message.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(queue = %queue.name(), error = %e, "failed to serialize message");
                return PushResult::Error;
            }
        };

        let track_ack = queue.options().acknowledge != AckMode::None;
        let ack_deadline = queue.ack_deadline();

        for client in clients {
            if !client.is_connected() {
                continue;
            }
            if !queue
                .handler()
                .can_consumer_receive(queue, message, &client)
                .await
            {
                continue;
            }

            let delivery = Arc::new(MessageDelivery::new(
                message.clone(),
                client.clone(),
                ack_deadline,
            ));

            match client.send(bytes.clone()).await {
                Ok(()) => {
                    client.increment_consume_count();
                    // A refused track means the first delivery to this
                    // client is still live; the receiver set only mirrors
                    // tracked deliveries
                    if track_ack && queue.tracker().track(delivery.clone()) {
                        message.add_receiver(client.clone());
                    }
                    trace!(
                        queue = %queue.name(),
                        message = %message.id(),
                        client = %client.unique_id(),
                        "message sent"
                    );
                    let decision = queue.handler().consumer_received(queue, &delivery).await;
                    final_decision = final_decision.combine(decision);
                    queue.emit(QueueEvent::MessageConsumed {
                        message_id: message.id().to_string(),
                        client_id: client.unique_id().to_string(),
                    });
                }
                Err(e) => {
                    trace!(
                        queue = %queue.name(),
                        message = %message.id(),
                        client = %client.unique_id(),
                        error = %e,
                        "send failed"
                    );
                    let decision = queue
                        .handler()
                        .consumer_receive_failed(queue, &delivery)
                        .await;
                    final_decision = final_decision.combine(decision);
                }
            }
        }

        queue.apply_decision(final_decision, message).await;
        let end_decision = queue.handler().end_send(queue, message).await;
        queue.apply_decision(end_decision, message).await;

        PushResult::Success
    }
}

impl Default for PushState {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueState for PushState {
    fn processing_message(&self) -> Option<Arc<QueueMessage>> {
        self.processing.lock().clone()
    }

    fn trigger_supported(&self) -> bool {
        true
    }

    async fn push(&self, queue: &Arc<Queue>, message: Arc<QueueMessage>) -> PushResult {
        *self.processing.lock() = Some(message.clone());
        let result = self.deliver(queue, &message).await;
        *self.processing.lock() = None;
        result
    }

    fn enter(&self, _previous: QueueType) -> StateAction {
        StateAction::AllowAndTrigger
    }
}
