//! Pull dispatch state
//!
//! Consumers explicitly request messages; the broker never pushes
//! unsolicited. A single pull call hands back up to `Count` messages,
//! priority-first, honoring the requested order, and terminates the
//! response stream with an `END` sentinel.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{error, trace};

use crate::client::QueueClient;
use crate::protocol::{headers, Message};
use crate::queue::message::QueueMessage;
use crate::queue::tracker::MessageDelivery;
use crate::queue::{AckMode, Queue, QueueEvent};

use super::{PullRequest, PullResult, PushResult, QueueState};

type ItemError = Box<dyn std::error::Error + Send + Sync>;

enum ItemOutcome {
    /// Sent; delivery present when acknowledgement is tracked
    Sent(Option<Arc<MessageDelivery>>),
    /// The hook decided against sending this item
    Skipped,
}

pub struct PullState {
    processing: Mutex<Option<Arc<QueueMessage>>>,
}

impl PullState {
    pub fn new() -> Self {
        Self {
            processing: Mutex::new(None),
        }
    }

    /// Send a bare status response (END, EMPTY, UNACCEPTABLE)
    async fn send_status(&self, queue: &Queue, client: &QueueClient, request: &Message, status: &str) {
        let mut response = request.new_response(bytes::Bytes::new());
        response.target = queue.name().to_string();
        response.add_header(headers::STATUS, status);
        match response.to_bytes() {
            Ok(bytes) => {
                if let Err(e) = client.send(bytes).await {
                    trace!(queue = %queue.name(), error = %e, "status send failed");
                }
            }
            Err(e) => error!(queue = %queue.name(), error = %e, "failed to serialize status"),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn deliver_item(
        &self,
        queue: &Arc<Queue>,
        client: &Arc<QueueClient>,
        request: &Message,
        pull: &PullRequest,
        index: usize,
        message: &Arc<QueueMessage>,
    ) -> Result<ItemOutcome, ItemError> {
        message.begin_delivery_pass();

        let begin = queue.handler().begin_send(queue, message).await;
        if !queue.apply_decision(begin, message).await {
            return Ok(ItemOutcome::Skipped);
        }
        if !queue
            .handler()
            .can_consumer_receive(queue, message, client)
            .await
        {
            return Ok(ItemOutcome::Skipped);
        }

        let mut response = message.message.clone();
        if !request.id.is_empty() {
            response.add_header(headers::REQUEST_ID, request.id.clone());
        }
        response.add_header(headers::INDEX, (index + 1).to_string());
        response.add_header(headers::TOTAL_COUNT, pull.count.to_string());
        if pull.info {
            response.add_header(
                headers::PRIORITY_MESSAGES,
                queue.store().count_priority().to_string(),
            );
            response.add_header(
                headers::REGULAR_MESSAGES,
                queue.store().count_regular().to_string(),
            );
        }

        let bytes = response.to_bytes()?;

        let track_ack = queue.options().acknowledge != AckMode::None;
        let wait_ack = queue.options().acknowledge == AckMode::WaitForAcknowledge;
        let ack_deadline = queue.ack_deadline();
        let delivery = Arc::new(MessageDelivery::new(
            message.clone(),
            client.clone(),
            ack_deadline,
        ));

        client.send(bytes).await?;
        client.increment_consume_count();

        // A refused track means the first delivery to this client is still
        // live; the receiver set only mirrors tracked deliveries
        let tracked = if track_ack && queue.tracker().track(delivery.clone()) {
            message.add_receiver(client.clone());
            if wait_ack {
                client.set_processing(delivery.clone(), ack_deadline);
            }
            Some(delivery.clone())
        } else {
            None
        };

        let received = queue.handler().consumer_received(queue, &delivery).await;
        queue.apply_decision(received, message).await;
        let end = queue.handler().end_send(queue, message).await;
        queue.apply_decision(end, message).await;

        queue.emit(QueueEvent::MessageConsumed {
            message_id: message.id().to_string(),
            client_id: client.unique_id().to_string(),
        });

        Ok(ItemOutcome::Sent(tracked))
    }
}

impl Default for PullState {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueState for PullState {
    fn processing_message(&self) -> Option<Arc<QueueMessage>> {
        self.processing.lock().clone()
    }

    /// Pull is purely consumer-initiated
    fn trigger_supported(&self) -> bool {
        false
    }

    /// Pushes into a pull queue only store the message
    async fn push(&self, queue: &Arc<Queue>, message: Arc<QueueMessage>) -> PushResult {
        match queue.store().put(message) {
            Ok(()) => PushResult::Success,
            Err(e) => {
                error!(queue = %queue.name(), error = %e, "failed to store message");
                PushResult::Error
            }
        }
    }

    async fn pull(
        &self,
        queue: &Arc<Queue>,
        client: Arc<QueueClient>,
        request: Message,
    ) -> PullResult {
        let Some(pull) = PullRequest::parse(&request) else {
            self.send_status(queue, &client, &request, headers::STATUS_UNACCEPTABLE)
                .await;
            return PullResult::Unacceptable;
        };

        let wait_ack = queue.options().acknowledge == AckMode::WaitForAcknowledge;
        let ack_timeout = queue.options().acknowledge_timeout;
        let mut delivered = 0usize;
        let mut previous: Option<Arc<MessageDelivery>> = None;

        for index in 0..pull.count {
            let Some(message) = queue.store().get_next(true, !pull.fifo) else {
                if index == 0 {
                    self.send_status(queue, &client, &request, headers::STATUS_EMPTY)
                        .await;
                    return PullResult::Empty;
                }
                break;
            };

            queue.handler().message_dequeued(queue, &message).await;

            // Serialize pull-then-ack: the previous delivery must settle
            // before the next item goes out
            if wait_ack {
                if let Some(prev) = previous.take() {
                    prev.settled(ack_timeout).await;
                }
            }

            *self.processing.lock() = Some(message.clone());
            match self
                .deliver_item(queue, &client, &request, &pull, index, &message)
                .await
            {
                Ok(ItemOutcome::Sent(tracked)) => {
                    delivered += 1;
                    previous = tracked;
                }
                Ok(ItemOutcome::Skipped) => {}
                Err(e) => {
                    // Isolate the failure to this item and keep pulling
                    trace!(queue = %queue.name(), message = %message.id(), error = %e, "pull item failed");
                    let decision = queue
                        .handler()
                        .exception_thrown(queue, &message, e.as_ref())
                        .await;
                    queue.apply_decision(decision, &message).await;
                }
            }
            *self.processing.lock() = None;
        }

        if let Some(mode) = pull.clear {
            queue.store().clear(mode);
        }

        self.send_status(queue, &client, &request, headers::STATUS_END)
            .await;
        PullResult::Success(delivered)
    }
}
