//! Round-robin dispatch state
//!
//! Sends each message to exactly one subscriber, rotating a cursor over the
//! client snapshot. Fairness is best-effort: the cursor always advances past
//! the chosen index, but heavy skip/retry conditions give no strict
//! round-robin guarantee.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{error, trace};

use crate::client::QueueClient;
use crate::queue::message::QueueMessage;
use crate::queue::tracker::MessageDelivery;
use crate::queue::{AckMode, Queue, QueueEvent, QueueType};

use super::{PushResult, QueueState, StateAction};

/// How long a push keeps searching for an available client before parking
/// the message as backlog
const SEARCH_CEILING: Duration = Duration::from_secs(30);
/// Backoff between availability scans
const SEARCH_BACKOFF: Duration = Duration::from_millis(50);
/// Backoff between tracker registration retries
const TRACK_BACKOFF: Duration = Duration::from_millis(10);

pub struct RoundRobinState {
    cursor: AtomicUsize,
    processing: Mutex<Option<Arc<QueueMessage>>>,
}

impl RoundRobinState {
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
            processing: Mutex::new(None),
        }
    }

    /// Find the next available client starting at the cursor, wrapping the
    /// snapshot. Availability means connected, free wait-for-ack slot (an
    /// elapsed process deadline frees the slot) and hook acceptance.
    async fn next_available(
        &self,
        queue: &Arc<Queue>,
        message: &Arc<QueueMessage>,
        clients: &[Arc<QueueClient>],
    ) -> Option<(usize, Arc<QueueClient>)> {
        let needs_slot = queue.options().acknowledge == AckMode::WaitForAcknowledge;
        let start = self.cursor.load(Ordering::Relaxed);
        let now = Instant::now();
        for offset in 0..clients.len() {
            let index = (start + offset) % clients.len();
            let client = &clients[index];
            if !client.is_connected() {
                continue;
            }
            if needs_slot && !client.is_available(now) {
                continue;
            }
            if !queue
                .handler()
                .can_consumer_receive(queue, message, client)
                .await
            {
                continue;
            }
            return Some((index, client.clone()));
        }
        None
    }

    async fn deliver(
        &self,
        queue: &Arc<Queue>,
        message: &Arc<QueueMessage>,
        client: Arc<QueueClient>,
        search_deadline: Instant,
    ) -> Result<PushResult, ()> {
        message.begin_delivery_pass();

        let begin = queue.handler().begin_send(queue, message).await;
        if !queue.apply_decision(begin, message).await {
            return Ok(PushResult::Success);
        }

        let bytes = match message.message.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(queue = %queue.name(), error = %e, "failed to serialize message");
                return Ok(PushResult::Error);
            }
        };

        let wait_ack = queue.options().acknowledge == AckMode::WaitForAcknowledge;
        let track_ack = queue.options().acknowledge != AckMode::None;
        let ack_deadline = queue.ack_deadline();

        let delivery = Arc::new(MessageDelivery::new(
            message.clone(),
            client.clone(),
            ack_deadline,
        ));

        if track_ack {
            // Two pushes can pick the same client; retry registration until
            // the tracker accepts
            let mut tracked = queue.tracker().track(delivery.clone());
            while !tracked && Instant::now() < search_deadline {
                tokio::time::sleep(TRACK_BACKOFF).await;
                tracked = queue.tracker().track(delivery.clone());
            }
            if !tracked {
                return Err(());
            }
            message.add_receiver(client.clone());
        }
        if wait_ack {
            client.set_processing(delivery.clone(), ack_deadline);
        }

        match client.send(bytes).await {
            Ok(()) => {
                client.increment_consume_count();
                trace!(
                    queue = %queue.name(),
                    message = %message.id(),
                    client = %client.unique_id(),
                    "message sent"
                );
                let decision = queue.handler().consumer_received(queue, &delivery).await;
                queue.apply_decision(decision, message).await;
                let end = queue.handler().end_send(queue, message).await;
                queue.apply_decision(end, message).await;
                queue.emit(QueueEvent::MessageConsumed {
                    message_id: message.id().to_string(),
                    client_id: client.unique_id().to_string(),
                });
                Ok(PushResult::Success)
            }
            Err(e) => {
                trace!(
                    queue = %queue.name(),
                    message = %message.id(),
                    client = %client.unique_id(),
                    error = %e,
                    "send failed, releasing slot"
                );
                if wait_ack {
                    client.release_processing();
                }
                if track_ack {
                    queue.tracker().remove_delivery(&delivery);
                    message.remove_receiver(client.unique_id());
                }
                let decision = queue
                    .handler()
                    .consumer_receive_failed(queue, &delivery)
                    .await;
                if queue.apply_decision(decision, message).await && !message.is_in_queue() {
                    // Not put back by the decision; try another client
                    return Err(());
                }
                Ok(PushResult::Success)
            }
        }
    }

    fn park(&self, queue: &Arc<Queue>, message: Arc<QueueMessage>) -> PushResult {
        match queue.store().put(message) {
            Ok(()) => PushResult::NoConsumers,
            Err(e) => {
                error!(queue = %queue.name(), error = %e, "failed to store message");
                PushResult::Error
            }
        }
    }
}

impl Default for RoundRobinState {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueState for RoundRobinState {
    fn processing_message(&self) -> Option<Arc<QueueMessage>> {
        self.processing.lock().clone()
    }

    fn trigger_supported(&self) -> bool {
        true
    }

    async fn push(&self, queue: &Arc<Queue>, message: Arc<QueueMessage>) -> PushResult {
        *self.processing.lock() = Some(message.clone());
        let search_deadline = Instant::now() + SEARCH_CEILING;

        let result = loop {
            let clients = queue.client_snapshot();
            if clients.is_empty() {
                break self.park(queue, message.clone());
            }

            match self.next_available(queue, &message, &clients).await {
                Some((index, client)) => {
                    // Forward progress regardless of outcome
                    self.cursor
                        .store((index + 1) % clients.len(), Ordering::Relaxed);
                    match self
                        .deliver(queue, &message, client, search_deadline)
                        .await
                    {
                        Ok(result) => break result,
                        // Delivery fell through; keep searching until the
                        // ceiling
                        Err(()) => {}
                    }
                }
                None => {}
            }

            if Instant::now() >= search_deadline {
                break self.park(queue, message.clone());
            }
            tokio::time::sleep(SEARCH_BACKOFF).await;
        };

        *self.processing.lock() = None;
        result
    }

    fn enter(&self, _previous: QueueType) -> StateAction {
        StateAction::AllowAndTrigger
    }
}
