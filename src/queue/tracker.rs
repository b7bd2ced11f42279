//! Delivery Tracker
//!
//! Tracks deliveries awaiting acknowledgement, detects acknowledge timeout
//! and receiver disconnection. The sweep runs once per second from the
//! queue's keeper task; decisions are collected under the lock and applied
//! outside it so hook calls never run while the tracker is locked.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::client::QueueClient;
use crate::hooks::{DeliveryHandler, PutBack};
use crate::queue::message::QueueMessage;
use crate::queue::Queue;

/// Acknowledge state of one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledge {
    /// No acknowledgement received yet
    None,
    /// Positive or negative acknowledgement received
    Received,
    /// Deadline elapsed before an acknowledgement arrived
    Timeout,
}

/// One attempt to hand a specific message to a specific client
pub struct MessageDelivery {
    message: Arc<QueueMessage>,
    receiver: Arc<QueueClient>,
    sent_at: Instant,
    deadline: Option<Instant>,
    acknowledge: Mutex<Acknowledge>,
    ack_notify: Notify,
}

impl MessageDelivery {
    pub fn new(
        message: Arc<QueueMessage>,
        receiver: Arc<QueueClient>,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            message,
            receiver,
            sent_at: Instant::now(),
            deadline,
            acknowledge: Mutex::new(Acknowledge::None),
            ack_notify: Notify::new(),
        }
    }

    pub fn message(&self) -> &Arc<QueueMessage> {
        &self.message
    }

    pub fn receiver(&self) -> &Arc<QueueClient> {
        &self.receiver
    }

    pub fn sent_at(&self) -> Instant {
        self.sent_at
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn acknowledge(&self) -> Acknowledge {
        *self.acknowledge.lock()
    }

    /// Record an acknowledge state and wake any waiter. Returns false when
    /// the state was already settled.
    pub fn settle(&self, state: Acknowledge) -> bool {
        let mut ack = self.acknowledge.lock();
        if *ack != Acknowledge::None {
            return false;
        }
        *ack = state;
        drop(ack);
        self.ack_notify.notify_one();
        true
    }

    /// Wait until this delivery is settled or `timeout` elapses. Used by the
    /// pull state to serialize successive wait-for-ack deliveries.
    pub async fn settled(&self, timeout: Duration) -> Acknowledge {
        let deadline = Instant::now() + timeout;
        loop {
            let current = self.acknowledge();
            if current != Acknowledge::None {
                return current;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Acknowledge::None;
            }
            let _ = tokio::time::timeout(remaining, self.ack_notify.notified()).await;
        }
    }
}

/// Registry of in-flight deliveries for one queue
pub struct DeliveryTracker {
    deliveries: Mutex<Vec<Arc<MessageDelivery>>>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self {
            deliveries: Mutex::new(Vec::new()),
        }
    }

    /// Optimistic registration. Refuses a second live delivery for the same
    /// (client, message-id) pair; callers that can race retry until
    /// accepted.
    pub fn track(&self, delivery: Arc<MessageDelivery>) -> bool {
        let mut deliveries = self.deliveries.lock();
        let duplicate = deliveries.iter().any(|d| {
            d.acknowledge() == Acknowledge::None
                && d.receiver().unique_id() == delivery.receiver().unique_id()
                && d.message().id() == delivery.message().id()
        });
        if duplicate {
            return false;
        }
        deliveries.push(delivery);
        true
    }

    pub fn find_delivery(&self, client_id: &str, message_id: &str) -> Option<Arc<MessageDelivery>> {
        self.deliveries
            .lock()
            .iter()
            .find(|d| d.receiver().unique_id() == client_id && d.message().id() == message_id)
            .cloned()
    }

    pub fn find_and_remove_delivery(
        &self,
        client_id: &str,
        message_id: &str,
    ) -> Option<Arc<MessageDelivery>> {
        let mut deliveries = self.deliveries.lock();
        let pos = deliveries
            .iter()
            .position(|d| d.receiver().unique_id() == client_id && d.message().id() == message_id)?;
        Some(deliveries.swap_remove(pos))
    }

    /// Explicit unregister, used on failure paths
    pub fn remove_delivery(&self, delivery: &Arc<MessageDelivery>) -> bool {
        let mut deliveries = self.deliveries.lock();
        let pos = deliveries.iter().position(|d| Arc::ptr_eq(d, delivery));
        match pos {
            Some(pos) => {
                deliveries.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn has_pending(&self) -> bool {
        self.deliveries
            .lock()
            .iter()
            .any(|d| d.acknowledge() == Acknowledge::None)
    }

    /// Distinct message-id count across pending deliveries
    pub fn pending_message_count(&self) -> usize {
        let deliveries = self.deliveries.lock();
        let mut ids: Vec<&str> = deliveries
            .iter()
            .filter(|d| d.acknowledge() == Acknowledge::None)
            .map(|d| d.message().id())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }

    pub fn snapshot(&self) -> Vec<Arc<MessageDelivery>> {
        self.deliveries.lock().clone()
    }

    pub fn clear(&self) {
        self.deliveries.lock().clear();
    }

    /// One sweep pass: drop settled deliveries, reclaim timed-out ones and
    /// those whose receivers all disconnected. Hook decisions are applied
    /// per item; one bad delivery does not halt the rest.
    pub async fn sweep(&self, queue: &Arc<Queue>) {
        let now = Instant::now();
        let mut reclaim: Vec<Arc<MessageDelivery>> = Vec::new();
        {
            let mut deliveries = self.deliveries.lock();
            deliveries.retain(|d| {
                match d.acknowledge() {
                    // Already settled: drop from tracking, nothing else to do
                    Acknowledge::Received | Acknowledge::Timeout => false,
                    Acknowledge::None => {
                        let deadline_elapsed = d.deadline().map(|t| t <= now).unwrap_or(false);
                        let receivers_gone = !d.receiver().is_connected()
                            && d.message().receivers().iter().all(|r| !r.is_connected());
                        if deadline_elapsed || receivers_gone {
                            reclaim.push(d.clone());
                            false
                        } else {
                            true
                        }
                    }
                }
            });
        }

        for delivery in reclaim {
            delivery.settle(Acknowledge::Timeout);
            delivery.receiver().release_processing();
            delivery
                .message()
                .remove_receiver(delivery.receiver().unique_id());

            debug!(
                queue = %queue.name(),
                message = %delivery.message().id(),
                client = %delivery.receiver().unique_id(),
                "delivery acknowledge timed out"
            );

            let mut decision = queue
                .handler()
                .acknowledge_timed_out(queue, delivery.as_ref())
                .await;
            // A hook that stays silent on re-insertion defers to the
            // queue's put-back policy
            if decision.put_back == PutBack::No {
                decision.put_back = queue.options().put_back;
            }
            if !queue.apply_decision(decision, delivery.message()).await {
                warn!(
                    queue = %queue.name(),
                    message = %delivery.message().id(),
                    "decision ended pipeline for timed out delivery"
                );
            }
            queue.emit(crate::queue::QueueEvent::AcknowledgeTimedOut {
                message_id: delivery.message().id().to_string(),
                client_id: delivery.receiver().unique_id().to_string(),
            });
        }
    }
}

impl Default for DeliveryTracker {
    fn default() -> Self {
        Self::new()
    }
}
