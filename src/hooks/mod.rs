//! Delivery Decision Hooks
//!
//! Extensibility point invoked at each delivery lifecycle step. A queue is
//! constructed with one `DeliveryHandler`; its decisions govern whether a
//! message is kept, re-queued or dropped at every stage of delivery.

use std::sync::Arc;

use async_trait::async_trait;

use crate::client::QueueClient;
use crate::queue::message::QueueMessage;
use crate::queue::tracker::MessageDelivery;
use crate::queue::Queue;


/// Where a message is re-inserted when a decision asks for put-back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PutBack {
    /// Message is not re-inserted
    #[default]
    No,
    /// Re-insert at the priority re-entry location (delivered again first)
    Start,
    /// Re-insert at the normal tail
    End,
}

/// Outcome of one hook call.
///
/// `allow = false` suppresses downstream side effects for the current step;
/// it is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Continue processing this message in the current pass
    pub allow: bool,
    /// Re-insertion policy when the message is not finally consumed
    pub put_back: PutBack,
    /// Persist the message at this step
    pub save: bool,
    /// Send (or re-send) a positive acknowledgement to the producer
    pub acknowledge: bool,
}

impl Decision {
    /// Allow the step, no side effects
    pub fn allow() -> Self {
        Self {
            allow: true,
            put_back: PutBack::No,
            save: false,
            acknowledge: false,
        }
    }

    /// Deny the step, no side effects
    pub fn deny() -> Self {
        Self {
            allow: false,
            put_back: PutBack::No,
            save: false,
            acknowledge: false,
        }
    }

    /// Allow and re-insert per `put_back`
    pub fn put_back(put_back: PutBack) -> Self {
        Self {
            allow: true,
            put_back,
            save: false,
            acknowledge: false,
        }
    }

    /// Fold two decisions into one, most-restrictive-wins: a deny anywhere
    /// denies, save/acknowledge stick once requested, and a put-back request
    /// survives with `Start` taking precedence over `End`.
    pub fn combine(self, other: Decision) -> Decision {
        Decision {
            allow: self.allow && other.allow,
            put_back: match (self.put_back, other.put_back) {
                (PutBack::Start, _) | (_, PutBack::Start) => PutBack::Start,
                (PutBack::End, _) | (_, PutBack::End) => PutBack::End,
                _ => PutBack::No,
            },
            save: self.save || other.save,
            acknowledge: self.acknowledge || other.acknowledge,
        }
    }
}

impl Default for Decision {
    fn default() -> Self {
        Self::allow()
    }
}

/// Delivery lifecycle hooks for a queue
///
/// Implement this trait to customize delivery behavior. All methods have
/// default implementations that allow everything.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    /// Called before a delivery pass starts for a message
    async fn begin_send(&self, _queue: &Queue, _message: &Arc<QueueMessage>) -> Decision {
        Decision::allow()
    }

    /// Called per candidate receiver before the message is sent to it
    async fn can_consumer_receive(
        &self,
        _queue: &Queue,
        _message: &Arc<QueueMessage>,
        _receiver: &QueueClient,
    ) -> bool {
        true
    }

    /// Called after a successful send to one receiver
    async fn consumer_received(&self, _queue: &Queue, _delivery: &MessageDelivery) -> Decision {
        Decision::allow()
    }

    /// Called after a failed send to one receiver
    async fn consumer_receive_failed(
        &self,
        _queue: &Queue,
        _delivery: &MessageDelivery,
    ) -> Decision {
        Decision::allow()
    }

    /// Called once the delivery pass for a message has completed
    async fn end_send(&self, _queue: &Queue, _message: &Arc<QueueMessage>) -> Decision {
        Decision::allow()
    }

    /// Called when a tracked delivery's acknowledge deadline elapsed, or all
    /// of its receivers disconnected
    async fn acknowledge_timed_out(
        &self,
        _queue: &Queue,
        _delivery: &MessageDelivery,
    ) -> Decision {
        Decision::allow()
    }

    /// Called when a message expired in the store without being delivered
    async fn message_timed_out(&self, _queue: &Queue, _message: &Arc<QueueMessage>) -> Decision {
        Decision::allow()
    }

    /// Called when delivery processing hit an error mid-pass
    async fn exception_thrown(
        &self,
        _queue: &Queue,
        _message: &Arc<QueueMessage>,
        _error: &(dyn std::error::Error + Send + Sync),
    ) -> Decision {
        Decision::put_back(PutBack::End)
    }

    /// Called when a message is removed from the store for delivery
    async fn message_dequeued(&self, _queue: &Queue, _message: &Arc<QueueMessage>) {}
}

/// Default handler that allows everything
pub struct DefaultDeliveryHandler;

#[async_trait]
impl DeliveryHandler for DefaultDeliveryHandler {
    // All methods use default implementations (allow all)
}

impl Default for DefaultDeliveryHandler {
    fn default() -> Self {
        Self
    }
}

/// Implement DeliveryHandler for Arc<T> where T: DeliveryHandler
/// This allows Arc-wrapped handlers to be used directly
#[async_trait]
impl<T: DeliveryHandler + ?Sized> DeliveryHandler for Arc<T> {
    async fn begin_send(&self, queue: &Queue, message: &Arc<QueueMessage>) -> Decision {
        (**self).begin_send(queue, message).await
    }

    async fn can_consumer_receive(
        &self,
        queue: &Queue,
        message: &Arc<QueueMessage>,
        receiver: &QueueClient,
    ) -> bool {
        (**self).can_consumer_receive(queue, message, receiver).await
    }

    async fn consumer_received(&self, queue: &Queue, delivery: &MessageDelivery) -> Decision {
        (**self).consumer_received(queue, delivery).await
    }

    async fn consumer_receive_failed(&self, queue: &Queue, delivery: &MessageDelivery) -> Decision {
        (**self).consumer_receive_failed(queue, delivery).await
    }

    async fn end_send(&self, queue: &Queue, message: &Arc<QueueMessage>) -> Decision {
        (**self).end_send(queue, message).await
    }

    async fn acknowledge_timed_out(&self, queue: &Queue, delivery: &MessageDelivery) -> Decision {
        (**self).acknowledge_timed_out(queue, delivery).await
    }

    async fn message_timed_out(&self, queue: &Queue, message: &Arc<QueueMessage>) -> Decision {
        (**self).message_timed_out(queue, message).await
    }

    async fn exception_thrown(
        &self,
        queue: &Queue,
        message: &Arc<QueueMessage>,
        error: &(dyn std::error::Error + Send + Sync),
    ) -> Decision {
        (**self).exception_thrown(queue, message, error).await
    }

    async fn message_dequeued(&self, queue: &Queue, message: &Arc<QueueMessage>) {
        (**self).message_dequeued(queue, message).await;
    }
}
