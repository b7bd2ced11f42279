//! Queue Message
//!
//! Broker-local bookkeeping wrapped around a wire `Message`: store linkage,
//! delivery counters, the receiver set of the current delivery attempt and
//! the last policy decision applied.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use parking_lot::Mutex;

use crate::client::{ClientTransport, QueueClient};
use crate::hooks::Decision;
use crate::protocol::Message;

pub struct QueueMessage {
    /// The wire message as received from the producer
    pub message: Message,
    created_at: SystemTime,
    /// Expiry set at push time when the queue's timeout policy requires a
    /// per-message max lifetime
    deadline: Option<Instant>,
    /// Producer transport for acknowledgement responses
    source: Option<Arc<dyn ClientTransport>>,
    is_saved: AtomicBool,
    is_in_queue: AtomicBool,
    is_timed_out: AtomicBool,
    producer_acked: AtomicBool,
    send_count: AtomicU32,
    delivery_count: AtomicU32,
    /// Clients currently holding this message pending acknowledgement;
    /// cleared at the start of each new delivery attempt
    current_receivers: Mutex<Vec<Arc<QueueClient>>>,
    last_decision: Mutex<Decision>,
}

impl QueueMessage {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            created_at: SystemTime::now(),
            deadline: None,
            source: None,
            is_saved: AtomicBool::new(false),
            is_in_queue: AtomicBool::new(false),
            is_timed_out: AtomicBool::new(false),
            producer_acked: AtomicBool::new(false),
            send_count: AtomicU32::new(0),
            delivery_count: AtomicU32::new(0),
            current_receivers: Mutex::new(Vec::new()),
            last_decision: Mutex::new(Decision::allow()),
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_source(mut self, source: Option<Arc<dyn ClientTransport>>) -> Self {
        self.source = source;
        self
    }

    pub fn id(&self) -> &str {
        &self.message.id
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn source(&self) -> Option<&Arc<dyn ClientTransport>> {
        self.source.as_ref()
    }

    /// Link into a store. Returns false if already linked; a message is in
    /// at most one store at a time.
    pub fn mark_queued(&self) -> bool {
        self.is_in_queue
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Unlink from a store
    pub fn mark_dequeued(&self) {
        self.is_in_queue.store(false, Ordering::Release);
    }

    pub fn is_in_queue(&self) -> bool {
        self.is_in_queue.load(Ordering::Acquire)
    }

    /// Returns true if this call transitioned the message to saved
    pub fn mark_saved(&self) -> bool {
        self.is_saved
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_saved(&self) -> bool {
        self.is_saved.load(Ordering::Acquire)
    }

    pub fn mark_timed_out(&self) {
        self.is_timed_out.store(true, Ordering::Release);
    }

    pub fn is_timed_out(&self) -> bool {
        self.is_timed_out.load(Ordering::Acquire)
    }

    /// Returns true if this call claimed the producer acknowledgement
    pub fn mark_producer_acked(&self) -> bool {
        self.producer_acked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn send_count(&self) -> u32 {
        self.send_count.load(Ordering::Relaxed)
    }

    pub fn delivery_count(&self) -> u32 {
        self.delivery_count.load(Ordering::Relaxed)
    }

    /// Start a new delivery attempt: clear the receiver set and count the
    /// pass once (not once per receiver in broadcast mode)
    pub fn begin_delivery_pass(&self) {
        self.current_receivers.lock().clear();
        self.send_count.fetch_add(1, Ordering::Relaxed);
        self.delivery_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_receiver(&self, client: Arc<QueueClient>) {
        self.current_receivers.lock().push(client);
    }

    pub fn remove_receiver(&self, unique_id: &str) {
        self.current_receivers
            .lock()
            .retain(|c| c.unique_id() != unique_id);
    }

    pub fn receivers(&self) -> Vec<Arc<QueueClient>> {
        self.current_receivers.lock().clone()
    }

    pub fn clear_receivers(&self) {
        self.current_receivers.lock().clear();
    }

    pub fn set_decision(&self, decision: Decision) {
        *self.last_decision.lock() = decision;
    }

    pub fn last_decision(&self) -> Decision {
        *self.last_decision.lock()
    }
}

impl std::fmt::Debug for QueueMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueMessage")
            .field("id", &self.message.id)
            .field("target", &self.message.target)
            .field("high_priority", &self.message.high_priority)
            .field("is_in_queue", &self.is_in_queue())
            .field("send_count", &self.send_count())
            .finish()
    }
}
