//! Client Capability
//!
//! The queue engine never touches sockets. A connected client is consumed as
//! a `ClientTransport` capability (send bytes, query connectivity) provided
//! by the transport layer, wrapped per subscription in a `QueueClient`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::queue::tracker::MessageDelivery;

/// Errors surfaced by a transport send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The client is no longer connected
    Disconnected,
    /// The transport rejected or dropped the payload
    Transport(&'static str),
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Disconnected => write!(f, "client disconnected"),
            SendError::Transport(msg) => write!(f, "transport error: {}", msg),
        }
    }
}

impl std::error::Error for SendError {}

/// Transport capability for one connected client
#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// Stable identifier for this connection
    fn unique_id(&self) -> &str;

    /// Whether the underlying connection is still alive
    fn is_connected(&self) -> bool;

    /// Hand serialized bytes to the transport
    async fn send(&self, data: Bytes) -> Result<(), SendError>;
}

/// A client subscribed to one queue
pub struct QueueClient {
    transport: Arc<dyn ClientTransport>,
    subscribed_at: Instant,
    consume_count: AtomicU64,
    /// The one delivery this client is mid-acknowledgement for, when the
    /// queue enforces serialized wait-for-ack delivery
    currently_processing: Mutex<Option<Arc<MessageDelivery>>>,
    process_deadline: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for QueueClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueClient")
            .field("unique_id", &self.transport.unique_id())
            .field("subscribed_at", &self.subscribed_at)
            .field(
                "consume_count",
                &self.consume_count.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

impl QueueClient {
    pub fn new(transport: Arc<dyn ClientTransport>) -> Self {
        Self {
            transport,
            subscribed_at: Instant::now(),
            consume_count: AtomicU64::new(0),
            currently_processing: Mutex::new(None),
            process_deadline: Mutex::new(None),
        }
    }

    pub fn unique_id(&self) -> &str {
        self.transport.unique_id()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn subscribed_at(&self) -> Instant {
        self.subscribed_at
    }

    pub fn consume_count(&self) -> u64 {
        self.consume_count.load(Ordering::Relaxed)
    }

    pub fn increment_consume_count(&self) {
        self.consume_count.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn send(&self, data: Bytes) -> Result<(), SendError> {
        if !self.transport.is_connected() {
            return Err(SendError::Disconnected);
        }
        self.transport.send(data).await
    }

    /// Occupy this client's wait-for-ack slot
    pub fn set_processing(&self, delivery: Arc<MessageDelivery>, deadline: Option<Instant>) {
        *self.currently_processing.lock() = Some(delivery);
        *self.process_deadline.lock() = deadline;
    }

    /// Release the wait-for-ack slot
    pub fn release_processing(&self) {
        *self.currently_processing.lock() = None;
        *self.process_deadline.lock() = None;
    }

    pub fn currently_processing(&self) -> Option<Arc<MessageDelivery>> {
        self.currently_processing.lock().clone()
    }

    /// Whether this client can take a new wait-for-ack delivery. A client
    /// whose process deadline elapsed is treated as available again.
    pub fn is_available(&self, now: Instant) -> bool {
        if !self.is_connected() {
            return false;
        }
        let processing = self.currently_processing.lock();
        if processing.is_none() {
            return true;
        }
        match *self.process_deadline.lock() {
            Some(deadline) => deadline <= now,
            None => false,
        }
    }
}

/// In-process transport backed by an mpsc channel.
///
/// Used by tests and by embedded consumers that live in the broker process.
pub struct ChannelTransport {
    id: String,
    tx: mpsc::UnboundedSender<Bytes>,
    connected: AtomicBool,
}

impl ChannelTransport {
    /// Create a transport and the receiving end of its channel
    pub fn pair(id: impl Into<String>) -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            id: id.into(),
            tx,
            connected: AtomicBool::new(true),
        });
        (transport, rx)
    }

    /// Mark the transport as gone; subsequent sends fail
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClientTransport for ChannelTransport {
    fn unique_id(&self) -> &str {
        &self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, data: Bytes) -> Result<(), SendError> {
        if !self.is_connected() {
            return Err(SendError::Disconnected);
        }
        self.tx
            .send(data)
            .map_err(|_| SendError::Transport("channel closed"))
    }
}
