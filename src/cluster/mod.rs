//! Cluster Replication
//!
//! Leader-driven full-state reconciliation of queue contents between a main
//! node and its replicas. This is not a consensus protocol: the main node
//! shares an id manifest, the replica requests what it lacks and reports
//! back what only it holds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub mod protocol;
pub mod sync;

pub use protocol::NodeMessage;
pub use sync::{QueueSync, SyncPhase};

/// Errors raised by queue synchronization
#[derive(Debug)]
pub enum SyncError {
    /// The queue's sync lock could not be acquired
    LockUnavailable,
    /// The remote peer went away mid-exchange
    RemoteDisconnected,
    /// Operation does not match the current sync phase
    WrongPhase,
    /// Link-level send failure
    Send(String),
    /// Payload could not be encoded
    Encode(bincode::error::EncodeError),
    /// Payload could not be decoded
    Decode(crate::protocol::FrameError),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::LockUnavailable => write!(f, "queue sync lock unavailable"),
            SyncError::RemoteDisconnected => write!(f, "remote node disconnected"),
            SyncError::WrongPhase => write!(f, "operation does not match sync phase"),
            SyncError::Send(msg) => write!(f, "link send failed: {}", msg),
            SyncError::Encode(e) => write!(f, "encode error: {}", e),
            SyncError::Decode(e) => write!(f, "decode error: {}", e),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<bincode::error::EncodeError> for SyncError {
    fn from(e: bincode::error::EncodeError) -> Self {
        SyncError::Encode(e)
    }
}

impl From<crate::protocol::FrameError> for SyncError {
    fn from(e: crate::protocol::FrameError) -> Self {
        SyncError::Decode(e)
    }
}

/// Capability for reaching one remote node. Transport lives elsewhere; the
/// synchronizer only needs to send typed messages and observe connectivity.
#[async_trait]
pub trait NodeLink: Send + Sync {
    /// Remote node identifier
    fn node_id(&self) -> &str;

    /// Whether the underlying connection is still alive
    fn is_connected(&self) -> bool;

    async fn send(&self, message: NodeMessage) -> Result<(), SyncError>;
}

/// In-process node link backed by an mpsc channel.
///
/// Used by tests and by single-process cluster simulations.
pub struct ChannelNodeLink {
    id: String,
    tx: mpsc::UnboundedSender<NodeMessage>,
    connected: AtomicBool,
}

impl ChannelNodeLink {
    /// Create a link and the receiving end of its channel
    pub fn pair(id: impl Into<String>) -> (Arc<Self>, mpsc::UnboundedReceiver<NodeMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Arc::new(Self {
            id: id.into(),
            tx,
            connected: AtomicBool::new(true),
        });
        (link, rx)
    }

    /// Mark the link as gone; subsequent sends fail
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl NodeLink for ChannelNodeLink {
    fn node_id(&self) -> &str {
        &self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, message: NodeMessage) -> Result<(), SyncError> {
        if !self.is_connected() {
            return Err(SyncError::RemoteDisconnected);
        }
        self.tx
            .send(message)
            .map_err(|_| SyncError::Send("channel closed".to_string()))
    }
}
