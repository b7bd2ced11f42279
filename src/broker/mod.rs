//! Broker
//!
//! Owns the queue registry and routes producer, consumer and cluster
//! traffic to the right queue. Queues are created lazily with the
//! configured defaults when a producer first targets them.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::client::{ClientTransport, QueueClient};
use crate::cluster::{NodeLink, NodeMessage, QueueSync, SyncError};
use crate::config::{Config, ConfigError, QueueDefaults};
use crate::hooks::{DefaultDeliveryHandler, DeliveryHandler};
use crate::protocol::{read_frames, write_frame, Message};
use crate::queue::state::{PullResult, PushResult};
use crate::queue::store::{ClearMode, KeyedStore, LinkedStore, MessageStore};
use crate::queue::{Queue, QueueError, QueueStatus, QueueType};

#[cfg(test)]
mod tests;

/// Errors surfaced by registry operations
#[derive(Debug)]
pub enum BrokerError {
    QueueAlreadyExists(String),
    QueueNotFound(String),
    Queue(QueueError),
    Config(ConfigError),
    Sync(SyncError),
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerError::QueueAlreadyExists(name) => write!(f, "queue already exists: {}", name),
            BrokerError::QueueNotFound(name) => write!(f, "queue not found: {}", name),
            BrokerError::Queue(e) => write!(f, "queue error: {}", e),
            BrokerError::Config(e) => write!(f, "config error: {}", e),
            BrokerError::Sync(e) => write!(f, "sync error: {}", e),
        }
    }
}

impl std::error::Error for BrokerError {}

impl From<ConfigError> for BrokerError {
    fn from(e: ConfigError) -> Self {
        BrokerError::Config(e)
    }
}

impl From<SyncError> for BrokerError {
    fn from(e: SyncError) -> Self {
        BrokerError::Sync(e)
    }
}

impl From<QueueError> for BrokerError {
    fn from(e: QueueError) -> Self {
        BrokerError::Queue(e)
    }
}

fn queue_type_name(queue_type: QueueType) -> &'static str {
    match queue_type {
        QueueType::Push => "push",
        QueueType::RoundRobin => "round-robin",
        QueueType::Pull => "pull",
    }
}

fn parse_queue_type(name: &str) -> Option<QueueType> {
    match name {
        "push" => Some(QueueType::Push),
        "round-robin" => Some(QueueType::RoundRobin),
        "pull" => Some(QueueType::Pull),
        _ => None,
    }
}

pub struct Broker {
    queues: DashMap<String, Arc<Queue>>,
    defaults: QueueDefaults,
    handler: Arc<dyn DeliveryHandler>,
    /// Links to other cluster nodes; mirror operations fan out here
    node_links: RwLock<Vec<Arc<dyn NodeLink>>>,
    /// One synchronizer per queue with an exchange in flight or completed
    syncs: DashMap<String, Arc<QueueSync>>,
}

impl Broker {
    pub fn new(config: &Config) -> Arc<Self> {
        Self::with_handler(config, Arc::new(DefaultDeliveryHandler))
    }

    /// Build a broker whose queues consult the given delivery handler
    pub fn with_handler(config: &Config, handler: Arc<dyn DeliveryHandler>) -> Arc<Self> {
        Arc::new(Self {
            queues: DashMap::new(),
            defaults: config.queue.clone(),
            handler,
            node_links: RwLock::new(Vec::new()),
            syncs: DashMap::new(),
        })
    }

    fn build_store(&self) -> Arc<dyn MessageStore> {
        match self.defaults.store.as_str() {
            "keyed" => Arc::new(KeyedStore::new()),
            _ => Arc::new(LinkedStore::new()),
        }
    }

    /// Create a queue with the configured defaults and start its keepers
    pub fn create_queue(
        &self,
        name: &str,
        queue_type: QueueType,
    ) -> Result<Arc<Queue>, BrokerError> {
        let options = self.defaults.to_queue_options()?;
        match self.queues.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(BrokerError::QueueAlreadyExists(name.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let queue = Queue::new(
                    name,
                    queue_type,
                    options,
                    self.build_store(),
                    self.handler.clone(),
                );
                queue.start();
                entry.insert(queue.clone());
                info!(queue = %name, queue_type = queue_type_name(queue_type), "queue created");
                Ok(queue)
            }
        }
    }

    pub fn queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.get(name).map(|q| q.clone())
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.queues.iter().map(|q| q.key().clone()).collect()
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Stop a queue's keepers and drop it from the registry
    pub fn remove_queue(&self, name: &str) -> bool {
        match self.queues.remove(name) {
            Some((_, queue)) => {
                queue.stop();
                self.syncs.remove(name);
                info!(queue = %name, "queue removed");
                true
            }
            None => false,
        }
    }

    fn find_or_create(&self, name: &str, queue_type: QueueType) -> Result<Arc<Queue>, BrokerError> {
        if let Some(queue) = self.queue(name) {
            return Ok(queue);
        }
        match self.create_queue(name, queue_type) {
            Ok(queue) => Ok(queue),
            // Lost a creation race; the other entry wins
            Err(BrokerError::QueueAlreadyExists(_)) => self
                .queue(name)
                .ok_or_else(|| BrokerError::QueueNotFound(name.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Route a producer message to its target queue, creating the queue on
    /// first use. Accepted messages are mirrored to cluster peers.
    pub async fn push(
        &self,
        mut message: Message,
        source: Option<Arc<dyn ClientTransport>>,
    ) -> PushResult {
        let target = message.target.clone();
        let queue = match self.find_or_create(&target, QueueType::Push) {
            Ok(queue) => queue,
            Err(e) => {
                warn!(target = %message.target, error = %e, "push rejected");
                return PushResult::Error;
            }
        };
        // Mirrored copies must carry the same id the local queue assigns
        message.ensure_id();
        let mirror_copy = message.clone();
        let result = queue.push(message, source).await;
        if matches!(result, PushResult::Success | PushResult::NoConsumers) {
            self.mirror_push(queue.name(), &mirror_copy);
        }
        result
    }

    pub async fn pull(
        &self,
        target: &str,
        client: Arc<QueueClient>,
        request: Message,
    ) -> PullResult {
        match self.queue(target) {
            Some(queue) => queue.pull(client, request).await,
            None => PullResult::StatusNotSupported,
        }
    }

    pub async fn acknowledge(
        &self,
        target: &str,
        client_id: &str,
        message_id: &str,
        success: bool,
    ) -> bool {
        match self.queue(target) {
            Some(queue) => queue.acknowledge(client_id, message_id, success).await,
            None => false,
        }
    }

    pub async fn subscribe(
        &self,
        target: &str,
        transport: Arc<dyn ClientTransport>,
    ) -> Result<Arc<QueueClient>, BrokerError> {
        let queue = self.find_or_create(target, QueueType::Push)?;
        Ok(queue.subscribe(transport).await?)
    }

    pub fn unsubscribe(&self, target: &str, client_id: &str) -> bool {
        match self.queue(target) {
            Some(queue) => queue.unsubscribe(client_id),
            None => false,
        }
    }

    /// Transport-level disconnect; every queue drops the subscription
    pub fn client_disconnected(&self, client_id: &str) {
        for queue in self.queues.iter() {
            queue.client_disconnected(client_id);
        }
    }

    /// Swap a queue's dispatch policy and broadcast the change to peers
    pub async fn set_queue_type(&self, target: &str, queue_type: QueueType) -> bool {
        let Some(queue) = self.queue(target) else {
            return false;
        };
        if !queue.set_queue_type(queue_type).await {
            return false;
        }
        self.mirror(NodeMessage::QueueStateMessage {
            queue: target.to_string(),
            queue_type: queue_type_name(queue_type).to_string(),
            running: queue.status() == QueueStatus::Running,
        });
        true
    }

    /// Wipe a queue's store and mirror the wipe to peers
    pub fn clear_queue(&self, target: &str, mode: ClearMode) -> bool {
        let Some(queue) = self.queue(target) else {
            return false;
        };
        queue.clear(mode);
        if mode == ClearMode::All {
            self.mirror(NodeMessage::ClearQueueMessage {
                queue: target.to_string(),
            });
        }
        true
    }

    /// Remove one stored message by id and mirror the removal
    pub fn remove_message(&self, target: &str, message_id: &str) -> bool {
        let Some(queue) = self.queue(target) else {
            return false;
        };
        let removed = queue
            .store()
            .find_and_remove(&|m| m.id() == message_id)
            .is_some();
        if removed {
            self.mirror(NodeMessage::RemoveQueueMessage {
                queue: target.to_string(),
                message_id: message_id.to_string(),
            });
        }
        removed
    }

    /// Stop every queue; keeper loops exit on their next tick
    pub fn shutdown(&self) {
        for queue in self.queues.iter() {
            queue.stop();
        }
        info!(queues = self.queue_count(), "broker shut down");
    }

    // ---- cluster ----

    pub fn register_node_link(&self, link: Arc<dyn NodeLink>) {
        info!(node = %link.node_id(), "node link registered");
        self.node_links.write().push(link);
    }

    pub fn remove_node_link(&self, node_id: &str) {
        self.node_links.write().retain(|l| l.node_id() != node_id);
    }

    /// Start sharing a queue's contents with one replica (main side)
    pub async fn begin_queue_sync(
        &self,
        target: &str,
        link: Arc<dyn NodeLink>,
    ) -> Result<(), BrokerError> {
        let queue = self
            .queue(target)
            .ok_or_else(|| BrokerError::QueueNotFound(target.to_string()))?;
        let sync = QueueSync::new(queue, link.clone());
        // Every other replica gets the refresh nudge after a reverse sync
        let fanout: Vec<Arc<dyn NodeLink>> = self
            .node_links
            .read()
            .iter()
            .filter(|l| l.node_id() != link.node_id())
            .cloned()
            .collect();
        sync.set_fanout_links(fanout);
        self.syncs.insert(target.to_string(), sync.clone());
        sync.begin_sharing().await?;
        Ok(())
    }

    fn sync_for(&self, target: &str, link: &Arc<dyn NodeLink>) -> Result<Arc<QueueSync>, BrokerError> {
        if let Some(sync) = self.syncs.get(target) {
            return Ok(sync.clone());
        }
        let queue = self.find_or_create(target, QueueType::Push)?;
        let sync = QueueSync::new(queue, link.clone());
        self.syncs.insert(target.to_string(), sync.clone());
        Ok(sync)
    }

    /// Dispatch an inbound cluster message: sync-phase traffic goes to the
    /// queue's synchronizer, mirror operations apply directly.
    pub async fn handle_node_message(&self, link: &Arc<dyn NodeLink>, message: NodeMessage) {
        match message {
            NodeMessage::QueueMessageIdList { ref queue, .. }
            | NodeMessage::QueueMessageRequest { ref queue, .. }
            | NodeMessage::QueueMessageResponse { ref queue, .. }
            | NodeMessage::SyncReverseMessages { ref queue, .. }
            | NodeMessage::SyncCompletion { ref queue } => {
                let sync = match self.sync_for(queue, link) {
                    Ok(sync) => sync,
                    Err(e) => {
                        warn!(queue = %queue, error = %e, "sync message dropped");
                        return;
                    }
                };
                if let Err(e) = sync.handle(message).await {
                    warn!(node = %link.node_id(), error = %e, "sync step failed");
                }
            }
            NodeMessage::PushQueueMessage { queue, payload } => {
                self.replay(&queue, &payload, false);
            }
            NodeMessage::PutBackQueueMessage {
                queue,
                payload,
                to_front,
            } => {
                self.replay(&queue, &payload, to_front);
            }
            NodeMessage::RemoveQueueMessage { queue, message_id } => {
                if let Some(q) = self.queue(&queue) {
                    let _ = q.store().find_and_remove(&|m| m.id() == message_id);
                }
            }
            NodeMessage::ClearQueueMessage { queue } => {
                if let Some(q) = self.queue(&queue) {
                    q.clear(ClearMode::All);
                }
            }
            NodeMessage::QueueStateMessage {
                queue,
                queue_type,
                running,
            } => {
                let Some(q) = self.queue(&queue) else {
                    return;
                };
                if let Some(parsed) = parse_queue_type(&queue_type) {
                    q.set_queue_type(parsed).await;
                }
                q.set_status(if running {
                    QueueStatus::Running
                } else {
                    QueueStatus::Stopped
                });
            }
            NodeMessage::QueueListRefresh => {
                debug!(node = %link.node_id(), "queue list refresh requested");
            }
        }
    }

    /// Replay mirrored messages into a local queue, bypassing dispatch
    fn replay(&self, target: &str, payload: &[u8], to_front: bool) {
        let queue = match self.find_or_create(target, QueueType::Push) {
            Ok(queue) => queue,
            Err(e) => {
                warn!(queue = %target, error = %e, "mirror replay dropped");
                return;
            }
        };
        let messages = match read_frames(payload) {
            Ok(messages) => messages,
            Err(e) => {
                warn!(queue = %target, error = %e, "mirror payload rejected");
                return;
            }
        };
        for message in messages {
            let result = if to_front {
                queue.restore_front(message)
            } else {
                queue.restore(message)
            };
            if let Err(e) = result {
                debug!(queue = %target, error = %e, "mirror replay skipped");
            }
        }
    }

    fn mirror_push(&self, target: &str, message: &Message) {
        if self.node_links.read().is_empty() {
            return;
        }
        let mut payload = Vec::new();
        if let Err(e) = write_frame(&mut payload, message) {
            debug!(queue = %target, error = %e, "mirror encode failed");
            return;
        }
        self.mirror(NodeMessage::PushQueueMessage {
            queue: target.to_string(),
            payload,
        });
    }

    /// Best-effort fan-out to every connected peer, off the hot path
    fn mirror(&self, message: NodeMessage) {
        let links = self.node_links.read().clone();
        if links.is_empty() {
            return;
        }
        tokio::spawn(async move {
            for link in links {
                if !link.is_connected() {
                    continue;
                }
                if let Err(e) = link.send(message.clone()).await {
                    debug!(node = %link.node_id(), error = %e, "mirror send failed");
                }
            }
        });
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("queues", &self.queue_count())
            .finish()
    }
}
