//! Queue Synchronizer
//!
//! Reconciles a replica queue's contents with a main node's through a
//! full-set-difference exchange: the main shares an id manifest under the
//! queue's exclusive lock, the replica requests the ids it lacks and
//! reports back replica-only messages as a reverse-sync batch. A watchdog
//! bounds how long the queue stays locked; every exit path restores
//! `Running` and releases the lock.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};

use crate::protocol::{read_frames, write_frame};
use crate::queue::message::QueueMessage;
use crate::queue::store::StoreError;
use crate::queue::{Queue, QueueStatus};

use super::protocol::NodeMessage;
use super::{NodeLink, SyncError};

/// Hard ceiling on one sync exchange; the watchdog aborts past it
const SYNC_CEILING: Duration = Duration::from_secs(180);
/// Watchdog poll interval
const WATCHDOG_TICK: Duration = Duration::from_secs(1);

/// Where this node stands in a sync exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    None,
    /// Main side: manifest shared, serving requests
    Sharing,
    /// Replica side: waiting for requested messages
    Receiving,
}

/// Per-queue synchronizer bound to one remote node
pub struct QueueSync {
    queue: Arc<Queue>,
    link: Arc<dyn NodeLink>,
    phase: Mutex<SyncPhase>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
    /// Replica-only messages found during the diff, reported back to main
    additional: Mutex<Vec<Arc<QueueMessage>>>,
    /// Main side: a reverse-sync batch arrived during the exchange
    reverse_received: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    /// Other replicas to nudge after a reconciliation
    fanout: Mutex<Vec<Arc<dyn NodeLink>>>,
}

impl QueueSync {
    pub fn new(queue: Arc<Queue>, link: Arc<dyn NodeLink>) -> Arc<Self> {
        Arc::new(Self {
            queue,
            link,
            phase: Mutex::new(SyncPhase::None),
            permit: Mutex::new(None),
            additional: Mutex::new(Vec::new()),
            reverse_received: AtomicBool::new(false),
            started_at: Mutex::new(None),
            fanout: Mutex::new(Vec::new()),
        })
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.lock()
    }

    /// Replicas to notify when main learns about replica-only data
    pub fn set_fanout_links(&self, links: Vec<Arc<dyn NodeLink>>) {
        *self.fanout.lock() = links;
    }

    /// Route an inbound node message to the matching sync step. Mirror
    /// operations (push, put-back, remove, clear) are the broker's concern.
    pub async fn handle(self: &Arc<Self>, message: NodeMessage) -> Result<(), SyncError> {
        match message {
            NodeMessage::QueueMessageIdList {
                priority_ids,
                regular_ids,
                ..
            } => self.process_id_list(priority_ids, regular_ids).await,
            NodeMessage::QueueMessageRequest { ids, .. } => {
                self.send_requested_messages(&ids).await
            }
            NodeMessage::QueueMessageResponse { payload, .. } => {
                self.process_received_messages(&payload).await
            }
            NodeMessage::SyncReverseMessages { payload, .. } => {
                self.process_reverse_messages(&payload)
            }
            NodeMessage::SyncCompletion { .. } => {
                self.end_sharing().await;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Main side: lock the queue, share the id manifest, arm the watchdog.
    /// Fails closed; a lock that cannot be acquired aborts with a defensive
    /// release.
    pub async fn begin_sharing(self: &Arc<Self>) -> Result<(), SyncError> {
        let permit = match self.queue.sync_gate().clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.release_lock();
                return Err(SyncError::LockUnavailable);
            }
        };
        *self.permit.lock() = Some(permit);
        *self.phase.lock() = SyncPhase::Sharing;
        *self.started_at.lock() = Some(Instant::now());
        self.reverse_received.store(false, Ordering::SeqCst);
        self.queue.set_status(QueueStatus::Syncing);

        let (priority_ids, regular_ids) = self.collect_ids();
        info!(
            queue = %self.queue.name(),
            node = %self.link.node_id(),
            priority = priority_ids.len(),
            regular = regular_ids.len(),
            "sharing queue manifest"
        );

        let manifest = NodeMessage::QueueMessageIdList {
            queue: self.queue.name().to_string(),
            priority_ids,
            regular_ids,
        };
        if let Err(e) = self.link.send(manifest).await {
            self.end_sharing().await;
            return Err(e);
        }

        self.spawn_watchdog();
        Ok(())
    }

    /// Replica side: diff the manifest against local contents, request the
    /// missing ids or finish right away.
    pub async fn process_id_list(
        self: &Arc<Self>,
        priority_ids: Vec<String>,
        regular_ids: Vec<String>,
    ) -> Result<(), SyncError> {
        let permit = match self.queue.sync_gate().clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.release_lock();
                return Err(SyncError::LockUnavailable);
            }
        };
        *self.permit.lock() = Some(permit);
        *self.phase.lock() = SyncPhase::Receiving;
        *self.started_at.lock() = Some(Instant::now());
        self.queue.set_status(QueueStatus::Syncing);

        let local = self.local_messages();
        let manifest: HashSet<&String> = priority_ids.iter().chain(regular_ids.iter()).collect();

        let request: Vec<String> = priority_ids
            .iter()
            .chain(regular_ids.iter())
            .filter(|id| !local.contains_key(id.as_str()))
            .cloned()
            .collect();

        // Local extras are retained for the reverse-sync step, never
        // silently dropped
        let additional: Vec<Arc<QueueMessage>> = local
            .values()
            .filter(|m| !manifest.contains(&m.id().to_string()))
            .cloned()
            .collect();
        *self.additional.lock() = additional;

        if request.is_empty() {
            return self.end_receiving(true).await;
        }

        debug!(
            queue = %self.queue.name(),
            missing = request.len(),
            "requesting missing messages"
        );
        let result = self
            .link
            .send(NodeMessage::QueueMessageRequest {
                queue: self.queue.name().to_string(),
                ids: request,
            })
            .await;
        if result.is_err() {
            self.end_receiving(false).await?;
        }
        result
    }

    /// Main side: answer a request with one combined content block
    pub async fn send_requested_messages(&self, ids: &[String]) -> Result<(), SyncError> {
        let mut payload = Vec::new();
        for id in ids {
            match self.resolve(id) {
                Some(message) => write_frame(&mut payload, &message.message)?,
                None => debug!(queue = %self.queue.name(), id = %id, "requested id not found"),
            }
        }
        self.link
            .send(NodeMessage::QueueMessageResponse {
                queue: self.queue.name().to_string(),
                payload,
            })
            .await
    }

    /// Replica side: store the received messages and finish the exchange.
    /// Duplicate ids can happen under racing pushes and are swallowed.
    pub async fn process_received_messages(self: &Arc<Self>, payload: &[u8]) -> Result<(), SyncError> {
        if self.phase() != SyncPhase::Receiving {
            return Err(SyncError::WrongPhase);
        }
        for message in read_frames(payload)? {
            match self.queue.restore(message) {
                Ok(()) => {}
                Err(StoreError::DuplicateMessageId(id)) => {
                    debug!(queue = %self.queue.name(), id = %id, "duplicate during sync replay");
                }
            }
        }
        self.end_receiving(true).await
    }

    /// Main side: absorb replica-only messages reported after the exchange
    pub fn process_reverse_messages(&self, payload: &[u8]) -> Result<(), SyncError> {
        for message in read_frames(payload)? {
            match self.queue.restore(message) {
                Ok(()) => {}
                Err(StoreError::DuplicateMessageId(id)) => {
                    debug!(queue = %self.queue.name(), id = %id, "duplicate in reverse sync");
                }
            }
        }
        self.reverse_received.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Replica side: report local extras, notify main, unlock. Idempotent.
    pub async fn end_receiving(self: &Arc<Self>, success: bool) -> Result<(), SyncError> {
        {
            let mut phase = self.phase.lock();
            if *phase != SyncPhase::Receiving {
                return Ok(());
            }
            *phase = SyncPhase::None;
        }

        if success {
            let extras = std::mem::take(&mut *self.additional.lock());
            if !extras.is_empty() {
                let mut payload = Vec::new();
                for message in &extras {
                    if let Err(e) = write_frame(&mut payload, &message.message) {
                        debug!(queue = %self.queue.name(), error = %e, "reverse sync frame skipped");
                    }
                }
                // Best-effort gap closing, not a voting mechanism
                if let Err(e) = self
                    .link
                    .send(NodeMessage::SyncReverseMessages {
                        queue: self.queue.name().to_string(),
                        payload,
                    })
                    .await
                {
                    debug!(queue = %self.queue.name(), error = %e, "reverse sync send failed");
                }
            }
        }

        if let Err(e) = self
            .link
            .send(NodeMessage::SyncCompletion {
                queue: self.queue.name().to_string(),
            })
            .await
        {
            debug!(queue = %self.queue.name(), error = %e, "completion notice failed");
        }

        self.queue.set_status(QueueStatus::Running);
        self.release_lock();
        info!(queue = %self.queue.name(), success, "sync receive finished");
        Ok(())
    }

    /// Main side: unlock and, when a reverse batch arrived, nudge the other
    /// replicas to refresh. Idempotent; safe from the watchdog.
    pub async fn end_sharing(self: &Arc<Self>) {
        {
            let mut phase = self.phase.lock();
            if *phase != SyncPhase::Sharing {
                return;
            }
            *phase = SyncPhase::None;
        }

        self.queue.set_status(QueueStatus::Running);
        self.release_lock();
        info!(queue = %self.queue.name(), "sync share finished");

        if self.reverse_received.swap(false, Ordering::SeqCst) {
            let links = self.fanout.lock().clone();
            let queue_name = self.queue.name().to_string();
            // Fan-out is best-effort and not awaited
            tokio::spawn(async move {
                for link in links {
                    if !link.is_connected() {
                        continue;
                    }
                    if let Err(e) = link.send(NodeMessage::QueueListRefresh).await {
                        debug!(queue = %queue_name, node = %link.node_id(), error = %e, "refresh nudge failed");
                    }
                }
            });
        }
    }

    /// Drop the owned permit; secondary failures cannot occur here, making
    /// this safe to call from any abort path
    fn release_lock(&self) {
        self.permit.lock().take();
    }

    fn spawn_watchdog(self: &Arc<Self>) {
        let sync = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(WATCHDOG_TICK);
            loop {
                tick.tick().await;
                if sync.phase() != SyncPhase::Sharing {
                    break;
                }
                let expired = sync
                    .started_at
                    .lock()
                    .map(|t| t.elapsed() >= SYNC_CEILING)
                    .unwrap_or(false);
                if expired || !sync.link.is_connected() {
                    warn!(
                        queue = %sync.queue.name(),
                        node = %sync.link.node_id(),
                        expired,
                        "aborting sync share"
                    );
                    sync.end_sharing().await;
                    break;
                }
            }
        });
    }

    /// Manifest ids: store contents plus the mid-dispatch message plus every
    /// tracked delivery, priority list first
    fn collect_ids(&self) -> (Vec<String>, Vec<String>) {
        let mut priority: Vec<String> = Vec::new();
        let mut regular: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        let mut add = |message: &Arc<QueueMessage>| {
            if seen.insert(message.id().to_string()) {
                if message.message.high_priority {
                    priority.push(message.id().to_string());
                } else {
                    regular.push(message.id().to_string());
                }
            }
        };

        for message in self.queue.store().snapshot() {
            add(&message);
        }
        if let Some(message) = self.queue.processing_message() {
            add(&message);
        }
        for delivery in self.queue.tracker().snapshot() {
            add(delivery.message());
        }

        (priority, regular)
    }

    fn local_messages(&self) -> HashMap<String, Arc<QueueMessage>> {
        let mut local: HashMap<String, Arc<QueueMessage>> = HashMap::new();
        for message in self.queue.store().snapshot() {
            local.insert(message.id().to_string(), message);
        }
        if let Some(message) = self.queue.processing_message() {
            local.insert(message.id().to_string(), message);
        }
        for delivery in self.queue.tracker().snapshot() {
            local.insert(
                delivery.message().id().to_string(),
                delivery.message().clone(),
            );
        }
        local
    }

    /// Resolve a requested id, in priority order: the mid-dispatch message,
    /// the stores, then the delivery tracker snapshot
    fn resolve(&self, id: &str) -> Option<Arc<QueueMessage>> {
        if let Some(processing) = self.queue.processing_message() {
            if processing.id() == id {
                return Some(processing);
            }
        }
        if let Some(stored) = self
            .queue
            .store()
            .find_all(&|m| m.id() == id)
            .into_iter()
            .next()
        {
            return Some(stored);
        }
        self.queue
            .tracker()
            .snapshot()
            .iter()
            .find(|d| d.message().id() == id)
            .map(|d| d.message().clone())
    }
}
