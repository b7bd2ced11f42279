//! Queue Aggregate
//!
//! A queue owns one store, one dispatch state, one delivery tracker, its
//! options and its subscriber list. Producers hand messages to `push`,
//! consumers either receive pushed deliveries or call `pull`; every
//! lifecycle step consults the queue's `DeliveryHandler` and the returned
//! decisions are applied here.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::client::{ClientTransport, QueueClient};
use crate::hooks::{Decision, DeliveryHandler, PutBack};
use crate::protocol::{headers, Message};

pub mod message;
pub mod state;
pub mod store;
pub mod timeout;
pub mod tracker;

#[cfg(test)]
mod tests;

use message::QueueMessage;
use state::{state_for, PullResult, PushResult, QueueState, StateAction};
use store::{ClearMode, MessageStore};
use tracker::{Acknowledge, DeliveryTracker};

/// Dispatch policy of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueType {
    /// Broadcast each message to all connected subscribers
    Push,
    /// One subscriber per message, rotating
    RoundRobin,
    /// Subscribers explicitly request messages
    Pull,
}

/// Runtime status of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Running,
    Stopped,
    /// Cluster sync in flight; regular dispatch waits on the sync gate
    Syncing,
}

/// Acknowledgement policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// No acknowledgement tracking
    #[default]
    None,
    /// Track acknowledgements but do not serialize deliveries
    Request,
    /// Serialize deliveries per consumer until acknowledged
    WaitForAcknowledge,
}

/// Per-queue delivery options
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub acknowledge: AckMode,
    /// Deadline for a tracked delivery before the sweep reclaims it
    pub acknowledge_timeout: Duration,
    /// Per-message max lifetime in the store; None means no timeout
    pub message_timeout: Option<Duration>,
    /// Maximum stored messages, 0 = unlimited
    pub message_limit: usize,
    /// Maximum subscribers, 0 = unlimited
    pub client_limit: usize,
    /// Default re-insertion policy for negative acknowledgements
    pub put_back: PutBack,
    /// Delay before a put-back re-inserts
    pub put_back_delay: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            acknowledge: AckMode::None,
            acknowledge_timeout: Duration::from_secs(15),
            message_timeout: None,
            message_limit: 0,
            client_limit: 0,
            put_back: PutBack::End,
            put_back_delay: Duration::ZERO,
        }
    }
}

/// Observable queue events
#[derive(Debug, Clone)]
pub enum QueueEvent {
    MessageConsumed {
        message_id: String,
        client_id: String,
    },
    MessageTimedOut {
        message_id: String,
    },
    AcknowledgeTimedOut {
        message_id: String,
        client_id: String,
    },
    StatusChanged {
        status: QueueStatus,
    },
}

/// Errors surfaced by subscription management
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    ClientLimitExceeded,
    Stopped,
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::ClientLimitExceeded => write!(f, "client limit exceeded"),
            QueueError::Stopped => write!(f, "queue is stopped"),
        }
    }
}

impl std::error::Error for QueueError {}

/// Tick for the delivery and timeout sweeps
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

pub struct Queue {
    name: Arc<str>,
    options: QueueOptions,
    queue_type: RwLock<QueueType>,
    status: RwLock<QueueStatus>,
    state: RwLock<Arc<dyn QueueState>>,
    store: Arc<dyn MessageStore>,
    tracker: Arc<DeliveryTracker>,
    handler: Arc<dyn DeliveryHandler>,
    /// Snapshot array rebuilt on subscribe/unsubscribe, read without
    /// locking during dispatch
    clients: RwLock<Vec<Arc<QueueClient>>>,
    events: broadcast::Sender<QueueEvent>,
    /// Exclusive lock serializing cluster sync against regular traffic,
    /// distinct from the per-store locks
    sync_gate: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    keepers: Mutex<Vec<JoinHandle<()>>>,
}

impl Queue {
    pub fn new(
        name: impl Into<Arc<str>>,
        queue_type: QueueType,
        options: QueueOptions,
        store: Arc<dyn MessageStore>,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            name: name.into(),
            options,
            queue_type: RwLock::new(queue_type),
            status: RwLock::new(QueueStatus::Running),
            state: RwLock::new(state_for(queue_type)),
            store,
            tracker: Arc::new(DeliveryTracker::new()),
            handler,
            clients: RwLock::new(Vec::new()),
            events,
            sync_gate: Arc::new(Semaphore::new(1)),
            shutdown,
            keepers: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the two keeper loops: the delivery-tracker sweep and the
    /// message-timeout sweep, each ticking once per second and stopping on
    /// the queue's shutdown signal.
    pub fn start(self: &Arc<Self>) {
        let mut keepers = self.keepers.lock();
        if !keepers.is_empty() {
            return;
        }

        let queue = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        keepers.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = tick.tick() => queue.tracker.sweep(&queue).await,
                    _ = shutdown.changed() => break,
                }
            }
            trace!(queue = %queue.name, "delivery sweep stopped");
        }));

        let queue = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        keepers.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = tick.tick() => timeout::sweep_expired(&queue).await,
                    _ = shutdown.changed() => break,
                }
            }
            trace!(queue = %queue.name, "timeout sweep stopped");
        }));
    }

    /// Stop dispatch and signal the keeper loops to end
    pub fn stop(&self) {
        self.set_status(QueueStatus::Stopped);
        let _ = self.shutdown.send(true);
        info!(queue = %self.name, "queue stopped");
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn queue_type(&self) -> QueueType {
        *self.queue_type.read()
    }

    pub fn status(&self) -> QueueStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: QueueStatus) {
        *self.status.write() = status;
        self.emit(QueueEvent::StatusChanged { status });
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    pub fn tracker(&self) -> &Arc<DeliveryTracker> {
        &self.tracker
    }

    pub fn handler(&self) -> &Arc<dyn DeliveryHandler> {
        &self.handler
    }

    pub fn sync_gate(&self) -> &Arc<Semaphore> {
        &self.sync_gate
    }

    pub fn message_count(&self) -> usize {
        self.store.count()
    }

    /// Point-in-time copy of the subscriber array. Dispatch tolerates
    /// clients disconnecting mid-iteration.
    pub fn client_snapshot(&self) -> Vec<Arc<QueueClient>> {
        self.clients.read().clone()
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// The message currently mid-dispatch, if any
    pub fn processing_message(&self) -> Option<Arc<QueueMessage>> {
        self.current_state().processing_message()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }

    fn current_state(&self) -> Arc<dyn QueueState> {
        self.state.read().clone()
    }

    /// Acknowledge deadline for a new delivery, when acks are tracked
    pub(crate) fn ack_deadline(&self) -> Option<Instant> {
        match self.options.acknowledge {
            AckMode::None => None,
            _ => Some(Instant::now() + self.options.acknowledge_timeout),
        }
    }

    /// Wait out an in-flight sync, or bail on a stopped queue
    async fn gate_dispatch(&self) -> Result<(), PushResult> {
        loop {
            match self.status() {
                QueueStatus::Running => return Ok(()),
                QueueStatus::Stopped => return Err(PushResult::StatusNotSupported),
                QueueStatus::Syncing => {
                    match self.sync_gate.clone().acquire_owned().await {
                        // Sync finished; re-check status
                        Ok(permit) => drop(permit),
                        Err(_) => return Err(PushResult::Error),
                    }
                }
            }
        }
    }

    /// Accept a message from a producer and dispatch per the active state
    pub async fn push(
        self: &Arc<Self>,
        mut message: Message,
        source: Option<Arc<dyn ClientTransport>>,
    ) -> PushResult {
        if let Err(result) = self.gate_dispatch().await {
            return result;
        }
        // Capacity check happens before enqueue; no partial mutation
        if self.options.message_limit > 0 && self.store.count() >= self.options.message_limit {
            return PushResult::LimitExceeded;
        }

        message.ensure_id();
        let deadline = self.options.message_timeout.map(|t| Instant::now() + t);
        let queued = Arc::new(
            QueueMessage::new(message)
                .with_deadline(deadline)
                .with_source(source),
        );

        let state = self.current_state();
        if !state.can_enqueue(self, &queued) {
            return PushResult::StatusNotSupported;
        }
        state.push(self, queued).await
    }

    /// Replay a message from cluster sync or a node push, bypassing the
    /// dispatch states
    pub(crate) fn restore(&self, message: Message) -> Result<(), store::StoreError> {
        let queued = Arc::new(QueueMessage::new(message));
        queued.mark_saved();
        self.store.put(queued)
    }

    /// Replay a mirrored put-back at the front of its list
    pub(crate) fn restore_front(&self, message: Message) -> Result<(), store::StoreError> {
        let queued = Arc::new(QueueMessage::new(message));
        queued.mark_saved();
        self.store.put_front(queued)
    }

    /// Consumer-driven retrieval; meaningful for Pull queues only
    pub async fn pull(
        self: &Arc<Self>,
        client: Arc<QueueClient>,
        request: Message,
    ) -> PullResult {
        if self.gate_dispatch().await.is_err() {
            return PullResult::StatusNotSupported;
        }
        self.current_state().pull(self, client, request).await
    }

    /// Register a consumer; flushes backlog when the state supports it
    pub async fn subscribe(
        self: &Arc<Self>,
        transport: Arc<dyn ClientTransport>,
    ) -> Result<Arc<QueueClient>, QueueError> {
        if self.status() == QueueStatus::Stopped {
            return Err(QueueError::Stopped);
        }
        let client = Arc::new(QueueClient::new(transport));
        {
            let mut clients = self.clients.write();
            if self.options.client_limit > 0 && clients.len() >= self.options.client_limit {
                return Err(QueueError::ClientLimitExceeded);
            }
            clients.push(client.clone());
        }
        debug!(queue = %self.name, client = %client.unique_id(), "client subscribed");
        self.trigger().await;
        Ok(client)
    }

    pub fn unsubscribe(&self, client_id: &str) -> bool {
        let mut clients = self.clients.write();
        let before = clients.len();
        clients.retain(|c| c.unique_id() != client_id);
        before != clients.len()
    }

    /// Transport-level disconnect; pending deliveries are reclaimed by the
    /// next sweep
    pub fn client_disconnected(&self, client_id: &str) {
        if self.unsubscribe(client_id) {
            debug!(queue = %self.name, client = %client_id, "client disconnected");
        }
    }

    /// Flush stored backlog through the active state
    pub async fn trigger(self: &Arc<Self>) {
        let state = self.current_state();
        if !state.trigger_supported() {
            return;
        }
        while self.status() == QueueStatus::Running {
            if !self.client_snapshot().iter().any(|c| c.is_connected()) {
                break;
            }
            let Some(message) = self.store.get_next(true, false) else {
                break;
            };
            self.handler.message_dequeued(self, &message).await;
            if state.push(self, message).await != PushResult::Success {
                break;
            }
        }
    }

    /// Swap the dispatch policy. Returns false when either state denies the
    /// transition.
    pub async fn set_queue_type(self: &Arc<Self>, queue_type: QueueType) -> bool {
        let current = self.queue_type();
        if current == queue_type {
            return true;
        }
        if self.current_state().leave(queue_type) == StateAction::Deny {
            return false;
        }
        let next = state_for(queue_type);
        let action = next.enter(current);
        if action == StateAction::Deny {
            return false;
        }
        *self.queue_type.write() = queue_type;
        *self.state.write() = next;
        info!(queue = %self.name, ?queue_type, "queue type changed");
        if action == StateAction::AllowAndTrigger {
            self.trigger().await;
        }
        true
    }

    /// Resolve a consumer's acknowledgement against the tracker. A negative
    /// acknowledgement re-inserts per the queue's put-back policy.
    pub async fn acknowledge(
        self: &Arc<Self>,
        client_id: &str,
        message_id: &str,
        success: bool,
    ) -> bool {
        let Some(delivery) = self.tracker.find_and_remove_delivery(client_id, message_id) else {
            return false;
        };
        delivery.settle(Acknowledge::Received);
        delivery.receiver().release_processing();
        delivery.message().remove_receiver(client_id);

        if success {
            self.send_producer_ack(delivery.message(), true, None).await;
        } else {
            let decision = Decision::put_back(self.options.put_back);
            self.apply_decision(decision, delivery.message()).await;
            self.send_producer_ack(delivery.message(), false, Some("negative acknowledge"))
                .await;
        }
        true
    }

    /// Apply a hook decision to a message: persist, acknowledge the
    /// producer, re-insert. Returns whether the message remains allowed to
    /// continue its pipeline.
    pub async fn apply_decision(
        self: &Arc<Self>,
        decision: Decision,
        message: &Arc<QueueMessage>,
    ) -> bool {
        message.set_decision(decision);

        if decision.save {
            message.mark_saved();
        }
        if decision.acknowledge {
            self.send_producer_ack(message, true, None).await;
        }
        if decision.put_back != PutBack::No && !message.is_in_queue() {
            if self.options.put_back_delay.is_zero() {
                self.put_back_now(decision.put_back, message);
            } else {
                let queue = self.clone();
                let message = message.clone();
                let delay = self.options.put_back_delay;
                let put_back = decision.put_back;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    queue.put_back_now(put_back, &message);
                });
            }
        }
        decision.allow
    }

    fn put_back_now(&self, put_back: PutBack, message: &Arc<QueueMessage>) {
        let result = match put_back {
            PutBack::No => Ok(()),
            PutBack::Start => self.store.put_front(message.clone()),
            PutBack::End => self.store.put(message.clone()),
        };
        if let Err(e) = result {
            debug!(queue = %self.name, message = %message.id(), error = %e, "put back skipped");
        }
    }

    /// Send an acknowledgement response to the producer, once
    async fn send_producer_ack(
        &self,
        message: &Arc<QueueMessage>,
        success: bool,
        reason: Option<&str>,
    ) {
        if !message.message.wait_response {
            return;
        }
        let Some(source) = message.source() else {
            return;
        };
        if success && !message.mark_producer_acked() {
            return;
        }
        let mut response = message.message.new_response(Bytes::new());
        response.target = self.name.to_string();
        if let Some(reason) = reason {
            response.add_header(headers::NEGATIVE_REASON, reason);
        }
        match response.to_bytes() {
            Ok(bytes) => {
                if let Err(e) = source.send(bytes).await {
                    trace!(queue = %self.name, error = %e, "producer ack send failed");
                }
            }
            Err(e) => debug!(queue = %self.name, error = %e, "producer ack serialize failed"),
        }
    }

    /// Wipe stored messages
    pub fn clear(&self, mode: ClearMode) {
        self.store.clear(mode);
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("type", &self.queue_type())
            .field("status", &self.status())
            .field("messages", &self.message_count())
            .field("clients", &self.client_count())
            .finish()
    }
}
