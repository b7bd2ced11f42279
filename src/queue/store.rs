//! Message Store
//!
//! Holds queued messages in two ordered collections, high-priority and
//! regular, with FIFO/LIFO retrieval from either end. Priority messages are
//! always dequeued before regular messages, independent of the FIFO/LIFO
//! choice.
//!
//! Two backings are provided:
//! - `LinkedStore`: deque-based, O(1) head/tail operations, O(n) predicate
//!   search. Identity checks beyond the in-queue guard are the caller's.
//! - `KeyedStore`: id-keyed, O(1) lookup by id, rejects duplicate ids.
//!   Iteration order is unspecified; use it only when the dispatch policy
//!   does not need strict FIFO.
//!
//! No operation holds a lock across an await point; locks are scoped to the
//! synchronous in-memory mutation.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use super::message::QueueMessage;

/// Store-level errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A distinct message instance with the same id is already present
    DuplicateMessageId(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DuplicateMessageId(id) => write!(f, "duplicate message id: {}", id),
        }
    }
}

impl std::error::Error for StoreError {}

/// Which sub-collection a clear applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearMode {
    All,
    Priority,
    Regular,
}

/// Common contract for queue message stores
pub trait MessageStore: Send + Sync {
    /// Insert at the tail of the matching sub-collection. A message already
    /// linked into a store is a no-op (idempotent double-put guard).
    fn put(&self, message: Arc<QueueMessage>) -> Result<(), StoreError>;

    /// Insert at the priority re-entry location (head) of the matching
    /// sub-collection
    fn put_front(&self, message: Arc<QueueMessage>) -> Result<(), StoreError>;

    /// Head (or tail, if `from_end`) of the priority collection if
    /// non-empty, else of the regular collection
    fn get_next(&self, remove: bool, from_end: bool) -> Option<Arc<QueueMessage>>;

    fn get_priority_next(&self, remove: bool, from_end: bool) -> Option<Arc<QueueMessage>>;

    fn get_regular_next(&self, remove: bool, from_end: bool) -> Option<Arc<QueueMessage>>;

    /// First match, scanning regular then priority
    fn find_and_remove(
        &self,
        predicate: &dyn Fn(&QueueMessage) -> bool,
    ) -> Option<Arc<QueueMessage>>;

    /// Non-removing scan across both collections
    fn find_all(&self, predicate: &dyn Fn(&QueueMessage) -> bool) -> Vec<Arc<QueueMessage>>;

    /// Remove by identity from whichever sub-collection the message's
    /// priority flag indicates
    fn remove(&self, message: &Arc<QueueMessage>) -> bool;

    fn count(&self) -> usize {
        self.count_priority() + self.count_regular()
    }

    fn count_priority(&self) -> usize;

    fn count_regular(&self) -> usize;

    fn clear(&self, mode: ClearMode);

    /// Point-in-time copy of current contents for diagnostics and sync.
    /// Readers must tolerate concurrent mutation; this does not block
    /// writers beyond the copy itself.
    fn snapshot(&self) -> Vec<Arc<QueueMessage>>;
}

fn take_next(
    bucket: &Mutex<VecDeque<Arc<QueueMessage>>>,
    remove: bool,
    from_end: bool,
) -> Option<Arc<QueueMessage>> {
    let mut items = bucket.lock();
    let msg = if remove {
        let taken = if from_end {
            items.pop_back()
        } else {
            items.pop_front()
        };
        if let Some(ref m) = taken {
            m.mark_dequeued();
        }
        taken
    } else if from_end {
        items.back().cloned()
    } else {
        items.front().cloned()
    };
    msg
}

/// Deque-backed store with strict insertion order
pub struct LinkedStore {
    priority: Mutex<VecDeque<Arc<QueueMessage>>>,
    regular: Mutex<VecDeque<Arc<QueueMessage>>>,
}

impl LinkedStore {
    pub fn new() -> Self {
        Self {
            priority: Mutex::new(VecDeque::new()),
            regular: Mutex::new(VecDeque::new()),
        }
    }

    fn bucket_for(&self, message: &QueueMessage) -> &Mutex<VecDeque<Arc<QueueMessage>>> {
        if message.message.high_priority {
            &self.priority
        } else {
            &self.regular
        }
    }

    fn insert(&self, message: Arc<QueueMessage>, front: bool) -> Result<(), StoreError> {
        let bucket = self.bucket_for(&message);
        let mut items = bucket.lock();
        if !message.mark_queued() {
            return Ok(());
        }
        if front {
            items.push_front(message);
        } else {
            items.push_back(message);
        }
        Ok(())
    }
}

impl Default for LinkedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore for LinkedStore {
    fn put(&self, message: Arc<QueueMessage>) -> Result<(), StoreError> {
        self.insert(message, false)
    }

    fn put_front(&self, message: Arc<QueueMessage>) -> Result<(), StoreError> {
        self.insert(message, true)
    }

    fn get_next(&self, remove: bool, from_end: bool) -> Option<Arc<QueueMessage>> {
        take_next(&self.priority, remove, from_end)
            .or_else(|| take_next(&self.regular, remove, from_end))
    }

    fn get_priority_next(&self, remove: bool, from_end: bool) -> Option<Arc<QueueMessage>> {
        take_next(&self.priority, remove, from_end)
    }

    fn get_regular_next(&self, remove: bool, from_end: bool) -> Option<Arc<QueueMessage>> {
        take_next(&self.regular, remove, from_end)
    }

    fn find_and_remove(
        &self,
        predicate: &dyn Fn(&QueueMessage) -> bool,
    ) -> Option<Arc<QueueMessage>> {
        // Consistent scan order: regular first, then priority
        for bucket in [&self.regular, &self.priority] {
            let mut items = bucket.lock();
            if let Some(pos) = items.iter().position(|m| predicate(m)) {
                let msg = items.remove(pos);
                if let Some(ref m) = msg {
                    m.mark_dequeued();
                }
                return msg;
            }
        }
        None
    }

    fn find_all(&self, predicate: &dyn Fn(&QueueMessage) -> bool) -> Vec<Arc<QueueMessage>> {
        let mut found: Vec<Arc<QueueMessage>> = Vec::new();
        for bucket in [&self.regular, &self.priority] {
            let items = bucket.lock();
            found.extend(items.iter().filter(|m| predicate(m)).cloned());
        }
        found
    }

    fn remove(&self, message: &Arc<QueueMessage>) -> bool {
        let bucket = self.bucket_for(message);
        let mut items = bucket.lock();
        if let Some(pos) = items.iter().position(|m| Arc::ptr_eq(m, message)) {
            items.remove(pos);
            message.mark_dequeued();
            true
        } else {
            false
        }
    }

    fn count_priority(&self) -> usize {
        self.priority.lock().len()
    }

    fn count_regular(&self) -> usize {
        self.regular.lock().len()
    }

    fn clear(&self, mode: ClearMode) {
        if matches!(mode, ClearMode::All | ClearMode::Priority) {
            for msg in self.priority.lock().drain(..) {
                msg.mark_dequeued();
            }
        }
        if matches!(mode, ClearMode::All | ClearMode::Regular) {
            for msg in self.regular.lock().drain(..) {
                msg.mark_dequeued();
            }
        }
    }

    fn snapshot(&self) -> Vec<Arc<QueueMessage>> {
        let mut all: Vec<Arc<QueueMessage>> = self.priority.lock().iter().cloned().collect();
        all.extend(self.regular.lock().iter().cloned());
        all
    }
}

/// Id-keyed bucket preserving insertion order for head/tail retrieval
#[derive(Default)]
struct KeyedBucket {
    by_id: HashMap<String, Arc<QueueMessage>>,
    order: VecDeque<String>,
}

impl KeyedBucket {
    fn take(&mut self, remove: bool, from_end: bool) -> Option<Arc<QueueMessage>> {
        let id = if from_end {
            self.order.back()
        } else {
            self.order.front()
        }?
        .clone();
        if remove {
            if from_end {
                self.order.pop_back();
            } else {
                self.order.pop_front();
            }
            let msg = self.by_id.remove(&id)?;
            msg.mark_dequeued();
            Some(msg)
        } else {
            self.by_id.get(&id).cloned()
        }
    }

    fn remove_id(&mut self, id: &str) -> Option<Arc<QueueMessage>> {
        let msg = self.by_id.remove(id)?;
        self.order.retain(|entry| entry != id);
        msg.mark_dequeued();
        Some(msg)
    }
}

/// Id-keyed store rejecting duplicate message ids
pub struct KeyedStore {
    priority: Mutex<KeyedBucket>,
    regular: Mutex<KeyedBucket>,
}

impl KeyedStore {
    pub fn new() -> Self {
        Self {
            priority: Mutex::new(KeyedBucket::default()),
            regular: Mutex::new(KeyedBucket::default()),
        }
    }

    fn bucket_for(&self, message: &QueueMessage) -> &Mutex<KeyedBucket> {
        if message.message.high_priority {
            &self.priority
        } else {
            &self.regular
        }
    }

    /// O(1) lookup by id across both sub-collections
    pub fn find_by_id(&self, id: &str) -> Option<Arc<QueueMessage>> {
        self.priority
            .lock()
            .by_id
            .get(id)
            .cloned()
            .or_else(|| self.regular.lock().by_id.get(id).cloned())
    }

    fn insert(&self, message: Arc<QueueMessage>, front: bool) -> Result<(), StoreError> {
        let bucket = self.bucket_for(&message);
        let mut items = bucket.lock();
        if let Some(existing) = items.by_id.get(message.id()) {
            if Arc::ptr_eq(existing, &message) {
                return Ok(());
            }
            return Err(StoreError::DuplicateMessageId(message.id().to_string()));
        }
        if !message.mark_queued() {
            return Ok(());
        }
        let id = message.id().to_string();
        if front {
            items.order.push_front(id.clone());
        } else {
            items.order.push_back(id.clone());
        }
        items.by_id.insert(id, message);
        Ok(())
    }
}

impl Default for KeyedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore for KeyedStore {
    fn put(&self, message: Arc<QueueMessage>) -> Result<(), StoreError> {
        self.insert(message, false)
    }

    fn put_front(&self, message: Arc<QueueMessage>) -> Result<(), StoreError> {
        self.insert(message, true)
    }

    fn get_next(&self, remove: bool, from_end: bool) -> Option<Arc<QueueMessage>> {
        let taken = self.priority.lock().take(remove, from_end);
        taken.or_else(|| self.regular.lock().take(remove, from_end))
    }

    fn get_priority_next(&self, remove: bool, from_end: bool) -> Option<Arc<QueueMessage>> {
        self.priority.lock().take(remove, from_end)
    }

    fn get_regular_next(&self, remove: bool, from_end: bool) -> Option<Arc<QueueMessage>> {
        self.regular.lock().take(remove, from_end)
    }

    fn find_and_remove(
        &self,
        predicate: &dyn Fn(&QueueMessage) -> bool,
    ) -> Option<Arc<QueueMessage>> {
        for bucket in [&self.regular, &self.priority] {
            let mut items = bucket.lock();
            let id = items
                .by_id
                .values()
                .find(|m| predicate(m))
                .map(|m| m.id().to_string());
            if let Some(id) = id {
                return items.remove_id(&id);
            }
        }
        None
    }

    fn find_all(&self, predicate: &dyn Fn(&QueueMessage) -> bool) -> Vec<Arc<QueueMessage>> {
        let mut found: Vec<Arc<QueueMessage>> = Vec::new();
        for bucket in [&self.regular, &self.priority] {
            let items = bucket.lock();
            found.extend(items.by_id.values().filter(|m| predicate(m)).cloned());
        }
        found
    }

    fn remove(&self, message: &Arc<QueueMessage>) -> bool {
        let bucket = self.bucket_for(message);
        let mut items = bucket.lock();
        match items.by_id.get(message.id()) {
            Some(existing) if Arc::ptr_eq(existing, message) => {
                items.remove_id(&message.id().to_string()).is_some()
            }
            _ => false,
        }
    }

    fn count_priority(&self) -> usize {
        self.priority.lock().by_id.len()
    }

    fn count_regular(&self) -> usize {
        self.regular.lock().by_id.len()
    }

    fn clear(&self, mode: ClearMode) {
        if matches!(mode, ClearMode::All | ClearMode::Priority) {
            let mut items = self.priority.lock();
            for msg in items.by_id.values() {
                msg.mark_dequeued();
            }
            items.by_id.clear();
            items.order.clear();
        }
        if matches!(mode, ClearMode::All | ClearMode::Regular) {
            let mut items = self.regular.lock();
            for msg in items.by_id.values() {
                msg.mark_dequeued();
            }
            items.by_id.clear();
            items.order.clear();
        }
    }

    fn snapshot(&self) -> Vec<Arc<QueueMessage>> {
        let mut all: Vec<Arc<QueueMessage>> =
            self.priority.lock().by_id.values().cloned().collect();
        all.extend(self.regular.lock().by_id.values().cloned());
        all
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::protocol::Message;

    fn queued(id: &str, priority: bool) -> Arc<QueueMessage> {
        let mut msg = Message::new("q", id.as_bytes().to_vec());
        msg.id = id.to_string();
        msg.high_priority = priority;
        Arc::new(QueueMessage::new(msg))
    }

    #[test]
    fn test_priority_before_regular() {
        let store = LinkedStore::new();
        store.put(queued("r1", false)).unwrap();
        store.put(queued("p1", true)).unwrap();
        store.put(queued("r2", false)).unwrap();

        assert_eq!(store.get_next(true, false).unwrap().id(), "p1");
        assert_eq!(store.get_next(true, false).unwrap().id(), "r1");
        assert_eq!(store.get_next(true, false).unwrap().id(), "r2");
        assert!(store.get_next(true, false).is_none());
    }

    #[test]
    fn test_lifo_retrieval() {
        let store = LinkedStore::new();
        store.put(queued("first", false)).unwrap();
        store.put(queued("second", false)).unwrap();

        assert_eq!(store.get_next(true, true).unwrap().id(), "second");
        assert_eq!(store.get_next(true, false).unwrap().id(), "first");
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn test_double_put_is_noop() {
        let store = LinkedStore::new();
        let msg = queued("a", false);
        store.put(msg.clone()).unwrap();
        store.put(msg.clone()).unwrap();
        assert_eq!(store.count(), 1);
        assert!(msg.is_in_queue());
    }

    #[test]
    fn test_peek_does_not_unlink() {
        let store = LinkedStore::new();
        let msg = queued("a", false);
        store.put(msg.clone()).unwrap();
        let peeked = store.get_next(false, false).unwrap();
        assert!(peeked.is_in_queue());
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_remove_clears_in_queue_flag() {
        let store = LinkedStore::new();
        let msg = queued("a", true);
        store.put(msg.clone()).unwrap();
        assert!(store.remove(&msg));
        assert!(!msg.is_in_queue());
        assert!(!store.remove(&msg));
    }

    #[test]
    fn test_find_and_remove_regular_first() {
        let store = LinkedStore::new();
        store.put(queued("p", true)).unwrap();
        store.put(queued("r", false)).unwrap();

        let found = store.find_and_remove(&|_| true).unwrap();
        assert_eq!(found.id(), "r");
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_put_front_reenters_at_head() {
        let store = LinkedStore::new();
        store.put(queued("a", false)).unwrap();
        store.put_front(queued("b", false)).unwrap();
        assert_eq!(store.get_next(true, false).unwrap().id(), "b");
    }

    #[test]
    fn test_keyed_duplicate_id_rejected() {
        let store = KeyedStore::new();
        store.put(queued("same", false)).unwrap();
        let err = store.put(queued("same", false)).unwrap_err();
        assert_eq!(err, StoreError::DuplicateMessageId("same".to_string()));
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_keyed_find_by_id() {
        let store = KeyedStore::new();
        store.put(queued("p", true)).unwrap();
        store.put(queued("r", false)).unwrap();
        assert_eq!(store.find_by_id("p").unwrap().id(), "p");
        assert_eq!(store.find_by_id("r").unwrap().id(), "r");
        assert!(store.find_by_id("missing").is_none());
    }

    #[test]
    fn test_keyed_priority_ordering() {
        let store = KeyedStore::new();
        store.put(queued("r", false)).unwrap();
        store.put(queued("p", true)).unwrap();
        assert_eq!(store.get_next(true, false).unwrap().id(), "p");
        assert_eq!(store.get_next(true, false).unwrap().id(), "r");
    }

    #[test]
    fn test_clear_modes() {
        let store = LinkedStore::new();
        store.put(queued("p", true)).unwrap();
        store.put(queued("r", false)).unwrap();

        store.clear(ClearMode::Priority);
        assert_eq!(store.count_priority(), 0);
        assert_eq!(store.count_regular(), 1);

        store.clear(ClearMode::All);
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn test_snapshot_copies_both_collections() {
        let store = LinkedStore::new();
        store.put(queued("p", true)).unwrap();
        store.put(queued("r", false)).unwrap();
        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 2);
        // Snapshot is a copy; the store is untouched
        assert_eq!(store.count(), 2);
    }
}
