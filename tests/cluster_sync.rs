//! Cluster Sync Integration Tests
//!
//! Drives a full main/replica reconciliation exchange over in-process node
//! links, shuttling each protocol message by hand so every phase transition
//! is observable.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use relaymq::cluster::{ChannelNodeLink, NodeMessage, QueueSync, SyncError, SyncPhase};
use relaymq::hooks::DefaultDeliveryHandler;
use relaymq::protocol::Message;
use relaymq::queue::state::PushResult;
use relaymq::queue::store::LinkedStore;
use relaymq::queue::{Queue, QueueOptions, QueueStatus, QueueType};

fn build_queue(name: &str) -> Arc<Queue> {
    Queue::new(
        name,
        QueueType::Pull,
        QueueOptions::default(),
        Arc::new(LinkedStore::new()),
        Arc::new(DefaultDeliveryHandler),
    )
}

async fn seed(queue: &Arc<Queue>, id: &str) {
    let mut message = Message::new(queue.name(), id.as_bytes().to_vec());
    message.id = id.to_string();
    assert_eq!(queue.push(message, None).await, PushResult::Success);
}

fn stored_ids(queue: &Arc<Queue>) -> Vec<String> {
    let mut ids: Vec<String> = queue
        .store()
        .snapshot()
        .iter()
        .map(|m| m.id().to_string())
        .collect();
    ids.sort();
    ids
}

async fn next_node_message(rx: &mut mpsc::UnboundedReceiver<NodeMessage>) -> NodeMessage {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for node message")
        .expect("link closed")
}

/// Main {A, B, C} against replica {B, D}: the replica requests A and C,
/// reports D back, and both sides end Running with the lock released
#[tokio::test(flavor = "multi_thread")]
async fn test_full_sync_exchange() {
    let main_queue = build_queue("orders");
    seed(&main_queue, "A").await;
    seed(&main_queue, "B").await;
    seed(&main_queue, "C").await;

    let replica_queue = build_queue("orders");
    seed(&replica_queue, "B").await;
    seed(&replica_queue, "D").await;

    let (to_replica, mut replica_inbox) = ChannelNodeLink::pair("replica");
    let (to_main, mut main_inbox) = ChannelNodeLink::pair("main");

    let main_sync = QueueSync::new(main_queue.clone(), to_replica);
    let replica_sync = QueueSync::new(replica_queue.clone(), to_main);

    main_sync.begin_sharing().await.unwrap();
    assert_eq!(main_sync.phase(), SyncPhase::Sharing);
    assert_eq!(main_queue.status(), QueueStatus::Syncing);

    // Manifest reaches the replica; it should only request A and C
    let manifest = next_node_message(&mut replica_inbox).await;
    assert!(matches!(manifest, NodeMessage::QueueMessageIdList { .. }));
    replica_sync.handle(manifest).await.unwrap();
    assert_eq!(replica_sync.phase(), SyncPhase::Receiving);
    assert_eq!(replica_queue.status(), QueueStatus::Syncing);

    let request = next_node_message(&mut main_inbox).await;
    match &request {
        NodeMessage::QueueMessageRequest { ids, .. } => {
            let mut ids = ids.clone();
            ids.sort();
            assert_eq!(ids, vec!["A".to_string(), "C".to_string()]);
        }
        other => panic!("expected request, got {}", other.type_name()),
    }
    main_sync.handle(request).await.unwrap();

    // Message payload flows back; the replica finishes and reports D
    let response = next_node_message(&mut replica_inbox).await;
    assert!(matches!(response, NodeMessage::QueueMessageResponse { .. }));
    replica_sync.handle(response).await.unwrap();
    assert_eq!(replica_sync.phase(), SyncPhase::None);
    assert_eq!(replica_queue.status(), QueueStatus::Running);

    let reverse = next_node_message(&mut main_inbox).await;
    assert!(matches!(reverse, NodeMessage::SyncReverseMessages { .. }));
    main_sync.handle(reverse).await.unwrap();

    let completion = next_node_message(&mut main_inbox).await;
    assert!(matches!(completion, NodeMessage::SyncCompletion { .. }));
    main_sync.handle(completion).await.unwrap();
    assert_eq!(main_sync.phase(), SyncPhase::None);
    assert_eq!(main_queue.status(), QueueStatus::Running);

    assert_eq!(stored_ids(&replica_queue), vec!["A", "B", "C", "D"]);
    assert_eq!(stored_ids(&main_queue), vec!["A", "B", "C", "D"]);

    // The queue lock is released on both sides
    assert!(main_queue.sync_gate().try_acquire().is_ok());
    assert!(replica_queue.sync_gate().try_acquire().is_ok());
}

/// A second share attempt while the lock is held fails closed
#[tokio::test]
async fn test_begin_sharing_fails_when_locked() {
    let queue = build_queue("orders");
    let (link, _inbox) = ChannelNodeLink::pair("replica");
    let sync = QueueSync::new(queue.clone(), link.clone());

    sync.begin_sharing().await.unwrap();

    let second = QueueSync::new(queue, link);
    match second.begin_sharing().await {
        Err(SyncError::LockUnavailable) => {}
        other => panic!("expected LockUnavailable, got {:?}", other),
    }
}

/// A producer push issued mid-sync waits on the queue lock and completes
/// once the exchange ends
#[tokio::test(flavor = "multi_thread")]
async fn test_push_waits_for_sync_to_finish() {
    let queue = build_queue("orders");
    let (link, mut inbox) = ChannelNodeLink::pair("replica");
    let sync = QueueSync::new(queue.clone(), link);

    sync.begin_sharing().await.unwrap();
    let _manifest = next_node_message(&mut inbox).await;
    assert_eq!(queue.status(), QueueStatus::Syncing);

    let push_queue = queue.clone();
    let push = tokio::spawn(async move {
        push_queue
            .push(Message::new("orders", "held".as_bytes().to_vec()), None)
            .await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!push.is_finished());

    sync.end_sharing().await;
    assert_eq!(queue.status(), QueueStatus::Running);

    let result = timeout(Duration::from_secs(2), push)
        .await
        .expect("push did not resume after sync")
        .unwrap();
    assert_eq!(result, PushResult::Success);
    assert_eq!(queue.message_count(), 1);
}

/// A replica already holding everything finishes immediately without a
/// request round-trip
#[tokio::test]
async fn test_replica_with_full_contents_skips_request() {
    let replica_queue = build_queue("orders");
    seed(&replica_queue, "A").await;
    seed(&replica_queue, "B").await;

    let (to_main, mut main_inbox) = ChannelNodeLink::pair("main");
    let replica_sync = QueueSync::new(replica_queue.clone(), to_main);

    replica_sync
        .process_id_list(Vec::new(), vec!["A".to_string(), "B".to_string()])
        .await
        .unwrap();

    assert_eq!(replica_sync.phase(), SyncPhase::None);
    assert_eq!(replica_queue.status(), QueueStatus::Running);
    assert_eq!(stored_ids(&replica_queue), vec!["A", "B"]);

    // No request went out; the first message is the completion notice
    let first = next_node_message(&mut main_inbox).await;
    assert!(matches!(first, NodeMessage::SyncCompletion { .. }));
}
