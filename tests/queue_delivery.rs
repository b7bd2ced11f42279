//! Queue Delivery Integration Tests
//!
//! End-to-end delivery behavior across the three dispatch policies:
//! broadcast fan-out, pull ordering, wait-for-acknowledge serialization and
//! timeout-driven reclamation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use relaymq::client::ChannelTransport;
use relaymq::hooks::DefaultDeliveryHandler;
use relaymq::protocol::{headers, Message};
use relaymq::queue::state::{PullResult, PushResult};
use relaymq::queue::store::{KeyedStore, LinkedStore};
use relaymq::queue::{AckMode, Queue, QueueEvent, QueueOptions, QueueType};

fn build_queue(queue_type: QueueType, options: QueueOptions) -> Arc<Queue> {
    Queue::new(
        "orders",
        queue_type,
        options,
        Arc::new(LinkedStore::new()),
        Arc::new(DefaultDeliveryHandler),
    )
}

fn payload(content: &str) -> Message {
    Message::new("orders", content.as_bytes().to_vec())
}

async fn recv_message(rx: &mut mpsc::UnboundedReceiver<bytes::Bytes>) -> Message {
    let bytes = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("channel closed");
    Message::from_bytes(&bytes).unwrap()
}

/// Broadcast: one push, three consumers, three sends, no store growth
#[tokio::test]
async fn test_push_broadcasts_to_all_consumers() {
    let queue = build_queue(QueueType::Push, QueueOptions::default());

    let mut receivers = Vec::new();
    for i in 0..3 {
        let (transport, rx) = ChannelTransport::pair(format!("consumer-{}", i));
        queue.subscribe(transport).await.unwrap();
        receivers.push(rx);
    }

    assert_eq!(queue.push(payload("broadcast"), None).await, PushResult::Success);

    for rx in &mut receivers {
        let delivered = recv_message(rx).await;
        assert_eq!(delivered.content.as_ref(), b"broadcast");
        // No second copy per consumer
        assert!(rx.try_recv().is_err());
    }

    assert_eq!(queue.message_count(), 0);
    assert!(!queue.tracker().has_pending());
}

/// Pull ordering: LIFO returns the newest, FIFO the oldest, then empty
#[tokio::test]
async fn test_pull_order_lifo_then_fifo() {
    let queue = build_queue(QueueType::Pull, QueueOptions::default());
    queue.push(payload("First"), None).await;
    queue.push(payload("Second"), None).await;

    let (transport, mut rx) = ChannelTransport::pair("puller");
    let client = queue.subscribe(transport).await.unwrap();

    let mut request = payload("");
    request.ensure_id();
    request.add_header(headers::COUNT, "1");
    request.add_header(headers::ORDER, headers::ORDER_LIFO);
    assert_eq!(queue.pull(client.clone(), request).await, PullResult::Success(1));

    let item = recv_message(&mut rx).await;
    assert_eq!(item.content.as_ref(), b"Second");
    let end = recv_message(&mut rx).await;
    assert_eq!(end.header(headers::STATUS), Some(headers::STATUS_END));

    let mut request = payload("");
    request.ensure_id();
    request.add_header(headers::COUNT, "1");
    assert_eq!(queue.pull(client.clone(), request).await, PullResult::Success(1));

    let item = recv_message(&mut rx).await;
    assert_eq!(item.content.as_ref(), b"First");
    let end = recv_message(&mut rx).await;
    assert_eq!(end.header(headers::STATUS), Some(headers::STATUS_END));

    assert_eq!(queue.message_count(), 0);

    let mut request = payload("");
    request.add_header(headers::COUNT, "1");
    assert_eq!(queue.pull(client, request).await, PullResult::Empty);
}

/// Wait-for-acknowledge serializes deliveries to one consumer; a consumer
/// acking after ~100ms still drains a 10-message burst in about a second
#[tokio::test(flavor = "multi_thread")]
async fn test_round_robin_wait_ack_serializes() {
    let options = QueueOptions {
        acknowledge: AckMode::WaitForAcknowledge,
        acknowledge_timeout: Duration::from_secs(10),
        ..QueueOptions::default()
    };
    let queue = build_queue(QueueType::RoundRobin, options);

    let (transport, mut rx) = ChannelTransport::pair("slow-consumer");
    queue.subscribe(transport).await.unwrap();

    // Consumer task: receive, wait 100ms, acknowledge
    let ack_queue = queue.clone();
    let consumer = tokio::spawn(async move {
        let mut received = Vec::new();
        while received.len() < 10 {
            let delivered = recv_message(&mut rx).await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(ack_queue.acknowledge("slow-consumer", &delivered.id, true).await);
            received.push(delivered.content.clone());
        }
        received
    });

    for i in 0..10 {
        let result = queue.push(payload(&format!("m{}", i)), None).await;
        assert_eq!(result, PushResult::Success);
    }

    let received = timeout(Duration::from_secs(5), consumer)
        .await
        .expect("consumer did not drain the burst")
        .unwrap();
    assert_eq!(received.len(), 10);
    assert_eq!(queue.message_count(), 0);
    assert!(!queue.tracker().has_pending());
}

/// A consumer that never acknowledges: the sweep reclaims the delivery and
/// the queue's put-back policy re-inserts the message
#[tokio::test(flavor = "multi_thread")]
async fn test_acknowledge_timeout_requeues() {
    let options = QueueOptions {
        acknowledge: AckMode::WaitForAcknowledge,
        acknowledge_timeout: Duration::from_millis(500),
        ..QueueOptions::default()
    };
    let queue = build_queue(QueueType::RoundRobin, options);
    queue.start();
    let mut events = queue.subscribe_events();

    let (transport, mut rx) = ChannelTransport::pair("silent-consumer");
    queue.subscribe(transport).await.unwrap();

    assert_eq!(queue.push(payload("stuck"), None).await, PushResult::Success);
    let delivered = recv_message(&mut rx).await;
    assert_eq!(delivered.content.as_ref(), b"stuck");
    assert!(queue.tracker().has_pending());
    assert_eq!(queue.message_count(), 0);

    // Sweep ticks once per second; deadline is 500ms
    let reclaimed = timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Ok(QueueEvent::AcknowledgeTimedOut { message_id, .. }) => break message_id,
                Ok(_) => continue,
                Err(e) => panic!("event stream closed: {}", e),
            }
        }
    })
    .await
    .expect("no acknowledge timeout within 3s");

    assert_eq!(reclaimed, delivered.id);
    assert!(!queue.tracker().has_pending());
    assert_eq!(queue.message_count(), 1);

    queue.stop();
}

/// Stored messages past their deadline are expired by the timeout sweep
#[tokio::test(flavor = "multi_thread")]
async fn test_message_timeout_expires_stored_messages() {
    let options = QueueOptions {
        message_timeout: Some(Duration::from_millis(200)),
        ..QueueOptions::default()
    };
    let queue = build_queue(QueueType::Pull, options);
    queue.start();
    let mut events = queue.subscribe_events();

    assert_eq!(queue.push(payload("expiring"), None).await, PushResult::Success);
    assert_eq!(queue.message_count(), 1);

    let expired = timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Ok(QueueEvent::MessageTimedOut { message_id }) => break message_id,
                Ok(_) => continue,
                Err(e) => panic!("event stream closed: {}", e),
            }
        }
    })
    .await
    .expect("no message timeout within 3s");

    assert!(!expired.is_empty());
    assert_eq!(queue.message_count(), 0);

    queue.stop();
}

/// A keyed store rejects a second message carrying an id it already holds
#[tokio::test]
async fn test_keyed_store_rejects_duplicate_id() {
    let queue = Queue::new(
        "unique",
        QueueType::Pull,
        QueueOptions::default(),
        Arc::new(KeyedStore::new()),
        Arc::new(DefaultDeliveryHandler),
    );

    let mut first = Message::new("unique", "a".as_bytes().to_vec());
    first.id = "fixed-id".to_string();
    let mut second = Message::new("unique", "b".as_bytes().to_vec());
    second.id = "fixed-id".to_string();

    assert_eq!(queue.push(first, None).await, PushResult::Success);
    assert_eq!(queue.push(second, None).await, PushResult::Error);
    assert_eq!(queue.message_count(), 1);
}
