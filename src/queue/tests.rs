use std::sync::Arc;

use bytes::Bytes;
use pretty_assertions::assert_eq;

use crate::client::ChannelTransport;
use crate::hooks::DefaultDeliveryHandler;
use crate::protocol::{headers, Message};

use super::state::{PullResult, PushResult};
use super::store::LinkedStore;
use super::*;

fn test_queue(queue_type: QueueType, options: QueueOptions) -> Arc<Queue> {
    Queue::new(
        "test",
        queue_type,
        options,
        Arc::new(LinkedStore::new()),
        Arc::new(DefaultDeliveryHandler),
    )
}

fn payload(content: &str) -> Message {
    Message::new("test", content.as_bytes().to_vec())
}

#[tokio::test]
async fn test_push_to_stopped_queue_rejected() {
    let queue = test_queue(QueueType::Push, QueueOptions::default());
    queue.set_status(QueueStatus::Stopped);

    let result = queue.push(payload("x"), None).await;
    assert_eq!(result, PushResult::StatusNotSupported);
    assert_eq!(queue.message_count(), 0);
}

#[tokio::test]
async fn test_push_without_consumers_stores_message() {
    let queue = test_queue(QueueType::Push, QueueOptions::default());

    let result = queue.push(payload("x"), None).await;
    assert_eq!(result, PushResult::NoConsumers);
    assert_eq!(queue.message_count(), 1);
}

#[tokio::test]
async fn test_push_with_only_disconnected_subscribers_stores_message() {
    let queue = test_queue(QueueType::Push, QueueOptions::default());
    let (transport, _rx) = ChannelTransport::pair("gone");
    queue.subscribe(transport.clone()).await.unwrap();
    transport.disconnect();

    // A subscriber list with no live connection parks the message the same
    // way an empty one does
    let result = queue.push(payload("x"), None).await;
    assert_eq!(result, PushResult::NoConsumers);
    assert_eq!(queue.message_count(), 1);
}

#[tokio::test]
async fn test_round_robin_without_consumers_stores_message() {
    let queue = test_queue(QueueType::RoundRobin, QueueOptions::default());

    let result = queue.push(payload("x"), None).await;
    assert_eq!(result, PushResult::NoConsumers);
    assert_eq!(queue.message_count(), 1);
}

#[tokio::test]
async fn test_message_limit_enforced() {
    let options = QueueOptions {
        message_limit: 1,
        ..QueueOptions::default()
    };
    let queue = test_queue(QueueType::Pull, options);

    assert_eq!(queue.push(payload("a"), None).await, PushResult::Success);
    assert_eq!(
        queue.push(payload("b"), None).await,
        PushResult::LimitExceeded
    );
    assert_eq!(queue.message_count(), 1);
}

#[tokio::test]
async fn test_client_limit_enforced() {
    let options = QueueOptions {
        client_limit: 1,
        ..QueueOptions::default()
    };
    let queue = test_queue(QueueType::Push, options);

    let (first, _rx1) = ChannelTransport::pair("c1");
    let (second, _rx2) = ChannelTransport::pair("c2");
    assert!(queue.subscribe(first).await.is_ok());
    assert_eq!(
        queue.subscribe(second).await.unwrap_err(),
        QueueError::ClientLimitExceeded
    );
}

#[tokio::test]
async fn test_pull_with_invalid_count_does_not_mutate() {
    let queue = test_queue(QueueType::Pull, QueueOptions::default());
    queue.push(payload("x"), None).await;

    let (transport, mut rx) = ChannelTransport::pair("consumer");
    let client = queue.subscribe(transport).await.unwrap();

    let mut request = payload("");
    request.add_header(headers::COUNT, "0");
    let result = queue.pull(client, request).await;

    assert_eq!(result, PullResult::Unacceptable);
    assert_eq!(queue.message_count(), 1);

    let response = Message::from_bytes(&rx.recv().await.unwrap()).unwrap();
    assert_eq!(
        response.header(headers::STATUS),
        Some(headers::STATUS_UNACCEPTABLE)
    );
}

#[tokio::test]
async fn test_pull_from_empty_store() {
    let queue = test_queue(QueueType::Pull, QueueOptions::default());
    let (transport, mut rx) = ChannelTransport::pair("consumer");
    let client = queue.subscribe(transport).await.unwrap();

    let mut request = payload("");
    request.add_header(headers::COUNT, "1");
    let result = queue.pull(client, request).await;

    assert_eq!(result, PullResult::Empty);
    assert!(!queue.tracker().has_pending());

    let response = Message::from_bytes(&rx.recv().await.unwrap()).unwrap();
    assert_eq!(response.header(headers::STATUS), Some(headers::STATUS_EMPTY));
}

#[tokio::test]
async fn test_pull_queue_retains_unpulled_messages() {
    let queue = test_queue(QueueType::Pull, QueueOptions::default());
    queue.push(payload("a"), None).await;
    queue.push(payload("b"), None).await;
    assert_eq!(queue.message_count(), 2);

    // Subscribing without pulling leaves the backlog untouched
    let (transport, _rx) = ChannelTransport::pair("consumer");
    let _client = queue.subscribe(transport).await.unwrap();
    assert_eq!(queue.message_count(), 2);
}

#[tokio::test]
async fn test_acknowledge_resolves_tracked_delivery() {
    let options = QueueOptions {
        acknowledge: AckMode::Request,
        ..QueueOptions::default()
    };
    let queue = test_queue(QueueType::Push, options);
    let (transport, mut rx) = ChannelTransport::pair("consumer");
    queue.subscribe(transport).await.unwrap();

    assert_eq!(queue.push(payload("x"), None).await, PushResult::Success);
    let delivered = Message::from_bytes(&rx.recv().await.unwrap()).unwrap();
    assert!(queue.tracker().has_pending());

    assert!(queue.acknowledge("consumer", &delivered.id, true).await);
    assert!(!queue.tracker().has_pending());
    // Unknown delivery is reported as such
    assert!(!queue.acknowledge("consumer", &delivered.id, true).await);
}

#[tokio::test]
async fn test_redelivery_while_delivery_live_keeps_tracking_consistent() {
    let options = QueueOptions {
        acknowledge: AckMode::Request,
        ..QueueOptions::default()
    };
    let queue = test_queue(QueueType::Push, options);
    let (transport, mut rx) = ChannelTransport::pair("consumer");
    queue.subscribe(transport).await.unwrap();

    queue.push(payload("x"), None).await;
    let delivered = Message::from_bytes(&rx.recv().await.unwrap()).unwrap();
    let delivery = queue
        .tracker()
        .find_delivery("consumer", &delivered.id)
        .unwrap();
    assert_eq!(delivery.message().receivers().len(), 1);

    // Re-insert the same message while its first delivery is still
    // unacknowledged, then let the state run another pass over it
    queue.store().put(delivery.message().clone()).unwrap();
    queue.trigger().await;

    let redelivered = Message::from_bytes(&rx.recv().await.unwrap()).unwrap();
    assert_eq!(redelivered.id, delivered.id);
    // The tracker refuses the duplicate, so no receiver is recorded for
    // the second pass and no second delivery record appears
    assert_eq!(queue.tracker().snapshot().len(), 1);
    assert!(delivery.message().receivers().is_empty());
}

#[tokio::test]
async fn test_negative_acknowledge_puts_back() {
    let options = QueueOptions {
        acknowledge: AckMode::Request,
        ..QueueOptions::default()
    };
    let queue = test_queue(QueueType::Push, options);
    let (transport, mut rx) = ChannelTransport::pair("consumer");
    queue.subscribe(transport).await.unwrap();

    queue.push(payload("x"), None).await;
    let delivered = Message::from_bytes(&rx.recv().await.unwrap()).unwrap();
    assert_eq!(queue.message_count(), 0);

    assert!(queue.acknowledge("consumer", &delivered.id, false).await);
    assert_eq!(queue.message_count(), 1);
}

#[tokio::test]
async fn test_set_queue_type_flushes_backlog() {
    let queue = test_queue(QueueType::Pull, QueueOptions::default());
    queue.push(payload("backlog"), None).await;

    let (transport, mut rx) = ChannelTransport::pair("consumer");
    queue.subscribe(transport).await.unwrap();
    // Pull state does not deliver on subscribe
    assert_eq!(queue.message_count(), 1);

    assert!(queue.set_queue_type(QueueType::Push).await);
    assert_eq!(queue.queue_type(), QueueType::Push);
    assert_eq!(queue.message_count(), 0);

    let delivered = Message::from_bytes(&rx.recv().await.unwrap()).unwrap();
    assert_eq!(delivered.content, Bytes::from_static(b"backlog"));
}

#[tokio::test]
async fn test_subscribe_flushes_push_backlog() {
    let queue = test_queue(QueueType::Push, QueueOptions::default());
    queue.push(payload("early"), None).await;
    assert_eq!(queue.message_count(), 1);

    let (transport, mut rx) = ChannelTransport::pair("late");
    queue.subscribe(transport).await.unwrap();

    assert_eq!(queue.message_count(), 0);
    let delivered = Message::from_bytes(&rx.recv().await.unwrap()).unwrap();
    assert_eq!(delivered.content, Bytes::from_static(b"early"));
}
