use std::sync::Arc;

use pretty_assertions::assert_eq;

use crate::client::ChannelTransport;
use crate::cluster::ChannelNodeLink;
use crate::config::Config;
use crate::protocol::Message;

use super::*;

fn test_broker() -> Arc<Broker> {
    Broker::new(&Config::default())
}

fn payload(target: &str, content: &str) -> Message {
    Message::new(target, content.as_bytes().to_vec())
}

#[tokio::test]
async fn test_create_queue_rejects_duplicate() {
    let broker = test_broker();
    assert!(broker.create_queue("orders", QueueType::Push).is_ok());
    assert!(matches!(
        broker.create_queue("orders", QueueType::Pull),
        Err(BrokerError::QueueAlreadyExists(_))
    ));
}

#[tokio::test]
async fn test_push_creates_queue_on_first_use() {
    let broker = test_broker();
    assert_eq!(broker.queue_count(), 0);

    let result = broker.push(payload("orders", "x"), None).await;
    assert_eq!(result, PushResult::NoConsumers);
    assert_eq!(broker.queue_count(), 1);
    assert_eq!(broker.queue("orders").unwrap().message_count(), 1);
}

#[tokio::test]
async fn test_subscribe_then_push_delivers() {
    let broker = test_broker();
    let (transport, mut rx) = ChannelTransport::pair("consumer");
    broker.subscribe("orders", transport).await.unwrap();

    let result = broker.push(payload("orders", "hello"), None).await;
    assert_eq!(result, PushResult::Success);

    let delivered = Message::from_bytes(&rx.recv().await.unwrap()).unwrap();
    assert_eq!(delivered.content.as_ref(), b"hello");
}

#[tokio::test]
async fn test_acknowledge_unknown_queue() {
    let broker = test_broker();
    assert!(!broker.acknowledge("ghost", "c1", "m1", true).await);
}

#[tokio::test]
async fn test_remove_queue_stops_it() {
    let broker = test_broker();
    let queue = broker.create_queue("orders", QueueType::Push).unwrap();
    assert!(broker.remove_queue("orders"));
    assert_eq!(queue.status(), crate::queue::QueueStatus::Stopped);
    assert!(!broker.remove_queue("orders"));
}

#[tokio::test]
async fn test_client_disconnect_drops_all_subscriptions() {
    let broker = test_broker();
    let (transport, _rx) = ChannelTransport::pair("consumer");
    broker.subscribe("a", transport.clone()).await.unwrap();
    broker.subscribe("b", transport).await.unwrap();

    broker.client_disconnected("consumer");
    assert_eq!(broker.queue("a").unwrap().client_count(), 0);
    assert_eq!(broker.queue("b").unwrap().client_count(), 0);
}

#[tokio::test]
async fn test_mirrored_push_replays_into_queue() {
    let broker = test_broker();
    let (link, _rx) = ChannelNodeLink::pair("node-b");

    let mut message = payload("orders", "mirrored");
    message.ensure_id();
    let mut block = Vec::new();
    write_frame(&mut block, &message).unwrap();

    broker
        .handle_node_message(
            &(link as Arc<dyn NodeLink>),
            NodeMessage::PushQueueMessage {
                queue: "orders".to_string(),
                payload: block,
            },
        )
        .await;

    let queue = broker.queue("orders").unwrap();
    assert_eq!(queue.message_count(), 1);
    let stored = queue.store().get_next(false, false).unwrap();
    assert_eq!(stored.id(), message.id);
    // Replayed copies count as already persisted
    assert!(stored.is_saved());
}

#[tokio::test]
async fn test_mirrored_remove_and_clear() {
    let broker = test_broker();
    let (link, _rx) = ChannelNodeLink::pair("node-b");
    let link: Arc<dyn NodeLink> = link;

    let mut message = payload("orders", "x");
    message.ensure_id();
    let id = message.id.clone();
    broker.push(message, None).await;
    broker.push(payload("orders", "y"), None).await;
    assert_eq!(broker.queue("orders").unwrap().message_count(), 2);

    broker
        .handle_node_message(
            &link,
            NodeMessage::RemoveQueueMessage {
                queue: "orders".to_string(),
                message_id: id,
            },
        )
        .await;
    assert_eq!(broker.queue("orders").unwrap().message_count(), 1);

    broker
        .handle_node_message(
            &link,
            NodeMessage::ClearQueueMessage {
                queue: "orders".to_string(),
            },
        )
        .await;
    assert_eq!(broker.queue("orders").unwrap().message_count(), 0);
}
