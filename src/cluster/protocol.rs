//! Cluster Protocol Messages
//!
//! Defines the binary protocol used for inter-node queue replication.
//! Messages are serialized using bincode for efficiency. Message payload
//! blocks carry concatenated length-prefixed wire messages (see
//! `protocol::write_frame`).

use bincode::{Decode, Encode};

/// Messages exchanged between cluster nodes
#[derive(Debug, Clone, Encode, Decode)]
pub enum NodeMessage {
    /// Main-side manifest: every message id the queue holds, priority list
    /// first
    QueueMessageIdList {
        queue: String,
        priority_ids: Vec<String>,
        regular_ids: Vec<String>,
    },

    /// Replica asks main for the ids it is missing
    QueueMessageRequest { queue: String, ids: Vec<String> },

    /// Main answers a request with a framed message block
    QueueMessageResponse { queue: String, payload: Vec<u8> },

    /// Replica-only messages reported back to main after a sync
    SyncReverseMessages { queue: String, payload: Vec<u8> },

    /// Replica finished receiving; main may unlock
    SyncCompletion { queue: String },

    /// Mirror a producer push to a replica queue
    PushQueueMessage { queue: String, payload: Vec<u8> },

    /// Mirror a put-back to a replica queue
    PutBackQueueMessage {
        queue: String,
        payload: Vec<u8>,
        to_front: bool,
    },

    /// Mirror a message removal
    RemoveQueueMessage { queue: String, message_id: String },

    /// Mirror a store wipe
    ClearQueueMessage { queue: String },

    /// Broadcast a queue status/type change
    QueueStateMessage {
        queue: String,
        queue_type: String,
        running: bool,
    },

    /// Ask a replica to re-pull the queue list after a reconciliation
    QueueListRefresh,
}

impl NodeMessage {
    /// Encode message to bytes using bincode
    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, bincode::config::standard())
    }

    /// Decode message from bytes using bincode
    pub fn decode(data: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        bincode::decode_from_slice(data, bincode::config::standard()).map(|(msg, _)| msg)
    }

    /// Get the message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeMessage::QueueMessageIdList { .. } => "QueueMessageIdList",
            NodeMessage::QueueMessageRequest { .. } => "QueueMessageRequest",
            NodeMessage::QueueMessageResponse { .. } => "QueueMessageResponse",
            NodeMessage::SyncReverseMessages { .. } => "SyncReverseMessages",
            NodeMessage::SyncCompletion { .. } => "SyncCompletion",
            NodeMessage::PushQueueMessage { .. } => "PushQueueMessage",
            NodeMessage::PutBackQueueMessage { .. } => "PutBackQueueMessage",
            NodeMessage::RemoveQueueMessage { .. } => "RemoveQueueMessage",
            NodeMessage::ClearQueueMessage { .. } => "ClearQueueMessage",
            NodeMessage::QueueStateMessage { .. } => "QueueStateMessage",
            NodeMessage::QueueListRefresh => "QueueListRefresh",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_id_list() {
        let msg = NodeMessage::QueueMessageIdList {
            queue: "orders".to_string(),
            priority_ids: vec!["p1".to_string()],
            regular_ids: vec!["r1".to_string(), "r2".to_string()],
        };
        let bytes = msg.encode().unwrap();
        let decoded = NodeMessage::decode(&bytes).unwrap();
        match decoded {
            NodeMessage::QueueMessageIdList {
                queue,
                priority_ids,
                regular_ids,
            } => {
                assert_eq!(queue, "orders");
                assert_eq!(priority_ids, vec!["p1"]);
                assert_eq!(regular_ids, vec!["r1", "r2"]);
            }
            other => panic!("unexpected message: {}", other.type_name()),
        }
    }

    #[test]
    fn test_decode_roundtrip_completion() {
        let msg = NodeMessage::SyncCompletion {
            queue: "orders".to_string(),
        };
        let bytes = msg.encode().unwrap();
        let decoded = NodeMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.type_name(), "SyncCompletion");
    }
}
