//! Queue State Machine
//!
//! Exactly one dispatch state is active per queue: Push (broadcast),
//! RoundRobin (one subscriber per message, rotating) or Pull
//! (consumer-driven). The Queue aggregate swaps states, calling `leave` on
//! the old state and `enter` on the new one; `AllowAndTrigger` tells the
//! queue to flush any backlog right after the transition.

use std::sync::Arc;

use async_trait::async_trait;

use crate::client::QueueClient;
use crate::protocol::{headers, Message};
use crate::queue::message::QueueMessage;
use crate::queue::store::ClearMode;
use crate::queue::{Queue, QueueType};

mod pull;
mod push;
mod round_robin;

pub use pull::PullState;
pub use push::PushState;
pub use round_robin::RoundRobinState;

/// Outcome of a state transition hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateAction {
    Allow,
    /// Allow and flush any stored backlog immediately
    AllowAndTrigger,
    Deny,
}

/// Outcome of a push operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResult {
    Success,
    /// No subscriber could take the message; it was stored for later
    NoConsumers,
    LimitExceeded,
    StatusNotSupported,
    Error,
}

/// Outcome of a pull operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullResult {
    /// Number of messages handed to the puller
    Success(usize),
    Empty,
    StatusNotSupported,
    Unacceptable,
}

/// Common contract for queue dispatch states
#[async_trait]
pub trait QueueState: Send + Sync {
    /// The message currently mid-dispatch in this state, for sync and
    /// introspection
    fn processing_message(&self) -> Option<Arc<QueueMessage>>;

    /// Whether this state reacts to an external "send backlog now" trigger
    fn trigger_supported(&self) -> bool;

    /// Pre-check before accepting a message into the store
    fn can_enqueue(&self, _queue: &Queue, _message: &Arc<QueueMessage>) -> bool {
        true
    }

    async fn push(&self, queue: &Arc<Queue>, message: Arc<QueueMessage>) -> PushResult;

    async fn pull(
        &self,
        _queue: &Arc<Queue>,
        _client: Arc<QueueClient>,
        _request: Message,
    ) -> PullResult {
        PullResult::StatusNotSupported
    }

    fn enter(&self, _previous: QueueType) -> StateAction {
        StateAction::Allow
    }

    fn leave(&self, _next: QueueType) -> StateAction {
        StateAction::Allow
    }
}

/// Build the state object for a queue type
pub fn state_for(queue_type: QueueType) -> Arc<dyn QueueState> {
    match queue_type {
        QueueType::Push => Arc::new(PushState::new()),
        QueueType::RoundRobin => Arc::new(RoundRobinState::new()),
        QueueType::Pull => Arc::new(PullState::new()),
    }
}

/// Control parameters parsed from a pull request's headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullRequest {
    /// How many messages to hand back in this single call, minimum 1
    pub count: usize,
    /// Store wipe applied once the last requested item is processed
    pub clear: Option<ClearMode>,
    /// Include remaining-count headers in each response chunk
    pub info: bool,
    /// Head-first retrieval; false means LIFO
    pub fifo: bool,
}

impl PullRequest {
    /// Parse the `Count`, `Clear`, `Info` and `Order` headers. A missing or
    /// sub-1 count is unacceptable.
    pub fn parse(request: &Message) -> Option<PullRequest> {
        let count: usize = request.header(headers::COUNT)?.trim().parse().ok()?;
        if count < 1 {
            return None;
        }
        let clear = match request.header(headers::CLEAR) {
            Some(value) if value.eq_ignore_ascii_case(headers::CLEAR_ALL) => Some(ClearMode::All),
            Some(value) if value.eq_ignore_ascii_case(headers::CLEAR_PRIORITY) => {
                Some(ClearMode::Priority)
            }
            Some(value) if value.eq_ignore_ascii_case(headers::CLEAR_REGULAR) => {
                Some(ClearMode::Regular)
            }
            _ => None,
        };
        let info = request
            .header(headers::INFO)
            .map(|v| v.eq_ignore_ascii_case("yes"))
            .unwrap_or(false);
        let fifo = request
            .header(headers::ORDER)
            .map(|v| !v.eq_ignore_ascii_case(headers::ORDER_LIFO))
            .unwrap_or(true);
        Some(PullRequest {
            count,
            clear,
            info,
            fifo,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn request(headers: &[(&str, &str)]) -> Message {
        let mut msg = Message::new("q", bytes::Bytes::new());
        for (k, v) in headers {
            msg.add_header(*k, *v);
        }
        msg
    }

    #[test]
    fn test_parse_defaults() {
        let req = PullRequest::parse(&request(&[("Count", "1")])).unwrap();
        assert_eq!(
            req,
            PullRequest {
                count: 1,
                clear: None,
                info: false,
                fifo: true,
            }
        );
    }

    #[test]
    fn test_parse_full() {
        let req = PullRequest::parse(&request(&[
            ("Count", "10"),
            ("Clear", "all"),
            ("Info", "Yes"),
            ("Order", "LIFO"),
        ]))
        .unwrap();
        assert_eq!(req.count, 10);
        assert_eq!(req.clear, Some(ClearMode::All));
        assert!(req.info);
        assert!(!req.fifo);
    }

    #[test]
    fn test_parse_rejects_missing_or_zero_count() {
        assert!(PullRequest::parse(&request(&[])).is_none());
        assert!(PullRequest::parse(&request(&[("Count", "0")])).is_none());
        assert!(PullRequest::parse(&request(&[("Count", "-3")])).is_none());
        assert!(PullRequest::parse(&request(&[("Count", "many")])).is_none());
    }
}
