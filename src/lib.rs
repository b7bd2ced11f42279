//! RelayMQ - Message queue delivery engine
//!
//! An in-memory queueing core with pluggable dispatch policies (push,
//! round-robin, pull), acknowledge tracking, per-message timeouts,
//! delivery-decision hooks and cluster queue synchronization. Socket
//! handling lives behind the `ClientTransport` and `NodeLink` capabilities;
//! this crate never opens a connection itself.

pub mod broker;
pub mod client;
pub mod cluster;
pub mod config;
pub mod hooks;
pub mod protocol;
pub mod queue;

pub use broker::{Broker, BrokerError};
pub use client::{ChannelTransport, ClientTransport, QueueClient, SendError};
pub use cluster::{ChannelNodeLink, NodeLink, NodeMessage, QueueSync, SyncError, SyncPhase};
pub use config::{Config, ConfigError};
pub use hooks::{Decision, DefaultDeliveryHandler, DeliveryHandler, PutBack};
pub use protocol::Message;
pub use queue::{AckMode, Queue, QueueEvent, QueueOptions, QueueStatus, QueueType};
