//! Cluster configuration

use serde::Deserialize;

/// Cluster node configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ClusterConfig {
    /// Whether cluster replication is enabled
    pub enabled: bool,
    /// This node's identifier; must be unique across the cluster
    pub node_id: String,
    /// Peer node addresses (host:port)
    #[serde(default)]
    pub peers: Vec<String>,
    /// Whether this node starts as the main node for queue sync
    #[serde(default)]
    pub main: bool,
}
