//! Cluster configuration

use crate::consistency::ConsistencyLevel;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main cluster configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    /// Unique identifier for this node
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Address to bind the replica RPC server
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Other peers of the cluster
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Request timeout in milliseconds, upper bound for a single replica call
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Interval between peer health pings
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
}

/// Address of a remote peer
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PeerConfig {
    pub node_id: String,
    /// Replica RPC address (host:port)
    pub address: String,
}

fn default_node_id() -> String {
    format!("node-{}", &uuid::Uuid::new_v4().to_string()[..8])
}

fn default_bind_addr() -> String {
    "0.0.0.0:6335".to_string()
}

fn default_connect_timeout() -> u64 {
    2000
}

fn default_request_timeout() -> u64 {
    5000
}

fn default_heartbeat_interval() -> u64 {
    1000
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            bind_addr: default_bind_addr(),
            peers: Vec::new(),
            connect_timeout_ms: default_connect_timeout(),
            request_timeout_ms: default_request_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
        }
    }
}

impl ClusterConfig {
    /// Parse bind address into socket address
    pub fn parse_bind_addr(&self) -> Result<std::net::SocketAddr, std::net::AddrParseError> {
        self.bind_addr.parse()
    }

    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Read-path configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReadConfig {
    /// Consistency used when a query does not specify one
    #[serde(default)]
    pub default_consistency: ConsistencyLevel,

    /// Deadline for a whole query
    #[serde(default = "default_query_timeout")]
    pub query_timeout_ms: u64,

    /// Deadline for one shard to collect its required acknowledgements
    #[serde(default = "default_shard_timeout")]
    pub shard_timeout_ms: u64,

    /// Maximum concurrent replica requests across all queries
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
}

fn default_query_timeout() -> u64 {
    10000
}

fn default_shard_timeout() -> u64 {
    5000
}

fn default_max_concurrent() -> usize {
    64
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            default_consistency: ConsistencyLevel::default(),
            query_timeout_ms: default_query_timeout(),
            shard_timeout_ms: default_shard_timeout(),
            max_concurrent_requests: default_max_concurrent(),
        }
    }
}

impl ReadConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn shard_timeout(&self) -> Duration {
        Duration::from_millis(self.shard_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_config_default() {
        let config = ReadConfig::default();
        assert_eq!(config.default_consistency, ConsistencyLevel::Factor(1));
        assert_eq!(config.query_timeout(), Duration::from_secs(10));
        assert_eq!(config.shard_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_concurrent_requests, 64);
    }

    #[test]
    fn test_read_config_serde_defaults() {
        let config: ReadConfig = serde_json::from_str(r#"{"default_consistency": "majority"}"#).unwrap();
        assert_eq!(config.default_consistency, ConsistencyLevel::Majority);
        assert_eq!(config.query_timeout_ms, 10000);
    }

    #[test]
    fn test_cluster_config_default() {
        let config = ClusterConfig::default();
        assert!(config.node_id.starts_with("node-"));
        assert!(config.parse_bind_addr().is_ok());
        assert_eq!(config.connect_timeout(), Duration::from_millis(2000));
        assert!(config.peers.is_empty());
    }

    #[test]
    fn test_cluster_config_peers() {
        let config: ClusterConfig = serde_json::from_str(
            r#"{"node_id": "peer-0", "peers": [{"node_id": "peer-1", "address": "10.0.0.2:6335"}]}"#,
        )
        .unwrap();
        assert_eq!(config.node_id, "peer-0");
        assert_eq!(config.peers[0].address, "10.0.0.2:6335");
        assert_eq!(config.request_timeout_ms, 5000);
    }
}
