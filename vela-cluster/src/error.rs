//! Cluster-specific error types

use crate::types::ShardId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during cluster reads and replica RPC
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClusterError {
    #[error("Invalid consistency: {0}")]
    InvalidConsistency(String),

    #[error(
        "Insufficient replicas for shard {shard_id}: {responded} responded, {required} required{}",
        .reason.as_ref().map(|r| format!(" ({})", r)).unwrap_or_default()
    )]
    InsufficientReplicas {
        shard_id: ShardId,
        responded: usize,
        required: usize,
        /// Last replica failure observed for the shard, if any
        reason: Option<String>,
    },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Query cancelled")]
    Cancelled,

    #[error("Shard {shard_id} unavailable: no reachable replicas")]
    ShardUnavailable { shard_id: ShardId },

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClusterError {
    /// Get the error type as a string for metrics labeling
    pub fn error_type(&self) -> &'static str {
        match self {
            ClusterError::InvalidConsistency(_) => "invalid_consistency",
            ClusterError::InsufficientReplicas { .. } => "insufficient_replicas",
            ClusterError::Timeout(_) => "timeout",
            ClusterError::Cancelled => "cancelled",
            ClusterError::ShardUnavailable { .. } => "shard_unavailable",
            ClusterError::CollectionNotFound(_) => "collection_not_found",
            ClusterError::InvalidQuery(_) => "invalid_query",
            ClusterError::Connection(_) => "connection",
            ClusterError::Transport(_) => "transport",
            ClusterError::Serialization(_) => "serialization",
            ClusterError::Config(_) => "config",
            ClusterError::Internal(_) => "internal",
        }
    }

    /// Whether the caller is at fault (bad parameters) rather than the cluster
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ClusterError::InvalidConsistency(_)
                | ClusterError::InvalidQuery(_)
                | ClusterError::CollectionNotFound(_)
        )
    }

    /// Whether the error means the peer could not be reached at all
    pub fn is_unreachable(&self) -> bool {
        matches!(self, ClusterError::Connection(_))
    }
}

impl From<std::io::Error> for ClusterError {
    fn from(err: std::io::Error) -> Self {
        ClusterError::Transport(err.to_string())
    }
}

impl From<bincode::Error> for ClusterError {
    fn from(err: bincode::Error) -> Self {
        ClusterError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
