//! Core read-path types
//!
//! These types cross the replica RPC boundary and are designed for
//! bincode serialization over the wire, so none of them rely on
//! self-describing formats (no untagged enums, no `serde_json::Value`).

use crate::consistency::ConsistencyLevel;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Peer (node) identifier, ordered lexicographically for tie-breaks
pub type PeerId = String;

/// Shard number within a collection
pub type ShardId = u32;

/// Point identifier: unsigned integer or UUID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PointId {
    Num(u64),
    Uuid(uuid::Uuid),
}

impl fmt::Display for PointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointId::Num(n) => write!(f, "{}", n),
            PointId::Uuid(u) => write!(f, "{}", u),
        }
    }
}

impl From<u64> for PointId {
    fn from(n: u64) -> Self {
        PointId::Num(n)
    }
}

impl From<uuid::Uuid> for PointId {
    fn from(u: uuid::Uuid) -> Self {
        PointId::Uuid(u)
    }
}

/// One entry of a replica's local top-K
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredPoint {
    pub id: PointId,
    pub score: f32,
    /// Opaque, monotonically increasing write clock of the point
    pub version: u64,
}

impl ScoredPoint {
    pub fn new(id: impl Into<PointId>, score: f32, version: u64) -> Self {
        Self {
            id: id.into(),
            score,
            version,
        }
    }
}

/// Liveness of a replica as last observed by the cluster layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaStatus {
    Reachable,
    Unreachable,
}

impl ReplicaStatus {
    pub fn is_reachable(&self) -> bool {
        matches!(self, ReplicaStatus::Reachable)
    }
}

/// A replica of a shard hosted on one peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    pub peer_id: PeerId,
    pub status: ReplicaStatus,
}

/// Snapshot of one shard's replica set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardDescriptor {
    pub shard_id: ShardId,
    pub replication_factor: usize,
    pub replicas: Vec<ReplicaDescriptor>,
}

impl ShardDescriptor {
    /// Reachable replica peers, sorted by peer id
    pub fn reachable_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .replicas
            .iter()
            .filter(|r| r.status.is_reachable())
            .map(|r| r.peer_id.clone())
            .collect();
        peers.sort();
        peers.dedup();
        peers
    }

    /// Assigned replica peers currently marked unreachable, sorted by peer id
    pub fn unreachable_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .replicas
            .iter()
            .filter(|r| !r.status.is_reachable())
            .map(|r| r.peer_id.clone())
            .collect();
        peers.sort();
        peers.dedup();
        peers
    }
}

/// Vector distance metric of a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distance {
    #[default]
    Dot,
    Cosine,
    Euclid,
}

/// Collection metadata, passed through the read path uninterpreted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionMeta {
    pub name: String,
    pub vector_size: usize,
    pub distance: Distance,
    pub shard_count: usize,
    pub replication_factor: usize,
}

/// A top-K search as submitted by a caller
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub vector: Vec<f32>,
    pub limit: usize,
    pub offset: usize,
    /// Opaque filter, forwarded to replicas untouched
    pub filter: Option<serde_json::Value>,
    pub score_threshold: Option<f32>,
    pub consistency: ConsistencyLevel,
    /// Overrides the configured query timeout
    pub timeout: Option<Duration>,
}

impl SearchRequest {
    pub fn new(vector: Vec<f32>, limit: usize) -> Self {
        Self {
            vector,
            limit,
            offset: 0,
            filter: None,
            score_threshold: None,
            consistency: ConsistencyLevel::default(),
            timeout: None,
        }
    }

    pub fn with_consistency(mut self, consistency: ConsistencyLevel) -> Self {
        self.consistency = consistency;
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Number of entries every replica and the merger must produce
    pub fn fetch_limit(&self) -> usize {
        self.limit.saturating_add(self.offset)
    }

    /// Build the per-replica request
    pub fn to_shard_request(&self) -> crate::error::Result<ShardSearchRequest> {
        let filter = match &self.filter {
            Some(value) if !value.is_null() => Some(serde_json::to_string(value)?),
            _ => None,
        };
        Ok(ShardSearchRequest {
            vector: self.vector.clone(),
            limit: self.fetch_limit(),
            filter,
            score_threshold: self.score_threshold,
        })
    }
}

/// Search request sent to a single replica of a shard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardSearchRequest {
    pub vector: Vec<f32>,
    pub limit: usize,
    /// JSON-encoded opaque filter
    pub filter: Option<String>,
    pub score_threshold: Option<f32>,
}

/// Per-shard outcome reported alongside results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardReadStatus {
    pub shard_id: ShardId,
    pub required_acks: usize,
    /// Peers whose responses were used, sorted
    pub responded: Vec<PeerId>,
    /// Assigned peers skipped because they were unreachable
    pub degraded: Vec<PeerId>,
    /// Points on which responding replicas disagreed
    pub conflicts: usize,
}

/// Diagnostics for one completed read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadStatus {
    pub consistency: String,
    pub shards: Vec<ShardReadStatus>,
    /// Same id seen on more than one shard and collapsed by the merger
    pub duplicates_suppressed: usize,
    pub latency_ms: u64,
}

impl ReadStatus {
    pub fn is_degraded(&self) -> bool {
        self.shards.iter().any(|s| !s.degraded.is_empty())
    }
}

/// Result of a distributed search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub points: Vec<ScoredPoint>,
    pub status: ReadStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_point_id_ordering() {
        let a = PointId::Num(5);
        let b = PointId::Num(42);
        let c = PointId::Uuid(uuid::Uuid::nil());
        assert!(a < b);
        assert!(b < c);
        assert_eq!(b.to_string(), "42");
    }

    #[test]
    fn test_point_id_bincode() {
        let id = PointId::Uuid(uuid::Uuid::new_v4());
        let bytes = bincode::serialize(&id).unwrap();
        let back: PointId = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_reachable_peers_sorted() {
        let shard = ShardDescriptor {
            shard_id: 0,
            replication_factor: 3,
            replicas: vec![
                ReplicaDescriptor {
                    peer_id: "peer-2".into(),
                    status: ReplicaStatus::Reachable,
                },
                ReplicaDescriptor {
                    peer_id: "peer-0".into(),
                    status: ReplicaStatus::Unreachable,
                },
                ReplicaDescriptor {
                    peer_id: "peer-1".into(),
                    status: ReplicaStatus::Reachable,
                },
            ],
        };
        assert_eq!(shard.reachable_peers(), vec!["peer-1", "peer-2"]);
        assert_eq!(shard.unreachable_peers(), vec!["peer-0"]);
    }

    #[test]
    fn test_shard_request_encodes_filter() {
        let mut request = SearchRequest::new(vec![0.1, 0.2], 5).with_offset(3);
        request.filter = Some(json!({"must": [{"key": "color", "match": {"value": "red"}}]}));

        let shard_request = request.to_shard_request().unwrap();
        assert_eq!(shard_request.limit, 8);
        let decoded: serde_json::Value =
            serde_json::from_str(shard_request.filter.as_deref().unwrap()).unwrap();
        assert_eq!(decoded, request.filter.unwrap());
    }

    #[test]
    fn test_shard_request_null_filter_dropped() {
        let mut request = SearchRequest::new(vec![1.0], 1);
        request.filter = Some(serde_json::Value::Null);
        assert!(request.to_shard_request().unwrap().filter.is_none());
    }
}
