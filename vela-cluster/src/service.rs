//! tarpc service definition for replica RPC
//!
//! Every peer serves the shard replicas it hosts through this interface.
//! The coordinator of a read calls it once per targeted replica.

use crate::error::ClusterError;
use crate::types::{ScoredPoint, ShardId, ShardSearchRequest};

/// Replica RPC service definition.
#[tarpc::service]
pub trait ReplicaRpc {
    /// Local top-K search on this peer's replica of a shard
    async fn search_shard(
        collection: String,
        shard_id: ShardId,
        request: ShardSearchRequest,
    ) -> Result<Vec<ScoredPoint>, ClusterError>;

    /// Collections and shards this peer hosts a replica of
    async fn local_shards() -> Vec<(String, ShardId)>;

    /// Simple ping for health checking, answers with the node id
    async fn ping() -> String;
}
