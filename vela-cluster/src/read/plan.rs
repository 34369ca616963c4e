//! Query planning
//!
//! Turns a shard snapshot and a search request into the list of replicas to
//! query per shard and the acknowledgements each shard needs. Everything that
//! can be rejected without touching the network is rejected here.

use crate::consistency::{self, ConflictPolicy, ConsistencyLevel, ReadQuorum};
use crate::error::{ClusterError, Result};
use crate::types::{PeerId, SearchRequest, ShardDescriptor, ShardId, ShardSearchRequest};
use std::time::Duration;
use tokio::time::Instant;

/// Upper bound on `limit + offset` for a single read
pub const MAX_FETCH_LIMIT: usize = 100_000;

/// Read plan for a single shard
#[derive(Debug, Clone, PartialEq)]
pub struct ShardPlan {
    pub shard_id: ShardId,
    pub replication_factor: usize,
    /// Reachable replicas the query is sent to, sorted
    pub targets: Vec<PeerId>,
    /// Assigned replicas skipped because they are unreachable
    pub degraded: Vec<PeerId>,
    pub quorum: ReadQuorum,
    /// Budget for this shard, capped by the query deadline at scatter time
    pub timeout: Duration,
}

/// Ephemeral per-query plan
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub collection: String,
    pub consistency: ConsistencyLevel,
    pub request: ShardSearchRequest,
    /// Entries the merger must produce before the offset is applied
    pub fetch_limit: usize,
    pub offset: usize,
    /// Shards ordered by id
    pub shards: Vec<ShardPlan>,
    pub deadline: Instant,
}

impl QueryPlan {
    /// Build a plan from a shard snapshot.
    pub fn build(
        collection: &str,
        request: &SearchRequest,
        mut shards: Vec<ShardDescriptor>,
        shard_timeout: Duration,
        deadline: Instant,
    ) -> Result<Self> {
        // Level errors surface even for collections without replicas
        consistency::resolve(request.consistency, 1)?;
        validate(request)?;

        shards.sort_by_key(|s| s.shard_id);
        let shards = shards
            .iter()
            .map(|shard| plan_shard(shard, request.consistency, shard_timeout))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            collection: collection.to_string(),
            consistency: request.consistency,
            request: request.to_shard_request()?,
            fetch_limit: request.fetch_limit(),
            offset: request.offset,
            shards,
            deadline,
        })
    }
}

fn validate(request: &SearchRequest) -> Result<()> {
    match request.limit.checked_add(request.offset) {
        Some(fetch) if fetch <= MAX_FETCH_LIMIT => {}
        _ => {
            return Err(ClusterError::InvalidQuery(format!(
                "limit + offset must not exceed {}",
                MAX_FETCH_LIMIT
            )))
        }
    }
    if request.vector.is_empty() {
        return Err(ClusterError::InvalidQuery("query vector is empty".to_string()));
    }
    if request.vector.iter().any(|v| !v.is_finite()) {
        return Err(ClusterError::InvalidQuery(
            "query vector contains non-finite values".to_string(),
        ));
    }
    if let Some(threshold) = request.score_threshold {
        if threshold.is_nan() {
            return Err(ClusterError::InvalidQuery(
                "score_threshold must be a number".to_string(),
            ));
        }
    }
    Ok(())
}

fn plan_shard(
    shard: &ShardDescriptor,
    level: ConsistencyLevel,
    timeout: Duration,
) -> Result<ShardPlan> {
    let targets = shard.reachable_peers();
    let degraded = shard.unreachable_peers();

    if targets.is_empty() {
        return Err(ClusterError::ShardUnavailable {
            shard_id: shard.shard_id,
        });
    }

    let replication_factor = shard.replication_factor.max(1);
    let quorum = match level {
        // Unreachable replicas do not block `all`; the read waits for every reachable one
        ConsistencyLevel::All => {
            let required_acks = targets.len().min(replication_factor);
            ReadQuorum {
                required_acks,
                await_all: true,
                policy: if required_acks == 1 {
                    ConflictPolicy::PassThrough
                } else {
                    ConflictPolicy::LatestVersion
                },
            }
        }
        _ => consistency::resolve(level, replication_factor)?,
    };

    if targets.len() < quorum.required_acks {
        return Err(ClusterError::InsufficientReplicas {
            shard_id: shard.shard_id,
            responded: 0,
            required: quorum.required_acks,
            reason: Some(format!(
                "only {} of {} replicas reachable",
                targets.len(),
                replication_factor
            )),
        });
    }

    Ok(ShardPlan {
        shard_id: shard.shard_id,
        replication_factor,
        targets,
        degraded,
        quorum,
        timeout,
    })
}
