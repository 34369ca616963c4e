//! Per-shard scatter
//!
//! Sends one shard's query to its target replicas concurrently and waits
//! until enough of them have answered. Outstanding calls are dropped as soon
//! as the shard is satisfied, has failed, or the read is cancelled.

use super::plan::ShardPlan;
use super::reconcile::{reconcile, ReconciledShard, ReplicaResponse};
use crate::client::ReplicaClient;
use crate::error::{ClusterError, Result};
use crate::metrics::record_degraded_replicas;
use crate::types::{ShardId, ShardReadStatus, ShardSearchRequest};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Successful contribution of one shard
#[derive(Debug, Clone)]
pub struct ShardResult {
    pub shard_id: ShardId,
    pub reconciled: ReconciledShard,
    pub status: ShardReadStatus,
}

/// Runs the replica fan-out of a single shard
#[derive(Clone)]
pub struct ScatterExecutor {
    client: Arc<dyn ReplicaClient>,
    limiter: Arc<Semaphore>,
}

impl ScatterExecutor {
    /// Create an executor allowing at most `max_concurrent` replica calls in flight
    pub fn new(client: Arc<dyn ReplicaClient>, max_concurrent: usize) -> Self {
        Self {
            client,
            limiter: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Query the shard's replicas and reconcile the collected responses.
    ///
    /// The shard deadline is the earlier of the query deadline and the
    /// shard's own timeout. Running out of the query deadline reports
    /// `Timeout`; running out of the shard budget reports
    /// `InsufficientReplicas`.
    pub async fn execute(
        &self,
        collection: &str,
        plan: &ShardPlan,
        request: &ShardSearchRequest,
        query_deadline: Instant,
        cancel: CancellationToken,
    ) -> Result<ShardResult> {
        let shard_id = plan.shard_id;
        let required = plan.quorum.required_acks;
        let shard_deadline = Instant::now()
            .checked_add(plan.timeout)
            .map_or(query_deadline, |d| query_deadline.min(d));

        record_degraded_replicas(shard_id, plan.degraded.len());
        debug!(
            "Scattering shard {} to {} replicas, required={}, await_all={}",
            shard_id,
            plan.targets.len(),
            required,
            plan.quorum.await_all
        );

        let mut pending = FuturesUnordered::new();
        for peer in &plan.targets {
            let client = Arc::clone(&self.client);
            let limiter = Arc::clone(&self.limiter);
            pending.push(async move {
                let result = match limiter.acquire_owned().await {
                    Ok(_permit) => {
                        client
                            .query_replica(peer, collection, shard_id, request, shard_deadline)
                            .await
                    }
                    Err(_) => Err(ClusterError::Internal("replica limiter closed".to_string())),
                };
                (peer, result)
            });
        }

        let mut responses: Vec<ReplicaResponse> = Vec::with_capacity(plan.targets.len());
        let mut last_error: Option<ClusterError> = None;

        loop {
            if responses.len() >= required && (!plan.quorum.await_all || pending.is_empty()) {
                break;
            }
            if responses.len() + pending.len() < required {
                warn!(
                    "Shard {} cannot reach required acknowledgements ({}/{})",
                    shard_id,
                    responses.len(),
                    required
                );
                return Err(ClusterError::InsufficientReplicas {
                    shard_id,
                    responded: responses.len(),
                    required,
                    reason: last_error.map(|e| e.to_string()),
                });
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    return Err(ClusterError::Cancelled);
                }
                next = pending.next() => match next {
                    Some((peer, Ok(points))) => {
                        debug!("Replica {} of shard {} returned {} hits", peer, shard_id, points.len());
                        responses.push(ReplicaResponse::new(peer.clone(), points));
                    }
                    Some((peer, Err(e @ ClusterError::InvalidQuery(_)))) => {
                        debug!("Replica {} of shard {} rejected query: {}", peer, shard_id, e);
                        return Err(e);
                    }
                    Some((peer, Err(e))) => {
                        warn!("Replica {} of shard {} failed: {}", peer, shard_id, e);
                        last_error = Some(e);
                    }
                    None => {}
                },
                _ = tokio::time::sleep_until(shard_deadline) => {
                    if responses.len() >= required {
                        break;
                    }
                    if shard_deadline >= query_deadline {
                        return Err(ClusterError::Timeout(format!(
                            "query deadline elapsed while waiting on shard {}",
                            shard_id
                        )));
                    }
                    warn!(
                        "Shard {} timed out with {}/{} acknowledgements",
                        shard_id,
                        responses.len(),
                        required
                    );
                    return Err(ClusterError::InsufficientReplicas {
                        shard_id,
                        responded: responses.len(),
                        required,
                        reason: Some(format!("shard timeout after {:?}", plan.timeout)),
                    });
                }
            }
        }

        let mut responded: Vec<_> = responses.iter().map(|r| r.peer_id.clone()).collect();
        responded.sort();

        let reconciled = reconcile(&responses, plan.quorum.policy, request.limit);
        Ok(ShardResult {
            shard_id,
            status: ShardReadStatus {
                shard_id,
                required_acks: required,
                responded,
                degraded: plan.degraded.clone(),
                conflicts: reconciled.conflicts,
            },
            reconciled,
        })
    }
}
