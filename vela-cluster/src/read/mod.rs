//! Distributed read coordination
//!
//! A read runs through a small state machine:
//!
//! ```text
//! Planning -> Scattering -> Merging -> Completed
//!     |            |
//!     +------------+-----> Failed
//! ```
//!
//! Planning resolves the consistency level for every shard. Scattering runs
//! one [`ScatterExecutor`] per shard concurrently and fails the whole read on
//! the first shard failure, the query deadline or cancellation. Merging only
//! ever sees a complete set of shard results.

mod merger;
mod plan;
mod reconcile;
mod scatter;

pub use merger::{MergedResults, ResultMerger};
pub use plan::{QueryPlan, ShardPlan};
pub use reconcile::{reconcile, ReconciledShard, ReplicaResponse};
pub use scatter::{ScatterExecutor, ShardResult};

use crate::client::ReplicaClient;
use crate::config::ReadConfig;
use crate::error::{ClusterError, Result};
use crate::metrics;
use crate::topology::ShardDirectory;
use crate::types::{ReadStatus, SearchRequest, SearchResponse};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant as StdInstant;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// State of one distributed read
#[derive(Debug)]
pub enum QueryState {
    Planning,
    Scattering { plan: QueryPlan },
    Merging { plan: QueryPlan, shards: Vec<ShardResult> },
    Completed { response: SearchResponse },
    Failed { error: ClusterError },
}

impl QueryState {
    pub fn name(&self) -> &'static str {
        match self {
            QueryState::Planning => "planning",
            QueryState::Scattering { .. } => "scattering",
            QueryState::Merging { .. } => "merging",
            QueryState::Completed { .. } => "completed",
            QueryState::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueryState::Completed { .. } | QueryState::Failed { .. })
    }
}

/// Coordinates consistency-aware reads across the shards of a collection
pub struct ReadCoordinator {
    directory: Arc<dyn ShardDirectory>,
    executor: ScatterExecutor,
    merger: ResultMerger,
    config: ReadConfig,
}

impl ReadCoordinator {
    pub fn new(
        directory: Arc<dyn ShardDirectory>,
        client: Arc<dyn ReplicaClient>,
        config: ReadConfig,
    ) -> Self {
        Self {
            directory,
            executor: ScatterExecutor::new(client, config.max_concurrent_requests),
            merger: ResultMerger::new(),
            config,
        }
    }

    pub fn config(&self) -> &ReadConfig {
        &self.config
    }

    /// Search a collection
    pub async fn search(&self, collection: &str, request: SearchRequest) -> Result<SearchResponse> {
        self.search_with_cancel(collection, request, CancellationToken::new())
            .await
    }

    /// Search a collection, aborting every outstanding replica call once
    /// `cancel` fires
    pub async fn search_with_cancel(
        &self,
        collection: &str,
        request: SearchRequest,
        cancel: CancellationToken,
    ) -> Result<SearchResponse> {
        let started = StdInstant::now();
        let consistency = request.consistency.to_string();

        let result = self.run(collection, &request, cancel, started).await;

        match &result {
            Ok(response) => {
                metrics::record_read(&consistency, "ok", started.elapsed());
                metrics::record_conflicts_resolved(
                    response.status.shards.iter().map(|s| s.conflicts).sum(),
                );
                metrics::record_duplicates_suppressed(response.status.duplicates_suppressed);
                debug!(
                    "Read on {} completed, consistency={}, hits={}, latency={}ms",
                    collection,
                    consistency,
                    response.points.len(),
                    response.status.latency_ms
                );
            }
            Err(e) => {
                metrics::record_read(&consistency, e.error_type(), started.elapsed());
                warn!("Read on {} failed, consistency={}: {}", collection, consistency, e);
            }
        }

        result
    }

    async fn run(
        &self,
        collection: &str,
        request: &SearchRequest,
        cancel: CancellationToken,
        started: StdInstant,
    ) -> Result<SearchResponse> {
        let mut state = QueryState::Planning;

        loop {
            debug!("Read on {} entering state {}", collection, state.name());
            state = match state {
                QueryState::Planning => match self.plan(collection, request).await {
                    Ok(plan) => QueryState::Scattering { plan },
                    Err(error) => QueryState::Failed { error },
                },
                QueryState::Scattering { plan } => match self.scatter(&plan, &cancel).await {
                    Ok(shards) => QueryState::Merging { plan, shards },
                    Err(error) => QueryState::Failed { error },
                },
                QueryState::Merging { plan, shards } => QueryState::Completed {
                    response: self.merge(&plan, shards, started),
                },
                QueryState::Completed { response } => return Ok(response),
                QueryState::Failed { error } => return Err(error),
            };
        }
    }

    async fn plan(&self, collection: &str, request: &SearchRequest) -> Result<QueryPlan> {
        let timeout = request.timeout.unwrap_or_else(|| self.config.query_timeout());
        let deadline = Instant::now().checked_add(timeout).ok_or_else(|| {
            ClusterError::InvalidQuery(format!("timeout of {}s is out of range", timeout.as_secs()))
        })?;
        let shards = self.directory.list_shards(collection).await?;
        QueryPlan::build(
            collection,
            request,
            shards,
            self.config.shard_timeout(),
            deadline,
        )
    }

    /// Run every shard concurrently; the first failure aborts the rest
    async fn scatter(
        &self,
        plan: &QueryPlan,
        cancel: &CancellationToken,
    ) -> Result<Vec<ShardResult>> {
        let shard_cancel = cancel.child_token();
        let _abort_on_exit = shard_cancel.clone().drop_guard();

        let mut pending: FuturesUnordered<_> = plan
            .shards
            .iter()
            .enumerate()
            .map(|(index, shard)| {
                let token = shard_cancel.clone();
                async move {
                    let result = self
                        .executor
                        .execute(&plan.collection, shard, &plan.request, plan.deadline, token)
                        .await;
                    (index, result)
                }
            })
            .collect();

        let mut results: Vec<Option<ShardResult>> = (0..plan.shards.len()).map(|_| None).collect();

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    return Err(ClusterError::Cancelled);
                }
                _ = tokio::time::sleep_until(plan.deadline) => {
                    return Err(ClusterError::Timeout(format!(
                        "read on '{}' exceeded its deadline",
                        plan.collection
                    )));
                }
                next = pending.next() => match next {
                    Some((index, Ok(result))) => {
                        results[index] = Some(result);
                    }
                    Some((index, Err(error))) => {
                        warn!(
                            "Shard {} failed, aborting read: {}",
                            plan.shards[index].shard_id, error
                        );
                        return Err(error);
                    }
                    None => break,
                },
            }
        }

        results
            .into_iter()
            .map(|r| r.ok_or_else(|| ClusterError::Internal("shard finished without a result".to_string())))
            .collect()
    }

    fn merge(&self, plan: &QueryPlan, shards: Vec<ShardResult>, started: StdInstant) -> SearchResponse {
        let sequences: Vec<_> = shards.iter().map(|s| s.reconciled.points.clone()).collect();
        let merged = self.merger.merge(&sequences, plan.fetch_limit);

        let points = merged.points.into_iter().skip(plan.offset).collect();

        SearchResponse {
            points,
            status: ReadStatus {
                consistency: plan.consistency.to_string(),
                shards: shards.into_iter().map(|s| s.status).collect(),
                duplicates_suppressed: merged.duplicates_suppressed,
                latency_ms: started.elapsed().as_millis() as u64,
            },
        }
    }
}
