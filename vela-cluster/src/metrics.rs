//! Read-path and cluster observability metrics
//!
//! Provides Prometheus-compatible metrics via the `metrics` facade:
//! - Replica RPC duration and errors (client and server side)
//! - Distributed read duration and outcome per consistency level
//! - Reconciliation conflicts and cross-shard duplicates
//! - Peer reachability and connection pool size

use crate::topology::ClusterState;
use std::time::{Duration, Instant};

/// Record RPC call duration
pub fn record_rpc_duration(method: &str, target_node: &str, duration: Duration) {
    metrics::histogram!(
        "vela_rpc_duration_seconds",
        "method" => method.to_string(),
        "target_node" => target_node.to_string(),
    )
    .record(duration.as_secs_f64());
}

/// Record RPC call success
pub fn record_rpc_success(method: &str, target_node: &str) {
    metrics::counter!(
        "vela_rpc_requests_total",
        "method" => method.to_string(),
        "target_node" => target_node.to_string(),
        "status" => "ok",
    )
    .increment(1);
}

/// Record RPC call error
pub fn record_rpc_error(method: &str, target_node: &str, error_type: &str) {
    metrics::counter!(
        "vela_rpc_requests_total",
        "method" => method.to_string(),
        "target_node" => target_node.to_string(),
        "status" => "error",
    )
    .increment(1);

    metrics::counter!(
        "vela_rpc_errors_total",
        "method" => method.to_string(),
        "error_type" => error_type.to_string(),
    )
    .increment(1);
}

/// Record server-side RPC handler duration
pub fn record_rpc_handler_duration(method: &str, duration: Duration) {
    metrics::histogram!(
        "vela_rpc_handler_duration_seconds",
        "method" => method.to_string(),
    )
    .record(duration.as_secs_f64());
}

/// Record server-side RPC handler outcome
pub fn record_rpc_handler_outcome(method: &str, error_type: Option<&str>) {
    let status = if error_type.is_some() { "error" } else { "ok" };
    metrics::counter!(
        "vela_rpc_handler_total",
        "method" => method.to_string(),
        "status" => status,
    )
    .increment(1);

    if let Some(error_type) = error_type {
        metrics::counter!(
            "vela_rpc_handler_errors_total",
            "method" => method.to_string(),
            "error_type" => error_type.to_string(),
        )
        .increment(1);
    }
}

/// Record a finished distributed read
pub fn record_read(consistency: &str, outcome: &str, duration: Duration) {
    metrics::counter!(
        "vela_read_queries_total",
        "consistency" => consistency.to_string(),
        "outcome" => outcome.to_string(),
    )
    .increment(1);

    metrics::histogram!(
        "vela_read_duration_seconds",
        "consistency" => consistency.to_string(),
    )
    .record(duration.as_secs_f64());
}

/// Record points whose replicas disagreed and were settled by version
pub fn record_conflicts_resolved(count: usize) {
    if count > 0 {
        metrics::counter!("vela_read_conflicts_resolved_total").increment(count as u64);
    }
}

/// Record ids returned by more than one shard and collapsed by the merger
pub fn record_duplicates_suppressed(count: usize) {
    if count > 0 {
        metrics::counter!("vela_read_duplicates_suppressed_total").increment(count as u64);
    }
}

/// Record replicas skipped because they were unreachable
pub fn record_degraded_replicas(shard_id: u32, count: usize) {
    if count > 0 {
        metrics::counter!(
            "vela_read_degraded_replicas_total",
            "shard" => shard_id.to_string(),
        )
        .increment(count as u64);
    }
}

/// Record connection pool metrics
pub fn record_connection_pool_size(size: usize) {
    metrics::gauge!("vela_cluster_connections_active").set(size as f64);
}

/// Record connection establishment
pub fn record_connection_established(target_node: &str) {
    metrics::counter!(
        "vela_cluster_connections_established_total",
        "target_node" => target_node.to_string(),
    )
    .increment(1);
}

/// Record connection failure
pub fn record_connection_failed(target_node: &str, error_type: &str) {
    metrics::counter!(
        "vela_cluster_connections_failed_total",
        "target_node" => target_node.to_string(),
        "error_type" => error_type.to_string(),
    )
    .increment(1);
}

/// Update peer reachability gauges from the cluster state
pub fn update_peer_metrics(cluster_state: &ClusterState) {
    let snapshot = cluster_state.snapshot();
    let reachable = snapshot.peers.values().filter(|p| p.reachable).count();

    metrics::gauge!("vela_cluster_peers_reachable").set(reachable as f64);
    metrics::gauge!("vela_cluster_peers_unreachable")
        .set((snapshot.peers.len() - reachable) as f64);
    metrics::gauge!("vela_cluster_epoch").set(snapshot.epoch as f64);

    for (node_id, peer) in &snapshot.peers {
        metrics::gauge!(
            "vela_peer_reachable",
            "node_id" => node_id.clone(),
        )
        .set(if peer.reachable { 1.0 } else { 0.0 });
    }
}

/// Guard for timing RPC operations
pub struct RpcTimer {
    method: &'static str,
    target_node: String,
    start: Instant,
}

impl RpcTimer {
    /// Start timing an RPC operation
    pub fn new(method: &'static str, target_node: &str) -> Self {
        Self {
            method,
            target_node: target_node.to_string(),
            start: Instant::now(),
        }
    }

    /// Record success and duration
    pub fn success(self) {
        record_rpc_duration(self.method, &self.target_node, self.start.elapsed());
        record_rpc_success(self.method, &self.target_node);
    }

    /// Record error and duration
    pub fn error(self, error_type: &str) {
        record_rpc_duration(self.method, &self.target_node, self.start.elapsed());
        record_rpc_error(self.method, &self.target_node, error_type);
    }
}

/// Guard for timing RPC handlers
pub struct RpcHandlerTimer {
    method: &'static str,
    start: Instant,
}

impl RpcHandlerTimer {
    /// Start timing an RPC handler
    pub fn new(method: &'static str) -> Self {
        Self {
            method,
            start: Instant::now(),
        }
    }

    /// Record success and duration
    pub fn success(self) {
        record_rpc_handler_duration(self.method, self.start.elapsed());
        record_rpc_handler_outcome(self.method, None);
    }

    /// Record error and duration
    pub fn error(self, error_type: &str) {
        record_rpc_handler_duration(self.method, self.start.elapsed());
        record_rpc_handler_outcome(self.method, Some(error_type));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_timer() {
        let timer = RpcTimer::new("search_shard", "peer-1");
        std::thread::sleep(Duration::from_millis(1));
        timer.success();
        RpcTimer::new("search_shard", "peer-1").error("timeout");
    }

    #[test]
    fn test_rpc_handler_timer() {
        RpcHandlerTimer::new("search_shard").success();
        RpcHandlerTimer::new("search_shard").error("invalid_query");
    }

    #[test]
    fn test_update_peer_metrics() {
        let state = ClusterState::new("peer-0", "127.0.0.1:6335");
        state.register_peer("peer-1", "127.0.0.1:6336");
        state.mark_unreachable("peer-1", "refused");

        // Should not panic without an installed recorder
        update_peer_metrics(&state);
        record_read("majority", "ok", Duration::from_millis(3));
        record_conflicts_resolved(2);
        record_duplicates_suppressed(0);
    }
}
