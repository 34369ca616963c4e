//! Peer health checking
//!
//! Pings every remote peer on a fixed interval and records the outcome in
//! [`ClusterState`]. A failed ping marks the peer unreachable so the read
//! path stops planning replicas on it; a successful ping brings it back.

use crate::client::ClusterClient;
use crate::metrics;
use crate::topology::ClusterState;
use futures::future::join_all;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Health checker service
pub struct HealthChecker {
    client: Arc<ClusterClient>,
    cluster_state: Arc<ClusterState>,
    interval: Duration,
    running: Arc<RwLock<bool>>,
}

impl HealthChecker {
    /// Create a new health checker
    pub fn new(client: Arc<ClusterClient>, interval: Duration) -> Self {
        let cluster_state = client.cluster_state();
        Self {
            client,
            cluster_state,
            interval,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Start the health checker background task
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        *self.running.write() = true;

        let checker = Arc::clone(&self);
        tokio::spawn(async move {
            checker.run_loop().await;
        })
    }

    /// Stop the health checker
    pub fn stop(&self) {
        *self.running.write() = false;
    }

    /// Check if health checker is running
    pub fn is_running(&self) -> bool {
        *self.running.read()
    }

    /// Main health check loop
    async fn run_loop(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("Health checker started with {:?} interval", self.interval);

        while self.is_running() {
            ticker.tick().await;

            if !self.is_running() {
                break;
            }

            self.check_all_peers().await;
        }

        info!("Health checker stopped");
    }

    /// Ping every remote peer once
    pub async fn check_all_peers(&self) {
        let peers = self.cluster_state.remote_peers();
        join_all(peers.iter().map(|peer| self.check_peer(&peer.node_id))).await;
        metrics::update_peer_metrics(&self.cluster_state);
    }

    async fn check_peer(&self, node_id: &str) {
        let start = Instant::now();
        let was_reachable = self.cluster_state.is_reachable(node_id);

        match self.client.ping(node_id).await {
            Ok(reported) => {
                if reported != node_id {
                    warn!(
                        "Peer {} answered ping as {}, check the peer list",
                        node_id, reported
                    );
                }
                self.cluster_state.update_heartbeat(node_id);
                if !was_reachable {
                    info!("Peer {} is reachable again", node_id);
                }
                debug!("Heartbeat from {} in {:?}", node_id, start.elapsed());
            }
            Err(e) => {
                self.cluster_state.mark_unreachable(node_id, e.to_string());
                if was_reachable {
                    warn!("Peer {} failed health check: {}", node_id, e);
                } else {
                    debug!("Peer {} still unreachable: {}", node_id, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;

    #[tokio::test]
    async fn test_unreachable_peer_is_marked() {
        let state = Arc::new(ClusterState::new("peer-0", "127.0.0.1:0"));
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        state.register_peer("peer-1", addr);

        let config = ClusterConfig {
            node_id: "peer-0".to_string(),
            connect_timeout_ms: 200,
            ..Default::default()
        };
        let client = Arc::new(ClusterClient::new(config, Arc::clone(&state)));
        let checker = HealthChecker::new(client, Duration::from_millis(50));

        let epoch = state.epoch();
        checker.check_all_peers().await;

        assert!(!state.is_reachable("peer-1"));
        assert!(state.is_reachable("peer-0"));
        assert!(state.epoch() > epoch);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let state = Arc::new(ClusterState::new("peer-0", "127.0.0.1:0"));
        let client = Arc::new(ClusterClient::new(ClusterConfig::default(), state));
        let checker = Arc::new(HealthChecker::new(client, Duration::from_millis(10)));

        let handle = Arc::clone(&checker).start();
        assert!(checker.is_running());
        checker.stop();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!checker.is_running());
    }
}
