//! Process wiring for one peer: HTTP API, replica RPC server and health checker

use crate::api::{self, AppState};
use crate::config::Config;
use crate::storage::MemoryShards;
use anyhow::Result;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use vela_cluster::{ClusterClient, ClusterServer, ClusterState, HealthChecker, LocalShards, ReadCoordinator};

pub struct Node {
    config: Config,
    cluster_state: Arc<ClusterState>,
    shards: Arc<MemoryShards>,
    client: Arc<ClusterClient>,
    coordinator: Arc<ReadCoordinator>,
}

impl Node {
    pub fn new(config: Config) -> Result<Self> {
        let cluster_state = Arc::new(config.cluster_state()?);
        let shards = Arc::new(MemoryShards::for_local_node(&cluster_state));
        let client = Arc::new(
            ClusterClient::new(config.cluster.clone(), Arc::clone(&cluster_state))
                .with_local_shards(shards.clone()),
        );
        let coordinator = Arc::new(ReadCoordinator::new(
            cluster_state.clone(),
            client.clone(),
            config.read.clone(),
        ));

        info!(
            "Node {} hosts {} shard replicas",
            config.cluster.node_id,
            shards.local_shards().len()
        );

        Ok(Self {
            config,
            cluster_state,
            shards,
            client,
            coordinator,
        })
    }

    pub fn cluster_state(&self) -> Arc<ClusterState> {
        Arc::clone(&self.cluster_state)
    }

    pub fn shards(&self) -> Arc<MemoryShards> {
        Arc::clone(&self.shards)
    }

    pub fn coordinator(&self) -> Arc<ReadCoordinator> {
        Arc::clone(&self.coordinator)
    }

    pub fn router(&self, prometheus: Option<PrometheusHandle>) -> Router {
        api::router(AppState {
            coordinator: self.coordinator(),
            cluster_state: self.cluster_state(),
            shards: self.shards(),
            prometheus,
        })
    }

    /// Serve HTTP on `http` and replica RPC on `rpc` in background tasks
    pub fn start(
        self,
        http: TcpListener,
        rpc: TcpListener,
        prometheus: Option<PrometheusHandle>,
    ) -> Result<RunningNode> {
        let http_addr = http.local_addr()?;
        let rpc_addr = rpc.local_addr()?;
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        let server = ClusterServer::new(self.config.cluster.clone(), self.shards.clone());
        let rpc_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server.serve_with_shutdown(rpc, rpc_shutdown).await {
                error!("Replica RPC server failed: {}", e);
            }
        }));

        let health = Arc::new(HealthChecker::new(
            self.client.clone(),
            self.config.cluster.heartbeat_interval(),
        ));
        let health_task = Arc::clone(&health).start();

        let router = self.router(prometheus);
        let http_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            let serve = axum::serve(http, router)
                .with_graceful_shutdown(http_shutdown.cancelled_owned());
            if let Err(e) = serve.await {
                error!("HTTP server failed: {}", e);
            }
        }));

        info!(
            "Node {} listening, http={}, rpc={}",
            self.config.cluster.node_id, http_addr, rpc_addr
        );

        Ok(RunningNode {
            node_id: self.config.cluster.node_id,
            http_addr,
            rpc_addr,
            shutdown,
            health,
            health_task,
            tasks,
        })
    }
}

/// Handle to a started node
pub struct RunningNode {
    node_id: String,
    http_addr: SocketAddr,
    rpc_addr: SocketAddr,
    shutdown: CancellationToken,
    health: Arc<HealthChecker>,
    health_task: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningNode {
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    /// Stop accepting requests and close replica connections
    pub fn shutdown(&self) {
        info!("Node {} shutting down", self.node_id);
        self.health.stop();
        self.shutdown.cancel();
    }

    /// Wait for the servers to finish after [`shutdown`](Self::shutdown)
    pub async fn wait(self) {
        // The health loop only notices `stop` on its next tick
        self.health_task.abort();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
