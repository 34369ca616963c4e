//! Replica RPC client with connection pooling
//!
//! `ClusterClient` implements [`ReplicaClient`], the seam through which the
//! read path reaches replicas. Replicas hosted by the local node are searched
//! in-process; everything else goes over pooled tarpc connections.

use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::metrics::{
    record_connection_established, record_connection_failed, record_connection_pool_size, RpcTimer,
};
use crate::server::LocalShards;
use crate::service::ReplicaRpcClient;
use crate::topology::ClusterState;
use crate::types::{PeerId, ScoredPoint, ShardId, ShardSearchRequest};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tarpc::client::{Config as TarpcConfig, RpcError};
use tarpc::context;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Issues a search against one replica of a shard
#[async_trait]
pub trait ReplicaClient: Send + Sync {
    /// Search `peer`'s replica of `shard_id`. The call must not outlive `deadline`.
    async fn query_replica(
        &self,
        peer: &PeerId,
        collection: &str,
        shard_id: ShardId,
        request: &ShardSearchRequest,
        deadline: Instant,
    ) -> Result<Vec<ScoredPoint>>;
}

/// Connection pool entry
struct PooledConnection {
    client: ReplicaRpcClient,
    #[allow(dead_code)]
    created_at: std::time::Instant,
}

/// Replica RPC client with connection pooling
pub struct ClusterClient {
    config: ClusterConfig,
    cluster_state: Arc<ClusterState>,
    local: Option<Arc<dyn LocalShards>>,
    connections: Arc<RwLock<HashMap<String, PooledConnection>>>,
}

impl ClusterClient {
    /// Create a new cluster client
    pub fn new(config: ClusterConfig, cluster_state: Arc<ClusterState>) -> Self {
        Self {
            config,
            cluster_state,
            local: None,
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Serve replicas of the local node in-process instead of over RPC
    pub fn with_local_shards(mut self, local: Arc<dyn LocalShards>) -> Self {
        self.local = Some(local);
        self
    }

    pub fn cluster_state(&self) -> Arc<ClusterState> {
        Arc::clone(&self.cluster_state)
    }

    /// Get or create a connection to the specified address
    async fn get_client(&self, addr: &str) -> Result<ReplicaRpcClient> {
        {
            let connections = self.connections.read();
            if let Some(conn) = connections.get(addr) {
                return Ok(conn.client.clone());
            }
        }

        let client = self.create_connection(addr).await?;

        {
            let mut connections = self.connections.write();
            connections.insert(
                addr.to_string(),
                PooledConnection {
                    client: client.clone(),
                    created_at: std::time::Instant::now(),
                },
            );
            record_connection_pool_size(connections.len());
        }

        Ok(client)
    }

    /// Create a new connection to the specified address
    async fn create_connection(&self, addr: &str) -> Result<ReplicaRpcClient> {
        debug!("Connecting to peer at {}", addr);

        let stream = tokio::time::timeout(self.config.connect_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| {
                record_connection_failed(addr, "timeout");
                ClusterError::Connection(format!("Connection to {} timed out", addr))
            })?
            .map_err(|e| {
                record_connection_failed(addr, "connect_error");
                ClusterError::Connection(format!("Failed to connect to {}: {}", addr, e))
            })?;
        stream.set_nodelay(true)?;

        let transport = tarpc::serde_transport::new(
            tokio_util::codec::Framed::new(
                stream,
                tarpc::tokio_util::codec::LengthDelimitedCodec::new(),
            ),
            tarpc::tokio_serde::formats::Bincode::default(),
        );

        let client = ReplicaRpcClient::new(TarpcConfig::default(), transport).spawn();

        info!("Connected to peer at {}", addr);
        record_connection_established(addr);
        Ok(client)
    }

    /// Context whose deadline is the earlier of `deadline` and the request timeout
    fn context(&self, deadline: Option<Instant>) -> context::Context {
        let mut ctx = context::current();
        let cap = Instant::now().checked_add(self.config.request_timeout());
        let deadline = match (deadline, cap) {
            (Some(d), Some(cap)) => Some(d.min(cap)),
            (d, cap) => d.or(cap),
        };
        if let Some(deadline) = deadline {
            ctx.deadline = deadline.into_std();
        }
        ctx
    }

    fn address_of(&self, peer: &str) -> Result<String> {
        self.cluster_state
            .peer_address(peer)
            .ok_or_else(|| ClusterError::Connection(format!("Unknown peer '{}'", peer)))
    }

    fn rpc_error(peer: &str, err: RpcError) -> ClusterError {
        match err {
            RpcError::DeadlineExceeded => {
                ClusterError::Timeout(format!("Replica {} did not answer in time", peer))
            }
            other => ClusterError::Transport(format!("RPC to {} failed: {}", peer, other)),
        }
    }

    /// Drop a pooled connection after a failure so the next call reconnects
    fn observe_failure(&self, peer: &str, addr: &str, err: &ClusterError) {
        match err {
            ClusterError::Connection(reason) => {
                self.remove_connection(addr);
                if self.cluster_state.is_reachable(peer) {
                    warn!("Peer {} is unreachable: {}", peer, reason);
                }
                self.cluster_state.mark_unreachable(peer, reason.clone());
            }
            ClusterError::Transport(_) => self.remove_connection(addr),
            _ => {}
        }
    }

    // ========================================
    // Public API
    // ========================================

    /// Search a shard replica on a remote peer
    pub async fn search_shard(
        &self,
        peer: &str,
        collection: &str,
        shard_id: ShardId,
        request: ShardSearchRequest,
        deadline: Option<Instant>,
    ) -> Result<Vec<ScoredPoint>> {
        let timer = RpcTimer::new("search_shard", peer);
        let addr = self.address_of(peer)?;

        let result = match self.get_client(&addr).await {
            Ok(client) => client
                .search_shard(self.context(deadline), collection.to_string(), shard_id, request)
                .await
                .map_err(|e| Self::rpc_error(peer, e))
                .and_then(|r| r),
            Err(e) => Err(e),
        };

        match &result {
            Ok(_) => {
                timer.success();
                self.cluster_state.update_heartbeat(peer);
            }
            Err(e) => {
                timer.error(e.error_type());
                self.observe_failure(peer, &addr, e);
            }
        }
        result
    }

    /// List the shards a remote peer hosts
    pub async fn local_shards(&self, peer: &str) -> Result<Vec<(String, ShardId)>> {
        let timer = RpcTimer::new("local_shards", peer);
        let addr = self.address_of(peer)?;
        let client = self.get_client(&addr).await?;
        match client.local_shards(self.context(None)).await {
            Ok(shards) => {
                timer.success();
                Ok(shards)
            }
            Err(e) => {
                let err = Self::rpc_error(peer, e);
                timer.error(err.error_type());
                self.observe_failure(peer, &addr, &err);
                Err(err)
            }
        }
    }

    /// Ping a remote peer, returns the node id it reports
    pub async fn ping(&self, peer: &str) -> Result<String> {
        let timer = RpcTimer::new("ping", peer);
        let addr = self.address_of(peer)?;
        let result = match self.get_client(&addr).await {
            Ok(client) => client
                .ping(self.context(None))
                .await
                .map_err(|e| Self::rpc_error(peer, e)),
            Err(e) => Err(e),
        };
        match &result {
            Ok(_) => timer.success(),
            Err(e) => {
                timer.error(e.error_type());
                self.remove_connection(&addr);
            }
        }
        result
    }

    /// Remove a connection from the pool
    pub fn remove_connection(&self, addr: &str) {
        let mut connections = self.connections.write();
        if connections.remove(addr).is_some() {
            record_connection_pool_size(connections.len());
        }
    }

    /// Clear all connections from the pool
    pub fn clear_connections(&self) {
        let mut connections = self.connections.write();
        connections.clear();
        record_connection_pool_size(0);
    }

    pub fn pool_size(&self) -> usize {
        self.connections.read().len()
    }
}

#[async_trait]
impl ReplicaClient for ClusterClient {
    async fn query_replica(
        &self,
        peer: &PeerId,
        collection: &str,
        shard_id: ShardId,
        request: &ShardSearchRequest,
        deadline: Instant,
    ) -> Result<Vec<ScoredPoint>> {
        if peer.as_str() == self.cluster_state.local_node() {
            if let Some(local) = &self.local {
                return tokio::time::timeout_at(deadline, local.search(collection, shard_id, request))
                    .await
                    .unwrap_or_else(|_| {
                        Err(ClusterError::Timeout(format!(
                            "Local replica of shard {} did not answer in time",
                            shard_id
                        )))
                    });
            }
        }

        tokio::time::timeout_at(
            deadline,
            self.search_shard(peer, collection, shard_id, request.clone(), Some(deadline)),
        )
        .await
        .unwrap_or_else(|_| {
            Err(ClusterError::Timeout(format!(
                "Replica {} did not answer in time",
                peer
            )))
        })
    }
}
