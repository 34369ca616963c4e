//! Replica RPC server implementation
//!
//! Serves the replicas hosted by this node to read coordinators on other
//! peers. Storage is abstracted behind [`LocalShards`].

use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::metrics::RpcHandlerTimer;
use crate::service::ReplicaRpc;
use crate::types::{ScoredPoint, ShardId, ShardSearchRequest};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tarpc::context::Context;
use tarpc::server::{BaseChannel, Channel};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shard replicas stored on this node
#[async_trait]
pub trait LocalShards: Send + Sync {
    /// Local top-K over one replica, sorted by score descending
    async fn search(
        &self,
        collection: &str,
        shard_id: ShardId,
        request: &ShardSearchRequest,
    ) -> Result<Vec<ScoredPoint>>;

    /// `(collection, shard)` pairs hosted here
    fn local_shards(&self) -> Vec<(String, ShardId)>;
}

/// Replica RPC server
pub struct ClusterServer {
    config: ClusterConfig,
    shards: Arc<dyn LocalShards>,
}

impl ClusterServer {
    /// Create a new cluster server
    pub fn new(config: ClusterConfig, shards: Arc<dyn LocalShards>) -> Self {
        Self { config, shards }
    }

    /// Bind the configured address and serve until the listener fails
    pub async fn serve(self) -> Result<()> {
        let addr = self
            .config
            .parse_bind_addr()
            .map_err(|e| ClusterError::Config(format!("Invalid bind address: {}", e)))?;
        let listener = TcpListener::bind(addr).await?;
        self.serve_on(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve_on(self, listener: TcpListener) -> Result<()> {
        self.serve_with_shutdown(listener, CancellationToken::new())
            .await
    }

    /// Serve until `shutdown` fires, then close every open connection
    pub async fn serve_with_shutdown(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        info!(
            "Replica RPC server started, node_id={}, addr={}",
            self.config.node_id,
            listener.local_addr()?
        );

        let handler = ReplicaHandler {
            node_id: Arc::from(self.config.node_id.as_str()),
            shards: self.shards,
        };

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, remote)) => {
                    debug!("Accepted connection from {}", remote);
                    let handler = handler.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = shutdown.cancelled() => {}
                            _ = Self::handle_connection(handler, stream) => {}
                        }
                        debug!("Connection from {} closed", remote);
                    });
                }
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                }
            }
        }

        info!("Replica RPC server stopped, node_id={}", self.config.node_id);
        Ok(())
    }

    async fn handle_connection(handler: ReplicaHandler, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }

        let transport = tarpc::serde_transport::new(
            tokio_util::codec::Framed::new(
                stream,
                tarpc::tokio_util::codec::LengthDelimitedCodec::new(),
            ),
            tarpc::tokio_serde::formats::Bincode::default(),
        );

        BaseChannel::with_defaults(transport)
            .execute(handler.serve())
            .for_each(|response| async move {
                tokio::spawn(response);
            })
            .await;
    }
}

/// Handler that implements the ReplicaRpc service
#[derive(Clone)]
struct ReplicaHandler {
    node_id: Arc<str>,
    shards: Arc<dyn LocalShards>,
}

impl ReplicaRpc for ReplicaHandler {
    async fn search_shard(
        self,
        _ctx: Context,
        collection: String,
        shard_id: ShardId,
        request: ShardSearchRequest,
    ) -> std::result::Result<Vec<ScoredPoint>, ClusterError> {
        let timer = RpcHandlerTimer::new("search_shard");
        match self.shards.search(&collection, shard_id, &request).await {
            Ok(points) => {
                timer.success();
                Ok(points)
            }
            Err(e) => {
                debug!(
                    "search_shard failed for {}/{}: {}",
                    collection, shard_id, e
                );
                timer.error(e.error_type());
                Err(e)
            }
        }
    }

    async fn local_shards(self, _ctx: Context) -> Vec<(String, ShardId)> {
        let timer = RpcHandlerTimer::new("local_shards");
        let shards = self.shards.local_shards();
        timer.success();
        shards
    }

    async fn ping(self, _ctx: Context) -> String {
        self.node_id.to_string()
    }
}
