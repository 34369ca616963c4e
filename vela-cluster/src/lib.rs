//! Vela Cluster - consistency-aware distributed reads for sharded, replicated vector search
//!
//! A collection is split into shards and every shard is replicated on several
//! peers. A read fans out to every shard, waits for as many replicas per shard
//! as the requested consistency level demands, settles replica disagreement by
//! version and merges the shards into one deduplicated top-K.
//!
//! # Architecture
//!
//! - **Consistency**: resolves `all` / `majority` / `quorum` / `none` / `N` into required acknowledgements
//! - **Read**: planning, per-shard scatter, replica reconciliation, global k-way merge
//! - **Topology**: peers, reachability and shard layouts consumed through `ShardDirectory`
//! - **Service**: tarpc replica RPC definition
//! - **Server**: serves local replicas over TCP
//! - **Client**: connection-pooled replica client, local replicas searched in-process
//! - **Health**: periodic peer pings driving reachability
//!
//! # Key Operations
//!
//! - `ReadCoordinator::search`: distributed top-K search at a chosen consistency level
//! - `consistency::resolve`: consistency level to per-shard read quorum
//! - `ResultMerger::merge`: k-way merge with first-seen-wins deduplication
//! - `read::reconcile`: version-based reconciliation of one shard's replicas

pub mod config;
pub mod consistency;
pub mod error;
pub mod health;
pub mod metrics;
pub mod read;
pub mod service;
pub mod topology;
pub mod types;

mod client;
mod server;

pub use client::{ClusterClient, ReplicaClient};
pub use config::{ClusterConfig, PeerConfig, ReadConfig};
pub use consistency::{ConflictPolicy, ConsistencyLevel, ReadQuorum};
pub use error::ClusterError;
pub use health::HealthChecker;
pub use read::{QueryPlan, QueryState, ReadCoordinator, ResultMerger, ScatterExecutor, ShardPlan};
pub use server::{ClusterServer, LocalShards};
pub use service::ReplicaRpcClient;
pub use topology::{
    ClusterState, ClusterStateSnapshot, CollectionLayout, PeerState, ShardDirectory, ShardLayout,
};
pub use types::*;

/// Cancellation handle accepted by [`ReadCoordinator::search_with_cancel`]
pub use tokio_util::sync::CancellationToken;
