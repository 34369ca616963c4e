//! Cluster topology: peers, their reachability and collection shard layouts
//!
//! `ClusterState` is the cluster layer's view that the read path consumes
//! through [`ShardDirectory`]. The read path only takes snapshots; the
//! health checker and the replica client are the only writers of peer
//! reachability.

use crate::error::{ClusterError, Result};
use crate::types::{
    CollectionMeta, PeerId, ReplicaDescriptor, ReplicaStatus, ShardDescriptor, ShardId,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Source of shard layouts for the read path
#[async_trait]
pub trait ShardDirectory: Send + Sync {
    /// Snapshot of every shard of a collection with replica liveness
    async fn list_shards(&self, collection: &str) -> Result<Vec<ShardDescriptor>>;

    /// Collection metadata lookup
    async fn collection_meta(&self, collection: &str) -> Result<CollectionMeta>;
}

/// State of a single peer in the cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerState {
    pub node_id: PeerId,
    /// Replica RPC address
    pub address: String,
    /// Is this peer currently reachable
    pub reachable: bool,
    /// Last successful contact (Unix epoch seconds)
    pub last_heartbeat: u64,
    /// Most recent failure, cleared on recovery
    pub last_error: Option<String>,
}

impl PeerState {
    fn new(node_id: PeerId, address: String) -> Self {
        Self {
            node_id,
            address,
            reachable: true,
            last_heartbeat: now_secs(),
            last_error: None,
        }
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Replica placement of one shard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardLayout {
    pub shard_id: ShardId,
    pub replicas: Vec<PeerId>,
}

/// Metadata and shard layout of one collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionLayout {
    pub meta: CollectionMeta,
    pub shards: Vec<ShardLayout>,
}

/// Point-in-time copy of the cluster state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStateSnapshot {
    pub local_node: PeerId,
    pub epoch: u64,
    pub peers: BTreeMap<PeerId, PeerState>,
    pub collections: BTreeMap<String, CollectionLayout>,
}

/// Cluster-wide state tracking peers and collection layouts
#[derive(Debug)]
pub struct ClusterState {
    local_node: PeerId,
    peers: RwLock<HashMap<PeerId, PeerState>>,
    collections: RwLock<HashMap<String, CollectionLayout>>,
    /// Bumped on every layout or reachability change
    epoch: RwLock<u64>,
}

impl ClusterState {
    /// Create a cluster state for the given local node
    pub fn new(local_node: impl Into<PeerId>, local_address: impl Into<String>) -> Self {
        let local_node = local_node.into();
        let mut peers = HashMap::new();
        peers.insert(
            local_node.clone(),
            PeerState::new(local_node.clone(), local_address.into()),
        );
        Self {
            local_node,
            peers: RwLock::new(peers),
            collections: RwLock::new(HashMap::new()),
            epoch: RwLock::new(0),
        }
    }

    pub fn local_node(&self) -> &str {
        &self.local_node
    }

    /// Get current epoch
    pub fn epoch(&self) -> u64 {
        *self.epoch.read()
    }

    fn next_epoch(&self) -> u64 {
        let mut epoch = self.epoch.write();
        *epoch += 1;
        *epoch
    }

    // ========================================
    // Peer Management
    // ========================================

    /// Register a remote peer
    pub fn register_peer(&self, node_id: impl Into<PeerId>, address: impl Into<String>) {
        let node_id = node_id.into();
        self.peers
            .write()
            .insert(node_id.clone(), PeerState::new(node_id, address.into()));
        self.next_epoch();
    }

    /// Record a successful contact with a peer
    pub fn update_heartbeat(&self, node_id: &str) -> bool {
        let changed = match self.peers.write().get_mut(node_id) {
            Some(peer) => {
                let changed = !peer.reachable;
                peer.reachable = true;
                peer.last_heartbeat = now_secs();
                peer.last_error = None;
                changed
            }
            None => return false,
        };
        if changed {
            self.next_epoch();
        }
        true
    }

    /// Mark a peer as unreachable
    pub fn mark_unreachable(&self, node_id: &str, reason: impl Into<String>) {
        if node_id == self.local_node {
            return;
        }
        let changed = match self.peers.write().get_mut(node_id) {
            Some(peer) => {
                let changed = peer.reachable;
                peer.reachable = false;
                peer.last_error = Some(reason.into());
                changed
            }
            None => false,
        };
        if changed {
            self.next_epoch();
        }
    }

    pub fn is_reachable(&self, node_id: &str) -> bool {
        self.peers
            .read()
            .get(node_id)
            .map(|p| p.reachable)
            .unwrap_or(false)
    }

    /// Replica RPC address of a peer
    pub fn peer_address(&self, node_id: &str) -> Option<String> {
        self.peers.read().get(node_id).map(|p| p.address.clone())
    }

    /// All peers except the local node
    pub fn remote_peers(&self) -> Vec<PeerState> {
        let mut peers: Vec<PeerState> = self
            .peers
            .read()
            .values()
            .filter(|p| p.node_id != self.local_node)
            .cloned()
            .collect();
        peers.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        peers
    }

    // ========================================
    // Collection Layouts
    // ========================================

    /// Register a collection and its shard layout
    pub fn register_collection(&self, meta: CollectionMeta, shards: Vec<ShardLayout>) -> Result<()> {
        if shards.is_empty() {
            return Err(ClusterError::Config(format!(
                "collection '{}' has no shards",
                meta.name
            )));
        }

        let mut seen = HashSet::new();
        {
            let peers = self.peers.read();
            for shard in &shards {
                if !seen.insert(shard.shard_id) {
                    return Err(ClusterError::Config(format!(
                        "collection '{}' declares shard {} twice",
                        meta.name, shard.shard_id
                    )));
                }
                for replica in &shard.replicas {
                    if !peers.contains_key(replica) {
                        return Err(ClusterError::Config(format!(
                            "shard {} of '{}' references unknown peer '{}'",
                            shard.shard_id, meta.name, replica
                        )));
                    }
                }
            }
        }

        let mut shards = shards;
        shards.sort_by_key(|s| s.shard_id);
        self.collections
            .write()
            .insert(meta.name.clone(), CollectionLayout { meta, shards });
        self.next_epoch();
        Ok(())
    }

    pub fn collection(&self, name: &str) -> Option<CollectionLayout> {
        self.collections.read().get(name).cloned()
    }

    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Shards of a collection with a replica on the local node
    pub fn local_shards(&self, collection: &str) -> Vec<ShardId> {
        self.collections
            .read()
            .get(collection)
            .map(|c| {
                c.shards
                    .iter()
                    .filter(|s| s.replicas.iter().any(|r| *r == self.local_node))
                    .map(|s| s.shard_id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Shard descriptors with replica liveness as of now
    pub fn shard_descriptors(&self, collection: &str) -> Result<Vec<ShardDescriptor>> {
        let layout = self
            .collection(collection)
            .ok_or_else(|| ClusterError::CollectionNotFound(collection.to_string()))?;
        let peers = self.peers.read();

        Ok(layout
            .shards
            .iter()
            .map(|shard| ShardDescriptor {
                shard_id: shard.shard_id,
                replication_factor: layout.meta.replication_factor,
                replicas: shard
                    .replicas
                    .iter()
                    .map(|peer_id| ReplicaDescriptor {
                        peer_id: peer_id.clone(),
                        status: match peers.get(peer_id) {
                            Some(p) if p.reachable => ReplicaStatus::Reachable,
                            _ => ReplicaStatus::Unreachable,
                        },
                    })
                    .collect(),
            })
            .collect())
    }

    /// Point-in-time copy for diagnostics
    pub fn snapshot(&self) -> ClusterStateSnapshot {
        ClusterStateSnapshot {
            local_node: self.local_node.clone(),
            epoch: self.epoch(),
            peers: self
                .peers
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            collections: self
                .collections
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

#[async_trait]
impl ShardDirectory for ClusterState {
    async fn list_shards(&self, collection: &str) -> Result<Vec<ShardDescriptor>> {
        self.shard_descriptors(collection)
    }

    async fn collection_meta(&self, collection: &str) -> Result<CollectionMeta> {
        self.collection(collection)
            .map(|c| c.meta)
            .ok_or_else(|| ClusterError::CollectionNotFound(collection.to_string()))
    }
}
