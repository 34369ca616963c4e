//! Server configuration loaded from TOML

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use vela_cluster::consistency;
use vela_cluster::{
    ClusterConfig, ClusterState, CollectionMeta, Distance, ReadConfig, ShardId, ShardLayout,
};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub read: ReadConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub collections: Vec<CollectionConfig>,
}

/// HTTP listener settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "127.0.0.1:6333".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Emit JSON log lines instead of the human readable format
    #[serde(default)]
    pub json: bool,
}

/// A collection and the placement of its shard replicas
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CollectionConfig {
    pub name: String,
    pub vector_size: usize,
    #[serde(default)]
    pub distance: Distance,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,
    pub shards: Vec<ShardConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShardConfig {
    pub shard_id: ShardId,
    pub replicas: Vec<String>,
}

fn default_replication_factor() -> usize {
    1
}

impl CollectionConfig {
    pub fn meta(&self) -> CollectionMeta {
        CollectionMeta {
            name: self.name.clone(),
            vector_size: self.vector_size,
            distance: self.distance,
            shard_count: self.shards.len(),
            replication_factor: self.replication_factor,
        }
    }

    pub fn layout(&self) -> Vec<ShardLayout> {
        self.shards
            .iter()
            .map(|s| ShardLayout {
                shard_id: s.shard_id,
                replicas: s.replicas.clone(),
            })
            .collect()
    }
}

impl Config {
    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut peers = HashSet::new();
        peers.insert(self.cluster.node_id.as_str());
        for peer in &self.cluster.peers {
            if !peers.insert(peer.node_id.as_str()) {
                bail!("peer '{}' is declared twice", peer.node_id);
            }
        }

        consistency::resolve(self.read.default_consistency, 1)
            .context("invalid default consistency")?;
        if self.read.max_concurrent_requests == 0 {
            bail!("read.max_concurrent_requests must be at least 1");
        }

        let mut names = HashSet::new();
        for collection in &self.collections {
            if !names.insert(collection.name.as_str()) {
                bail!("collection '{}' is declared twice", collection.name);
            }
            if collection.vector_size == 0 {
                bail!("collection '{}' has a zero vector size", collection.name);
            }
            if collection.replication_factor == 0 {
                bail!(
                    "collection '{}' has a zero replication factor",
                    collection.name
                );
            }
            if collection.shards.is_empty() {
                bail!("collection '{}' has no shards", collection.name);
            }

            let mut shard_ids = HashSet::new();
            for shard in &collection.shards {
                if !shard_ids.insert(shard.shard_id) {
                    bail!(
                        "collection '{}' declares shard {} twice",
                        collection.name,
                        shard.shard_id
                    );
                }
                if shard.replicas.len() != collection.replication_factor {
                    bail!(
                        "shard {} of '{}' has {} replicas, replication factor is {}",
                        shard.shard_id,
                        collection.name,
                        shard.replicas.len(),
                        collection.replication_factor
                    );
                }
                let mut replicas = HashSet::new();
                for replica in &shard.replicas {
                    if !peers.contains(replica.as_str()) {
                        bail!(
                            "shard {} of '{}' references unknown peer '{}'",
                            shard.shard_id,
                            collection.name,
                            replica
                        );
                    }
                    if !replicas.insert(replica.as_str()) {
                        bail!(
                            "shard {} of '{}' lists peer '{}' twice",
                            shard.shard_id,
                            collection.name,
                            replica
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Cluster state with every configured peer and collection registered
    pub fn cluster_state(&self) -> Result<ClusterState> {
        let state = ClusterState::new(self.cluster.node_id.clone(), self.cluster.bind_addr.clone());
        for peer in &self.cluster.peers {
            state.register_peer(peer.node_id.clone(), peer.address.clone());
        }
        for collection in &self.collections {
            state.register_collection(collection.meta(), collection.layout())?;
        }
        Ok(state)
    }
}
