//! In-memory shard replicas
//!
//! Every replica hosted by this peer is a map of point id to vector. Search
//! is a brute-force scan. Writes go straight to the addressed replica with no
//! routing and no replication, so two replicas of the same shard, or two
//! shards, can hold different data for one point id.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use vela_cluster::error::Result;
use vela_cluster::{
    ClusterError, ClusterState, CollectionMeta, Distance, LocalShards, PointId, ScoredPoint,
    ShardId, ShardSearchRequest,
};

/// A point as written by a client
#[derive(Debug, Clone, PartialEq)]
pub struct PointWrite {
    pub id: PointId,
    pub vector: Vec<f32>,
    /// Explicit version; assigned from the store clock when absent
    pub version: Option<u64>,
}

#[derive(Debug, Clone)]
struct StoredPoint {
    vector: Vec<f32>,
    version: u64,
}

struct Replica {
    meta: CollectionMeta,
    points: HashMap<PointId, StoredPoint>,
}

pub struct MemoryShards {
    replicas: RwLock<HashMap<(String, ShardId), Replica>>,
    last_version: Mutex<u64>,
}

impl Default for MemoryShards {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryShards {
    pub fn new() -> Self {
        Self {
            replicas: RwLock::new(HashMap::new()),
            last_version: Mutex::new(0),
        }
    }

    /// Empty replicas for every shard the cluster layout assigns to the local node
    pub fn for_local_node(state: &ClusterState) -> Self {
        let shards = Self::new();
        for name in state.collection_names() {
            if let Some(layout) = state.collection(&name) {
                for shard_id in state.local_shards(&name) {
                    shards.host(layout.meta.clone(), shard_id);
                }
            }
        }
        shards
    }

    /// Start hosting an empty replica. Existing data is kept.
    pub fn host(&self, meta: CollectionMeta, shard_id: ShardId) {
        self.replicas
            .write()
            .entry((meta.name.clone(), shard_id))
            .or_insert_with(|| Replica {
                meta,
                points: HashMap::new(),
            });
    }

    pub fn hosts(&self, collection: &str, shard_id: ShardId) -> bool {
        self.replicas
            .read()
            .contains_key(&(collection.to_string(), shard_id))
    }

    /// Number of points in one local replica
    pub fn point_count(&self, collection: &str, shard_id: ShardId) -> Option<usize> {
        self.replicas
            .read()
            .get(&(collection.to_string(), shard_id))
            .map(|r| r.points.len())
    }

    /// Write points into the local replica of `shard_id`, returns the number written
    pub fn upsert(
        &self,
        collection: &str,
        shard_id: ShardId,
        points: Vec<PointWrite>,
    ) -> Result<usize> {
        let mut replicas = self.replicas.write();
        let replica = replicas
            .get_mut(&(collection.to_string(), shard_id))
            .ok_or_else(|| not_hosted(collection, shard_id))?;

        for point in &points {
            check_vector(&replica.meta, &point.vector)?;
        }

        let count = points.len();
        for point in points {
            let version = match point.version {
                Some(v) => {
                    self.observe_version(v);
                    v
                }
                None => self.next_version(),
            };
            replica.points.insert(
                point.id,
                StoredPoint {
                    vector: point.vector,
                    version,
                },
            );
        }

        metrics::counter!("vela_points_upserted_total", "collection" => collection.to_string())
            .increment(count as u64);
        Ok(count)
    }

    /// Strictly increasing, anchored to wall-clock microseconds
    fn next_version(&self) -> u64 {
        let now = chrono::Utc::now().timestamp_micros().max(0) as u64;
        let mut last = self.last_version.lock();
        *last = (*last + 1).max(now);
        *last
    }

    fn observe_version(&self, version: u64) {
        let mut last = self.last_version.lock();
        *last = (*last).max(version);
    }
}

fn not_hosted(collection: &str, shard_id: ShardId) -> ClusterError {
    ClusterError::CollectionNotFound(format!(
        "{} (shard {} is not hosted on this peer)",
        collection, shard_id
    ))
}

fn check_vector(meta: &CollectionMeta, vector: &[f32]) -> Result<()> {
    if vector.len() != meta.vector_size {
        return Err(ClusterError::InvalidQuery(format!(
            "wrong vector dimension for '{}': expected {}, got {}",
            meta.name,
            meta.vector_size,
            vector.len()
        )));
    }
    if vector.iter().any(|x| !x.is_finite()) {
        return Err(ClusterError::InvalidQuery(
            "vector contains non-finite values".to_string(),
        ));
    }
    Ok(())
}

fn score(distance: Distance, query: &[f32], vector: &[f32]) -> f32 {
    let dot = || query.iter().zip(vector).map(|(a, b)| a * b).sum::<f32>();
    match distance {
        Distance::Dot => dot(),
        Distance::Cosine => {
            let norm = |v: &[f32]| v.iter().map(|x| x * x).sum::<f32>().sqrt();
            let denom = norm(query) * norm(vector);
            if denom == 0.0 {
                0.0
            } else {
                dot() / denom
            }
        }
        // Higher is better everywhere on the read path
        Distance::Euclid => -query
            .iter()
            .zip(vector)
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt(),
    }
}

#[async_trait]
impl LocalShards for MemoryShards {
    async fn search(
        &self,
        collection: &str,
        shard_id: ShardId,
        request: &ShardSearchRequest,
    ) -> Result<Vec<ScoredPoint>> {
        if request.filter.is_some() {
            return Err(ClusterError::InvalidQuery(
                "filters are not supported by the in-memory store".to_string(),
            ));
        }

        let replicas = self.replicas.read();
        let replica = replicas
            .get(&(collection.to_string(), shard_id))
            .ok_or_else(|| not_hosted(collection, shard_id))?;
        check_vector(&replica.meta, &request.vector)?;

        let mut results: Vec<ScoredPoint> = replica
            .points
            .iter()
            .map(|(id, point)| {
                ScoredPoint::new(
                    *id,
                    score(replica.meta.distance, &request.vector, &point.vector),
                    point.version,
                )
            })
            .filter(|p| request.score_threshold.map_or(true, |t| p.score >= t))
            .collect();

        results.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        results.truncate(request.limit);
        Ok(results)
    }

    fn local_shards(&self) -> Vec<(String, ShardId)> {
        let mut shards: Vec<_> = self.replicas.read().keys().cloned().collect();
        shards.sort();
        shards
    }
}
