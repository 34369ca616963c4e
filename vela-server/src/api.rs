//! HTTP API
//!
//! Responses follow the `{"result": ..., "status": "ok", "time": <secs>}`
//! envelope. Failures carry `{"status": {"error", "kind"}, "time"}` with the
//! status code picked by [`status_code`].

use crate::storage::{MemoryShards, PointWrite};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::trace::TraceLayer;
use vela_cluster::{
    ClusterError, ClusterState, ConsistencyLevel, PointId, ReadCoordinator, ReadStatus,
    ScoredPoint, SearchRequest, ShardId,
};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<ReadCoordinator>,
    pub cluster_state: Arc<ClusterState>,
    pub shards: Arc<MemoryShards>,
    pub prometheus: Option<PrometheusHandle>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/cluster", get(cluster_info))
        .route("/collections/:collection", get(collection_info))
        .route("/collections/:collection/points/search", post(search_points))
        .route(
            "/collections/:collection/shards/:shard_id/points",
            put(upsert_points),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Point id as it appears in JSON: an unsigned integer or a UUID string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ApiPointId {
    Num(u64),
    Uuid(uuid::Uuid),
}

impl From<ApiPointId> for PointId {
    fn from(id: ApiPointId) -> Self {
        match id {
            ApiPointId::Num(n) => PointId::Num(n),
            ApiPointId::Uuid(u) => PointId::Uuid(u),
        }
    }
}

impl From<PointId> for ApiPointId {
    fn from(id: PointId) -> Self {
        match id {
            PointId::Num(n) => ApiPointId::Num(n),
            PointId::Uuid(u) => ApiPointId::Uuid(u),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchBody {
    pub vector: Vec<f32>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub filter: Option<serde_json::Value>,
    #[serde(default)]
    pub score_threshold: Option<f32>,
    /// Accepted for client compatibility, payloads are not stored
    #[serde(default)]
    pub with_payload: Option<serde_json::Value>,
    #[serde(default)]
    pub with_vector: Option<serde_json::Value>,
}

fn default_limit() -> usize {
    10
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    /// `all`, `majority`, `quorum`, `none` or a positive integer
    pub consistency: Option<String>,
    /// Query timeout in seconds
    pub timeout: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiScoredPoint {
    pub id: ApiPointId,
    pub score: f32,
    pub version: u64,
}

impl From<ScoredPoint> for ApiScoredPoint {
    fn from(point: ScoredPoint) -> Self {
        Self {
            id: point.id.into(),
            score: point.score,
            version: point.version,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SearchResult {
    pub result: Vec<ApiScoredPoint>,
    pub status: &'static str,
    pub time: f64,
    pub read: ReadStatus,
}

#[derive(Debug, Deserialize)]
pub struct UpsertBody {
    pub points: Vec<ApiPoint>,
}

#[derive(Debug, Deserialize)]
pub struct ApiPoint {
    pub id: ApiPointId,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub version: Option<u64>,
}

/// A [`ClusterError`] rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError {
    error: ClusterError,
    time: f64,
}

impl ApiError {
    fn new(error: ClusterError, started: Instant) -> Self {
        Self {
            error,
            time: started.elapsed().as_secs_f64(),
        }
    }
}

pub fn status_code(error: &ClusterError) -> StatusCode {
    match error {
        ClusterError::InvalidConsistency(_) | ClusterError::InvalidQuery(_) => {
            StatusCode::BAD_REQUEST
        }
        ClusterError::CollectionNotFound(_) => StatusCode::NOT_FOUND,
        ClusterError::InsufficientReplicas { .. } | ClusterError::ShardUnavailable { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ClusterError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        ClusterError::Cancelled => StatusCode::REQUEST_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_code(&self.error);
        if status.is_server_error() {
            tracing::warn!("Request failed with {}: {}", status, self.error);
        } else {
            tracing::debug!("Request rejected with {}: {}", status, self.error);
        }

        let body = json!({
            "status": {
                "error": self.error.to_string(),
                "kind": self.error.error_type(),
            },
            "time": self.time,
        });
        (status, Json(body)).into_response()
    }
}

fn ok(result: serde_json::Value, started: Instant) -> Json<serde_json::Value> {
    Json(json!({
        "result": result,
        "status": "ok",
        "time": started.elapsed().as_secs_f64(),
    }))
}

/// POST /collections/:collection/points/search
pub async fn search_points(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Query(params): Query<SearchParams>,
    Json(body): Json<SearchBody>,
) -> Result<Json<SearchResult>, ApiError> {
    let started = Instant::now();

    let consistency = match params.consistency.as_deref() {
        Some(raw) => raw
            .parse::<ConsistencyLevel>()
            .map_err(|e| ApiError::new(e, started))?,
        None => state.coordinator.config().default_consistency,
    };

    let mut request = SearchRequest::new(body.vector, body.limit)
        .with_consistency(consistency)
        .with_offset(body.offset);
    request.filter = body.filter;
    request.score_threshold = body.score_threshold;
    if let Some(secs) = params.timeout {
        request = request.with_timeout(Duration::from_secs(secs));
    }

    let response = state
        .coordinator
        .search(&collection, request)
        .await
        .map_err(|e| ApiError::new(e, started))?;

    Ok(Json(SearchResult {
        result: response.points.into_iter().map(ApiScoredPoint::from).collect(),
        status: "ok",
        time: started.elapsed().as_secs_f64(),
        read: response.status,
    }))
}

/// PUT /collections/:collection/shards/:shard_id/points
///
/// Writes into this peer's replica of the shard only.
pub async fn upsert_points(
    State(state): State<AppState>,
    Path((collection, shard_id)): Path<(String, ShardId)>,
    Json(body): Json<UpsertBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let started = Instant::now();
    let points = body
        .points
        .into_iter()
        .map(|p| PointWrite {
            id: p.id.into(),
            vector: p.vector,
            version: p.version,
        })
        .collect();

    let upserted = state
        .shards
        .upsert(&collection, shard_id, points)
        .map_err(|e| ApiError::new(e, started))?;
    tracing::debug!(
        "Upserted {} points into {}/{}",
        upserted,
        collection,
        shard_id
    );

    Ok(ok(
        json!({ "status": "completed", "upserted": upserted }),
        started,
    ))
}

/// GET /collections/:collection
pub async fn collection_info(
    State(state): State<AppState>,
    Path(collection): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let started = Instant::now();
    let layout = state
        .cluster_state
        .collection(&collection)
        .ok_or_else(|| ApiError::new(ClusterError::CollectionNotFound(collection.clone()), started))?;
    let shards = state
        .cluster_state
        .shard_descriptors(&collection)
        .map_err(|e| ApiError::new(e, started))?;

    let local: Vec<_> = state
        .cluster_state
        .local_shards(&collection)
        .into_iter()
        .map(|shard_id| {
            json!({
                "shard_id": shard_id,
                "points_count": state.shards.point_count(&collection, shard_id).unwrap_or(0),
            })
        })
        .collect();

    Ok(ok(
        json!({
            "config": layout.meta,
            "shards": shards,
            "local_shards": local,
        }),
        started,
    ))
}

/// GET /cluster
pub async fn cluster_info(State(state): State<AppState>) -> Json<serde_json::Value> {
    let started = Instant::now();
    let snapshot = state.cluster_state.snapshot();
    ok(
        json!({
            "peer_id": snapshot.local_node,
            "epoch": snapshot.epoch,
            "peers": snapshot.peers,
        }),
        started,
    )
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// GET /metrics
pub async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
