//! End-to-end HTTP tests against three in-process peers
//!
//! Every peer runs its own HTTP API and replica RPC server on random local
//! ports. Points are written straight into individual shard replicas, then
//! read back through the distributed search endpoint.

use metrics_exporter_prometheus::PrometheusBuilder;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;
use tokio::net::TcpListener;
use vela_cluster::{ClusterConfig, Distance, PeerConfig, ReadConfig};
use vela_server::config::{CollectionConfig, ShardConfig};
use vela_server::{Config, Node, RunningNode};

const LAYOUT: [(u32, [usize; 2]); 3] = [(0, [0, 1]), (1, [1, 2]), (2, [2, 0])];

/// Point 42 lands on every shard with a different vector
const DIVERGENT: [[f32; 4]; 3] = [
    [0.1, 0.2, 0.3, 0.4],
    [0.4, 0.3, 0.2, 0.1],
    [0.9, 0.8, 0.7, 0.6],
];

const QUERY: [f32; 4] = [0.9, 0.8, 0.7, 0.6];

struct TestCluster {
    nodes: Vec<RunningNode>,
    client: Client,
}

impl TestCluster {
    fn url(&self, peer: usize, path: &str) -> String {
        format!("http://{}{}", self.nodes[peer].http_addr(), path)
    }

    async fn put_points(
        &self,
        peer: usize,
        collection: &str,
        shard_id: u32,
        points: Value,
    ) -> (StatusCode, Value) {
        let response = self
            .client
            .put(self.url(
                peer,
                &format!("/collections/{}/shards/{}/points", collection, shard_id),
            ))
            .json(&json!({ "points": points }))
            .send()
            .await
            .unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }

    async fn search(
        &self,
        peer: usize,
        collection: &str,
        query: &str,
        body: Value,
    ) -> (StatusCode, Value) {
        let response = self
            .client
            .post(self.url(
                peer,
                &format!("/collections/{}/points/search{}", collection, query),
            ))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }

    async fn get(&self, peer: usize, path: &str) -> (StatusCode, String) {
        let response = self.client.get(self.url(peer, path)).send().await.unwrap();
        let status = response.status();
        (status, response.text().await.unwrap())
    }
}

fn peer_name(peer: usize) -> String {
    format!("peer-{}", peer)
}

fn config_for(peer: usize, rpc_addrs: &[String]) -> Config {
    let peers = (0..rpc_addrs.len())
        .filter(|p| *p != peer)
        .map(|p| PeerConfig {
            node_id: peer_name(p),
            address: rpc_addrs[p].clone(),
        })
        .collect();

    let points = CollectionConfig {
        name: "points".to_string(),
        vector_size: 4,
        distance: Distance::Dot,
        replication_factor: 2,
        shards: LAYOUT
            .iter()
            .map(|(shard_id, replicas)| ShardConfig {
                shard_id: *shard_id,
                replicas: replicas.iter().map(|r| peer_name(*r)).collect(),
            })
            .collect(),
    };
    // Single shard on peer-0 and peer-1 only
    let versions = CollectionConfig {
        name: "versions".to_string(),
        vector_size: 4,
        distance: Distance::Dot,
        replication_factor: 2,
        shards: vec![ShardConfig {
            shard_id: 0,
            replicas: vec![peer_name(0), peer_name(1)],
        }],
    };

    let config = Config {
        cluster: ClusterConfig {
            node_id: peer_name(peer),
            bind_addr: rpc_addrs[peer].clone(),
            peers,
            connect_timeout_ms: 500,
            request_timeout_ms: 2000,
            heartbeat_interval_ms: 100,
        },
        read: ReadConfig {
            query_timeout_ms: 5000,
            shard_timeout_ms: 2000,
            ..Default::default()
        },
        collections: vec![points, versions],
        ..Default::default()
    };
    config.validate().unwrap();
    config
}

async fn start_cluster() -> TestCluster {
    let mut http = Vec::new();
    let mut rpc = Vec::new();
    for _ in 0..3 {
        http.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
        rpc.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
    }
    let rpc_addrs: Vec<String> = rpc
        .iter()
        .map(|l| l.local_addr().unwrap().to_string())
        .collect();

    let mut nodes = Vec::new();
    for (peer, (http, rpc)) in http.into_iter().zip(rpc).enumerate() {
        let node = Node::new(config_for(peer, &rpc_addrs)).unwrap();
        let prometheus = PrometheusBuilder::new().build_recorder().handle();
        nodes.push(node.start(http, rpc, Some(prometheus)).unwrap());
    }

    // Give the servers a moment to start
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestCluster {
        nodes,
        client: Client::new(),
    }
}

/// Noise points `100 + i` with vector `[i / 10; 4]` spread by `i % 3`, plus the
/// divergent point 42, written to both replicas of every shard
async fn write_divergent_points(cluster: &TestCluster) {
    for (shard_id, replicas) in LAYOUT {
        let mut points: Vec<Value> = (0..10u64)
            .filter(|i| i % 3 == shard_id as u64)
            .map(|i| json!({ "id": 100 + i, "vector": vec![i as f32 / 10.0; 4] }))
            .collect();
        points.push(json!({ "id": 42, "vector": DIVERGENT[shard_id as usize] }));

        for peer in replicas {
            let (status, body) = cluster
                .put_points(peer, "points", shard_id, Value::Array(points.clone()))
                .await;
            assert_eq!(status, StatusCode::OK, "{}", body);
            assert_eq!(body["result"]["upserted"], json!(points.len()));
        }
    }
}

fn result_ids(body: &Value) -> Vec<u64> {
    body["result"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["id"].as_u64().unwrap())
        .collect()
}

fn result_scores(body: &Value) -> Vec<f64> {
    body["result"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["score"].as_f64().unwrap())
        .collect()
}

#[tokio::test]
async fn test_divergent_point_returned_once_at_every_level() {
    let cluster = start_cluster().await;
    write_divergent_points(&cluster).await;

    for level in ["all", "majority", "quorum", "none", "1", "2"] {
        let (status, body) = cluster
            .search(
                0,
                "points",
                &format!("?consistency={}", level),
                json!({ "vector": QUERY, "limit": 5, "with_payload": true }),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "level {}: {}", level, body);

        let ids = result_ids(&body);
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len(), "level {}: duplicate ids", level);
        assert_eq!(ids, vec![109, 108, 42, 107, 106], "level {}", level);

        let scores = result_scores(&body);
        assert!(scores.windows(2).all(|w| w[0] >= w[1]), "level {}", level);
        assert!((scores[2] - 2.3).abs() < 1e-4, "level {}", level);

        assert_eq!(body["status"], "ok");
        assert_eq!(body["read"]["consistency"], level);
        assert_eq!(body["read"]["shards"].as_array().unwrap().len(), 3);
    }

    // Draining every shard surfaces the two shadowed copies of 42
    let (status, body) = cluster
        .search(
            0,
            "points",
            "?consistency=all",
            json!({ "vector": QUERY, "limit": 20 }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result_ids(&body).len(), 11);
    assert_eq!(body["read"]["duplicates_suppressed"], json!(2));

    cluster.nodes.iter().for_each(|n| n.shutdown());
}

#[tokio::test]
async fn test_any_peer_can_coordinate() {
    let cluster = start_cluster().await;
    write_divergent_points(&cluster).await;

    for peer in 0..3 {
        let (status, body) = cluster
            .search(
                peer,
                "points",
                "?consistency=majority",
                json!({ "vector": QUERY, "limit": 3 }),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(result_ids(&body), vec![109, 108, 42], "coordinator peer-{}", peer);

        let shards = body["read"]["shards"].as_array().unwrap();
        assert!(shards
            .iter()
            .all(|s| s["responded"].as_array().unwrap().len() == 2));
    }

    cluster.nodes.iter().for_each(|n| n.shutdown());
}

#[tokio::test]
async fn test_offset_pages_do_not_repeat_ids() {
    let cluster = start_cluster().await;
    write_divergent_points(&cluster).await;

    let (_, first) = cluster
        .search(
            1,
            "points",
            "?consistency=all",
            json!({ "vector": QUERY, "limit": 3 }),
        )
        .await;
    let (_, second) = cluster
        .search(
            1,
            "points",
            "?consistency=all",
            json!({ "vector": QUERY, "limit": 3, "offset": 3 }),
        )
        .await;

    assert_eq!(result_ids(&first), vec![109, 108, 42]);
    assert_eq!(result_ids(&second), vec![107, 106, 105]);

    cluster.nodes.iter().for_each(|n| n.shutdown());
}

#[tokio::test]
async fn test_newest_version_wins_between_replicas() {
    let cluster = start_cluster().await;

    let (status, _) = cluster
        .put_points(
            0,
            "versions",
            0,
            json!([{ "id": 7, "vector": [1.0, 0.0, 0.0, 0.0], "version": 5 }]),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = cluster
        .put_points(
            1,
            "versions",
            0,
            json!([{ "id": 7, "vector": [0.0, 1.0, 0.0, 0.0], "version": 9 }]),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    // peer-2 hosts no replica, both calls go over RPC
    for level in ["all", "majority", "2"] {
        let (status, body) = cluster
            .search(
                2,
                "versions",
                &format!("?consistency={}", level),
                json!({ "vector": [1.0, 0.0, 0.0, 0.0], "limit": 1 }),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["result"][0]["id"], json!(7));
        assert_eq!(body["result"][0]["version"], json!(9));
        assert_eq!(body["result"][0]["score"].as_f64().unwrap(), 0.0);
        assert_eq!(body["read"]["shards"][0]["conflicts"], json!(1));
    }

    cluster.nodes.iter().for_each(|n| n.shutdown());
}

#[tokio::test]
async fn test_error_status_mapping() {
    let cluster = start_cluster().await;
    let query = json!({ "vector": QUERY, "limit": 5 });

    let (status, body) = cluster
        .search(0, "points", "?consistency=most", query.clone())
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"]["kind"], "invalid_consistency");
    assert!(body["time"].is_number());

    let (status, body) = cluster
        .search(0, "points", "?consistency=0", query.clone())
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"]["kind"], "invalid_consistency");

    let (status, body) = cluster.search(0, "missing", "", query.clone()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"]["kind"], "collection_not_found");

    let (status, body) = cluster
        .search(0, "points", "?consistency=all", json!({ "vector": [1.0, 2.0], "limit": 5 }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"]["kind"], "invalid_query");

    // peer-0 hosts shards 0 and 2 only
    let (status, body) = cluster
        .put_points(0, "points", 1, json!([{ "id": 1, "vector": [0.0, 0.0, 0.0, 0.0] }]))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"]["kind"], "collection_not_found");

    cluster.nodes.iter().for_each(|n| n.shutdown());
}

#[tokio::test]
async fn test_oversized_limit_and_timeout_rejected() {
    let cluster = start_cluster().await;
    write_divergent_points(&cluster).await;

    for limit in [u64::MAX, 1u64 << 40] {
        let (status, body) = cluster
            .search(0, "points", "", json!({ "vector": QUERY, "limit": limit }))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"]["kind"], "invalid_query");
    }

    let (status, body) = cluster
        .search(
            0,
            "points",
            &format!("?timeout={}", u64::MAX),
            json!({ "vector": QUERY, "limit": 5 }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"]["kind"], "invalid_query");

    // The peer keeps serving afterwards
    let (status, body) = cluster
        .search(0, "points", "", json!({ "vector": QUERY, "limit": 3 }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"].as_array().unwrap().len(), 3);

    cluster.nodes.iter().for_each(|n| n.shutdown());
}

#[tokio::test]
async fn test_dead_peer_degrades_all_and_fails_majority() {
    let mut cluster = start_cluster().await;
    write_divergent_points(&cluster).await;

    let dead = cluster.nodes.remove(2);
    dead.shutdown();
    dead.wait().await;

    // Wait for peer-0's health checker to notice
    let mut unreachable = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let (_, body) = cluster.get(0, "/cluster").await;
        let body: Value = serde_json::from_str(&body).unwrap();
        if body["result"]["peers"]["peer-2"]["reachable"] == json!(false) {
            unreachable = true;
            break;
        }
    }
    assert!(unreachable, "peer-2 never marked unreachable");

    let query = json!({ "vector": QUERY, "limit": 5 });
    let (status, body) = cluster
        .search(0, "points", "?consistency=all", query.clone())
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(result_ids(&body), vec![109, 108, 42, 107, 106]);
    let degraded: Vec<&Value> = body["read"]["shards"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|s| !s["degraded"].as_array().unwrap().is_empty())
        .collect();
    assert_eq!(degraded.len(), 2);

    let (status, body) = cluster
        .search(0, "points", "?consistency=majority", query)
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "{}", body);
    assert_eq!(body["status"]["kind"], "insufficient_replicas");

    cluster.nodes.iter().for_each(|n| n.shutdown());
}

#[tokio::test]
async fn test_info_endpoints() {
    let cluster = start_cluster().await;
    write_divergent_points(&cluster).await;

    let (status, body) = cluster.get(0, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_str::<Value>(&body).unwrap()["status"], "ok");

    let (status, body) = cluster.get(0, "/collections/points").await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["result"]["config"]["vector_size"], json!(4));
    assert_eq!(body["result"]["shards"].as_array().unwrap().len(), 3);
    // Shard 0 holds ids 100, 103, 106, 109 and 42
    assert_eq!(
        body["result"]["local_shards"],
        json!([
            { "shard_id": 0, "points_count": 5 },
            { "shard_id": 2, "points_count": 4 },
        ])
    );

    let (status, body) = cluster.get(1, "/cluster").await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["result"]["peer_id"], "peer-1");
    assert_eq!(body["result"]["peers"].as_object().unwrap().len(), 3);

    let (status, _) = cluster.get(2, "/metrics").await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = cluster.get(0, "/collections/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    cluster.nodes.iter().for_each(|n| n.shutdown());
}
