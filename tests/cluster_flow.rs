//! Repair, trim and integrity flows against in-process mock storage nodes
//!
//! Each mock node is a real axum server on an ephemeral port speaking the
//! chunk contract, so these tests drive the actual outbound client and the
//! repair paths end to end.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{routing, Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chunkmesh::common::{timestamp_now_millis, CoordinatorConfig};
use chunkmesh::coordinator::events::{self, ClusterEvent, Inventory};
use chunkmesh::coordinator::integrity::IntegrityReconciler;
use chunkmesh::coordinator::liveness::{Heartbeat, LivenessTracker, NodeStatus};
use chunkmesh::coordinator::metadata::{ChunkReplica, FileMetadata, MetadataStore};
use chunkmesh::coordinator::node_client::NodeClient;
use chunkmesh::coordinator::replication::ReplicationMonitor;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

// === Mock storage node ===

#[derive(Clone, Default)]
struct NodeDisk {
    chunks: Arc<Mutex<HashMap<(String, u32), Vec<u8>>>>,
}

struct MockNode {
    url: String,
    disk: NodeDisk,
}

impl MockNode {
    fn put(&self, file_id: &str, chunk_index: u32, bytes: &[u8]) {
        self.disk
            .chunks
            .lock()
            .unwrap()
            .insert((file_id.to_string(), chunk_index), bytes.to_vec());
    }

    fn lose(&self, file_id: &str, chunk_index: u32) {
        self.disk
            .chunks
            .lock()
            .unwrap()
            .remove(&(file_id.to_string(), chunk_index));
    }

    fn has(&self, file_id: &str, chunk_index: u32) -> bool {
        self.disk
            .chunks
            .lock()
            .unwrap()
            .contains_key(&(file_id.to_string(), chunk_index))
    }

    fn chunk(&self, file_id: &str, chunk_index: u32) -> Option<Vec<u8>> {
        self.disk
            .chunks
            .lock()
            .unwrap()
            .get(&(file_id.to_string(), chunk_index))
            .cloned()
    }

    fn inventory(&self) -> Inventory {
        let mut inventory: Inventory = HashMap::new();
        for (file_id, chunk_index) in self.disk.chunks.lock().unwrap().keys() {
            inventory
                .entry(file_id.clone())
                .or_default()
                .push(*chunk_index);
        }
        for indices in inventory.values_mut() {
            indices.sort();
        }
        inventory
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChunkQuery {
    file_id: String,
    chunk_index: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteRequest {
    file_id: String,
    chunk_index: u32,
    data: String,
}

async fn node_read(State(disk): State<NodeDisk>, Query(q): Query<ChunkQuery>) -> Response {
    let chunks = disk.chunks.lock().unwrap();
    match chunks.get(&(q.file_id, q.chunk_index)) {
        Some(bytes) => Json(serde_json::json!({
            "data": BASE64.encode(bytes),
            "size": bytes.len(),
        }))
        .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn node_write(State(disk): State<NodeDisk>, Json(req): Json<WriteRequest>) -> Response {
    match BASE64.decode(&req.data) {
        Ok(bytes) => {
            disk.chunks
                .lock()
                .unwrap()
                .insert((req.file_id, req.chunk_index), bytes);
            StatusCode::OK.into_response()
        }
        Err(_) => StatusCode::BAD_REQUEST.into_response(),
    }
}

async fn node_delete(State(disk): State<NodeDisk>, Query(q): Query<ChunkQuery>) -> StatusCode {
    disk.chunks
        .lock()
        .unwrap()
        .remove(&(q.file_id, q.chunk_index));
    StatusCode::OK
}

async fn node_exists(
    State(disk): State<NodeDisk>,
    Query(q): Query<ChunkQuery>,
) -> Json<serde_json::Value> {
    let exists = disk
        .chunks
        .lock()
        .unwrap()
        .contains_key(&(q.file_id, q.chunk_index));
    Json(serde_json::json!({ "exists": exists }))
}

async fn spawn_node() -> MockNode {
    let disk = NodeDisk::default();
    let app = Router::new()
        .route("/chunk/read", routing::get(node_read))
        .route("/chunk/write", routing::post(node_write))
        .route("/chunk/delete", routing::delete(node_delete))
        .route("/chunk/exists", routing::get(node_exists))
        .with_state(disk.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockNode {
        url: format!("http://{}", addr),
        disk,
    }
}

// === Coordinator-side harness ===

struct Cluster {
    store: Arc<MetadataStore>,
    liveness: Arc<LivenessTracker>,
    monitor: Arc<ReplicationMonitor>,
    integrity: Arc<IntegrityReconciler>,
    events_rx: UnboundedReceiver<ClusterEvent>,
    _metadata_dir: TempDir,
}

fn cluster() -> Cluster {
    let metadata_dir = TempDir::new().unwrap();
    let mut config = CoordinatorConfig::default();
    config.metadata_dir = metadata_dir.path().to_path_buf();
    let config = Arc::new(config);

    let (bus, events_rx) = events::channel();
    let store = Arc::new(MetadataStore::open(&config.metadata_dir).unwrap());
    let liveness = Arc::new(LivenessTracker::new(config.heartbeat_timeout(), bus));
    let client = NodeClient::new(Duration::from_secs(2), Duration::from_secs(5));
    let monitor = Arc::new(ReplicationMonitor::new(
        store.clone(),
        liveness.clone(),
        client.clone(),
        config.clone(),
    ));
    let integrity = Arc::new(IntegrityReconciler::new(
        store.clone(),
        liveness.clone(),
        client,
    ));

    Cluster {
        store,
        liveness,
        monitor,
        integrity,
        events_rx,
        _metadata_dir: metadata_dir,
    }
}

fn beat(liveness: &LivenessTracker, url: &str, timestamp: u64, inventory: Option<Inventory>) {
    liveness
        .process_heartbeat(Heartbeat {
            id: format!("id-{}", url),
            url: url.to_string(),
            status: NodeStatus::Up,
            timestamp,
            inventory,
            total_chunks: None,
            storage_used_mb: None,
            free_space_mb: None,
            can_write: None,
        })
        .unwrap();
}

fn replica(chunk_index: u32, node_url: &str, ordinal: u32) -> ChunkReplica {
    ChunkReplica {
        chunk_index,
        node_url: node_url.to_string(),
        replica_ordinal: ordinal,
    }
}

async fn run_tick(monitor: &Arc<ReplicationMonitor>) {
    for task in Arc::clone(monitor).tick().await {
        task.await.unwrap();
    }
}

// === Tests ===

/// A node dies with three chunks at replication factor 3; one tick later
/// every chunk is back at 3 live replicas and the repair time is recorded.
#[tokio::test]
async fn test_repair_restores_replication_after_node_death() {
    let a = spawn_node().await;
    let b = spawn_node().await;
    let c = spawn_node().await;
    let d = spawn_node().await;
    let cluster = cluster();

    let mut file = FileMetadata::new("img1", 70_000);
    for chunk_index in 0..3 {
        file.chunks.push(replica(chunk_index, &a.url, 0));
        file.chunks.push(replica(chunk_index, &b.url, 1));
        file.chunks.push(replica(chunk_index, &c.url, 2));
        let bytes = vec![chunk_index as u8; 64];
        a.put("img1", chunk_index, &bytes);
        b.put("img1", chunk_index, &bytes);
        c.put("img1", chunk_index, &bytes);
    }
    cluster.store.put(file);

    // a has been silent past the timeout, the rest are fresh
    let now = timestamp_now_millis();
    beat(&cluster.liveness, &a.url, now - 32_000, None);
    beat(&cluster.liveness, &b.url, now, None);
    beat(&cluster.liveness, &c.url, now, None);
    beat(&cluster.liveness, &d.url, now, None);
    cluster.liveness.sweep_timeouts(now);
    assert!(!cluster.liveness.is_alive(&a.url));

    run_tick(&cluster.monitor).await;

    // every chunk copied onto d, the only live node that lacked it
    for chunk_index in 0..3 {
        assert!(d.has("img1", chunk_index), "chunk {} not repaired", chunk_index);
        assert_eq!(d.chunk("img1", chunk_index).unwrap(), vec![chunk_index as u8; 64]);
    }

    let file = cluster.store.get("img1").unwrap();
    let live = [b.url.clone(), c.url.clone(), d.url.clone()];
    for chunk_index in 0..3 {
        let live_replicas = file
            .replicas_for(chunk_index)
            .filter(|r| live.contains(&r.node_url))
            .count();
        assert_eq!(live_replicas, 3, "chunk {} not back at factor", chunk_index);
    }

    assert!(cluster.monitor.last_repair_time("img1").is_some());
    let stats = cluster.monitor.stats();
    assert_eq!(stats.total_repairs_completed, 1);
    assert_eq!(stats.total_replicas_created, 3);
    assert_eq!(stats.files_in_repair, 0);
}

/// At most two files enter repair per tick; the worst-off files go first.
#[tokio::test]
async fn test_concurrent_repair_cap() {
    let a = spawn_node().await;
    let b = spawn_node().await;
    let cluster = cluster();

    for i in 0..3 {
        let file_id = format!("img{}", i);
        let mut file = FileMetadata::new(&file_id, 1_000);
        file.chunks.push(replica(0, &a.url, 0));
        a.put(&file_id, 0, b"payload");
        cluster.store.put(file);
    }

    let now = timestamp_now_millis();
    beat(&cluster.liveness, &a.url, now, None);
    beat(&cluster.liveness, &b.url, now, None);

    let tasks = Arc::clone(&cluster.monitor).tick().await;
    assert_eq!(tasks.len(), 2, "repair cap not enforced");
    for task in tasks {
        task.await.unwrap();
    }
}

/// Fewer than two live nodes: the loop does not even scan.
#[tokio::test]
async fn test_tick_skips_with_lone_survivor() {
    let a = spawn_node().await;
    let cluster = cluster();

    let mut file = FileMetadata::new("img1", 1_000);
    file.chunks.push(replica(0, &a.url, 0));
    cluster.store.put(file);

    beat(&cluster.liveness, &a.url, timestamp_now_millis(), None);

    let tasks = Arc::clone(&cluster.monitor).tick().await;
    assert!(tasks.is_empty());
    assert_eq!(cluster.monitor.stats().total_repair_attempts, 0);
}

/// Five live replicas of one chunk trim down to exactly the replication
/// factor, keeping the lowest ordinals.
#[tokio::test]
async fn test_trim_keeps_lowest_ordinals() {
    let nodes = [
        spawn_node().await,
        spawn_node().await,
        spawn_node().await,
        spawn_node().await,
        spawn_node().await,
    ];
    let cluster = cluster();

    let mut file = FileMetadata::new("img1", 1_000);
    for (ordinal, node) in nodes.iter().enumerate() {
        file.chunks.push(replica(0, &node.url, ordinal as u32));
        node.put("img1", 0, b"payload");
    }
    cluster.store.put(file);

    let now = timestamp_now_millis();
    for node in &nodes {
        beat(&cluster.liveness, &node.url, now, None);
    }

    run_tick(&cluster.monitor).await;

    let file = cluster.store.get("img1").unwrap();
    assert_eq!(file.chunks.len(), 3);
    let mut ordinals: Vec<u32> = file.chunks.iter().map(|r| r.replica_ordinal).collect();
    ordinals.sort();
    assert_eq!(ordinals, vec![0, 1, 2]);

    // surplus replicas are gone from the nodes too
    assert!(!nodes[3].has("img1", 0));
    assert!(!nodes[4].has("img1", 0));
    assert!(nodes[0].has("img1", 0));

    assert_eq!(cluster.monitor.stats().total_replicas_trimmed, 2);
}

/// Four live replicas are full-but-not-excessive: no trim.
#[tokio::test]
async fn test_no_trim_at_factor_plus_one() {
    let nodes = [
        spawn_node().await,
        spawn_node().await,
        spawn_node().await,
        spawn_node().await,
    ];
    let cluster = cluster();

    let mut file = FileMetadata::new("img1", 1_000);
    for (ordinal, node) in nodes.iter().enumerate() {
        file.chunks.push(replica(0, &node.url, ordinal as u32));
        node.put("img1", 0, b"payload");
    }
    cluster.store.put(file);

    let now = timestamp_now_millis();
    for node in &nodes {
        beat(&cluster.liveness, &node.url, now, None);
    }

    let tasks = Arc::clone(&cluster.monitor).tick().await;
    assert!(tasks.is_empty());
    assert_eq!(cluster.store.get("img1").unwrap().chunks.len(), 4);
}

/// A freshly repaired file is not trimmed inside the cooldown window even
/// when it becomes over-replicated.
#[tokio::test]
async fn test_cooldown_suppresses_trim_after_repair() {
    let nodes = [
        spawn_node().await,
        spawn_node().await,
        spawn_node().await,
        spawn_node().await,
        spawn_node().await,
        spawn_node().await,
    ];
    let cluster = cluster();

    // chunk 0 on nodes[0..2] only: degraded by one replica
    let mut file = FileMetadata::new("img1", 1_000);
    for ordinal in 0..2 {
        file.chunks.push(replica(0, &nodes[ordinal].url, ordinal as u32));
        nodes[ordinal].put("img1", 0, b"payload");
    }
    cluster.store.put(file);

    let now = timestamp_now_millis();
    for node in &nodes {
        beat(&cluster.liveness, &node.url, now, None);
    }

    run_tick(&cluster.monitor).await;
    assert!(cluster.monitor.last_repair_time("img1").is_some());
    assert_eq!(cluster.store.get("img1").unwrap().chunks.len(), 3);

    // pile surplus replicas on: 5 live copies, clearly excessive
    cluster
        .store
        .update_chunks("img1", |f| {
            let held: Vec<String> = f.chunks.iter().map(|c| c.node_url.clone()).collect();
            let mut ordinal = f.chunks.iter().map(|c| c.replica_ordinal).max().unwrap() + 1;
            for node in &nodes {
                if !held.contains(&node.url) && f.chunks.len() < 5 {
                    f.chunks.push(ChunkReplica {
                        chunk_index: 0,
                        node_url: node.url.clone(),
                        replica_ordinal: ordinal,
                    });
                    ordinal += 1;
                }
            }
        })
        .unwrap();
    for node in &nodes {
        node.put("img1", 0, b"payload");
    }

    // inside the cooldown window: nothing starts
    let tasks = Arc::clone(&cluster.monitor).tick().await;
    assert!(tasks.is_empty(), "trim started inside cooldown");
    assert_eq!(cluster.store.get("img1").unwrap().chunks.len(), 5);
}

/// Trim works per chunk: a chunk sitting exactly at the replication
/// factor does not shield an over-replicated sibling chunk of the same
/// file from being trimmed.
#[tokio::test]
async fn test_trim_is_per_chunk_with_mixed_replication() {
    let nodes = [
        spawn_node().await,
        spawn_node().await,
        spawn_node().await,
        spawn_node().await,
        spawn_node().await,
    ];
    let cluster = cluster();

    // two chunks: chunk 0 at exactly the factor, chunk 1 on all five nodes
    let mut file = FileMetadata::new("img1", 40_000);
    for ordinal in 0..3 {
        file.chunks.push(replica(0, &nodes[ordinal].url, ordinal as u32));
        nodes[ordinal].put("img1", 0, b"chunk-zero");
    }
    for (ordinal, node) in nodes.iter().enumerate() {
        file.chunks.push(replica(1, &node.url, ordinal as u32));
        node.put("img1", 1, b"chunk-one");
    }
    cluster.store.put(file);

    let now = timestamp_now_millis();
    for node in &nodes {
        beat(&cluster.liveness, &node.url, now, None);
    }

    run_tick(&cluster.monitor).await;

    let file = cluster.store.get("img1").unwrap();
    assert_eq!(file.replicas_for(0).count(), 3, "chunk 0 must be untouched");
    assert_eq!(file.replicas_for(1).count(), 3, "chunk 1 not trimmed");

    let mut kept: Vec<u32> = file.replicas_for(1).map(|r| r.replica_ordinal).collect();
    kept.sort();
    assert_eq!(kept, vec![0, 1, 2]);
    assert!(!nodes[3].has("img1", 1));
    assert!(!nodes[4].has("img1", 1));
    for ordinal in 0..3 {
        assert!(nodes[ordinal].has("img1", 0));
        assert!(nodes[ordinal].has("img1", 1));
    }

    assert_eq!(cluster.monitor.stats().total_replicas_trimmed, 2);
}

/// File ids are opaque: query-string metacharacters in an id must not
/// misroute reads, probes or writes on the node contract.
#[tokio::test]
async fn test_repair_with_query_metacharacters_in_file_id() {
    let b = spawn_node().await;
    let c = spawn_node().await;
    let cluster = cluster();

    let file_id = "img 1&chunkIndex=999";
    let mut file = FileMetadata::new(file_id, 1_000);
    file.chunks.push(replica(0, &b.url, 0));
    file.chunks.push(replica(0, &c.url, 1));
    c.put(file_id, 0, b"payload");
    cluster.store.put(file);

    let now = timestamp_now_millis();
    beat(&cluster.liveness, &b.url, now, None);
    beat(&cluster.liveness, &c.url, now, None);

    cluster
        .integrity
        .repair_chunk(file_id, 0, &b.url)
        .await
        .unwrap();

    assert!(b.has(file_id, 0));
    assert_eq!(b.chunk(file_id, 0).unwrap(), b"payload".to_vec());
}

/// A node reports chunks missing from its inventory; the reconciler copies
/// them back from a verified peer.
#[tokio::test]
async fn test_inventory_loss_triggers_chunk_repair() {
    let b = spawn_node().await;
    let c = spawn_node().await;
    let d = spawn_node().await;
    let mut cluster = cluster();

    let mut file = FileMetadata::new("img1", 90_000);
    for chunk_index in 0..3 {
        for (ordinal, node) in [&b, &c, &d].iter().enumerate() {
            file.chunks.push(replica(chunk_index, &node.url, ordinal as u32));
            node.put("img1", chunk_index, &[chunk_index as u8; 32]);
        }
    }
    cluster.store.put(file);

    let now = timestamp_now_millis();
    beat(&cluster.liveness, &b.url, now, Some(b.inventory()));
    beat(&cluster.liveness, &c.url, now, Some(c.inventory()));
    beat(&cluster.liveness, &d.url, now, Some(d.inventory()));

    // someone deletes chunk 2 from b's disk; the next heartbeat reports it
    b.lose("img1", 2);
    beat(&cluster.liveness, &b.url, now + 10_000, Some(b.inventory()));

    let event = cluster.events_rx.try_recv().expect("no event emitted");
    match &event {
        ClusterEvent::InventoryChanged { url, removed } => {
            assert_eq!(url, &b.url);
            assert_eq!(removed.len(), 1);
            assert_eq!(removed[0].chunk_index, 2);
        }
        other => panic!("expected InventoryChanged, got {:?}", other),
    }

    cluster.integrity.handle_event(event).await;

    assert!(b.has("img1", 2), "chunk not restored on b");
    assert_eq!(b.chunk("img1", 2).unwrap(), vec![2u8; 32]);

    // metadata already listed b for chunk 2: no duplicate appended
    let file = cluster.store.get("img1").unwrap();
    assert_eq!(file.replicas_for(2).count(), 3);

    let stats = cluster.integrity.stats();
    assert_eq!(stats.total_chunks_repaired, 1);
    assert_eq!(stats.total_repair_failures, 0);
}

/// A node registers after losing a chunk while the coordinator was down:
/// the registration audit restores it and appends the replica if needed.
#[tokio::test]
async fn test_registration_audit_repairs_missing_chunks() {
    let b = spawn_node().await;
    let c = spawn_node().await;
    let cluster = cluster();

    // the store says b and c hold chunk 0, but b's copy is gone
    let mut file = FileMetadata::new("img1", 1_000);
    file.chunks.push(replica(0, &b.url, 0));
    file.chunks.push(replica(0, &c.url, 1));
    c.put("img1", 0, b"payload");
    cluster.store.put(file);

    let now = timestamp_now_millis();
    beat(&cluster.liveness, &b.url, now, Some(b.inventory()));
    beat(&cluster.liveness, &c.url, now, Some(c.inventory()));

    cluster
        .integrity
        .handle_event(ClusterEvent::NodeRegistered { url: b.url.clone() })
        .await;

    assert!(b.has("img1", 0), "registration audit did not repair");
    assert_eq!(cluster.store.get("img1").unwrap().replicas_for(0).count(), 2);
}

/// A recovered node is audited against its reported inventory and chunks
/// it lost while away are copied back.
#[tokio::test]
async fn test_recovery_audit_repairs_lost_chunk() {
    let b = spawn_node().await;
    let c = spawn_node().await;
    let mut cluster = cluster();

    let mut file = FileMetadata::new("img1", 1_000);
    file.chunks.push(replica(0, &b.url, 0));
    file.chunks.push(replica(0, &c.url, 1));
    b.put("img1", 0, b"payload");
    c.put("img1", 0, b"payload");
    cluster.store.put(file);

    let now = timestamp_now_millis();
    beat(&cluster.liveness, &b.url, now - 32_000, None);
    beat(&cluster.liveness, &c.url, now, None);
    cluster.liveness.sweep_timeouts(now);
    let _ = cluster.events_rx.try_recv(); // NodeDown for b

    // b comes back, but its disk lost the chunk while it was away
    b.lose("img1", 0);
    beat(&cluster.liveness, &b.url, now + 1_000, Some(b.inventory()));

    let event = cluster.events_rx.try_recv().expect("no recovery event");
    assert!(matches!(event, ClusterEvent::NodeRecovered { .. }));
    cluster.integrity.handle_event(event).await;

    assert!(b.has("img1", 0), "recovery audit did not repair");
}

/// Repair source probing skips a node whose metadata entry is stale (the
/// node answers but no longer holds the chunk).
#[tokio::test]
async fn test_repair_skips_stale_source() {
    let b = spawn_node().await;
    let c = spawn_node().await;
    let d = spawn_node().await;
    let cluster = cluster();

    let mut file = FileMetadata::new("img1", 1_000);
    file.chunks.push(replica(0, &b.url, 0));
    file.chunks.push(replica(0, &c.url, 1));
    file.chunks.push(replica(0, &d.url, 2));
    // b is listed first but lost the chunk too; only c actually has it
    c.put("img1", 0, b"payload");
    cluster.store.put(file);

    let now = timestamp_now_millis();
    beat(&cluster.liveness, &b.url, now, None);
    beat(&cluster.liveness, &c.url, now, None);
    beat(&cluster.liveness, &d.url, now, None);

    cluster
        .integrity
        .repair_chunk("img1", 0, &d.url)
        .await
        .unwrap();

    assert!(d.has("img1", 0));
    assert_eq!(d.chunk("img1", 0).unwrap(), b"payload".to_vec());
}

/// With no live source holding the chunk, the repair records a failure.
#[tokio::test]
async fn test_repair_fails_without_live_source() {
    let b = spawn_node().await;
    let c = spawn_node().await;
    let cluster = cluster();

    let mut file = FileMetadata::new("img1", 1_000);
    file.chunks.push(replica(0, &b.url, 0));
    cluster.store.put(file);

    let now = timestamp_now_millis();
    beat(&cluster.liveness, &b.url, now, None);
    beat(&cluster.liveness, &c.url, now, None);

    let result = cluster.integrity.repair_chunk("img1", 0, &b.url).await;
    assert!(result.is_err());
    assert_eq!(cluster.integrity.stats().total_repair_failures, 1);
}
