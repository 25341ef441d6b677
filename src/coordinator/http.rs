//! Coordinator HTTP API
//!
//! The edge surface: node lifecycle (register/unregister/heartbeat), the
//! client data path (upload planning, placement queries, delete), and the
//! operator views (files/nodes/health/stats). All request and response
//! bodies are JSON; errors come back as `{status: "error", message}` with
//! the status code picked by the error kind.

use crate::common::{validate_node_url, CoordinatorConfig, Error};
use crate::coordinator::events::{ClusterEvent, EventBus};
use crate::coordinator::integrity::IntegrityReconciler;
use crate::coordinator::liveness::{Heartbeat, LivenessTracker};
use crate::coordinator::metadata::MetadataStore;
use crate::coordinator::node_client::NodeClient;
use crate::coordinator::placement::PlacementPlanner;
use crate::coordinator::registry::NodeRegistry;
use crate::coordinator::replication::ReplicationMonitor;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::{routing, Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

/// Shared coordinator state for HTTP handlers.
#[derive(Clone)]
pub struct CoordState {
    pub config: Arc<CoordinatorConfig>,
    pub store: Arc<MetadataStore>,
    pub registry: Arc<NodeRegistry>,
    pub liveness: Arc<LivenessTracker>,
    pub planner: Arc<PlacementPlanner>,
    pub replication: Arc<ReplicationMonitor>,
    pub integrity: Arc<IntegrityReconciler>,
    pub events: EventBus,
    pub client: NodeClient,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.to_http_status();
        let body = Json(json!({
            "status": "error",
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

/// Creates the HTTP router with all public endpoints.
pub fn create_router(state: CoordState) -> Router {
    Router::new()
        .route("/register", routing::post(register))
        .route("/unregister", routing::post(unregister))
        .route("/heartbeat", routing::post(heartbeat))
        .route("/upload", routing::post(upload))
        .route("/metadata", routing::get(metadata))
        .route("/delete", routing::delete(delete))
        .route("/files", routing::get(files))
        .route("/nodes", routing::get(nodes))
        .route("/health", routing::get(health))
        .route("/stats", routing::get(stats))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    url: String,
    #[serde(default)]
    id: Option<String>,
}

async fn register(
    State(state): State<CoordState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<serde_json::Value>, Error> {
    validate_node_url(&request.url)?;

    let (record, _existed) = state.registry.register(&request.url, request.id.as_deref());

    // audit the node even on re-registration: chunks may have vanished
    // while the coordinator was down
    state.events.publish(ClusterEvent::NodeRegistered {
        url: record.url.clone(),
    });

    Ok(Json(json!({
        "status": "success",
        "url": record.url,
        "id": record.id,
    })))
}

#[derive(Debug, Deserialize)]
struct UnregisterRequest {
    url: String,
}

async fn unregister(
    State(state): State<CoordState>,
    Json(request): Json<UnregisterRequest>,
) -> Result<Json<serde_json::Value>, Error> {
    validate_node_url(&request.url)?;
    let removed = state.registry.unregister(&request.url);
    Ok(Json(json!({
        "status": "success",
        "removed": removed,
    })))
}

async fn heartbeat(
    State(state): State<CoordState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, Error> {
    let hb: Heartbeat = serde_json::from_value(body)
        .map_err(|e| Error::Validation(format!("malformed heartbeat: {}", e)))?;
    if hb.url.is_empty() || hb.id.is_empty() {
        return Err(Error::Validation(
            "heartbeat requires non-empty url and id".into(),
        ));
    }

    let ack = state.liveness.process_heartbeat(hb)?;
    Ok(Json(serde_json::to_value(ack).map_err(|e| {
        Error::Internal(format!("serialize ack: {}", e))
    })?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadRequest {
    file_id: String,
    size: u64,
}

async fn upload(
    State(state): State<CoordState>,
    Json(request): Json<UploadRequest>,
) -> Result<Json<serde_json::Value>, Error> {
    if request.file_id.trim().is_empty() {
        return Err(Error::Validation("fileId is required".into()));
    }
    if request.size == 0 {
        return Err(Error::Validation("size must be greater than 0".into()));
    }

    let live = state.liveness.alive_urls();
    let file = state
        .planner
        .plan_upload(&request.file_id, request.size, &live)?;

    let num_chunks = file.num_chunks(state.config.chunk_size) as usize;
    let replication_factor = if num_chunks > 0 {
        file.chunks.len() / num_chunks
    } else {
        0
    };

    state.store.put(file.clone());

    Ok(Json(json!({
        "status": "success",
        "fileId": file.file_id,
        "chunks": file.chunks,
        "replicationFactor": replication_factor,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileQuery {
    file_id: String,
}

async fn metadata(
    State(state): State<CoordState>,
    Query(query): Query<FileQuery>,
) -> Result<Json<serde_json::Value>, Error> {
    let file = state.store.get(&query.file_id)?;
    let alive: HashSet<String> = state.liveness.alive_urls().into_iter().collect();
    let filtered = state.planner.filter_for_read(&file, &alive)?;

    Ok(Json(json!({
        "status": "success",
        "fileId": filtered.file_id,
        "size": filtered.size,
        "timestamp": filtered.timestamp,
        "chunks": filtered.chunks,
    })))
}

async fn delete(
    State(state): State<CoordState>,
    Query(query): Query<FileQuery>,
) -> Result<Json<serde_json::Value>, Error> {
    let file = state.store.get(&query.file_id)?;

    let mut deleted = 0usize;
    let mut failed = 0usize;
    for replica in &file.chunks {
        if !state.liveness.is_alive(&replica.node_url) {
            failed += 1;
            continue;
        }
        match state
            .client
            .delete_chunk(&replica.node_url, &file.file_id, replica.chunk_index)
            .await
        {
            Ok(()) => deleted += 1,
            Err(e) => {
                tracing::warn!(
                    file_id = %file.file_id,
                    chunk_index = replica.chunk_index,
                    node = %replica.node_url,
                    error = %e,
                    "Replica delete failed"
                );
                failed += 1;
            }
        }
    }

    state.store.delete(&query.file_id);
    tracing::info!(
        file_id = %query.file_id,
        replicas_deleted = deleted,
        replicas_failed = failed,
        "File deleted"
    );

    Ok(Json(json!({
        "status": "success",
        "replicasDeleted": deleted,
        "replicasFailed": failed,
    })))
}

async fn files(State(state): State<CoordState>) -> Json<serde_json::Value> {
    let mut files = state.store.list();
    files.sort_by(|a, b| a.file_id.cmp(&b.file_id));
    Json(json!({
        "status": "success",
        "total": files.len(),
        "files": files,
    }))
}

async fn nodes(State(state): State<CoordState>) -> Json<serde_json::Value> {
    let alive = state.liveness.alive_urls();
    let dead = state.liveness.dead_urls();
    Json(json!({
        "status": "success",
        "total": state.registry.len(),
        "alive": alive.len(),
        "dead": dead.len(),
        "registered": state.registry.list(),
        "aliveNodes": alive,
        "deadNodes": dead,
        "details": state.liveness.node_views(),
    }))
}

async fn health(State(state): State<CoordState>) -> Json<serde_json::Value> {
    let alive = state.liveness.alive_urls().len();
    let dead = state.liveness.dead_urls().len();
    let replication_factor = state.config.replication_factor;
    let can_maintain = alive >= replication_factor;
    let persistence_ok = state.store.is_healthy();

    let status = if can_maintain && persistence_ok {
        "HEALTHY"
    } else {
        "DEGRADED"
    };

    Json(json!({
        "status": status,
        "totalNodes": state.registry.len(),
        "aliveNodes": alive,
        "deadNodes": dead,
        "requiredForReplication": replication_factor,
        "canMaintainReplication": can_maintain,
        "filesTracked": state.store.len(),
        "metadataPersistenceOk": persistence_ok,
    }))
}

async fn stats(State(state): State<CoordState>) -> Json<serde_json::Value> {
    let files = state.store.list();
    let total_bytes: u64 = files.iter().map(|f| f.size).sum();
    let total_replicas: usize = files.iter().map(|f| f.chunks.len()).sum();
    let total_unique_chunks: usize = files
        .iter()
        .map(|f| f.num_chunks(state.config.chunk_size) as usize)
        .sum();
    let replication_efficiency = if total_unique_chunks > 0 {
        total_replicas as f64 / total_unique_chunks as f64
    } else {
        0.0
    };

    Json(json!({
        "status": "success",
        "totalFiles": files.len(),
        "totalBytes": total_bytes,
        "totalUniqueChunks": total_unique_chunks,
        "totalReplicas": total_replicas,
        "replicationEfficiency": replication_efficiency,
        "chunkSize": state.config.chunk_size,
        "replicationFactor": state.config.replication_factor,
        "aliveNodes": state.liveness.alive_urls().len(),
        "deadNodes": state.liveness.dead_urls().len(),
        "registeredNodes": state.registry.len(),
        "persistErrors": state.store.persist_errors(),
        "replication": state.replication.stats(),
        "integrity": state.integrity.stats(),
    }))
}
