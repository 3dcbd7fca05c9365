//! Control-plane HTTP API served by the metadata node.
//!
//! Mutations are only accepted while this node is the leader; otherwise
//! the handler answers 421 with the leader endpoint in the error details
//! so clients and datanodes can retry there. Committed mutations are
//! recorded in the op log for follower sync.

use crate::ha::{HaController, PeerHeartbeat, SyncRequest, VoteRequest};
use crate::manager::Manager;
use crate::oplog::MetaOp;
use crate::replicator::{ReplicationReason, ReplicationTask};
use basalt_core::error::DfsError;
use basalt_core::types::{
    BlockInfo, BlockReport, CreateDirectoryRequest, CreateFileRequest, ErrorBody,
    HeartbeatRequest, LocationRequest, NodeStatus, PlacementRequest, RegisterBlockRequest,
    RegisterDataNodeRequest,
};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

pub struct NodeContext {
    pub manager: Manager,
    pub ha: Arc<HaController>,
    pub repl_tx: mpsc::Sender<ReplicationTask>,
    pub client: reqwest::Client,
}

pub fn router(ctx: Arc<NodeContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(cluster_status))
        .route("/datanodes/register", post(register_datanode))
        .route("/datanodes", get(list_datanodes))
        .route("/datanodes/:node_id", get(get_datanode))
        .route("/datanodes/:node_id/heartbeat", post(datanode_heartbeat))
        .route("/files", post(create_file))
        .route("/files/:file_id", get(get_file).delete(delete_file))
        .route("/files/path/*path", get(get_file_by_path))
        .route("/directories", post(create_directory))
        .route("/directories/*path", get(list_directory).delete(remove_directory))
        .route("/blocks", post(register_block))
        .route("/blocks/report", post(block_report))
        .route("/blocks/:block_id", get(get_block))
        .route("/blocks/file/:file_id", get(blocks_of_file))
        .route("/blocks/:block_id/locations", post(add_location))
        .route(
            "/blocks/:block_id/locations/:node_id",
            delete(remove_location),
        )
        .route("/placement", post(place_blocks))
        .route("/peer/vote", post(peer_vote))
        .route("/peer/heartbeat", post(peer_heartbeat))
        .route("/peer/sync", post(peer_sync))
        .with_state(ctx)
}

pub struct ApiError(DfsError);

impl From<DfsError> for ApiError {
    fn from(err: DfsError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            DfsError::NotFound(_) | DfsError::ParentMissing(_) => StatusCode::NOT_FOUND,
            DfsError::AlreadyExists(_) | DfsError::NotEmpty(_) | DfsError::Conflict(_) => {
                StatusCode::CONFLICT
            }
            DfsError::InvalidPath(_) | DfsError::Wire(_) => StatusCode::BAD_REQUEST,
            DfsError::NotLeader { .. } => StatusCode::MISDIRECTED_REQUEST,
            DfsError::NoEligibleNodes(_) | DfsError::Transient(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            DfsError::CapacityExceeded(_) => StatusCode::INSUFFICIENT_STORAGE,
            _ => {
                tracing::error!("internal error: {}", self.0);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = ErrorBody {
            code: self.0.code().to_string(),
            message: self.0.to_string(),
            details: self.0.details(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn absolute(path: String) -> String {
    if path.starts_with('/') {
        path
    } else {
        format!("/{path}")
    }
}

async fn health(State(ctx): State<Arc<NodeContext>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "node_id": ctx.ha.node_id(),
        "role": ctx.ha.role().as_str(),
        "term": ctx.ha.current_term(),
        "leader": ctx.ha.leader_hint(),
    }))
}

async fn cluster_status(State(ctx): State<Arc<NodeContext>>) -> ApiResult<impl IntoResponse> {
    let status = ctx.manager.cluster_status(
        ctx.ha.node_id(),
        ctx.ha.role().as_str(),
        ctx.ha.current_term(),
        ctx.ha.leader_hint(),
    )?;
    Ok(Json(status))
}

// === datanodes ===

async fn register_datanode(
    State(ctx): State<Arc<NodeContext>>,
    Json(request): Json<RegisterDataNodeRequest>,
) -> ApiResult<impl IntoResponse> {
    ctx.ha.ensure_leader()?;
    let info = ctx.manager.register_datanode(&request)?;
    ctx.ha.record(MetaOp::RegisterDataNode {
        node_id: info.node_id,
        hostname: info.hostname.clone(),
        port: info.port,
        storage_capacity: info.storage_capacity,
        available_space: info.available_space,
    });
    tracing::info!(
        "registered datanode {} at {}:{}",
        info.node_id,
        info.hostname,
        info.port
    );
    Ok((StatusCode::CREATED, Json(info)))
}

#[derive(Debug, Deserialize)]
struct DataNodeQuery {
    #[serde(default)]
    status: Option<String>,
}

async fn list_datanodes(
    State(ctx): State<Arc<NodeContext>>,
    Query(query): Query<DataNodeQuery>,
) -> ApiResult<impl IntoResponse> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            NodeStatus::parse(raw)
                .ok_or_else(|| DfsError::InvalidPath(format!("unknown status {raw}")))?,
        ),
        None => None,
    };
    Ok(Json(ctx.manager.list_datanodes(status)?))
}

async fn get_datanode(
    State(ctx): State<Arc<NodeContext>>,
    Path(node_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(ctx.manager.get_datanode(node_id)?))
}

async fn datanode_heartbeat(
    State(ctx): State<Arc<NodeContext>>,
    Path(node_id): Path<Uuid>,
    Json(request): Json<HeartbeatRequest>,
) -> ApiResult<StatusCode> {
    ctx.ha.ensure_leader()?;
    let reactivated = ctx
        .manager
        .heartbeat(node_id, request.available_space, request.blocks_stored)?;
    if reactivated {
        ctx.ha.record(MetaOp::SetNodeStatus {
            node_id,
            status: NodeStatus::Active,
        });
    }
    Ok(StatusCode::NO_CONTENT)
}

// === namespace ===

async fn create_directory(
    State(ctx): State<Arc<NodeContext>>,
    Json(request): Json<CreateDirectoryRequest>,
) -> ApiResult<impl IntoResponse> {
    ctx.ha.ensure_leader()?;
    let meta = ctx
        .manager
        .create_directory(&request.path, request.owner.as_deref())?;
    ctx.ha.record(MetaOp::Mkdir {
        path: meta.path.clone(),
        owner: meta.owner.clone(),
    });
    Ok((StatusCode::CREATED, Json(meta)))
}

async fn list_directory(
    State(ctx): State<Arc<NodeContext>>,
    Path(path): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(ctx.manager.list_directory(&absolute(path))?))
}

#[derive(Debug, Deserialize)]
struct RemoveDirectoryQuery {
    #[serde(default)]
    recursive: bool,
}

async fn remove_directory(
    State(ctx): State<Arc<NodeContext>>,
    Path(path): Path<String>,
    Query(query): Query<RemoveDirectoryQuery>,
) -> ApiResult<StatusCode> {
    ctx.ha.ensure_leader()?;
    let path = absolute(path);
    let doomed = ctx.manager.remove_directory(&path, query.recursive)?;
    ctx.ha.record(MetaOp::Rmdir {
        path,
        recursive: query.recursive,
    });
    spawn_physical_deletes(ctx.clone(), doomed);
    Ok(StatusCode::NO_CONTENT)
}

// === files ===

async fn create_file(
    State(ctx): State<Arc<NodeContext>>,
    Json(request): Json<CreateFileRequest>,
) -> ApiResult<impl IntoResponse> {
    ctx.ha.ensure_leader()?;
    let meta = ctx
        .manager
        .create_file(&request.path, request.size, request.owner.as_deref())?;
    ctx.ha.record(MetaOp::CreateFile {
        file_id: meta.file_id,
        path: meta.path.clone(),
        size: meta.size,
        owner: meta.owner.clone(),
    });
    Ok((StatusCode::CREATED, Json(meta)))
}

async fn get_file(
    State(ctx): State<Arc<NodeContext>>,
    Path(file_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(ctx.manager.get_file(file_id)?))
}

async fn get_file_by_path(
    State(ctx): State<Arc<NodeContext>>,
    Path(path): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(ctx.manager.get_file_by_path(&absolute(path))?))
}

async fn delete_file(
    State(ctx): State<Arc<NodeContext>>,
    Path(file_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    ctx.ha.ensure_leader()?;
    let (_, doomed) = ctx.manager.delete_file(file_id)?;
    ctx.ha.record(MetaOp::DeleteFile { file_id });
    spawn_physical_deletes(ctx.clone(), doomed);
    Ok(StatusCode::NO_CONTENT)
}

// === blocks ===

async fn register_block(
    State(ctx): State<Arc<NodeContext>>,
    Json(request): Json<RegisterBlockRequest>,
) -> ApiResult<impl IntoResponse> {
    ctx.ha.ensure_leader()?;
    ctx.manager.register_block(&request)?;
    ctx.ha.record(MetaOp::RegisterBlock {
        block_id: request.block_id,
        file_id: request.file_id,
        size: request.size,
        checksum: request.checksum.clone(),
    });
    Ok(StatusCode::CREATED)
}

async fn get_block(
    State(ctx): State<Arc<NodeContext>>,
    Path(block_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(ctx.manager.get_block(block_id)?))
}

async fn blocks_of_file(
    State(ctx): State<Arc<NodeContext>>,
    Path(file_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(ctx.manager.blocks_of_file(file_id)?))
}

async fn add_location(
    State(ctx): State<Arc<NodeContext>>,
    Path(block_id): Path<Uuid>,
    Json(request): Json<LocationRequest>,
) -> ApiResult<StatusCode> {
    ctx.ha.ensure_leader()?;
    ctx.manager
        .add_location(block_id, request.node_id, request.is_leader)?;
    ctx.ha.record(MetaOp::AddLocation {
        block_id,
        node_id: request.node_id,
        is_leader: request.is_leader,
    });
    Ok(StatusCode::CREATED)
}

async fn remove_location(
    State(ctx): State<Arc<NodeContext>>,
    Path((block_id, node_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    ctx.ha.ensure_leader()?;
    ctx.manager.remove_location(block_id, node_id)?;
    ctx.ha.record(MetaOp::RemoveLocation { block_id, node_id });
    // Losing a replica may leave the block under-replicated.
    let _ = ctx
        .repl_tx
        .send(ReplicationTask::new(
            block_id,
            ReplicationReason::ExplicitRepair,
        ))
        .await;
    Ok(StatusCode::NO_CONTENT)
}

async fn block_report(
    State(ctx): State<Arc<NodeContext>>,
    Json(report): Json<BlockReport>,
) -> ApiResult<StatusCode> {
    ctx.ha.ensure_leader()?;
    let outcome = ctx.manager.apply_block_report(&report)?;
    for block_id in &outcome.added {
        ctx.ha.record(MetaOp::AddLocation {
            block_id: *block_id,
            node_id: report.node_id,
            is_leader: false,
        });
    }
    for block_id in outcome.under_replicated {
        let _ = ctx
            .repl_tx
            .send(ReplicationTask::new(
                block_id,
                ReplicationReason::UnderReplicated,
            ))
            .await;
    }
    Ok(StatusCode::NO_CONTENT)
}

// === placement ===

async fn place_blocks(
    State(ctx): State<Arc<NodeContext>>,
    Json(request): Json<PlacementRequest>,
) -> ApiResult<impl IntoResponse> {
    ctx.ha.ensure_leader()?;
    let replication_factor = request
        .replication_factor
        .unwrap_or(ctx.manager.settings().replication_factor);
    let assignments = ctx
        .manager
        .place_blocks(&request.blocks, replication_factor, &[])?;
    Ok(Json(assignments))
}

// === HA peer RPC ===

async fn peer_vote(
    State(ctx): State<Arc<NodeContext>>,
    Json(request): Json<VoteRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(ctx.ha.handle_vote(request)?))
}

async fn peer_heartbeat(
    State(ctx): State<Arc<NodeContext>>,
    Json(request): Json<PeerHeartbeat>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(ctx.ha.handle_peer_heartbeat(request)?))
}

async fn peer_sync(
    State(ctx): State<Arc<NodeContext>>,
    Json(request): Json<SyncRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(ctx.ha.handle_sync(request)?))
}

// === physical cleanup ===

/// Fire-and-forget deletes toward every replica of the given blocks.
/// Storage nodes treat an absent block as already deleted.
fn spawn_physical_deletes(ctx: Arc<NodeContext>, blocks: Vec<BlockInfo>) {
    if blocks.is_empty() {
        return;
    }
    tokio::spawn(async move {
        for block in blocks {
            for location in &block.locations {
                let url = format!("{}/blocks/{}", location.data_endpoint(), block.block_id);
                match ctx.client.delete(&url).send().await {
                    Ok(response) if response.status().is_success() => {}
                    Ok(response) => {
                        tracing::warn!(
                            "delete of block {} on {} returned {}",
                            block.block_id,
                            location.node_id,
                            response.status()
                        );
                    }
                    Err(err) => {
                        tracing::warn!(
                            "delete of block {} on {} failed: {err}",
                            block.block_id,
                            location.node_id
                        );
                    }
                }
            }
        }
    });
}
