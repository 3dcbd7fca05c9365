//! Data-plane service: the six block operations over HTTP.
//!
//! Block payloads are carried as framed byte streams (see
//! `basalt_core::wire`). A node that accepts a block directly from a
//! client is the leader for that block and pushes a replica to a follower
//! before reporting the extra location to the namenode.

use crate::agent::{check_response, NameNodeHandle};
use crate::block_store::BlockStore;
use basalt_core::error::{DfsError, Result};
use basalt_core::settings::Settings;
use basalt_core::types::{
    CheckBlockResponse, DataNodeInfo, ErrorBody, FollowerHint, NodeStatus, ReportedBlock,
    StoreBlockResponse, TransferRequest,
};
use basalt_core::wire::{split_into_frames, BlockAssembler, FrameDecoder};
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const FOLLOWERS_HEADER: &str = "x-basalt-followers";
const REPLICATION_ATTEMPTS: u32 = 3;

pub struct DataNodeState {
    pub store: BlockStore,
    pub node_id: Uuid,
    pub namenode: Arc<NameNodeHandle>,
    pub settings: Settings,
    pub client: reqwest::Client,
    /// Block ids with a write currently in flight; concurrent duplicate
    /// writes on the same id are rejected.
    inflight: Mutex<HashSet<Uuid>>,
}

impl DataNodeState {
    pub fn new(
        store: BlockStore,
        node_id: Uuid,
        namenode: Arc<NameNodeHandle>,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            node_id,
            namenode,
            settings,
            client: reqwest::Client::new(),
            inflight: Mutex::new(HashSet::new()),
        }
    }
}

pub fn router(state: Arc<DataNodeState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/blocks/:block_id",
            put(store_block).get(retrieve_block).delete(delete_block),
        )
        .route("/blocks/:block_id/check", get(check_block))
        .route("/blocks/:block_id/replicate", axum::routing::post(replicate_block))
        .route("/blocks/:block_id/transfer", axum::routing::post(transfer_block))
        .with_state(state)
}

/// Axum-facing error wrapper mapping `DfsError` onto a status code and the
/// uniform JSON body.
pub struct ApiError(DfsError);

impl From<DfsError> for ApiError {
    fn from(err: DfsError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            DfsError::NotFound(_) => StatusCode::NOT_FOUND,
            DfsError::AlreadyExists(_) | DfsError::Conflict(_) => StatusCode::CONFLICT,
            DfsError::Wire(_) | DfsError::InvalidPath(_) => StatusCode::BAD_REQUEST,
            DfsError::CapacityExceeded(_) => StatusCode::INSUFFICIENT_STORAGE,
            DfsError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            code: self.0.code().to_string(),
            message: self.0.to_string(),
            details: self.0.details(),
        };
        (status, Json(body)).into_response()
    }
}

async fn health(State(state): State<Arc<DataNodeState>>) -> impl IntoResponse {
    let available = state.store.available_space().unwrap_or(0);
    Json(serde_json::json!({
        "node_id": state.node_id,
        "blocks_stored": state.store.blocks_stored(),
        "available_space": available,
    }))
}

struct InflightGuard {
    state: Arc<DataNodeState>,
    block_id: Uuid,
}

impl InflightGuard {
    fn acquire(state: &Arc<DataNodeState>, block_id: Uuid) -> Result<Self> {
        let mut inflight = state
            .inflight
            .lock()
            .map_err(|_| DfsError::Internal("inflight lock poisoned".to_string()))?;
        if !inflight.insert(block_id) {
            return Err(DfsError::AlreadyExists(format!(
                "write already in flight for block {block_id}"
            )));
        }
        Ok(Self {
            state: state.clone(),
            block_id,
        })
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if let Ok(mut inflight) = self.state.inflight.lock() {
            inflight.remove(&self.block_id);
        }
    }
}

async fn store_block(
    State(state): State<Arc<DataNodeState>>,
    Path(block_id): Path<Uuid>,
    headers: HeaderMap,
    body: Body,
) -> std::result::Result<(StatusCode, Json<StoreBlockResponse>), ApiError> {
    let _guard = InflightGuard::acquire(&state, block_id)?;

    let data = read_framed_body(&state, block_id, body).await?;
    let response = match state.store.store(block_id, &data, false).await {
        Ok(stored) => StoreBlockResponse {
            block_id,
            size: stored.size,
            checksum: stored.checksum,
            already_stored: false,
        },
        // A duplicate with a matching checksum is a no-op success.
        Err(DfsError::AlreadyExists(_)) => {
            let stored = state
                .store
                .stat(block_id)
                .await?
                .ok_or_else(|| DfsError::Internal(format!("block {block_id} vanished")))?;
            return Ok((
                StatusCode::OK,
                Json(StoreBlockResponse {
                    block_id,
                    size: stored.size,
                    checksum: stored.checksum,
                    already_stored: true,
                }),
            ));
        }
        Err(err) => return Err(err.into()),
    };

    // Accepting a block from a client makes this node its leader; push a
    // replica in the background.
    let followers = parse_followers(&headers)?;
    tokio::spawn(replicate_to_follower(state.clone(), block_id, followers));

    Ok((StatusCode::CREATED, Json(response)))
}

async fn retrieve_block(
    State(state): State<Arc<DataNodeState>>,
    Path(block_id): Path<Uuid>,
) -> std::result::Result<Response, ApiError> {
    let (data, _) = match state.store.retrieve(block_id).await {
        Ok(found) => found,
        Err(err @ DfsError::Corrupt { .. }) => {
            // Drop the bad replica and tell the namenode, so the
            // replication coordinator can recreate it elsewhere.
            tracing::warn!("block {block_id} failed verification, deleting local copy");
            let _ = state.store.delete(block_id).await;
            let notify = state.clone();
            tokio::spawn(async move {
                let path = format!("/blocks/{block_id}/locations/{}", notify.node_id);
                if let Err(err) = notify.namenode.delete_ack(&path).await {
                    tracing::warn!("failed to report corrupt replica of {block_id}: {err}");
                }
            });
            return Err(err.into());
        }
        Err(err) => return Err(err.into()),
    };

    let frames = split_into_frames(
        block_id,
        &data,
        state.settings.max_frame_bytes,
        state.settings.wire_compression,
    )?;
    let stream = futures::stream::iter(
        frames
            .into_iter()
            .map(Ok::<Bytes, std::convert::Infallible>),
    );
    Ok(Body::from_stream(stream).into_response())
}

async fn check_block(
    State(state): State<Arc<DataNodeState>>,
    Path(block_id): Path<Uuid>,
) -> std::result::Result<Json<CheckBlockResponse>, ApiError> {
    let response = match state.store.stat(block_id).await? {
        Some(stored) => CheckBlockResponse {
            exists: true,
            size: stored.size,
            checksum: Some(stored.checksum),
        },
        None => CheckBlockResponse {
            exists: false,
            size: 0,
            checksum: None,
        },
    };
    Ok(Json(response))
}

async fn delete_block(
    State(state): State<Arc<DataNodeState>>,
    Path(block_id): Path<Uuid>,
) -> std::result::Result<Json<serde_json::Value>, ApiError> {
    // Physical removal is best-effort; an absent block counts as deleted.
    let deleted = state.store.delete(block_id).await?;
    Ok(Json(serde_json::json!({
        "block_id": block_id,
        "deleted": deleted,
    })))
}

async fn replicate_block(
    State(state): State<Arc<DataNodeState>>,
    Path(block_id): Path<Uuid>,
    Json(request): Json<TransferRequest>,
) -> std::result::Result<Json<StoreBlockResponse>, ApiError> {
    let response = push_block(&state, block_id, &request).await?;
    // The leader records the follower's copy with the namenode.
    let path = format!("/blocks/{block_id}/locations");
    state
        .namenode
        .post_ack(
            &path,
            &serde_json::json!({ "node_id": request.target_node_id, "is_leader": false }),
        )
        .await?;
    Ok(Json(response))
}

async fn transfer_block(
    State(state): State<Arc<DataNodeState>>,
    Path(block_id): Path<Uuid>,
    Json(request): Json<TransferRequest>,
) -> std::result::Result<Json<StoreBlockResponse>, ApiError> {
    // Re-replication push; the replication coordinator records the new
    // location itself.
    let response = push_block(&state, block_id, &request).await?;
    Ok(Json(response))
}

async fn read_framed_body(
    state: &DataNodeState,
    block_id: Uuid,
    body: Body,
) -> Result<Bytes> {
    let mut decoder = FrameDecoder::new(state.settings.max_frame_bytes);
    let mut assembler = BlockAssembler::new();

    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| DfsError::Wire(format!("body stream failed: {e}")))?;
        decoder.push(&chunk);
        while let Some(frame) = decoder.next_frame()? {
            if frame.block_id != block_id {
                return Err(DfsError::Wire(format!(
                    "frame for block {} on upload of block {block_id}",
                    frame.block_id
                )));
            }
            assembler.accept(frame)?;
        }
    }
    if !decoder.is_drained() {
        return Err(DfsError::Wire("trailing bytes after final frame".to_string()));
    }

    let (_, data) = assembler.into_bytes()?;
    Ok(data)
}

fn parse_followers(headers: &HeaderMap) -> Result<Vec<FollowerHint>> {
    let Some(raw) = headers.get(FOLLOWERS_HEADER) else {
        return Ok(Vec::new());
    };
    let raw = raw
        .to_str()
        .map_err(|_| DfsError::Wire("malformed followers header".to_string()))?;
    serde_json::from_str(raw)
        .map_err(|e| DfsError::Wire(format!("malformed followers header: {e}")))
}

/// Leader-side replication handshake. Tries the hinted followers first,
/// then asks the namenode for a fallback target. If every attempt fails,
/// the block is surfaced as under-replicated via a block report.
async fn replicate_to_follower(
    state: Arc<DataNodeState>,
    block_id: Uuid,
    hints: Vec<FollowerHint>,
) {
    let mut candidates = hints;
    if candidates.is_empty() {
        match pick_follower(&state).await {
            Ok(Some(follower)) => candidates.push(follower),
            Ok(None) => {
                tracing::warn!("no follower available for block {block_id}");
            }
            Err(err) => {
                tracing::warn!("follower lookup for block {block_id} failed: {err}");
            }
        }
    }

    for attempt in 1..=REPLICATION_ATTEMPTS {
        for follower in &candidates {
            let request = TransferRequest {
                target_node_id: follower.node_id,
                target_host: follower.hostname.clone(),
                target_port: follower.port,
            };
            match push_block(&state, block_id, &request).await {
                Ok(_) => {
                    let path = format!("/blocks/{block_id}/locations");
                    let body =
                        serde_json::json!({ "node_id": follower.node_id, "is_leader": false });
                    if let Err(err) = state.namenode.post_ack(&path, &body).await {
                        tracing::warn!(
                            "failed to report replica of {block_id} on {}: {err}",
                            follower.node_id
                        );
                    }
                    return;
                }
                Err(err) => {
                    tracing::warn!(
                        "replication of {block_id} to {} failed (attempt {attempt}): {err}",
                        follower.node_id
                    );
                }
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(200 * attempt as u64)).await;
    }

    // Give the namenode a chance to notice the missing replica.
    if let Ok(Some(stored)) = state.store.stat(block_id).await {
        let report = basalt_core::types::BlockReport {
            node_id: state.node_id,
            blocks: vec![ReportedBlock {
                block_id,
                size: stored.size,
                checksum: Some(stored.checksum),
            }],
        };
        if let Err(err) = state.namenode.post_ack("/blocks/report", &report).await {
            tracing::warn!("under-replication report for {block_id} failed: {err}");
        }
    }
}

/// Fallback follower selection: most free space among the other active
/// nodes.
async fn pick_follower(state: &DataNodeState) -> Result<Option<FollowerHint>> {
    let nodes: Vec<DataNodeInfo> = state.namenode.get_json("/datanodes?status=active").await?;
    let mut candidates: Vec<&DataNodeInfo> = nodes
        .iter()
        .filter(|n| n.node_id != state.node_id && n.status == NodeStatus::Active)
        .collect();
    candidates.sort_by(|a, b| {
        b.available_space
            .cmp(&a.available_space)
            .then(a.blocks_stored.cmp(&b.blocks_stored))
            .then(a.node_id.cmp(&b.node_id))
    });
    Ok(candidates.first().map(|n| FollowerHint {
        node_id: n.node_id,
        hostname: n.hostname.clone(),
        port: n.port,
    }))
}

/// Read a block locally and stream it to another storage node.
async fn push_block(
    state: &DataNodeState,
    block_id: Uuid,
    target: &TransferRequest,
) -> Result<StoreBlockResponse> {
    let (data, _) = state.store.retrieve(block_id).await?;
    let frames = split_into_frames(
        block_id,
        &data,
        state.settings.max_frame_bytes,
        state.settings.wire_compression,
    )?;

    let url = format!(
        "http://{}:{}/blocks/{block_id}",
        target.target_host, target.target_port
    );
    let stream = futures::stream::iter(
        frames
            .into_iter()
            .map(Ok::<Bytes, std::convert::Infallible>),
    );
    let response = state
        .client
        .put(&url)
        .timeout(state.settings.block_deadline(data.len() as u64))
        .body(reqwest::Body::wrap_stream(stream))
        .send()
        .await
        .map_err(|e| DfsError::Transient(format!("push to {url} failed: {e}")))?;

    let response = check_response(response).await?;
    response.json().await.map_err(DfsError::http)
}
