//! Upload and download coordination.
//!
//! Uploads: split the file, allocate placement for every block in one
//! metadata call, stream blocks to their leaders through a bounded worker
//! pool, then register blocks and leader locations in offset order and
//! finalise the file entry. A failed upload rolls back: already-stored
//! blocks are deleted best-effort and the file entry is removed.
//!
//! Downloads: resolve path to blocks and locations, fetch replicas in
//! parallel (leader first), fall through to the next replica on checksum
//! or transport failure, and reassemble by offset.

use crate::datanode_client::DataNodeClient;
use crate::namenode_client::NameNodeClient;
use crate::splitter::{join_slices, BlockSlice, FileSplitter};
use basalt_core::error::{DfsError, Result};
use basalt_core::settings::Settings;
use basalt_core::types::{
    BlockAssignment, BlockInfo, FileMeta, FollowerHint, PlacementSpec, RegisterBlockRequest,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use uuid::Uuid;

pub struct PutFileOperation {
    namenode: Arc<NameNodeClient>,
    datanodes: Arc<DataNodeClient>,
    settings: Settings,
}

#[derive(Debug, Clone)]
pub struct PutFileOperationRequest {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub owner: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PutFileOperationResult {
    pub file: FileMeta,
    pub blocks: usize,
    pub bytes: u64,
}

impl PutFileOperation {
    pub fn new(
        namenode: Arc<NameNodeClient>,
        datanodes: Arc<DataNodeClient>,
        settings: Settings,
    ) -> Self {
        Self {
            namenode,
            datanodes,
            settings,
        }
    }

    pub async fn run(&self, request: PutFileOperationRequest) -> Result<PutFileOperationResult> {
        let slices = FileSplitter::new(self.settings.block_size)
            .split_path(&request.local_path)?;
        let total_bytes: u64 = slices.iter().map(|s| s.size()).sum();

        let file = self
            .namenode
            .create_file(&request.remote_path, total_bytes, request.owner.clone())
            .await?;

        if slices.is_empty() {
            return Ok(PutFileOperationResult {
                file,
                blocks: 0,
                bytes: 0,
            });
        }

        let specs: Vec<PlacementSpec> = slices
            .iter()
            .map(|s| PlacementSpec {
                block_id: s.block_id,
                size: s.size(),
            })
            .collect();
        let assignments = match self.namenode.placement(specs, None).await {
            Ok(assignments) => assignments,
            Err(err) => {
                let _ = self.namenode.delete_file(file.file_id).await;
                return Err(err);
            }
        };
        let by_block: HashMap<Uuid, BlockAssignment> = assignments
            .into_iter()
            .map(|a| (a.block_id, a))
            .collect();

        match self.upload_and_register(&file, &slices, &by_block).await {
            Ok(()) => {
                let file = self.namenode.get_file_by_path(&request.remote_path).await?;
                Ok(PutFileOperationResult {
                    blocks: file.blocks.len(),
                    bytes: total_bytes,
                    file,
                })
            }
            Err(err) => {
                tracing::warn!("upload of {} failed, rolling back: {err}", file.path);
                self.rollback(&file, &by_block).await;
                Err(err)
            }
        }
    }

    async fn upload_and_register(
        &self,
        file: &FileMeta,
        slices: &[BlockSlice],
        by_block: &HashMap<Uuid, BlockAssignment>,
    ) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.settings.worker_pool_size.max(1)));
        let mut handles = Vec::with_capacity(slices.len());
        for slice in slices {
            let assignment = by_block
                .get(&slice.block_id)
                .ok_or_else(|| {
                    DfsError::Internal(format!("no placement for block {}", slice.block_id))
                })?
                .clone();
            let datanodes = self.datanodes.clone();
            let semaphore = semaphore.clone();
            let block_id = slice.block_id;
            let data = slice.data.clone();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| DfsError::Internal("worker pool closed".to_string()))?;
                let followers: Vec<FollowerHint> = assignment
                    .followers
                    .iter()
                    .map(|n| FollowerHint {
                        node_id: n.node_id,
                        hostname: n.hostname.clone(),
                        port: n.port,
                    })
                    .collect();
                datanodes
                    .store_block(
                        &assignment.leader.data_endpoint(),
                        block_id,
                        data,
                        &followers,
                    )
                    .await
                    .map(|_| (block_id, assignment.leader.node_id))
            }));
        }

        let mut leader_by_block = HashMap::new();
        let mut failure = None;
        for handle in handles {
            match handle.await {
                Ok(Ok((block_id, leader))) => {
                    leader_by_block.insert(block_id, leader);
                }
                Ok(Err(err)) => failure = Some(err),
                Err(err) => failure = Some(DfsError::Internal(format!("upload task: {err}"))),
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }

        // Register blocks in byte-offset order so the metadata block list
        // reproduces the file.
        for slice in slices {
            let leader = leader_by_block
                .get(&slice.block_id)
                .copied()
                .ok_or_else(|| {
                    DfsError::Internal(format!("block {} was never uploaded", slice.block_id))
                })?;
            self.namenode
                .register_block(&RegisterBlockRequest {
                    block_id: slice.block_id,
                    file_id: file.file_id,
                    size: slice.size(),
                    checksum: Some(slice.checksum.clone()),
                })
                .await?;
            self.namenode
                .add_location(slice.block_id, leader, true)
                .await?;
        }
        Ok(())
    }

    /// Best-effort cleanup after a failed upload: physical block deletes
    /// everywhere they may have landed, then the file entry.
    async fn rollback(&self, file: &FileMeta, by_block: &HashMap<Uuid, BlockAssignment>) {
        for (block_id, assignment) in by_block {
            let targets =
                std::iter::once(&assignment.leader).chain(assignment.followers.iter());
            for node in targets {
                let _ = self
                    .datanodes
                    .delete_block(&node.data_endpoint(), *block_id)
                    .await;
            }
        }
        if let Err(err) = self.namenode.delete_file(file.file_id).await {
            tracing::warn!("rollback could not delete file entry {}: {err}", file.file_id);
        }
    }
}

pub struct GetFileOperation {
    namenode: Arc<NameNodeClient>,
    datanodes: Arc<DataNodeClient>,
    settings: Settings,
}

#[derive(Debug, Clone)]
pub struct GetFileOperationRequest {
    pub remote_path: String,
    pub local_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct GetFileOperationResult {
    pub file: FileMeta,
    pub blocks: usize,
    pub bytes: u64,
}

impl GetFileOperation {
    pub fn new(
        namenode: Arc<NameNodeClient>,
        datanodes: Arc<DataNodeClient>,
        settings: Settings,
    ) -> Self {
        Self {
            namenode,
            datanodes,
            settings,
        }
    }

    pub async fn run(&self, request: GetFileOperationRequest) -> Result<GetFileOperationResult> {
        let file = self.namenode.get_file_by_path(&request.remote_path).await?;
        let blocks = self.namenode.file_blocks(file.file_id).await?;

        if blocks.is_empty() {
            std::fs::write(&request.local_path, b"")?;
            return Ok(GetFileOperationResult {
                file,
                blocks: 0,
                bytes: 0,
            });
        }

        // Blocks come back in metadata order; their offsets are the
        // running sum of sizes.
        let mut offsets = Vec::with_capacity(blocks.len());
        let mut offset = 0u64;
        for block in &blocks {
            offsets.push(offset);
            offset += block.size;
        }

        let semaphore = Arc::new(Semaphore::new(self.settings.worker_pool_size.max(1)));
        let mut handles = Vec::with_capacity(blocks.len());
        for (block, block_offset) in blocks.iter().cloned().zip(offsets) {
            let namenode = self.namenode.clone();
            let datanodes = self.datanodes.clone();
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| DfsError::Internal("worker pool closed".to_string()))?;
                fetch_block(&namenode, &datanodes, &block)
                    .await
                    .map(|data| (block_offset, data))
            }));
        }

        let mut parts: Vec<(u64, Bytes)> = Vec::with_capacity(blocks.len());
        for handle in handles {
            match handle.await {
                Ok(Ok(part)) => parts.push(part),
                Ok(Err(err)) => return Err(err),
                Err(err) => {
                    return Err(DfsError::Internal(format!("download task: {err}")));
                }
            }
        }

        let data = join_slices(parts);
        if data.len() as u64 != file.size {
            return Err(DfsError::Internal(format!(
                "reassembled {} bytes but file {} declares {}",
                data.len(),
                file.path,
                file.size
            )));
        }
        std::fs::write(&request.local_path, &data)?;

        Ok(GetFileOperationResult {
            blocks: blocks.len(),
            bytes: data.len() as u64,
            file,
        })
    }
}

/// Try each replica in preference order (leader first, healthy before
/// suspect). A replica that is missing the block or fails verification is
/// reported to the namenode so it can be pruned and re-replicated.
async fn fetch_block(
    namenode: &NameNodeClient,
    datanodes: &DataNodeClient,
    block: &BlockInfo,
) -> Result<Bytes> {
    let mut ordered = block.locations.clone();
    ordered.sort_by_key(|l| (!l.is_leader, !l.is_healthy()));

    for location in &ordered {
        match datanodes
            .retrieve_block(
                &location.data_endpoint(),
                block.block_id,
                block.checksum.as_deref(),
                block.size,
            )
            .await
        {
            Ok(data) => return Ok(data),
            Err(err) => {
                tracing::warn!(
                    "replica of block {} on {} unusable: {err}",
                    block.block_id,
                    location.node_id
                );
                if matches!(err, DfsError::Corrupt { .. } | DfsError::NotFound(_)) {
                    let _ = namenode
                        .remove_location(block.block_id, location.node_id)
                        .await;
                }
            }
        }
    }

    Err(DfsError::BlockUnavailable(format!(
        "block {}: all {} replicas failed",
        block.block_id,
        ordered.len()
    )))
}
