//! Replication coordinator.
//!
//! Consumes a FIFO queue of blocks with a suspect replica count,
//! re-checks their health, and repairs in either direction: blocks below
//! the replication factor get a `TransferBlock` push from a healthy
//! source to a freshly placed target, blocks above it have their excess
//! replicas trimmed from the fullest nodes. Failed attempts requeue with
//! exponential backoff; after the attempt cap the block is marked
//! degraded but never silently dropped.

use crate::balancer::utilization;
use crate::ha::HaController;
use crate::manager::Manager;
use crate::oplog::MetaOp;
use basalt_core::error::{DfsError, Result};
use basalt_core::types::{BlockInfo, BlockLocationInfo, PlacementSpec, TransferRequest};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

const QUEUE_DEPTH: usize = 1024;
const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_CAP_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationReason {
    UnderReplicated,
    OverReplicated,
    SuspectLocation,
    ExplicitRepair,
}

#[derive(Debug, Clone)]
pub struct ReplicationTask {
    pub block_id: Uuid,
    pub reason: ReplicationReason,
    pub attempt: u32,
}

impl ReplicationTask {
    pub fn new(block_id: Uuid, reason: ReplicationReason) -> Self {
        Self {
            block_id,
            reason,
            attempt: 0,
        }
    }
}

pub fn queue() -> (mpsc::Sender<ReplicationTask>, mpsc::Receiver<ReplicationTask>) {
    mpsc::channel(QUEUE_DEPTH)
}

pub struct Replicator {
    manager: Manager,
    ha: Arc<HaController>,
    tx: mpsc::Sender<ReplicationTask>,
    client: reqwest::Client,
}

impl Replicator {
    pub fn new(manager: Manager, ha: Arc<HaController>, tx: mpsc::Sender<ReplicationTask>) -> Self {
        Self {
            manager,
            ha,
            tx,
            client: reqwest::Client::new(),
        }
    }

    pub async fn run(self, mut rx: mpsc::Receiver<ReplicationTask>) {
        while let Some(task) = rx.recv().await {
            if !self.ha.is_leader() {
                // Stale queue entries from before a failover are dropped;
                // the new leader rebuilds its own view.
                continue;
            }
            if let Err(err) = self.process(&task).await {
                tracing::warn!(
                    "replication of block {} failed (attempt {}): {err}",
                    task.block_id,
                    task.attempt + 1
                );
                self.requeue(task);
            }
        }
    }

    async fn process(&self, task: &ReplicationTask) -> Result<()> {
        let replication_factor = self.manager.settings().replication_factor;

        // The block may be gone (file deleted) by the time we get here.
        let block = match self.manager.get_block(task.block_id) {
            Ok(block) => block,
            Err(DfsError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };

        let healthy: Vec<_> = block.locations.iter().filter(|l| l.is_healthy()).collect();
        if healthy.len() as u32 > replication_factor {
            self.trim_excess(&block, &healthy, replication_factor).await?;
        }
        if healthy.len() as u32 >= replication_factor {
            self.drop_suspect_rows(task.block_id)?;
            if block.degraded {
                self.manager.store().set_block_degraded(task.block_id, false)?;
            }
            return Ok(());
        }

        // A block with no healthy replica at all cannot be repaired from
        // inside the cluster; surface it loudly.
        let Some(source) = healthy
            .iter()
            .find(|l| l.is_leader)
            .or_else(|| healthy.first())
        else {
            tracing::error!(
                "block {} has zero healthy replicas and cannot be recovered",
                task.block_id
            );
            self.manager.store().set_block_degraded(task.block_id, true)?;
            return Ok(());
        };

        let holders: Vec<Uuid> = block.locations.iter().map(|l| l.node_id).collect();
        let spec = PlacementSpec {
            block_id: task.block_id,
            size: block.size,
        };
        let assignment = self
            .manager
            .place_blocks(std::slice::from_ref(&spec), 1, &holders)?
            .into_iter()
            .next()
            .ok_or_else(|| DfsError::NoEligibleNodes("empty placement".to_string()))?;
        let target = assignment.leader;

        let request = TransferRequest {
            target_node_id: target.node_id,
            target_host: target.hostname.clone(),
            target_port: target.port,
        };
        let url = format!(
            "{}/blocks/{}/transfer",
            source.data_endpoint(),
            task.block_id
        );
        let response = self
            .client
            .post(&url)
            .timeout(self.manager.settings().block_deadline(block.size))
            .json(&request)
            .send()
            .await
            .map_err(|e| DfsError::Transient(format!("transfer rpc failed: {e}")))?;
        if !response.status().is_success() {
            return Err(DfsError::Transient(format!(
                "transfer of {} via {} returned {}",
                task.block_id,
                source.node_id,
                response.status()
            )));
        }

        self.manager
            .add_location(task.block_id, target.node_id, false)?;
        self.ha.record(MetaOp::AddLocation {
            block_id: task.block_id,
            node_id: target.node_id,
            is_leader: false,
        });
        tracing::info!(
            "re-replicated block {} from {} to {}",
            task.block_id,
            source.node_id,
            target.node_id
        );

        self.drop_suspect_rows(task.block_id)?;
        if block.degraded {
            self.manager.store().set_block_degraded(task.block_id, false)?;
        }

        // With replication factors above two a single transfer may not be
        // enough; keep the block queued until it is healthy.
        if (self.manager.healthy_location_count(task.block_id)? as u32) < replication_factor {
            let _ = self
                .tx
                .send(ReplicationTask::new(task.block_id, task.reason))
                .await;
        }
        Ok(())
    }

    /// Drop surplus replicas of an over-replicated block, fullest nodes
    /// first. The leader copy is never trimmed.
    async fn trim_excess(
        &self,
        block: &BlockInfo,
        healthy: &[&BlockLocationInfo],
        replication_factor: u32,
    ) -> Result<()> {
        let excess = healthy.len().saturating_sub(replication_factor as usize);

        let mut candidates = Vec::new();
        for location in healthy.iter().filter(|l| !l.is_leader) {
            let node = self.manager.get_datanode(location.node_id)?;
            candidates.push((utilization(&node), *location));
        }
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

        for (_, location) in candidates.into_iter().take(excess) {
            self.manager
                .remove_location(block.block_id, location.node_id)?;
            self.ha.record(MetaOp::RemoveLocation {
                block_id: block.block_id,
                node_id: location.node_id,
            });
            let url = format!("{}/blocks/{}", location.data_endpoint(), block.block_id);
            if let Err(err) = self.client.delete(&url).send().await {
                tracing::warn!(
                    "physical delete of surplus replica {} on {} failed: {err}",
                    block.block_id,
                    location.node_id
                );
            }
            tracing::info!(
                "trimmed surplus replica of block {} from {}",
                block.block_id,
                location.node_id
            );
        }
        Ok(())
    }

    /// Once re-replicated, suspect rows whose node is still INACTIVE are
    /// dropped.
    fn drop_suspect_rows(&self, block_id: Uuid) -> Result<()> {
        for node_id in self
            .manager
            .store()
            .remove_suspect_inactive_locations(block_id)?
        {
            self.ha.record(MetaOp::RemoveLocation { block_id, node_id });
        }
        Ok(())
    }

    fn requeue(&self, task: ReplicationTask) {
        let max_attempts = self.manager.settings().replication_max_attempts;
        let attempt = task.attempt + 1;
        if attempt >= max_attempts {
            tracing::error!(
                "giving up on block {} after {attempt} attempts, marking degraded",
                task.block_id
            );
            if let Err(err) = self.manager.store().set_block_degraded(task.block_id, true) {
                tracing::error!("cannot mark block {} degraded: {err}", task.block_id);
            }
            return;
        }

        let backoff = Duration::from_millis(
            (BACKOFF_BASE_MS << attempt.min(16)).min(BACKOFF_CAP_MS),
        );
        let tx = self.tx.clone();
        let retry = ReplicationTask { attempt, ..task };
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            if let Err(err) = tx.send(retry).await {
                tracing::warn!("replication queue closed: {err}");
            }
        });
    }
}
