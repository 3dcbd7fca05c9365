//! Load balancer for the storage tier.
//!
//! A periodic pass on the metadata leader with two jobs: hand blocks
//! carrying more replicas than the replication factor to the replication
//! queue for trimming, and redistribute replicas when disk usage across
//! ACTIVE nodes drifts apart. A rebalance move transfers a non-leader
//! replica from an overloaded node to the least-used underloaded node,
//! records the new location, then drops the source copy, so the replica
//! count of a moved block never changes.

use crate::ha::HaController;
use crate::manager::Manager;
use crate::oplog::MetaOp;
use crate::replicator::{ReplicationReason, ReplicationTask};
use basalt_core::error::{DfsError, Result};
use basalt_core::types::{DataNodeInfo, NodeStatus, TransferRequest};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// At most this many moves per cycle across the whole cluster.
const MAX_MOVES_PER_CYCLE: usize = 16;

/// Used fraction of a node's declared capacity.
pub fn utilization(node: &DataNodeInfo) -> f64 {
    if node.storage_capacity == 0 {
        return 0.0;
    }
    let used = node.storage_capacity.saturating_sub(node.available_space);
    used as f64 / node.storage_capacity as f64
}

pub struct Balancer {
    manager: Manager,
    ha: Arc<HaController>,
    repl_tx: mpsc::Sender<ReplicationTask>,
    client: reqwest::Client,
    threshold: f64,
    interval_secs: u64,
}

struct Move {
    block_id: Uuid,
    size: u64,
    source: DataNodeInfo,
    target: DataNodeInfo,
}

impl Balancer {
    pub fn new(
        manager: Manager,
        ha: Arc<HaController>,
        repl_tx: mpsc::Sender<ReplicationTask>,
        threshold: f64,
        interval_secs: u64,
    ) -> Self {
        Self {
            manager,
            ha,
            repl_tx,
            client: reqwest::Client::new(),
            threshold,
            interval_secs,
        }
    }

    pub async fn run(self) {
        let grace = Duration::from_secs(self.manager.settings().staleness_cutoff_secs());
        let mut interval = tokio::time::interval(Duration::from_secs(self.interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if !self.ha.is_leader() {
                continue;
            }
            // Same grace as the staleness monitor: let the datanodes find
            // a freshly promoted leader before judging their usage.
            if self.ha.leadership_age().map_or(true, |age| age < grace) {
                continue;
            }
            if let Err(err) = self.cycle().await {
                tracing::error!("balance cycle failed: {err}");
            }
        }
    }

    async fn cycle(&self) -> Result<()> {
        // Surplus replicas go through the replication queue, which trims
        // them from the fullest nodes.
        let replication_factor = self.manager.settings().replication_factor;
        for block_id in self
            .manager
            .store()
            .over_replicated_blocks(replication_factor)?
        {
            let task = ReplicationTask::new(block_id, ReplicationReason::OverReplicated);
            if self.repl_tx.send(task).await.is_err() {
                tracing::warn!("replication queue closed during balance cycle");
                return Ok(());
            }
        }

        let nodes = self.manager.list_datanodes(Some(NodeStatus::Active))?;
        if nodes.len() < 2 {
            return Ok(());
        }
        if !self.should_rebalance(&nodes) {
            return Ok(());
        }

        let plan = self.create_move_plan(&nodes)?;
        if plan.is_empty() {
            return Ok(());
        }
        tracing::info!("rebalancing {} block replicas", plan.len());

        let mut moved = 0usize;
        for entry in plan {
            match self.execute_move(&entry).await {
                Ok(()) => moved += 1,
                Err(err) => {
                    tracing::warn!(
                        "move of block {} from {} to {} failed: {err}",
                        entry.block_id,
                        entry.source.node_id,
                        entry.target.node_id
                    );
                }
            }
        }
        if moved > 0 {
            tracing::info!("balance cycle moved {moved} block replicas");
        }
        Ok(())
    }

    /// Rebalance when any node's usage drifts beyond the threshold from
    /// the cluster average.
    fn should_rebalance(&self, nodes: &[DataNodeInfo]) -> bool {
        let average = average_utilization(nodes);
        nodes
            .iter()
            .any(|n| (utilization(n) - average).abs() > self.threshold)
    }

    /// Plan moves from overloaded nodes to underloaded ones. Per cycle a
    /// node sheds at most a quarter of its replicas, largest blocks
    /// first, and only non-leader replicas of blocks that meet the
    /// replication factor.
    fn create_move_plan(&self, nodes: &[DataNodeInfo]) -> Result<Vec<Move>> {
        let average = average_utilization(nodes);
        let replication_factor = self.manager.settings().replication_factor;

        let mut overloaded: Vec<&DataNodeInfo> = nodes
            .iter()
            .filter(|n| utilization(n) > average + self.threshold)
            .collect();
        overloaded.sort_by(|a, b| utilization(b).total_cmp(&utilization(a)));

        let underloaded: Vec<&DataNodeInfo> = nodes
            .iter()
            .filter(|n| utilization(n) < average - self.threshold)
            .collect();
        if overloaded.is_empty() || underloaded.is_empty() {
            return Ok(Vec::new());
        }

        // Working view of target free space, decremented as moves are
        // planned.
        let mut target_free: Vec<(DataNodeInfo, u64)> = underloaded
            .iter()
            .map(|n| ((*n).clone(), n.available_space))
            .collect();

        let mut plan = Vec::new();
        for source in overloaded {
            let held = self.manager.store().blocks_on_node(source.node_id)?;
            let per_node_cap = (held.len() / 4).max(1);

            let mut movable = Vec::new();
            for block_id in held {
                let block = match self.manager.get_block(block_id) {
                    Ok(block) => block,
                    Err(_) => continue,
                };
                let healthy = block.locations.iter().filter(|l| l.is_healthy()).count();
                let source_row = block
                    .locations
                    .iter()
                    .find(|l| l.node_id == source.node_id);
                let movable_row = source_row.map_or(false, |l| !l.is_leader && l.is_healthy());
                // Moving must not endanger the block.
                if movable_row && healthy as u32 >= replication_factor {
                    movable.push(block);
                }
            }
            movable.sort_by(|a, b| b.size.cmp(&a.size));

            for block in movable.into_iter().take(per_node_cap) {
                if plan.len() >= MAX_MOVES_PER_CYCLE {
                    return Ok(plan);
                }
                let holders: Vec<Uuid> = block.locations.iter().map(|l| l.node_id).collect();
                // Least-used target that has room and no copy yet.
                let slot = target_free
                    .iter_mut()
                    .filter(|(node, free)| {
                        !holders.contains(&node.node_id) && *free >= block.size
                    })
                    .min_by(|a, b| utilization(&a.0).total_cmp(&utilization(&b.0)));
                let Some((target, free)) = slot else {
                    continue;
                };
                *free = free.saturating_sub(block.size);
                plan.push(Move {
                    block_id: block.block_id,
                    size: block.size,
                    source: source.clone(),
                    target: target.clone(),
                });
            }
        }
        Ok(plan)
    }

    /// Transfer the replica, record the new location, then retire the
    /// source copy.
    async fn execute_move(&self, entry: &Move) -> Result<()> {
        let request = TransferRequest {
            target_node_id: entry.target.node_id,
            target_host: entry.target.hostname.clone(),
            target_port: entry.target.port,
        };
        let url = format!(
            "{}/blocks/{}/transfer",
            entry.source.data_endpoint(),
            entry.block_id
        );
        let response = self
            .client
            .post(&url)
            .timeout(self.manager.settings().block_deadline(entry.size))
            .json(&request)
            .send()
            .await
            .map_err(|e| DfsError::Transient(format!("transfer rpc failed: {e}")))?;
        if !response.status().is_success() {
            return Err(DfsError::Transient(format!(
                "transfer returned {}",
                response.status()
            )));
        }

        self.manager
            .add_location(entry.block_id, entry.target.node_id, false)?;
        self.ha.record(MetaOp::AddLocation {
            block_id: entry.block_id,
            node_id: entry.target.node_id,
            is_leader: false,
        });

        self.manager
            .remove_location(entry.block_id, entry.source.node_id)?;
        self.ha.record(MetaOp::RemoveLocation {
            block_id: entry.block_id,
            node_id: entry.source.node_id,
        });
        let delete_url = format!(
            "{}/blocks/{}",
            entry.source.data_endpoint(),
            entry.block_id
        );
        if let Err(err) = self.client.delete(&delete_url).send().await {
            tracing::warn!(
                "physical delete of moved replica {} on {} failed: {err}",
                entry.block_id,
                entry.source.node_id
            );
        }

        tracing::info!(
            "moved replica of block {} from {} to {}",
            entry.block_id,
            entry.source.node_id,
            entry.target.node_id
        );
        Ok(())
    }
}

fn average_utilization(nodes: &[DataNodeInfo]) -> f64 {
    if nodes.is_empty() {
        return 0.0;
    }
    nodes.iter().map(utilization).sum::<f64>() / nodes.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn node(capacity: u64, available: u64) -> DataNodeInfo {
        DataNodeInfo {
            node_id: Uuid::new_v4(),
            hostname: "127.0.0.1".to_string(),
            port: 9300,
            status: NodeStatus::Active,
            storage_capacity: capacity,
            available_space: available,
            last_heartbeat: Some(Utc::now()),
            blocks_stored: 0,
        }
    }

    #[test]
    fn test_utilization() {
        assert_eq!(utilization(&node(100, 100)), 0.0);
        assert_eq!(utilization(&node(100, 25)), 0.75);
        // A node declaring zero capacity is treated as empty, not full.
        assert_eq!(utilization(&node(0, 0)), 0.0);
    }

    #[test]
    fn test_average_utilization() {
        let nodes = vec![node(100, 100), node(100, 0)];
        assert_eq!(average_utilization(&nodes), 0.5);
        assert_eq!(average_utilization(&[]), 0.0);
    }
}
