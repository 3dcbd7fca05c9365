//! Datanode staleness monitor.
//!
//! A periodic sweep on the metadata leader: nodes that missed enough
//! heartbeats become INACTIVE and their replicas turn suspect; nodes that
//! stay INACTIVE past the retirement window are dropped from the registry
//! entirely. Affected blocks are queued for re-replication.

use crate::ha::HaController;
use crate::manager::Manager;
use crate::oplog::MetaOp;
use crate::replicator::{ReplicationReason, ReplicationTask};
use basalt_core::types::NodeStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub struct Monitor {
    manager: Manager,
    ha: Arc<HaController>,
    repl_tx: mpsc::Sender<ReplicationTask>,
    retire_after_secs: u64,
}

impl Monitor {
    pub fn new(
        manager: Manager,
        ha: Arc<HaController>,
        repl_tx: mpsc::Sender<ReplicationTask>,
        retire_after_secs: u64,
    ) -> Self {
        Self {
            manager,
            ha,
            repl_tx,
            retire_after_secs,
        }
    }

    pub async fn run(self) {
        let sweep_secs = self.manager.settings().heartbeat_interval_secs;
        let grace = Duration::from_secs(self.manager.settings().staleness_cutoff_secs());
        let mut interval = tokio::time::interval(Duration::from_secs(sweep_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if !self.ha.is_leader() {
                continue;
            }
            // After a failover the datanodes need one heartbeat window to
            // find the new leader; sweeping earlier would demote them all.
            if self.ha.leadership_age().map_or(true, |age| age < grace) {
                continue;
            }
            if let Err(err) = self.sweep().await {
                tracing::error!("staleness sweep failed: {err}");
            }
        }
    }

    async fn sweep(&self) -> basalt_core::Result<()> {
        for (node_id, blocks) in self.manager.mark_stale_nodes()? {
            self.ha.record(MetaOp::SetNodeStatus {
                node_id,
                status: NodeStatus::Inactive,
            });
            for block_id in blocks {
                let task = ReplicationTask::new(block_id, ReplicationReason::SuspectLocation);
                if self.repl_tx.send(task).await.is_err() {
                    tracing::warn!("replication queue closed during sweep");
                    return Ok(());
                }
            }
        }

        for (node_id, blocks) in self.manager.retire_nodes(self.retire_after_secs)? {
            self.ha.record(MetaOp::RetireDataNode { node_id });
            for block_id in blocks {
                let task = ReplicationTask::new(block_id, ReplicationReason::UnderReplicated);
                if self.repl_tx.send(task).await.is_err() {
                    tracing::warn!("replication queue closed during sweep");
                    return Ok(());
                }
            }
        }

        Ok(())
    }
}
