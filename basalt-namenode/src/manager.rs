//! Metadata manager: the authoritative namespace.
//!
//! Enforces the namespace invariants (unique canonical paths, parents
//! before children, non-empty directories only removed recursively), owns
//! the placement policy, and is the single gateway to the metadata store
//! for both client-facing handlers and the follower's sync apply path.

use crate::oplog::MetaOp;
use crate::store::{BlockRecord, FileRecord, LocationRecord, MetadataStore};
use basalt_core::error::{DfsError, Result};
use basalt_core::paths;
use basalt_core::settings::Settings;
use basalt_core::types::{
    BlockAssignment, BlockInfo, BlockLocationInfo, BlockReport, ClusterStatus, DataNodeInfo,
    DirectoryListing, DirectoryMeta, EntryKind, FileMeta, ListEntry, NodeStatus, PlacementSpec,
    RegisterBlockRequest, RegisterDataNodeRequest,
};
use chrono::{Duration, Utc};
use uuid::Uuid;

#[derive(Clone)]
pub struct Manager {
    store: MetadataStore,
    settings: Settings,
}

impl Manager {
    pub fn new(store: MetadataStore, settings: Settings) -> Self {
        Self { store, settings }
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // === namespace ===

    pub fn create_directory(&self, path: &str, owner: Option<&str>) -> Result<DirectoryMeta> {
        let path = paths::canonicalize(path)?;
        if path == "/" {
            return Err(DfsError::AlreadyExists("/".to_string()));
        }
        let parent = paths::parent(&path)
            .ok_or_else(|| DfsError::InvalidPath(path.clone()))?;
        if self.store.get_directory(&parent)?.is_none() {
            return Err(DfsError::ParentMissing(parent));
        }
        if self.store.get_directory(&path)?.is_some()
            || self.store.get_file_by_path(&path)?.is_some()
        {
            return Err(DfsError::AlreadyExists(path));
        }

        let now = Utc::now();
        self.store.insert_directory(&path, &parent, owner, now)?;
        Ok(DirectoryMeta {
            path,
            owner: owner.map(str::to_string),
            created_at: now,
        })
    }

    /// Remove a directory. Non-recursive removal of a non-empty directory
    /// fails `NotEmpty`. Returns the blocks (with locations) that were
    /// dropped, so physical replicas can be deleted best-effort.
    pub fn remove_directory(&self, path: &str, recursive: bool) -> Result<Vec<BlockInfo>> {
        let path = paths::canonicalize(path)?;
        if path == "/" {
            return Err(DfsError::InvalidPath("cannot remove the root".to_string()));
        }
        if self.store.get_directory(&path)?.is_none() {
            return Err(DfsError::NotFound(path));
        }

        if !self.store.has_children(&path)? {
            self.store.delete_directory(&path)?;
            return Ok(Vec::new());
        }
        if !recursive {
            return Err(DfsError::NotEmpty(path));
        }

        // Resolve doomed blocks with their locations before the rows go.
        let mut doomed = Vec::new();
        for file in self.store.files_in_subtree(&path)? {
            for block in self.store.blocks_of_file(file.file_id)? {
                doomed.push(self.block_info(block)?);
            }
        }
        self.store.delete_subtree(&path)?;
        Ok(doomed)
    }

    pub fn list_directory(&self, path: &str) -> Result<DirectoryListing> {
        let path = paths::canonicalize(path)?;
        if self.store.get_directory(&path)?.is_none() {
            return Err(DfsError::NotFound(path));
        }

        let (dirs, files) = self.store.list_children(&path)?;
        let mut entries = Vec::with_capacity(dirs.len() + files.len());
        for dir in dirs {
            entries.push(ListEntry {
                name: paths::name(&dir.path),
                path: dir.path,
                kind: EntryKind::Directory,
                size: 0,
                owner: dir.owner,
                file_id: None,
            });
        }
        for file in files {
            entries.push(ListEntry {
                name: file.name,
                path: file.path,
                kind: EntryKind::File,
                size: file.size,
                owner: file.owner,
                file_id: Some(file.file_id),
            });
        }
        Ok(DirectoryListing { path, entries })
    }

    // === files ===

    pub fn create_file(
        &self,
        path: &str,
        size: u64,
        owner: Option<&str>,
    ) -> Result<FileMeta> {
        self.create_file_with_id(Uuid::new_v4(), path, size, owner)
    }

    /// Create a file entry with a caller-supplied id. The sync apply path
    /// uses this so both metadata nodes agree on identifiers.
    pub fn create_file_with_id(
        &self,
        file_id: Uuid,
        path: &str,
        size: u64,
        owner: Option<&str>,
    ) -> Result<FileMeta> {
        let path = paths::canonicalize(path)?;
        if path == "/" {
            return Err(DfsError::InvalidPath("/ is a directory".to_string()));
        }
        let parent = paths::parent(&path)
            .ok_or_else(|| DfsError::InvalidPath(path.clone()))?;
        if self.store.get_directory(&parent)?.is_none() {
            return Err(DfsError::ParentMissing(parent));
        }
        if self.store.get_file_by_path(&path)?.is_some()
            || self.store.get_directory(&path)?.is_some()
        {
            return Err(DfsError::AlreadyExists(path));
        }

        let now = Utc::now();
        let record = FileRecord {
            file_id,
            path: path.clone(),
            name: paths::name(&path),
            size,
            owner: owner.map(str::to_string),
            created_at: now,
            modified_at: now,
        };
        self.store.insert_file(&record, &parent)?;
        Ok(self.file_meta(record, Vec::new()))
    }

    pub fn get_file(&self, file_id: Uuid) -> Result<FileMeta> {
        let record = self
            .store
            .get_file(file_id)?
            .ok_or_else(|| DfsError::NotFound(format!("file {file_id}")))?;
        let blocks = self.store.blocks_of_file(file_id)?;
        Ok(self.file_meta(record, blocks))
    }

    pub fn get_file_by_path(&self, path: &str) -> Result<FileMeta> {
        let path = paths::canonicalize(path)?;
        let record = self
            .store
            .get_file_by_path(&path)?
            .ok_or_else(|| DfsError::NotFound(path))?;
        let blocks = self.store.blocks_of_file(record.file_id)?;
        Ok(self.file_meta(record, blocks))
    }

    pub fn delete_file(&self, file_id: Uuid) -> Result<(FileMeta, Vec<BlockInfo>)> {
        let meta = self.get_file(file_id)?;
        let mut doomed = Vec::new();
        for block in self.store.blocks_of_file(file_id)? {
            doomed.push(self.block_info(block)?);
        }
        self.store.delete_file(file_id)?;
        Ok((meta, doomed))
    }

    // === blocks ===

    pub fn register_block(&self, request: &RegisterBlockRequest) -> Result<()> {
        if self.store.get_file(request.file_id)?.is_none() {
            return Err(DfsError::NotFound(format!("file {}", request.file_id)));
        }
        if self.store.get_block(request.block_id)?.is_some() {
            return Err(DfsError::AlreadyExists(format!(
                "block {}",
                request.block_id
            )));
        }
        let seq = self.store.next_block_seq(request.file_id)?;
        self.store.insert_block(
            request.block_id,
            request.file_id,
            seq,
            request.size,
            request.checksum.as_deref(),
        )?;
        self.store.touch_file(request.file_id, Utc::now())?;
        Ok(())
    }

    /// Returns true when the location row was new.
    pub fn add_location(&self, block_id: Uuid, node_id: Uuid, is_leader: bool) -> Result<bool> {
        if self.store.get_datanode(node_id)?.is_none() {
            return Err(DfsError::NotFound(format!("datanode {node_id}")));
        }
        self.store.upsert_location(block_id, node_id, is_leader)
    }

    pub fn remove_location(&self, block_id: Uuid, node_id: Uuid) -> Result<bool> {
        self.store.remove_location(block_id, node_id)
    }

    pub fn get_block(&self, block_id: Uuid) -> Result<BlockInfo> {
        let record = self
            .store
            .get_block(block_id)?
            .ok_or_else(|| DfsError::NotFound(format!("block {block_id}")))?;
        self.block_info(record)
    }

    pub fn blocks_of_file(&self, file_id: Uuid) -> Result<Vec<BlockInfo>> {
        if self.store.get_file(file_id)?.is_none() {
            return Err(DfsError::NotFound(format!("file {file_id}")));
        }
        let mut blocks = Vec::new();
        for record in self.store.blocks_of_file(file_id)? {
            blocks.push(self.block_info(record)?);
        }
        Ok(blocks)
    }

    pub fn healthy_location_count(&self, block_id: Uuid) -> Result<usize> {
        Ok(self
            .store
            .locations_of_block(block_id)?
            .iter()
            .filter(|l| location_is_healthy(l))
            .count())
    }

    // === datanodes ===

    pub fn register_datanode(&self, request: &RegisterDataNodeRequest) -> Result<DataNodeInfo> {
        let node_id = request.node_id.unwrap_or_else(Uuid::new_v4);
        let previous = self.store.get_datanode(node_id)?;
        let info = DataNodeInfo {
            node_id,
            hostname: request.hostname.clone(),
            port: request.port,
            status: NodeStatus::Active,
            storage_capacity: request.storage_capacity,
            available_space: request.available_space,
            last_heartbeat: Some(Utc::now()),
            blocks_stored: previous.map(|p| p.blocks_stored).unwrap_or(0),
        };
        self.store.upsert_datanode(&info)?;
        // A returning node's replicas are no longer suspect.
        self.store.clear_locations_suspect(node_id)?;
        Ok(info)
    }

    /// Returns true when the heartbeat reactivated an INACTIVE node.
    pub fn heartbeat(&self, node_id: Uuid, available_space: u64, blocks_stored: u64) -> Result<bool> {
        let node = self
            .store
            .get_datanode(node_id)?
            .ok_or_else(|| DfsError::NotFound(format!("datanode {node_id}")))?;
        self.store
            .record_heartbeat(node_id, available_space, blocks_stored, Utc::now())?;
        if node.status == NodeStatus::Inactive {
            tracing::info!("datanode {node_id} is heartbeating again, reactivating");
            self.store.set_node_status(node_id, NodeStatus::Active)?;
            self.store.clear_locations_suspect(node_id)?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn list_datanodes(&self, status: Option<NodeStatus>) -> Result<Vec<DataNodeInfo>> {
        self.store.list_datanodes(status)
    }

    pub fn get_datanode(&self, node_id: Uuid) -> Result<DataNodeInfo> {
        self.store
            .get_datanode(node_id)?
            .ok_or_else(|| DfsError::NotFound(format!("datanode {node_id}")))
    }

    /// Reconcile a storage node's block report. Idempotent: re-reporting
    /// identical content changes nothing. Returns the locations actually
    /// added and the reported blocks still below the replication factor.
    pub fn apply_block_report(&self, report: &BlockReport) -> Result<BlockReportOutcome> {
        if self.store.get_datanode(report.node_id)?.is_none() {
            return Err(DfsError::NotFound(format!("datanode {}", report.node_id)));
        }

        let mut added = Vec::new();
        let mut under_replicated = Vec::new();
        for reported in &report.blocks {
            // Blocks unknown to metadata are orphans; they stay on disk
            // until a future reconciliation sweep collects them.
            if self.store.get_block(reported.block_id)?.is_none() {
                continue;
            }
            if self
                .store
                .insert_location_if_absent(reported.block_id, report.node_id)?
            {
                added.push(reported.block_id);
            }
            let healthy = self.healthy_location_count(reported.block_id)?;
            if (healthy as u32) < self.settings.replication_factor {
                under_replicated.push(reported.block_id);
            }
        }
        Ok(BlockReportOutcome {
            added,
            under_replicated,
        })
    }

    // === placement ===

    /// Choose a leader and followers for each block.
    ///
    /// Candidates are ACTIVE nodes with room for the block, ordered by
    /// free space descending, then fewest blocks stored, then node id.
    /// Selections decrement a working view of free space so consecutive
    /// blocks rotate off the same nodes.
    pub fn place_blocks(
        &self,
        specs: &[PlacementSpec],
        replication_factor: u32,
        exclude: &[Uuid],
    ) -> Result<Vec<BlockAssignment>> {
        let nodes = self.store.list_datanodes(Some(NodeStatus::Active))?;
        let mut working: Vec<WorkingNode> = nodes
            .into_iter()
            .filter(|info| !exclude.contains(&info.node_id))
            .map(|info| WorkingNode {
                free: info.available_space,
                assigned: info.blocks_stored,
                info,
            })
            .collect();

        let mut assignments = Vec::with_capacity(specs.len());
        for spec in specs {
            working.sort_by(|a, b| {
                b.free
                    .cmp(&a.free)
                    .then(a.assigned.cmp(&b.assigned))
                    .then(a.info.node_id.to_string().cmp(&b.info.node_id.to_string()))
            });

            let chosen: Vec<usize> = working
                .iter()
                .enumerate()
                .filter(|(_, n)| n.free > 0 && n.free >= spec.size)
                .map(|(i, _)| i)
                .take(replication_factor as usize)
                .collect();

            if (chosen.len() as u32) < replication_factor {
                return Err(DfsError::NoEligibleNodes(format!(
                    "need {replication_factor} active nodes with {} bytes free, found {}",
                    spec.size,
                    chosen.len()
                )));
            }

            let leader = working[chosen[0]].info.clone();
            let followers = chosen[1..]
                .iter()
                .map(|&i| working[i].info.clone())
                .collect();
            for &i in &chosen {
                working[i].free = working[i].free.saturating_sub(spec.size);
                working[i].assigned += 1;
            }

            assignments.push(BlockAssignment {
                block_id: spec.block_id,
                leader,
                followers,
            });
        }
        Ok(assignments)
    }

    // === staleness and retirement ===

    /// Transition ACTIVE nodes without a recent heartbeat to INACTIVE and
    /// mark their replicas suspect. Returns each demoted node with the
    /// blocks it held.
    pub fn mark_stale_nodes(&self) -> Result<Vec<(Uuid, Vec<Uuid>)>> {
        let cutoff = Utc::now() - Duration::seconds(self.settings.staleness_cutoff_secs() as i64);
        let mut demoted = Vec::new();
        for node_id in self.store.stale_active_nodes(cutoff)? {
            tracing::warn!("datanode {node_id} missed heartbeats, marking inactive");
            self.store.set_node_status(node_id, NodeStatus::Inactive)?;
            self.store.mark_locations_suspect(node_id)?;
            demoted.push((node_id, self.store.blocks_on_node(node_id)?));
        }
        Ok(demoted)
    }

    /// Drop nodes that stayed INACTIVE past the retirement window.
    pub fn retire_nodes(&self, retire_after_secs: u64) -> Result<Vec<(Uuid, Vec<Uuid>)>> {
        let cutoff = Utc::now() - Duration::seconds(retire_after_secs as i64);
        let mut retired = Vec::new();
        for node_id in self.store.inactive_since(cutoff)? {
            tracing::info!("retiring long-inactive datanode {node_id}");
            let blocks = self.store.delete_datanode(node_id)?;
            retired.push((node_id, blocks));
        }
        Ok(retired)
    }

    pub fn cluster_status(
        &self,
        node_id: &str,
        role: &str,
        term: u64,
        leader_hint: Option<String>,
    ) -> Result<ClusterStatus> {
        Ok(ClusterStatus {
            node_id: node_id.to_string(),
            role: role.to_string(),
            term,
            leader_hint,
            datanodes: self.store.list_datanodes(None)?,
            files: self.store.count_files()?,
            blocks: self.store.count_blocks()?,
            under_replicated: self
                .store
                .under_replicated_blocks(self.settings.replication_factor)?
                .len() as u64,
            over_replicated: self
                .store
                .over_replicated_blocks(self.settings.replication_factor)?
                .len() as u64,
            degraded_blocks: self.store.degraded_block_ids()?,
        })
    }

    // === sync apply path ===

    /// Apply a replicated operation on the follower. Tolerant of replays:
    /// `AlreadyExists`/`NotFound` outcomes are treated as already applied.
    pub fn apply(&self, op: &MetaOp) -> Result<()> {
        let outcome = match op {
            MetaOp::Mkdir { path, owner } => self
                .create_directory(path, owner.as_deref())
                .map(|_| ()),
            MetaOp::Rmdir { path, recursive } => {
                self.remove_directory(path, *recursive).map(|_| ())
            }
            MetaOp::CreateFile {
                file_id,
                path,
                size,
                owner,
            } => self
                .create_file_with_id(*file_id, path, *size, owner.as_deref())
                .map(|_| ()),
            MetaOp::DeleteFile { file_id } => self.delete_file(*file_id).map(|_| ()),
            MetaOp::RegisterBlock {
                block_id,
                file_id,
                size,
                checksum,
            } => self.register_block(&RegisterBlockRequest {
                block_id: *block_id,
                file_id: *file_id,
                size: *size,
                checksum: checksum.clone(),
            }),
            MetaOp::AddLocation {
                block_id,
                node_id,
                is_leader,
            } => self
                .store
                .upsert_location(*block_id, *node_id, *is_leader)
                .map(|_| ()),
            MetaOp::RemoveLocation { block_id, node_id } => {
                self.store.remove_location(*block_id, *node_id).map(|_| ())
            }
            MetaOp::RegisterDataNode {
                node_id,
                hostname,
                port,
                storage_capacity,
                available_space,
            } => self
                .register_datanode(&RegisterDataNodeRequest {
                    node_id: Some(*node_id),
                    hostname: hostname.clone(),
                    port: *port,
                    storage_capacity: *storage_capacity,
                    available_space: *available_space,
                })
                .map(|_| ()),
            MetaOp::SetNodeStatus { node_id, status } => {
                self.store.set_node_status(*node_id, *status).map(|_| ())
            }
            MetaOp::RetireDataNode { node_id } => {
                self.store.delete_datanode(*node_id).map(|_| ())
            }
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(DfsError::AlreadyExists(_)) | Err(DfsError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    // === helpers ===

    fn file_meta(&self, record: FileRecord, blocks: Vec<BlockRecord>) -> FileMeta {
        FileMeta {
            file_id: record.file_id,
            name: record.name,
            path: record.path,
            kind: EntryKind::File,
            size: record.size,
            blocks: blocks.into_iter().map(|b| b.block_id).collect(),
            created_at: record.created_at,
            modified_at: record.modified_at,
            owner: record.owner,
        }
    }

    fn block_info(&self, record: BlockRecord) -> Result<BlockInfo> {
        let locations = self
            .store
            .locations_of_block(record.block_id)?
            .into_iter()
            .map(|l| BlockLocationInfo {
                node_id: l.node_id,
                hostname: l.hostname,
                port: l.port,
                is_leader: l.is_leader,
                suspect: l.suspect,
                node_status: l.status,
            })
            .collect();
        Ok(BlockInfo {
            block_id: record.block_id,
            file_id: record.file_id,
            size: record.size,
            checksum: record.checksum,
            degraded: record.degraded,
            locations,
        })
    }
}

#[derive(Debug, Clone)]
pub struct BlockReportOutcome {
    pub added: Vec<Uuid>,
    pub under_replicated: Vec<Uuid>,
}

struct WorkingNode {
    info: DataNodeInfo,
    free: u64,
    assigned: u64,
}

fn location_is_healthy(location: &LocationRecord) -> bool {
    location.status == NodeStatus::Active && !location.suspect
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_core::types::ReportedBlock;

    fn manager() -> (tempfile::TempDir, Manager) {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path().join("metadata.db")).unwrap();
        let settings = Settings {
            block_size: 4096,
            ..Settings::default()
        };
        (dir, Manager::new(store, settings))
    }

    fn register_node(m: &Manager, port: u16, free: u64) -> Uuid {
        m.register_datanode(&RegisterDataNodeRequest {
            node_id: None,
            hostname: "127.0.0.1".to_string(),
            port,
            storage_capacity: free,
            available_space: free,
        })
        .unwrap()
        .node_id
    }

    #[test]
    fn test_mkdir_requires_parent() {
        let (_d, m) = manager();
        let err = m.create_directory("/a/b", None).unwrap_err();
        assert!(matches!(err, DfsError::ParentMissing(_)));
        m.create_directory("/a", None).unwrap();
        m.create_directory("/a/b", None).unwrap();
        assert!(matches!(
            m.create_directory("/a/b", None).unwrap_err(),
            DfsError::AlreadyExists(_)
        ));
    }

    #[test]
    fn test_rmdir_not_empty() {
        let (_d, m) = manager();
        m.create_directory("/d", None).unwrap();
        m.create_file("/d/f", 10, None).unwrap();
        assert!(matches!(
            m.remove_directory("/d", false).unwrap_err(),
            DfsError::NotEmpty(_)
        ));
        m.remove_directory("/d", true).unwrap();
        assert!(matches!(
            m.get_file_by_path("/d/f").unwrap_err(),
            DfsError::NotFound(_)
        ));
    }

    #[test]
    fn test_mkdir_rmdir_round_trip() {
        let (_d, m) = manager();
        m.create_directory("/tmp", None).unwrap();
        m.remove_directory("/tmp", false).unwrap();
        assert!(matches!(
            m.list_directory("/tmp").unwrap_err(),
            DfsError::NotFound(_)
        ));
        // The namespace is back to its pre-state.
        m.create_directory("/tmp", None).unwrap();
    }

    #[test]
    fn test_file_and_block_ordering() {
        let (_d, m) = manager();
        let file = m.create_file("/f", 10, Some("alice")).unwrap();
        let b1 = Uuid::new_v4();
        let b2 = Uuid::new_v4();
        for (id, size) in [(b1, 6u64), (b2, 4u64)] {
            m.register_block(&RegisterBlockRequest {
                block_id: id,
                file_id: file.file_id,
                size,
                checksum: None,
            })
            .unwrap();
        }
        let fetched = m.get_file_by_path("/f").unwrap();
        assert_eq!(fetched.blocks, vec![b1, b2]);
        assert_eq!(fetched.size, 10);
    }

    #[test]
    fn test_duplicate_block_rejected() {
        let (_d, m) = manager();
        let file = m.create_file("/f", 4, None).unwrap();
        let request = RegisterBlockRequest {
            block_id: Uuid::new_v4(),
            file_id: file.file_id,
            size: 4,
            checksum: None,
        };
        m.register_block(&request).unwrap();
        assert!(matches!(
            m.register_block(&request).unwrap_err(),
            DfsError::AlreadyExists(_)
        ));
    }

    #[test]
    fn test_placement_distinct_nodes_and_rotation() {
        let (_d, m) = manager();
        register_node(&m, 1, 1 << 30);
        register_node(&m, 2, 1 << 30);
        register_node(&m, 3, 1 << 30);

        let specs: Vec<PlacementSpec> = (0..6)
            .map(|_| PlacementSpec {
                block_id: Uuid::new_v4(),
                size: 4096,
            })
            .collect();
        let assignments = m.place_blocks(&specs, 2, &[]).unwrap();
        assert_eq!(assignments.len(), 6);
        for a in &assignments {
            assert_eq!(a.followers.len(), 1);
            assert_ne!(a.leader.node_id, a.followers[0].node_id);
        }
        // With equal capacity every node ends up carrying replicas.
        let mut seen = std::collections::HashSet::new();
        for a in &assignments {
            seen.insert(a.leader.node_id);
            seen.insert(a.followers[0].node_id);
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_placement_skips_full_nodes() {
        let (_d, m) = manager();
        register_node(&m, 1, 0);
        register_node(&m, 2, 1 << 30);
        let specs = vec![PlacementSpec {
            block_id: Uuid::new_v4(),
            size: 4096,
        }];
        // The empty node is never eligible, so rf=2 cannot be met.
        assert!(matches!(
            m.place_blocks(&specs, 2, &[]).unwrap_err(),
            DfsError::NoEligibleNodes(_)
        ));
        let ok = m.place_blocks(&specs, 1, &[]).unwrap();
        assert_eq!(ok[0].leader.port, 2);
    }

    #[test]
    fn test_placement_weighted_by_free_space() {
        let (_d, m) = manager();
        let big = register_node(&m, 1, 100 << 30);
        register_node(&m, 2, 10 << 30);
        register_node(&m, 3, 10 << 30);

        let specs: Vec<PlacementSpec> = (0..20)
            .map(|_| PlacementSpec {
                block_id: Uuid::new_v4(),
                size: 1 << 30,
            })
            .collect();
        let assignments = m.place_blocks(&specs, 2, &[]).unwrap();
        let big_count = assignments
            .iter()
            .flat_map(|a| std::iter::once(&a.leader).chain(a.followers.iter()))
            .filter(|n| n.node_id == big)
            .count();
        // The node with 5x the free space carries the most replicas but
        // never both copies of one block.
        assert!(big_count >= 15);
        assert!(big_count <= 20);
    }

    #[test]
    fn test_block_report_idempotent() {
        let (_d, m) = manager();
        let node = register_node(&m, 1, 1 << 30);
        let file = m.create_file("/f", 4, None).unwrap();
        let block_id = Uuid::new_v4();
        m.register_block(&RegisterBlockRequest {
            block_id,
            file_id: file.file_id,
            size: 4,
            checksum: None,
        })
        .unwrap();

        let report = BlockReport {
            node_id: node,
            blocks: vec![ReportedBlock {
                block_id,
                size: 4,
                checksum: None,
            }],
        };
        let first = m.apply_block_report(&report).unwrap();
        assert_eq!(first.added, vec![block_id]);
        // One replica of two: still under-replicated.
        assert_eq!(first.under_replicated, vec![block_id]);

        let second = m.apply_block_report(&report).unwrap();
        assert!(second.added.is_empty());
    }

    #[test]
    fn test_single_leader_invariant() {
        let (_d, m) = manager();
        let n1 = register_node(&m, 1, 1 << 30);
        let n2 = register_node(&m, 2, 1 << 30);
        let file = m.create_file("/f", 4, None).unwrap();
        let block_id = Uuid::new_v4();
        m.register_block(&RegisterBlockRequest {
            block_id,
            file_id: file.file_id,
            size: 4,
            checksum: None,
        })
        .unwrap();

        m.add_location(block_id, n1, true).unwrap();
        m.add_location(block_id, n2, true).unwrap();
        let info = m.get_block(block_id).unwrap();
        let leaders = info.locations.iter().filter(|l| l.is_leader).count();
        assert_eq!(leaders, 1);
        assert!(info.locations.iter().any(|l| l.node_id == n2 && l.is_leader));
    }

    #[test]
    fn test_apply_is_replay_tolerant() {
        let (_d, m) = manager();
        let op = MetaOp::Mkdir {
            path: "/x".to_string(),
            owner: None,
        };
        m.apply(&op).unwrap();
        m.apply(&op).unwrap();
        assert!(m.list_directory("/x").is_ok());
    }
}
