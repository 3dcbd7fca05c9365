//! Shared data model and request/response bodies for the control and data
//! planes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Active,
    Inactive,
    Decommissioned,
    Maintenance,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Decommissioned => "decommissioned",
            Self::Maintenance => "maintenance",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            "decommissioned" => Some(Self::Decommissioned),
            "maintenance" => Some(Self::Maintenance),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataNodeInfo {
    pub node_id: Uuid,
    pub hostname: String,
    pub port: u16,
    pub status: NodeStatus,
    pub storage_capacity: u64,
    pub available_space: u64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub blocks_stored: u64,
}

impl DataNodeInfo {
    pub fn data_endpoint(&self) -> String {
        format!("http://{}:{}", self.hostname, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterDataNodeRequest {
    /// Present when the node re-registers with a persisted identity.
    #[serde(default)]
    pub node_id: Option<Uuid>,
    pub hostname: String,
    pub port: u16,
    pub storage_capacity: u64,
    pub available_space: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub available_space: u64,
    pub blocks_stored: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMeta {
    pub file_id: Uuid,
    pub name: String,
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    /// Block ids in byte-offset order; empty for directories and zero-byte
    /// files.
    pub blocks: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryMeta {
    pub path: String,
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One child of a directory; files carry their id, directories do not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListEntry {
    pub name: String,
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub owner: Option<String>,
    pub file_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryListing {
    pub path: String,
    pub entries: Vec<ListEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateFileRequest {
    pub path: String,
    pub size: u64,
    #[serde(default)]
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDirectoryRequest {
    pub path: String,
    #[serde(default)]
    pub owner: Option<String>,
}

/// A block location joined with the holder's address, as served to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockLocationInfo {
    pub node_id: Uuid,
    pub hostname: String,
    pub port: u16,
    pub is_leader: bool,
    pub suspect: bool,
    pub node_status: NodeStatus,
}

impl BlockLocationInfo {
    pub fn data_endpoint(&self) -> String {
        format!("http://{}:{}", self.hostname, self.port)
    }

    pub fn is_healthy(&self) -> bool {
        self.node_status == NodeStatus::Active && !self.suspect
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockInfo {
    pub block_id: Uuid,
    pub file_id: Uuid,
    pub size: u64,
    pub checksum: Option<String>,
    pub degraded: bool,
    pub locations: Vec<BlockLocationInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterBlockRequest {
    pub block_id: Uuid,
    pub file_id: Uuid,
    pub size: u64,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationRequest {
    pub node_id: Uuid,
    pub is_leader: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportedBlock {
    pub block_id: Uuid,
    pub size: u64,
    pub checksum: Option<String>,
}

/// A storage node's enumeration of the blocks it holds on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockReport {
    pub node_id: Uuid,
    pub blocks: Vec<ReportedBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementSpec {
    pub block_id: Uuid,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementRequest {
    pub blocks: Vec<PlacementSpec>,
    #[serde(default)]
    pub replication_factor: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockAssignment {
    pub block_id: Uuid,
    pub leader: DataNodeInfo,
    pub followers: Vec<DataNodeInfo>,
}

/// Replication hint passed to a storage node alongside a client upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowerHint {
    pub node_id: Uuid,
    pub hostname: String,
    pub port: u16,
}

impl FollowerHint {
    pub fn data_endpoint(&self) -> String {
        format!("http://{}:{}", self.hostname, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreBlockResponse {
    pub block_id: Uuid,
    pub size: u64,
    pub checksum: String,
    /// True when the block was already present with a matching checksum.
    pub already_stored: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckBlockResponse {
    pub exists: bool,
    pub size: u64,
    pub checksum: Option<String>,
}

/// Target of a replicate/transfer push between storage nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub target_node_id: Uuid,
    pub target_host: String,
    pub target_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub node_id: String,
    pub role: String,
    pub term: u64,
    pub leader_hint: Option<String>,
    pub datanodes: Vec<DataNodeInfo>,
    pub files: u64,
    pub blocks: u64,
    pub under_replicated: u64,
    pub over_replicated: u64,
    pub degraded_blocks: Vec<Uuid>,
}

/// Uniform error body returned by every HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}
