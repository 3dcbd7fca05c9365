//! Basalt Core - shared library for the Basalt distributed block file system
//!
//! A minimalist GFS-style system:
//! - files are split into fixed-size blocks identified by UUID
//! - blocks are replicated across storage nodes (replication factor 2)
//! - a namenode pair (leader/follower) owns the namespace
//! - block payloads travel as length-prefixed binary frames

pub mod checksum;
pub mod compress;
pub mod error;
pub mod paths;
pub mod settings;
pub mod types;
pub mod wire;

pub use checksum::{compute_checksum, verify_checksum};
pub use error::{DfsError, Result};
pub use settings::Settings;
pub use types::{
    BlockAssignment, BlockInfo, BlockLocationInfo, BlockReport, CheckBlockResponse,
    ClusterStatus, CreateDirectoryRequest, CreateFileRequest, DataNodeInfo, DirectoryListing,
    DirectoryMeta, EntryKind, ErrorBody, FileMeta, FollowerHint, HeartbeatRequest, ListEntry,
    LocationRequest, NodeStatus,
    PlacementRequest, PlacementSpec, RegisterBlockRequest, RegisterDataNodeRequest,
    ReportedBlock, StoreBlockResponse, TransferRequest,
};
pub use wire::{BlockAssembler, BlockFrame, FrameDecoder, split_into_frames};
