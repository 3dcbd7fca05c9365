//! Client coordinator for the Basalt block file system: file splitting,
//! placement-driven uploads, and replica-failover downloads.

pub mod datanode_client;
pub mod namenode_client;
pub mod ops;
pub mod splitter;

pub use datanode_client::DataNodeClient;
pub use namenode_client::NameNodeClient;
pub use ops::{
    GetFileOperation, GetFileOperationRequest, GetFileOperationResult, PutFileOperation,
    PutFileOperationRequest, PutFileOperationResult,
};
pub use splitter::{BlockSlice, FileSplitter};
