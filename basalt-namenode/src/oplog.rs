//! Append-only operation log.
//!
//! Every mutating namespace operation the leader commits is appended here
//! as one JSON line `{index, term, op}`. The HA controller ships suffixes
//! of this log to the follower, which applies them in order; after a
//! reconnect the leader resumes from the follower's acknowledged index.

use basalt_core::error::{DfsError, Result};
use basalt_core::types::NodeStatus;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetaOp {
    Mkdir {
        path: String,
        owner: Option<String>,
    },
    Rmdir {
        path: String,
        recursive: bool,
    },
    CreateFile {
        file_id: Uuid,
        path: String,
        size: u64,
        owner: Option<String>,
    },
    DeleteFile {
        file_id: Uuid,
    },
    RegisterBlock {
        block_id: Uuid,
        file_id: Uuid,
        size: u64,
        checksum: Option<String>,
    },
    AddLocation {
        block_id: Uuid,
        node_id: Uuid,
        is_leader: bool,
    },
    RemoveLocation {
        block_id: Uuid,
        node_id: Uuid,
    },
    RegisterDataNode {
        node_id: Uuid,
        hostname: String,
        port: u16,
        storage_capacity: u64,
        available_space: u64,
    },
    SetNodeStatus {
        node_id: Uuid,
        status: NodeStatus,
    },
    RetireDataNode {
        node_id: Uuid,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpLogEntry {
    pub index: u64,
    pub term: u64,
    pub op: MetaOp,
}

pub struct OpLog {
    path: PathBuf,
    entries: Vec<OpLogEntry>,
}

impl OpLog {
    /// Open the log, replaying existing lines into memory. A torn final
    /// line (crash mid-append) is dropped.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut entries = Vec::new();

        if path.exists() {
            let file = std::fs::File::open(&path)?;
            for line in BufReader::new(file).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<OpLogEntry>(&line) {
                    Ok(entry) => entries.push(entry),
                    Err(err) => {
                        tracing::warn!("dropping malformed oplog line: {err}");
                        break;
                    }
                }
            }
        }

        Ok(Self { path, entries })
    }

    pub fn last_index(&self) -> u64 {
        self.entries.last().map(|e| e.index).unwrap_or(0)
    }

    /// Append a new operation, assigning the next index.
    pub fn append(&mut self, term: u64, op: MetaOp) -> Result<u64> {
        let entry = OpLogEntry {
            index: self.last_index() + 1,
            term,
            op,
        };
        self.write_line(&entry)?;
        let index = entry.index;
        self.entries.push(entry);
        Ok(index)
    }

    /// Append an entry received from the leader, keeping its index/term.
    pub fn append_entry(&mut self, entry: OpLogEntry) -> Result<()> {
        if entry.index != self.last_index() + 1 {
            return Err(DfsError::Conflict(format!(
                "oplog entry {} does not follow {}",
                entry.index,
                self.last_index()
            )));
        }
        self.write_line(&entry)?;
        self.entries.push(entry);
        Ok(())
    }

    /// Entries with index >= `from`, capped at `limit`.
    pub fn entries_from(&self, from: u64, limit: usize) -> Vec<OpLogEntry> {
        self.entries
            .iter()
            .filter(|e| e.index >= from)
            .take(limit)
            .cloned()
            .collect()
    }

    fn write_line(&self, entry: &OpLogEntry) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(entry)?;
        writeln!(file, "{line}")?;
        file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.oplog");

        let mut log = OpLog::open(&path).unwrap();
        assert_eq!(log.last_index(), 0);

        let idx = log
            .append(
                1,
                MetaOp::Mkdir {
                    path: "/a".to_string(),
                    owner: None,
                },
            )
            .unwrap();
        assert_eq!(idx, 1);
        log.append(
            1,
            MetaOp::Rmdir {
                path: "/a".to_string(),
                recursive: false,
            },
        )
        .unwrap();

        let reloaded = OpLog::open(&path).unwrap();
        assert_eq!(reloaded.last_index(), 2);
        assert_eq!(reloaded.entries_from(2, 10).len(), 1);
    }

    #[test]
    fn test_entries_from_respects_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = OpLog::open(dir.path().join("log")).unwrap();
        for i in 0..10 {
            log.append(
                1,
                MetaOp::Mkdir {
                    path: format!("/d{i}"),
                    owner: None,
                },
            )
            .unwrap();
        }
        let batch = log.entries_from(4, 3);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].index, 4);
    }

    #[test]
    fn test_out_of_order_entry_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = OpLog::open(dir.path().join("log")).unwrap();
        let entry = OpLogEntry {
            index: 5,
            term: 1,
            op: MetaOp::DeleteFile {
                file_id: Uuid::new_v4(),
            },
        };
        assert!(log.append_entry(entry).is_err());
    }
}
