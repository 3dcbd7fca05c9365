//! Transactional metadata store backed by SQLite.
//!
//! Tables: `directories`, `files`, `blocks`, `block_locations`,
//! `datanodes`, plus a `node_meta` key/value table for HA state. Every
//! mutation runs in a single transaction; cross-table cascades (file
//! delete, subtree delete, node retirement) are atomic.

use basalt_core::error::{DfsError, Result};
use basalt_core::types::{DataNodeInfo, NodeStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct FileRecord {
    pub file_id: Uuid,
    pub path: String,
    pub name: String,
    pub size: u64,
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DirectoryRecord {
    pub path: String,
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BlockRecord {
    pub block_id: Uuid,
    pub file_id: Uuid,
    pub seq: u64,
    pub size: u64,
    pub checksum: Option<String>,
    pub degraded: bool,
}

/// A block location joined with the holding node's address and status.
#[derive(Debug, Clone)]
pub struct LocationRecord {
    pub node_id: Uuid,
    pub hostname: String,
    pub port: u16,
    pub is_leader: bool,
    pub suspect: bool,
    pub status: NodeStatus,
}

#[derive(Debug, Clone)]
pub struct MetadataStore {
    db_path: PathBuf,
}

fn db_err(err: rusqlite::Error) -> DfsError {
    DfsError::Database(err.to_string())
}

fn parse_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn parse_id(raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn parse_status(raw: &str) -> NodeStatus {
    NodeStatus::parse(raw).unwrap_or(NodeStatus::Inactive)
}

impl MetadataStore {
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self {
            db_path: db_path.into(),
        };
        if let Some(parent) = store.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        store.init_schema()?;
        Ok(store)
    }

    fn get_conn(&self) -> Result<Connection> {
        Connection::open(&self.db_path).map_err(db_err)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS directories (
                path TEXT PRIMARY KEY,
                parent TEXT,
                owner TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )
        .map_err(db_err)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS files (
                file_id TEXT PRIMARY KEY,
                path TEXT NOT NULL UNIQUE,
                parent TEXT NOT NULL,
                name TEXT NOT NULL,
                size INTEGER NOT NULL,
                owner TEXT,
                created_at TEXT NOT NULL,
                modified_at TEXT NOT NULL
            )",
            [],
        )
        .map_err(db_err)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS blocks (
                block_id TEXT PRIMARY KEY,
                file_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                size INTEGER NOT NULL,
                checksum TEXT,
                degraded INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )
        .map_err(db_err)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS block_locations (
                block_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                is_leader INTEGER NOT NULL DEFAULT 0,
                suspect INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (block_id, node_id)
            )",
            [],
        )
        .map_err(db_err)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS datanodes (
                node_id TEXT PRIMARY KEY,
                hostname TEXT NOT NULL,
                port INTEGER NOT NULL,
                status TEXT NOT NULL,
                storage_capacity INTEGER NOT NULL,
                available_space INTEGER NOT NULL,
                last_heartbeat TEXT,
                blocks_stored INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )
        .map_err(db_err)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS node_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )
        .map_err(db_err)?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_files_parent ON files (parent)",
            [],
        )
        .map_err(db_err)?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_directories_parent ON directories (parent)",
            [],
        )
        .map_err(db_err)?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_blocks_file_id ON blocks (file_id)",
            [],
        )
        .map_err(db_err)?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_block_locations_node ON block_locations (node_id)",
            [],
        )
        .map_err(db_err)?;

        // The namespace root always exists.
        conn.execute(
            "INSERT OR IGNORE INTO directories (path, parent, owner, created_at)
             VALUES ('/', NULL, NULL, ?1)",
            params![Utc::now().to_rfc3339()],
        )
        .map_err(db_err)?;

        Ok(())
    }

    // === node meta (HA persistent state) ===

    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.get_conn()?;
        conn.query_row(
            "SELECT value FROM node_meta WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO node_meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )
        .map_err(db_err)?;
        Ok(())
    }

    // === datanodes ===

    pub fn upsert_datanode(&self, info: &DataNodeInfo) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO datanodes
             (node_id, hostname, port, status, storage_capacity, available_space,
              last_heartbeat, blocks_stored)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                info.node_id.to_string(),
                info.hostname,
                info.port,
                info.status.as_str(),
                info.storage_capacity as i64,
                info.available_space as i64,
                info.last_heartbeat.map(|t| t.to_rfc3339()),
                info.blocks_stored as i64,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn get_datanode(&self, node_id: Uuid) -> Result<Option<DataNodeInfo>> {
        let conn = self.get_conn()?;
        conn.query_row(
            "SELECT node_id, hostname, port, status, storage_capacity, available_space,
                    last_heartbeat, blocks_stored
             FROM datanodes WHERE node_id = ?1",
            [node_id.to_string()],
            row_to_datanode,
        )
        .optional()
        .map_err(db_err)
    }

    pub fn list_datanodes(&self, status: Option<NodeStatus>) -> Result<Vec<DataNodeInfo>> {
        let conn = self.get_conn()?;
        let mut nodes = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn
                    .prepare(
                        "SELECT node_id, hostname, port, status, storage_capacity,
                                available_space, last_heartbeat, blocks_stored
                         FROM datanodes WHERE status = ?1 ORDER BY node_id",
                    )
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map([status.as_str()], row_to_datanode)
                    .map_err(db_err)?;
                for row in rows {
                    nodes.push(row.map_err(db_err)?);
                }
            }
            None => {
                let mut stmt = conn
                    .prepare(
                        "SELECT node_id, hostname, port, status, storage_capacity,
                                available_space, last_heartbeat, blocks_stored
                         FROM datanodes ORDER BY node_id",
                    )
                    .map_err(db_err)?;
                let rows = stmt.query_map([], row_to_datanode).map_err(db_err)?;
                for row in rows {
                    nodes.push(row.map_err(db_err)?);
                }
            }
        }
        Ok(nodes)
    }

    pub fn record_heartbeat(
        &self,
        node_id: Uuid,
        available_space: u64,
        blocks_stored: u64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.get_conn()?;
        let affected = conn
            .execute(
                "UPDATE datanodes
                 SET last_heartbeat = ?1, available_space = ?2, blocks_stored = ?3
                 WHERE node_id = ?4",
                params![
                    now.to_rfc3339(),
                    available_space as i64,
                    blocks_stored as i64,
                    node_id.to_string(),
                ],
            )
            .map_err(db_err)?;
        Ok(affected > 0)
    }

    pub fn set_node_status(&self, node_id: Uuid, status: NodeStatus) -> Result<bool> {
        let conn = self.get_conn()?;
        let affected = conn
            .execute(
                "UPDATE datanodes SET status = ?1 WHERE node_id = ?2",
                params![status.as_str(), node_id.to_string()],
            )
            .map_err(db_err)?;
        Ok(affected > 0)
    }

    /// ACTIVE nodes whose last heartbeat is older than the cutoff.
    pub fn stale_active_nodes(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let conn = self.get_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT node_id FROM datanodes
                 WHERE status = 'active'
                   AND (last_heartbeat IS NULL OR last_heartbeat < ?1)",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([cutoff.to_rfc3339()], |row| {
                let raw: String = row.get(0)?;
                parse_id(&raw)
            })
            .map_err(db_err)?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.map_err(db_err)?);
        }
        Ok(ids)
    }

    /// INACTIVE nodes unchanged since the cutoff, candidates for
    /// retirement.
    pub fn inactive_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let conn = self.get_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT node_id FROM datanodes
                 WHERE status = 'inactive'
                   AND (last_heartbeat IS NULL OR last_heartbeat < ?1)",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([cutoff.to_rfc3339()], |row| {
                let raw: String = row.get(0)?;
                parse_id(&raw)
            })
            .map_err(db_err)?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.map_err(db_err)?);
        }
        Ok(ids)
    }

    /// Drop a node and every location row that referenced it. Returns the
    /// ids of blocks that lost a location.
    pub fn delete_datanode(&self, node_id: Uuid) -> Result<Vec<Uuid>> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction().map_err(db_err)?;

        let block_ids = {
            let mut stmt = tx
                .prepare("SELECT block_id FROM block_locations WHERE node_id = ?1")
                .map_err(db_err)?;
            let rows = stmt
                .query_map([node_id.to_string()], |row| {
                    let raw: String = row.get(0)?;
                    parse_id(&raw)
                })
                .map_err(db_err)?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row.map_err(db_err)?);
            }
            ids
        };

        tx.execute(
            "DELETE FROM block_locations WHERE node_id = ?1",
            [node_id.to_string()],
        )
        .map_err(db_err)?;
        tx.execute(
            "DELETE FROM datanodes WHERE node_id = ?1",
            [node_id.to_string()],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(block_ids)
    }

    // === directories ===

    pub fn get_directory(&self, path: &str) -> Result<Option<DirectoryRecord>> {
        let conn = self.get_conn()?;
        conn.query_row(
            "SELECT path, owner, created_at FROM directories WHERE path = ?1",
            [path],
            |row| {
                let created_at: String = row.get(2)?;
                Ok(DirectoryRecord {
                    path: row.get(0)?,
                    owner: row.get(1)?,
                    created_at: parse_ts(&created_at)?,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    pub fn insert_directory(
        &self,
        path: &str,
        parent: &str,
        owner: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO directories (path, parent, owner, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![path, parent, owner, now.to_rfc3339()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn has_children(&self, path: &str) -> Result<bool> {
        let conn = self.get_conn()?;
        let dirs: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM directories WHERE parent = ?1",
                [path],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        if dirs > 0 {
            return Ok(true);
        }
        let files: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM files WHERE parent = ?1",
                [path],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(files > 0)
    }

    pub fn list_children(&self, path: &str) -> Result<(Vec<DirectoryRecord>, Vec<FileRecord>)> {
        let conn = self.get_conn()?;

        let mut dirs = Vec::new();
        {
            let mut stmt = conn
                .prepare(
                    "SELECT path, owner, created_at FROM directories
                     WHERE parent = ?1 ORDER BY path",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map([path], |row| {
                    let created_at: String = row.get(2)?;
                    Ok(DirectoryRecord {
                        path: row.get(0)?,
                        owner: row.get(1)?,
                        created_at: parse_ts(&created_at)?,
                    })
                })
                .map_err(db_err)?;
            for row in rows {
                dirs.push(row.map_err(db_err)?);
            }
        }

        let mut files = Vec::new();
        {
            let mut stmt = conn
                .prepare(
                    "SELECT file_id, path, name, size, owner, created_at, modified_at
                     FROM files WHERE parent = ?1 ORDER BY path",
                )
                .map_err(db_err)?;
            let rows = stmt.query_map([path], row_to_file).map_err(db_err)?;
            for row in rows {
                files.push(row.map_err(db_err)?);
            }
        }

        Ok((dirs, files))
    }

    /// Every file at or below a directory.
    pub fn files_in_subtree(&self, path: &str) -> Result<Vec<FileRecord>> {
        let conn = self.get_conn()?;
        let prefix = if path == "/" {
            "/%".to_string()
        } else {
            format!("{path}/%")
        };
        let mut stmt = conn
            .prepare(
                "SELECT file_id, path, name, size, owner, created_at, modified_at
                 FROM files WHERE path LIKE ?1 ORDER BY path",
            )
            .map_err(db_err)?;
        let rows = stmt.query_map([prefix], row_to_file).map_err(db_err)?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row.map_err(db_err)?);
        }
        Ok(files)
    }

    /// Delete a directory and everything beneath it in one transaction.
    /// Returns the block ids that were dropped with it.
    pub fn delete_subtree(&self, path: &str) -> Result<Vec<Uuid>> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        let prefix = if path == "/" {
            "/%".to_string()
        } else {
            format!("{path}/%")
        };

        let block_ids = {
            let mut stmt = tx
                .prepare(
                    "SELECT b.block_id FROM blocks b
                     JOIN files f ON b.file_id = f.file_id
                     WHERE f.path LIKE ?1",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map([&prefix], |row| {
                    let raw: String = row.get(0)?;
                    parse_id(&raw)
                })
                .map_err(db_err)?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row.map_err(db_err)?);
            }
            ids
        };

        tx.execute(
            "DELETE FROM block_locations WHERE block_id IN (
                SELECT b.block_id FROM blocks b
                JOIN files f ON b.file_id = f.file_id
                WHERE f.path LIKE ?1
            )",
            [&prefix],
        )
        .map_err(db_err)?;
        tx.execute(
            "DELETE FROM blocks WHERE file_id IN (
                SELECT file_id FROM files WHERE path LIKE ?1
            )",
            [&prefix],
        )
        .map_err(db_err)?;
        tx.execute("DELETE FROM files WHERE path LIKE ?1", [&prefix])
            .map_err(db_err)?;
        tx.execute(
            "DELETE FROM directories WHERE path = ?1 OR path LIKE ?2",
            params![path, prefix],
        )
        .map_err(db_err)?;

        tx.commit().map_err(db_err)?;
        Ok(block_ids)
    }

    pub fn delete_directory(&self, path: &str) -> Result<bool> {
        let conn = self.get_conn()?;
        let affected = conn
            .execute("DELETE FROM directories WHERE path = ?1", [path])
            .map_err(db_err)?;
        Ok(affected > 0)
    }

    // === files ===

    pub fn insert_file(&self, record: &FileRecord, parent: &str) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO files (file_id, path, parent, name, size, owner, created_at, modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.file_id.to_string(),
                record.path,
                parent,
                record.name,
                record.size as i64,
                record.owner,
                record.created_at.to_rfc3339(),
                record.modified_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn get_file(&self, file_id: Uuid) -> Result<Option<FileRecord>> {
        let conn = self.get_conn()?;
        conn.query_row(
            "SELECT file_id, path, name, size, owner, created_at, modified_at
             FROM files WHERE file_id = ?1",
            [file_id.to_string()],
            row_to_file,
        )
        .optional()
        .map_err(db_err)
    }

    pub fn get_file_by_path(&self, path: &str) -> Result<Option<FileRecord>> {
        let conn = self.get_conn()?;
        conn.query_row(
            "SELECT file_id, path, name, size, owner, created_at, modified_at
             FROM files WHERE path = ?1",
            [path],
            row_to_file,
        )
        .optional()
        .map_err(db_err)
    }

    pub fn touch_file(&self, file_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE files SET modified_at = ?1 WHERE file_id = ?2",
            params![now.to_rfc3339(), file_id.to_string()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Delete a file with its blocks and locations; returns dropped block
    /// ids.
    pub fn delete_file(&self, file_id: Uuid) -> Result<Vec<Uuid>> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        let id = file_id.to_string();

        let block_ids = {
            let mut stmt = tx
                .prepare("SELECT block_id FROM blocks WHERE file_id = ?1")
                .map_err(db_err)?;
            let rows = stmt
                .query_map([&id], |row| {
                    let raw: String = row.get(0)?;
                    parse_id(&raw)
                })
                .map_err(db_err)?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row.map_err(db_err)?);
            }
            ids
        };

        tx.execute(
            "DELETE FROM block_locations WHERE block_id IN (
                SELECT block_id FROM blocks WHERE file_id = ?1
            )",
            [&id],
        )
        .map_err(db_err)?;
        tx.execute("DELETE FROM blocks WHERE file_id = ?1", [&id])
            .map_err(db_err)?;
        tx.execute("DELETE FROM files WHERE file_id = ?1", [&id])
            .map_err(db_err)?;

        tx.commit().map_err(db_err)?;
        Ok(block_ids)
    }

    pub fn count_files(&self) -> Result<u64> {
        let conn = self.get_conn()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))
            .map_err(db_err)?;
        Ok(count as u64)
    }

    // === blocks ===

    pub fn insert_block(
        &self,
        block_id: Uuid,
        file_id: Uuid,
        seq: u64,
        size: u64,
        checksum: Option<&str>,
    ) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO blocks (block_id, file_id, seq, size, checksum)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                block_id.to_string(),
                file_id.to_string(),
                seq as i64,
                size as i64,
                checksum,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn get_block(&self, block_id: Uuid) -> Result<Option<BlockRecord>> {
        let conn = self.get_conn()?;
        conn.query_row(
            "SELECT block_id, file_id, seq, size, checksum, degraded
             FROM blocks WHERE block_id = ?1",
            [block_id.to_string()],
            row_to_block,
        )
        .optional()
        .map_err(db_err)
    }

    pub fn blocks_of_file(&self, file_id: Uuid) -> Result<Vec<BlockRecord>> {
        let conn = self.get_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT block_id, file_id, seq, size, checksum, degraded
                 FROM blocks WHERE file_id = ?1 ORDER BY seq",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([file_id.to_string()], row_to_block)
            .map_err(db_err)?;
        let mut blocks = Vec::new();
        for row in rows {
            blocks.push(row.map_err(db_err)?);
        }
        Ok(blocks)
    }

    pub fn next_block_seq(&self, file_id: Uuid) -> Result<u64> {
        let conn = self.get_conn()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM blocks WHERE file_id = ?1",
                [file_id.to_string()],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(count as u64)
    }

    pub fn set_block_degraded(&self, block_id: Uuid, degraded: bool) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE blocks SET degraded = ?1 WHERE block_id = ?2",
            params![degraded as i64, block_id.to_string()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn degraded_block_ids(&self) -> Result<Vec<Uuid>> {
        let conn = self.get_conn()?;
        let mut stmt = conn
            .prepare("SELECT block_id FROM blocks WHERE degraded = 1 ORDER BY block_id")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                let raw: String = row.get(0)?;
                parse_id(&raw)
            })
            .map_err(db_err)?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.map_err(db_err)?);
        }
        Ok(ids)
    }

    pub fn count_blocks(&self) -> Result<u64> {
        let conn = self.get_conn()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM blocks", [], |row| row.get(0))
            .map_err(db_err)?;
        Ok(count as u64)
    }

    /// Blocks whose healthy (active, non-suspect) location count is below
    /// the replication factor, oldest first.
    pub fn under_replicated_blocks(&self, replication_factor: u32) -> Result<Vec<Uuid>> {
        let conn = self.get_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT b.block_id FROM blocks b
                 WHERE (
                     SELECT COUNT(*) FROM block_locations bl
                     JOIN datanodes d ON bl.node_id = d.node_id
                     WHERE bl.block_id = b.block_id
                       AND d.status = 'active' AND bl.suspect = 0
                 ) < ?1
                 ORDER BY b.rowid",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([replication_factor as i64], |row| {
                let raw: String = row.get(0)?;
                parse_id(&raw)
            })
            .map_err(db_err)?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.map_err(db_err)?);
        }
        Ok(ids)
    }

    /// Blocks holding more healthy replicas than the replication factor
    /// calls for.
    pub fn over_replicated_blocks(&self, replication_factor: u32) -> Result<Vec<Uuid>> {
        let conn = self.get_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT b.block_id FROM blocks b
                 WHERE (
                     SELECT COUNT(*) FROM block_locations bl
                     JOIN datanodes d ON bl.node_id = d.node_id
                     WHERE bl.block_id = b.block_id
                       AND d.status = 'active' AND bl.suspect = 0
                 ) > ?1
                 ORDER BY b.rowid",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([replication_factor as i64], |row| {
                let raw: String = row.get(0)?;
                parse_id(&raw)
            })
            .map_err(db_err)?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.map_err(db_err)?);
        }
        Ok(ids)
    }

    // === block locations ===

    /// Insert or refresh a location row. At most one location per block is
    /// leader; inserting a leader demotes any other. Returns true when the
    /// row was new.
    pub fn upsert_location(&self, block_id: Uuid, node_id: Uuid, is_leader: bool) -> Result<bool> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        let existed: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM block_locations WHERE block_id = ?1 AND node_id = ?2",
                params![block_id.to_string(), node_id.to_string()],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        if is_leader {
            tx.execute(
                "UPDATE block_locations SET is_leader = 0 WHERE block_id = ?1",
                [block_id.to_string()],
            )
            .map_err(db_err)?;
        }
        tx.execute(
            "INSERT INTO block_locations (block_id, node_id, is_leader, suspect)
             VALUES (?1, ?2, ?3, 0)
             ON CONFLICT (block_id, node_id)
             DO UPDATE SET is_leader = excluded.is_leader, suspect = 0",
            params![block_id.to_string(), node_id.to_string(), is_leader as i64],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(existed == 0)
    }

    /// Insert a location only when absent, leaving existing flags alone.
    /// Used for block-report reconciliation, which must be idempotent.
    pub fn insert_location_if_absent(&self, block_id: Uuid, node_id: Uuid) -> Result<bool> {
        let conn = self.get_conn()?;
        let affected = conn
            .execute(
                "INSERT OR IGNORE INTO block_locations (block_id, node_id, is_leader, suspect)
                 VALUES (?1, ?2, 0, 0)",
                params![block_id.to_string(), node_id.to_string()],
            )
            .map_err(db_err)?;
        Ok(affected > 0)
    }

    pub fn remove_location(&self, block_id: Uuid, node_id: Uuid) -> Result<bool> {
        let conn = self.get_conn()?;
        let affected = conn
            .execute(
                "DELETE FROM block_locations WHERE block_id = ?1 AND node_id = ?2",
                params![block_id.to_string(), node_id.to_string()],
            )
            .map_err(db_err)?;
        Ok(affected > 0)
    }

    pub fn locations_of_block(&self, block_id: Uuid) -> Result<Vec<LocationRecord>> {
        let conn = self.get_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT bl.node_id, d.hostname, d.port, bl.is_leader, bl.suspect, d.status
                 FROM block_locations bl
                 JOIN datanodes d ON bl.node_id = d.node_id
                 WHERE bl.block_id = ?1
                 ORDER BY bl.is_leader DESC, bl.node_id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([block_id.to_string()], |row| {
                let node_id: String = row.get(0)?;
                let status: String = row.get(5)?;
                Ok(LocationRecord {
                    node_id: parse_id(&node_id)?,
                    hostname: row.get(1)?,
                    port: row.get::<_, i64>(2)? as u16,
                    is_leader: row.get::<_, i64>(3)? != 0,
                    suspect: row.get::<_, i64>(4)? != 0,
                    status: parse_status(&status),
                })
            })
            .map_err(db_err)?;
        let mut locations = Vec::new();
        for row in rows {
            locations.push(row.map_err(db_err)?);
        }
        Ok(locations)
    }

    pub fn blocks_on_node(&self, node_id: Uuid) -> Result<Vec<Uuid>> {
        let conn = self.get_conn()?;
        let mut stmt = conn
            .prepare("SELECT block_id FROM block_locations WHERE node_id = ?1")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([node_id.to_string()], |row| {
                let raw: String = row.get(0)?;
                parse_id(&raw)
            })
            .map_err(db_err)?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.map_err(db_err)?);
        }
        Ok(ids)
    }

    pub fn mark_locations_suspect(&self, node_id: Uuid) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE block_locations SET suspect = 1 WHERE node_id = ?1",
            [node_id.to_string()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn clear_locations_suspect(&self, node_id: Uuid) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE block_locations SET suspect = 0 WHERE node_id = ?1",
            [node_id.to_string()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Drop suspect location rows of a block whose node is still INACTIVE.
    /// Returns the node ids removed.
    pub fn remove_suspect_inactive_locations(&self, block_id: Uuid) -> Result<Vec<Uuid>> {
        let conn = self.get_conn()?;
        let removed = {
            let mut stmt = conn
                .prepare(
                    "SELECT bl.node_id FROM block_locations bl
                     JOIN datanodes d ON bl.node_id = d.node_id
                     WHERE bl.block_id = ?1 AND bl.suspect = 1 AND d.status = 'inactive'",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map([block_id.to_string()], |row| {
                    let raw: String = row.get(0)?;
                    parse_id(&raw)
                })
                .map_err(db_err)?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row.map_err(db_err)?);
            }
            ids
        };
        for node_id in &removed {
            conn.execute(
                "DELETE FROM block_locations WHERE block_id = ?1 AND node_id = ?2",
                params![block_id.to_string(), node_id.to_string()],
            )
            .map_err(db_err)?;
        }
        Ok(removed)
    }
}

fn row_to_datanode(row: &rusqlite::Row<'_>) -> rusqlite::Result<DataNodeInfo> {
    let node_id: String = row.get(0)?;
    let status: String = row.get(3)?;
    let last_heartbeat: Option<String> = row.get(6)?;
    Ok(DataNodeInfo {
        node_id: parse_id(&node_id)?,
        hostname: row.get(1)?,
        port: row.get::<_, i64>(2)? as u16,
        status: parse_status(&status),
        storage_capacity: row.get::<_, i64>(4)? as u64,
        available_space: row.get::<_, i64>(5)? as u64,
        last_heartbeat: last_heartbeat.as_deref().map(parse_ts).transpose()?,
        blocks_stored: row.get::<_, i64>(7)? as u64,
    })
}

fn row_to_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRecord> {
    let file_id: String = row.get(0)?;
    let created_at: String = row.get(5)?;
    let modified_at: String = row.get(6)?;
    Ok(FileRecord {
        file_id: parse_id(&file_id)?,
        path: row.get(1)?,
        name: row.get(2)?,
        size: row.get::<_, i64>(3)? as u64,
        owner: row.get(4)?,
        created_at: parse_ts(&created_at)?,
        modified_at: parse_ts(&modified_at)?,
    })
}

fn row_to_block(row: &rusqlite::Row<'_>) -> rusqlite::Result<BlockRecord> {
    let block_id: String = row.get(0)?;
    let file_id: String = row.get(1)?;
    Ok(BlockRecord {
        block_id: parse_id(&block_id)?,
        file_id: parse_id(&file_id)?,
        seq: row.get::<_, i64>(2)? as u64,
        size: row.get::<_, i64>(3)? as u64,
        checksum: row.get(4)?,
        degraded: row.get::<_, i64>(5)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, MetadataStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path().join("metadata.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_root_exists() {
        let (_dir, store) = open_store();
        assert!(store.get_directory("/").unwrap().is_some());
    }

    #[test]
    fn test_file_cascade_delete() {
        let (_dir, store) = open_store();
        let now = Utc::now();
        let file_id = Uuid::new_v4();
        store
            .insert_file(
                &FileRecord {
                    file_id,
                    path: "/f".to_string(),
                    name: "f".to_string(),
                    size: 10,
                    owner: None,
                    created_at: now,
                    modified_at: now,
                },
                "/",
            )
            .unwrap();

        let block_id = Uuid::new_v4();
        let node_id = Uuid::new_v4();
        store.insert_block(block_id, file_id, 0, 10, None).unwrap();
        store.upsert_location(block_id, node_id, true).unwrap();

        let dropped = store.delete_file(file_id).unwrap();
        assert_eq!(dropped, vec![block_id]);
        assert!(store.get_block(block_id).unwrap().is_none());
        assert!(store.get_file(file_id).unwrap().is_none());
    }

    #[test]
    fn test_upsert_location_idempotent() {
        let (_dir, store) = open_store();
        let block_id = Uuid::new_v4();
        let node_id = Uuid::new_v4();
        assert!(store.upsert_location(block_id, node_id, true).unwrap());
        assert!(!store.upsert_location(block_id, node_id, true).unwrap());
    }

    #[test]
    fn test_over_replicated_blocks() {
        let (_dir, store) = open_store();
        let now = Utc::now();
        let file_id = Uuid::new_v4();
        store
            .insert_file(
                &FileRecord {
                    file_id,
                    path: "/f".to_string(),
                    name: "f".to_string(),
                    size: 4,
                    owner: None,
                    created_at: now,
                    modified_at: now,
                },
                "/",
            )
            .unwrap();
        let block_id = Uuid::new_v4();
        store.insert_block(block_id, file_id, 0, 4, None).unwrap();

        let nodes: Vec<Uuid> = (0..3u16)
            .map(|i| {
                let node_id = Uuid::new_v4();
                store
                    .upsert_datanode(&DataNodeInfo {
                        node_id,
                        hostname: "127.0.0.1".to_string(),
                        port: 9300 + i,
                        status: NodeStatus::Active,
                        storage_capacity: 1 << 30,
                        available_space: 1 << 30,
                        last_heartbeat: Some(now),
                        blocks_stored: 0,
                    })
                    .unwrap();
                node_id
            })
            .collect();

        store.upsert_location(block_id, nodes[0], true).unwrap();
        store.upsert_location(block_id, nodes[1], false).unwrap();
        assert!(store.over_replicated_blocks(2).unwrap().is_empty());

        store.upsert_location(block_id, nodes[2], false).unwrap();
        assert_eq!(store.over_replicated_blocks(2).unwrap(), vec![block_id]);

        // An inactive holder does not count toward the surplus.
        store.set_node_status(nodes[2], NodeStatus::Inactive).unwrap();
        assert!(store.over_replicated_blocks(2).unwrap().is_empty());
    }

    #[test]
    fn test_meta_round_trip() {
        let (_dir, store) = open_store();
        assert!(store.get_meta("current_term").unwrap().is_none());
        store.set_meta("current_term", "7").unwrap();
        assert_eq!(store.get_meta("current_term").unwrap().as_deref(), Some("7"));
        store.set_meta("current_term", "8").unwrap();
        assert_eq!(store.get_meta("current_term").unwrap().as_deref(), Some("8"));
    }
}
