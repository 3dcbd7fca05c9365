//! On-disk block persistence for a storage node.
//!
//! Layout: `<root>/blocks/<2-hex-prefix>/<block_id>` with a
//! `<block_id>.sha256` sidecar holding the hex digest. Writes go to a
//! temporary file, fsync, then rename, so a block is either fully present
//! or absent. Every read recomputes the digest against the sidecar.

use basalt_core::checksum::compute_checksum;
use basalt_core::error::{DfsError, Result};
use basalt_core::types::ReportedBlock;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub struct BlockStore {
    root: PathBuf,
    reserved_bytes: u64,
    blocks_stored: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct StoredBlock {
    pub size: u64,
    pub checksum: String,
}

impl BlockStore {
    /// Open (or create) a block store rooted at `root`. Scans existing
    /// blocks once so the stored count is accurate after a restart.
    pub fn open(root: impl Into<PathBuf>, reserved_bytes: u64) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("blocks"))?;

        let store = Self {
            root,
            reserved_bytes,
            blocks_stored: AtomicU64::new(0),
        };
        let existing = store.scan_block_ids()?;
        store
            .blocks_stored
            .store(existing.len() as u64, Ordering::Relaxed);
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blocks_stored(&self) -> u64 {
        self.blocks_stored.load(Ordering::Relaxed)
    }

    /// Free bytes on the backing filesystem minus the reserved margin.
    pub fn available_space(&self) -> Result<u64> {
        let free = fs2::available_space(&self.root)?;
        Ok(free.saturating_sub(self.reserved_bytes))
    }

    /// Persist a block atomically. A duplicate with a matching checksum
    /// fails `AlreadyExists`; a duplicate with a different checksum is only
    /// overwritten when `overwrite` is set (repair path).
    pub async fn store(&self, block_id: Uuid, data: &[u8], overwrite: bool) -> Result<StoredBlock> {
        let checksum = compute_checksum(data);
        let block_path = self.block_path(block_id);

        let existing = self.stat(block_id).await?;
        if let Some(existing) = &existing {
            if existing.checksum == checksum {
                return Err(DfsError::AlreadyExists(format!("block {block_id}")));
            }
            if !overwrite {
                return Err(DfsError::Conflict(format!(
                    "block {block_id} already stored with checksum {}",
                    existing.checksum
                )));
            }
        }

        if let Some(parent) = block_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = block_path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, &block_path).await?;

        let sidecar_tmp = self.checksum_path(block_id).with_extension("sha256.tmp");
        fs::write(&sidecar_tmp, checksum.as_bytes()).await?;
        fs::rename(&sidecar_tmp, self.checksum_path(block_id)).await?;

        if existing.is_none() {
            self.blocks_stored.fetch_add(1, Ordering::Relaxed);
        }
        tracing::debug!("stored block {} ({} bytes)", block_id, data.len());

        Ok(StoredBlock {
            size: data.len() as u64,
            checksum,
        })
    }

    /// Read a block, verifying its digest against the sidecar.
    pub async fn retrieve(&self, block_id: Uuid) -> Result<(Bytes, String)> {
        let block_path = self.block_path(block_id);
        if !block_path.exists() {
            return Err(DfsError::NotFound(format!("block {block_id}")));
        }

        let data = fs::read(&block_path).await?;
        let expected = self.read_sidecar(block_id).await?;
        let actual = compute_checksum(&data);
        if actual != expected {
            return Err(DfsError::Corrupt {
                block_id: block_id.to_string(),
                expected,
                actual,
            });
        }
        Ok((Bytes::from(data), actual))
    }

    pub async fn delete(&self, block_id: Uuid) -> Result<bool> {
        let block_path = self.block_path(block_id);
        if !block_path.exists() {
            return Ok(false);
        }
        fs::remove_file(&block_path).await?;
        let sidecar = self.checksum_path(block_id);
        if sidecar.exists() {
            fs::remove_file(&sidecar).await?;
        }
        self.blocks_stored.fetch_sub(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Size and stored checksum, without reading the payload.
    pub async fn stat(&self, block_id: Uuid) -> Result<Option<StoredBlock>> {
        let block_path = self.block_path(block_id);
        if !block_path.exists() {
            return Ok(None);
        }
        let meta = fs::metadata(&block_path).await?;
        let checksum = self.read_sidecar(block_id).await?;
        Ok(Some(StoredBlock {
            size: meta.len(),
            checksum,
        }))
    }

    /// Enumerate every block on disk for a block report.
    pub async fn report_blocks(&self) -> Result<Vec<ReportedBlock>> {
        let ids = self.scan_block_ids()?;
        let mut blocks = Vec::with_capacity(ids.len());
        for block_id in ids {
            if let Some(stored) = self.stat(block_id).await? {
                blocks.push(ReportedBlock {
                    block_id,
                    size: stored.size,
                    checksum: Some(stored.checksum),
                });
            }
        }
        Ok(blocks)
    }

    fn scan_block_ids(&self) -> Result<Vec<Uuid>> {
        let blocks_dir = self.root.join("blocks");
        let mut ids = Vec::new();
        for shard in std::fs::read_dir(&blocks_dir)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(shard.path())? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                if let Some(name) = entry.file_name().to_str() {
                    // Sidecars and leftover temp files are not blocks.
                    if let Ok(id) = Uuid::parse_str(name) {
                        ids.push(id);
                    }
                }
            }
        }
        Ok(ids)
    }

    async fn read_sidecar(&self, block_id: Uuid) -> Result<String> {
        let sidecar = self.checksum_path(block_id);
        if !sidecar.exists() {
            return Err(DfsError::Corrupt {
                block_id: block_id.to_string(),
                expected: "<missing sidecar>".to_string(),
                actual: String::new(),
            });
        }
        let raw = fs::read_to_string(&sidecar).await?;
        Ok(raw.trim().to_string())
    }

    fn block_path(&self, block_id: Uuid) -> PathBuf {
        let id = block_id.to_string();
        self.root.join("blocks").join(&id[..2]).join(&id)
    }

    fn checksum_path(&self, block_id: Uuid) -> PathBuf {
        self.block_path(block_id).with_extension("sha256")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_and_retrieve() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path(), 0).unwrap();

        let block_id = Uuid::new_v4();
        let data = b"block payload".to_vec();
        let stored = store.store(block_id, &data, false).await.unwrap();
        assert_eq!(stored.size, data.len() as u64);
        assert_eq!(store.blocks_stored(), 1);

        let (bytes, checksum) = store.retrieve(block_id).await.unwrap();
        assert_eq!(bytes, data);
        assert_eq!(checksum, stored.checksum);
    }

    #[tokio::test]
    async fn test_duplicate_same_checksum_is_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path(), 0).unwrap();

        let block_id = Uuid::new_v4();
        store.store(block_id, b"same", false).await.unwrap();
        let err = store.store(block_id, b"same", false).await.unwrap_err();
        assert!(matches!(err, DfsError::AlreadyExists(_)));
        assert_eq!(store.blocks_stored(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_mismatch_rejected_unless_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path(), 0).unwrap();

        let block_id = Uuid::new_v4();
        store.store(block_id, b"original", false).await.unwrap();

        let err = store.store(block_id, b"different", false).await.unwrap_err();
        assert!(matches!(err, DfsError::Conflict(_)));

        store.store(block_id, b"different", true).await.unwrap();
        let (bytes, _) = store.retrieve(block_id).await.unwrap();
        assert_eq!(bytes, b"different".to_vec());
    }

    #[tokio::test]
    async fn test_corruption_detected_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path(), 0).unwrap();

        let block_id = Uuid::new_v4();
        store.store(block_id, b"pristine", false).await.unwrap();

        // Flip bytes behind the store's back.
        let path = store.block_path(block_id);
        std::fs::write(&path, b"tampered").unwrap();

        let err = store.retrieve(block_id).await.unwrap_err();
        assert!(matches!(err, DfsError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_delete_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path(), 0).unwrap();

        let block_id = Uuid::new_v4();
        assert!(!store.delete(block_id).await.unwrap());

        store.store(block_id, b"x", false).await.unwrap();
        assert!(store.delete(block_id).await.unwrap());
        assert!(store.stat(block_id).await.unwrap().is_none());
        assert!(matches!(
            store.retrieve(block_id).await.unwrap_err(),
            DfsError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_report_and_rescan() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path(), 0).unwrap();

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.store(a, b"aaaa", false).await.unwrap();
        store.store(b, b"bb", false).await.unwrap();

        let mut report = store.report_blocks().await.unwrap();
        report.sort_by_key(|r| r.size);
        assert_eq!(report.len(), 2);
        assert_eq!(report[0].size, 2);
        assert_eq!(report[1].size, 4);

        // A fresh handle over the same root sees both blocks.
        let reopened = BlockStore::open(dir.path(), 0).unwrap();
        assert_eq!(reopened.blocks_stored(), 2);
    }
}
