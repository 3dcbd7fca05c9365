//! Fixed-size file splitting.
//!
//! Each slice gets a fresh UUID and a SHA-256 digest. A zero-byte file
//! splits into no slices at all; a file landing exactly on a block
//! boundary never produces a zero-length trailing slice.

use basalt_core::checksum::compute_checksum;
use basalt_core::error::{DfsError, Result};
use bytes::Bytes;
use std::io::Read;
use std::path::Path;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct BlockSlice {
    pub block_id: Uuid,
    pub offset: u64,
    pub data: Bytes,
    pub checksum: String,
}

impl BlockSlice {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

pub struct FileSplitter {
    block_size: u64,
}

impl FileSplitter {
    pub fn new(block_size: u64) -> Self {
        Self {
            block_size: block_size.max(1),
        }
    }

    pub fn split_path(&self, path: &Path) -> Result<Vec<BlockSlice>> {
        let file = std::fs::File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DfsError::NotFound(format!("{}", path.display()))
            } else {
                DfsError::Io(e)
            }
        })?;
        self.split_reader(file)
    }

    pub fn split_reader(&self, mut reader: impl Read) -> Result<Vec<BlockSlice>> {
        let mut slices = Vec::new();
        let mut offset = 0u64;
        loop {
            let mut buf = vec![0u8; self.block_size as usize];
            let mut filled = 0;
            while filled < buf.len() {
                let n = reader.read(&mut buf[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            buf.truncate(filled);
            let checksum = compute_checksum(&buf);
            slices.push(BlockSlice {
                block_id: Uuid::new_v4(),
                offset,
                data: Bytes::from(buf),
                checksum,
            });
            offset += filled as u64;
            if filled < self.block_size as usize {
                break;
            }
        }
        Ok(slices)
    }

    pub fn split_bytes(&self, data: &[u8]) -> Result<Vec<BlockSlice>> {
        self.split_reader(data)
    }
}

/// Reassemble downloaded slices in offset order.
pub fn join_slices(mut parts: Vec<(u64, Bytes)>) -> Vec<u8> {
    parts.sort_by_key(|(offset, _)| *offset);
    let mut out = Vec::with_capacity(parts.iter().map(|(_, d)| d.len()).sum());
    for (_, data) in parts {
        out.extend_from_slice(&data);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_sizes_and_offsets() {
        let splitter = FileSplitter::new(4096);
        let data = vec![7u8; 10 * 1024];
        let slices = splitter.split_bytes(&data).unwrap();
        assert_eq!(slices.len(), 3);
        assert_eq!(slices[0].size(), 4096);
        assert_eq!(slices[1].size(), 4096);
        assert_eq!(slices[2].size(), 2048);
        assert_eq!(slices[0].offset, 0);
        assert_eq!(slices[1].offset, 4096);
        assert_eq!(slices[2].offset, 8192);
        let total: u64 = slices.iter().map(|s| s.size()).sum();
        assert_eq!(total, data.len() as u64);
    }

    #[test]
    fn test_exact_boundary_has_no_empty_tail() {
        let splitter = FileSplitter::new(1024);
        let data = vec![1u8; 2048];
        let slices = splitter.split_bytes(&data).unwrap();
        assert_eq!(slices.len(), 2);
        assert!(slices.iter().all(|s| s.size() == 1024));
    }

    #[test]
    fn test_zero_byte_file() {
        let splitter = FileSplitter::new(1024);
        assert!(splitter.split_bytes(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_unique_ids_and_checksums() {
        let splitter = FileSplitter::new(8);
        let slices = splitter.split_bytes(b"aaaaaaaabbbbbbbb").unwrap();
        assert_eq!(slices.len(), 2);
        assert_ne!(slices[0].block_id, slices[1].block_id);
        assert_ne!(slices[0].checksum, slices[1].checksum);
        assert_eq!(slices[0].checksum, compute_checksum(b"aaaaaaaa"));
    }

    #[test]
    fn test_join_out_of_order() {
        let parts = vec![
            (8u64, Bytes::from_static(b"world")),
            (0u64, Bytes::from_static(b"hello** ")),
        ];
        // Offsets dictate order regardless of arrival.
        let joined = join_slices(parts);
        assert_eq!(&joined, b"hello** world");
    }

    #[test]
    fn test_split_path_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.bin");
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let slices = FileSplitter::new(1024).split_path(&path).unwrap();
        let joined = join_slices(
            slices
                .into_iter()
                .map(|s| (s.offset, s.data))
                .collect(),
        );
        assert_eq!(joined, data);
    }
}
