//! Data-plane wire format.
//!
//! Block payloads travel as a stream of length-prefixed, bincode-encoded
//! [`BlockFrame`]s. Every frame is self-describing: it names the block, the
//! byte offset of its payload and the total block size, so a receiver can
//! reassemble frames arriving over any chunking the transport applies.
//! Frames never exceed `max_frame_bytes` (default 8 MiB).

use crate::compress::{decompress, maybe_compress};
use crate::error::{DfsError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

const LENGTH_PREFIX_BYTES: usize = 4;
/// Headroom for the length prefix and bincode field encoding when deriving
/// the payload chunk size from the frame cap.
const FRAME_OVERHEAD_BYTES: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockFrame {
    pub block_id: Uuid,
    pub offset: u64,
    pub total_size: u64,
    pub compressed: bool,
    /// Uncompressed payload length; equals `data.len()` when not compressed.
    pub original_size: u32,
    pub data: Vec<u8>,
}

impl BlockFrame {
    /// The uncompressed payload carried by this frame.
    pub fn payload(&self) -> Result<Vec<u8>> {
        if self.compressed {
            decompress(&self.data, self.original_size as usize)
        } else {
            Ok(self.data.clone())
        }
    }
}

/// Encode one frame as `u32-le length ++ bincode body`.
pub fn encode_frame(frame: &BlockFrame, max_frame_bytes: usize) -> Result<Bytes> {
    let body = bincode::serialize(frame)?;
    if body.len() > max_frame_bytes {
        return Err(DfsError::Wire(format!(
            "frame of {} bytes exceeds cap of {} bytes",
            body.len(),
            max_frame_bytes
        )));
    }
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_BYTES + body.len());
    buf.put_u32_le(body.len() as u32);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Split a whole block into encoded wire frames.
///
/// Payload chunks are compressed individually when that shrinks them; the
/// stored block is always the uncompressed bytes.
pub fn split_into_frames(
    block_id: Uuid,
    data: &[u8],
    max_frame_bytes: usize,
    compress: bool,
) -> Result<Vec<Bytes>> {
    let chunk_size = max_frame_bytes.saturating_sub(FRAME_OVERHEAD_BYTES).max(1);
    let total_size = data.len() as u64;

    if data.is_empty() {
        let frame = BlockFrame {
            block_id,
            offset: 0,
            total_size: 0,
            compressed: false,
            original_size: 0,
            data: Vec::new(),
        };
        return Ok(vec![encode_frame(&frame, max_frame_bytes)?]);
    }

    let mut frames = Vec::with_capacity(data.len() / chunk_size + 1);
    let mut offset = 0u64;
    for chunk in data.chunks(chunk_size) {
        let (wire_data, compressed) = if compress {
            maybe_compress(chunk)
        } else {
            (chunk.to_vec(), false)
        };
        let frame = BlockFrame {
            block_id,
            offset,
            total_size,
            compressed,
            original_size: chunk.len() as u32,
            data: wire_data,
        };
        frames.push(encode_frame(&frame, max_frame_bytes)?);
        offset += chunk.len() as u64;
    }
    Ok(frames)
}

/// Incremental decoder for a byte stream of length-prefixed frames.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_bytes: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_bytes,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.put_slice(chunk);
    }

    /// Pop the next complete frame, or `None` until more bytes arrive.
    pub fn next_frame(&mut self) -> Result<Option<BlockFrame>> {
        if self.buf.len() < LENGTH_PREFIX_BYTES {
            return Ok(None);
        }
        let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > self.max_frame_bytes {
            return Err(DfsError::Wire(format!(
                "incoming frame of {} bytes exceeds cap of {} bytes",
                len, self.max_frame_bytes
            )));
        }
        if self.buf.len() < LENGTH_PREFIX_BYTES + len {
            return Ok(None);
        }
        self.buf.advance(LENGTH_PREFIX_BYTES);
        let body = self.buf.split_to(len);
        let frame: BlockFrame = bincode::deserialize(&body)?;
        Ok(Some(frame))
    }

    /// True when no partial frame is buffered.
    pub fn is_drained(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Reassembles a block from frames arriving in any order.
#[derive(Debug, Default)]
pub struct BlockAssembler {
    block_id: Option<Uuid>,
    total_size: u64,
    received: u64,
    data: Vec<u8>,
}

impl BlockAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, frame: BlockFrame) -> Result<()> {
        let payload = frame.payload()?;

        match self.block_id {
            None => {
                self.block_id = Some(frame.block_id);
                self.total_size = frame.total_size;
                self.data = vec![0u8; frame.total_size as usize];
            }
            Some(id) if id != frame.block_id => {
                return Err(DfsError::Wire(format!(
                    "frame for block {} arrived in stream for block {id}",
                    frame.block_id
                )));
            }
            Some(_) if frame.total_size != self.total_size => {
                return Err(DfsError::Wire(format!(
                    "frame declares total size {} but stream began with {}",
                    frame.total_size, self.total_size
                )));
            }
            Some(_) => {}
        }

        let start = frame.offset as usize;
        let end = start + payload.len();
        if end as u64 > self.total_size {
            return Err(DfsError::Wire(format!(
                "frame at offset {} with {} bytes overruns block size {}",
                frame.offset,
                payload.len(),
                self.total_size
            )));
        }

        self.data[start..end].copy_from_slice(&payload);
        self.received += payload.len() as u64;
        Ok(())
    }

    pub fn block_id(&self) -> Option<Uuid> {
        self.block_id
    }

    pub fn is_complete(&self) -> bool {
        self.block_id.is_some() && self.received >= self.total_size
    }

    pub fn into_bytes(self) -> Result<(Uuid, Bytes)> {
        let block_id = self
            .block_id
            .ok_or_else(|| DfsError::Wire("empty frame stream".to_string()))?;
        if self.received < self.total_size {
            return Err(DfsError::Wire(format!(
                "truncated stream for block {block_id}: {} of {} bytes received",
                self.received, self.total_size
            )));
        }
        Ok((block_id, Bytes::from(self.data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(data: &[u8], max_frame: usize, compress: bool) -> Bytes {
        let block_id = Uuid::new_v4();
        let frames = split_into_frames(block_id, data, max_frame, compress).unwrap();

        let mut decoder = FrameDecoder::new(max_frame);
        let mut assembler = BlockAssembler::new();
        for encoded in frames {
            // Feed byte-by-byte to exercise partial-buffer handling.
            for byte in encoded.iter() {
                decoder.push(&[*byte]);
            }
            while let Some(frame) = decoder.next_frame().unwrap() {
                assembler.accept(frame).unwrap();
            }
        }
        assert!(decoder.is_drained());
        assert!(assembler.is_complete());
        let (id, bytes) = assembler.into_bytes().unwrap();
        assert_eq!(id, block_id);
        bytes
    }

    #[test]
    fn test_single_frame_round_trip() {
        let data = b"some block contents".to_vec();
        assert_eq!(round_trip(&data, DEFAULT_MAX_FRAME_BYTES, false), data);
    }

    #[test]
    fn test_multi_frame_round_trip() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        // Force many small frames.
        assert_eq!(round_trip(&data, 512, false), data);
    }

    #[test]
    fn test_compressed_round_trip() {
        let data = vec![b'z'; 100_000];
        assert_eq!(round_trip(&data, 4096, true), data);
    }

    #[test]
    fn test_empty_block() {
        assert_eq!(round_trip(&[], DEFAULT_MAX_FRAME_BYTES, true), Bytes::new());
    }

    #[test]
    fn test_out_of_order_assembly() {
        let block_id = Uuid::new_v4();
        let data: Vec<u8> = (0..2000u32).map(|i| i as u8).collect();
        let frames = split_into_frames(block_id, &data, 512, false).unwrap();

        let mut decoded = Vec::new();
        let mut decoder = FrameDecoder::new(512);
        for encoded in &frames {
            decoder.push(encoded);
            while let Some(frame) = decoder.next_frame().unwrap() {
                decoded.push(frame);
            }
        }
        decoded.reverse();

        let mut assembler = BlockAssembler::new();
        for frame in decoded {
            assembler.accept(frame).unwrap();
        }
        let (_, bytes) = assembler.into_bytes().unwrap();
        assert_eq!(bytes, data);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let frame = BlockFrame {
            block_id: Uuid::new_v4(),
            offset: 0,
            total_size: 1024,
            compressed: false,
            original_size: 1024,
            data: vec![0u8; 1024],
        };
        assert!(encode_frame(&frame, 64).is_err());
    }

    #[test]
    fn test_truncated_stream_detected() {
        let block_id = Uuid::new_v4();
        let data = vec![1u8; 4000];
        let frames = split_into_frames(block_id, &data, 512, false).unwrap();

        let mut decoder = FrameDecoder::new(512);
        let mut assembler = BlockAssembler::new();
        decoder.push(&frames[0]);
        while let Some(frame) = decoder.next_frame().unwrap() {
            assembler.accept(frame).unwrap();
        }
        assert!(!assembler.is_complete());
        assert!(assembler.into_bytes().is_err());
    }

    #[test]
    fn test_cross_block_frame_rejected() {
        let mut assembler = BlockAssembler::new();
        let make = |id: Uuid| BlockFrame {
            block_id: id,
            offset: 0,
            total_size: 4,
            compressed: false,
            original_size: 4,
            data: vec![0u8; 4],
        };
        assembler.accept(make(Uuid::new_v4())).unwrap();
        assert!(assembler.accept(make(Uuid::new_v4())).is_err());
    }
}
