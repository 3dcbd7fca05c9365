//! Hop-by-hop frame compression. Storage nodes always store and checksum
//! the uncompressed payload; compression only ever shortens a wire frame.

use crate::error::{DfsError, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Compress a payload if that actually shrinks it. Returns the bytes to put
/// on the wire and whether they are compressed.
pub fn maybe_compress(data: &[u8]) -> (Vec<u8>, bool) {
    if data.is_empty() {
        return (Vec::new(), false);
    }

    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len()), Compression::fast());
    if encoder.write_all(data).is_err() {
        return (data.to_vec(), false);
    }
    match encoder.finish() {
        Ok(compressed) if compressed.len() < data.len() => (compressed, true),
        _ => (data.to_vec(), false),
    }
}

/// Inflate a compressed frame payload back to `original_size` bytes.
pub fn decompress(data: &[u8], original_size: usize) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::with_capacity(original_size);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| DfsError::Wire(format!("zlib inflate failed: {e}")))?;
    if out.len() != original_size {
        return Err(DfsError::Wire(format!(
            "inflated size {} does not match declared size {}",
            out.len(),
            original_size
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_compressible() {
        let data = vec![b'a'; 64 * 1024];
        let (wire, compressed) = maybe_compress(&data);
        assert!(compressed);
        assert!(wire.len() < data.len());
        assert_eq!(decompress(&wire, data.len()).unwrap(), data);
    }

    #[test]
    fn test_incompressible_passthrough() {
        // High-entropy payloads come back untouched.
        let data: Vec<u8> = (0..4096u32)
            .map(|i| i.wrapping_mul(2654435761) as u8)
            .collect();
        let (wire, compressed) = maybe_compress(&data);
        if !compressed {
            assert_eq!(wire, data);
        }
    }

    #[test]
    fn test_empty_payload() {
        let (wire, compressed) = maybe_compress(&[]);
        assert!(wire.is_empty());
        assert!(!compressed);
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let data = vec![b'x'; 1024];
        let (wire, compressed) = maybe_compress(&data);
        assert!(compressed);
        assert!(decompress(&wire, 1023).is_err());
    }
}
