use crate::error::{DfsError, Result};
use sha2::{Digest, Sha256};

/// Compute the SHA-256 hex digest of a block payload.
pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Verify that data matches the expected digest.
pub fn verify_checksum(block_id: &str, data: &[u8], expected: &str) -> Result<()> {
    let actual = compute_checksum(data);
    if actual != expected {
        return Err(DfsError::Corrupt {
            block_id: block_id.to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_checksum() {
        let digest = compute_checksum(b"hello world");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, compute_checksum(b"hello world"));
        assert_ne!(digest, compute_checksum(b"hello worlds"));
    }

    #[test]
    fn test_verify_checksum() {
        let digest = compute_checksum(b"payload");
        assert!(verify_checksum("b1", b"payload", &digest).is_ok());
        let err = verify_checksum("b1", b"tampered", &digest).unwrap_err();
        assert!(matches!(err, DfsError::Corrupt { .. }));
    }
}
