//! Payload compression (zstd frames)

use crate::error::CryptoError;

/// Compression level used for outbound payloads
pub const LEVEL: i32 = 3;

/// Compress a payload into a single zstd frame
pub fn compress(data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    zstd::encode_all(data, LEVEL).map_err(|e| CryptoError::Compression(e.to_string()))
}

/// Decompress a payload, refusing output larger than `limit` bytes
pub fn decompress(data: &[u8], limit: usize) -> Result<Vec<u8>, CryptoError> {
    zstd::bulk::decompress(data, limit).map_err(|e| CryptoError::Decompression(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let data = b"clipboard clipboard clipboard clipboard".repeat(20);
        let packed = compress(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(decompress(&packed, 8192).unwrap(), data);
    }

    #[test]
    fn test_limit_enforced() {
        let data = vec![0u8; 10_000];
        let packed = compress(&data).unwrap();
        assert!(decompress(&packed, 1024).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(decompress(b"definitely not zstd", 8192).is_err());
    }
}
