//! Audit checksum for outbound packets
//!
//! A truncated BLAKE2s-256 digest of the payload, recorded in logs so a
//! capture can be matched against what the server sent. Receivers do not
//! verify it.

use blake2::{Blake2s256, Digest};

/// Length of BLAKE2s-256 hash output
pub const HASH_LEN: usize = 32;

/// Number of digest bytes kept in the checksum (16 hex characters)
pub const CHECKSUM_LEN: usize = 8;

/// BLAKE2s-256 hash of a single input
pub fn hash(data: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Truncated hex checksum of a payload
pub fn checksum(payload: &[u8]) -> String {
    hex::encode(&hash(payload)[..CHECKSUM_LEN])
}
