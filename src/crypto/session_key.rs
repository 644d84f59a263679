//! Per-session symmetric key

use rand::RngCore;
use zeroize::Zeroize;

use crate::error::CryptoError;

/// Session key length in bytes (256-bit)
pub const KEY_LEN: usize = 32;

/// Symmetric key owned by exactly one session.
///
/// The bytes are wiped when the key is dropped or explicitly erased.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    /// Generate a fresh key from the OS-seeded CSPRNG
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse the hex form sent in an authentication response
    pub fn from_hex(encoded: &str) -> Result<Self, CryptoError> {
        let mut bytes = hex::decode(encoded).map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_LEN,
            got: 0,
        })?;
        if bytes.len() != KEY_LEN {
            let got = bytes.len();
            bytes.zeroize();
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_LEN,
                got,
            });
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes);
        bytes.zeroize();
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Lowercase hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}
