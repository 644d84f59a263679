//! Payload encryption for session traffic
//!
//! XChaCha20-Poly1305 with a random 24-byte nonce per message. The nonce is
//! prepended to the ciphertext: `nonce(24) | ciphertext | tag(16)`.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::crypto::session_key::SessionKey;
use crate::error::CryptoError;

/// Authentication tag length
pub const TAG_LEN: usize = 16;

/// XChaCha20-Poly1305 nonce length
pub const XNONCE_LEN: usize = 24;

/// Bytes added to every plaintext by [`encrypt`]
pub const OVERHEAD: usize = XNONCE_LEN + TAG_LEN;

/// Encrypt a payload under the session key
pub fn encrypt(plaintext: &[u8], key: &SessionKey) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut nonce_bytes = [0u8; XNONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::Encryption)?;

    let mut out = Vec::with_capacity(XNONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a payload produced by [`encrypt`]
pub fn decrypt(data: &[u8], key: &SessionKey) -> Result<Vec<u8>, CryptoError> {
    if data.len() < OVERHEAD {
        return Err(CryptoError::Decryption);
    }

    let (nonce_bytes, ciphertext) = data.split_at(XNONCE_LEN);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    cipher
        .decrypt(XNonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::Decryption)
}
