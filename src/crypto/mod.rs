//! Cryptographic primitives for RDP sessions
//!
//! - Per-session 256-bit keys, wiped on drop (session_key)
//! - XChaCha20-Poly1305 payload encryption (aead)
//! - BLAKE2s audit checksums for outbound packets (checksum)

pub mod aead;
pub mod checksum;
pub mod session_key;

pub use session_key::SessionKey;
