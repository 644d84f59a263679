//! Configuration for the RDP host
//!
//! This module handles loading `RDP_*` settings from the environment or an env-style file.

mod parser;

pub use parser::{EncryptionLevel, ServerConfig, DEFAULT_BUFFER_SIZE, DEFAULT_PORT};
