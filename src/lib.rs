//! rdphost - RDP session engine
//!
//! Protocol core of a remote-desktop hosting node: accepts TCP connections,
//! negotiates capabilities, authenticates users, multiplexes logical
//! channels and keeps each session alive until it disconnects or goes idle.
//!
//! # Features
//!
//! - Length-prefixed binary packet codec with encrypted/compressed flags
//! - Capability negotiation (bitmap cache, compression, clipboard, audio, printer)
//! - Per-session XChaCha20-Poly1305 keys, wiped at teardown
//! - Channel routing to pluggable handlers
//! - Idle timeout, heartbeats and forced disconnect
//! - Shared session registry with traffic statistics
//!
//! # Usage
//!
//! ```no_run
//! use rdphost::{RdpServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ServerConfig::from_env()?;
//!     let server = RdpServer::bind(config).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod hooks;
pub mod protocol;
pub mod registry;
pub mod server;

pub use client::{RdpClient, SendOptions};
pub use config::ServerConfig;
pub use connection::{Connection, SessionContext};
pub use error::RdpError;
pub use hooks::{CredentialValidator, SessionObserver};
pub use registry::{SessionRegistry, StatisticsSnapshot};
pub use server::RdpServer;
