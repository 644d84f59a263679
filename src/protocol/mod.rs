//! RDP session protocol
//!
//! This module contains the protocol components:
//! - Packet wire format and codec
//! - JSON payloads for the handshake and control commands
//! - Capability negotiation
//! - Per-session channel registry
//! - Payload compression
//! - Session state and lifecycle rules

pub mod capability;
pub mod channel;
pub mod compression;
pub mod messages;
pub mod payloads;
pub mod session;

pub use capability::Capability;
pub use channel::{Channel, ChannelHandler, ChannelHandlers, ChannelRegistry, ChannelType};
pub use messages::{decode, encode, Packet, PacketHeader, PacketType, HEADER_SIZE};
pub use session::{generate_session_id, ConnectionState, RdpSession, SessionSummary};
