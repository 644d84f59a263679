//! JSON payloads carried inside packets

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Version string sent in connection responses
pub const SERVER_VERSION: &str = concat!("rdphost ", env!("CARGO_PKG_VERSION"));

fn default_width() -> u32 {
    1920
}

fn default_height() -> u32 {
    1080
}

fn default_color_depth() -> u32 {
    32
}

/// Client's opening message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    pub version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_width")]
    pub display_width: u32,
    #[serde(default = "default_height")]
    pub display_height: u32,
    #[serde(default = "default_color_depth")]
    pub color_depth: u32,
}

/// Server's answer to a connection request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionResponse {
    pub status: String,
    pub capabilities: Vec<String>,
    pub server_version: String,
}

impl ConnectionResponse {
    pub fn success(capabilities: Vec<String>) -> Self {
        Self {
            status: "success".to_string(),
            capabilities,
            server_version: SERVER_VERSION.to_string(),
        }
    }
}

/// Credentials presented by the client
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticationRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub domain: String,
}

impl std::fmt::Debug for AuthenticationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticationRequest")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("domain", &self.domain)
            .finish()
    }
}

/// Result of authentication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticationResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
}

impl AuthenticationResponse {
    pub fn accepted(encryption_key_hex: String) -> Self {
        Self {
            success: true,
            message: "Authentication successful".to_string(),
            encryption_key: Some(encryption_key_hex),
        }
    }

    pub fn rejected() -> Self {
        Self {
            success: false,
            message: "Authentication failed".to_string(),
            encryption_key: None,
        }
    }
}

/// One entry of the channel list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub channel_id: u16,
    #[serde(rename = "type")]
    pub channel_type: String,
    pub name: String,
    pub priority: u8,
}

/// Channel establishment announcement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEstablishment {
    pub channels: Vec<ChannelDescriptor>,
    pub status: String,
}

/// Commands carried by CONTROL packets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    ResizeDisplay {
        #[serde(default = "default_width")]
        width: u32,
        #[serde(default = "default_height")]
        height: u32,
    },
    RequestCapabilities,
    Heartbeat,
}

/// Reply to `request_capabilities`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitiesReply {
    pub capabilities: Vec<String>,
}

/// Heartbeat body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub timestamp: String,
    pub session_id: String,
}

impl Heartbeat {
    pub fn now(session_id: &str) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            session_id: session_id.to_string(),
        }
    }
}

/// Parse a JSON payload, naming the payload kind in the error
pub fn parse<T: DeserializeOwned>(kind: &'static str, data: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(data).map_err(|e| ProtocolError::InvalidPayload {
        kind,
        reason: e.to_string(),
    })
}

/// Serialize a JSON payload
pub fn to_bytes<T: Serialize>(kind: &'static str, value: &T) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(value).map_err(|e| ProtocolError::InvalidPayload {
        kind,
        reason: e.to_string(),
    })
}
