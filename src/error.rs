//! Error types for the RDP session engine

use thiserror::Error;

/// Main error type for the RDP session engine
#[derive(Error, Debug)]
pub enum RdpError {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Cryptographic errors
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// System I/O errors
    #[error("System error: {0}")]
    System(#[from] std::io::Error),
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid config format at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cryptographic operation errors
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed: invalid ciphertext or authentication tag")]
    Decryption,

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Encrypted payload received before a session key exists")]
    MissingKey,

    #[error("Compression failed: {0}")]
    Compression(String),

    #[error("Decompression failed: {0}")]
    Decompression(String),
}

/// Protocol-level errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed packet: {reason}")]
    MalformedPacket { reason: String },

    #[error("Unknown packet type: {code:#06x}")]
    UnknownPacketType { code: u16 },

    #[error("Unknown capability: {name}")]
    UnknownCapability { name: String },

    #[error("Negotiation failed: {reason}")]
    NegotiationFailure { reason: String },

    #[error("Authentication failed for user '{username}'")]
    AuthenticationFailure { username: String },

    #[error("No channel registered with id {channel_id}")]
    ChannelNotFound { channel_id: u16 },

    #[error("Invalid {kind} payload: {reason}")]
    InvalidPayload { kind: &'static str, reason: String },

    #[error("Session idle for {seconds}s")]
    IdleTimeout { seconds: u64 },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Channels already established for this session")]
    ChannelsAlreadyEstablished,
}

/// Transport-level errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("Send failed: {reason}")]
    SendFailed { reason: String },

    #[error("Receive failed: {reason}")]
    ReceiveFailed { reason: String },

    #[error("Receive timed out after {seconds}s")]
    ReceiveTimeout { seconds: u64 },

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedPacket {
            reason: reason.into(),
        }
    }
}

impl RdpError {
    /// Whether this error ends the active data loop.
    ///
    /// Only transport failures are fatal there; everything else is logged
    /// and the loop moves on to the next packet.
    pub fn is_fatal_in_active_loop(&self) -> bool {
        matches!(self, Self::Network(_) | Self::System(_))
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Network(NetworkError::BindFailed { .. }) => 2,
            Self::Network(_) => 3,
            Self::Protocol(_) => 4,
            Self::Crypto(_) => 5,
            Self::System(_) => 7,
        }
    }

    /// Get a user-friendly error message with suggested action
    pub fn user_message(&self) -> String {
        match self {
            Self::Config(ConfigError::FileNotFound { path }) => {
                format!(
                    "Config file not found: {}\n  Check the path and try again.",
                    path
                )
            }

            Self::Network(NetworkError::BindFailed { addr, reason }) => {
                format!(
                    "Could not listen on {}: {}\n  \
                    Check that no other RDP service owns the port.",
                    addr, reason
                )
            }

            _ => format!("{}", self),
        }
    }
}

/// Result type alias for RDP engine operations
pub type Result<T> = std::result::Result<T, RdpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_errors_end_active_loop() {
        let transport: RdpError = NetworkError::ConnectionClosed.into();
        assert!(transport.is_fatal_in_active_loop());

        let missing: RdpError = ProtocolError::ChannelNotFound { channel_id: 9 }.into();
        assert!(!missing.is_fatal_in_active_loop());

        let crypto: RdpError = CryptoError::Decryption.into();
        assert!(!crypto.is_fatal_in_active_loop());
    }

    #[test]
    fn test_exit_codes() {
        let bind: RdpError = NetworkError::BindFailed {
            addr: "0.0.0.0:3389".to_string(),
            reason: "in use".to_string(),
        }
        .into();
        assert_eq!(bind.exit_code(), 2);

        let config: RdpError = ConfigError::InvalidValue {
            key: "RDP_PORT".to_string(),
            value: "abc".to_string(),
        }
        .into();
        assert_eq!(config.exit_code(), 1);
    }

    #[test]
    fn test_unknown_packet_type_display() {
        let err = ProtocolError::UnknownPacketType { code: 0x0042 };
        assert_eq!(err.to_string(), "Unknown packet type: 0x0042");
    }
}
