//! Per-connection session state
//!
//! An [`RdpSession`] is owned by the task driving its connection. Other
//! tasks only ever see a [`SessionSummary`] copy through the registry.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use zeroize::Zeroize;

use crate::crypto::SessionKey;
use crate::error::ProtocolError;
use crate::protocol::capability::Capability;
use crate::protocol::channel::{ChannelHandlers, ChannelRegistry};

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Negotiating,
    Connected,
    Authenticating,
    Established,
    Active,
    Disconnecting,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Negotiating => "negotiating",
            Self::Connected => "connected",
            Self::Authenticating => "authenticating",
            Self::Established => "established",
            Self::Active => "active",
            Self::Disconnecting => "disconnecting",
            Self::Error => "error",
        }
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Negotiating)
                | (Negotiating, Connected)
                | (Connected, Authenticating)
                | (Authenticating, Established)
                | (Established, Active)
                | (Connecting | Negotiating | Authenticating, Error)
                | (
                    Connecting | Negotiating | Connected | Authenticating | Established | Active
                        | Error,
                    Disconnecting
                )
                | (Disconnecting | Error, Disconnected)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of a session for monitoring
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub client_id: String,
    pub username: String,
    pub connection_state: ConnectionState,
    pub channels: usize,
    pub created_at: DateTime<Utc>,
}

/// Full state of one client connection
pub struct RdpSession {
    pub session_id: String,
    pub client_id: String,
    pub username: String,
    pub domain: String,
    pub display_width: u32,
    pub display_height: u32,
    pub color_depth: u32,
    pub keyboard_layout: String,
    pub capabilities: Vec<Capability>,
    pub channels: ChannelRegistry,
    pub created_at: DateTime<Utc>,
    pub last_activity: Instant,
    state: ConnectionState,
    encryption_key: Option<SessionKey>,
    next_sequence: u16,
    last_inbound_sequence: Option<u16>,
}

impl RdpSession {
    /// Create a session in the CONNECTING state
    pub fn new(session_id: String, client_id: String, handlers: ChannelHandlers) -> Self {
        Self {
            session_id,
            client_id,
            username: String::new(),
            domain: String::new(),
            display_width: 1920,
            display_height: 1080,
            color_depth: 32,
            keyboard_layout: "en-US".to_string(),
            capabilities: Vec::new(),
            channels: ChannelRegistry::new(handlers),
            created_at: Utc::now(),
            last_activity: Instant::now(),
            state: ConnectionState::Connecting,
            encryption_key: None,
            next_sequence: 0,
            last_inbound_sequence: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to `next`, rejecting transitions outside the lifecycle graph
    pub fn transition(&mut self, next: ConnectionState) -> Result<(), ProtocolError> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(ProtocolError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        tracing::debug!("Session {}: {} -> {}", self.session_id, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Generate and install the session key. Only one key ever exists.
    pub fn install_key(&mut self) -> &SessionKey {
        self.encryption_key.get_or_insert_with(SessionKey::generate)
    }

    pub fn encryption_key(&self) -> Option<&SessionKey> {
        self.encryption_key.as_ref()
    }

    /// Wipe and drop the session key
    pub fn erase_key(&mut self) {
        if let Some(mut key) = self.encryption_key.take() {
            key.zeroize();
        }
    }

    /// Next outbound sequence number (wraps at 2^16)
    pub fn next_sequence(&mut self) -> u16 {
        let seq = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        seq
    }

    /// Record an inbound sequence number; returns false if it went backwards
    pub fn observe_inbound_sequence(&mut self, seq: u16) -> bool {
        let in_order = match self.last_inbound_sequence {
            // Treat a jump back of more than half the space as a wrap
            Some(last) => seq >= last || last - seq > u16::MAX / 2,
            None => true,
        };
        if in_order {
            self.last_inbound_sequence = Some(seq);
        }
        in_order
    }

    pub fn mark_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            client_id: self.client_id.clone(),
            username: self.username.clone(),
            connection_state: self.state,
            channels: self.channels.len(),
            created_at: self.created_at,
        }
    }
}

/// Generate a process-unique session id: `rdp_session_<timestamp>_<hex>`
pub fn generate_session_id() -> String {
    use rand::RngCore;

    let mut suffix = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut suffix);
    format!(
        "rdp_session_{}_{}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        hex::encode(suffix)
    )
}
