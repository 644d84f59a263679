//! Seams for collaborators outside the protocol engine
//!
//! Credential checks and session lifecycle notifications (recorder, trust
//! controller, billing) plug in here.

use async_trait::async_trait;

use crate::error::RdpError;
use crate::protocol::channel::Channel;
use crate::protocol::messages::Packet;
use crate::protocol::session::SessionSummary;

/// Decides whether a set of credentials may open a session
#[async_trait]
pub trait CredentialValidator: Send + Sync {
    async fn validate(&self, username: &str, password: &str, domain: &str) -> bool;
}

/// Accepts any request with a non-empty username and password
#[derive(Debug, Default, Clone, Copy)]
pub struct NonEmptyCredentials;

#[async_trait]
impl CredentialValidator for NonEmptyCredentials {
    async fn validate(&self, username: &str, password: &str, _domain: &str) -> bool {
        !username.is_empty() && !password.is_empty()
    }
}

/// Receives session lifecycle events.
///
/// Errors returned here are logged by the engine and never end a session.
#[async_trait]
pub trait SessionObserver: Send + Sync {
    /// Session reached ACTIVE
    async fn on_connected(&self, _session: &SessionSummary) -> Result<(), RdpError> {
        Ok(())
    }

    /// Session is being torn down
    async fn on_disconnected(&self, _session: &SessionSummary) -> Result<(), RdpError> {
        Ok(())
    }

    /// A DATA packet was routed to `channel`
    async fn on_data(
        &self,
        _session: &SessionSummary,
        _channel: &Channel,
        _packet: &Packet,
    ) -> Result<(), RdpError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_non_empty_credentials() {
        let validator = NonEmptyCredentials;
        assert!(validator.validate("alice", "secret", "").await);
        assert!(!validator.validate("", "secret", "CORP").await);
        assert!(!validator.validate("alice", "", "CORP").await);
        assert!(!validator.validate("", "", "").await);
    }
}
