//! Process-wide session table and traffic counters
//!
//! One [`SessionRegistry`] is created at startup and shared (via `Arc`) by
//! the acceptor and every session task. Sessions publish summaries here;
//! the session state itself stays with the owning task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::watch;

use crate::protocol::session::{ConnectionState, SessionSummary};

/// Aggregate traffic counters
#[derive(Debug, Default)]
pub struct TrafficStats {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl TrafficStats {
    pub fn add_sent(&self, bytes: u64) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_received(&self, bytes: u64) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the registry for monitoring collaborators
#[derive(Debug, Clone, Serialize)]
pub struct StatisticsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connections_rejected: u64,
    pub sessions_active: usize,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub active_sessions: Vec<SessionSummary>,
}

struct SessionEntry {
    summary: SessionSummary,
    shutdown_tx: watch::Sender<bool>,
}

/// Shared table of live sessions
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    connections_total: AtomicU64,
    connections_active: AtomicU64,
    connections_rejected: AtomicU64,
    traffic: TrafficStats,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionEntry>> {
        // A panic while holding the lock cannot leave the map half-updated
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a newly accepted session.
    ///
    /// Returns the receiver the session task watches for a forced disconnect.
    pub fn register(&self, summary: SessionSummary) -> watch::Receiver<bool> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        let session_id = summary.session_id.clone();
        let displaced = self.sessions().insert(
            session_id.clone(),
            SessionEntry {
                summary,
                shutdown_tx,
            },
        );

        match displaced {
            Some(old) => {
                // Same id twice: the older session loses its slot and is told to stop
                tracing::warn!("Session id {} registered twice, replacing", session_id);
                let _ = old.shutdown_tx.send(true);
            }
            None => {
                self.connections_active.fetch_add(1, Ordering::Relaxed);
            }
        }
        shutdown_rx
    }

    /// Publish a fresh summary for an existing session
    pub fn update(&self, summary: SessionSummary) {
        if let Some(entry) = self.sessions().get_mut(&summary.session_id) {
            entry.summary = summary;
        }
    }

    /// Remove a session. Removing an absent session is a no-op.
    pub fn remove(&self, session_id: &str) -> bool {
        let removed = self.sessions().remove(session_id).is_some();
        if removed {
            // Never underflow even if remove races with itself
            let _ = self
                .connections_active
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        }
        removed
    }

    /// Count a connection refused before a session was created
    pub fn record_rejected(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Ask one session to tear down now
    pub fn force_disconnect(&self, session_id: &str) -> bool {
        match self.sessions().get(session_id) {
            Some(entry) => {
                let _ = entry.shutdown_tx.send(true);
                true
            }
            None => false,
        }
    }

    /// Ask every session to tear down; returns how many were signalled
    pub fn disconnect_all(&self) -> usize {
        let sessions = self.sessions();
        for entry in sessions.values() {
            let _ = entry.shutdown_tx.send(true);
        }
        sessions.len()
    }

    pub fn get(&self, session_id: &str) -> Option<SessionSummary> {
        self.sessions().get(session_id).map(|e| e.summary.clone())
    }

    pub fn active_count(&self) -> usize {
        self.sessions().len()
    }

    /// Number of sessions currently in `state`
    pub fn count_in_state(&self, state: ConnectionState) -> usize {
        self.sessions()
            .values()
            .filter(|e| e.summary.connection_state == state)
            .count()
    }

    pub fn traffic(&self) -> &TrafficStats {
        &self.traffic
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        let mut active_sessions: Vec<SessionSummary> =
            self.sessions().values().map(|e| e.summary.clone()).collect();
        active_sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        StatisticsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            sessions_active: active_sessions.len(),
            packets_sent: self.traffic.packets_sent.load(Ordering::Relaxed),
            packets_received: self.traffic.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.traffic.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.traffic.bytes_received.load(Ordering::Relaxed),
            active_sessions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn summary(id: &str) -> SessionSummary {
        SessionSummary {
            session_id: id.to_string(),
            client_id: "127.0.0.1:1".to_string(),
            username: String::new(),
            connection_state: ConnectionState::Connecting,
            channels: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_register_and_remove() {
        let registry = SessionRegistry::new();
        let _rx = registry.register(summary("a"));
        let _rx = registry.register(summary("b"));

        let stats = registry.snapshot();
        assert_eq!(stats.connections_total, 2);
        assert_eq!(stats.connections_active, 2);
        assert_eq!(stats.sessions_active, 2);

        assert!(registry.remove("a"));
        // idempotent
        assert!(!registry.remove("a"));

        let stats = registry.snapshot();
        assert_eq!(stats.connections_total, 2);
        assert_eq!(stats.connections_active, 1);
        assert_eq!(stats.active_sessions[0].session_id, "b");
    }

    #[test]
    fn test_update_summary() {
        let registry = SessionRegistry::new();
        let _rx = registry.register(summary("a"));

        let mut updated = summary("a");
        updated.username = "alice".to_string();
        updated.connection_state = ConnectionState::Active;
        updated.channels = 3;
        registry.update(updated);

        let got = registry.get("a").unwrap();
        assert_eq!(got.username, "alice");
        assert_eq!(got.channels, 3);
        assert_eq!(registry.count_in_state(ConnectionState::Active), 1);

        // Updates for unknown sessions are dropped
        registry.update(summary("ghost"));
        assert!(registry.get("ghost").is_none());
    }

    #[test]
    fn test_traffic_counters() {
        let registry = SessionRegistry::new();
        registry.traffic().add_sent(100);
        registry.traffic().add_sent(20);
        registry.traffic().add_received(8);

        let stats = registry.snapshot();
        assert_eq!(stats.packets_sent, 2);
        assert_eq!(stats.bytes_sent, 120);
        assert_eq!(stats.packets_received, 1);
        assert_eq!(stats.bytes_received, 8);
    }

    #[test]
    fn test_force_disconnect_signals_session() {
        let registry = SessionRegistry::new();
        let rx = registry.register(summary("a"));
        let other = registry.register(summary("b"));

        assert!(registry.force_disconnect("a"));
        assert!(*rx.borrow());
        assert!(!*other.borrow());
        assert!(!registry.force_disconnect("missing"));

        assert_eq!(registry.disconnect_all(), 2);
        assert!(*other.borrow());
    }

    #[test]
    fn test_duplicate_id_replaces_and_signals_old_session() {
        let registry = SessionRegistry::new();
        let first = registry.register(summary("a"));
        let second = registry.register(summary("a"));

        assert!(*first.borrow());
        assert!(!*second.borrow());
        assert_eq!(registry.active_count(), 1);

        let stats = registry.snapshot();
        assert_eq!(stats.connections_total, 2);
        assert_eq!(stats.connections_active, 1);

        assert!(registry.remove("a"));
        assert_eq!(registry.snapshot().connections_active, 0);
    }

    #[test]
    fn test_rejected_connections() {
        let registry = SessionRegistry::new();
        registry.record_rejected();

        let stats = registry.snapshot();
        assert_eq!(stats.connections_total, 1);
        assert_eq!(stats.connections_rejected, 1);
        assert_eq!(stats.connections_active, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let registry = SessionRegistry::new();
        let _rx = registry.register(summary("a"));
        let json = serde_json::to_value(registry.snapshot()).unwrap();
        assert_eq!(json["active_sessions"][0]["connection_state"], "connecting");
    }
}
