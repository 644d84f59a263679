//! RDP server orchestration
//!
//! Accepts TCP connections and hands each one to its own session task.
//! The accept loop never dies on a per-connection error; it logs, backs off
//! briefly and keeps going.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tracing::Instrument;

use crate::config::ServerConfig;
use crate::connection::{Connection, SessionContext};
use crate::error::{NetworkError, RdpError};
use crate::hooks::{CredentialValidator, NonEmptyCredentials, SessionObserver};
use crate::protocol::channel::ChannelHandlers;
use crate::protocol::session::{generate_session_id, RdpSession};
use crate::registry::SessionRegistry;

/// Pending-connection queue length
const LISTEN_BACKLOG: i32 = 100;

/// Pause after a failed accept
const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// How long [`RdpServer::shutdown`] waits for sessions to finish teardown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// RDP server
pub struct RdpServer {
    config: Arc<ServerConfig>,
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    validator: Arc<dyn CredentialValidator>,
    observers: Vec<Arc<dyn SessionObserver>>,
    handlers: ChannelHandlers,
}

impl RdpServer {
    /// Bind the listening socket described by `config`
    pub async fn bind(config: ServerConfig) -> Result<Self, RdpError> {
        let addr_str = config.listen_addr();
        let bind_failed = |reason: String| NetworkError::BindFailed {
            addr: addr_str.clone(),
            reason,
        };

        let addr = tokio::net::lookup_host(&addr_str)
            .await
            .map_err(|e| bind_failed(e.to_string()))?
            .next()
            .ok_or_else(|| bind_failed("host did not resolve".to_string()))?;

        let listener = bind_listener(addr).map_err(|e| bind_failed(e.to_string()))?;
        let listener = TcpListener::from_std(listener).map_err(|e| bind_failed(e.to_string()))?;

        tracing::info!("RDP server listening on {}", listener.local_addr()?);

        Ok(Self {
            config: Arc::new(config),
            listener,
            registry: Arc::new(SessionRegistry::new()),
            validator: Arc::new(NonEmptyCredentials),
            observers: Vec::new(),
            handlers: ChannelHandlers::default(),
        })
    }

    /// Replace the credential check
    pub fn with_validator(mut self, validator: Arc<dyn CredentialValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Add a session lifecycle observer
    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Replace the per-channel-type handlers
    pub fn with_handlers(mut self, handlers: ChannelHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RdpError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Accept connections until the task is cancelled
    pub async fn run(&self) -> Result<(), RdpError> {
        let ctx = Arc::new(SessionContext {
            config: Arc::clone(&self.config),
            registry: Arc::clone(&self.registry),
            validator: Arc::clone(&self.validator),
            observers: self.observers.clone(),
            handlers: self.handlers.clone(),
        });

        tracing::info!(
            "Accepting sessions (max {}, capabilities {:?})",
            self.config.max_sessions,
            self.config.supported_capabilities()
        );

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => dispatch(stream, peer, &ctx),
                Err(e) => {
                    tracing::error!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    /// Disconnect every session and wait (bounded) for their teardown
    pub async fn shutdown(&self) -> usize {
        let signalled = self.registry.disconnect_all();
        tracing::info!("Disconnecting {} sessions", signalled);

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while self.registry.active_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let remaining = self.registry.active_count();
        if remaining > 0 {
            tracing::warn!("{} sessions still tearing down at shutdown", remaining);
        }
        signalled
    }
}

fn bind_listener(addr: SocketAddr) -> std::io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

/// Register a new session and spawn its task
fn dispatch(stream: TcpStream, peer: SocketAddr, ctx: &Arc<SessionContext>) {
    let max_sessions = ctx.config.max_sessions;
    if max_sessions > 0 && ctx.registry.active_count() >= max_sessions {
        tracing::warn!("Rejecting {}: {} sessions already active", peer, max_sessions);
        ctx.registry.record_rejected();
        return;
    }

    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("TCP_NODELAY on {}: {}", peer, e);
    }

    let session_id = generate_session_id();
    let session = RdpSession::new(session_id.clone(), peer.to_string(), ctx.handlers.clone());
    let shutdown = ctx.registry.register(session.summary());
    tracing::info!("Accepted {} as {}", peer, session_id);

    let connection = Connection::new(stream, session, Arc::clone(ctx));
    let span = tracing::info_span!("session", session_id = %session_id, peer = %peer);
    tokio::spawn(
        async move {
            // Failures are logged by the session itself
            let _ = connection.run(shutdown).await;
        }
        .instrument(span),
    );
}
