//! Session state machine
//!
//! Drives one accepted connection through negotiation, authentication and
//! channel establishment, runs the active data loop, then tears the session
//! down. Generic over the byte stream so the same code runs over TCP and
//! over in-memory pipes.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::{interval_at, timeout, Instant, Interval, MissedTickBehavior};

use crate::config::ServerConfig;
use crate::crypto::{aead, checksum};
use crate::error::{CryptoError, NetworkError, ProtocolError, RdpError};
use crate::hooks::{CredentialValidator, NonEmptyCredentials, SessionObserver};
use crate::protocol::capability;
use crate::protocol::channel::{ChannelHandlers, CONTROL_CHANNEL_ID};
use crate::protocol::compression;
use crate::protocol::messages::{decode, encode, Packet, PacketHeader, PacketType, HEADER_SIZE};
use crate::protocol::payloads::{
    self, AuthenticationRequest, AuthenticationResponse, CapabilitiesReply, ConnectionRequest,
    ConnectionResponse, ControlCommand, Heartbeat,
};
use crate::protocol::session::{ConnectionState, RdpSession};
use crate::registry::SessionRegistry;

/// Receive timeout of one active-loop iteration
pub const RECEIVE_TICK: Duration = Duration::from_secs(1);

/// Bytes requested from the socket per read
const READ_CHUNK: usize = 4096;

/// Packet framing over a byte stream.
///
/// Reads are buffered internally, so [`PacketStream::read_packet`] can be
/// cancelled (by a timeout or `select!`) without losing partial frames.
pub struct PacketStream<S> {
    stream: S,
    buf: Vec<u8>,
    /// Bytes of an oversized frame still to be skipped
    discard: usize,
    max_payload: usize,
}

impl<S> PacketStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, max_payload: usize) -> Self {
        Self {
            stream,
            buf: Vec::with_capacity(READ_CHUNK),
            discard: 0,
            max_payload,
        }
    }

    /// Read the next packet.
    ///
    /// Protocol errors consume the offending frame, so the caller may keep
    /// reading. Transport errors are returned as [`NetworkError`].
    pub async fn read_packet(&mut self) -> Result<Packet, RdpError> {
        loop {
            if let Some(result) = self.next_buffered() {
                return result.map_err(RdpError::from);
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self
                .stream
                .read(&mut chunk)
                .await
                .map_err(|e| NetworkError::ReceiveFailed {
                    reason: e.to_string(),
                })?;
            if n == 0 {
                return Err(NetworkError::ConnectionClosed.into());
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Pop one complete frame off the buffer, if there is one
    fn next_buffered(&mut self) -> Option<Result<Packet, ProtocolError>> {
        if self.discard > 0 {
            let n = self.discard.min(self.buf.len());
            self.buf.drain(..n);
            self.discard -= n;
            if self.discard > 0 {
                return None;
            }
        }

        if self.buf.len() < HEADER_SIZE {
            return None;
        }

        let header = match PacketHeader::from_bytes(&self.buf) {
            Ok(header) => header,
            Err(e) => {
                // The length field is unusable; skip the header and resync on what follows
                self.buf.drain(..HEADER_SIZE);
                return Some(Err(e));
            }
        };

        if header.payload_len() > self.max_payload {
            self.discard = header.total_length as usize;
            return Some(Err(ProtocolError::malformed(format!(
                "payload of {} bytes exceeds the {} byte buffer",
                header.payload_len(),
                self.max_payload
            ))));
        }

        let total = header.total_length as usize;
        if self.buf.len() < total {
            return None;
        }

        let frame: Vec<u8> = self.buf.drain(..total).collect();
        Some(decode(&frame))
    }

    /// Write one packet; returns the number of bytes put on the wire
    pub async fn write_packet(&mut self, packet: &Packet) -> Result<usize, RdpError> {
        let bytes = encode(packet)?;
        let send_failed = |e: std::io::Error| NetworkError::SendFailed {
            reason: e.to_string(),
        };

        self.stream.write_all(&bytes).await.map_err(send_failed)?;
        self.stream.flush().await.map_err(send_failed)?;
        Ok(bytes.len())
    }

    /// Close the write half of the stream
    pub async fn shutdown(&mut self) -> Result<(), RdpError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Everything a session task shares with the rest of the server
pub struct SessionContext {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<SessionRegistry>,
    pub validator: Arc<dyn CredentialValidator>,
    pub observers: Vec<Arc<dyn SessionObserver>>,
    pub handlers: ChannelHandlers,
}

impl SessionContext {
    /// Context with the default credential check and logging handlers
    pub fn new(config: ServerConfig, registry: Arc<SessionRegistry>) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            validator: Arc::new(NonEmptyCredentials),
            observers: Vec::new(),
            handlers: ChannelHandlers::default(),
        }
    }
}

/// Outcome of one active-loop iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    IdleTimeout,
    ClientDisconnect,
}

enum Tick {
    Received(Result<Packet, RdpError>),
    Quiet,
    Heartbeat,
}

/// One client connection and the session it carries
pub struct Connection<S> {
    stream: PacketStream<S>,
    session: RdpSession,
    ctx: Arc<SessionContext>,
    heartbeat: Option<Interval>,
    torn_down: bool,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, session: RdpSession, ctx: Arc<SessionContext>) -> Self {
        let max_payload = ctx.config.buffer_size;
        Self {
            stream: PacketStream::new(stream, max_payload),
            session,
            ctx,
            heartbeat: None,
            torn_down: false,
        }
    }

    pub fn session(&self) -> &RdpSession {
        &self.session
    }

    /// Run the session to completion.
    ///
    /// `shutdown` flipping to `true` cancels whatever the session is waiting
    /// on and goes straight to teardown. Idle expiry, client disconnect and
    /// forced disconnect all return `Ok`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), RdpError> {
        let outcome = tokio::select! {
            result = self.drive() => Some(result),
            _ = shutdown_requested(&mut shutdown) => None,
        };

        let result = match outcome {
            Some(result) => result,
            None => {
                tracing::info!("Session {} disconnected by server", self.session.session_id);
                Ok(())
            }
        };

        if let Err(e) = &result {
            if self.session.state().can_transition_to(ConnectionState::Error) {
                let _ = self.session.transition(ConnectionState::Error);
            }
            tracing::error!("Session {} failed: {}", self.session.session_id, e);
        }

        self.teardown().await;
        result
    }

    async fn drive(&mut self) -> Result<(), RdpError> {
        self.negotiate().await?;
        self.authenticate().await?;
        self.establish_channels().await?;

        self.session.transition(ConnectionState::Active)?;
        self.publish();

        let summary = self.session.summary();
        for observer in &self.ctx.observers {
            if let Err(e) = observer.on_connected(&summary).await {
                tracing::warn!("Connection observer failed: {}", e);
            }
        }
        tracing::info!(
            "Session {} active for {}",
            self.session.session_id,
            self.session.username
        );

        loop {
            match self.step().await? {
                LoopControl::Continue => {}
                LoopControl::IdleTimeout => {
                    let idle = ProtocolError::IdleTimeout {
                        seconds: self.session.idle_for().as_secs(),
                    };
                    tracing::info!("Session {}: {}, closing", self.session.session_id, idle);
                    return Ok(());
                }
                LoopControl::ClientDisconnect => {
                    tracing::info!("Client requested disconnect for {}", self.session.session_id);
                    return Ok(());
                }
            }
        }
    }

    /// NEGOTIATING: read the connection request and answer with the
    /// negotiated capability set
    async fn negotiate(&mut self) -> Result<(), RdpError> {
        self.session.transition(ConnectionState::Negotiating)?;
        self.publish();

        let packet = self.recv_handshake().await?;
        if packet.packet_type != PacketType::ConnectionRequest {
            return Err(ProtocolError::NegotiationFailure {
                reason: format!("expected connection_request, got {}", packet.packet_type),
            }
            .into());
        }

        let request: ConnectionRequest = payloads::parse("connection request", &packet.payload)
            .map_err(|e| ProtocolError::NegotiationFailure {
                reason: e.to_string(),
            })?;

        self.session.display_width = request.display_width;
        self.session.display_height = request.display_height;
        self.session.color_depth = request.color_depth;

        let supported = self.ctx.config.supported_capabilities();
        self.session.capabilities = capability::negotiate(&request.capabilities, &supported);

        let response = ConnectionResponse::success(capability::names(&self.session.capabilities));
        let body = payloads::to_bytes("connection response", &response)?;
        self.send(PacketType::ConnectionResponse, 0, body).await?;

        self.session.transition(ConnectionState::Connected)?;
        self.publish();

        tracing::info!(
            "Negotiated {:?} with client {} ({}x{}x{})",
            response.capabilities,
            request.version,
            self.session.display_width,
            self.session.display_height,
            self.session.color_depth
        );
        Ok(())
    }

    /// AUTHENTICATING: validate credentials and hand out the session key
    async fn authenticate(&mut self) -> Result<(), RdpError> {
        self.session.transition(ConnectionState::Authenticating)?;
        self.publish();

        let packet = self.recv_handshake().await?;
        let request: Result<AuthenticationRequest, ProtocolError> =
            if packet.packet_type == PacketType::AuthenticationRequest {
                payloads::parse("authentication request", &packet.payload)
            } else {
                Err(ProtocolError::InvalidPayload {
                    kind: "authentication request",
                    reason: format!("unexpected {} packet", packet.packet_type),
                })
            };

        let request = match request {
            Ok(request) => request,
            Err(e) => {
                self.reject().await?;
                return Err(e.into());
            }
        };

        let accepted = self
            .ctx
            .validator
            .validate(&request.username, &request.password, &request.domain)
            .await;

        if !accepted {
            self.reject().await?;
            return Err(ProtocolError::AuthenticationFailure {
                username: request.username,
            }
            .into());
        }

        self.session.username = request.username;
        self.session.domain = request.domain;
        let key_hex = self.session.install_key().to_hex();

        let body = payloads::to_bytes(
            "authentication response",
            &AuthenticationResponse::accepted(key_hex),
        )?;
        self.send(PacketType::AuthenticationResponse, 0, body).await?;
        self.publish();

        tracing::info!(
            "Authenticated {}\\{} for session {}",
            self.session.domain,
            self.session.username,
            self.session.session_id
        );
        Ok(())
    }

    async fn reject(&mut self) -> Result<(), RdpError> {
        let body = payloads::to_bytes(
            "authentication response",
            &AuthenticationResponse::rejected(),
        )?;
        self.send(PacketType::AuthenticationResponse, 0, body).await?;
        self.session.transition(ConnectionState::Error)?;
        self.publish();
        Ok(())
    }

    /// Create the channel set and announce it on the control channel
    async fn establish_channels(&mut self) -> Result<(), RdpError> {
        let compression_enabled = self.ctx.config.compression_enabled;
        let channels = self
            .session
            .channels
            .establish(&self.session.capabilities, compression_enabled)?;

        let body = payloads::to_bytes("channel establishment", &self.session.channels.establishment())?;
        self.send(PacketType::Control, CONTROL_CHANNEL_ID, body).await?;

        self.session.transition(ConnectionState::Established)?;
        self.publish();

        tracing::info!(
            "Channels established for session {}: {} channels",
            self.session.session_id,
            channels.len()
        );
        Ok(())
    }

    /// One iteration of the active loop
    async fn step(&mut self) -> Result<LoopControl, RdpError> {
        let period = self.ctx.config.heartbeat_interval;
        let tick = {
            let heartbeat = self.heartbeat.get_or_insert_with(|| heartbeat_timer(period));
            tokio::select! {
                received = timeout(RECEIVE_TICK, self.stream.read_packet()) => match received {
                    Ok(result) => Tick::Received(result),
                    Err(_) => Tick::Quiet,
                },
                _ = heartbeat.tick() => Tick::Heartbeat,
            }
        };

        match tick {
            Tick::Received(Ok(packet)) => {
                self.record_inbound(&packet);
                match self.handle_packet(packet).await {
                    Ok(control) => Ok(control),
                    Err(e) if e.is_fatal_in_active_loop() => Err(e),
                    Err(e) => {
                        tracing::warn!("Session {}: packet dropped: {}", self.session.session_id, e);
                        Ok(LoopControl::Continue)
                    }
                }
            }
            Tick::Received(Err(e)) if e.is_fatal_in_active_loop() => Err(e),
            Tick::Received(Err(e)) => {
                tracing::warn!("Session {}: packet dropped: {}", self.session.session_id, e);
                Ok(LoopControl::Continue)
            }
            Tick::Quiet => {
                if self.session.idle_for() > self.ctx.config.idle_timeout {
                    Ok(LoopControl::IdleTimeout)
                } else {
                    Ok(LoopControl::Continue)
                }
            }
            Tick::Heartbeat => {
                self.send_heartbeat().await?;
                Ok(LoopControl::Continue)
            }
        }
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<LoopControl, RdpError> {
        let packet = self.open_payload(packet)?;

        match packet.packet_type {
            PacketType::Data => self.handle_data(&packet).await?,
            PacketType::Control => self.handle_control(&packet).await?,
            PacketType::Heartbeat => self.send_heartbeat().await?,
            PacketType::Disconnect => return Ok(LoopControl::ClientDisconnect),
            other => {
                tracing::warn!(
                    "Session {}: unexpected {} packet while active",
                    self.session.session_id,
                    other
                );
            }
        }

        Ok(LoopControl::Continue)
    }

    /// Decrypt and decompress according to the packet flags
    fn open_payload(&self, mut packet: Packet) -> Result<Packet, RdpError> {
        if packet.encrypted {
            let key = self.session.encryption_key().ok_or(CryptoError::MissingKey)?;
            packet.payload = aead::decrypt(&packet.payload, key)?;
            packet.encrypted = false;
        }
        if packet.compressed {
            packet.payload = compression::decompress(&packet.payload, self.ctx.config.buffer_size)?;
            packet.compressed = false;
        }
        Ok(packet)
    }

    async fn handle_data(&mut self, packet: &Packet) -> Result<(), RdpError> {
        let channel = self
            .session
            .channels
            .dispatch(&self.session.session_id, packet)
            .await?;

        let summary = self.session.summary();
        for observer in &self.ctx.observers {
            if let Err(e) = observer.on_data(&summary, &channel, packet).await {
                tracing::warn!("Data observer failed: {}", e);
            }
        }
        Ok(())
    }

    async fn handle_control(&mut self, packet: &Packet) -> Result<(), RdpError> {
        self.session.channels.touch(packet.channel_id);

        match payloads::parse::<ControlCommand>("control command", &packet.payload)? {
            ControlCommand::ResizeDisplay { width, height } => {
                self.session.display_width = width;
                self.session.display_height = height;
                tracing::info!("Display resized to {}x{}", width, height);
            }
            ControlCommand::RequestCapabilities => {
                let reply = CapabilitiesReply {
                    capabilities: capability::names(&self.session.capabilities),
                };
                let body = payloads::to_bytes("capabilities reply", &reply)?;
                self.send(PacketType::Data, packet.channel_id, body).await?;
            }
            ControlCommand::Heartbeat => self.send_heartbeat().await?,
        }
        Ok(())
    }

    async fn send_heartbeat(&mut self) -> Result<(), RdpError> {
        let body = payloads::to_bytes("heartbeat", &Heartbeat::now(&self.session.session_id))?;
        self.send(PacketType::Heartbeat, CONTROL_CHANNEL_ID, body).await
    }

    async fn send(
        &mut self,
        packet_type: PacketType,
        channel_id: u16,
        payload: Vec<u8>,
    ) -> Result<(), RdpError> {
        let packet = Packet::new(packet_type, channel_id, self.session.next_sequence(), payload);
        let written = self.stream.write_packet(&packet).await?;
        self.ctx.registry.traffic().add_sent(written as u64);

        tracing::trace!(
            "Sent {} seq {} on channel {} ({} bytes, checksum {})",
            packet.packet_type,
            packet.sequence_number,
            packet.channel_id,
            written,
            checksum::checksum(&packet.payload)
        );
        Ok(())
    }

    async fn recv_handshake(&mut self) -> Result<Packet, RdpError> {
        let limit = self.ctx.config.handshake_timeout;
        let packet = timeout(limit, self.stream.read_packet())
            .await
            .map_err(|_| NetworkError::ReceiveTimeout {
                seconds: limit.as_secs(),
            })??;
        self.record_inbound(&packet);
        Ok(packet)
    }

    fn record_inbound(&mut self, packet: &Packet) {
        self.ctx.registry.traffic().add_received(packet.wire_len() as u64);
        if !self.session.observe_inbound_sequence(packet.sequence_number) {
            tracing::warn!(
                "Session {}: sequence went backwards to {}",
                self.session.session_id,
                packet.sequence_number
            );
        }
        self.session.mark_activity();
    }

    fn publish(&self) {
        self.ctx.registry.update(self.session.summary());
    }

    /// Notify observers, unregister, wipe the key and close the stream.
    /// Runs at most once.
    async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        let _ = self.session.transition(ConnectionState::Disconnecting);

        let summary = self.session.summary();
        for observer in &self.ctx.observers {
            if let Err(e) = observer.on_disconnected(&summary).await {
                tracing::warn!("Disconnection observer failed: {}", e);
            }
        }

        self.ctx.registry.remove(&self.session.session_id);
        self.session.erase_key();

        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!("Stream shutdown for {}: {}", self.session.session_id, e);
        }

        let _ = self.session.transition(ConnectionState::Disconnected);
        tracing::info!("Session {} closed", self.session.session_id);
    }
}

fn heartbeat_timer(period: Duration) -> Interval {
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

/// Resolves once the registry asks this session to stop
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone: nobody can ask any more
            std::future::pending::<()>().await;
        }
    }
}
