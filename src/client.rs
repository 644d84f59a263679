//! Minimal RDP session client
//!
//! Speaks the handshake and the active-session packets from the client
//! side. Used for loopback tests and smoke checks against a running server.

use tokio::net::{TcpStream, ToSocketAddrs};

use crate::connection::PacketStream;
use crate::crypto::{aead, SessionKey};
use crate::error::{CryptoError, NetworkError, ProtocolError, RdpError};
use crate::protocol::channel::CONTROL_CHANNEL_ID;
use crate::protocol::compression;
use crate::protocol::messages::{Packet, PacketType, MAX_PAYLOAD};
use crate::protocol::payloads::{
    self, AuthenticationRequest, AuthenticationResponse, ChannelEstablishment, ConnectionRequest,
    ConnectionResponse, ControlCommand,
};

/// Version string sent in connection requests
pub const CLIENT_VERSION: &str = concat!("rdphost-client ", env!("CARGO_PKG_VERSION"));

/// Per-packet payload transforms
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub encrypt: bool,
    pub compress: bool,
}

/// Client side of one session
pub struct RdpClient {
    stream: PacketStream<TcpStream>,
    key: Option<SessionKey>,
    next_sequence: u16,
}

impl RdpClient {
    /// Open a TCP connection to a server
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, RdpError> {
        let stream = TcpStream::connect(addr).await.map_err(NetworkError::from)?;
        stream.set_nodelay(true).map_err(NetworkError::from)?;

        Ok(Self {
            stream: PacketStream::new(stream, MAX_PAYLOAD),
            key: None,
            next_sequence: 0,
        })
    }

    /// Send a connection request and wait for the negotiated capabilities
    pub async fn negotiate(&mut self, capabilities: &[&str]) -> Result<ConnectionResponse, RdpError> {
        let request = ConnectionRequest {
            version: CLIENT_VERSION.to_string(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            display_width: 1920,
            display_height: 1080,
            color_depth: 32,
        };
        self.negotiate_with(&request).await
    }

    /// Like [`RdpClient::negotiate`] with explicit display parameters
    pub async fn negotiate_with(
        &mut self,
        request: &ConnectionRequest,
    ) -> Result<ConnectionResponse, RdpError> {
        let body = payloads::to_bytes("connection request", request)?;
        self.send(PacketType::ConnectionRequest, 0, body, SendOptions::default())
            .await?;

        let packet = self.expect(PacketType::ConnectionResponse).await?;
        Ok(payloads::parse("connection response", &packet.payload)?)
    }

    /// Present credentials. On success the session key is kept for
    /// encrypted sends.
    pub async fn authenticate(
        &mut self,
        username: &str,
        password: &str,
        domain: &str,
    ) -> Result<AuthenticationResponse, RdpError> {
        let request = AuthenticationRequest {
            username: username.to_string(),
            password: password.to_string(),
            domain: domain.to_string(),
        };
        let body = payloads::to_bytes("authentication request", &request)?;
        self.send(PacketType::AuthenticationRequest, 0, body, SendOptions::default())
            .await?;

        let packet = self.expect(PacketType::AuthenticationResponse).await?;
        let response: AuthenticationResponse =
            payloads::parse("authentication response", &packet.payload)?;

        if let Some(key_hex) = &response.encryption_key {
            self.key = Some(SessionKey::from_hex(key_hex)?);
        }
        Ok(response)
    }

    /// Read the channel list the server sends after authentication
    pub async fn read_channels(&mut self) -> Result<ChannelEstablishment, RdpError> {
        let packet = self.expect(PacketType::Control).await?;
        Ok(payloads::parse("channel establishment", &packet.payload)?)
    }

    pub fn session_key(&self) -> Option<&SessionKey> {
        self.key.as_ref()
    }

    pub async fn send_data(
        &mut self,
        channel_id: u16,
        payload: &[u8],
        options: SendOptions,
    ) -> Result<(), RdpError> {
        self.send(PacketType::Data, channel_id, payload.to_vec(), options)
            .await
    }

    pub async fn send_control(&mut self, command: &ControlCommand) -> Result<(), RdpError> {
        let body = payloads::to_bytes("control command", command)?;
        self.send(PacketType::Control, CONTROL_CHANNEL_ID, body, SendOptions::default())
            .await
    }

    pub async fn send_heartbeat(&mut self) -> Result<(), RdpError> {
        self.send(
            PacketType::Heartbeat,
            CONTROL_CHANNEL_ID,
            Vec::new(),
            SendOptions::default(),
        )
        .await
    }

    /// Ask the server to end the session
    pub async fn disconnect(mut self) -> Result<(), RdpError> {
        self.send(PacketType::Disconnect, 0, Vec::new(), SendOptions::default())
            .await?;
        self.stream.shutdown().await
    }

    /// Receive the next packet, opening encrypted/compressed payloads
    pub async fn recv(&mut self) -> Result<Packet, RdpError> {
        let mut packet = self.stream.read_packet().await?;

        if packet.encrypted {
            let key = self.key.as_ref().ok_or(CryptoError::MissingKey)?;
            packet.payload = aead::decrypt(&packet.payload, key)?;
            packet.encrypted = false;
        }
        if packet.compressed {
            packet.payload = compression::decompress(&packet.payload, MAX_PAYLOAD)?;
            packet.compressed = false;
        }
        Ok(packet)
    }

    /// Receive packets until one of `packet_type` arrives, skipping heartbeats
    pub async fn expect(&mut self, packet_type: PacketType) -> Result<Packet, RdpError> {
        loop {
            let packet = self.recv().await?;
            if packet.packet_type == packet_type {
                return Ok(packet);
            }
            if packet.packet_type != PacketType::Heartbeat {
                return Err(ProtocolError::malformed(format!(
                    "expected {}, got {}",
                    packet_type, packet.packet_type
                ))
                .into());
            }
        }
    }

    async fn send(
        &mut self,
        packet_type: PacketType,
        channel_id: u16,
        mut payload: Vec<u8>,
        options: SendOptions,
    ) -> Result<(), RdpError> {
        if options.compress {
            payload = compression::compress(&payload)?;
        }
        if options.encrypt {
            let key = self.key.as_ref().ok_or(CryptoError::MissingKey)?;
            payload = aead::encrypt(&payload, key)?;
        }

        let mut packet = Packet::new(packet_type, channel_id, self.next_sequence, payload);
        packet.encrypted = options.encrypt;
        packet.compressed = options.compress;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        self.stream.write_packet(&packet).await?;
        Ok(())
    }
}
