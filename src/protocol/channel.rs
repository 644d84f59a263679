//! Logical channels multiplexed over one connection
//!
//! A [`ChannelRegistry`] belongs to exactly one session. It creates the
//! channel set once, after authentication, and routes DATA packets to the
//! handler registered for the channel's type.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{ProtocolError, RdpError};
use crate::protocol::capability::Capability;
use crate::protocol::messages::Packet;
use crate::protocol::payloads::{ChannelDescriptor, ChannelEstablishment};

/// Fixed id of the control channel
pub const CONTROL_CHANNEL_ID: u16 = 1;

/// Fixed id of the data channel
pub const DATA_CHANNEL_ID: u16 = 2;

/// Channel types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelType {
    Control,
    Data,
    Audio,
    Clipboard,
    Printer,
    FileTransfer,
    Video,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Data => "data",
            Self::Audio => "audio",
            Self::Clipboard => "clipboard",
            Self::Printer => "printer",
            Self::FileTransfer => "file_transfer",
            Self::Video => "video",
        }
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional channels: (capability, id, type, priority), in id order
const OPTIONAL_CHANNELS: [(Capability, u16, ChannelType, u8); 3] = [
    (Capability::Audio, 3, ChannelType::Audio, 80),
    (Capability::Clipboard, 4, ChannelType::Clipboard, 70),
    (Capability::Printer, 5, ChannelType::Printer, 60),
];

/// A logical stream within a session
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub channel_id: u16,
    pub channel_type: ChannelType,
    pub name: String,
    pub priority: u8,
    pub encryption_enabled: bool,
    pub compression_enabled: bool,
    pub last_activity: Option<DateTime<Utc>>,
}

impl Channel {
    fn new(channel_id: u16, channel_type: ChannelType, priority: u8, compression: bool) -> Self {
        Self {
            channel_id,
            channel_type,
            name: channel_type.as_str().to_string(),
            priority,
            encryption_enabled: true,
            compression_enabled: compression,
            last_activity: None,
        }
    }

    pub fn descriptor(&self) -> ChannelDescriptor {
        ChannelDescriptor {
            channel_id: self.channel_id,
            channel_type: self.channel_type.as_str().to_string(),
            name: self.name.clone(),
            priority: self.priority,
        }
    }
}

/// Consumer of one channel type's traffic (recorder, clipboard bridge, ...)
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    async fn handle(&self, session_id: &str, channel: &Channel, packet: &Packet)
        -> Result<(), RdpError>;
}

/// Handler that only records traffic in the log
#[derive(Debug, Default)]
pub struct LoggingHandler;

#[async_trait]
impl ChannelHandler for LoggingHandler {
    async fn handle(
        &self,
        session_id: &str,
        channel: &Channel,
        packet: &Packet,
    ) -> Result<(), RdpError> {
        tracing::debug!(
            "{} channel data for {}: {} bytes",
            channel.channel_type,
            session_id,
            packet.payload.len()
        );
        Ok(())
    }
}

/// One handler per channel type, shared by every session of a server
#[derive(Clone)]
pub struct ChannelHandlers {
    control: Arc<dyn ChannelHandler>,
    data: Arc<dyn ChannelHandler>,
    audio: Arc<dyn ChannelHandler>,
    clipboard: Arc<dyn ChannelHandler>,
    printer: Arc<dyn ChannelHandler>,
    file_transfer: Arc<dyn ChannelHandler>,
    video: Arc<dyn ChannelHandler>,
}

impl Default for ChannelHandlers {
    fn default() -> Self {
        let logging: Arc<dyn ChannelHandler> = Arc::new(LoggingHandler);
        Self {
            control: logging.clone(),
            data: logging.clone(),
            audio: logging.clone(),
            clipboard: logging.clone(),
            printer: logging.clone(),
            file_transfer: logging.clone(),
            video: logging,
        }
    }
}

impl ChannelHandlers {
    /// Replace the handler for one channel type
    pub fn with_handler(mut self, channel_type: ChannelType, handler: Arc<dyn ChannelHandler>) -> Self {
        *self.slot_mut(channel_type) = handler;
        self
    }

    pub fn get(&self, channel_type: ChannelType) -> &Arc<dyn ChannelHandler> {
        match channel_type {
            ChannelType::Control => &self.control,
            ChannelType::Data => &self.data,
            ChannelType::Audio => &self.audio,
            ChannelType::Clipboard => &self.clipboard,
            ChannelType::Printer => &self.printer,
            ChannelType::FileTransfer => &self.file_transfer,
            ChannelType::Video => &self.video,
        }
    }

    fn slot_mut(&mut self, channel_type: ChannelType) -> &mut Arc<dyn ChannelHandler> {
        match channel_type {
            ChannelType::Control => &mut self.control,
            ChannelType::Data => &mut self.data,
            ChannelType::Audio => &mut self.audio,
            ChannelType::Clipboard => &mut self.clipboard,
            ChannelType::Printer => &mut self.printer,
            ChannelType::FileTransfer => &mut self.file_transfer,
            ChannelType::Video => &mut self.video,
        }
    }
}

/// Per-session channel table
pub struct ChannelRegistry {
    channels: BTreeMap<u16, Channel>,
    handlers: ChannelHandlers,
}

impl ChannelRegistry {
    pub fn new(handlers: ChannelHandlers) -> Self {
        Self {
            channels: BTreeMap::new(),
            handlers,
        }
    }

    /// Create the session's channels from the negotiated capabilities.
    ///
    /// CONTROL (1) and DATA (2) always exist; AUDIO (3), CLIPBOARD (4) and
    /// PRINTER (5) exist only when negotiated. May run once per session.
    pub fn establish(
        &mut self,
        capabilities: &[Capability],
        compression_enabled: bool,
    ) -> Result<Vec<Channel>, ProtocolError> {
        if !self.channels.is_empty() {
            return Err(ProtocolError::ChannelsAlreadyEstablished);
        }

        let compression = compression_enabled && capabilities.contains(&Capability::Compression);

        let mut created = vec![
            Channel::new(CONTROL_CHANNEL_ID, ChannelType::Control, 100, compression),
            Channel::new(DATA_CHANNEL_ID, ChannelType::Data, 90, compression),
        ];

        for (capability, id, channel_type, priority) in OPTIONAL_CHANNELS {
            if capabilities.contains(&capability) {
                created.push(Channel::new(id, channel_type, priority, compression));
            }
        }

        for channel in &created {
            self.channels.insert(channel.channel_id, channel.clone());
        }

        Ok(created)
    }

    /// Route a DATA packet to its channel's handler.
    ///
    /// Returns a copy of the channel as it stands after the update.
    pub async fn dispatch(&mut self, session_id: &str, packet: &Packet) -> Result<Channel, RdpError> {
        let channel = self
            .channels
            .get(&packet.channel_id)
            .ok_or(ProtocolError::ChannelNotFound {
                channel_id: packet.channel_id,
            })?;

        let handler = Arc::clone(self.handlers.get(channel.channel_type));
        let result = handler.handle(session_id, channel, packet).await;

        let updated = self.touch(packet.channel_id).ok_or(ProtocolError::ChannelNotFound {
            channel_id: packet.channel_id,
        })?;
        result.map(|_| updated)
    }

    /// Mark activity on a channel, if it exists
    pub fn touch(&mut self, channel_id: u16) -> Option<Channel> {
        let channel = self.channels.get_mut(&channel_id)?;
        channel.last_activity = Some(Utc::now());
        Some(channel.clone())
    }

    pub fn get(&self, channel_id: u16) -> Option<&Channel> {
        self.channels.get(&channel_id)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn ids(&self) -> Vec<u16> {
        self.channels.keys().copied().collect()
    }

    /// Channel list in establishment-packet form
    pub fn establishment(&self) -> ChannelEstablishment {
        ChannelEstablishment {
            channels: self.channels.values().map(Channel::descriptor).collect(),
            status: "established".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::PacketType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHandler {
        bytes: AtomicUsize,
    }

    #[async_trait]
    impl ChannelHandler for CountingHandler {
        async fn handle(&self, _: &str, _: &Channel, packet: &Packet) -> Result<(), RdpError> {
            self.bytes.fetch_add(packet.payload.len(), Ordering::SeqCst);
            Ok(())
        }
    }

    fn registry() -> ChannelRegistry {
        ChannelRegistry::new(ChannelHandlers::default())
    }

    #[test]
    fn test_base_channels_always_present() {
        let mut reg = registry();
        let channels = reg.establish(&[], true).unwrap();

        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].channel_type, ChannelType::Control);
        assert_eq!(channels[0].priority, 100);
        assert_eq!(channels[1].channel_id, DATA_CHANNEL_ID);
        assert_eq!(channels[1].priority, 90);
    }

    #[test]
    fn test_optional_channel_ids_are_fixed() {
        let mut reg = registry();
        reg.establish(&[Capability::Printer, Capability::Clipboard], true)
            .unwrap();
        assert_eq!(reg.ids(), vec![1, 2, 4, 5]);

        let mut reg = registry();
        reg.establish(
            &[Capability::Audio, Capability::Clipboard, Capability::Printer],
            true,
        )
        .unwrap();
        assert_eq!(reg.ids(), vec![1, 2, 3, 4, 5]);
        assert_eq!(reg.get(3).unwrap().priority, 80);
        assert_eq!(reg.get(5).unwrap().name, "printer");
    }

    #[test]
    fn test_compression_flag_requires_negotiation() {
        let mut reg = registry();
        let channels = reg.establish(&[Capability::Compression], true).unwrap();
        assert!(channels.iter().all(|c| c.compression_enabled));

        let mut reg = registry();
        let channels = reg.establish(&[], true).unwrap();
        assert!(channels.iter().all(|c| !c.compression_enabled));
    }

    #[test]
    fn test_establish_only_once() {
        let mut reg = registry();
        reg.establish(&[], false).unwrap();
        assert!(matches!(
            reg.establish(&[Capability::Audio], false),
            Err(ProtocolError::ChannelsAlreadyEstablished)
        ));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_establishment_payload() {
        let mut reg = registry();
        reg.establish(&[Capability::Clipboard], false).unwrap();
        let payload = reg.establishment();

        assert_eq!(payload.status, "established");
        let ids: Vec<u16> = payload.channels.iter().map(|c| c.channel_id).collect();
        assert_eq!(ids, vec![1, 2, 4]);
        assert_eq!(payload.channels[2].channel_type, "clipboard");
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_type() {
        let clipboard = Arc::new(CountingHandler::default());
        let handlers = ChannelHandlers::default()
            .with_handler(ChannelType::Clipboard, clipboard.clone());
        let mut reg = ChannelRegistry::new(handlers);
        reg.establish(&[Capability::Clipboard], false).unwrap();

        let packet = Packet::new(PacketType::Data, 4, 1, b"copied text".to_vec());
        let channel = reg.dispatch("s1", &packet).await.unwrap();

        assert_eq!(channel.channel_type, ChannelType::Clipboard);
        assert!(channel.last_activity.is_some());
        assert_eq!(clipboard.bytes.load(Ordering::SeqCst), 11);

        // Other channels do not reach the clipboard handler
        let packet = Packet::new(PacketType::Data, 2, 2, b"xyz".to_vec());
        reg.dispatch("s1", &packet).await.unwrap();
        assert_eq!(clipboard.bytes.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_channel() {
        let mut reg = registry();
        reg.establish(&[], false).unwrap();

        let packet = Packet::new(PacketType::Data, 3, 1, vec![1]);
        let result = reg.dispatch("s1", &packet).await;
        assert!(matches!(
            result,
            Err(RdpError::Protocol(ProtocolError::ChannelNotFound { channel_id: 3 }))
        ));
    }
}
