//! RDP packet wire format
//!
//! Every message is an 8-byte header followed by the payload, all integers
//! big-endian:
//!
//! ```text
//! total_length(2) | packet_type(2) | channel_id(2) | sequence_number(2) | payload(n)
//! ```
//!
//! `total_length` covers header and payload. The two high bits of
//! `packet_type` carry the `encrypted` (0x8000) and `compressed` (0x4000)
//! flags; the remaining bits hold the type code.

use chrono::{DateTime, Utc};

use crate::error::ProtocolError;

/// Size of the fixed packet header
pub const HEADER_SIZE: usize = 8;

/// Largest payload that fits the 16-bit length field
pub const MAX_PAYLOAD: usize = u16::MAX as usize - HEADER_SIZE;

/// Flag bit: payload is encrypted with the session key
pub const FLAG_ENCRYPTED: u16 = 0x8000;

/// Flag bit: payload is compressed
pub const FLAG_COMPRESSED: u16 = 0x4000;

const FLAG_MASK: u16 = FLAG_ENCRYPTED | FLAG_COMPRESSED;

/// RDP packet types
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    ConnectionRequest = 1,
    ConnectionResponse = 2,
    AuthenticationRequest = 3,
    AuthenticationResponse = 4,
    Data = 5,
    Control = 6,
    Heartbeat = 7,
    Disconnect = 8,
}

impl PacketType {
    pub const ALL: [PacketType; 8] = [
        Self::ConnectionRequest,
        Self::ConnectionResponse,
        Self::AuthenticationRequest,
        Self::AuthenticationResponse,
        Self::Data,
        Self::Control,
        Self::Heartbeat,
        Self::Disconnect,
    ];

    pub fn code(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::ConnectionRequest),
            2 => Ok(Self::ConnectionResponse),
            3 => Ok(Self::AuthenticationRequest),
            4 => Ok(Self::AuthenticationResponse),
            5 => Ok(Self::Data),
            6 => Ok(Self::Control),
            7 => Ok(Self::Heartbeat),
            8 => Ok(Self::Disconnect),
            _ => Err(ProtocolError::UnknownPacketType { code: value }),
        }
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ConnectionRequest => "connection_request",
            Self::ConnectionResponse => "connection_response",
            Self::AuthenticationRequest => "authentication_request",
            Self::AuthenticationResponse => "authentication_response",
            Self::Data => "data",
            Self::Control => "control",
            Self::Heartbeat => "heartbeat",
            Self::Disconnect => "disconnect",
        };
        f.write_str(name)
    }
}

/// Decoded packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub total_length: u16,
    pub raw_type: u16,
    pub channel_id: u16,
    pub sequence_number: u16,
}

impl PacketHeader {
    /// Parse the fixed header from the front of a buffer
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::malformed(format!(
                "need {} header bytes, got {}",
                HEADER_SIZE,
                data.len()
            )));
        }

        let header = Self {
            total_length: u16::from_be_bytes([data[0], data[1]]),
            raw_type: u16::from_be_bytes([data[2], data[3]]),
            channel_id: u16::from_be_bytes([data[4], data[5]]),
            sequence_number: u16::from_be_bytes([data[6], data[7]]),
        };

        if (header.total_length as usize) < HEADER_SIZE {
            return Err(ProtocolError::malformed(format!(
                "declared length {} is shorter than the header",
                header.total_length
            )));
        }

        Ok(header)
    }

    /// Payload bytes announced by the header
    pub fn payload_len(&self) -> usize {
        self.total_length as usize - HEADER_SIZE
    }
}

/// A single protocol message
#[derive(Debug, Clone)]
pub struct Packet {
    pub packet_type: PacketType,
    pub channel_id: u16,
    pub payload: Vec<u8>,
    pub sequence_number: u16,
    /// Local creation or receipt time; not carried on the wire
    pub timestamp: DateTime<Utc>,
    pub encrypted: bool,
    pub compressed: bool,
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.packet_type == other.packet_type
            && self.channel_id == other.channel_id
            && self.payload == other.payload
            && self.sequence_number == other.sequence_number
            && self.encrypted == other.encrypted
            && self.compressed == other.compressed
    }
}

impl Eq for Packet {}

impl Packet {
    /// Create a plaintext, uncompressed packet
    pub fn new(
        packet_type: PacketType,
        channel_id: u16,
        sequence_number: u16,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            packet_type,
            channel_id,
            payload,
            sequence_number,
            timestamp: Utc::now(),
            encrypted: false,
            compressed: false,
        }
    }

    /// Declared length of this packet on the wire
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    fn raw_type(&self) -> u16 {
        let mut raw = self.packet_type.code();
        if self.encrypted {
            raw |= FLAG_ENCRYPTED;
        }
        if self.compressed {
            raw |= FLAG_COMPRESSED;
        }
        raw
    }
}

/// Serialize a packet to its wire form
pub fn encode(packet: &Packet) -> Result<Vec<u8>, ProtocolError> {
    if packet.payload.len() > MAX_PAYLOAD {
        return Err(ProtocolError::malformed(format!(
            "payload of {} bytes exceeds the {} byte limit",
            packet.payload.len(),
            MAX_PAYLOAD
        )));
    }

    let total_length = packet.wire_len() as u16;
    let mut buf = Vec::with_capacity(packet.wire_len());

    buf.extend_from_slice(&total_length.to_be_bytes());
    buf.extend_from_slice(&packet.raw_type().to_be_bytes());
    buf.extend_from_slice(&packet.channel_id.to_be_bytes());
    buf.extend_from_slice(&packet.sequence_number.to_be_bytes());
    buf.extend_from_slice(&packet.payload);

    Ok(buf)
}

/// Parse a packet from its wire form.
///
/// Bytes past the declared length are ignored.
pub fn decode(data: &[u8]) -> Result<Packet, ProtocolError> {
    let header = PacketHeader::from_bytes(data)?;
    let total = header.total_length as usize;

    if total > data.len() {
        return Err(ProtocolError::malformed(format!(
            "declared length {} exceeds {} available bytes",
            total,
            data.len()
        )));
    }

    let packet_type = PacketType::try_from(header.raw_type & !FLAG_MASK)
        .map_err(|_| ProtocolError::UnknownPacketType {
            code: header.raw_type,
        })?;

    Ok(Packet {
        packet_type,
        channel_id: header.channel_id,
        payload: data[HEADER_SIZE..total].to_vec(),
        sequence_number: header.sequence_number,
        timestamp: Utc::now(),
        encrypted: header.raw_type & FLAG_ENCRYPTED != 0,
        compressed: header.raw_type & FLAG_COMPRESSED != 0,
    })
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::config::DEFAULT_BUFFER_SIZE;
    use proptest::prelude::*;

    fn packet_type() -> impl Strategy<Value = PacketType> {
        (0..PacketType::ALL.len()).prop_map(|i| PacketType::ALL[i])
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn roundtrip(
            packet_type in packet_type(),
            channel_id in any::<u16>(),
            sequence_number in any::<u16>(),
            payload in proptest::collection::vec(any::<u8>(), 0..=DEFAULT_BUFFER_SIZE),
            encrypted in any::<bool>(),
            compressed in any::<bool>(),
        ) {
            let mut packet = Packet::new(packet_type, channel_id, sequence_number, payload);
            packet.encrypted = encrypted;
            packet.compressed = compressed;
            prop_assert_eq!(decode(&encode(&packet).unwrap()).unwrap(), packet);
        }

        #[test]
        fn short_buffers_are_malformed(data in proptest::collection::vec(any::<u8>(), 0..HEADER_SIZE)) {
            let is_malformed = matches!(decode(&data), Err(ProtocolError::MalformedPacket { .. }));
            prop_assert!(is_malformed);
        }

        #[test]
        fn overlong_declared_length_is_malformed(
            declared in (HEADER_SIZE as u16 + 1)..=u16::MAX,
            rest in proptest::collection::vec(any::<u8>(), 6),
        ) {
            let mut data = declared.to_be_bytes().to_vec();
            data.extend_from_slice(&rest);
            let is_malformed = matches!(decode(&data), Err(ProtocolError::MalformedPacket { .. }));
            prop_assert!(is_malformed);
        }
    }
}
