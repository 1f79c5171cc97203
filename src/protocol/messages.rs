//! WireGuard message wire formats
//!
//! All integers are little-endian and the layouts are bit-exact:
//! - Type 1: Handshake Initiation (148 bytes)
//! - Type 2: Handshake Response (92 bytes)
//! - Type 3: Cookie Reply (64 bytes)
//! - Type 4: Transport Data (16-byte header + ciphertext with tag)

use crate::crypto::aead::TAG_LEN;
use crate::error::ProtocolError;

/// WireGuard message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    HandshakeInitiation = 1,
    HandshakeResponse = 2,
    CookieReply = 3,
    TransportData = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::HandshakeInitiation),
            2 => Ok(Self::HandshakeResponse),
            3 => Ok(Self::CookieReply),
            4 => Ok(Self::TransportData),
            _ => Err(ProtocolError::InvalidMessageType { msg_type: value }),
        }
    }
}

/// Classify a datagram, checking the length its type requires.
///
/// The type is a little-endian u32 whose upper three bytes must be zero.
pub fn classify(data: &[u8]) -> Result<MessageType, ProtocolError> {
    if data.len() < 4 {
        return Err(ProtocolError::InvalidMessageLength {
            expected: 4,
            got: data.len(),
        });
    }
    if data[1..4] != [0, 0, 0] {
        return Err(ProtocolError::InvalidMessageType { msg_type: data[0] });
    }

    let msg_type = MessageType::try_from(data[0])?;
    let ok = match msg_type {
        MessageType::HandshakeInitiation => data.len() == HandshakeInitiation::SIZE,
        MessageType::HandshakeResponse => data.len() == HandshakeResponse::SIZE,
        MessageType::CookieReply => data.len() == CookieReply::SIZE,
        MessageType::TransportData => data.len() >= TransportHeader::MIN_SIZE,
    };
    if !ok {
        return Err(ProtocolError::InvalidMessageLength {
            expected: msg_type.min_size(),
            got: data.len(),
        });
    }
    Ok(msg_type)
}

impl MessageType {
    fn min_size(self) -> usize {
        match self {
            Self::HandshakeInitiation => HandshakeInitiation::SIZE,
            Self::HandshakeResponse => HandshakeResponse::SIZE,
            Self::CookieReply => CookieReply::SIZE,
            Self::TransportData => TransportHeader::MIN_SIZE,
        }
    }
}

/// Offsets of (mac1, mac2) inside a handshake message of `len` bytes
pub fn mac_offsets(len: usize) -> (usize, usize) {
    (len - 32, len - 16)
}

fn check(data: &[u8], size: usize, msg_type: MessageType) -> Result<(), ProtocolError> {
    if data.len() != size {
        return Err(ProtocolError::InvalidMessageLength {
            expected: size,
            got: data.len(),
        });
    }
    if data[0] != msg_type as u8 {
        return Err(ProtocolError::InvalidMessageType { msg_type: data[0] });
    }
    Ok(())
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(buf)
}

fn read_array<const N: usize>(data: &[u8], at: usize) -> [u8; N] {
    let mut buf = [0u8; N];
    buf.copy_from_slice(&data[at..at + N]);
    buf
}

/// Handshake Initiation message (148 bytes)
///
/// ```text
/// type(1) | reserved(3) | sender_index(4) | ephemeral_public(32) |
/// encrypted_static(48) | encrypted_timestamp(28) | mac1(16) | mac2(16)
/// ```
#[derive(Debug, Clone)]
pub struct HandshakeInitiation {
    pub sender_index: u32,
    pub ephemeral_public: [u8; 32],
    pub encrypted_static: [u8; 48],
    pub encrypted_timestamp: [u8; 28],
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl HandshakeInitiation {
    pub const SIZE: usize = 148;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = MessageType::HandshakeInitiation as u8;
        buf[4..8].copy_from_slice(&self.sender_index.to_le_bytes());
        buf[8..40].copy_from_slice(&self.ephemeral_public);
        buf[40..88].copy_from_slice(&self.encrypted_static);
        buf[88..116].copy_from_slice(&self.encrypted_timestamp);
        buf[116..132].copy_from_slice(&self.mac1);
        buf[132..148].copy_from_slice(&self.mac2);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        check(data, Self::SIZE, MessageType::HandshakeInitiation)?;
        Ok(Self {
            sender_index: read_u32(data, 4),
            ephemeral_public: read_array(data, 8),
            encrypted_static: read_array(data, 40),
            encrypted_timestamp: read_array(data, 88),
            mac1: read_array(data, 116),
            mac2: read_array(data, 132),
        })
    }
}

/// Handshake Response message (92 bytes)
///
/// ```text
/// type(1) | reserved(3) | sender_index(4) | receiver_index(4) |
/// ephemeral_public(32) | encrypted_nothing(16) | mac1(16) | mac2(16)
/// ```
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub sender_index: u32,
    pub receiver_index: u32,
    pub ephemeral_public: [u8; 32],
    pub encrypted_nothing: [u8; 16],
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl HandshakeResponse {
    pub const SIZE: usize = 92;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = MessageType::HandshakeResponse as u8;
        buf[4..8].copy_from_slice(&self.sender_index.to_le_bytes());
        buf[8..12].copy_from_slice(&self.receiver_index.to_le_bytes());
        buf[12..44].copy_from_slice(&self.ephemeral_public);
        buf[44..60].copy_from_slice(&self.encrypted_nothing);
        buf[60..76].copy_from_slice(&self.mac1);
        buf[76..92].copy_from_slice(&self.mac2);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        check(data, Self::SIZE, MessageType::HandshakeResponse)?;
        Ok(Self {
            sender_index: read_u32(data, 4),
            receiver_index: read_u32(data, 8),
            ephemeral_public: read_array(data, 12),
            encrypted_nothing: read_array(data, 44),
            mac1: read_array(data, 60),
            mac2: read_array(data, 76),
        })
    }
}

/// Cookie Reply message (64 bytes)
///
/// ```text
/// type(1) | reserved(3) | receiver_index(4) | nonce(24) | encrypted_cookie(32)
/// ```
#[derive(Debug, Clone)]
pub struct CookieReply {
    pub receiver_index: u32,
    pub nonce: [u8; 24],
    pub encrypted_cookie: [u8; 32],
}

impl CookieReply {
    pub const SIZE: usize = 64;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = MessageType::CookieReply as u8;
        buf[4..8].copy_from_slice(&self.receiver_index.to_le_bytes());
        buf[8..32].copy_from_slice(&self.nonce);
        buf[32..64].copy_from_slice(&self.encrypted_cookie);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        check(data, Self::SIZE, MessageType::CookieReply)?;
        Ok(Self {
            receiver_index: read_u32(data, 4),
            nonce: read_array(data, 8),
            encrypted_cookie: read_array(data, 32),
        })
    }
}

/// Transport data header (16 bytes)
///
/// ```text
/// type(1) | reserved(3) | receiver_index(4) | counter(8) | encrypted_payload(...)
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TransportHeader {
    pub receiver_index: u32,
    pub counter: u64,
}

impl TransportHeader {
    pub const SIZE: usize = 16;

    /// Header plus an empty (keepalive) payload's tag
    pub const MIN_SIZE: usize = Self::SIZE + TAG_LEN;

    pub fn write(&self, buf: &mut [u8]) {
        buf[0] = MessageType::TransportData as u8;
        buf[1..4].fill(0);
        buf[4..8].copy_from_slice(&self.receiver_index.to_le_bytes());
        buf[8..16].copy_from_slice(&self.counter.to_le_bytes());
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < Self::MIN_SIZE {
            return Err(ProtocolError::InvalidMessageLength {
                expected: Self::MIN_SIZE,
                got: data.len(),
            });
        }
        if data[0] != MessageType::TransportData as u8 {
            return Err(ProtocolError::InvalidMessageType { msg_type: data[0] });
        }
        Ok(Self {
            receiver_index: read_u32(data, 4),
            counter: read_u64(data, 8),
        })
    }
}

/// Sender index of a handshake message (initiation or response)
pub fn sender_index(data: &[u8]) -> Option<u32> {
    (data.len() >= 8).then(|| read_u32(data, 4))
}
