//! Error types for the warpguard tunnelling core

use std::net::IpAddr;

use thiserror::Error;

/// Main error type for warpguard
#[derive(Error, Debug)]
pub enum WireGuardError {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Cryptographic errors
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Network errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
}

/// Configuration errors, surfaced synchronously to whoever configures the device
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid config format at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Invalid key: {field}")]
    InvalidKey { field: String },

    #[error("Invalid IP address: {value}")]
    InvalidAddress { value: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid CIDR notation: {value}")]
    InvalidCidr { value: String },

    #[error("Peer key equals the device public key")]
    PeerIsSelf,

    #[error("Peer already exists")]
    DuplicatePeer,

    #[error("Too many peers: limit is {limit}")]
    TooManyPeers { limit: usize },

    #[error("Device is closed")]
    DeviceClosed,

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

    #[error("DH computation produced a non-contributory shared secret")]
    DiffieHellman,
}

/// Protocol-level errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid message type: {msg_type}")]
    InvalidMessageType { msg_type: u8 },

    #[error("Invalid message length: expected {expected}, got {got}")]
    InvalidMessageLength { expected: usize, got: usize },

    #[error("Handshake replay: timestamp is not newer than the last accepted one")]
    TimestampReplay,

    #[error("Handshake flood: initiation arrived too soon after the previous one")]
    HandshakeFlood,

    #[error("Unexpected handshake state: {state}")]
    UnexpectedState { state: &'static str },

    #[error("Unknown peer")]
    UnknownPeer,

    #[error("Invalid receiver index: {index}")]
    InvalidReceiverIndex { index: u32 },

    #[error("Failed to allocate a free receiver index after {attempts} attempts")]
    IndexExhausted { attempts: usize },

    #[error("No active session")]
    NoSession,

    #[error("Malformed IP packet")]
    MalformedPacket,
}

/// Network-level errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Send failed: {reason}")]
    SendFailed { reason: String },

    #[error("Endpoint not set")]
    NoEndpoint,

    #[error("No peer routes {addr}")]
    NoRoute { addr: IpAddr },

    #[error("Device is down")]
    DeviceDown,
}

impl WireGuardError {
    /// Check if this error is recoverable
    ///
    /// Dropped packets (crypto, protocol state, exhausted resources) are
    /// recoverable; rejected configuration is not.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Crypto(_) => true,
            Self::Protocol(_) => true,
            Self::Network(NetworkError::DeviceDown) => false,
            Self::Network(_) => true,
        }
    }
}

/// Result type alias for warpguard operations
pub type Result<T> = std::result::Result<T, WireGuardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        let err: WireGuardError = ConfigError::PeerIsSelf.into();
        assert!(!err.is_recoverable());

        let err: WireGuardError = CryptoError::Decryption.into();
        assert!(err.is_recoverable());

        let err: WireGuardError = ProtocolError::InvalidReceiverIndex { index: 7 }.into();
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("index: 7"));

        let err: WireGuardError = NetworkError::DeviceDown.into();
        assert!(!err.is_recoverable());
    }
}
