//! WireGuard protocol implementation
//!
//! Transport-independent protocol state:
//! - Message wire formats
//! - Handshake state machine (Noise IKpsk2)
//! - Cookie MACs for DoS protection
//! - Keypairs and their rotation
//! - Replay filter

pub mod constants;
pub mod cookie;
pub mod handshake;
pub mod keypair;
pub mod messages;
pub mod replay;

pub use cookie::{CookieChecker, CookieGenerator};
pub use handshake::{Handshake, HandshakeState, StaticIdentity};
pub use keypair::{Keypair, Keypairs};
pub use messages::{
    CookieReply, HandshakeInitiation, HandshakeResponse, MessageType, TransportHeader,
};
pub use replay::ReplayFilter;
