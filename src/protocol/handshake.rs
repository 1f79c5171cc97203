//! WireGuard handshake state machine
//!
//! Implements both roles of Noise IKpsk2. A [`Handshake`] belongs to one
//! peer and moves through
//! `Zeroed -> InitiationCreated -> ResponseConsumed` as initiator or
//! `Zeroed -> InitiationConsumed -> ResponseCreated` as responder, and back
//! to `Zeroed` once the session keys have been split off.
//!
//! Every operation computes into a scratch [`SymmetricState`] and only
//! commits it when the whole message checked out, so a forged or replayed
//! message never disturbs a handshake in progress.

use std::fmt;

use tai64::Tai64N;
use tokio::time::Instant;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{is_zero, noise::SymmetricState, x25519};
use crate::error::{CryptoError, ProtocolError, Result};
use crate::protocol::constants::HANDSHAKE_INITIATION_RATE;
use crate::protocol::messages::{HandshakeInitiation, HandshakeResponse};

/// Length of a TAI64N timestamp
pub const TIMESTAMP_LEN: usize = 12;

/// The device's static keypair
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct StaticIdentity {
    private_key: [u8; 32],
    public_key: [u8; 32],
}

impl StaticIdentity {
    /// Clamp `private_key` and derive its public key
    pub fn new(mut private_key: [u8; 32]) -> Self {
        x25519::clamp(&mut private_key);
        let public_key = x25519::public_key(&private_key);
        Self {
            private_key,
            public_key,
        }
    }

    pub fn generate() -> Self {
        let (private_key, _) = x25519::generate_keypair();
        Self::new(private_key)
    }

    pub fn private_key(&self) -> &[u8; 32] {
        &self.private_key
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    /// DH(our static, their static), zero if their key is a low-order point
    pub fn static_static(&self, remote_static: &[u8; 32]) -> [u8; 32] {
        x25519::dh(&self.private_key, remote_static).unwrap_or([0u8; 32])
    }
}

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Zeroed,
    InitiationCreated,
    InitiationConsumed,
    ResponseCreated,
    ResponseConsumed,
}

impl HandshakeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zeroed => "zeroed",
            Self::InitiationCreated => "initiation created",
            Self::InitiationConsumed => "initiation consumed",
            Self::ResponseCreated => "response created",
            Self::ResponseConsumed => "response consumed",
        }
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of decrypting the static key of an inbound initiation.
///
/// Produced before the sender is known; finished by
/// [`Handshake::consume_initiation`] on the matching peer's handshake.
pub struct OpenedInitiation {
    symmetric: SymmetricState,
    remote_static: [u8; 32],
    remote_ephemeral: [u8; 32],
    sender_index: u32,
    encrypted_timestamp: [u8; 28],
}

impl OpenedInitiation {
    /// Static public key claimed by the initiator
    pub fn remote_static(&self) -> &[u8; 32] {
        &self.remote_static
    }

    pub fn sender_index(&self) -> u32 {
        self.sender_index
    }
}

/// Decrypt the initiator's static key with our identity
pub fn open_initiation(
    identity: &StaticIdentity,
    msg: &HandshakeInitiation,
) -> Result<OpenedInitiation> {
    let mut symmetric = SymmetricState::new(identity.public_key());
    symmetric.mix_hash(&msg.ephemeral_public);
    symmetric.mix_key(&msg.ephemeral_public);

    let mut key = symmetric.mix_dh(identity.private_key(), &msg.ephemeral_public)?;
    let decrypted = symmetric.decrypt_and_hash(&key, &msg.encrypted_static);
    key.zeroize();

    let remote_static: [u8; 32] = decrypted?
        .try_into()
        .map_err(|_| CryptoError::Decryption)?;

    Ok(OpenedInitiation {
        symmetric,
        remote_static,
        remote_ephemeral: msg.ephemeral_public,
        sender_index: msg.sender_index,
        encrypted_timestamp: msg.encrypted_timestamp,
    })
}

/// Keys split off a completed handshake
pub struct SessionSecrets {
    pub send_key: [u8; 32],
    pub receive_key: [u8; 32],
    pub is_initiator: bool,
    pub local_index: u32,
    pub remote_index: u32,
}

impl Drop for SessionSecrets {
    fn drop(&mut self) {
        self.send_key.zeroize();
        self.receive_key.zeroize();
    }
}

/// Per-peer handshake state
pub struct Handshake {
    state: HandshakeState,
    symmetric: SymmetricState,
    preshared_key: [u8; 32],
    local_ephemeral: [u8; 32],
    local_index: Option<u32>,
    remote_index: u32,
    remote_static: [u8; 32],
    remote_ephemeral: [u8; 32],
    precomputed_static_static: [u8; 32],
    last_timestamp: [u8; TIMESTAMP_LEN],
    last_initiation_consumption: Option<Instant>,
    /// When we last sent an initiation or response (rate limiting)
    pub last_sent_handshake: Option<Instant>,
}

impl Handshake {
    pub fn new(remote_static: [u8; 32], precomputed_static_static: [u8; 32]) -> Self {
        Self {
            state: HandshakeState::Zeroed,
            symmetric: SymmetricState::resume([0u8; 32], [0u8; 32]),
            preshared_key: [0u8; 32],
            local_ephemeral: [0u8; 32],
            local_index: None,
            remote_index: 0,
            remote_static,
            remote_ephemeral: [0u8; 32],
            precomputed_static_static,
            last_timestamp: [0u8; TIMESTAMP_LEN],
            last_initiation_consumption: None,
            last_sent_handshake: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn remote_static(&self) -> &[u8; 32] {
        &self.remote_static
    }

    pub fn local_index(&self) -> Option<u32> {
        self.local_index
    }

    pub fn preshared_key(&self) -> &[u8; 32] {
        &self.preshared_key
    }

    pub fn set_preshared_key(&mut self, psk: [u8; 32]) {
        self.preshared_key = psk;
    }

    /// Replace the cached DH(our static, their static) after a key change
    pub fn set_precomputed_static_static(&mut self, secret: [u8; 32]) {
        self.precomputed_static_static = secret;
    }

    /// Build an initiation under the receiver index `local_index`
    pub fn create_initiation(
        &mut self,
        identity: &StaticIdentity,
        local_index: u32,
    ) -> Result<HandshakeInitiation> {
        if is_zero(&self.precomputed_static_static) {
            return Err(CryptoError::DiffieHellman.into());
        }

        let mut symmetric = SymmetricState::new(&self.remote_static);
        let (ephemeral_private, ephemeral_public) = x25519::generate_keypair();
        symmetric.mix_hash(&ephemeral_public);
        symmetric.mix_key(&ephemeral_public);

        // es
        let mut key = symmetric.mix_dh(&ephemeral_private, &self.remote_static)?;
        let encrypted_static = symmetric.encrypt_and_hash(&key, identity.public_key())?;

        // ss
        key = symmetric.mix_secret(&self.precomputed_static_static);
        let timestamp = Tai64N::now().to_bytes();
        let encrypted_timestamp = symmetric.encrypt_and_hash(&key, &timestamp)?;
        key.zeroize();

        let msg = HandshakeInitiation {
            sender_index: local_index,
            ephemeral_public,
            encrypted_static: encrypted_static
                .try_into()
                .map_err(|_| CryptoError::Encryption)?,
            encrypted_timestamp: encrypted_timestamp
                .try_into()
                .map_err(|_| CryptoError::Encryption)?,
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        };

        self.symmetric = symmetric;
        self.local_ephemeral = ephemeral_private;
        self.local_index = Some(local_index);
        self.state = HandshakeState::InitiationCreated;
        Ok(msg)
    }

    /// Finish consuming an initiation whose static key matched this peer.
    ///
    /// Rejects timestamps that are not newer than the last accepted one and
    /// initiations arriving within `HANDSHAKE_INITIATION_RATE` of the last.
    pub fn consume_initiation(&mut self, opened: OpenedInitiation) -> Result<()> {
        if is_zero(&self.precomputed_static_static) {
            return Err(CryptoError::DiffieHellman.into());
        }

        let OpenedInitiation {
            mut symmetric,
            remote_ephemeral,
            sender_index,
            encrypted_timestamp,
            ..
        } = opened;

        let mut key = symmetric.mix_secret(&self.precomputed_static_static);
        let decrypted = symmetric.decrypt_and_hash(&key, &encrypted_timestamp);
        key.zeroize();
        let timestamp: [u8; TIMESTAMP_LEN] = decrypted?
            .try_into()
            .map_err(|_| CryptoError::Decryption)?;

        // TAI64N is big-endian, so byte order is time order
        if timestamp <= self.last_timestamp {
            return Err(ProtocolError::TimestampReplay.into());
        }
        let now = Instant::now();
        if let Some(last) = self.last_initiation_consumption {
            if now.saturating_duration_since(last) <= HANDSHAKE_INITIATION_RATE {
                return Err(ProtocolError::HandshakeFlood.into());
            }
        }

        self.symmetric = symmetric;
        self.remote_ephemeral = remote_ephemeral;
        self.remote_index = sender_index;
        self.last_timestamp = timestamp;
        self.last_initiation_consumption = Some(now);
        self.state = HandshakeState::InitiationConsumed;
        Ok(())
    }

    /// Build the response to a consumed initiation
    pub fn create_response(&mut self, local_index: u32) -> Result<HandshakeResponse> {
        if self.state != HandshakeState::InitiationConsumed {
            return Err(ProtocolError::UnexpectedState {
                state: self.state.as_str(),
            }
            .into());
        }

        let mut symmetric = self.symmetric.clone();
        let (ephemeral_private, ephemeral_public) = x25519::generate_keypair();
        symmetric.mix_hash(&ephemeral_public);
        symmetric.mix_key(&ephemeral_public);
        symmetric.mix_key_dh(&ephemeral_private, &self.remote_ephemeral)?;
        symmetric.mix_key_dh(&ephemeral_private, &self.remote_static)?;

        let mut key = symmetric.mix_psk(&self.preshared_key);
        let encrypted_nothing = symmetric.encrypt_and_hash(&key, &[])?;
        key.zeroize();

        let msg = HandshakeResponse {
            sender_index: local_index,
            receiver_index: self.remote_index,
            ephemeral_public,
            encrypted_nothing: encrypted_nothing
                .try_into()
                .map_err(|_| CryptoError::Encryption)?,
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        };

        self.symmetric = symmetric;
        self.local_ephemeral = ephemeral_private;
        self.local_index = Some(local_index);
        self.state = HandshakeState::ResponseCreated;
        Ok(msg)
    }

    /// Consume the response to our initiation.
    ///
    /// Only valid in `InitiationCreated`, so a duplicate response is refused.
    pub fn consume_response(
        &mut self,
        identity: &StaticIdentity,
        msg: &HandshakeResponse,
    ) -> Result<()> {
        if self.state != HandshakeState::InitiationCreated {
            return Err(ProtocolError::UnexpectedState {
                state: self.state.as_str(),
            }
            .into());
        }

        let mut symmetric = self.symmetric.clone();
        symmetric.mix_hash(&msg.ephemeral_public);
        symmetric.mix_key(&msg.ephemeral_public);
        symmetric.mix_key_dh(&self.local_ephemeral, &msg.ephemeral_public)?;
        symmetric.mix_key_dh(identity.private_key(), &msg.ephemeral_public)?;

        let mut key = symmetric.mix_psk(&self.preshared_key);
        let opened = symmetric.decrypt_and_hash(&key, &msg.encrypted_nothing);
        key.zeroize();
        opened?;

        self.symmetric = symmetric;
        self.remote_index = msg.sender_index;
        self.state = HandshakeState::ResponseConsumed;
        Ok(())
    }

    /// Split the transport keys off a finished handshake and zero it.
    ///
    /// The receiver index moves to the keypair, so the handshake forgets it.
    pub fn derive_session(&mut self) -> Result<SessionSecrets> {
        let is_initiator = match self.state {
            HandshakeState::ResponseConsumed => true,
            HandshakeState::ResponseCreated => false,
            state => {
                return Err(ProtocolError::UnexpectedState {
                    state: state.as_str(),
                }
                .into())
            }
        };
        let local_index = self.local_index.ok_or(ProtocolError::NoSession)?;

        let (first, second) = self.symmetric.split();
        let (send_key, receive_key) = if is_initiator {
            (first, second)
        } else {
            (second, first)
        };

        let secrets = SessionSecrets {
            send_key,
            receive_key,
            is_initiator,
            local_index,
            remote_index: self.remote_index,
        };

        self.local_index = None;
        self.clear();
        Ok(secrets)
    }

    /// Zero ephemeral material and return to `Zeroed`.
    ///
    /// Returns the receiver index that was allocated to this handshake, if
    /// any, so the caller can release it.
    pub fn clear(&mut self) -> Option<u32> {
        self.symmetric.zeroize();
        self.local_ephemeral.zeroize();
        self.remote_ephemeral.zeroize();
        self.state = HandshakeState::Zeroed;
        self.local_index.take()
    }
}

impl Drop for Handshake {
    fn drop(&mut self) {
        self.local_ephemeral.zeroize();
        self.preshared_key.zeroize();
        self.precomputed_static_static.zeroize();
    }
}
