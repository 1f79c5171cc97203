//! Cookie handling for WireGuard DoS protection
//!
//! The [`CookieChecker`] lives on the device and validates MAC1/MAC2 on
//! inbound handshake messages; under load it answers with an encrypted
//! cookie bound to the sender's address. Each peer owns a
//! [`CookieGenerator`] that stamps MACs on outbound handshake messages and
//! stores cookies received from that peer.

use std::net::SocketAddr;

use rand::RngCore;
use tokio::time::Instant;
use zeroize::Zeroize;

use crate::crypto::{aead, blake2s, constant_time_eq, noise};
use crate::protocol::constants::COOKIE_REFRESH_TIME;
use crate::protocol::messages::{mac_offsets, CookieReply};

/// Address bytes the cookie is bound to: IP octets then port, little-endian
pub fn source_bytes(src: &SocketAddr) -> Vec<u8> {
    let mut bytes = match src {
        SocketAddr::V4(addr) => addr.ip().octets().to_vec(),
        SocketAddr::V6(addr) => addr.ip().octets().to_vec(),
    };
    bytes.extend_from_slice(&src.port().to_le_bytes());
    bytes
}

fn is_fresh(set_at: Option<Instant>) -> bool {
    set_at.is_some_and(|at| at.elapsed() <= COOKIE_REFRESH_TIME)
}

/// Device-side MAC validation and cookie issuing
pub struct CookieChecker {
    mac1_key: [u8; 32],
    encryption_key: [u8; 32],
    secret: [u8; 32],
    secret_set: Option<Instant>,
}

impl CookieChecker {
    /// Keyed with the device's own static public key
    pub fn new(public_key: &[u8; 32]) -> Self {
        Self {
            mac1_key: noise::mac1_key(public_key),
            encryption_key: noise::cookie_key(public_key),
            secret: [0u8; 32],
            secret_set: None,
        }
    }

    /// Verify MAC1 = MAC(HASH("mac1----" || our_pk), msg[..mac1])
    pub fn check_mac1(&self, msg: &[u8]) -> bool {
        let (smac1, smac2) = mac_offsets(msg.len());
        let mac1 = blake2s::mac(&self.mac1_key, &msg[..smac1]);
        constant_time_eq(&mac1, &msg[smac1..smac2])
    }

    /// Verify MAC2 against the cookie we would currently issue to `src`.
    ///
    /// Always false once the cookie secret is older than the refresh time.
    pub fn check_mac2(&self, msg: &[u8], src: &SocketAddr) -> bool {
        if !is_fresh(self.secret_set) {
            return false;
        }

        let cookie = blake2s::mac(&self.secret, &source_bytes(src));
        let (_, smac2) = mac_offsets(msg.len());
        let mac2 = blake2s::mac(&cookie, &msg[..smac2]);
        constant_time_eq(&mac2, &msg[smac2..])
    }

    /// Build a cookie reply for `msg`, addressed to the sender index `receiver`
    pub fn create_reply(&mut self, msg: &[u8], receiver: u32, src: &SocketAddr) -> Option<CookieReply> {
        if !is_fresh(self.secret_set) {
            rand::thread_rng().fill_bytes(&mut self.secret);
            self.secret_set = Some(Instant::now());
        }

        let cookie = blake2s::mac(&self.secret, &source_bytes(src));
        let (smac1, smac2) = mac_offsets(msg.len());

        let mut nonce = [0u8; aead::XNONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let sealed = aead::xencrypt(&self.encryption_key, &nonce, &cookie, &msg[smac1..smac2]).ok()?;
        Some(CookieReply {
            receiver_index: receiver,
            nonce,
            encrypted_cookie: sealed.try_into().ok()?,
        })
    }
}

impl Drop for CookieChecker {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// Peer-side MAC stamping and cookie storage
pub struct CookieGenerator {
    mac1_key: [u8; 32],
    encryption_key: [u8; 32],
    cookie: [u8; 16],
    cookie_set: Option<Instant>,
    last_mac1: Option<[u8; 16]>,
}

impl CookieGenerator {
    /// Keyed with the remote peer's static public key
    pub fn new(public_key: &[u8; 32]) -> Self {
        Self {
            mac1_key: noise::mac1_key(public_key),
            encryption_key: noise::cookie_key(public_key),
            cookie: [0u8; 16],
            cookie_set: None,
            last_mac1: None,
        }
    }

    /// Decrypt a cookie reply sent in answer to our last MAC1
    pub fn consume_reply(&mut self, reply: &CookieReply) -> bool {
        let Some(last_mac1) = self.last_mac1 else {
            return false;
        };

        match aead::xdecrypt(&self.encryption_key, &reply.nonce, &reply.encrypted_cookie, &last_mac1) {
            Ok(cookie) if cookie.len() == self.cookie.len() => {
                self.cookie.copy_from_slice(&cookie);
                self.cookie_set = Some(Instant::now());
                tracing::debug!("Stored new cookie");
                true
            }
            _ => false,
        }
    }

    /// Fill in MAC1 (always) and MAC2 (when a fresh cookie is held)
    pub fn add_macs(&mut self, msg: &mut [u8]) {
        let (smac1, smac2) = mac_offsets(msg.len());

        let mac1 = blake2s::mac(&self.mac1_key, &msg[..smac1]);
        msg[smac1..smac2].copy_from_slice(&mac1);
        self.last_mac1 = Some(mac1);

        if !is_fresh(self.cookie_set) {
            return;
        }
        let mac2 = blake2s::mac(&self.cookie, &msg[..smac2]);
        msg[smac2..].copy_from_slice(&mac2);
    }

    pub fn has_cookie(&self) -> bool {
        is_fresh(self.cookie_set)
    }
}

impl Drop for CookieGenerator {
    fn drop(&mut self) {
        self.cookie.zeroize();
    }
}
