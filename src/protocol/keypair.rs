//! Transport keypairs and their per-peer rotation slots
//!
//! A [`Keypair`] holds the symmetric keys derived from one completed
//! handshake. Each peer keeps up to three of them in [`Keypairs`]:
//! `previous` (still accepted inbound while in-flight packets drain),
//! `current` (used for sending) and `next` (derived as responder, promoted
//! once the initiator proves possession by sending data with it).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::aead;
use crate::error::CryptoError;
use crate::protocol::constants::{REJECT_AFTER_MESSAGES, REJECT_AFTER_TIME};
use crate::protocol::messages::TransportHeader;
use crate::protocol::replay::ReplayFilter;

#[derive(Zeroize, ZeroizeOnDrop)]
struct SessionKeys {
    send: [u8; 32],
    receive: [u8; 32],
}

/// Symmetric session state for one direction pair
pub struct Keypair {
    keys: SessionKeys,
    send_nonce: AtomicU64,
    replay_filter: Mutex<ReplayFilter>,
    is_initiator: bool,
    created: Instant,
    local_index: u32,
    remote_index: u32,
}

impl Keypair {
    pub fn new(
        send_key: [u8; 32],
        receive_key: [u8; 32],
        is_initiator: bool,
        local_index: u32,
        remote_index: u32,
    ) -> Self {
        Self {
            keys: SessionKeys {
                send: send_key,
                receive: receive_key,
            },
            send_nonce: AtomicU64::new(0),
            replay_filter: Mutex::new(ReplayFilter::new()),
            is_initiator,
            created: Instant::now(),
            local_index,
            remote_index,
        }
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn local_index(&self) -> u32 {
        self.local_index
    }

    pub fn remote_index(&self) -> u32 {
        self.remote_index
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Counter the next outbound packet would use
    pub fn send_nonce(&self) -> u64 {
        self.send_nonce.load(Ordering::Relaxed)
    }

    /// Reserve the next send counter, or `None` once the key is exhausted
    pub fn next_nonce(&self) -> Option<u64> {
        let nonce = self.send_nonce.fetch_add(1, Ordering::Relaxed);
        if nonce >= REJECT_AFTER_MESSAGES {
            self.send_nonce.store(REJECT_AFTER_MESSAGES, Ordering::Relaxed);
            return None;
        }
        Some(nonce)
    }

    /// Mark the keypair as unusable for sending
    pub fn expire(&self) {
        self.send_nonce.store(REJECT_AFTER_MESSAGES, Ordering::Relaxed);
    }

    /// Usable for sending: under both the message and the time limit
    pub fn can_send(&self) -> bool {
        self.send_nonce() < REJECT_AFTER_MESSAGES && self.age() < REJECT_AFTER_TIME
    }

    /// Too old to accept inbound traffic
    pub fn is_expired(&self) -> bool {
        self.age() >= REJECT_AFTER_TIME
    }

    /// Encrypt `packet` under counter `nonce` into a complete transport message
    pub fn seal(&self, nonce: u64, mut packet: Vec<u8>) -> Result<Vec<u8>, CryptoError> {
        aead::encrypt_in_place(&self.keys.send, nonce, &mut packet)?;

        let mut datagram = vec![0u8; TransportHeader::SIZE];
        TransportHeader {
            receiver_index: self.remote_index,
            counter: nonce,
        }
        .write(&mut datagram);
        datagram.extend_from_slice(&packet);
        Ok(datagram)
    }

    /// Authenticate and decrypt the payload of a transport message
    pub fn open(&self, counter: u64, datagram: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut payload = datagram
            .get(TransportHeader::SIZE..)
            .ok_or(CryptoError::Decryption)?
            .to_vec();
        aead::decrypt_in_place(&self.keys.receive, counter, &mut payload)?;
        Ok(payload)
    }

    /// Replay check for an authenticated counter
    pub fn validate_counter(&self, counter: u64) -> bool {
        self.replay_filter
            .lock()
            .validate_counter(counter, REJECT_AFTER_MESSAGES)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("local_index", &self.local_index)
            .field("remote_index", &self.remote_index)
            .field("is_initiator", &self.is_initiator)
            .field("send_nonce", &self.send_nonce())
            .finish()
    }
}

#[derive(Default)]
struct Slots {
    previous: Option<Arc<Keypair>>,
    current: Option<Arc<Keypair>>,
    next: Option<Arc<Keypair>>,
}

/// The previous/current/next keypair slots of one peer.
///
/// Methods that evict keypairs return them so the caller can remove their
/// receiver indices from the index table.
#[derive(Default)]
pub struct Keypairs {
    slots: Mutex<Slots>,
}

impl Keypairs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<Keypair>> {
        self.slots.lock().current.clone()
    }

    pub fn previous(&self) -> Option<Arc<Keypair>> {
        self.slots.lock().previous.clone()
    }

    pub fn next(&self) -> Option<Arc<Keypair>> {
        self.slots.lock().next.clone()
    }

    /// Install a freshly derived keypair.
    ///
    /// As initiator it becomes `current` immediately. As responder it waits
    /// in `next` until confirmed by [`Keypairs::received_with_keypair`].
    pub fn install(&self, keypair: Arc<Keypair>) -> Vec<Arc<Keypair>> {
        let mut slots = self.slots.lock();
        let mut evicted = Vec::new();

        if keypair.is_initiator() {
            if let Some(next) = slots.next.take() {
                evicted.extend(slots.previous.replace(next));
                evicted.extend(slots.current.take());
            } else {
                let current = slots.current.take();
                evicted.extend(std::mem::replace(&mut slots.previous, current));
            }
            slots.current = Some(keypair);
        } else {
            evicted.extend(slots.next.replace(keypair));
            evicted.extend(slots.previous.take());
        }

        evicted
    }

    /// Promote `next` after authenticated data arrived on it.
    ///
    /// Returns `None` when `keypair` is not the pending `next`; otherwise the
    /// evicted former `previous`, if any.
    pub fn received_with_keypair(&self, keypair: &Arc<Keypair>) -> Option<Option<Arc<Keypair>>> {
        let mut slots = self.slots.lock();
        match &slots.next {
            Some(next) if Arc::ptr_eq(next, keypair) => {}
            _ => return None,
        }

        let evicted = slots.previous.take();
        slots.previous = slots.current.take();
        slots.current = slots.next.take();
        Some(evicted)
    }

    /// Make `current` and `next` unusable for sending
    pub fn expire_current(&self) {
        let slots = self.slots.lock();
        if let Some(current) = &slots.current {
            current.expire();
        }
        if let Some(next) = &slots.next {
            next.expire();
        }
    }

    /// Drop every keypair
    pub fn clear(&self) -> Vec<Arc<Keypair>> {
        let mut slots = self.slots.lock();
        [slots.previous.take(), slots.current.take(), slots.next.take()]
            .into_iter()
            .flatten()
            .collect()
    }
}
