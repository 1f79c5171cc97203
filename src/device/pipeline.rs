//! Encryption/decryption worker pool and the per-peer sequential routines.
//!
//! Every packet is handed to the shared worker pool as a [`CryptoJob`] and,
//! at the same time, a slot holding the job's completion receiver is pushed
//! onto the owning peer's ordered queue. Workers finish jobs in any order;
//! the sequential sender and receiver await the slots in queue order, so
//! each peer's packets leave and arrive in the order they were accepted.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, oneshot, Mutex};

use super::ip;
use super::peer::Peer;
use crate::protocol::constants::{
    KEEPALIVE_TIMEOUT, REJECT_AFTER_TIME, REKEY_AFTER_MESSAGES, REKEY_AFTER_TIME, REKEY_TIMEOUT,
};
use crate::protocol::Keypair;

pub(crate) enum CryptoJob {
    Seal {
        keypair: Arc<Keypair>,
        nonce: u64,
        packet: Vec<u8>,
        done: oneshot::Sender<Option<Vec<u8>>>,
    },
    Open {
        keypair: Arc<Keypair>,
        counter: u64,
        datagram: Vec<u8>,
        done: oneshot::Sender<Option<Vec<u8>>>,
    },
}

impl CryptoJob {
    fn run(self) {
        match self {
            CryptoJob::Seal {
                keypair,
                nonce,
                packet,
                done,
            } => {
                let _ = done.send(keypair.seal(nonce, packet).ok());
            }
            CryptoJob::Open {
                keypair,
                counter,
                datagram,
                done,
            } => {
                let _ = done.send(keypair.open(counter, &datagram).ok());
            }
        }
    }
}

/// Outbound packet in peer order; `result` resolves to the sealed datagram
pub(crate) struct OutboundSlot {
    pub(crate) keypair: Arc<Keypair>,
    pub(crate) keepalive: bool,
    pub(crate) result: oneshot::Receiver<Option<Vec<u8>>>,
}

/// Inbound datagram in peer order; `result` resolves to the plaintext
pub(crate) struct InboundSlot {
    pub(crate) keypair: Arc<Keypair>,
    pub(crate) counter: u64,
    pub(crate) src: SocketAddr,
    pub(crate) len: usize,
    pub(crate) result: oneshot::Receiver<Option<Vec<u8>>>,
}

pub(crate) async fn routine_crypto_worker(id: usize, jobs: Arc<Mutex<mpsc::Receiver<CryptoJob>>>) {
    tracing::trace!("Crypto worker {} started", id);
    loop {
        let job = jobs.lock().await.recv().await;
        match job {
            Some(job) => job.run(),
            None => break,
        }
    }
    tracing::trace!("Crypto worker {} stopped", id);
}

pub(crate) async fn routine_sequential_sender(peer: Weak<Peer>, mut slots: mpsc::Receiver<OutboundSlot>) {
    while let Some(slot) = slots.recv().await {
        let Ok(Some(datagram)) = slot.result.await else {
            tracing::trace!("Dropping packet that failed to encrypt");
            continue;
        };
        let Some(peer) = peer.upgrade() else {
            break;
        };

        peer.timers_any_authenticated_packet_traversal();
        peer.timers_any_authenticated_packet_sent();
        if let Err(e) = peer.send_buffer(&datagram).await {
            tracing::debug!("{} - Failed to send data packet: {}", peer, e);
            continue;
        }
        if !slot.keepalive {
            peer.timers_data_sent();
        }
        keep_key_fresh_sending(&peer, &slot.keypair);
    }
    tracing::trace!("Sequential sender stopped");
}

pub(crate) async fn routine_sequential_receiver(peer: Weak<Peer>, mut slots: mpsc::Receiver<InboundSlot>) {
    while let Some(slot) = slots.recv().await {
        let Ok(Some(packet)) = slot.result.await else {
            tracing::trace!("Dropping packet that failed to decrypt");
            continue;
        };
        let Some(peer) = peer.upgrade() else {
            break;
        };
        let Some(device) = peer.device() else {
            break;
        };

        if !slot.keypair.validate_counter(slot.counter) {
            device.drops.replayed();
            tracing::trace!("{} - Dropping replayed packet {}", peer, slot.counter);
            continue;
        }

        peer.set_endpoint_from_packet(slot.src);
        if let Some(evicted) = peer.keypairs.received_with_keypair(&slot.keypair) {
            peer.release_keypairs(evicted);
            peer.timers_handshake_complete();
            peer.send_staged_packets();
        }

        keep_key_fresh_receiving(&peer);
        peer.timers_any_authenticated_packet_traversal();
        peer.timers_any_authenticated_packet_received();
        peer.add_rx_bytes(slot.len);

        if packet.is_empty() {
            tracing::trace!("{} - Received keepalive", peer);
            continue;
        }
        peer.timers_data_received();

        let Some((source, length)) = ip::source_and_length(&packet) else {
            device.drops.unauthenticated();
            tracing::trace!("{} - Dropping malformed inner packet", peer);
            continue;
        };
        match device.allowed_ips.lookup(source) {
            Some(owner) if Arc::ptr_eq(&owner, &peer) => {}
            _ => {
                device.drops.unauthenticated();
                tracing::trace!("{} - Dropping packet from disallowed source {}", peer, source);
                continue;
            }
        }

        if let Err(e) = device.interface.write(&packet[..length]).await {
            tracing::error!("Failed to write packet to interface: {}", e);
        }
    }
    tracing::trace!("Sequential receiver stopped");
}

/// Initiate a rekey once the sending key is old or heavily used
fn keep_key_fresh_sending(peer: &Arc<Peer>, keypair: &Arc<Keypair>) {
    let Some(current) = peer.keypairs.current() else {
        return;
    };
    if !Arc::ptr_eq(&current, keypair) {
        return;
    }
    if current.send_nonce() > REKEY_AFTER_MESSAGES
        || (current.is_initiator() && current.age() > REKEY_AFTER_TIME)
    {
        peer.spawn_handshake_initiation(false);
    }
}

/// As initiator, rekey before the current key stops being accepted
fn keep_key_fresh_receiving(peer: &Arc<Peer>) {
    use std::sync::atomic::Ordering;

    if peer.timers.sent_last_minute_handshake.load(Ordering::Relaxed) {
        return;
    }
    let Some(current) = peer.keypairs.current() else {
        return;
    };
    if current.is_initiator() && current.age() > REJECT_AFTER_TIME - KEEPALIVE_TIMEOUT - REKEY_TIMEOUT {
        peer.timers
            .sent_last_minute_handshake
            .store(true, Ordering::Relaxed);
        peer.spawn_handshake_initiation(false);
    }
}
