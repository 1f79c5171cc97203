//! Outbound path: staging, nonce assignment, padding and handshake sends

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::ip;
use super::peer::Peer;
use super::pipeline::{CryptoJob, OutboundSlot};
use super::Device;
use crate::error::{NetworkError, ProtocolError, Result};
use crate::protocol::constants::{PADDING_MULTIPLE, QUEUE_STAGED_SIZE, REKEY_TIMEOUT};
use crate::protocol::Keypair;

/// Zero bytes to append so the plaintext is a multiple of 16, capped at the MTU
pub(crate) fn padding_len(packet_len: usize, mtu: usize) -> usize {
    let round_up = |n: usize| (n + PADDING_MULTIPLE - 1) & !(PADDING_MULTIPLE - 1);
    if mtu == 0 {
        return round_up(packet_len) - packet_len;
    }

    let mut last_unit = packet_len;
    if last_unit > mtu {
        last_unit %= mtu;
    }
    round_up(last_unit).min(mtu) - last_unit
}

impl Device {
    /// Route an outbound IP packet to the peer owning its destination
    pub fn send(&self, packet: &[u8]) -> Result<()> {
        if !self.is_up() {
            return Err(NetworkError::DeviceDown.into());
        }
        let destination = ip::destination(packet).ok_or(ProtocolError::MalformedPacket)?;
        let peer = self
            .allowed_ips
            .lookup(destination)
            .ok_or(NetworkError::NoRoute { addr: destination })?;

        if !peer.is_running() {
            tracing::trace!("{} - Dropping packet, peer is not running", peer);
            return Ok(());
        }
        peer.stage_packet(packet.to_vec());
        peer.send_staged_packets();
        Ok(())
    }
}

impl Peer {
    /// Queue plaintext until a usable keypair exists, evicting the oldest
    pub(crate) fn stage_packet(&self, packet: Vec<u8>) {
        let mut queues = self.queues.lock();
        if queues.staged.len() >= QUEUE_STAGED_SIZE {
            queues.staged.pop_front();
            if let Some(device) = self.device() {
                device.drops.staged();
            }
        }
        queues.staged.push_back(packet);
    }

    /// Encrypt everything staged under the current keypair, or start a
    /// handshake when there is none that may still send
    pub(crate) fn send_staged_packets(self: &Arc<Self>) {
        let Some(device) = self.device() else {
            return;
        };
        if !device.is_up() || !self.is_running() {
            return;
        }
        let mtu = device.interface.mtu();

        loop {
            let keypair = match self.keypairs.current() {
                Some(keypair) if keypair.can_send() => keypair,
                _ => {
                    if !self.queues.lock().staged.is_empty() {
                        self.spawn_handshake_initiation(false);
                    }
                    return;
                }
            };

            let mut queues = self.queues.lock();
            let Some(outbound) = queues.outbound.clone() else {
                return;
            };
            while let Some(packet) = queues.staged.pop_front() {
                let Some(nonce) = keypair.next_nonce() else {
                    queues.staged.push_front(packet);
                    break;
                };
                enqueue_outbound(&device, &outbound, &keypair, nonce, packet, mtu);
            }
            if queues.staged.is_empty() {
                return;
            }
        }
    }

    /// Flush staged traffic, adding an empty data packet if there is none
    pub fn send_keepalive(self: &Arc<Self>) {
        {
            let mut queues = self.queues.lock();
            if queues.staged.is_empty() && self.is_running() {
                queues.staged.push_back(Vec::new());
            }
        }
        self.send_staged_packets();
    }

    pub(crate) fn spawn_handshake_initiation(self: &Arc<Self>, is_retry: bool) {
        let peer = Arc::clone(self);
        tokio::spawn(async move {
            if peer.is_running() {
                let _ = peer.send_handshake_initiation(is_retry).await;
            }
        });
    }

    /// Send a handshake initiation, at most once per rekey timeout unless
    /// this is a retransmission
    pub(crate) async fn send_handshake_initiation(self: &Arc<Self>, is_retry: bool) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        if !is_retry {
            self.timers.handshake_attempts.store(0, Ordering::Relaxed);
        }
        {
            let mut handshake = self.handshake.write();
            if handshake
                .last_sent_handshake
                .is_some_and(|at| at.elapsed() < REKEY_TIMEOUT)
            {
                return Ok(());
            }
            handshake.last_sent_handshake = Some(Instant::now());
        }

        let device = self.device().ok_or(NetworkError::DeviceDown)?;
        tracing::debug!("{} - Sending handshake initiation", self);

        let msg = device.create_message_initiation(self).map_err(|e| {
            tracing::warn!("{} - Failed to create initiation message: {}", self, e);
            e
        })?;
        let mut packet = msg.to_bytes();
        self.cookie_generator.lock().add_macs(&mut packet);

        self.timers_any_authenticated_packet_traversal();
        self.timers_any_authenticated_packet_sent();

        let sent = self.send_buffer(&packet).await;
        if let Err(e) = &sent {
            tracing::debug!("{} - Failed to send handshake initiation: {}", self, e);
        }
        self.timers_handshake_initiated();
        sent
    }

    /// Answer a consumed initiation and derive the responder's keypair
    pub(crate) async fn send_handshake_response(self: &Arc<Self>) -> Result<()> {
        self.handshake.write().last_sent_handshake = Some(Instant::now());

        let device = self.device().ok_or(NetworkError::DeviceDown)?;
        tracing::debug!("{} - Sending handshake response", self);

        let msg = device.create_message_response(self).map_err(|e| {
            tracing::warn!("{} - Failed to create response message: {}", self, e);
            e
        })?;
        let mut packet = msg.to_bytes();
        self.cookie_generator.lock().add_macs(&mut packet);

        self.begin_symmetric_session().map_err(|e| {
            tracing::warn!("{} - Failed to derive keypair: {}", self, e);
            e
        })?;
        self.timers_session_derived();
        self.timers_any_authenticated_packet_traversal();
        self.timers_any_authenticated_packet_sent();

        self.send_buffer(&packet).await.map_err(|e| {
            tracing::debug!("{} - Failed to send handshake response: {}", self, e);
            e
        })
    }
}

fn enqueue_outbound(
    device: &Device,
    outbound: &mpsc::Sender<OutboundSlot>,
    keypair: &Arc<Keypair>,
    nonce: u64,
    mut packet: Vec<u8>,
    mtu: usize,
) {
    let keepalive = packet.is_empty();
    packet.resize(packet.len() + padding_len(packet.len(), mtu), 0);

    let (done, result) = oneshot::channel();
    let slot = OutboundSlot {
        keypair: Arc::clone(keypair),
        keepalive,
        result,
    };
    if outbound.try_send(slot).is_err() {
        device.drops.encryption();
        return;
    }

    let job = CryptoJob::Seal {
        keypair: Arc::clone(keypair),
        nonce,
        packet,
        done,
    };
    if device.crypto_tx.try_send(job).is_err() {
        device.drops.encryption();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padding_rounds_to_multiple() {
        assert_eq!(padding_len(0, 1420), 0);
        assert_eq!(padding_len(1, 1420), 15);
        assert_eq!(padding_len(16, 1420), 0);
        assert_eq!(padding_len(100, 1420), 12);
    }

    #[test]
    fn test_padding_bounded_by_mtu() {
        assert_eq!(padding_len(1419, 1420), 1);
        assert_eq!(padding_len(1420, 1420), 0);
        // Packets over the MTU only pad their last unit
        assert_eq!(padding_len(1425, 1420), 11);
    }

    #[test]
    fn test_padding_without_mtu() {
        assert_eq!(padding_len(17, 0), 15);
    }

    #[tokio::test]
    async fn test_stopped_peer_sends_no_initiation() {
        use crate::device::DeviceOptions;
        use crate::protocol::StaticIdentity;
        use crate::tunnel::channel::{ChannelInterface, ChannelTransport};
        use std::time::Duration;

        let (transport, mut outbox) = ChannelTransport::new("192.0.2.1:51820".parse().unwrap());
        let (interface, _packets) = ChannelInterface::new(1420);
        let device = Device::new(Arc::new(transport), Arc::new(interface), DeviceOptions::default());
        let own = StaticIdentity::generate();
        device.set_private_key(Some(*own.private_key())).await.unwrap();
        device.up();

        let peer = device
            .new_peer(*StaticIdentity::generate().public_key())
            .unwrap();
        peer.set_endpoint("192.0.2.2:51820".parse().unwrap());

        // Queued just before the peer stops
        peer.spawn_handshake_initiation(false);
        peer.stop().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(outbox.try_recv().is_err());

        peer.send_handshake_initiation(false).await.unwrap();
        assert!(outbox.try_recv().is_err());
    }
}
