//! Inbound path: datagram classification, the handshake workers and
//! dispatch of transport data to the decryption pool

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;

use super::index_table::IndexTarget;
use super::pipeline::{CryptoJob, InboundSlot};
use super::Device;
use crate::protocol::constants::UNDER_LOAD_AFTER_TIME;
use crate::protocol::messages::{self, sender_index};
use crate::protocol::{
    CookieReply, HandshakeInitiation, HandshakeResponse, Keypair, MessageType, TransportHeader,
};

pub(crate) struct HandshakeJob {
    msg_type: MessageType,
    packet: Vec<u8>,
    src: SocketAddr,
}

/// Outcome of the MAC and load checks on a handshake message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Accept,
    Reject,
    SendCookie,
}

impl Device {
    /// Accept one datagram from the transport
    pub fn receive(&self, datagram: &[u8], src: SocketAddr) {
        if !self.is_up() {
            return;
        }
        let msg_type = match messages::classify(datagram) {
            Ok(msg_type) => msg_type,
            Err(e) => {
                self.drops.unauthenticated();
                tracing::trace!("Dropping datagram from {}: {}", src, e);
                return;
            }
        };

        if msg_type == MessageType::TransportData {
            self.receive_transport(datagram, src);
            return;
        }

        let job = HandshakeJob {
            msg_type,
            packet: datagram.to_vec(),
            src,
        };
        if self.handshake_tx.try_send(job).is_err() {
            self.drops.handshake();
            tracing::trace!("Dropping handshake packet from {}: queue full", src);
        }
    }

    fn receive_transport(&self, datagram: &[u8], src: SocketAddr) {
        let Ok(header) = TransportHeader::from_bytes(datagram) else {
            return;
        };
        let Some((peer, IndexTarget::Keypair(keypair))) = self.index_table.lookup(header.receiver_index) else {
            tracing::trace!("Dropping data packet with unknown index {}", header.receiver_index);
            return;
        };
        if keypair.is_expired() {
            tracing::trace!("{} - Dropping data packet on expired keypair", peer);
            return;
        }

        let queues = peer.queues.lock();
        let Some(inbound) = queues.inbound.as_ref() else {
            return;
        };
        self.enqueue_inbound(inbound, keypair, header.counter, datagram.to_vec(), src);
    }

    fn enqueue_inbound(
        &self,
        inbound: &mpsc::Sender<InboundSlot>,
        keypair: Arc<Keypair>,
        counter: u64,
        datagram: Vec<u8>,
        src: SocketAddr,
    ) {
        let (done, result) = oneshot::channel();
        let slot = InboundSlot {
            keypair: Arc::clone(&keypair),
            counter,
            src,
            len: datagram.len(),
            result,
        };
        if inbound.try_send(slot).is_err() {
            self.drops.decryption();
            return;
        }

        let job = CryptoJob::Open {
            keypair,
            counter,
            datagram,
            done,
        };
        if self.crypto_tx.try_send(job).is_err() {
            self.drops.decryption();
        }
    }

    /// Handshake queue at least 1/8 full now or within the last second
    pub(crate) fn is_under_load(&self) -> bool {
        let queued = self.handshake_tx.max_capacity() - self.handshake_tx.capacity();
        let now = Instant::now();
        if queued >= self.handshake_tx.max_capacity() / 8 {
            *self.under_load_until.lock() = Some(now + UNDER_LOAD_AFTER_TIME);
            return true;
        }
        self.under_load_until.lock().is_some_and(|until| until > now)
    }

    fn admit_handshake(&self, packet: &[u8], src: &SocketAddr) -> Admission {
        let checker = self.cookie_checker.lock();
        let Some(checker) = checker.as_ref() else {
            return Admission::Reject;
        };
        if !checker.check_mac1(packet) {
            tracing::trace!("Received handshake message with invalid mac1 from {}", src);
            return Admission::Reject;
        }

        if self.is_under_load() {
            if !checker.check_mac2(packet, src) {
                return Admission::SendCookie;
            }
            if !self.rate_limiter.allow(src.ip()) {
                return Admission::Reject;
            }
        }
        Admission::Accept
    }

    async fn send_cookie_reply(&self, packet: &[u8], src: SocketAddr) {
        let Some(receiver) = sender_index(packet) else {
            return;
        };
        let reply = match self.cookie_checker.lock().as_mut() {
            Some(checker) => checker.create_reply(packet, receiver, &src),
            None => None,
        };
        let Some(reply) = reply else {
            tracing::debug!("Failed to create cookie reply for {}", src);
            return;
        };

        tracing::debug!("Sending cookie reply to {}", src);
        if let Err(e) = self.transport.send(&reply.to_bytes(), src).await {
            tracing::debug!("Failed to send cookie reply to {}: {}", src, e);
        }
    }

    async fn handle_handshake(&self, job: HandshakeJob) {
        if job.msg_type == MessageType::CookieReply {
            self.handle_cookie_reply(&job.packet);
            return;
        }

        match self.admit_handshake(&job.packet, &job.src) {
            Admission::Accept => {}
            Admission::Reject => return,
            Admission::SendCookie => {
                self.send_cookie_reply(&job.packet, job.src).await;
                return;
            }
        }

        match job.msg_type {
            MessageType::HandshakeInitiation => self.handle_initiation(&job.packet, job.src).await,
            MessageType::HandshakeResponse => self.handle_response(&job.packet, job.src),
            _ => {}
        }
    }

    fn handle_cookie_reply(&self, packet: &[u8]) {
        let Ok(reply) = CookieReply::from_bytes(packet) else {
            return;
        };
        let Some((peer, _)) = self.index_table.lookup(reply.receiver_index) else {
            return;
        };
        if !peer.is_running() {
            return;
        }
        if !peer.cookie_generator.lock().consume_reply(&reply) {
            tracing::debug!("{} - Could not decrypt invalid cookie reply", peer);
        }
    }

    async fn handle_initiation(&self, packet: &[u8], src: SocketAddr) {
        let Ok(msg) = HandshakeInitiation::from_bytes(packet) else {
            return;
        };
        let peer = match self.consume_message_initiation(&msg) {
            Ok(peer) => peer,
            Err(e) => {
                tracing::debug!("Received invalid initiation message from {}: {}", src, e);
                return;
            }
        };
        if !peer.is_running() {
            return;
        }
        tracing::debug!("{} - Received handshake initiation", peer);

        peer.set_endpoint_from_packet(src);
        peer.timers_any_authenticated_packet_traversal();
        peer.timers_any_authenticated_packet_received();

        let _ = peer.send_handshake_response().await;
    }

    fn handle_response(&self, packet: &[u8], src: SocketAddr) {
        let Ok(msg) = HandshakeResponse::from_bytes(packet) else {
            return;
        };
        let peer = match self.consume_message_response(&msg) {
            Ok(peer) => peer,
            Err(e) => {
                tracing::debug!("Received invalid response message from {}: {}", src, e);
                return;
            }
        };
        if !peer.is_running() {
            return;
        }
        tracing::debug!("{} - Received handshake response", peer);

        peer.set_endpoint_from_packet(src);
        peer.timers_any_authenticated_packet_traversal();
        peer.timers_any_authenticated_packet_received();

        if let Err(e) = peer.begin_symmetric_session() {
            tracing::warn!("{} - Failed to derive keypair: {}", peer, e);
            return;
        }
        peer.timers_session_derived();
        peer.timers_handshake_complete();
        peer.send_keepalive();
    }
}

pub(crate) async fn routine_handshake(
    id: usize,
    device: Weak<Device>,
    jobs: Arc<Mutex<mpsc::Receiver<HandshakeJob>>>,
) {
    tracing::trace!("Handshake worker {} started", id);
    loop {
        let job = jobs.lock().await.recv().await;
        let Some(job) = job else {
            break;
        };
        let Some(device) = device.upgrade() else {
            break;
        };
        device.handle_handshake(job).await;
    }
    tracing::trace!("Handshake worker {} stopped", id);
}
