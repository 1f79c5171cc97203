//! Peer state
//!
//! A peer owns its handshake, keypair slots, cookie generator, endpoint,
//! timers and the two ordered queues feeding its sequential sender and
//! receiver tasks. It refers back to the device weakly.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::pipeline::{self, InboundSlot, OutboundSlot};
use super::timers::PeerTimers;
use super::Device;
use crate::error::{NetworkError, Result};
use crate::protocol::constants::{QUEUE_INBOUND_SIZE, QUEUE_OUTBOUND_SIZE};
use crate::protocol::{CookieGenerator, Handshake, Keypair, Keypairs};

/// Staged plaintext and the senders of the per-peer ordered queues.
///
/// The senders exist only while the peer is running.
#[derive(Default)]
pub(crate) struct PeerQueues {
    pub(crate) staged: VecDeque<Vec<u8>>,
    pub(crate) outbound: Option<mpsc::Sender<OutboundSlot>>,
    pub(crate) inbound: Option<mpsc::Sender<InboundSlot>>,
}

/// Snapshot of a peer's counters
#[derive(Debug, Clone, Serialize)]
pub struct PeerStats {
    pub public_key: String,
    pub endpoint: Option<SocketAddr>,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub last_handshake: Option<SystemTime>,
    pub sessions_derived: u64,
    pub persistent_keepalive_interval: u16,
}

pub struct Peer {
    device: Weak<Device>,
    public_key: [u8; 32],
    pub(crate) handshake: RwLock<Handshake>,
    pub(crate) keypairs: Keypairs,
    pub(crate) cookie_generator: Mutex<CookieGenerator>,
    endpoint: RwLock<Option<SocketAddr>>,
    persistent_keepalive_interval: AtomicU32,
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
    pub(crate) last_handshake: Mutex<Option<SystemTime>>,
    sessions_derived: AtomicU64,
    running: AtomicBool,
    pub(crate) timers: PeerTimers,
    pub(crate) queues: Mutex<PeerQueues>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Peer {
    pub(crate) fn new(
        device: &Arc<Device>,
        public_key: [u8; 32],
        precomputed_static_static: [u8; 32],
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            device: Arc::downgrade(device),
            public_key,
            handshake: RwLock::new(Handshake::new(public_key, precomputed_static_static)),
            keypairs: Keypairs::new(),
            cookie_generator: Mutex::new(CookieGenerator::new(&public_key)),
            endpoint: RwLock::new(None),
            persistent_keepalive_interval: AtomicU32::new(0),
            tx_bytes: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            last_handshake: Mutex::new(None),
            sessions_derived: AtomicU64::new(0),
            running: AtomicBool::new(false),
            timers: PeerTimers::new(this),
            queues: Mutex::new(PeerQueues::default()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    pub(crate) fn device(&self) -> Option<Arc<Device>> {
        self.device.upgrade()
    }

    pub fn endpoint(&self) -> Option<SocketAddr> {
        *self.endpoint.read()
    }

    pub fn set_endpoint(&self, endpoint: SocketAddr) {
        *self.endpoint.write() = Some(endpoint);
    }

    /// Learn the endpoint from an authenticated inbound packet
    pub(crate) fn set_endpoint_from_packet(&self, src: SocketAddr) {
        if self.device().is_some_and(|device| device.roaming_disabled()) && self.endpoint().is_some() {
            return;
        }
        let mut endpoint = self.endpoint.write();
        if *endpoint != Some(src) {
            tracing::debug!("{} - Endpoint changed to {}", self, src);
            *endpoint = Some(src);
        }
    }

    /// Seconds between unsolicited keepalives, 0 when off
    pub fn persistent_keepalive_interval(&self) -> u16 {
        self.persistent_keepalive_interval.load(Ordering::Relaxed) as u16
    }

    pub fn set_persistent_keepalive_interval(&self, seconds: u16) {
        self.persistent_keepalive_interval
            .store(u32::from(seconds), Ordering::Relaxed);
    }

    pub fn set_preshared_key(&self, psk: [u8; 32]) {
        self.handshake.write().set_preshared_key(psk);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PeerStats {
        PeerStats {
            public_key: BASE64.encode(self.public_key),
            endpoint: self.endpoint(),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            last_handshake: *self.last_handshake.lock(),
            sessions_derived: self.sessions_derived.load(Ordering::Relaxed),
            persistent_keepalive_interval: self.persistent_keepalive_interval(),
        }
    }

    pub(crate) fn add_rx_bytes(&self, n: usize) {
        self.rx_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Start the sequential sender and receiver.
    ///
    /// No-op unless the device is up.
    pub(crate) fn start(self: &Arc<Self>) {
        let Some(device) = self.device() else {
            return;
        };
        if !device.is_up() || self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("{} - Starting", self);

        self.handshake.write().last_sent_handshake = None;

        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_OUTBOUND_SIZE);
        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_INBOUND_SIZE);
        {
            let mut queues = self.queues.lock();
            queues.outbound = Some(outbound_tx);
            queues.inbound = Some(inbound_tx);
        }

        self.timers_start();

        let weak = Arc::downgrade(self);
        *self.tasks.lock() = vec![
            tokio::spawn(pipeline::routine_sequential_sender(weak.clone(), outbound_rx)),
            tokio::spawn(pipeline::routine_sequential_receiver(weak, inbound_rx)),
        ];
    }

    /// Stop timers and routines, then forget all keys
    pub(crate) async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("{} - Stopping", self);

        self.timers_stop().await;

        let tasks = {
            let mut queues = self.queues.lock();
            queues.outbound = None;
            queues.inbound = None;
            queues.staged.clear();
            std::mem::take(&mut *self.tasks.lock())
        };
        for task in tasks {
            let _ = task.await;
        }

        self.zero_and_flush_all();
    }

    /// Release receiver indices of keypairs that left the slots
    pub(crate) fn release_keypairs(&self, evicted: impl IntoIterator<Item = Arc<Keypair>>) {
        let device = self.device();
        for keypair in evicted {
            if let Some(device) = &device {
                device.index_table.delete(keypair.local_index());
            }
        }
    }

    fn clear_handshake(&self) {
        if let Some(index) = self.handshake.write().clear() {
            if let Some(device) = self.device() {
                device.index_table.delete(index);
            }
        }
    }

    /// Drop every keypair, the handshake and all staged packets
    pub fn zero_and_flush_all(&self) {
        self.release_keypairs(self.keypairs.clear());
        self.clear_handshake();
        self.flush_staged_packets();
    }

    /// Stop sending on the current keys and allow an immediate new initiation
    pub fn expire_current_keypairs(&self) {
        self.clear_handshake();
        self.handshake.write().last_sent_handshake = None;
        self.keypairs.expire_current();
    }

    pub(crate) fn flush_staged_packets(&self) {
        self.queues.lock().staged.clear();
    }

    /// Derive the session keys of a finished handshake and install them
    pub(crate) fn begin_symmetric_session(&self) -> Result<()> {
        let device = self.device().ok_or(NetworkError::DeviceDown)?;
        let secrets = self.handshake.write().derive_session()?;

        let keypair = Arc::new(Keypair::new(
            secrets.send_key,
            secrets.receive_key,
            secrets.is_initiator,
            secrets.local_index,
            secrets.remote_index,
        ));
        device
            .index_table
            .swap_index_for_keypair(secrets.local_index, Arc::clone(&keypair));
        self.release_keypairs(self.keypairs.install(keypair));
        self.sessions_derived.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            "{} - Session derived as {}",
            self,
            if secrets.is_initiator { "initiator" } else { "responder" }
        );
        Ok(())
    }

    /// Write an already-framed message to the peer's endpoint
    pub(crate) async fn send_buffer(&self, data: &[u8]) -> Result<()> {
        let device = self.device().ok_or(NetworkError::DeviceDown)?;
        let endpoint = self.endpoint().ok_or(NetworkError::NoEndpoint)?;
        device
            .transport
            .send(data, endpoint)
            .await
            .map_err(|e| NetworkError::SendFailed {
                reason: e.to_string(),
            })?;
        self.tx_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = BASE64.encode(self.public_key);
        write!(f, "peer({}…{})", &encoded[..4], &encoded[39..43])
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("public_key", &BASE64.encode(self.public_key))
            .field("endpoint", &self.endpoint())
            .field("running", &self.is_running())
            .finish()
    }
}
