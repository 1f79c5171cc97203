//! The tunnelling device
//!
//! A [`Device`] owns the static identity, the peer set, the allowed-IPs
//! router, the receiver index table and the worker pools. Plaintext enters
//! through [`Device::send`], datagrams through [`Device::receive`]; both
//! leave through the [`Transport`] and [`TunnelInterface`] supplied at
//! construction.

pub mod allowed_ips;
mod handshake;
pub mod index_table;
mod ip;
mod ipc;
mod peer;
mod pipeline;
pub mod rate_limiter;
mod receive;
mod send;
pub mod timers;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::ConfigError;
use crate::protocol::constants::{MAX_PEERS, QUEUE_HANDSHAKE_SIZE, QUEUE_INBOUND_SIZE, QUEUE_OUTBOUND_SIZE};
use crate::protocol::{CookieChecker, StaticIdentity};
use crate::tunnel::{Transport, TunnelInterface};

pub use allowed_ips::AllowedIps;
pub use index_table::{IndexTable, IndexTarget};
pub use peer::{Peer, PeerStats};
pub use rate_limiter::RateLimiter;

use pipeline::CryptoJob;
use receive::HandshakeJob;

/// Tuning knobs fixed at construction
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    /// Encryption/decryption workers, and as many handshake workers
    pub workers: usize,
    /// Bound of the shared encryption/decryption queue
    pub crypto_queue_size: usize,
    /// Bound of the handshake queue; load is judged against it
    pub handshake_queue_size: usize,
    /// Most peers the device will hold
    pub max_peers: usize,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            crypto_queue_size: QUEUE_OUTBOUND_SIZE + QUEUE_INBOUND_SIZE,
            handshake_queue_size: QUEUE_HANDSHAKE_SIZE,
            max_peers: MAX_PEERS,
        }
    }
}

/// Packets dropped for lack of room or authentication
#[derive(Debug, Default)]
pub struct DropCounters {
    staged: AtomicU64,
    encryption: AtomicU64,
    decryption: AtomicU64,
    handshake: AtomicU64,
    replayed: AtomicU64,
    unauthenticated: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DropStats {
    pub staged: u64,
    pub encryption: u64,
    pub decryption: u64,
    pub handshake: u64,
    pub replayed: u64,
    pub unauthenticated: u64,
}

impl DropCounters {
    pub(crate) fn staged(&self) {
        self.staged.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn encryption(&self) {
        self.encryption.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn decryption(&self) {
        self.decryption.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn handshake(&self) {
        self.handshake.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn replayed(&self) {
        self.replayed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn unauthenticated(&self) {
        self.unauthenticated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DropStats {
        DropStats {
            staged: self.staged.load(Ordering::Relaxed),
            encryption: self.encryption.load(Ordering::Relaxed),
            decryption: self.decryption.load(Ordering::Relaxed),
            handshake: self.handshake.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
            unauthenticated: self.unauthenticated.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct NetSettings {
    listen_port: u16,
    fwmark: u32,
}

pub struct Device {
    identity: RwLock<Option<StaticIdentity>>,
    net: Mutex<NetSettings>,
    peers: RwLock<HashMap<[u8; 32], Arc<Peer>>>,
    max_peers: usize,
    pub(crate) index_table: IndexTable<Peer>,
    pub(crate) allowed_ips: AllowedIps<Peer>,
    cookie_checker: Mutex<Option<CookieChecker>>,
    rate_limiter: Arc<RateLimiter>,
    under_load_until: Mutex<Option<Instant>>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) interface: Arc<dyn TunnelInterface>,
    crypto_tx: mpsc::Sender<CryptoJob>,
    handshake_tx: mpsc::Sender<HandshakeJob>,
    pub(crate) drops: DropCounters,
    up: AtomicBool,
    closed: AtomicBool,
    roaming_disabled: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Device {
    /// Create a device in the down state and start its worker pools.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(
        transport: Arc<dyn Transport>,
        interface: Arc<dyn TunnelInterface>,
        options: DeviceOptions,
    ) -> Arc<Self> {
        let workers = options.workers.max(1);
        let (crypto_tx, crypto_rx) = mpsc::channel(options.crypto_queue_size.max(1));
        let (handshake_tx, handshake_rx) = mpsc::channel(options.handshake_queue_size.max(8));

        let device = Arc::new(Self {
            identity: RwLock::new(None),
            net: Mutex::new(NetSettings::default()),
            peers: RwLock::new(HashMap::new()),
            max_peers: options.max_peers,
            index_table: IndexTable::new(),
            allowed_ips: AllowedIps::new(),
            cookie_checker: Mutex::new(None),
            rate_limiter: Arc::new(RateLimiter::new()),
            under_load_until: Mutex::new(None),
            transport,
            interface,
            crypto_tx,
            handshake_tx,
            drops: DropCounters::default(),
            up: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            roaming_disabled: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let crypto_rx = Arc::new(tokio::sync::Mutex::new(crypto_rx));
        let handshake_rx = Arc::new(tokio::sync::Mutex::new(handshake_rx));
        let mut tasks = Vec::with_capacity(workers * 2 + 1);
        for id in 0..workers {
            tasks.push(tokio::spawn(pipeline::routine_crypto_worker(
                id,
                Arc::clone(&crypto_rx),
            )));
            tasks.push(tokio::spawn(receive::routine_handshake(
                id,
                Arc::downgrade(&device),
                Arc::clone(&handshake_rx),
            )));
        }
        tasks.push(device.rate_limiter.spawn_gc());
        *device.tasks.lock() = tasks;

        tracing::info!("Device created with {} workers", workers);
        device
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Bring the device up: start all peers and fire persistent keepalives
    pub fn up(&self) {
        if self.is_closed() || self.up.swap(true, Ordering::AcqRel) {
            return;
        }
        for peer in self.peers() {
            peer.start();
            if peer.persistent_keepalive_interval() > 0 {
                peer.send_keepalive();
            }
        }
        tracing::info!("Interface is up");
    }

    /// Take the device down: stop every peer and zero its keys
    pub async fn down(&self) {
        if !self.up.swap(false, Ordering::AcqRel) {
            return;
        }
        for peer in self.peers() {
            peer.stop().await;
        }
        tracing::info!("Interface is down");
    }

    /// Tear everything down; the device cannot be brought up again
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.down().await;
        self.remove_all_peers().await;

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.rate_limiter.clear();
        tracing::info!("Device closed");
    }

    /// Keep the configured endpoints even when authenticated packets
    /// arrive from elsewhere
    pub fn disable_roaming(&self) {
        self.roaming_disabled.store(true, Ordering::Relaxed);
    }

    pub(crate) fn roaming_disabled(&self) -> bool {
        self.roaming_disabled.load(Ordering::Relaxed)
    }

    pub fn public_key(&self) -> Option<[u8; 32]> {
        self.identity.read().as_ref().map(|id| *id.public_key())
    }

    pub fn listen_port(&self) -> u16 {
        self.net.lock().listen_port
    }

    pub fn fwmark(&self) -> u32 {
        self.net.lock().fwmark
    }

    pub fn drop_stats(&self) -> DropStats {
        self.drops.snapshot()
    }

    /// Install (or with `None`, remove) the static private key.
    ///
    /// A peer whose key equals the new public key is removed; every other
    /// peer gets its static-static secret recomputed and its current
    /// sessions expired.
    pub async fn set_private_key(&self, private_key: Option<[u8; 32]>) -> Result<(), ConfigError> {
        if self.is_closed() {
            return Err(ConfigError::DeviceClosed);
        }
        let identity = private_key.map(StaticIdentity::new);
        let public_key = identity.as_ref().map(|id| *id.public_key());
        if public_key.is_some() && public_key == self.public_key() {
            return Ok(());
        }

        if let Some(public_key) = &public_key {
            self.remove_peer(public_key).await;
        }

        *self.cookie_checker.lock() = public_key.as_ref().map(CookieChecker::new);
        *self.identity.write() = identity.clone();

        for peer in self.peers() {
            let secret = identity
                .as_ref()
                .map(|id| id.static_static(peer.public_key()))
                .unwrap_or([0u8; 32]);
            peer.handshake.write().set_precomputed_static_static(secret);
            peer.expire_current_keypairs();
        }
        Ok(())
    }

    /// Add a peer; it starts immediately if the device is up
    pub fn new_peer(self: &Arc<Self>, public_key: [u8; 32]) -> Result<Arc<Peer>, ConfigError> {
        if self.is_closed() {
            return Err(ConfigError::DeviceClosed);
        }

        let peer = {
            let identity = self.identity.read();
            if identity.as_ref().is_some_and(|id| *id.public_key() == public_key) {
                return Err(ConfigError::PeerIsSelf);
            }
            let secret = identity
                .as_ref()
                .map(|id| id.static_static(&public_key))
                .unwrap_or([0u8; 32]);

            let mut peers = self.peers.write();
            if peers.contains_key(&public_key) {
                return Err(ConfigError::DuplicatePeer);
            }
            if peers.len() >= self.max_peers {
                return Err(ConfigError::TooManyPeers {
                    limit: self.max_peers,
                });
            }
            let peer = Peer::new(self, public_key, secret);
            peers.insert(public_key, Arc::clone(&peer));
            peer
        };

        tracing::debug!("{} - Created", peer);
        if self.is_up() {
            peer.start();
        }
        Ok(peer)
    }

    pub fn lookup_peer(&self, public_key: &[u8; 32]) -> Option<Arc<Peer>> {
        self.peers.read().get(public_key).cloned()
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.read().values().cloned().collect()
    }

    /// Remove a peer, stopping its timers and routines and zeroing its keys
    pub async fn remove_peer(&self, public_key: &[u8; 32]) {
        let Some(peer) = self.peers.write().remove(public_key) else {
            return;
        };
        self.allowed_ips.remove_by_peer(&peer);
        peer.stop().await;
        peer.zero_and_flush_all();
        tracing::debug!("{} - Removed", peer);
    }

    pub async fn remove_all_peers(&self) {
        let peers: Vec<_> = self.peers.write().drain().map(|(_, peer)| peer).collect();
        self.allowed_ips.clear();
        for peer in peers {
            peer.stop().await;
            peer.zero_and_flush_all();
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
