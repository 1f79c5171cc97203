//! In-memory transport and interface.
//!
//! Datagrams and packets are handed out on unbounded channels, so tests
//! (or an embedding program) can inspect them, drop them, reorder them or
//! wire two devices together with [`link`].

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{Transport, TunnelInterface};
use crate::device::Device;

/// A datagram as written by a [`ChannelTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub data: Vec<u8>,
}

pub struct ChannelTransport {
    local: SocketAddr,
    outbox: mpsc::UnboundedSender<Datagram>,
}

impl ChannelTransport {
    /// Transport bound to `local`; written datagrams come out of the receiver
    pub fn new(local: SocketAddr) -> (Self, mpsc::UnboundedReceiver<Datagram>) {
        let (outbox, rx) = mpsc::unbounded_channel();
        (Self { local, outbox }, rx)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, datagram: &[u8], endpoint: SocketAddr) -> io::Result<()> {
        self.outbox
            .send(Datagram {
                from: self.local,
                to: endpoint,
                data: datagram.to_vec(),
            })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "transport closed"))
    }
}

pub struct ChannelInterface {
    mtu: usize,
    delivered: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelInterface {
    /// Interface whose delivered packets come out of the receiver
    pub fn new(mtu: usize) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (delivered, rx) = mpsc::unbounded_channel();
        (Self { mtu, delivered }, rx)
    }
}

#[async_trait]
impl TunnelInterface for ChannelInterface {
    async fn write(&self, packet: &[u8]) -> io::Result<()> {
        self.delivered
            .send(packet.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "interface closed"))
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

/// Deliver every datagram from `outbox` to `device`, tagged with its sender
pub fn link(mut outbox: mpsc::UnboundedReceiver<Datagram>, device: Arc<Device>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(datagram) = outbox.recv().await {
            device.receive(&datagram.data, datagram.from);
        }
    })
}
