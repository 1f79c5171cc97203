//! Edges of the device: the datagram transport and the virtual interface.
//!
//! The device only ever writes through these traits. Inbound traffic is
//! pushed by whoever owns the socket or interface, by calling
//! [`Device::receive`](crate::device::Device::receive) and
//! [`Device::send`](crate::device::Device::send).

pub mod channel;
mod udp;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

pub use udp::UdpTransport;

/// Outbound side of the UDP bind
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, datagram: &[u8], endpoint: SocketAddr) -> io::Result<()>;
}

/// Inbound side of the virtual network interface
#[async_trait]
pub trait TunnelInterface: Send + Sync {
    /// Deliver a decrypted IP packet to the host
    async fn write(&self, packet: &[u8]) -> io::Result<()>;

    fn mtu(&self) -> usize;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, datagram: &[u8], endpoint: SocketAddr) -> io::Result<()> {
        (**self).send(datagram, endpoint).await
    }
}

#[async_trait]
impl<T: TunnelInterface + ?Sized> TunnelInterface for Arc<T> {
    async fn write(&self, packet: &[u8]) -> io::Result<()> {
        (**self).write(packet).await
    }

    fn mtu(&self) -> usize {
        (**self).mtu()
    }
}
