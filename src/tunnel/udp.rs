//! UDP transport over a tokio socket

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use super::Transport;
use crate::device::Device;

/// Largest datagram we read: 64 KiB less the IP and UDP headers
const MAX_DATAGRAM: usize = 65_535 - 28;

/// Pause after consecutive receive errors, doubling from 5 ms up to 1 s
#[derive(Debug, Default)]
struct RecvBackoff {
    delay: Duration,
}

impl RecvBackoff {
    const MIN: Duration = Duration::from_millis(5);
    const MAX: Duration = Duration::from_secs(1);

    fn next(&mut self) -> Duration {
        self.delay = (self.delay * 2).clamp(Self::MIN, Self::MAX);
        self.delay
    }

    fn reset(&mut self) {
        self.delay = Duration::ZERO;
    }
}

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        tracing::info!("UDP socket bound to {}", socket.local_addr()?);
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Feed every datagram read from the socket into `device`
    pub fn spawn_receiver(&self, device: Arc<Device>) -> JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            let mut backoff = RecvBackoff::default();
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, from)) => {
                        backoff.reset();
                        device.receive(&buf[..n], from);
                    }
                    Err(e) => {
                        if device.is_closed() {
                            break;
                        }
                        let delay = backoff.next();
                        tracing::error!("UDP recv error: {}, retrying in {:?}", e, delay);
                        tokio::time::sleep(delay).await;
                    }
                }
                if device.is_closed() {
                    break;
                }
            }
        })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, datagram: &[u8], endpoint: SocketAddr) -> io::Result<()> {
        self.socket.send_to(datagram, endpoint).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recv_backoff_doubles_to_cap() {
        let mut backoff = RecvBackoff::default();
        assert_eq!(backoff.next(), Duration::from_millis(5));
        assert_eq!(backoff.next(), Duration::from_millis(10));
        assert_eq!(backoff.next(), Duration::from_millis(20));
        for _ in 0..20 {
            backoff.next();
        }
        assert_eq!(backoff.next(), Duration::from_secs(1));

        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_send_reaches_socket() {
        let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        transport
            .send(b"ping", sink.local_addr().unwrap())
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = sink.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, transport.local_addr().unwrap());
    }
}
