//! Two devices talking over the in-memory transport

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use warpguard::device::{Device, DeviceOptions};
use warpguard::protocol::{HandshakeInitiation, HandshakeResponse, MessageType, StaticIdentity};
use warpguard::tunnel::channel::{self, ChannelInterface, ChannelTransport, Datagram};

struct Node {
    device: Arc<Device>,
    identity: StaticIdentity,
    addr: SocketAddr,
    tunnel_ip: [u8; 4],
    outbox: Option<UnboundedReceiver<Datagram>>,
    packets: UnboundedReceiver<Vec<u8>>,
}

impl Node {
    fn new(addr: &str, tunnel_ip: [u8; 4]) -> Self {
        let addr: SocketAddr = addr.parse().unwrap();
        let (transport, outbox) = ChannelTransport::new(addr);
        let (interface, packets) = ChannelInterface::new(1420);
        let device = Device::new(
            Arc::new(transport),
            Arc::new(interface),
            DeviceOptions {
                workers: 2,
                ..DeviceOptions::default()
            },
        );
        Self {
            device,
            identity: StaticIdentity::generate(),
            addr,
            tunnel_ip,
            outbox: Some(outbox),
            packets,
        }
    }

    fn outbox(&mut self) -> &mut UnboundedReceiver<Datagram> {
        self.outbox.as_mut().expect("outbox already linked")
    }

    fn public_hex(&self) -> String {
        hex::encode(self.identity.public_key())
    }

    /// Configure our key and `other` as a peer routing its tunnel address
    async fn trust(&self, other: &Node) {
        let [a, b, c, d] = other.tunnel_ip;
        let input = format!(
            "private_key={}\npublic_key={}\nendpoint={}\nallowed_ip={}.{}.{}.{}/32\n",
            hex::encode(self.identity.private_key()),
            other.public_hex(),
            other.addr,
            a,
            b,
            c,
            d
        );
        self.device.ipc_set(&input).await.unwrap();
    }

    fn packet_to(&self, other: &Node, payload: &[u8]) -> Vec<u8> {
        ipv4_packet(self.tunnel_ip, other.tunnel_ip, payload)
    }

    fn sessions_with(&self, other: &Node) -> u64 {
        self.device
            .lookup_peer(other.identity.public_key())
            .unwrap()
            .stats()
            .sessions_derived
    }
}

fn ipv4_packet(src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let total = 20 + payload.len();
    let mut packet = vec![0u8; 20];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    packet[8] = 64;
    packet[9] = 17;
    packet[12..16].copy_from_slice(&src);
    packet[16..20].copy_from_slice(&dst);
    packet.extend_from_slice(payload);
    packet
}

async fn recv<T>(rx: &mut UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed")
}

/// Two configured devices, both up, with their transports cross-linked
async fn linked_pair() -> (Node, Node) {
    let mut a = Node::new("192.0.2.1:51820", [10, 0, 0, 1]);
    let mut b = Node::new("192.0.2.2:51820", [10, 0, 0, 2]);
    a.trust(&b).await;
    b.trust(&a).await;
    a.device.up();
    b.device.up();

    channel::link(a.outbox.take().unwrap(), Arc::clone(&b.device));
    channel::link(b.outbox.take().unwrap(), Arc::clone(&a.device));
    (a, b)
}

#[tokio::test]
async fn test_ping_both_ways() {
    let (mut a, mut b) = linked_pair().await;

    let ping = a.packet_to(&b, b"ping");
    a.device.send(&ping).unwrap();
    assert_eq!(recv(&mut b.packets).await, ping);

    let pong = b.packet_to(&a, b"pong");
    b.device.send(&pong).unwrap();
    assert_eq!(recv(&mut a.packets).await, pong);

    assert_eq!(a.sessions_with(&b), 1);
    assert_eq!(b.sessions_with(&a), 1);

    let stats = a.device.lookup_peer(b.identity.public_key()).unwrap().stats();
    assert!(stats.tx_bytes > 0);
    assert!(stats.rx_bytes > 0);
    assert!(stats.last_handshake.is_some());
    assert_eq!(stats.endpoint, Some(b.addr));
}

#[tokio::test]
async fn test_packets_arrive_in_order() {
    let (a, mut b) = linked_pair().await;

    let hello = a.packet_to(&b, b"hello");
    a.device.send(&hello).unwrap();
    assert_eq!(recv(&mut b.packets).await, hello);

    let packets: Vec<_> = (0..200u32)
        .map(|i| a.packet_to(&b, &i.to_be_bytes()))
        .collect();
    for packet in &packets {
        a.device.send(packet).unwrap();
    }
    for packet in &packets {
        assert_eq!(&recv(&mut b.packets).await, packet);
    }
}

#[tokio::test]
async fn test_replayed_initiation_yields_one_session() {
    let mut a = Node::new("192.0.2.1:51820", [10, 0, 0, 1]);
    let mut b = Node::new("192.0.2.2:51820", [10, 0, 0, 2]);
    a.trust(&b).await;
    b.trust(&a).await;
    a.device.up();
    b.device.up();

    a.device.send(&a.packet_to(&b, b"hello")).unwrap();
    let initiation = recv(a.outbox()).await;
    assert_eq!(initiation.data.len(), HandshakeInitiation::SIZE);

    b.device.receive(&initiation.data, a.addr);
    let response = recv(b.outbox()).await;
    assert_eq!(response.data.len(), HandshakeResponse::SIZE);

    b.device.receive(&initiation.data, a.addr);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(b.outbox().try_recv().is_err());
    assert_eq!(b.sessions_with(&a), 1);
}

#[tokio::test]
async fn test_duplicate_response_is_ignored() {
    let mut a = Node::new("192.0.2.1:51820", [10, 0, 0, 1]);
    let mut b = Node::new("192.0.2.2:51820", [10, 0, 0, 2]);
    a.trust(&b).await;
    b.trust(&a).await;
    a.device.up();
    b.device.up();

    a.device.send(&a.packet_to(&b, b"hello")).unwrap();
    let initiation = recv(a.outbox()).await;
    b.device.receive(&initiation.data, a.addr);
    let response = recv(b.outbox()).await;

    a.device.receive(&response.data, b.addr);
    let data = recv(a.outbox()).await;
    assert_eq!(data.data[0], MessageType::TransportData as u8);

    a.device.receive(&response.data, b.addr);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(a.sessions_with(&b), 1);
}

#[tokio::test]
async fn test_source_address_must_be_allowed() {
    let (a, mut b) = linked_pair().await;

    let spoofed = ipv4_packet([10, 0, 0, 99], b.tunnel_ip, b"spoofed");
    a.device.send(&spoofed).unwrap();
    let genuine = a.packet_to(&b, b"genuine");
    a.device.send(&genuine).unwrap();

    assert_eq!(recv(&mut b.packets).await, genuine);
    assert_eq!(b.device.drop_stats().unauthenticated, 1);
}

#[tokio::test]
async fn test_unroutable_destination_is_rejected() {
    let (a, _b) = linked_pair().await;
    let packet = ipv4_packet(a.tunnel_ip, [172, 16, 0, 1], b"nowhere");
    assert!(a.device.send(&packet).is_err());
}

#[tokio::test]
async fn test_expired_keypair_triggers_new_session() {
    let (mut a, mut b) = linked_pair().await;

    let first = a.packet_to(&b, b"first");
    a.device.send(&first).unwrap();
    assert_eq!(recv(&mut b.packets).await, first);

    a.device
        .lookup_peer(b.identity.public_key())
        .unwrap()
        .expire_current_keypairs();
    // Stay clear of the responder's initiation flood guard
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = a.packet_to(&b, b"second");
    a.device.send(&second).unwrap();
    assert_eq!(recv(&mut b.packets).await, second);
    assert_eq!(a.sessions_with(&b), 2);

    // The responder still accepts its side's traffic after rotation
    let reply = b.packet_to(&a, b"reply");
    b.device.send(&reply).unwrap();
    assert_eq!(recv(&mut a.packets).await, reply);
}

#[tokio::test]
async fn test_down_then_up_rehandshakes() {
    let (mut a, mut b) = linked_pair().await;

    let first = a.packet_to(&b, b"first");
    a.device.send(&first).unwrap();
    assert_eq!(recv(&mut b.packets).await, first);

    a.device.down().await;
    assert!(a.device.send(&first).is_err());
    a.device.up();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = a.packet_to(&b, b"second");
    a.device.send(&second).unwrap();
    assert_eq!(recv(&mut b.packets).await, second);
    assert_eq!(a.sessions_with(&b), 2);
}

#[tokio::test]
async fn test_staged_queue_drops_oldest() {
    let mut a = Node::new("192.0.2.1:51820", [10, 0, 0, 1]);
    let b = Node::new("192.0.2.2:51820", [10, 0, 0, 2]);
    a.trust(&b).await;
    a.device.up();

    for i in 0..130u32 {
        a.device.send(&a.packet_to(&b, &i.to_be_bytes())).unwrap();
    }
    assert_eq!(a.device.drop_stats().staged, 2);
    // Only one initiation despite 130 packets
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(recv(a.outbox()).await.data.len(), HandshakeInitiation::SIZE);
    assert!(a.outbox().try_recv().is_err());
}

#[tokio::test]
async fn test_roaming_updates_endpoint_unless_disabled() {
    let mut a = Node::new("192.0.2.1:51820", [10, 0, 0, 1]);
    let mut b = Node::new("192.0.2.2:51820", [10, 0, 0, 2]);
    a.trust(&b).await;
    b.trust(&a).await;
    a.device.up();
    b.device.up();
    channel::link(b.outbox.take().unwrap(), Arc::clone(&a.device));

    // Everything from A reaches B from a NATed address
    let roamed: SocketAddr = "198.51.100.7:40000".parse().unwrap();
    let mut outbox = a.outbox.take().unwrap();
    let device_b = Arc::clone(&b.device);
    tokio::spawn(async move {
        while let Some(datagram) = outbox.recv().await {
            device_b.receive(&datagram.data, roamed);
        }
    });

    let ping = a.packet_to(&b, b"ping");
    a.device.send(&ping).unwrap();
    assert_eq!(recv(&mut b.packets).await, ping);
    let peer_a = b.device.lookup_peer(a.identity.public_key()).unwrap();
    assert_eq!(peer_a.endpoint(), Some(roamed));

    // With roaming disabled a configured endpoint sticks
    peer_a.set_endpoint(a.addr);
    b.device.disable_roaming();
    a.device.send(&ping).unwrap();
    assert_eq!(recv(&mut b.packets).await, ping);
    assert_eq!(peer_a.endpoint(), Some(a.addr));
}

#[tokio::test]
async fn test_ipc_get_reports_traffic() {
    let (mut a, mut b) = linked_pair().await;
    let ping = a.packet_to(&b, b"ping");
    a.device.send(&ping).unwrap();
    recv(&mut b.packets).await;

    let output = a.device.ipc_get();
    assert!(output.contains(&format!("public_key={}\n", b.public_hex())));
    assert!(output.contains(&format!("endpoint={}\n", b.addr)));
    assert!(!output.contains("last_handshake_time_sec=0\n"));
    assert!(!output.contains("tx_bytes=0\n"));
    assert!(output.contains("allowed_ip=10.0.0.2/32\n"));
}

#[tokio::test]
async fn test_close_stops_everything() {
    let (mut a, mut b) = linked_pair().await;
    let ping = a.packet_to(&b, b"ping");
    a.device.send(&ping).unwrap();
    recv(&mut b.packets).await;

    a.device.close().await;
    assert!(a.device.is_closed());
    assert!(a.device.peers().is_empty());
    assert!(a.device.send(&ping).is_err());
    assert!(a.device.ipc_set("listen_port=1\n").await.is_err());

    // B can no longer reach A
    b.device.send(&b.packet_to(&a, b"late")).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(a.packets.try_recv().is_err());
}

/// Pass the next datagram from `from` to `to`, returning it
async fn forward(from: &mut Node, to: &Node) -> Datagram {
    let datagram = recv(from.outbox()).await;
    to.device.receive(&datagram.data, from.addr);
    datagram
}

fn receiver_index(datagram: &Datagram) -> u32 {
    u32::from_le_bytes(datagram.data[4..8].try_into().unwrap())
}

#[tokio::test]
async fn test_previous_keypair_decrypts_delayed_packet() {
    let mut a = Node::new("192.0.2.1:51820", [10, 0, 0, 1]);
    let mut b = Node::new("192.0.2.2:51820", [10, 0, 0, 2]);
    a.trust(&b).await;
    b.trust(&a).await;
    a.device.up();
    b.device.up();
    channel::link(b.outbox.take().unwrap(), Arc::clone(&a.device));

    let hello = a.packet_to(&b, b"hello");
    a.device.send(&hello).unwrap();
    assert_eq!(forward(&mut a, &b).await.data.len(), HandshakeInitiation::SIZE);
    forward(&mut a, &b).await;
    assert_eq!(recv(&mut b.packets).await, hello);

    // Sealed under the first session but held back
    let delayed = a.packet_to(&b, b"delayed");
    a.device.send(&delayed).unwrap();
    let held = recv(a.outbox()).await;
    assert_eq!(held.data[0], MessageType::TransportData as u8);

    a.device
        .lookup_peer(b.identity.public_key())
        .unwrap()
        .expire_current_keypairs();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let fresh = a.packet_to(&b, b"fresh");
    a.device.send(&fresh).unwrap();
    assert_eq!(forward(&mut a, &b).await.data.len(), HandshakeInitiation::SIZE);
    let rotated = forward(&mut a, &b).await;
    assert_eq!(rotated.data[0], MessageType::TransportData as u8);
    assert_ne!(receiver_index(&rotated), receiver_index(&held));
    assert_eq!(recv(&mut b.packets).await, fresh);
    assert_eq!(b.sessions_with(&a), 2);

    b.device.receive(&held.data, a.addr);
    assert_eq!(recv(&mut b.packets).await, delayed);
}
