//! Minimal IP header inspection for routing tunnelled packets

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;

fn version(packet: &[u8]) -> Option<u8> {
    packet.first().map(|b| b >> 4)
}

fn v4(bytes: &[u8]) -> IpAddr {
    let mut octets = [0u8; 4];
    octets.copy_from_slice(bytes);
    IpAddr::V4(Ipv4Addr::from(octets))
}

fn v6(bytes: &[u8]) -> IpAddr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(bytes);
    IpAddr::V6(Ipv6Addr::from(octets))
}

/// Destination address of an outbound packet
pub(crate) fn destination(packet: &[u8]) -> Option<IpAddr> {
    match version(packet)? {
        4 if packet.len() >= IPV4_HEADER_LEN => Some(v4(&packet[16..20])),
        6 if packet.len() >= IPV6_HEADER_LEN => Some(v6(&packet[24..40])),
        _ => None,
    }
}

/// Source address and total length claimed by an inbound packet's header.
///
/// `None` when the header is truncated or the claimed length exceeds the
/// buffer; the caller trims padding to the returned length.
pub(crate) fn source_and_length(packet: &[u8]) -> Option<(IpAddr, usize)> {
    let (source, length) = match version(packet)? {
        4 if packet.len() >= IPV4_HEADER_LEN => {
            let length = usize::from(u16::from_be_bytes([packet[2], packet[3]]));
            (v4(&packet[12..16]), length)
        }
        6 if packet.len() >= IPV6_HEADER_LEN => {
            let payload = usize::from(u16::from_be_bytes([packet[4], packet[5]]));
            (v6(&packet[8..24]), payload + IPV6_HEADER_LEN)
        }
        _ => return None,
    };

    if length > packet.len() || length < IPV4_HEADER_LEN {
        return None;
    }
    Some((source, length))
}
