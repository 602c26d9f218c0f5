//! ICMP error correlation for UDP associations
//!
//! The server observes ICMP traffic out of band. Destination Unreachable,
//! Time Exceeded and Packet Too Big messages embed the IP header of the
//! offending datagram; when that datagram was UDP and left through one of
//! our associations, the error is translated to a SOCKS 6 UDP error message
//! for the client.

use crate::message::{SocksAddr, UdpErrorType};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Protocol number for UDP in the embedded IP header
const IP_PROTO_UDP: u8 = 17;

// ICMPv4 types
const ICMP4_DEST_UNREACHABLE: u8 = 3;
const ICMP4_TIME_EXCEEDED: u8 = 11;

// ICMPv6 types
const ICMP6_DEST_UNREACHABLE: u8 = 1;
const ICMP6_PACKET_TOO_BIG: u8 = 2;
const ICMP6_TIME_EXCEEDED: u8 = 3;

/// A fully decoded, UDP-relevant ICMP error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpFeedback {
    /// Mapped SOCKS 6 error class
    pub code: UdpErrorType,
    /// Node that reported the error
    pub reporter: SocksAddr,
    /// Source of the offending datagram (an association's local address)
    pub source: SocketAddr,
    /// Destination of the offending datagram
    pub destination: SocketAddr,
}

/// Decode an ICMP packet into association feedback.
///
/// Returns `None` for anything that does not map: unknown types and codes,
/// truncated packets, or an embedded datagram that was not UDP.
pub fn parse_icmp_feedback(packet: &[u8], reporter_ip: IpAddr, version: u8) -> Option<IcmpFeedback> {
    let (code, embedded) = convert_icmp_error(packet, version)?;
    let (source, destination, proto) = parse_src_dst_from_ip_header(embedded, version)?;
    if proto != IP_PROTO_UDP {
        return None;
    }
    Some(IcmpFeedback {
        code,
        reporter: SocksAddr::from(reporter_ip),
        source,
        destination,
    })
}

/// Map ICMP type/code to a [`UdpErrorType`] and return the embedded bytes
fn convert_icmp_error(packet: &[u8], version: u8) -> Option<(UdpErrorType, &[u8])> {
    if packet.len() < 8 {
        return None;
    }
    let icmp_type = packet[0];
    let icmp_code = packet[1];
    let embedded = &packet[8..];

    let code = match version {
        4 => match (icmp_type, icmp_code) {
            (ICMP4_DEST_UNREACHABLE, 0) => UdpErrorType::NetworkUnreachable,
            (ICMP4_DEST_UNREACHABLE, 1) => UdpErrorType::HostUnreachable,
            (ICMP4_TIME_EXCEEDED, 0) => UdpErrorType::TtlExpired,
            _ => return None,
        },
        6 => match (icmp_type, icmp_code) {
            (ICMP6_DEST_UNREACHABLE, 0) => UdpErrorType::NetworkUnreachable,
            (ICMP6_DEST_UNREACHABLE, 3) => UdpErrorType::HostUnreachable,
            (ICMP6_TIME_EXCEEDED, 0) => UdpErrorType::TtlExpired,
            (ICMP6_PACKET_TOO_BIG, _) => UdpErrorType::DatagramTooBig,
            _ => return None,
        },
        _ => return None,
    };
    Some((code, embedded))
}

/// Extract source, destination and protocol from an embedded IP header.
///
/// The embedded payload must also cover the first 4 bytes of the transport
/// header, which carry both ports. IPv6 extension headers are not chased.
fn parse_src_dst_from_ip_header(hdr: &[u8], version: u8) -> Option<(SocketAddr, SocketAddr, u8)> {
    match version {
        4 => {
            if hdr.len() < 20 {
                return None;
            }
            let ihl = ((hdr[0] & 0x0F) as usize) * 4;
            if ihl < 20 || hdr.len() < ihl + 4 {
                return None;
            }
            let proto = hdr[9];
            let src_ip = Ipv4Addr::new(hdr[12], hdr[13], hdr[14], hdr[15]);
            let dst_ip = Ipv4Addr::new(hdr[16], hdr[17], hdr[18], hdr[19]);
            let src_port = u16::from_be_bytes([hdr[ihl], hdr[ihl + 1]]);
            let dst_port = u16::from_be_bytes([hdr[ihl + 2], hdr[ihl + 3]]);
            Some((
                SocketAddr::new(IpAddr::V4(src_ip), src_port),
                SocketAddr::new(IpAddr::V4(dst_ip), dst_port),
                proto,
            ))
        }
        6 => {
            if hdr.len() < 44 {
                return None;
            }
            let proto = hdr[6];
            let src_ip = Ipv6Addr::from(<[u8; 16]>::try_from(&hdr[8..24]).ok()?);
            let dst_ip = Ipv6Addr::from(<[u8; 16]>::try_from(&hdr[24..40]).ok()?);
            let src_port = u16::from_be_bytes([hdr[40], hdr[41]]);
            let dst_port = u16::from_be_bytes([hdr[42], hdr[43]]);
            Some((
                SocketAddr::new(IpAddr::V6(src_ip), src_port),
                SocketAddr::new(IpAddr::V6(dst_ip), dst_port),
                proto,
            ))
        }
        _ => None,
    }
}

#[cfg(test)]
pub(crate) fn build_icmp4_packet(
    icmp_type: u8,
    icmp_code: u8,
    src: SocketAddr,
    dst: SocketAddr,
    proto: u8,
) -> Vec<u8> {
    let (IpAddr::V4(src_ip), IpAddr::V4(dst_ip)) = (src.ip(), dst.ip()) else {
        panic!("ipv4 addresses required");
    };
    let mut packet = vec![icmp_type, icmp_code, 0, 0, 0, 0, 0, 0];
    // embedded IPv4 header, IHL = 5
    let mut ip = vec![0x45, 0, 0, 28, 0, 0, 0, 0, 64, proto, 0, 0];
    ip.extend_from_slice(&src_ip.octets());
    ip.extend_from_slice(&dst_ip.octets());
    // first 4 bytes of the UDP header
    ip.extend_from_slice(&src.port().to_be_bytes());
    ip.extend_from_slice(&dst.port().to_be_bytes());
    packet.extend_from_slice(&ip);
    packet
}
