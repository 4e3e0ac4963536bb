//! Packet dissection
//!
//! Turns raw IP bytes into addressed flow events, and builds the UDP reply
//! packets written back toward the virtual interface.
//!
//! TCP segments are surrogates: each one carries the observed flags and
//! sequence numbers of a single packet. No reassembly happens here.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::Bytes;

use crate::common::EndpointId;
use crate::error::PacketError;

pub const IPV4_HEADER_LEN: usize = 20;
pub const IPV6_HEADER_LEN: usize = 40;
pub const TCP_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

pub const PROTOCOL_ICMP: u8 = 1;
pub const PROTOCOL_TCP: u8 = 6;
pub const PROTOCOL_UDP: u8 = 17;

const TCP_FIN: u8 = 0x01;
const TCP_SYN: u8 = 0x02;
const TCP_RST: u8 = 0x04;

const DEFAULT_TTL: u8 = 64;

/// Connection-intent flags observed on a TCP segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags {
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
}

impl TcpFlags {
    fn from_byte(flags: u8) -> Self {
        Self {
            syn: flags & TCP_SYN != 0,
            fin: flags & TCP_FIN != 0,
            rst: flags & TCP_RST != 0,
        }
    }
}

/// Per-packet TCP surrogate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    pub id: EndpointId,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
}

/// One captured UDP datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub id: EndpointId,
    pub payload: Bytes,
}

/// Classification result for one packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Tcp(TcpSegment),
    Udp(UdpDatagram),
    /// Accepted, not acted on
    Icmp,
}

/// Classify a raw IP packet
///
/// Returns `Ok(None)` for transports the stack ignores and for packets
/// without a transport payload.
pub fn parse(packet: &[u8]) -> Result<Option<Packet>, PacketError> {
    if packet.len() < IPV4_HEADER_LEN {
        return Err(PacketError::TooShort);
    }

    match packet[0] >> 4 {
        4 => parse_ipv4(packet),
        6 => parse_ipv6(packet),
        version => Err(PacketError::UnsupportedVersion(version)),
    }
}

fn parse_ipv4(packet: &[u8]) -> Result<Option<Packet>, PacketError> {
    let ihl = (packet[0] & 0x0F) as usize * 4;
    if ihl < IPV4_HEADER_LEN || packet.len() < ihl {
        return Err(PacketError::InvalidHeaderLength);
    }

    let protocol = packet[9];
    let src = IpAddr::V4(Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]));
    let dst = IpAddr::V4(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]));

    parse_transport(protocol, &packet[ihl..], src, dst)
}

fn parse_ipv6(packet: &[u8]) -> Result<Option<Packet>, PacketError> {
    if packet.len() < IPV6_HEADER_LEN {
        return Err(PacketError::Ipv6TooShort);
    }

    let next_header = packet[6];
    let src = IpAddr::V6(Ipv6Addr::from(read_array::<16>(&packet[8..24])));
    let dst = IpAddr::V6(Ipv6Addr::from(read_array::<16>(&packet[24..40])));

    parse_transport(next_header, &packet[IPV6_HEADER_LEN..], src, dst)
}

fn parse_transport(
    protocol: u8,
    payload: &[u8],
    src: IpAddr,
    dst: IpAddr,
) -> Result<Option<Packet>, PacketError> {
    if payload.is_empty() {
        return Ok(None);
    }

    match protocol {
        PROTOCOL_TCP => parse_tcp(payload, src, dst).map(Some),
        PROTOCOL_UDP => parse_udp(payload, src, dst).map(Some),
        PROTOCOL_ICMP => Ok(Some(Packet::Icmp)),
        _ => Ok(None),
    }
}

fn parse_tcp(payload: &[u8], src: IpAddr, dst: IpAddr) -> Result<Packet, PacketError> {
    if payload.len() < TCP_HEADER_LEN {
        return Err(PacketError::TcpTooShort);
    }

    let src_port = read_u16(&payload[0..2]);
    let dst_port = read_u16(&payload[2..4]);

    Ok(Packet::Tcp(TcpSegment {
        id: EndpointId::from_packet(src, src_port, dst, dst_port),
        seq: read_u32(&payload[4..8]),
        ack: read_u32(&payload[8..12]),
        flags: TcpFlags::from_byte(payload[13]),
    }))
}

fn parse_udp(payload: &[u8], src: IpAddr, dst: IpAddr) -> Result<Packet, PacketError> {
    if payload.len() < UDP_HEADER_LEN {
        return Err(PacketError::UdpTooShort);
    }

    let src_port = read_u16(&payload[0..2]);
    let dst_port = read_u16(&payload[2..4]);
    let length = read_u16(&payload[4..6]) as usize;

    let mut data = &payload[UDP_HEADER_LEN..];
    if length < data.len() {
        data = &data[..length];
    }

    Ok(Packet::Udp(UdpDatagram {
        id: EndpointId::from_packet(src, src_port, dst, dst_port),
        payload: Bytes::copy_from_slice(data),
    }))
}

/// Build an IP+UDP packet carrying `payload` from `src` to `dst`
///
/// Returns `None` when the address families differ or the payload does not
/// fit a single datagram.
pub fn build_udp_packet(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Option<Vec<u8>> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    if udp_len > u16::MAX as usize {
        return None;
    }

    let mut udp = Vec::with_capacity(udp_len);
    udp.extend_from_slice(&src.port().to_be_bytes());
    udp.extend_from_slice(&dst.port().to_be_bytes());
    udp.extend_from_slice(&(udp_len as u16).to_be_bytes());
    udp.extend_from_slice(&[0, 0]);
    udp.extend_from_slice(payload);

    match (src.ip(), dst.ip()) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let total_len = IPV4_HEADER_LEN + udp_len;
            if total_len > u16::MAX as usize {
                return None;
            }

            let mut pseudo = Vec::with_capacity(12);
            pseudo.extend_from_slice(&s.octets());
            pseudo.extend_from_slice(&d.octets());
            pseudo.extend_from_slice(&[0, PROTOCOL_UDP]);
            pseudo.extend_from_slice(&(udp_len as u16).to_be_bytes());
            set_udp_checksum(&mut udp, &pseudo);

            let mut packet = Vec::with_capacity(total_len);
            packet.extend_from_slice(&[0x45, 0]);
            packet.extend_from_slice(&(total_len as u16).to_be_bytes());
            // identification 0, don't fragment
            packet.extend_from_slice(&[0, 0, 0x40, 0]);
            packet.extend_from_slice(&[DEFAULT_TTL, PROTOCOL_UDP, 0, 0]);
            packet.extend_from_slice(&s.octets());
            packet.extend_from_slice(&d.octets());
            let csum = checksum(&[&packet[..IPV4_HEADER_LEN]]);
            packet[10..12].copy_from_slice(&csum.to_be_bytes());
            packet.extend_from_slice(&udp);
            Some(packet)
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            let mut pseudo = Vec::with_capacity(40);
            pseudo.extend_from_slice(&s.octets());
            pseudo.extend_from_slice(&d.octets());
            pseudo.extend_from_slice(&(udp_len as u32).to_be_bytes());
            pseudo.extend_from_slice(&[0, 0, 0, PROTOCOL_UDP]);
            set_udp_checksum(&mut udp, &pseudo);

            let mut packet = Vec::with_capacity(IPV6_HEADER_LEN + udp_len);
            packet.extend_from_slice(&[0x60, 0, 0, 0]);
            packet.extend_from_slice(&(udp_len as u16).to_be_bytes());
            packet.extend_from_slice(&[PROTOCOL_UDP, DEFAULT_TTL]);
            packet.extend_from_slice(&s.octets());
            packet.extend_from_slice(&d.octets());
            packet.extend_from_slice(&udp);
            Some(packet)
        }
        _ => None,
    }
}

fn set_udp_checksum(udp: &mut [u8], pseudo: &[u8]) {
    let mut csum = checksum(&[pseudo, udp]);
    // zero means "no checksum" on the wire
    if csum == 0 {
        csum = 0xFFFF;
    }
    udp[6..8].copy_from_slice(&csum.to_be_bytes());
}

/// Internet checksum over the concatenation of `parts`
///
/// Every part except the last must have even length.
fn checksum(parts: &[&[u8]]) -> u16 {
    let mut sum: u32 = 0;
    for part in parts {
        let mut chunks = part.chunks_exact(2);
        for chunk in &mut chunks {
            sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
        }
        if let [last] = chunks.remainder() {
            sum += (*last as u32) << 8;
        }
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

fn read_u16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

fn read_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn read_array<const N: usize>(b: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&b[..N]);
    out
}
