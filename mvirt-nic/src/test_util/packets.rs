//! Frame fixtures
//!
//! Uses smoltcp to build and parse Ethernet/IPv4/UDP frames.

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr, IpProtocol, Ipv4Address,
    Ipv4Packet, Ipv4Repr, UdpPacket, UdpRepr,
};

/// Ethernet header size
pub const ETHERNET_HDR_SIZE: usize = 14;

/// IP header size (without options)
pub const IP_HDR_SIZE: usize = 20;

/// UDP header size
pub const UDP_HDR_SIZE: usize = 8;

/// Bytes in front of the UDP payload
pub const UDP_OVERHEAD: usize = ETHERNET_HDR_SIZE + IP_HDR_SIZE + UDP_HDR_SIZE;

pub const SRC_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
pub const DST_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];

/// Endpoints of a UDP flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpFlow {
    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
    pub src_ip: [u8; 4],
    pub dst_ip: [u8; 4],
    pub src_port: u16,
    pub dst_port: u16,
}

impl Default for UdpFlow {
    fn default() -> Self {
        Self {
            src_mac: SRC_MAC,
            dst_mac: DST_MAC,
            src_ip: [10, 0, 0, 1],
            dst_ip: [10, 0, 0, 2],
            src_port: 40000,
            dst_port: 9,
        }
    }
}

/// Build an Ethernet/IPv4/UDP frame carrying `payload`.
pub fn create_udp_frame(flow: &UdpFlow, payload: &[u8]) -> Vec<u8> {
    let udp_len = UDP_HDR_SIZE + payload.len();
    let ip_len = IP_HDR_SIZE + udp_len;
    let mut frame = vec![0u8; ETHERNET_HDR_SIZE + ip_len];

    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress(flow.src_mac),
        dst_addr: EthernetAddress(flow.dst_mac),
        ethertype: EthernetProtocol::Ipv4,
    };
    let mut eth_frame = EthernetFrame::new_unchecked(&mut frame[..]);
    eth_repr.emit(&mut eth_frame);

    let ip_repr = Ipv4Repr {
        src_addr: Ipv4Address::from(flow.src_ip),
        dst_addr: Ipv4Address::from(flow.dst_ip),
        next_header: IpProtocol::Udp,
        payload_len: udp_len,
        hop_limit: 64,
    };
    let mut ip_packet = Ipv4Packet::new_unchecked(eth_frame.payload_mut());
    ip_repr.emit(&mut ip_packet, &ChecksumCapabilities::default());

    let udp_repr = UdpRepr {
        src_port: flow.src_port,
        dst_port: flow.dst_port,
    };
    let mut udp_packet = UdpPacket::new_unchecked(ip_packet.payload_mut());
    udp_repr.emit(
        &mut udp_packet,
        &ip_repr.src_addr.into(),
        &ip_repr.dst_addr.into(),
        payload.len(),
        |buf| buf.copy_from_slice(payload),
        &ChecksumCapabilities::default(),
    );

    frame
}

/// Frame of exactly `len` bytes whose payload starts with `seq`.
pub fn sequenced_frame(seq: u32, len: usize) -> Vec<u8> {
    let payload_len = len.max(UDP_OVERHEAD + 4) - UDP_OVERHEAD;
    let mut payload: Vec<u8> = (0..payload_len).map(|i| (i % 251) as u8).collect();
    payload[..4].copy_from_slice(&seq.to_be_bytes());
    create_udp_frame(&UdpFlow::default(), &payload)
}

/// Parsed UDP datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: Vec<u8>,
}

impl UdpDatagram {
    /// Sequence number written by `sequenced_frame`.
    pub fn seq(&self) -> Option<u32> {
        let bytes = self.payload.get(..4)?;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// Parse an Ethernet/IPv4/UDP frame.
pub fn parse_udp_frame(frame: &[u8]) -> Option<UdpDatagram> {
    let eth_frame = EthernetFrame::new_checked(frame).ok()?;
    if eth_frame.ethertype() != EthernetProtocol::Ipv4 {
        return None;
    }
    let ip_packet = Ipv4Packet::new_checked(eth_frame.payload()).ok()?;
    if ip_packet.next_header() != IpProtocol::Udp {
        return None;
    }
    let udp_packet = UdpPacket::new_checked(ip_packet.payload()).ok()?;
    Some(UdpDatagram {
        src_port: udp_packet.src_port(),
        dst_port: udp_packet.dst_port(),
        payload: udp_packet.payload().to_vec(),
    })
}
