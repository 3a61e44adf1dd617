//! Translation of ICMP error messages quoting a translated datagram.
//!
//! An error about a session's packet carries the packet's IP header and
//! the first bytes of its transport header. Both the quote and the outer
//! header must be rewritten so the peer sees addresses it knows, and four
//! checksums follow: the quoted IP header, the quoted transport header
//! (when enough of it was quoted), the ICMP message and the outer IP header.

use std::net::Ipv4Addr;

use crate::common::entity::Protocol;

use super::checksum::{addr_sum, adjust_checksum, fix_outgoing, ones_sum};
use super::entity::{Direction, Endpoint};
use super::error::NatError;
use super::packet::{
    is_icmp_query, read_addr, read_u16, write_u16, Packet, ICMP_HEADER, IPV4_MIN_HEADER,
};
use super::table::{FlowKey, PortKind};

/// Minimum transport bytes an error must quote.
const MIN_QUOTE: usize = 8;
/// Quoted bytes needed to reach the TCP checksum field.
const TCP_CHECKSUM_QUOTE: usize = 18;

/// The datagram quoted inside an ICMP error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedHeader {
    pub protocol: Protocol,
    /// Source address and port (ICMP id for queries).
    pub src: Endpoint,
    /// Destination address and port (ICMP id for queries).
    pub dst: Endpoint,
    pub ports: PortKind,
    offset: usize,
    header_len: usize,
    quoted: usize,
}

/// Locate and validate the datagram quoted by an ICMP error.
pub fn parse_embedded(packet: &Packet) -> Result<EmbeddedHeader, NatError> {
    let data = packet.as_bytes();
    let offset = packet.header_len() + ICMP_HEADER;
    if data.len() < offset + IPV4_MIN_HEADER {
        return Err(NatError::MalformedEmbeddedPacket("quoted header truncated"));
    }
    if data[offset] >> 4 != 4 {
        return Err(NatError::MalformedEmbeddedPacket("quoted packet is not IPv4"));
    }
    let header_len = usize::from(data[offset] & 0x0F) * 4;
    if header_len < IPV4_MIN_HEADER || data.len() < offset + header_len {
        return Err(NatError::MalformedEmbeddedPacket("quoted header length invalid"));
    }
    let l4 = offset + header_len;
    let quoted = data.len() - l4;
    let protocol = Protocol::from_u8(data[offset + 9]);
    let src_addr = read_addr(data, offset + 12);
    let dst_addr = read_addr(data, offset + 16);

    let (ports, sport, dport) = match protocol {
        Protocol::Tcp | Protocol::Udp => {
            if quoted < MIN_QUOTE {
                return Err(NatError::MalformedEmbeddedPacket("quoted transport truncated"));
            }
            (PortKind::TcpUdp, read_u16(data, l4), read_u16(data, l4 + 2))
        }
        Protocol::Icmp => {
            if quoted < MIN_QUOTE {
                return Err(NatError::MalformedEmbeddedPacket("quoted icmp truncated"));
            }
            if is_icmp_query(data[l4]) {
                let id = read_u16(data, l4 + 4);
                (PortKind::IcmpId, id, id)
            } else {
                (PortKind::None, 0, 0)
            }
        }
        _ => (PortKind::None, 0, 0),
    };

    Ok(EmbeddedHeader {
        protocol,
        src: Endpoint::new(src_addr, sport),
        dst: Endpoint::new(dst_addr, dport),
        ports,
        offset,
        header_len,
        quoted,
    })
}

impl EmbeddedHeader {
    /// Key of the session the quoted datagram belongs to. An error
    /// travelling in `direction` quotes a packet that went the other way.
    pub fn session_key(&self, direction: Direction, interface: &str) -> FlowKey {
        let icmp = self.ports == PortKind::IcmpId;
        let (local, remote) = match direction {
            Direction::Inbound => (self.src, self.dst),
            Direction::Outbound => (self.dst, self.src),
        };
        let remote_port = if icmp { 0 } else { remote.port };
        FlowKey::new(
            direction,
            self.protocol,
            interface,
            (local.addr, local.port),
            (remote.addr, remote_port),
            self.ports,
        )
    }
}

/// The error is about a packet this host's peer sent or received.
pub fn addressed_to_quote(packet: &Packet, emb: &EmbeddedHeader) -> bool {
    packet.dst() == emb.src.addr
}

/// Rewrite the quoted datagram and the outer header of an ICMP error.
///
/// Inbound errors quote a translated outbound packet: its source becomes
/// `target` (the inside endpoint) and so does the outer destination.
/// Outbound errors quote a translated inbound packet: its destination
/// becomes `target` (the outside endpoint) and so does the outer source.
pub fn rewrite_embedded(
    packet: &mut Packet,
    emb: &EmbeddedHeader,
    direction: Direction,
    target: Endpoint,
) {
    let icmp_at = packet.header_len();
    let inner = emb.offset;
    let inner_l4 = inner + emb.header_len;
    let end = inner_l4 + emb.quoted;

    let (addr_at, port_at, outer_addr_at) = match (direction, emb.ports) {
        (_, PortKind::IcmpId) => (
            if direction == Direction::Inbound { inner + 12 } else { inner + 16 },
            inner_l4 + 4,
            if direction == Direction::Inbound { 16 } else { 12 },
        ),
        (Direction::Inbound, _) => (inner + 12, inner_l4, 16),
        (Direction::Outbound, _) => (inner + 16, inner_l4 + 2, 12),
    };

    let before = packet.as_bytes()[inner..end].to_vec();
    let data = packet.bytes_mut();

    // Quoted IP header.
    let old_addr = read_addr(data, addr_at);
    data[addr_at..addr_at + 4].copy_from_slice(&target.addr.octets());
    let ip_delta = adjust_checksum(addr_sum(old_addr), addr_sum(target.addr), Direction::Outbound);
    let ck = fix_outgoing(read_u16(data, inner + 10), ip_delta);
    write_u16(data, inner + 10, ck);

    // Quoted transport header.
    match (emb.protocol, emb.ports) {
        (Protocol::Tcp | Protocol::Udp, PortKind::TcpUdp) => {
            let old_port = read_u16(data, port_at);
            write_u16(data, port_at, target.port);
            let delta = adjust_checksum(
                addr_sum(old_addr) + u32::from(old_port),
                addr_sum(target.addr) + u32::from(target.port),
                Direction::Outbound,
            );
            if emb.protocol == Protocol::Tcp {
                if emb.quoted >= TCP_CHECKSUM_QUOTE {
                    let ck = fix_outgoing(read_u16(data, inner_l4 + 16), delta);
                    write_u16(data, inner_l4 + 16, ck);
                }
            } else {
                let ck = read_u16(data, inner_l4 + 6);
                if ck != 0 {
                    let fixed = fix_outgoing(ck, delta);
                    write_u16(data, inner_l4 + 6, if fixed == 0 { 0xFFFF } else { fixed });
                }
            }
        }
        (Protocol::Icmp, PortKind::IcmpId) => {
            let old_id = read_u16(data, port_at);
            write_u16(data, port_at, target.port);
            let delta = adjust_checksum(
                u32::from(old_id),
                u32::from(target.port),
                Direction::Outbound,
            );
            let ck = fix_outgoing(read_u16(data, inner_l4 + 2), delta);
            write_u16(data, inner_l4 + 2, ck);
        }
        _ => {}
    }

    // ICMP checksum covers the whole quote.
    let quote_delta = adjust_checksum(ones_sum(&before), ones_sum(&data[inner..end]), Direction::Outbound);
    let ck = fix_outgoing(read_u16(data, icmp_at + 2), quote_delta);
    write_u16(data, icmp_at + 2, ck);

    // Outer header.
    let old_outer: Ipv4Addr = read_addr(data, outer_addr_at);
    data[outer_addr_at..outer_addr_at + 4].copy_from_slice(&target.addr.octets());
    let outer_delta = adjust_checksum(addr_sum(old_outer), addr_sum(target.addr), Direction::Outbound);
    let ck = fix_outgoing(read_u16(data, 10), outer_delta);
    write_u16(data, 10, ck);
}
