//! Incremental one's-complement checksum maintenance (RFC 1071 / RFC 1624).
//!
//! A *delta* is a folded 16-bit one's-complement difference between the sum
//! of the old field values and the sum of the new ones. Deltas are always
//! stored in the inside-to-outside sense; `fix_outgoing` applies them and
//! `fix_incoming` applies their inverse.

use std::net::Ipv4Addr;

use super::entity::Direction;

/// Sum of the big-endian 16-bit words of `data`; an odd trailing byte is
/// padded with zero.
pub fn ones_sum(data: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for w in &mut chunks {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([w[0], w[1]])));
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u32::from(*last) << 8);
    }
    sum
}

/// Fold a 32-bit accumulator into 16 bits with end-around carry.
pub fn fold(mut sum: u32) -> u16 {
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// Full checksum over `data`.
pub fn internet_checksum(data: &[u8]) -> u16 {
    !fold(ones_sum(data))
}

/// Sum of the two 16-bit halves of an address.
pub fn addr_sum(addr: Ipv4Addr) -> u32 {
    let v = u32::from(addr);
    (v >> 16) + (v & 0xFFFF)
}

/// Sum of the TCP/UDP pseudo header.
pub fn pseudo_header_sum(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, len: u16) -> u32 {
    addr_sum(src) + addr_sum(dst) + u32::from(proto) + u32::from(len)
}

/// Full TCP/UDP checksum over a segment whose checksum field is zeroed.
pub fn transport_checksum(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, segment: &[u8]) -> u16 {
    let len = u16::try_from(segment.len()).unwrap_or(u16::MAX);
    !fold(pseudo_header_sum(src, dst, proto, len) + ones_sum(segment))
}

/// Delta to apply when a packet travelling in `direction` has fields
/// summing to `old` replaced by fields summing to `new`.
///
/// `Outbound` yields `new - old`, `Inbound` the inverse, so a session
/// computes its deltas once and both directions share them. A negative
/// zero result is normalised to zero so callers can skip no-op updates.
pub fn adjust_checksum(old: u32, new: u32, direction: Direction) -> u32 {
    let old = u32::from(fold(old));
    let new = u32::from(fold(new));
    let d = match direction {
        Direction::Outbound => fold(new + (!old & 0xFFFF)),
        Direction::Inbound => fold(old + (!new & 0xFFFF)),
    };
    if d == 0xFFFF { 0 } else { u32::from(d) }
}

/// Apply `delta` to checksum `ck`.
pub fn fix_outgoing(ck: u16, delta: u32) -> u16 {
    if delta == 0 {
        return ck;
    }
    !fold(u32::from(!ck) + (delta & 0xFFFF))
}

/// Apply the inverse of `delta` to checksum `ck`.
pub fn fix_incoming(ck: u16, delta: u32) -> u16 {
    if delta == 0 {
        return ck;
    }
    fix_outgoing(ck, !delta & 0xFFFF)
}

/// Combine two deltas into one.
pub fn add_deltas(a: u32, b: u32) -> u32 {
    let d = fold(a + b);
    if d == 0xFFFF { 0 } else { u32::from(d) }
}

/// Delta between two checksum values as stored in a packet, used when an
/// inner checksum that an outer checksum covers is itself rewritten.
pub fn field_delta(old: u16, new: u16) -> u32 {
    adjust_checksum(u32::from(old), u32::from(new), Direction::Outbound)
}
