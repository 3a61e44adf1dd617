use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::common::entity::Protocol;

use super::checksum::{self, fix_incoming, fix_outgoing};
use super::entity::Direction;
use super::error::NatError;

pub const IPV4_MIN_HEADER: usize = 20;
pub const TCP_MIN_HEADER: usize = 20;
pub const UDP_HEADER: usize = 8;
pub const ICMP_HEADER: usize = 8;

// ── ICMP types ──────────────────────────────────────────────────────

pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_UNREACH: u8 = 3;
pub const ICMP_SOURCE_QUENCH: u8 = 4;
pub const ICMP_REDIRECT: u8 = 5;
pub const ICMP_ECHO: u8 = 8;
pub const ICMP_TIME_EXCEEDED: u8 = 11;
pub const ICMP_PARAM_PROBLEM: u8 = 12;
pub const ICMP_TIMESTAMP: u8 = 13;
pub const ICMP_TIMESTAMP_REPLY: u8 = 14;
pub const ICMP_INFO_REQUEST: u8 = 15;
pub const ICMP_INFO_REPLY: u8 = 16;
pub const ICMP_MASK_REQUEST: u8 = 17;
pub const ICMP_MASK_REPLY: u8 = 18;

// ── TCP flags ───────────────────────────────────────────────────────

pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;
pub const TCP_ACK: u8 = 0x10;

const TCP_OPT_EOL: u8 = 0;
const TCP_OPT_NOP: u8 = 1;
const TCP_OPT_MSS: u8 = 2;

/// ICMP messages that carry an identifier and behave like a flow.
pub fn is_icmp_query(icmp_type: u8) -> bool {
    matches!(
        icmp_type,
        ICMP_ECHO_REPLY
            | ICMP_ECHO
            | ICMP_TIMESTAMP
            | ICMP_TIMESTAMP_REPLY
            | ICMP_INFO_REQUEST
            | ICMP_INFO_REPLY
            | ICMP_MASK_REQUEST
            | ICMP_MASK_REPLY
    )
}

/// ICMP messages that quote the header of an offending datagram.
pub fn is_icmp_error(icmp_type: u8) -> bool {
    matches!(
        icmp_type,
        ICMP_UNREACH | ICMP_SOURCE_QUENCH | ICMP_REDIRECT | ICMP_TIME_EXCEEDED | ICMP_PARAM_PROBLEM
    )
}

/// How the transport checksum field is represented.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumMode {
    /// A complete checksum.
    #[default]
    Full,
    /// Hardware offload: the field holds the folded, uncomplemented pseudo
    /// header sum and the NIC finishes the job.
    Offload,
}

/// An IPv4 datagram handed over by the filter engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    data: Vec<u8>,
    header_len: usize,
    pub interface: String,
    pub tag: Option<String>,
    pub checksum_mode: ChecksumMode,
}

/// The side of the packet being rewritten with its checksum deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rewrite {
    /// Outbound rewrites the source, inbound the destination.
    pub direction: Direction,
    pub addr: Ipv4Addr,
    /// New port, or ICMP query id.
    pub port: Option<u16>,
    /// Inside-to-outside delta for the IP header checksum.
    pub ip_delta: u32,
    /// Inside-to-outside delta for the transport checksum.
    pub l4_delta: u32,
}

impl Packet {
    /// Parse and validate an IPv4 datagram. Bytes past the IP total length
    /// (link padding) are dropped.
    pub fn parse(mut data: Vec<u8>, interface: impl Into<String>) -> Result<Self, NatError> {
        if data.len() < IPV4_MIN_HEADER {
            return Err(NatError::MalformedPacket("shorter than an IPv4 header"));
        }
        if data[0] >> 4 != 4 {
            return Err(NatError::MalformedPacket("not IPv4"));
        }
        let header_len = usize::from(data[0] & 0x0F) * 4;
        if header_len < IPV4_MIN_HEADER {
            return Err(NatError::MalformedPacket("header length below minimum"));
        }
        let total = usize::from(u16::from_be_bytes([data[2], data[3]]));
        if total < header_len || total > data.len() {
            return Err(NatError::MalformedPacket("total length out of bounds"));
        }
        data.truncate(total);

        let packet = Self {
            data,
            header_len,
            interface: interface.into(),
            tag: None,
            checksum_mode: ChecksumMode::Full,
        };

        if packet.is_first_fragment() {
            let have = packet.data.len() - header_len;
            let need = match packet.protocol() {
                Protocol::Tcp => TCP_MIN_HEADER,
                Protocol::Udp => UDP_HEADER,
                Protocol::Icmp => ICMP_HEADER,
                _ => 0,
            };
            if have < need {
                return Err(NatError::MalformedPacket("transport header truncated"));
            }
        }
        Ok(packet)
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_checksum_mode(mut self, mode: ChecksumMode) -> Self {
        self.checksum_mode = mode;
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    // ── IP header ──────────────────────────────────────────────────

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn protocol(&self) -> Protocol {
        Protocol::from_u8(self.data[9])
    }

    pub fn ident(&self) -> u16 {
        u16::from_be_bytes([self.data[4], self.data[5]])
    }

    pub fn src(&self) -> Ipv4Addr {
        read_addr(&self.data, 12)
    }

    pub fn dst(&self) -> Ipv4Addr {
        read_addr(&self.data, 16)
    }

    pub fn ip_checksum(&self) -> u16 {
        read_u16(&self.data, 10)
    }

    fn fragment_field(&self) -> u16 {
        read_u16(&self.data, 6)
    }

    /// More-fragments set or a non-zero offset.
    pub fn is_fragment(&self) -> bool {
        self.fragment_field() & 0x3FFF != 0
    }

    /// Carries the transport header: not a fragment, or offset zero.
    pub fn is_first_fragment(&self) -> bool {
        self.fragment_field() & 0x1FFF == 0
    }

    // ── Transport header ───────────────────────────────────────────

    fn l4(&self) -> usize {
        self.header_len
    }

    fn has_transport(&self) -> bool {
        self.is_first_fragment()
    }

    pub fn src_port(&self) -> Option<u16> {
        (self.has_transport() && self.protocol().is_tcp_udp()).then(|| read_u16(&self.data, self.l4()))
    }

    pub fn dst_port(&self) -> Option<u16> {
        (self.has_transport() && self.protocol().is_tcp_udp())
            .then(|| read_u16(&self.data, self.l4() + 2))
    }

    pub fn icmp_type(&self) -> Option<u8> {
        (self.has_transport() && self.protocol() == Protocol::Icmp).then(|| self.data[self.l4()])
    }

    pub fn icmp_code(&self) -> Option<u8> {
        (self.has_transport() && self.protocol() == Protocol::Icmp).then(|| self.data[self.l4() + 1])
    }

    /// Identifier of an ICMP query message.
    pub fn icmp_id(&self) -> Option<u16> {
        self.icmp_type()
            .filter(|t| is_icmp_query(*t))
            .map(|_| read_u16(&self.data, self.l4() + 4))
    }

    pub fn is_icmp_error(&self) -> bool {
        self.icmp_type().is_some_and(is_icmp_error)
    }

    pub fn tcp_flags(&self) -> Option<u8> {
        (self.has_transport() && self.protocol() == Protocol::Tcp).then(|| self.data[self.l4() + 13])
    }

    /// Transport payload length (total length minus IP header).
    pub fn transport_len(&self) -> usize {
        self.data.len() - self.header_len
    }

    /// Bytes of TCP data after the header and options.
    pub fn tcp_payload_len(&self) -> Option<usize> {
        self.tcp_flags()?;
        let data_off = usize::from(self.data[self.l4() + 12] >> 4) * 4;
        Some(self.transport_len().saturating_sub(data_off))
    }

    /// Offset of the transport checksum field, if the packet carries one.
    fn transport_checksum_offset(&self) -> Option<usize> {
        if !self.has_transport() {
            return None;
        }
        match self.protocol() {
            Protocol::Tcp => Some(self.l4() + 16),
            Protocol::Udp => Some(self.l4() + 6),
            Protocol::Icmp if self.icmp_id().is_some() => Some(self.l4() + 2),
            _ => None,
        }
    }

    /// Offset of the port (or ICMP id) on the rewritten side.
    fn port_offset(&self, direction: Direction) -> Option<usize> {
        if !self.has_transport() {
            return None;
        }
        match (self.protocol(), direction) {
            (Protocol::Tcp | Protocol::Udp, Direction::Outbound) => Some(self.l4()),
            (Protocol::Tcp | Protocol::Udp, Direction::Inbound) => Some(self.l4() + 2),
            (Protocol::Icmp, _) if self.icmp_id().is_some() => Some(self.l4() + 4),
            _ => None,
        }
    }

    // ── Rewriting ──────────────────────────────────────────────────

    /// Rewrite the source (outbound) or destination (inbound) endpoint and
    /// fix every checksum that covers it.
    pub fn apply(&mut self, rw: &Rewrite) {
        let fix = |ck: u16, d: u32| match rw.direction {
            Direction::Outbound => fix_outgoing(ck, d),
            Direction::Inbound => fix_incoming(ck, d),
        };

        let addr_at = match rw.direction {
            Direction::Outbound => 12,
            Direction::Inbound => 16,
        };
        self.data[addr_at..addr_at + 4].copy_from_slice(&rw.addr.octets());
        let ipsum = fix(self.ip_checksum(), rw.ip_delta);
        write_u16(&mut self.data, 10, ipsum);

        if let (Some(port), Some(at)) = (rw.port, self.port_offset(rw.direction)) {
            write_u16(&mut self.data, at, port);
        }

        let Some(at) = self.transport_checksum_offset() else {
            return;
        };
        let proto = self.protocol();
        match (self.checksum_mode, proto) {
            (ChecksumMode::Offload, Protocol::Tcp | Protocol::Udp) => {
                let len = u16::try_from(self.transport_len()).unwrap_or(u16::MAX);
                let partial = checksum::fold(checksum::pseudo_header_sum(
                    self.src(),
                    self.dst(),
                    proto.to_u8(),
                    len,
                ));
                write_u16(&mut self.data, at, partial);
            }
            (_, Protocol::Udp) => {
                let ck = read_u16(&self.data, at);
                if ck != 0 {
                    let fixed = fix(ck, rw.l4_delta);
                    write_u16(&mut self.data, at, if fixed == 0 { 0xFFFF } else { fixed });
                }
            }
            _ => {
                let fixed = fix(read_u16(&self.data, at), rw.l4_delta);
                write_u16(&mut self.data, at, fixed);
            }
        }
    }

    /// Lower the MSS option of a TCP SYN to `max`. Returns whether the
    /// packet changed.
    pub fn clamp_mss(&mut self, max: u16) -> bool {
        let Some(flags) = self.tcp_flags() else {
            return false;
        };
        if flags & TCP_SYN == 0 {
            return false;
        }
        let l4 = self.l4();
        let data_off = usize::from(self.data[l4 + 12] >> 4) * 4;
        if data_off <= TCP_MIN_HEADER || l4 + data_off > self.data.len() {
            return false;
        }

        let mut i = l4 + TCP_MIN_HEADER;
        let end = l4 + data_off;
        while i < end {
            match self.data[i] {
                TCP_OPT_EOL => break,
                TCP_OPT_NOP => i += 1,
                kind => {
                    let Some(&len) = self.data.get(i + 1) else {
                        break;
                    };
                    let len = usize::from(len);
                    if len < 2 || i + len > end {
                        break;
                    }
                    if kind == TCP_OPT_MSS && len == 4 {
                        let mss = read_u16(&self.data, i + 2);
                        if mss <= max {
                            return false;
                        }
                        write_u16(&mut self.data, i + 2, max);
                        if self.checksum_mode == ChecksumMode::Full {
                            let d = checksum::field_delta(mss, max);
                            let ck = fix_outgoing(read_u16(&self.data, l4 + 16), d);
                            write_u16(&mut self.data, l4 + 16, ck);
                        }
                        return true;
                    }
                    i += len;
                }
            }
        }
        false
    }
}

pub(crate) fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

pub(crate) fn write_u16(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_be_bytes());
}

pub(crate) fn read_addr(buf: &[u8], at: usize) -> Ipv4Addr {
    Ipv4Addr::new(buf[at], buf[at + 1], buf[at + 2], buf[at + 3])
}

/// Builders for well-formed datagrams, shared by unit and integration tests.
pub mod build {
    use std::net::Ipv4Addr;

    use super::super::checksum::{internet_checksum, transport_checksum};
    use super::{write_u16, ICMP_ECHO};

    fn ipv4(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, payload: &[u8]) -> Vec<u8> {
        let total = u16::try_from(20 + payload.len()).unwrap_or(u16::MAX);
        let mut p = vec![0u8; 20];
        p[0] = 0x45;
        write_u16(&mut p, 2, total);
        write_u16(&mut p, 4, 0x1c46);
        p[8] = 64;
        p[9] = proto;
        p[12..16].copy_from_slice(&src.octets());
        p[16..20].copy_from_slice(&dst.octets());
        let ck = internet_checksum(&p);
        write_u16(&mut p, 10, ck);
        p.extend_from_slice(payload);
        p
    }

    /// TCP segment with the given flags and an optional MSS option.
    pub fn tcp(
        src: Ipv4Addr,
        sport: u16,
        dst: Ipv4Addr,
        dport: u16,
        flags: u8,
        mss: Option<u16>,
    ) -> Vec<u8> {
        let opt_len = if mss.is_some() { 4 } else { 0 };
        let mut seg = vec![0u8; 20 + opt_len];
        write_u16(&mut seg, 0, sport);
        write_u16(&mut seg, 2, dport);
        seg[4..8].copy_from_slice(&1000u32.to_be_bytes());
        seg[12] = u8::try_from((20 + opt_len) / 4 * 16).unwrap_or(0x50);
        seg[13] = flags;
        write_u16(&mut seg, 14, 65535);
        if let Some(mss) = mss {
            seg[20] = 2;
            seg[21] = 4;
            write_u16(&mut seg, 22, mss);
        }
        let ck = transport_checksum(src, dst, 6, &seg);
        write_u16(&mut seg, 16, ck);
        ipv4(src, dst, 6, &seg)
    }

    pub fn udp(src: Ipv4Addr, sport: u16, dst: Ipv4Addr, dport: u16, body: &[u8]) -> Vec<u8> {
        let len = u16::try_from(8 + body.len()).unwrap_or(u16::MAX);
        let mut seg = vec![0u8; 8];
        write_u16(&mut seg, 0, sport);
        write_u16(&mut seg, 2, dport);
        write_u16(&mut seg, 4, len);
        seg.extend_from_slice(body);
        let ck = transport_checksum(src, dst, 17, &seg);
        write_u16(&mut seg, 6, if ck == 0 { 0xFFFF } else { ck });
        ipv4(src, dst, 17, &seg)
    }

    /// ICMP query (echo by default) with the given type and id.
    pub fn icmp_query(src: Ipv4Addr, dst: Ipv4Addr, icmp_type: u8, id: u16) -> Vec<u8> {
        let mut msg = vec![0u8; 16];
        msg[0] = icmp_type;
        write_u16(&mut msg, 4, id);
        write_u16(&mut msg, 6, 1);
        msg[8..16].copy_from_slice(b"natdping");
        let ck = internet_checksum(&msg);
        write_u16(&mut msg, 2, ck);
        ipv4(src, dst, 1, &msg)
    }

    pub fn echo(src: Ipv4Addr, dst: Ipv4Addr, id: u16) -> Vec<u8> {
        icmp_query(src, dst, ICMP_ECHO, id)
    }

    /// ICMP error from `from` to `to` quoting `quoted` (header plus the
    /// first `quote_len` transport bytes).
    pub fn icmp_error(
        from: Ipv4Addr,
        to: Ipv4Addr,
        icmp_type: u8,
        code: u8,
        quoted: &[u8],
        quote_len: usize,
    ) -> Vec<u8> {
        let ihl = usize::from(quoted[0] & 0x0F) * 4;
        let take = (ihl + quote_len).min(quoted.len());
        let mut msg = vec![0u8; 8];
        msg[0] = icmp_type;
        msg[1] = code;
        msg.extend_from_slice(&quoted[..take]);
        let ck = internet_checksum(&msg);
        write_u16(&mut msg, 2, ck);
        ipv4(from, to, 1, &msg)
    }

    /// Raw datagram of any protocol.
    pub fn raw(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, payload: &[u8]) -> Vec<u8> {
        ipv4(src, dst, proto, payload)
    }
}

/// Verify every checksum of `bytes` against a full recomputation.
pub fn checksums_valid(bytes: &[u8]) -> bool {
    let Ok(p) = Packet::parse(bytes.to_vec(), "") else {
        return false;
    };
    let hl = p.header_len();
    if checksum::internet_checksum(&bytes[..hl]) != 0 {
        return false;
    }
    if !p.is_first_fragment() {
        return true;
    }
    let seg = &p.as_bytes()[hl..];
    match p.protocol() {
        Protocol::Tcp | Protocol::Udp => {
            if p.protocol() == Protocol::Udp && read_u16(seg, 6) == 0 {
                return true;
            }
            let len = u16::try_from(seg.len()).unwrap_or(u16::MAX);
            let sum = checksum::pseudo_header_sum(p.src(), p.dst(), p.protocol().to_u8(), len)
                + checksum::ones_sum(seg);
            checksum::fold(sum) == 0xFFFF
        }
        Protocol::Icmp => checksum::internet_checksum(seg) == 0,
        _ => true,
    }
}
