use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::common::entity::{Protocol, RuleId};

use super::error::NatError;

/// First port handed out by map-block and automatic port mapping.
pub const MAPBLOCK_MIN_PORT: u32 = 1024;

/// Ports available above the reserved range.
pub const USABLE_PORTS: u32 = 65_536 - MAPBLOCK_MIN_PORT;

// ── Direction ───────────────────────────────────────────────────────

/// Packet direction relative to the NAT boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Inside host towards the outside world.
    Outbound,
    /// Outside world towards an inside host.
    Inbound,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Self::Outbound => Self::Inbound,
            Self::Inbound => Self::Outbound,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Self::Outbound => 0,
            Self::Inbound => 1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Outbound => f.write_str("outbound"),
            Self::Inbound => f.write_str("inbound"),
        }
    }
}

// ── Addresses and ports ─────────────────────────────────────────────

/// IPv4 network, always stored with host bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Net {
    addr: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Net {
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Result<Self, NatError> {
        if prefix_len > 32 {
            return Err(NatError::InvalidRule {
                reason: format!("prefix length {prefix_len} must be 0-32"),
            });
        }
        let mask = prefix_mask(prefix_len);
        Ok(Self {
            addr: Ipv4Addr::from(u32::from(addr) & mask),
            prefix_len,
        })
    }

    /// Single host network (`/32`).
    pub fn host(addr: Ipv4Addr) -> Self {
        Self {
            addr,
            prefix_len: 32,
        }
    }

    pub fn addr(self) -> Ipv4Addr {
        self.addr
    }

    pub fn prefix_len(self) -> u8 {
        self.prefix_len
    }

    pub fn mask(self) -> u32 {
        prefix_mask(self.prefix_len)
    }

    pub fn contains(self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask() == u32::from(self.addr)
    }

    /// Number of addresses covered, including network and broadcast.
    pub fn size(self) -> u64 {
        1u64 << (32 - u32::from(self.prefix_len))
    }

    /// `0.0.0.0/32`: the address of an interface, resolved at use time.
    pub fn is_interface_address(self) -> bool {
        self.addr.is_unspecified() && self.prefix_len == 32
    }

    /// `0.0.0.0/0`: keep the original address.
    pub fn is_passthrough(self) -> bool {
        self.addr.is_unspecified() && self.prefix_len == 0
    }
}

pub(crate) fn prefix_mask(prefix_len: u8) -> u32 {
    match prefix_len {
        0 => 0,
        n => u32::MAX << (32 - u32::from(n.min(32))),
    }
}

impl fmt::Display for Ipv4Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl FromStr for Ipv4Net {
    type Err = NatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| NatError::InvalidRule { reason };
        let (ip, len) = match s.split_once('/') {
            Some((ip, len)) => (
                ip,
                len.parse::<u8>()
                    .map_err(|_| invalid(format!("invalid prefix length in '{s}'")))?,
            ),
            None => (s, 32),
        };
        let addr = ip
            .parse::<Ipv4Addr>()
            .map_err(|e| invalid(format!("invalid address '{ip}': {e}")))?;
        Self::new(addr, len)
    }
}

impl TryFrom<String> for Ipv4Net {
    type Error = NatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Ipv4Net> for String {
    fn from(net: Ipv4Net) -> Self {
        net.to_string()
    }
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    pub fn len(&self) -> u32 {
        u32::from(self.end).saturating_sub(u32::from(self.start)) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }
}

// ── Rule ────────────────────────────────────────────────────────────

/// Translation mode of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NatMode {
    /// Outbound source translation.
    Map,
    /// Inbound destination translation.
    Redirect,
    /// 1:1 translation in both directions.
    Bimap,
    /// Outbound translation with per-host deterministic port blocks.
    MapBlock,
}

impl NatMode {
    /// Rule participates in outbound matching.
    pub fn is_map(self) -> bool {
        matches!(self, Self::Map | Self::Bimap | Self::MapBlock)
    }

    /// Rule participates in inbound matching.
    pub fn is_redirect(self) -> bool {
        matches!(self, Self::Redirect | Self::Bimap)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Map => "map",
            Self::Redirect => "rdr",
            Self::Bimap => "bimap",
            Self::MapBlock => "map-block",
        }
    }
}

impl fmt::Display for NatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Behaviour modifiers of a rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleFlags {
    /// Match both TCP and UDP.
    pub tcp_udp: bool,
    /// Derive the outside port from the inside port (`ports auto`).
    pub auto_portmap: bool,
    /// Rotate the rule to the back of its bucket after each allocation.
    pub round_robin: bool,
    /// Keep one inside host on the same outside address.
    pub sticky: bool,
    /// Redirect keeps the configured target port for every public port.
    pub fixed_dport: bool,
    pub negate_src: bool,
    pub negate_dst: bool,
}

/// Ports per inside host for map-block rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortsPerHost {
    Auto,
    Fixed(u32),
}

/// Generic filter predicate applied on top of the address match.
///
/// `peer` is the remote side of the flow: the destination for outbound
/// rules and the source for inbound rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterTuple {
    pub peer: Option<Ipv4Net>,
    pub src_ports: Option<PortRange>,
    pub dst_ports: Option<PortRange>,
}

/// Binds a rule to a payload proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyBinding {
    pub label: String,
    /// Destination port the proxied protocol uses.
    pub port: u16,
}

/// Per-rule idle timeouts, replacing the protocol defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeOverride {
    /// Packets travelling in the session's creation direction.
    pub forward_secs: u32,
    /// Packets travelling against it.
    pub reverse_secs: u32,
}

/// A configured translation policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatRule {
    pub id: RuleId,
    pub mode: NatMode,
    /// Interface the rule is bound to. `None` matches any interface.
    pub interface: Option<String>,
    /// Interface whose address is used by `0/32` rules, when different.
    pub out_interface: Option<String>,
    pub protocol: Protocol,
    /// Map: matched source network. Redirect: translation target.
    pub inside: Ipv4Net,
    /// Map: address pool. Redirect: matched public destination.
    pub outside: Ipv4Net,
    /// Last address of an outside address range starting at `outside`.
    pub outside_range_end: Option<Ipv4Addr>,
    /// Second target alternated with `inside` by split redirects.
    pub split_target: Option<Ipv4Addr>,
    /// Map: translated port range. Redirect: matched public port range.
    pub ports: Option<PortRange>,
    /// Redirect: first target port.
    pub target_port: Option<u16>,
    pub ports_per_host: Option<PortsPerHost>,
    pub flags: RuleFlags,
    pub filter: Option<FilterTuple>,
    pub proxy: Option<ProxyBinding>,
    pub tag: Option<String>,
    pub mss_clamp: Option<u16>,
    pub age: Option<AgeOverride>,
}

impl NatRule {
    /// Minimal rule of the given mode; callers fill in the rest.
    pub fn new(id: impl Into<String>, mode: NatMode, inside: Ipv4Net, outside: Ipv4Net) -> Self {
        Self {
            id: RuleId(id.into()),
            mode,
            interface: None,
            out_interface: None,
            protocol: Protocol::Any,
            inside,
            outside,
            outside_range_end: None,
            split_target: None,
            ports: None,
            target_port: None,
            ports_per_host: None,
            flags: RuleFlags::default(),
            filter: None,
            proxy: None,
            tag: None,
            mss_clamp: None,
            age: None,
        }
    }

    pub fn is_ip_range(&self) -> bool {
        self.outside_range_end.is_some()
    }

    pub fn is_split(&self) -> bool {
        self.split_target.is_some()
    }

    /// TCP/UDP rules are the only ones that may rewrite ports.
    pub fn is_tcp_udp(&self) -> bool {
        self.flags.tcp_udp || self.protocol.is_tcp_udp()
    }

    pub fn matches_protocol(&self, proto: Protocol) -> bool {
        if self.flags.tcp_udp {
            return proto.is_tcp_udp();
        }
        self.protocol == Protocol::Any || self.protocol == proto
    }

    pub fn validate(&self) -> Result<(), NatError> {
        let invalid = |reason: &str| NatError::InvalidRule {
            reason: format!("{}: {reason}", self.id),
        };

        self.id.validate().map_err(|reason| NatError::InvalidRule {
            reason: reason.to_string(),
        })?;

        if let Some(range) = self.ports
            && (range.start == 0 || range.is_empty())
        {
            return Err(NatError::InvalidPortRange {
                start: range.start,
                end: range.end,
            });
        }

        if self.mode.is_map() && self.flags.negate_src {
            return Err(invalid("outbound rules cannot negate the source match"));
        }
        if self.mode.is_redirect() && self.flags.negate_dst {
            return Err(invalid("inbound rules cannot negate the destination match"));
        }

        if let Some(end) = self.outside_range_end {
            if self.mode != NatMode::Map {
                return Err(invalid("address ranges are only valid for map rules"));
            }
            if u32::from(end) < u32::from(self.outside.addr()) {
                return Err(invalid("address range end precedes its start"));
            }
        }

        match self.mode {
            NatMode::Bimap => {
                if self.inside.prefix_len() != self.outside.prefix_len() {
                    return Err(invalid("bimap networks must have the same size"));
                }
            }
            NatMode::MapBlock => {
                if self.outside.is_interface_address() || self.outside.is_passthrough() {
                    return Err(invalid("map-block needs a real outside network"));
                }
                let (ippip, ppip) = self.map_block_geometry();
                if ppip == 0 {
                    return Err(invalid("map-block needs at least one port per host"));
                }
                if u64::from(ippip) * u64::from(ppip) > u64::from(USABLE_PORTS) {
                    return Err(invalid("map-block ports per host exceed the usable port space"));
                }
            }
            NatMode::Redirect => {
                if self.flags.auto_portmap {
                    return Err(invalid("automatic port mapping is only valid for map rules"));
                }
            }
            NatMode::Map => {}
        }

        if self.is_split() && self.mode != NatMode::Redirect {
            return Err(invalid("split targets are only valid for redirect rules"));
        }
        if self.target_port == Some(0) {
            return Err(invalid("target port must be > 0"));
        }
        if self.flags.auto_portmap && !self.is_tcp_udp() {
            return Err(invalid("automatic port mapping needs tcp or udp"));
        }
        if let Some(age) = self.age
            && age.forward_secs == 0
            && age.reverse_secs != 0
        {
            return Err(invalid("a reverse age needs a forward age"));
        }
        if self.mss_clamp == Some(0) {
            return Err(invalid("mss clamp must be > 0"));
        }
        if let Some(ref proxy) = self.proxy
            && proxy.label.is_empty()
        {
            return Err(invalid("proxy label must not be empty"));
        }

        Ok(())
    }

    /// Inside addresses per outside address and ports per inside
    /// address, used by map-block and automatic port mapping.
    pub fn map_block_geometry(&self) -> (u32, u32) {
        let inside = self.inside.size();
        let outside = self.outside.size();
        let ippip = u32::try_from((inside / outside).max(1)).unwrap_or(u32::MAX);
        let ppip = match self.ports_per_host {
            Some(PortsPerHost::Fixed(n)) => n,
            Some(PortsPerHost::Auto) | None => USABLE_PORTS / ippip,
        };
        (ippip, ppip)
    }
}

// ── Session ─────────────────────────────────────────────────────────

/// Identifier of a session in the session arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address and port (or ICMP query id) of one side of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(addr: Ipv4Addr, port: u16) -> Self {
        Self { addr, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// Ports not yet known when a session was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WildPorts {
    /// Inside/outside port (they are equal until bound).
    pub local: bool,
    /// Remote peer port.
    pub remote: bool,
}

impl WildPorts {
    pub fn any(self) -> bool {
        self.local || self.remote
    }
}

/// Serializable snapshot of a session, used for listing and for
/// external state synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub protocol: Protocol,
    pub inside: Endpoint,
    pub outside: Endpoint,
    pub remote: Endpoint,
    pub direction: Direction,
    pub rule: Option<RuleId>,
    pub interface: String,
    #[serde(default)]
    pub wild: WildPorts,
    #[serde(default)]
    pub clone_template: bool,
    #[serde(default)]
    pub tcp_state: [u8; 2],
    pub bytes: [u64; 2],
    pub packets: [u64; 2],
    /// Seconds until expiry at the time of the snapshot.
    pub expires_in: u64,
}

/// A flow a payload proxy expects to see, created as a wildcard session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedFlow {
    pub protocol: Protocol,
    pub inside: Endpoint,
    pub outside: Endpoint,
    pub remote: Endpoint,
    pub direction: Direction,
    pub wild: WildPorts,
    /// Each matching flow gets its own copy; the expectation stays.
    pub clone_template: bool,
}

/// Result of `lookup_redirect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectLookup {
    pub session: SessionId,
    pub inside: Endpoint,
    pub outside: Endpoint,
    pub remote: Endpoint,
}

// ── Statistics ──────────────────────────────────────────────────────

/// Point-in-time engine counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatStatsSnapshot {
    pub sessions_added: u64,
    pub sessions_in_use: u64,
    pub sessions_expired: u64,
    pub sessions_retired: u64,
    pub wildcards: u64,
    pub bad_nat: u64,
    pub table_full: u64,
    pub bucket_overflows: u64,
    pub malformed: u64,
    pub translated_outbound: u64,
    pub translated_inbound: u64,
    pub rules: u64,
    pub hostmaps: u64,
    pub longest_bucket: [usize; 2],
    pub rule_stats: Vec<RuleStats>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleStats {
    pub id: RuleId,
    pub hits: u64,
    pub in_use: u32,
    pub space: u32,
    pub pending_delete: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn make_map_rule(id: &str) -> NatRule {
        NatRule::new(
            id,
            NatMode::Map,
            net("10.0.0.0/24"),
            net("192.0.2.1/32"),
        )
    }

    // ── Ipv4Net ────────────────────────────────────────────────────

    #[test]
    fn net_masks_host_bits() {
        let n = net("10.0.0.77/24");
        assert_eq!(n.addr(), Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(n.mask(), 0xFFFF_FF00);
        assert!(n.contains(Ipv4Addr::new(10, 0, 0, 200)));
        assert!(!n.contains(Ipv4Addr::new(10, 0, 1, 1)));
    }

    #[test]
    fn net_special_forms() {
        assert!(net("0.0.0.0/32").is_interface_address());
        assert!(net("0.0.0.0/0").is_passthrough());
        assert_eq!(net("0.0.0.0/0").mask(), 0);
        assert_eq!(net("192.0.2.1").prefix_len(), 32);
    }

    #[test]
    fn net_rejects_bad_prefix() {
        assert!("10.0.0.0/33".parse::<Ipv4Net>().is_err());
        assert!("10.0.0/8".parse::<Ipv4Net>().is_err());
    }

    #[test]
    fn net_serde_as_string() {
        let n = net("10.1.0.0/16");
        let yaml = serde_yaml_ng::to_string(&n).unwrap();
        assert_eq!(yaml.trim(), "10.1.0.0/16");
        let back: Ipv4Net = serde_yaml_ng::from_str(&yaml).unwrap();
        assert_eq!(back, n);
    }

    // ── PortRange ──────────────────────────────────────────────────

    #[test]
    fn port_range_len_and_contains() {
        let r = PortRange {
            start: 20000,
            end: 29999,
        };
        assert_eq!(r.len(), 10_000);
        assert!(r.contains(25000));
        assert!(!r.contains(30000));
    }

    // ── Rule validation ────────────────────────────────────────────

    #[test]
    fn valid_map_rule() {
        assert!(make_map_rule("map-1").validate().is_ok());
    }

    #[test]
    fn zero_port_range_rejected() {
        let mut rule = make_map_rule("map-1");
        rule.ports = Some(PortRange { start: 0, end: 100 });
        assert!(matches!(
            rule.validate(),
            Err(NatError::InvalidPortRange { .. })
        ));
    }

    #[test]
    fn map_rule_cannot_negate_source() {
        let mut rule = make_map_rule("map-1");
        rule.flags.negate_src = true;
        assert!(rule.validate().is_err());
        rule.flags.negate_src = false;
        rule.flags.negate_dst = true;
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn bimap_needs_equal_sizes() {
        let rule = NatRule::new(
            "bimap-1",
            NatMode::Bimap,
            net("10.0.0.0/24"),
            net("192.0.2.0/25"),
        );
        assert!(rule.validate().is_err());
    }

    #[test]
    fn reverse_age_without_forward_rejected() {
        let mut rule = make_map_rule("map-1");
        rule.age = Some(AgeOverride {
            forward_secs: 0,
            reverse_secs: 30,
        });
        assert!(rule.validate().is_err());
    }

    #[test]
    fn auto_portmap_needs_tcp_udp() {
        let mut rule = make_map_rule("map-1");
        rule.flags.auto_portmap = true;
        assert!(rule.validate().is_err());
        rule.flags.tcp_udp = true;
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn map_block_geometry_auto() {
        let mut rule = NatRule::new(
            "mb-1",
            NatMode::MapBlock,
            net("10.0.0.0/24"),
            net("192.0.2.0/30"),
        );
        rule.ports_per_host = Some(PortsPerHost::Auto);
        // 256 inside hosts over 4 outside addresses.
        assert_eq!(rule.map_block_geometry(), (64, USABLE_PORTS / 64));
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn map_block_too_many_ports_rejected() {
        let mut rule = NatRule::new(
            "mb-1",
            NatMode::MapBlock,
            net("10.0.0.0/24"),
            net("192.0.2.0/30"),
        );
        rule.ports_per_host = Some(PortsPerHost::Fixed(2000));
        assert!(rule.validate().is_err());
    }

    #[test]
    fn protocol_matching() {
        let mut rule = make_map_rule("map-1");
        assert!(rule.matches_protocol(Protocol::Icmp));
        rule.flags.tcp_udp = true;
        assert!(rule.matches_protocol(Protocol::Udp));
        assert!(!rule.matches_protocol(Protocol::Icmp));
        rule.flags.tcp_udp = false;
        rule.protocol = Protocol::Tcp;
        assert!(!rule.matches_protocol(Protocol::Udp));
    }
}
