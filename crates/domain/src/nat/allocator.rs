//! Address and port selection for new sessions.

use std::net::Ipv4Addr;

use super::entity::{Endpoint, NatMode, MAPBLOCK_MIN_PORT};
use super::error::NatError;
use super::hostmap::{HostmapId, HostmapTable};
use super::rules::{RuleEntry, RuleKey, RuleSet};
use super::table::{FlowKey, Lookup, LookupMode, PortKind, SessionTable, Side};

/// Outside endpoint chosen for an outbound flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapAllocation {
    pub outside: Endpoint,
    pub hostmap: Option<HostmapId>,
    /// Set when the address was taken from an interface.
    pub address_interface: Option<String>,
}

/// Result of redirect target selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectOutcome {
    Translate {
        /// May differ from the matched rule after a sticky hit.
        rule: RuleKey,
        inside: Endpoint,
        hostmap: Option<HostmapId>,
        /// A round-robin rule may rotate.
        moved: bool,
    },
    /// The rule only filters: leave the packet alone.
    DoNotTranslate,
}

fn exhausted(entry: &RuleEntry) -> NatError {
    NatError::RuleAllocationExhausted {
        rule: entry.rule.id.to_string(),
    }
}

/// Interface whose address a `0/32` rule uses.
fn address_interface<'a>(entry: &'a RuleEntry, flow: &'a FlowKey) -> &'a str {
    entry
        .rule
        .out_interface
        .as_deref()
        .or(entry.rule.interface.as_deref())
        .unwrap_or(&flow.interface)
}

/// Pick an unused outside endpoint for an outbound flow matched by a
/// map, bimap or map-block rule.
///
/// Retries advance the rule's cursors until a free endpoint turns up or
/// every candidate has been tried. Any hostmap reference taken is
/// released on failure.
pub fn allocate_map(
    key: RuleKey,
    entry: &mut RuleEntry,
    hostmaps: &mut HostmapTable,
    table: &SessionTable,
    flow: &FlowKey,
    interface_address: &dyn Fn(&str) -> Option<Ipv4Addr>,
) -> Result<MapAllocation, NatError> {
    let mut hostmap = None;
    let res = search_map(key, entry, hostmaps, table, flow, interface_address, &mut hostmap);
    match res {
        Ok(outside) => {
            let pooled = is_pooled(entry);
            if pooled && hostmap.is_none() {
                let (id, _) =
                    hostmaps.acquire_or_create(key, flow.local.addr, flow.remote.addr, outside.addr, 0);
                hostmap = Some(id);
            }
            let address_interface = entry
                .rule
                .outside
                .is_interface_address()
                .then(|| address_interface(entry, flow).to_string());
            Ok(MapAllocation {
                outside,
                hostmap,
                address_interface,
            })
        }
        Err(e) => {
            if let Some(id) = hostmap {
                hostmaps.release(id);
            }
            Err(e)
        }
    }
}

/// Rules drawing from an address pool, where host-pair affinity applies.
fn is_pooled(entry: &RuleEntry) -> bool {
    let rule = &entry.rule;
    !(is_one_to_one(entry)
        || rule.mode == NatMode::MapBlock
        || rule.outside.is_interface_address()
        || rule.outside.is_passthrough())
}

fn is_one_to_one(entry: &RuleEntry) -> bool {
    entry.rule.mode == NatMode::Bimap
        && entry.rule.inside.prefix_len() == entry.rule.outside.prefix_len()
}

#[allow(clippy::too_many_lines)]
fn search_map(
    key: RuleKey,
    entry: &mut RuleEntry,
    hostmaps: &mut HostmapTable,
    table: &SessionTable,
    flow: &FlowKey,
    interface_address: &dyn Fn(&str) -> Option<Ipv4Addr>,
    hostmap: &mut Option<HostmapId>,
) -> Result<Endpoint, NatError> {
    let src = u32::from(flow.local.addr);
    let sport = u32::from(flow.local.port);
    let tcp_udp = flow.ports == PortKind::TcpUdp;
    let has_ports = flow.has_ports();

    let mode = entry.rule.mode;
    let in_mask = entry.rule.inside.mask();
    let out_mask = entry.rule.outside.mask();
    let out_ip = u32::from(entry.rule.outside.addr());
    let range_end = entry.rule.outside_range_end.map(u32::from);
    let port_range = entry.rule.ports;
    let auto_portmap = entry.rule.flags.auto_portmap;
    let single = out_mask == u32::MAX;
    let pooled = is_pooled(entry);
    let one_to_one = is_one_to_one(entry);

    let start_ip = entry.next_ip;
    let start_port = entry.next_port;

    let mut l: u32 = 0;
    loop {
        if l > entry.capacity {
            return Err(exhausted(entry));
        }

        let mut port: u32 = 0;
        let mut addr = entry.next_ip;

        if pooled {
            if l == 0 {
                if let Some((id, hm)) =
                    hostmaps.acquire(Some(key), flow.local.addr, flow.remote.addr, 0)
                {
                    addr = u32::from(hm.mapped);
                    *hostmap = Some(id);
                }
            } else if l == 1
                && let Some(id) = hostmap.take()
            {
                hostmaps.release(id);
            }
        }

        if single && entry.next_port == 0 && l > 0 {
            return Err(exhausted(entry));
        }

        if one_to_one {
            if l > 0 && entry.next_port == 0 {
                return Err(exhausted(entry));
            }
            addr = out_ip | (src & !in_mask);
        } else if mode == NatMode::MapBlock {
            if l >= entry.ppip || (l > 0 && !tcp_udp) {
                return Err(exhausted(entry));
            }
            let host = src & !in_mask;
            addr = ((host / entry.ippip) & !out_mask).wrapping_add(out_ip);
            if tcp_udp && entry.ppip != 0 {
                port = (sport + l) % entry.ppip
                    + entry.ppip * (host % entry.ippip)
                    + MAPBLOCK_MIN_PORT;
            }
        } else if entry.rule.outside.is_interface_address() {
            if l > 0 {
                return Err(exhausted(entry));
            }
            let ifname = address_interface(entry, flow);
            let resolved = interface_address(ifname).ok_or_else(|| NatError::NoInterfaceAddress {
                interface: ifname.to_string(),
            })?;
            addr = u32::from(resolved);
        } else if entry.rule.outside.is_passthrough() {
            if l > 0 {
                return Err(exhausted(entry));
            }
            addr = src;
        } else if !single && entry.next_port == 0 && (l > 0 || hostmap.is_none()) {
            entry.next_ip = entry.next_ip.wrapping_add(1);
        }

        if tcp_udp && mode != NatMode::MapBlock && auto_portmap {
            let ppip = entry.ppip;
            if l > 0 && ppip != 0 && l % ppip == 0 {
                if l > entry.space {
                    return Err(exhausted(entry));
                } else if l > ppip && !single {
                    entry.next_ip = entry.next_ip.wrapping_add(1);
                }
            }
            if ppip != 0 {
                port = (sport + l % ppip) % ppip + ppip * (src % entry.ippip) + MAPBLOCK_MIN_PORT;
            }
        } else if mode != NatMode::MapBlock
            && has_ports
            && entry.next_port != 0
            && let Some(range) = port_range
        {
            port = entry.next_port;
            entry.next_port += 1;
            if entry.next_port > u32::from(range.end) {
                entry.next_port = u32::from(range.start);
                if !single {
                    entry.next_ip = entry.next_ip.wrapping_add(1);
                }
            }
        }

        if let Some(end) = range_end {
            if entry.next_ip > end {
                entry.next_ip = out_ip;
            }
        } else if !single && (entry.next_ip.wrapping_add(1) & out_mask) > out_ip {
            entry.next_ip = out_ip.wrapping_add(1);
        }

        if port == 0 && has_ports {
            port = sport;
        }

        let outside = Endpoint::new(Ipv4Addr::from(addr), (port & 0xFFFF) as u16);
        let probe = FlowKey {
            direction: flow.direction.reverse(),
            protocol: flow.protocol,
            interface: flow.interface.clone(),
            local: outside,
            remote: flow.remote,
            ports: flow.ports,
        };
        if table.find(Side::Outside, &probe, LookupMode::Exact) == Lookup::Miss {
            return Ok(outside);
        }

        // Cursor wrapped back to where this search began.
        if entry.next_port != 0
            && start_port == entry.next_port
            && entry.next_ip != 0
            && start_ip == entry.next_ip
        {
            return Err(exhausted(entry));
        }
        // Address-only pool went all the way round.
        if pooled && !single && entry.next_port == 0 && l > 0 && start_ip == entry.next_ip {
            return Err(exhausted(entry));
        }
        l += 1;
    }
}

/// Pick the inside target of an inbound flow matched by a redirect or
/// bimap rule.
pub fn allocate_redirect(
    rules: &mut RuleSet,
    key: RuleKey,
    hostmaps: &mut HostmapTable,
    flow: &FlowKey,
    interface_address: &dyn Fn(&str) -> Option<Ipv4Addr>,
) -> Result<RedirectOutcome, NatError> {
    let src = flow.remote.addr;
    let dst = flow.local.addr;
    let dport = flow.local.port;

    let mut key = key;
    let mut moved = true;
    let mut hostmap: Option<HostmapId> = None;
    let mut sticky_addr: Option<Ipv4Addr> = None;

    let Some(entry) = rules.get(key) else {
        return Err(NatError::RuleAllocationExhausted {
            rule: format!("{key:?}"),
        });
    };
    let flags = entry.rule.flags;

    // Sticky round-robin: stay with whichever rule served this pair before.
    if flags.round_robin
        && flags.sticky
        && let Some((id, hm)) = hostmaps.acquire(None, src, dst, dport)
    {
        if rules.get(hm.rule).is_some_and(|e| !e.is_deleting()) {
            key = hm.rule;
            sticky_addr = Some(hm.mapped);
            hostmap = Some(id);
            moved = false;
        } else {
            hostmaps.release(id);
        }
    }

    let Some(entry) = rules.get_mut(key) else {
        if let Some(id) = hostmap {
            hostmaps.release(id);
        }
        return Err(NatError::RuleAllocationExhausted {
            rule: format!("{key:?}"),
        });
    };
    let rule = &entry.rule;

    let addr = if let Some(addr) = sticky_addr {
        addr
    } else if let Some(second) = rule.split_target {
        let first = rule.inside.addr();
        let mut addr = Ipv4Addr::from(entry.next_ip);
        let mut refs = None;
        if flags.sticky && !flags.round_robin {
            let (id, hm) = hostmaps.acquire_or_create(key, src, dst, addr, dport);
            addr = hm.mapped;
            refs = Some(hm.refs());
            hostmap = Some(id);
            moved = false;
        }
        if refs.is_none_or(|r| r == 1) {
            if addr == first {
                entry.next_ip = u32::from(second);
                moved = false;
            } else {
                entry.next_ip = u32::from(first);
            }
        }
        addr
    } else if rule.inside.is_interface_address() {
        let ifname = rule
            .out_interface
            .as_deref()
            .or(rule.interface.as_deref())
            .unwrap_or(&flow.interface);
        match interface_address(ifname) {
            Some(a) => a,
            None => {
                return Err(NatError::NoInterfaceAddress {
                    interface: ifname.to_string(),
                });
            }
        }
    } else if rule.inside.is_passthrough() {
        dst
    } else if rule.mode == NatMode::Bimap && rule.inside.prefix_len() == rule.outside.prefix_len() {
        Ipv4Addr::from(u32::from(rule.inside.addr()) | (u32::from(dst) & !rule.inside.mask()))
    } else {
        rule.inside.addr()
    };

    let nport = match (flow.ports, rule.target_port) {
        (PortKind::TcpUdp, Some(tp)) => match rule.ports {
            Some(range) if !flags.fixed_dport && range.start != range.end => {
                dport.wrapping_sub(range.start).wrapping_add(tp)
            }
            _ => tp,
        },
        _ => dport,
    };

    let addr = if addr.is_unspecified() {
        if nport == dport {
            if let Some(id) = hostmap {
                hostmaps.release(id);
            }
            return Ok(RedirectOutcome::DoNotTranslate);
        }
        dst
    } else {
        addr
    };

    if flags.round_robin && flags.sticky && hostmap.is_none() {
        let (id, _) = hostmaps.acquire_or_create(key, src, dst, addr, dport);
        hostmap = Some(id);
    }

    Ok(RedirectOutcome::Translate {
        rule: key,
        inside: Endpoint::new(addr, nport),
        hostmap,
        moved,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::entity::Protocol;
    use crate::nat::entity::{Direction, Ipv4Net, NatRule, PortRange, PortsPerHost, WildPorts};
    use crate::nat::table::SessionSeed;

    // ── Test helpers ──────────────────────────────────────────────

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn no_iface(_: &str) -> Option<Ipv4Addr> {
        None
    }

    fn out_flow(proto: Protocol, src: &str, sport: u16, dst: &str, dport: u16) -> FlowKey {
        FlowKey::new(
            Direction::Outbound,
            proto,
            "if0",
            (ip(src), sport),
            (ip(dst), dport),
            PortKind::TcpUdp,
        )
    }

    fn in_flow(src: &str, sport: u16, dst: &str, dport: u16) -> FlowKey {
        FlowKey::new(
            Direction::Inbound,
            Protocol::Tcp,
            "if0",
            (ip(dst), dport),
            (ip(src), sport),
            PortKind::TcpUdp,
        )
    }

    struct Fixture {
        rules: RuleSet,
        hostmaps: HostmapTable,
        table: SessionTable,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                rules: RuleSet::new(),
                hostmaps: HostmapTable::new(),
                table: SessionTable::new(2047, 22, 30_000),
            }
        }

        fn map(&mut self, key: RuleKey, flow: &FlowKey) -> Result<MapAllocation, NatError> {
            let Self {
                rules,
                hostmaps,
                table,
            } = self;
            let entry = rules.get_mut(key).unwrap();
            allocate_map(key, entry, hostmaps, table, flow, &no_iface)
        }

        /// Allocate and record the session so later probes see it.
        fn map_and_insert(&mut self, key: RuleKey, flow: &FlowKey) -> Result<Endpoint, NatError> {
            let alloc = self.map(key, flow)?;
            self.table
                .insert(SessionSeed {
                    protocol: flow.protocol,
                    inside: flow.local,
                    outside: alloc.outside,
                    remote: flow.remote,
                    direction: Direction::Outbound,
                    rule: Some(key),
                    interface: flow.interface.clone(),
                    wild: WildPorts::default(),
                    clone_template: false,
                    ports: flow.ports,
                    mss_clamp: None,
                    proxy: None,
                    address_interface: None,
                    hostmap: alloc.hostmap,
                })
                .unwrap();
            self.rules.acquire(key);
            Ok(alloc.outside)
        }
    }

    // ── Map ───────────────────────────────────────────────────────

    #[test]
    fn single_address_port_range_cycles() {
        let mut fx = Fixture::new();
        let mut rule = NatRule::new("m1", NatMode::Map, net("10.0.0.0/24"), net("192.0.2.1/32"));
        rule.protocol = Protocol::Tcp;
        rule.ports = Some(PortRange {
            start: 20000,
            end: 20002,
        });
        let key = fx.rules.insert(rule).unwrap();

        let mut ports = Vec::new();
        for sport in 1000..1003 {
            let flow = out_flow(Protocol::Tcp, "10.0.0.5", sport, "8.8.8.8", 80);
            let out = fx.map_and_insert(key, &flow).unwrap();
            assert_eq!(out.addr, ip("192.0.2.1"));
            ports.push(out.port);
        }
        assert_eq!(ports, vec![20000, 20001, 20002]);

        // Every port towards this peer is taken now.
        let flow = out_flow(Protocol::Tcp, "10.0.0.5", 1003, "8.8.8.8", 80);
        assert!(matches!(
            fx.map(key, &flow),
            Err(NatError::RuleAllocationExhausted { .. })
        ));
        // A different peer can reuse them.
        let flow = out_flow(Protocol::Tcp, "10.0.0.5", 1003, "8.8.4.4", 80);
        assert_eq!(fx.map_and_insert(key, &flow).unwrap().port, 20000);
    }

    #[test]
    fn single_address_without_ports_keeps_source_port() {
        let mut fx = Fixture::new();
        let key = fx
            .rules
            .insert(NatRule::new("m1", NatMode::Map, net("10.0.0.0/24"), net("192.0.2.1/32")))
            .unwrap();
        let flow = out_flow(Protocol::Tcp, "10.0.0.5", 5555, "8.8.8.8", 80);
        let out = fx.map_and_insert(key, &flow).unwrap();
        assert_eq!(out, Endpoint::new(ip("192.0.2.1"), 5555));

        // Same source port from another host collides and cannot retry.
        let flow = out_flow(Protocol::Tcp, "10.0.0.6", 5555, "8.8.8.8", 80);
        assert!(fx.map(key, &flow).is_err());
        assert_eq!(fx.hostmaps.len(), 1);
    }

    #[test]
    fn pool_advances_and_hostmap_keeps_affinity() {
        let mut fx = Fixture::new();
        let key = fx
            .rules
            .insert(NatRule::new("m1", NatMode::Map, net("10.0.0.0/24"), net("192.0.2.0/29")))
            .unwrap();

        let a = fx
            .map_and_insert(key, &out_flow(Protocol::Tcp, "10.0.0.5", 1000, "8.8.8.8", 80))
            .unwrap();
        let b = fx
            .map_and_insert(key, &out_flow(Protocol::Tcp, "10.0.0.6", 1000, "8.8.8.8", 80))
            .unwrap();
        assert_eq!(a.addr, ip("192.0.2.1"));
        assert_eq!(b.addr, ip("192.0.2.2"));

        // Same host pair reuses its address.
        let again = fx
            .map_and_insert(key, &out_flow(Protocol::Tcp, "10.0.0.5", 1001, "8.8.8.8", 80))
            .unwrap();
        assert_eq!(again.addr, ip("192.0.2.1"));
    }

    #[test]
    fn pool_skips_broadcast() {
        let mut fx = Fixture::new();
        let key = fx
            .rules
            .insert(NatRule::new("m1", NatMode::Map, net("10.0.0.0/24"), net("192.0.2.0/30")))
            .unwrap();
        let mut seen = Vec::new();
        for host in 1..=4u8 {
            let src = format!("10.0.0.{host}");
            let sport = 1000 + u16::from(host);
            let out = fx
                .map_and_insert(key, &out_flow(Protocol::Udp, &src, sport, "8.8.8.8", 53))
                .unwrap();
            seen.push(out.addr);
        }
        assert_eq!(
            seen,
            vec![ip("192.0.2.1"), ip("192.0.2.2"), ip("192.0.2.1"), ip("192.0.2.2")]
        );
    }

    #[test]
    fn bimap_is_one_to_one() {
        let mut fx = Fixture::new();
        let key = fx
            .rules
            .insert(NatRule::new("b1", NatMode::Bimap, net("10.0.0.0/24"), net("192.0.2.0/24")))
            .unwrap();
        let out = fx
            .map_and_insert(key, &out_flow(Protocol::Tcp, "10.0.0.77", 4000, "8.8.8.8", 80))
            .unwrap();
        assert_eq!(out, Endpoint::new(ip("192.0.2.77"), 4000));
        assert!(fx.hostmaps.is_empty());
    }

    #[test]
    fn map_block_is_deterministic() {
        let mut fx = Fixture::new();
        let mut rule = NatRule::new("mb", NatMode::MapBlock, net("10.0.0.0/24"), net("192.0.2.0/30"));
        rule.ports_per_host = Some(PortsPerHost::Fixed(100));
        let key = fx.rules.insert(rule).unwrap();
        // 64 inside hosts per outside address.
        let out = fx
            .map_and_insert(key, &out_flow(Protocol::Tcp, "10.0.0.70", 5000, "8.8.8.8", 80))
            .unwrap();
        // host 70: address 70 / 64 = 1, block 70 % 64 = 6.
        assert_eq!(out.addr, ip("192.0.2.1"));
        assert_eq!(u32::from(out.port), 5000 % 100 + 100 * 6 + MAPBLOCK_MIN_PORT);

        // A colliding flow moves to the next port of the same block.
        let flow = out_flow(Protocol::Tcp, "10.0.0.70", 5100, "8.8.8.8", 80);
        let next = fx.map_and_insert(key, &flow).unwrap();
        assert_eq!(u32::from(next.port), 1 + 100 * 6 + MAPBLOCK_MIN_PORT);
    }

    #[test]
    fn auto_portmap_derives_port() {
        let mut fx = Fixture::new();
        let mut rule = NatRule::new("m1", NatMode::Map, net("10.0.0.0/24"), net("192.0.2.1/32"));
        rule.flags.tcp_udp = true;
        rule.flags.auto_portmap = true;
        let key = fx.rules.insert(rule).unwrap();
        let entry = fx.rules.get(key).unwrap();
        let (ippip, ppip) = (entry.ippip, entry.ppip);
        assert_eq!(ippip, 256);

        let out = fx
            .map_and_insert(key, &out_flow(Protocol::Tcp, "10.0.0.9", 777, "8.8.8.8", 80))
            .unwrap();
        let src = u32::from(ip("10.0.0.9"));
        assert_eq!(
            u32::from(out.port),
            777 % ppip + ppip * (src % ippip) + MAPBLOCK_MIN_PORT
        );
    }

    #[test]
    fn passthrough_keeps_source() {
        let mut fx = Fixture::new();
        let key = fx
            .rules
            .insert(NatRule::new("m1", NatMode::Map, net("10.0.0.0/24"), net("0.0.0.0/0")))
            .unwrap();
        let out = fx
            .map_and_insert(key, &out_flow(Protocol::Udp, "10.0.0.9", 53, "8.8.8.8", 53))
            .unwrap();
        assert_eq!(out, Endpoint::new(ip("10.0.0.9"), 53));
    }

    #[test]
    fn interface_address_resolved() {
        let mut fx = Fixture::new();
        let mut rule = NatRule::new("m1", NatMode::Map, net("10.0.0.0/24"), net("0.0.0.0/32"));
        rule.interface = Some("wan0".into());
        let key = fx.rules.insert(rule).unwrap();
        let flow = out_flow(Protocol::Udp, "10.0.0.9", 53, "8.8.8.8", 53);

        let entry = fx.rules.get_mut(key).unwrap();
        let resolve = |name: &str| (name == "wan0").then(|| ip("198.51.100.1"));
        let alloc = allocate_map(key, entry, &mut fx.hostmaps, &fx.table, &flow, &resolve).unwrap();
        assert_eq!(alloc.outside.addr, ip("198.51.100.1"));
        assert_eq!(alloc.address_interface.as_deref(), Some("wan0"));

        let err = fx.map(key, &flow).unwrap_err();
        assert_eq!(
            err,
            NatError::NoInterfaceAddress {
                interface: "wan0".into()
            }
        );
    }

    // ── Redirect ──────────────────────────────────────────────────

    fn rdr_rule(id: &str) -> NatRule {
        let mut rule = NatRule::new(id, NatMode::Redirect, net("10.0.0.10/32"), net("203.0.113.1/32"));
        rule.protocol = Protocol::Tcp;
        rule
    }

    #[test]
    fn redirect_port_offset_and_fixed() {
        let mut fx = Fixture::new();
        let mut rule = rdr_rule("r1");
        rule.ports = Some(PortRange {
            start: 8000,
            end: 8010,
        });
        rule.target_port = Some(9000);
        let key = fx.rules.insert(rule).unwrap();
        let flow = in_flow("198.51.100.9", 40000, "203.0.113.1", 8005);
        let res = allocate_redirect(&mut fx.rules, key, &mut fx.hostmaps, &flow, &no_iface).unwrap();
        let RedirectOutcome::Translate { inside, .. } = res else {
            panic!("expected translation");
        };
        assert_eq!(inside, Endpoint::new(ip("10.0.0.10"), 9005));

        let mut rule = rdr_rule("r2");
        rule.outside = net("203.0.113.2/32");
        rule.ports = Some(PortRange {
            start: 8000,
            end: 8010,
        });
        rule.target_port = Some(9000);
        rule.flags.fixed_dport = true;
        let key = fx.rules.insert(rule).unwrap();
        let flow = in_flow("198.51.100.9", 40000, "203.0.113.2", 8005);
        let res = allocate_redirect(&mut fx.rules, key, &mut fx.hostmaps, &flow, &no_iface).unwrap();
        assert!(matches!(
            res,
            RedirectOutcome::Translate { inside, .. } if inside.port == 9000
        ));
    }

    #[test]
    fn redirect_without_target_port_keeps_port() {
        let mut fx = Fixture::new();
        let key = fx.rules.insert(rdr_rule("r1")).unwrap();
        let flow = in_flow("198.51.100.9", 40000, "203.0.113.1", 443);
        let res = allocate_redirect(&mut fx.rules, key, &mut fx.hostmaps, &flow, &no_iface).unwrap();
        assert!(matches!(
            res,
            RedirectOutcome::Translate { inside, .. } if inside == Endpoint::new(ip("10.0.0.10"), 443)
        ));
    }

    #[test]
    fn zero_target_with_same_port_does_not_translate() {
        let mut fx = Fixture::new();
        let mut rule = rdr_rule("r1");
        rule.inside = net("0.0.0.0/8");
        let key = fx.rules.insert(rule).unwrap();
        let flow = in_flow("198.51.100.9", 40000, "203.0.113.1", 80);
        let res = allocate_redirect(&mut fx.rules, key, &mut fx.hostmaps, &flow, &no_iface).unwrap();
        assert_eq!(res, RedirectOutcome::DoNotTranslate);
    }

    #[test]
    fn split_alternates_targets() {
        let mut fx = Fixture::new();
        let mut rule = rdr_rule("r1");
        rule.split_target = Some(ip("10.0.0.11"));
        let key = fx.rules.insert(rule).unwrap();

        let mut targets = Vec::new();
        for sport in 0..4 {
            let flow = in_flow("198.51.100.9", 40000 + sport, "203.0.113.1", 80);
            let res = allocate_redirect(&mut fx.rules, key, &mut fx.hostmaps, &flow, &no_iface).unwrap();
            let RedirectOutcome::Translate { inside, .. } = res else {
                panic!("expected translation");
            };
            targets.push(inside.addr);
        }
        assert_eq!(
            targets,
            vec![ip("10.0.0.10"), ip("10.0.0.11"), ip("10.0.0.10"), ip("10.0.0.11")]
        );
    }

    #[test]
    fn sticky_round_robin_returns_same_rule() {
        let mut fx = Fixture::new();
        let mut a = rdr_rule("a");
        a.flags.round_robin = true;
        a.flags.sticky = true;
        let mut b = rdr_rule("b");
        b.inside = net("10.0.0.20/32");
        b.flags.round_robin = true;
        b.flags.sticky = true;
        let ka = fx.rules.insert(a).unwrap();
        let kb = fx.rules.insert(b).unwrap();

        let flow = in_flow("198.51.100.9", 40000, "203.0.113.1", 80);
        let first = allocate_redirect(&mut fx.rules, ka, &mut fx.hostmaps, &flow, &no_iface).unwrap();
        assert!(matches!(first, RedirectOutcome::Translate { rule, moved: true, .. } if rule == ka));

        // The walk now offers rule b first, the hostmap sends it back to a.
        let flow = in_flow("198.51.100.9", 40001, "203.0.113.1", 80);
        let second = allocate_redirect(&mut fx.rules, kb, &mut fx.hostmaps, &flow, &no_iface).unwrap();
        let RedirectOutcome::Translate {
            rule,
            inside,
            moved,
            ..
        } = second
        else {
            panic!("expected translation");
        };
        assert_eq!(rule, ka);
        assert_eq!(inside.addr, ip("10.0.0.10"));
        assert!(!moved);
    }
}
