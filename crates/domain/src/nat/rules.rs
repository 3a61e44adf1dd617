use std::collections::HashMap;

use crate::common::entity::RuleId;

use super::entity::{Direction, Ipv4Net, NatMode, NatRule, USABLE_PORTS};
use super::error::NatError;
use super::table::{FlowKey, PortKind};

/// Internal handle of an installed rule. Stays valid while the rule is
/// pending deletion so live sessions can still reach it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleKey(pub(crate) u32);

/// An installed rule plus its allocation state.
#[derive(Debug, Clone)]
pub struct RuleEntry {
    pub rule: NatRule,
    /// Next outside address to hand out (map) or next split target (rdr).
    pub(crate) next_ip: u32,
    /// Next port of the port range, 0 when the rule has none.
    pub(crate) next_port: u32,
    /// Translations still available.
    pub(crate) space: u32,
    /// Translations available when the rule was installed.
    pub(crate) capacity: u32,
    /// Inside addresses per outside address.
    pub(crate) ippip: u32,
    /// Ports per inside address.
    pub(crate) ppip: u32,
    pub(crate) in_use: u32,
    pub(crate) hits: u64,
    pub(crate) deleting: bool,
}

impl RuleEntry {
    fn new(rule: NatRule) -> Self {
        let (ippip, ppip) = rule.map_block_geometry();
        let space = initial_space(&rule);
        let next_ip = initial_next_ip(&rule);
        let next_port = match (rule.mode.is_map(), rule.ports) {
            (true, Some(range)) => u32::from(range.start),
            _ => 0,
        };
        Self {
            rule,
            next_ip,
            next_port,
            space,
            capacity: space.max(1),
            ippip: ippip.max(1),
            ppip,
            in_use: 0,
            hits: 0,
            deleting: false,
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn in_use(&self) -> u32 {
        self.in_use
    }

    pub fn space(&self) -> u32 {
        self.space
    }

    pub fn is_deleting(&self) -> bool {
        self.deleting
    }
}

/// Number of translations a rule can provide.
fn initial_space(rule: &NatRule) -> u32 {
    let out_mask = rule.outside.mask();
    let in_mask = rule.inside.mask();
    let out_ip = u32::from(rule.outside.addr());

    let mut space = if rule.mode == NatMode::MapBlock {
        USABLE_PORTS.wrapping_mul(!out_mask)
    } else if rule.flags.auto_portmap {
        USABLE_PORTS.wrapping_mul(!in_mask)
    } else if let Some(end) = rule.outside_range_end {
        u32::from(end).wrapping_sub(out_ip)
    } else if rule.is_split() {
        2
    } else if out_mask != 0 {
        !out_mask
    } else {
        1
    };

    // Networks lose network and broadcast; ranges are inclusive.
    space = match space {
        0 => 1,
        n if rule.is_ip_range() => n.saturating_add(1),
        n => n - 1,
    };

    if matches!(rule.mode, NatMode::Map | NatMode::Bimap) {
        if let Some(range) = rule.ports {
            space = space.saturating_mul(range.len());
        }
        if in_mask != 0 && in_mask != u32::MAX {
            space = space.saturating_mul((!in_mask).wrapping_add(1));
        }
        // One mapping per protocol when the rule is not protocol specific.
        if !rule.is_tcp_udp() && rule.protocol != crate::common::entity::Protocol::Icmp {
            space = space.saturating_mul(256);
        }
    }
    space
}

fn initial_next_ip(rule: &NatRule) -> u32 {
    let out_mask = rule.outside.mask();
    let out_ip = u32::from(rule.outside.addr());
    if out_mask != u32::MAX && out_mask != 0 && !rule.is_ip_range() && !rule.is_split() {
        out_ip.wrapping_add(1)
    } else if rule.is_split() && rule.mode.is_redirect() {
        u32::from(rule.inside.addr())
    } else {
        out_ip
    }
}

// ── Prefix index ────────────────────────────────────────────────────

/// Rules hashed by their indexed network, walked from the longest
/// configured prefix to the shortest.
#[derive(Debug)]
struct PrefixIndex {
    /// Bit `n` set when at least one rule uses prefix length `n`.
    lengths: u64,
    per_length: [u32; 33],
    buckets: HashMap<(u8, u32), Vec<RuleKey>>,
}

// `Default` is only derived for arrays up to 32 elements.
impl Default for PrefixIndex {
    fn default() -> Self {
        Self {
            lengths: 0,
            per_length: [0; 33],
            buckets: HashMap::new(),
        }
    }
}

impl PrefixIndex {
    fn bucket_key(net: Ipv4Net) -> (u8, u32) {
        (net.prefix_len(), u32::from(net.addr()))
    }

    fn insert(&mut self, net: Ipv4Net, key: RuleKey) {
        let len = usize::from(net.prefix_len());
        self.buckets
            .entry(Self::bucket_key(net))
            .or_default()
            .push(key);
        self.per_length[len] += 1;
        self.lengths |= 1 << len;
    }

    fn remove(&mut self, net: Ipv4Net, key: RuleKey) {
        let bk = Self::bucket_key(net);
        let Some(bucket) = self.buckets.get_mut(&bk) else {
            return;
        };
        let before = bucket.len();
        bucket.retain(|k| *k != key);
        if bucket.len() == before {
            return;
        }
        if bucket.is_empty() {
            self.buckets.remove(&bk);
        }
        let len = usize::from(net.prefix_len());
        self.per_length[len] -= 1;
        if self.per_length[len] == 0 {
            self.lengths &= !(1 << len);
        }
    }

    /// Move `key` to the back of its bucket.
    fn rotate(&mut self, net: Ipv4Net, key: RuleKey) {
        if let Some(bucket) = self.buckets.get_mut(&Self::bucket_key(net))
            && let Some(pos) = bucket.iter().position(|k| *k == key)
        {
            let k = bucket.remove(pos);
            bucket.push(k);
        }
    }

    fn candidates(&self, addr: std::net::Ipv4Addr) -> Vec<RuleKey> {
        let mut out = Vec::new();
        let ip = u32::from(addr);
        for len in (0..=32u8).rev() {
            if self.lengths & (1 << len) == 0 {
                continue;
            }
            let masked = ip & super::entity::prefix_mask(len);
            if let Some(bucket) = self.buckets.get(&(len, masked)) {
                out.extend_from_slice(bucket);
            }
        }
        out
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

// ── Rule set ────────────────────────────────────────────────────────

/// Installed rules: configuration order plus the outbound (map) and
/// inbound (redirect) prefix indexes.
#[derive(Debug, Default)]
pub struct RuleSet {
    entries: HashMap<RuleKey, RuleEntry>,
    order: Vec<RuleKey>,
    by_id: HashMap<RuleId, RuleKey>,
    outbound: PrefixIndex,
    inbound: PrefixIndex,
    next_key: u32,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and install a rule at the end of the configuration order.
    pub fn insert(&mut self, rule: NatRule) -> Result<RuleKey, NatError> {
        rule.validate()?;
        if self.by_id.contains_key(&rule.id) {
            return Err(NatError::DuplicateRule {
                id: rule.id.to_string(),
            });
        }

        let key = RuleKey(self.next_key);
        self.next_key = self.next_key.wrapping_add(1);

        if rule.mode.is_map() {
            self.outbound.insert(rule.inside, key);
        }
        if rule.mode.is_redirect() {
            self.inbound.insert(rule.outside, key);
        }
        self.by_id.insert(rule.id.clone(), key);
        self.order.push(key);
        self.entries.insert(key, RuleEntry::new(rule));
        Ok(key)
    }

    /// Unlink a rule from matching. The entry itself is kept until its
    /// last session goes away. Returns whether it was freed immediately.
    pub fn remove(&mut self, id: &RuleId) -> Result<bool, NatError> {
        let key = self
            .by_id
            .remove(id)
            .ok_or_else(|| NatError::RuleNotFound { id: id.to_string() })?;
        self.order.retain(|k| *k != key);
        let Some(entry) = self.entries.get_mut(&key) else {
            return Ok(true);
        };
        if entry.rule.mode.is_map() {
            self.outbound.remove(entry.rule.inside, key);
        }
        if entry.rule.mode.is_redirect() {
            self.inbound.remove(entry.rule.outside, key);
        }
        if entry.in_use == 0 {
            self.entries.remove(&key);
            Ok(true)
        } else {
            entry.deleting = true;
            Ok(false)
        }
    }

    /// Unlink every rule. Returns how many were removed.
    pub fn clear(&mut self) -> usize {
        let n = self.order.len();
        self.entries.retain(|_, e| {
            e.deleting = true;
            e.in_use > 0
        });
        self.order.clear();
        self.by_id.clear();
        self.outbound.clear();
        self.inbound.clear();
        n
    }

    pub fn get(&self, key: RuleKey) -> Option<&RuleEntry> {
        self.entries.get(&key)
    }

    pub(crate) fn get_mut(&mut self, key: RuleKey) -> Option<&mut RuleEntry> {
        self.entries.get_mut(&key)
    }

    pub fn key_of(&self, id: &RuleId) -> Option<RuleKey> {
        self.by_id.get(id).copied()
    }

    /// Active rules in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &RuleEntry> {
        self.order.iter().filter_map(|k| self.entries.get(k))
    }

    /// Entries still allocated, including those pending deletion.
    pub fn entries(&self) -> impl Iterator<Item = &RuleEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Rules whose indexed network contains `addr`, most specific first,
    /// bucket order within one prefix length.
    pub fn candidates(&self, direction: Direction, addr: std::net::Ipv4Addr) -> Vec<RuleKey> {
        match direction {
            Direction::Outbound => self.outbound.candidates(addr),
            Direction::Inbound => self.inbound.candidates(addr),
        }
    }

    /// Full match predicate beyond the indexed address.
    pub fn matches(
        &self,
        key: RuleKey,
        flow: &FlowKey,
        tag: Option<&str>,
        proxy_known: &dyn Fn(&str) -> bool,
    ) -> bool {
        let Some(entry) = self.entries.get(&key) else {
            return false;
        };
        if entry.deleting {
            return false;
        }
        let rule = &entry.rule;

        if let Some(ref ifname) = rule.interface
            && *ifname != flow.interface
        {
            return false;
        }
        if !rule.matches_protocol(flow.protocol) {
            return false;
        }

        if let Some(ref filter) = rule.filter {
            let (peer_addr, negate) = match flow.direction {
                Direction::Outbound => (flow.dst().addr, rule.flags.negate_dst),
                Direction::Inbound => (flow.src().addr, rule.flags.negate_src),
            };
            if let Some(peer) = filter.peer
                && peer.contains(peer_addr) == negate
            {
                return false;
            }
            if filter.src_ports.is_some() || filter.dst_ports.is_some() {
                if flow.ports != PortKind::TcpUdp {
                    return false;
                }
                if let Some(range) = filter.src_ports
                    && !range.contains(flow.src().port)
                {
                    return false;
                }
                if let Some(range) = filter.dst_ports
                    && !range.contains(flow.dst().port)
                {
                    return false;
                }
            }
        }

        if flow.direction == Direction::Inbound
            && let Some(range) = rule.ports
            && (flow.ports != PortKind::TcpUdp || !range.contains(flow.dst().port))
        {
            return false;
        }

        if let Some(ref want) = rule.tag
            && tag != Some(want.as_str())
        {
            return false;
        }

        if let Some(ref proxy) = rule.proxy {
            if flow.direction == Direction::Outbound
                && rule.filter.is_none()
                && (flow.ports != PortKind::TcpUdp || flow.dst().port != proxy.port)
            {
                return false;
            }
            if !proxy_known(&proxy.label) {
                return false;
            }
        }

        true
    }

    /// Move a round-robin rule behind its peers of equal specificity.
    pub fn rotate(&mut self, key: RuleKey) {
        let Some(entry) = self.entries.get(&key) else {
            return;
        };
        let (mode, inside, outside) = (entry.rule.mode, entry.rule.inside, entry.rule.outside);
        match mode {
            NatMode::Redirect => self.inbound.rotate(outside, key),
            NatMode::Map | NatMode::MapBlock => self.outbound.rotate(inside, key),
            NatMode::Bimap => {}
        }
    }

    /// A session now references the rule.
    pub(crate) fn acquire(&mut self, key: RuleKey) {
        if let Some(e) = self.entries.get_mut(&key) {
            e.in_use += 1;
            e.space = e.space.saturating_sub(1);
        }
    }

    /// A session referencing the rule went away. Frees a rule pending
    /// deletion once nothing uses it.
    pub(crate) fn release(&mut self, key: RuleKey) {
        let Some(e) = self.entries.get_mut(&key) else {
            return;
        };
        e.in_use = e.in_use.saturating_sub(1);
        e.space = e.space.saturating_add(1).min(e.capacity);
        if e.deleting && e.in_use == 0 {
            self.entries.remove(&key);
        }
    }

    pub(crate) fn record_hit(&mut self, key: RuleKey) {
        if let Some(e) = self.entries.get_mut(&key) {
            e.hits += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::common::entity::Protocol;
    use crate::nat::entity::{FilterTuple, PortRange, ProxyBinding};
    use crate::nat::table::FlowKey;

    // ── Test helpers ──────────────────────────────────────────────

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn map_rule(id: &str, inside: &str, outside: &str) -> NatRule {
        NatRule::new(id, NatMode::Map, net(inside), net(outside))
    }

    fn rdr_rule(id: &str, public: &str, target: &str) -> NatRule {
        NatRule::new(id, NatMode::Redirect, net(target), net(public))
    }

    fn out_flow(src: &str, sport: u16, dst: &str, dport: u16) -> FlowKey {
        FlowKey::new(
            Direction::Outbound,
            Protocol::Tcp,
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

    fn any_proxy(_: &str) -> bool {
        true
    }

    fn first_match(set: &RuleSet, flow: &FlowKey, tag: Option<&str>) -> Option<RuleId> {
        let addr = match flow.direction {
            Direction::Outbound => flow.src().addr,
            Direction::Inbound => flow.dst().addr,
        };
        set.candidates(flow.direction, addr)
            .into_iter()
            .find(|k| set.matches(*k, flow, tag, &any_proxy))
            .and_then(|k| set.get(k).map(|e| e.rule.id.clone()))
    }

    // ── Installation ──────────────────────────────────────────────

    #[test]
    fn insert_and_remove() {
        let mut set = RuleSet::new();
        set.insert(map_rule("m1", "10.0.0.0/24", "192.0.2.1/32"))
            .unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.remove(&RuleId("m1".into())).unwrap());
        assert!(set.is_empty());
        assert!(set.remove(&RuleId("m1".into())).is_err());
    }

    #[test]
    fn duplicate_rejected() {
        let mut set = RuleSet::new();
        set.insert(map_rule("m1", "10.0.0.0/24", "192.0.2.1/32"))
            .unwrap();
        let err = set
            .insert(map_rule("m1", "10.1.0.0/24", "192.0.2.1/32"))
            .unwrap_err();
        assert!(matches!(err, NatError::DuplicateRule { .. }));
    }

    #[test]
    fn deferred_delete_while_in_use() {
        let mut set = RuleSet::new();
        let key = set
            .insert(map_rule("m1", "10.0.0.0/24", "192.0.2.1/32"))
            .unwrap();
        set.acquire(key);
        assert!(!set.remove(&RuleId("m1".into())).unwrap());
        assert!(set.get(key).unwrap().is_deleting());
        assert!(set.candidates(Direction::Outbound, ip("10.0.0.1")).is_empty());
        set.release(key);
        assert!(set.get(key).is_none());
    }

    #[test]
    fn host_and_default_prefixes_share_the_index() {
        let mut set = RuleSet::default();
        let any = set.insert(map_rule("any", "0.0.0.0/0", "192.0.2.1/32")).unwrap();
        let host = set.insert(map_rule("host", "10.0.0.7/32", "192.0.2.2/32")).unwrap();

        assert_eq!(set.candidates(Direction::Outbound, ip("10.0.0.7")), vec![host, any]);
        assert_eq!(set.candidates(Direction::Outbound, ip("10.0.0.8")), vec![any]);

        set.remove(&RuleId("host".into())).unwrap();
        assert_eq!(set.candidates(Direction::Outbound, ip("10.0.0.7")), vec![any]);
    }

    // ── Space and cursors ─────────────────────────────────────────

    #[test]
    fn space_for_single_address_with_ports() {
        let mut rule = map_rule("m1", "10.0.0.0/24", "192.0.2.1/32");
        rule.protocol = Protocol::Tcp;
        rule.ports = Some(PortRange {
            start: 20000,
            end: 29999,
        });
        let e = RuleEntry::new(rule);
        // 1 address * 10000 ports * 256 inside hosts.
        assert_eq!(e.space, 10_000 * 256);
        assert_eq!(e.next_port, 20000);
        assert_eq!(e.next_ip, u32::from(ip("192.0.2.1")));
    }

    #[test]
    fn network_pool_skips_network_address() {
        let mut rule = map_rule("m1", "10.0.0.5/32", "192.0.2.0/24");
        rule.protocol = Protocol::Udp;
        let e = RuleEntry::new(rule);
        assert_eq!(e.next_ip, u32::from(ip("192.0.2.1")));
        assert_eq!(e.space, 254);
    }

    #[test]
    fn split_redirect_starts_at_first_target() {
        let mut rule = rdr_rule("r1", "203.0.113.1/32", "10.0.0.10/32");
        rule.split_target = Some(ip("10.0.0.11"));
        let e = RuleEntry::new(rule);
        assert_eq!(e.next_ip, u32::from(ip("10.0.0.10")));
        assert_eq!(e.space, 1);
    }

    // ── Matching ──────────────────────────────────────────────────

    #[test]
    fn longest_prefix_wins() {
        let mut set = RuleSet::new();
        set.insert(map_rule("wide", "10.0.0.0/8", "192.0.2.1/32"))
            .unwrap();
        set.insert(map_rule("narrow", "10.1.2.0/24", "192.0.2.2/32"))
            .unwrap();
        set.insert(map_rule("mid", "10.1.0.0/16", "192.0.2.3/32"))
            .unwrap();

        let hit = first_match(&set, &out_flow("10.1.2.3", 1000, "8.8.8.8", 53), None);
        assert_eq!(hit, Some(RuleId("narrow".into())));
        let hit = first_match(&set, &out_flow("10.1.9.3", 1000, "8.8.8.8", 53), None);
        assert_eq!(hit, Some(RuleId("mid".into())));
        let hit = first_match(&set, &out_flow("10.9.9.3", 1000, "8.8.8.8", 53), None);
        assert_eq!(hit, Some(RuleId("wide".into())));
        assert_eq!(first_match(&set, &out_flow("11.0.0.1", 1, "8.8.8.8", 53), None), None);
    }

    #[test]
    fn equal_specificity_uses_insertion_order() {
        let mut set = RuleSet::new();
        set.insert(map_rule("first", "10.0.0.0/24", "192.0.2.1/32"))
            .unwrap();
        set.insert(map_rule("second", "10.0.0.0/24", "192.0.2.2/32"))
            .unwrap();
        let flow = out_flow("10.0.0.5", 1000, "8.8.8.8", 80);
        assert_eq!(first_match(&set, &flow, None), Some(RuleId("first".into())));

        let key = set.key_of(&RuleId("first".into())).unwrap();
        set.rotate(key);
        assert_eq!(first_match(&set, &flow, None), Some(RuleId("second".into())));
    }

    #[test]
    fn interface_and_protocol_filter() {
        let mut set = RuleSet::new();
        let mut rule = map_rule("m1", "10.0.0.0/24", "192.0.2.1/32");
        rule.interface = Some("if1".into());
        set.insert(rule).unwrap();
        assert_eq!(first_match(&set, &out_flow("10.0.0.5", 1, "8.8.8.8", 80), None), None);

        let mut set = RuleSet::new();
        let mut rule = map_rule("m1", "10.0.0.0/24", "192.0.2.1/32");
        rule.protocol = Protocol::Udp;
        set.insert(rule).unwrap();
        assert_eq!(first_match(&set, &out_flow("10.0.0.5", 1, "8.8.8.8", 80), None), None);
    }

    #[test]
    fn filter_peer_negation() {
        let mut set = RuleSet::new();
        let mut rule = map_rule("m1", "10.0.0.0/24", "192.0.2.1/32");
        rule.filter = Some(FilterTuple {
            peer: Some(net("172.16.0.0/12")),
            ..FilterTuple::default()
        });
        rule.flags.negate_dst = true;
        set.insert(rule).unwrap();

        assert!(first_match(&set, &out_flow("10.0.0.5", 1, "8.8.8.8", 80), None).is_some());
        assert!(first_match(&set, &out_flow("10.0.0.5", 1, "172.16.1.1", 80), None).is_none());
    }

    #[test]
    fn filter_ports_need_tcp_udp() {
        let mut set = RuleSet::new();
        let mut rule = map_rule("m1", "10.0.0.0/24", "192.0.2.1/32");
        rule.filter = Some(FilterTuple {
            dst_ports: Some(PortRange::single(443)),
            ..FilterTuple::default()
        });
        set.insert(rule).unwrap();
        assert!(first_match(&set, &out_flow("10.0.0.5", 1, "8.8.8.8", 443), None).is_some());
        assert!(first_match(&set, &out_flow("10.0.0.5", 1, "8.8.8.8", 80), None).is_none());

        let icmp = FlowKey::new(
            Direction::Outbound,
            Protocol::Icmp,
            "if0",
            (ip("10.0.0.5"), 7),
            (ip("8.8.8.8"), 0),
            PortKind::IcmpId,
        );
        assert!(first_match(&set, &icmp, None).is_none());
    }

    #[test]
    fn redirect_port_range() {
        let mut set = RuleSet::new();
        let mut rule = rdr_rule("r1", "203.0.113.1/32", "10.0.0.10/32");
        rule.protocol = Protocol::Tcp;
        rule.ports = Some(PortRange::single(80));
        rule.target_port = Some(8080);
        set.insert(rule).unwrap();
        assert!(first_match(&set, &in_flow("198.51.100.9", 40000, "203.0.113.1", 80), None).is_some());
        assert!(first_match(&set, &in_flow("198.51.100.9", 40000, "203.0.113.1", 81), None).is_none());
        assert!(first_match(&set, &in_flow("198.51.100.9", 40000, "203.0.113.2", 80), None).is_none());
    }

    #[test]
    fn tag_must_match() {
        let mut set = RuleSet::new();
        let mut rule = map_rule("m1", "10.0.0.0/24", "192.0.2.1/32");
        rule.tag = Some("guest".into());
        set.insert(rule).unwrap();
        let flow = out_flow("10.0.0.5", 1, "8.8.8.8", 80);
        assert!(first_match(&set, &flow, None).is_none());
        assert!(first_match(&set, &flow, Some("staff")).is_none());
        assert!(first_match(&set, &flow, Some("guest")).is_some());
    }

    #[test]
    fn proxy_rule_needs_known_proxy_and_port() {
        let mut set = RuleSet::new();
        let mut rule = map_rule("m1", "10.0.0.0/24", "192.0.2.1/32");
        rule.protocol = Protocol::Tcp;
        rule.proxy = Some(ProxyBinding {
            label: "ftp".into(),
            port: 21,
        });
        let key = set.insert(rule).unwrap();
        let flow = out_flow("10.0.0.5", 1, "8.8.8.8", 21);
        assert!(set.matches(key, &flow, None, &|l| l == "ftp"));
        assert!(!set.matches(key, &flow, None, &|_| false));
        let other = out_flow("10.0.0.5", 1, "8.8.8.8", 22);
        assert!(!set.matches(key, &other, None, &|_| true));
    }

    #[test]
    fn bimap_indexed_both_ways() {
        let mut set = RuleSet::new();
        set.insert(NatRule::new(
            "b1",
            NatMode::Bimap,
            net("10.0.0.0/24"),
            net("192.0.2.0/24"),
        ))
        .unwrap();
        assert_eq!(set.candidates(Direction::Outbound, ip("10.0.0.9")).len(), 1);
        assert_eq!(set.candidates(Direction::Inbound, ip("192.0.2.9")).len(), 1);
        assert!(set.candidates(Direction::Inbound, ip("10.0.0.9")).is_empty());
    }
}
