use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use parking_lot::Mutex;

use crate::common::entity::Protocol;

use super::checksum::{addr_sum, adjust_checksum};
use super::entity::{Direction, Endpoint, SessionId, WildPorts};
use super::error::NatError;
use super::hostmap::HostmapId;
use super::packet::{Packet, Rewrite};
use super::rules::RuleKey;

// ── Flow key ────────────────────────────────────────────────────────

/// What the transport ports of a flow are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortKind {
    /// No port-equivalent: other protocols, non-first fragments.
    None,
    TcpUdp,
    /// ICMP query: the id stands in for the local port.
    IcmpId,
}

/// A packet reduced to the fields lookups and rules look at.
///
/// `local` is the inside-facing endpoint on the wire (packet source when
/// outbound, destination when inbound); `remote` is the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowKey {
    pub direction: Direction,
    pub protocol: Protocol,
    pub interface: String,
    pub local: Endpoint,
    pub remote: Endpoint,
    pub ports: PortKind,
}

impl FlowKey {
    pub fn new(
        direction: Direction,
        protocol: Protocol,
        interface: impl Into<String>,
        local: (Ipv4Addr, u16),
        remote: (Ipv4Addr, u16),
        ports: PortKind,
    ) -> Self {
        Self {
            direction,
            protocol,
            interface: interface.into(),
            local: Endpoint::new(local.0, local.1),
            remote: Endpoint::new(remote.0, remote.1),
            ports,
        }
    }

    pub fn from_packet(packet: &Packet, direction: Direction) -> Self {
        let (ports, sport, dport) = match (packet.src_port(), packet.dst_port(), packet.icmp_id()) {
            (Some(s), Some(d), _) => (PortKind::TcpUdp, s, d),
            (_, _, Some(id)) => (PortKind::IcmpId, id, 0),
            _ => (PortKind::None, 0, 0),
        };
        let (local, remote) = match (direction, ports) {
            (Direction::Outbound, _) => ((packet.src(), sport), (packet.dst(), dport)),
            (Direction::Inbound, PortKind::IcmpId) => ((packet.dst(), sport), (packet.src(), 0)),
            (Direction::Inbound, _) => ((packet.dst(), dport), (packet.src(), sport)),
        };
        Self::new(
            direction,
            packet.protocol(),
            packet.interface.clone(),
            local,
            remote,
            ports,
        )
    }

    /// Packet source.
    pub fn src(&self) -> Endpoint {
        match self.direction {
            Direction::Outbound => self.local,
            Direction::Inbound => self.remote,
        }
    }

    /// Packet destination.
    pub fn dst(&self) -> Endpoint {
        match self.direction {
            Direction::Outbound => self.remote,
            Direction::Inbound => self.local,
        }
    }

    pub fn has_ports(&self) -> bool {
        self.ports != PortKind::None
    }
}

// ── Session ─────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
struct SessionCounters {
    bytes: [u64; 2],
    packets: [u64; 2],
    holders: u32,
}

/// One live translation.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub protocol: Protocol,
    pub inside: Endpoint,
    pub outside: Endpoint,
    pub remote: Endpoint,
    /// Direction of the packet that created the session.
    pub direction: Direction,
    pub rule: Option<RuleKey>,
    pub interface: String,
    pub wild: WildPorts,
    pub clone_template: bool,
    pub ports: PortKind,
    pub mss_clamp: Option<u16>,
    pub proxy: Option<String>,
    /// Outside address came from this interface and follows it on resync.
    pub(crate) address_interface: Option<String>,
    pub(crate) hostmap: Option<HostmapId>,
    ip_delta: u32,
    l4_delta: u32,
    hashes: [usize; 2],
    counters: Mutex<SessionCounters>,
}

/// Fields a new session starts from.
#[derive(Debug, Clone)]
pub struct SessionSeed {
    pub protocol: Protocol,
    pub inside: Endpoint,
    pub outside: Endpoint,
    pub remote: Endpoint,
    pub direction: Direction,
    pub rule: Option<RuleKey>,
    pub interface: String,
    pub wild: WildPorts,
    pub clone_template: bool,
    pub ports: PortKind,
    pub mss_clamp: Option<u16>,
    pub proxy: Option<String>,
    pub address_interface: Option<String>,
    pub hostmap: Option<HostmapId>,
}

impl Session {
    fn from_seed(id: SessionId, seed: SessionSeed) -> Self {
        let mut s = Self {
            id,
            protocol: seed.protocol,
            inside: seed.inside,
            outside: seed.outside,
            remote: seed.remote,
            direction: seed.direction,
            rule: seed.rule,
            interface: seed.interface,
            wild: seed.wild,
            clone_template: seed.clone_template,
            ports: seed.ports,
            mss_clamp: seed.mss_clamp,
            proxy: seed.proxy,
            address_interface: seed.address_interface,
            hostmap: seed.hostmap,
            ip_delta: 0,
            l4_delta: 0,
            hashes: [0; 2],
            counters: Mutex::new(SessionCounters::default()),
        };
        s.compute_deltas();
        s
    }

    /// Copy of a clone template, stripped of its template role.
    fn seed(&self) -> SessionSeed {
        SessionSeed {
            protocol: self.protocol,
            inside: self.inside,
            outside: self.outside,
            remote: self.remote,
            direction: self.direction,
            rule: self.rule,
            interface: self.interface.clone(),
            wild: self.wild,
            clone_template: false,
            ports: self.ports,
            mss_clamp: self.mss_clamp,
            proxy: self.proxy.clone(),
            address_interface: self.address_interface.clone(),
            hostmap: None,
        }
    }

    fn compute_deltas(&mut self) {
        let in_ip = addr_sum(self.inside.addr);
        let out_ip = addr_sum(self.outside.addr);
        self.ip_delta = adjust_checksum(in_ip, out_ip, Direction::Outbound);
        self.l4_delta = match self.ports {
            PortKind::TcpUdp => adjust_checksum(
                in_ip + u32::from(self.inside.port),
                out_ip + u32::from(self.outside.port),
                Direction::Outbound,
            ),
            PortKind::IcmpId => adjust_checksum(
                u32::from(self.inside.port),
                u32::from(self.outside.port),
                Direction::Outbound,
            ),
            PortKind::None => 0,
        };
    }

    pub fn ip_delta(&self) -> u32 {
        self.ip_delta
    }

    pub fn l4_delta(&self) -> u32 {
        self.l4_delta
    }

    /// Rewrite for a packet travelling in `direction`: outbound packets get
    /// the outside endpoint as source, inbound ones the inside endpoint as
    /// destination.
    pub fn rewrite(&self, direction: Direction) -> Rewrite {
        let target = match direction {
            Direction::Outbound => self.outside,
            Direction::Inbound => self.inside,
        };
        Rewrite {
            direction,
            addr: target.addr,
            port: (self.ports != PortKind::None).then_some(target.port),
            ip_delta: self.ip_delta,
            l4_delta: self.l4_delta,
        }
    }

    pub fn is_wild(&self) -> bool {
        self.wild.any()
    }

    /// Account one packet of `len` bytes.
    pub fn record(&self, direction: Direction, len: usize) {
        let mut c = self.counters.lock();
        let i = direction.index();
        c.bytes[i] += len as u64;
        c.packets[i] += 1;
    }

    /// Bytes and packets per direction (outbound first).
    pub fn counters(&self) -> ([u64; 2], [u64; 2]) {
        let c = self.counters.lock();
        (c.bytes, c.packets)
    }

    pub(crate) fn set_counters(&self, bytes: [u64; 2], packets: [u64; 2]) {
        let mut c = self.counters.lock();
        c.bytes = bytes;
        c.packets = packets;
    }

    pub(crate) fn hold(&self) {
        self.counters.lock().holders += 1;
    }

    /// Drop one holder. Returns the holders left.
    pub(crate) fn unhold(&self) -> u32 {
        let mut c = self.counters.lock();
        c.holders = c.holders.saturating_sub(1);
        c.holders
    }

    pub fn holders(&self) -> u32 {
        self.counters.lock().holders
    }

    fn local(&self, side: Side) -> Endpoint {
        match side {
            Side::Inside => self.inside,
            Side::Outside => self.outside,
        }
    }

    fn index_key(&self, side: Side) -> (Endpoint, Endpoint) {
        let (mut local, mut remote) = (self.local(side), self.remote);
        if self.wild.any() {
            local.port = 0;
            remote.port = 0;
        }
        (local, remote)
    }
}

// ── Hashing ─────────────────────────────────────────────────────────

fn mix(k: u32, l: u32, m: u32) -> u32 {
    k.wrapping_add(k >> 12).wrapping_add(l) % m
}

/// Bucket of a `(local, remote)` pair in a table of `size` buckets.
pub(crate) fn flow_hash(local: Endpoint, remote: Endpoint, size: usize) -> usize {
    let hv = mix(u32::from(local.addr), u32::from(local.port), u32::MAX);
    let m = u32::try_from(size.max(1)).unwrap_or(u32::MAX);
    mix(
        u32::from(remote.addr),
        hv.wrapping_add(u32::from(remote.port)),
        m,
    ) as usize
}

// ── Session table ───────────────────────────────────────────────────

/// Which index a lookup goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Keyed by the inside endpoint: outbound packets.
    Inside,
    /// Keyed by the outside endpoint: inbound packets.
    Outside,
}

impl Side {
    pub fn for_direction(direction: Direction) -> Self {
        match direction {
            Direction::Outbound => Self::Inside,
            Direction::Inbound => Self::Outside,
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Inside => 0,
            Self::Outside => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupMode {
    /// Concrete sessions only.
    Exact,
    /// Fall back to wildcard sessions for TCP/UDP.
    Search,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Hit(SessionId),
    /// A wildcard session matches and must be promoted before use.
    Wildcard(SessionId),
    Miss,
}

/// Session arena with its two hash indexes.
#[derive(Debug)]
pub struct SessionTable {
    sessions: BTreeMap<SessionId, Session>,
    buckets: [Vec<Vec<SessionId>>; 2],
    wilds: usize,
    max_bucket: usize,
    table_max: usize,
    next_id: u64,
}

impl SessionTable {
    pub fn new(table_size: usize, max_bucket: usize, table_max: usize) -> Self {
        let size = table_size.max(1);
        Self {
            sessions: BTreeMap::new(),
            buckets: [vec![Vec::new(); size], vec![Vec::new(); size]],
            wilds: 0,
            max_bucket: max_bucket.max(1),
            table_max,
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn wilds(&self) -> usize {
        self.wilds
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    /// Longest bucket of each index (inside, outside).
    pub fn longest_bucket(&self) -> [usize; 2] {
        let longest = |b: &Vec<Vec<SessionId>>| b.iter().map(Vec::len).max().unwrap_or(0);
        [longest(&self.buckets[0]), longest(&self.buckets[1])]
    }

    fn table_size(&self) -> usize {
        self.buckets[0].len()
    }

    /// Look `key` up through the index of `side`.
    pub fn find(&self, side: Side, key: &FlowKey, mode: LookupMode) -> Lookup {
        let size = self.table_size();
        let bucket = &self.buckets[side.index()][flow_hash(key.local, key.remote, size)];
        for id in bucket {
            let Some(s) = self.sessions.get(id) else {
                continue;
            };
            if !s.wild.any()
                && s.protocol == key.protocol
                && s.interface == key.interface
                && s.local(side) == key.local
                && s.remote == key.remote
            {
                return Lookup::Hit(*id);
            }
        }

        if mode == LookupMode::Exact || key.ports != PortKind::TcpUdp || self.wilds == 0 {
            return Lookup::Miss;
        }

        let local = Endpoint::new(key.local.addr, 0);
        let remote = Endpoint::new(key.remote.addr, 0);
        let bucket = &self.buckets[side.index()][flow_hash(local, remote, size)];
        for id in bucket {
            let Some(s) = self.sessions.get(id) else {
                continue;
            };
            if !s.wild.any()
                || s.protocol != key.protocol
                || s.interface != key.interface
                || s.local(side).addr != key.local.addr
                || s.remote.addr != key.remote.addr
            {
                continue;
            }
            let local_ok = s.wild.local || s.local(side).port == key.local.port;
            let remote_ok = s.wild.remote || s.remote.port == key.remote.port;
            if local_ok && remote_ok {
                return Lookup::Wildcard(*id);
            }
        }
        Lookup::Miss
    }

    /// Create a session from `seed` and index it.
    pub fn insert(&mut self, seed: SessionSeed) -> Result<SessionId, NatError> {
        if self.sessions.len() >= self.table_max {
            return Err(NatError::TableFull {
                max: self.table_max,
            });
        }
        let id = SessionId(self.next_id);
        let mut session = Session::from_seed(id, seed);
        self.link(&mut session)?;
        self.next_id += 1;
        if session.wild.any() {
            self.wilds += 1;
        }
        self.sessions.insert(id, session);
        Ok(id)
    }

    /// Unlink a session from both indexes and the arena.
    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        let session = self.sessions.remove(&id)?;
        self.unlink(&session);
        if session.wild.any() {
            self.wilds -= 1;
        }
        Some(session)
    }

    /// Bind the unknown ports of a wildcard session to `key`. A clone
    /// template yields a fresh concrete copy and stays in place.
    pub fn promote(&mut self, id: SessionId, key: &FlowKey) -> Result<SessionId, NatError> {
        let Some(s) = self.sessions.get(&id) else {
            return Err(NatError::SessionNotFound { id: id.0 });
        };
        if s.clone_template {
            let mut seed = s.seed();
            bind_ports(&mut seed.inside, &mut seed.outside, &mut seed.remote, seed.wild, key);
            seed.wild = WildPorts::default();
            seed.ports = PortKind::TcpUdp;
            return self.insert(seed);
        }

        self.update(id, |s| {
            bind_ports(&mut s.inside, &mut s.outside, &mut s.remote, s.wild, key);
            s.wild = WildPorts::default();
            s.ports = PortKind::TcpUdp;
        })?;
        self.wilds -= 1;
        Ok(id)
    }

    /// Change a session's endpoints and rehash it. On bucket overflow the
    /// session is left exactly as it was.
    pub fn update(
        &mut self,
        id: SessionId,
        change: impl FnOnce(&mut Session),
    ) -> Result<(), NatError> {
        let Some(mut session) = self.sessions.remove(&id) else {
            return Err(NatError::SessionNotFound { id: id.0 });
        };
        self.unlink(&session);
        let saved = (
            session.inside,
            session.outside,
            session.remote,
            session.wild,
            session.ports,
        );
        change(&mut session);
        session.compute_deltas();

        let res = self.link(&mut session);
        if res.is_err() {
            (
                session.inside,
                session.outside,
                session.remote,
                session.wild,
                session.ports,
            ) = saved;
            session.compute_deltas();
            // The old buckets just lost this entry, so there is room.
            let restored = self.link(&mut session);
            debug_assert!(restored.is_ok(), "session {id} lost its index slots");
        }
        self.sessions.insert(id, session);
        res
    }

    /// Drop every session. Returns them for the caller to release.
    pub fn drain(&mut self) -> Vec<Session> {
        for side in &mut self.buckets {
            side.iter_mut().for_each(Vec::clear);
        }
        self.wilds = 0;
        std::mem::take(&mut self.sessions).into_values().collect()
    }

    fn link(&mut self, session: &mut Session) -> Result<(), NatError> {
        let size = self.table_size();
        let (li, ri) = session.index_key(Side::Inside);
        let (lo, ro) = session.index_key(Side::Outside);
        let hashes = [flow_hash(li, ri, size), flow_hash(lo, ro, size)];
        if self.buckets[0][hashes[0]].len() >= self.max_bucket
            || self.buckets[1][hashes[1]].len() >= self.max_bucket
        {
            return Err(NatError::HashBucketOverflow);
        }
        self.buckets[0][hashes[0]].push(session.id);
        self.buckets[1][hashes[1]].push(session.id);
        session.hashes = hashes;
        Ok(())
    }

    fn unlink(&mut self, session: &Session) {
        for (side, h) in session.hashes.iter().enumerate() {
            if let Some(bucket) = self.buckets[side].get_mut(*h) {
                bucket.retain(|i| *i != session.id);
            }
        }
    }
}

/// Fill the wild ports of a session from the flow that matched it.
fn bind_ports(
    inside: &mut Endpoint,
    outside: &mut Endpoint,
    remote: &mut Endpoint,
    wild: WildPorts,
    key: &FlowKey,
) {
    match key.direction {
        Direction::Outbound => {
            if wild.local {
                inside.port = key.local.port;
                if outside.port == 0 {
                    outside.port = key.local.port;
                }
            }
            if wild.remote {
                remote.port = key.remote.port;
            }
        }
        Direction::Inbound => {
            if wild.local {
                outside.port = key.local.port;
                if inside.port == 0 {
                    inside.port = key.local.port;
                }
            }
            if wild.remote {
                remote.port = key.remote.port;
            }
        }
    }
}
