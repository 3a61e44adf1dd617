use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::common::entity::{Protocol, RuleId};

use super::aging::{AgeUpdate, AgingQueues, NatTimeouts, QueueId, TcpState};
use super::allocator::{RedirectOutcome, allocate_map, allocate_redirect};
use super::entity::{
    Direction, ExpectedFlow, NatRule, NatStatsSnapshot, RedirectLookup, RuleStats, SessionId,
    SessionRecord,
};
use super::error::NatError;
use super::hostmap::HostmapTable;
use super::icmp::{addressed_to_quote, parse_embedded, rewrite_embedded};
use super::packet::Packet;
use super::rules::{RuleEntry, RuleKey, RuleSet};
use super::table::{
    FlowKey, Lookup, LookupMode, PortKind, Session, SessionSeed, SessionTable, Side,
};

/// Buckets per session index.
pub const DEFAULT_TABLE_SIZE: usize = 2047;

/// Maximum number of sessions.
pub const DEFAULT_TABLE_MAX: usize = 30_000;

/// Bucket length limit for a table of `table_size` buckets: twice its
/// bit length.
pub fn default_max_bucket(table_size: usize) -> usize {
    let bits = usize::BITS - table_size.max(1).leading_zeros();
    bits as usize * 2
}

// ── Configuration ───────────────────────────────────────────────────

/// Sizing and timeouts of a [`NatEngine`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatConfig {
    pub table_size: usize,
    pub table_max: usize,
    /// `None` derives the limit from `table_size`.
    pub max_bucket: Option<usize>,
    pub timeouts: NatTimeouts,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            table_size: DEFAULT_TABLE_SIZE,
            table_max: DEFAULT_TABLE_MAX,
            max_bucket: None,
            timeouts: NatTimeouts::default(),
        }
    }
}

impl NatConfig {
    pub fn max_bucket(&self) -> usize {
        self.max_bucket
            .unwrap_or_else(|| default_max_bucket(self.table_size))
    }
}

// ── Packet path types ───────────────────────────────────────────────

/// Outcome of running a packet through the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NatVerdict {
    /// No session and no rule: forward as is.
    Unchanged,
    Translated,
    /// A rule applied but no translation could be produced.
    Blocked(NatError),
}

fn no_address(_: &str) -> Option<Ipv4Addr> {
    None
}

fn no_proxy(_: &str) -> bool {
    false
}

/// Lookups the engine needs from its surroundings while creating sessions.
#[derive(Clone, Copy)]
pub struct Resolvers<'a> {
    /// Current address of an interface.
    pub interface_address: &'a dyn Fn(&str) -> Option<Ipv4Addr>,
    /// Whether a payload proxy with this label is registered.
    pub proxy_known: &'a dyn Fn(&str) -> bool,
}

impl Resolvers<'static> {
    /// No interface addresses and no proxies.
    pub fn none() -> Self {
        Self {
            interface_address: &no_address,
            proxy_known: &no_proxy,
        }
    }
}

impl std::fmt::Debug for Resolvers<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolvers").finish_non_exhaustive()
    }
}

/// Why a session left the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Removal {
    Expired,
    Flushed,
}

#[derive(Debug, Default)]
struct NatCounters {
    added: AtomicU64,
    expired: AtomicU64,
    bad_nat: AtomicU64,
    table_full: AtomicU64,
    bucket_overflows: AtomicU64,
    malformed: AtomicU64,
    translated: [AtomicU64; 2],
}

impl NatCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

// ── Engine ──────────────────────────────────────────────────────────

/// NAT rules, sessions, hostmaps and timeout queues under one owner.
///
/// Mutating operations take `&mut self`; translating a packet through an
/// existing session only needs `&self`, so callers can run the hit path
/// under a shared lock. Times are seconds on a caller-supplied monotonic
/// clock.
#[derive(Debug)]
pub struct NatEngine {
    config: NatConfig,
    rules: RuleSet,
    table: SessionTable,
    hostmaps: HostmapTable,
    aging: Mutex<AgingQueues>,
    /// Sessions unlinked while still held by someone.
    retired: HashMap<SessionId, Session>,
    counters: NatCounters,
    clock: AtomicU64,
}

impl Default for NatEngine {
    fn default() -> Self {
        Self::new(NatConfig::default())
    }
}

impl NatEngine {
    pub fn new(config: NatConfig) -> Self {
        let table = SessionTable::new(config.table_size, config.max_bucket(), config.table_max);
        let aging = AgingQueues::new(config.timeouts);
        Self {
            config,
            rules: RuleSet::new(),
            table,
            hostmaps: HostmapTable::new(),
            aging: Mutex::new(aging),
            retired: HashMap::new(),
            counters: NatCounters::default(),
            clock: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &NatConfig {
        &self.config
    }

    /// Latest time seen. Never goes backwards, which keeps every timeout
    /// queue sorted even when callers race.
    pub fn now(&self) -> u64 {
        self.clock.load(Ordering::Relaxed)
    }

    fn observe(&self, now: u64) -> u64 {
        self.clock.fetch_max(now, Ordering::Relaxed).max(now)
    }

    // ── Packet path ───────────────────────────────────────────────

    /// Find the session a flow belongs to.
    pub fn lookup(&self, flow: &FlowKey, mode: LookupMode) -> Lookup {
        self.table
            .find(Side::for_direction(flow.direction), flow, mode)
    }

    /// Bind a wildcard session to `flow`. Returns the session to use,
    /// which is a new one when the wildcard is a clone template.
    pub fn promote(&mut self, id: SessionId, flow: &FlowKey) -> Result<SessionId, NatError> {
        let bound = self.table.promote(id, flow).inspect_err(|e| self.count_insert_error(e))?;
        if bound != id {
            let now = self.now();
            self.register(bound, now);
        }
        Ok(bound)
    }

    /// Walk the rules matching `flow` by specificity and create a session
    /// from the first one able to translate it.
    ///
    /// `Ok(None)` means no rule applies (or a redirect only filters) and
    /// the packet passes untouched. An error means at least one rule
    /// matched and none could allocate.
    pub fn create_session(
        &mut self,
        flow: &FlowKey,
        tag: Option<&str>,
        resolvers: Resolvers<'_>,
        now: u64,
    ) -> Result<Option<SessionId>, NatError> {
        let now = self.observe(now);
        let mut failure = None;
        for key in self.rules.candidates(flow.direction, flow.local.addr) {
            if !self.rules.matches(key, flow, tag, resolvers.proxy_known) {
                continue;
            }
            self.rules.record_hit(key);
            match self.session_from_rule(key, flow, resolvers) {
                Ok(created) => {
                    if let Some(id) = created {
                        self.register(id, now);
                    }
                    return Ok(created);
                }
                Err(e) => failure = Some(e),
            }
        }
        match failure {
            Some(e) => {
                NatCounters::bump(&self.counters.bad_nat);
                Err(e)
            }
            None => Ok(None),
        }
    }

    fn session_from_rule(
        &mut self,
        key: RuleKey,
        flow: &FlowKey,
        resolvers: Resolvers<'_>,
    ) -> Result<Option<SessionId>, NatError> {
        let (seed, rotate) = match flow.direction {
            Direction::Outbound => {
                let Some(entry) = self.rules.get_mut(key) else {
                    return Ok(None);
                };
                let alloc = allocate_map(
                    key,
                    entry,
                    &mut self.hostmaps,
                    &self.table,
                    flow,
                    resolvers.interface_address,
                )?;
                let seed = SessionSeed {
                    outside: alloc.outside,
                    address_interface: alloc.address_interface,
                    hostmap: alloc.hostmap,
                    ..seed_for(entry, key, flow)
                };
                (seed, entry.rule.flags.round_robin)
            }
            Direction::Inbound => {
                let outcome = allocate_redirect(
                    &mut self.rules,
                    key,
                    &mut self.hostmaps,
                    flow,
                    resolvers.interface_address,
                )?;
                let RedirectOutcome::Translate {
                    rule,
                    inside,
                    hostmap,
                    moved,
                } = outcome
                else {
                    return Ok(None);
                };
                let Some(entry) = self.rules.get(rule) else {
                    if let Some(hm) = hostmap {
                        self.hostmaps.release(hm);
                    }
                    return Ok(None);
                };
                let seed = SessionSeed {
                    inside,
                    hostmap,
                    ..seed_for(entry, rule, flow)
                };
                (seed, moved && entry.rule.flags.round_robin)
            }
        };

        let rule = seed.rule;
        let hostmap = seed.hostmap;
        match self.table.insert(seed) {
            Ok(id) => {
                if rotate && let Some(rule) = rule {
                    self.rules.rotate(rule);
                }
                Ok(Some(id))
            }
            Err(e) => {
                if let Some(hm) = hostmap {
                    self.hostmaps.release(hm);
                }
                self.count_insert_error(&e);
                Err(e)
            }
        }
    }

    /// Account a freshly inserted session: rule usage and first queue.
    fn register(&mut self, id: SessionId, now: u64) {
        let Some(session) = self.table.get(id) else {
            return;
        };
        let rule = session.rule;
        let queue = self.initial_queue(session);
        if let Some(rule) = rule {
            self.rules.acquire(rule);
        }
        self.aging.get_mut().enqueue(id, queue, now);
        NatCounters::bump(&self.counters.added);
    }

    fn initial_queue(&self, session: &Session) -> QueueId {
        if let Some(rule) = session.rule
            && self.rule_age(rule)
        {
            return QueueId::Rule(rule, 0);
        }
        class_queue(session.protocol)
    }

    fn rule_age(&self, key: RuleKey) -> bool {
        self.rules.get(key).is_some_and(|e| e.rule.age.is_some())
    }

    fn count_insert_error(&self, e: &NatError) {
        match e {
            NatError::TableFull { .. } => NatCounters::bump(&self.counters.table_full),
            NatError::HashBucketOverflow => NatCounters::bump(&self.counters.bucket_overflows),
            _ => {}
        }
    }

    /// Rewrite `packet` through session `id` and refresh the session's
    /// deadline.
    pub fn translate(
        &self,
        id: SessionId,
        packet: &mut Packet,
        direction: Direction,
        now: u64,
    ) -> Result<(), NatError> {
        let now = self.observe(now);
        let session = self
            .table
            .get(id)
            .ok_or(NatError::SessionNotFound { id: id.0 })?;

        packet.apply(&session.rewrite(direction));
        if let Some(mss) = session.mss_clamp {
            packet.clamp_mss(mss);
        }
        session.record(direction, packet.len());
        NatCounters::bump(&self.counters.translated[direction.index()]);

        let rev = usize::from(direction != session.direction);
        let update = match session.rule {
            Some(rule) if self.rule_age(rule) => Some(AgeUpdate::Rule(rule, rev)),
            _ if session.protocol == Protocol::Tcp => {
                packet
                    .tcp_flags()
                    .zip(packet.tcp_payload_len())
                    .map(|(flags, data_len)| AgeUpdate::Tcp {
                        rev,
                        flags,
                        data_len,
                    })
            }
            _ => Some(AgeUpdate::Class(class_queue(session.protocol))),
        };
        if let Some(update) = update {
            self.aging.lock().update(id, update, now);
        }
        Ok(())
    }

    /// Translate an ICMP error quoting a packet of a known session.
    ///
    /// Returns the session, or `None` when the error is not about one of
    /// ours. The session's deadline is left alone.
    pub fn translate_icmp_error(
        &self,
        packet: &mut Packet,
        direction: Direction,
    ) -> Result<Option<SessionId>, NatError> {
        let embedded = parse_embedded(packet).inspect_err(|_| {
            NatCounters::bump(&self.counters.malformed);
        })?;
        if !addressed_to_quote(packet, &embedded) {
            return Ok(None);
        }
        let key = embedded.session_key(direction, &packet.interface);
        let Lookup::Hit(id) = self.lookup(&key, LookupMode::Exact) else {
            return Ok(None);
        };
        let Some(session) = self.table.get(id) else {
            return Ok(None);
        };
        let target = match direction {
            Direction::Inbound => session.inside,
            Direction::Outbound => session.outside,
        };
        rewrite_embedded(packet, &embedded, direction, target);
        session.record(direction, packet.len());
        NatCounters::bump(&self.counters.translated[direction.index()]);
        Ok(Some(id))
    }

    /// Full packet path for a single caller: ICMP errors, lookup, wildcard
    /// promotion, session creation and rewriting.
    pub fn check(
        &mut self,
        packet: &mut Packet,
        direction: Direction,
        resolvers: Resolvers<'_>,
        now: u64,
    ) -> NatVerdict {
        if packet.is_icmp_error() {
            return match self.translate_icmp_error(packet, direction) {
                Ok(Some(_)) => NatVerdict::Translated,
                Ok(None) | Err(_) => NatVerdict::Unchanged,
            };
        }
        if !packet.is_first_fragment() {
            // Later fragments carry no ports; only a fragment cache can
            // tie them to a session.
            return NatVerdict::Unchanged;
        }

        let flow = FlowKey::from_packet(packet, direction);
        let id = match self.lookup(&flow, LookupMode::Search) {
            Lookup::Hit(id) => id,
            Lookup::Wildcard(id) => match self.promote(id, &flow) {
                Ok(id) => id,
                Err(e) => return NatVerdict::Blocked(e),
            },
            Lookup::Miss => {
                let tag = packet.tag.clone();
                match self.create_session(&flow, tag.as_deref(), resolvers, now) {
                    Ok(Some(id)) => id,
                    Ok(None) => return NatVerdict::Unchanged,
                    Err(e) => return NatVerdict::Blocked(e),
                }
            }
        };
        match self.translate(id, packet, direction, now) {
            Ok(()) => NatVerdict::Translated,
            Err(e) => NatVerdict::Blocked(e),
        }
    }

    /// Remove every session whose deadline has passed. Returns how many
    /// went away.
    pub fn expire(&mut self, now: u64) -> usize {
        let now = self.observe(now);
        let expired = self.aging.get_mut().expired(now);
        let mut removed = 0;
        for id in expired {
            if self.unlink(id, Removal::Expired) {
                removed += 1;
            }
        }
        removed
    }

    /// Drop a session from the table, its queue, its rule and its hostmap.
    /// Held sessions move to the retired set until their last release.
    fn unlink(&mut self, id: SessionId, why: Removal) -> bool {
        let Some(session) = self.table.remove(id) else {
            return false;
        };
        self.aging.get_mut().remove(id);
        self.release_resources(&session);
        if why == Removal::Expired {
            NatCounters::bump(&self.counters.expired);
        }
        if session.holders() > 0 {
            self.retired.insert(id, session);
        }
        true
    }

    fn release_resources(&mut self, session: &Session) {
        if let Some(hm) = session.hostmap {
            self.hostmaps.release(hm);
        }
        if let Some(rule) = session.rule {
            self.rules.release(rule);
            if self.rules.get(rule).is_none() {
                self.aging.get_mut().remove_rule_queues(rule);
            }
        }
    }

    // ── Rules ─────────────────────────────────────────────────────

    /// Validate and install a rule after every existing one.
    pub fn add_rule(&mut self, rule: NatRule) -> Result<RuleKey, NatError> {
        let age = rule.age;
        let key = self.rules.insert(rule)?;
        if let Some(age) = age {
            self.aging.get_mut().add_rule_queues(key, age);
        }
        Ok(key)
    }

    /// Stop matching a rule. Its sessions live on; the rule is freed with
    /// the last of them. Returns whether it was freed immediately.
    pub fn remove_rule(&mut self, id: &RuleId) -> Result<bool, NatError> {
        let key = self
            .rules
            .key_of(id)
            .ok_or_else(|| NatError::RuleNotFound { id: id.to_string() })?;
        let freed = self.rules.remove(id)?;
        if freed {
            self.aging.get_mut().remove_rule_queues(key);
        }
        Ok(freed)
    }

    /// Remove every rule. Returns how many were installed.
    pub fn flush_rules(&mut self) -> usize {
        let keys: Vec<RuleKey> = self
            .rules
            .iter()
            .filter_map(|e| self.rules.key_of(&e.rule.id))
            .collect();
        let n = self.rules.clear();
        let aging = self.aging.get_mut();
        for key in keys {
            if self.rules.get(key).is_none() {
                aging.remove_rule_queues(key);
            }
        }
        n
    }

    /// Installed rules in configuration order.
    pub fn rules(&self) -> impl Iterator<Item = &RuleEntry> {
        self.rules.iter()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    // ── Sessions ──────────────────────────────────────────────────

    pub fn session_count(&self) -> usize {
        self.table.len()
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.table.get(id)
    }

    /// Snapshot of every live session.
    pub fn sessions(&self) -> Vec<SessionRecord> {
        let aging = self.aging.lock();
        let now = self.now();
        self.table
            .iter()
            .map(|s| self.record_of(s, &aging, now))
            .collect()
    }

    /// Snapshot of one session, for listing or state export.
    pub fn get_session(&self, id: SessionId) -> Result<SessionRecord, NatError> {
        let session = self
            .table
            .get(id)
            .ok_or(NatError::SessionNotFound { id: id.0 })?;
        let aging = self.aging.lock();
        Ok(self.record_of(session, &aging, self.now()))
    }

    fn record_of(&self, s: &Session, aging: &AgingQueues, now: u64) -> SessionRecord {
        let (bytes, packets) = s.counters();
        let tcp = aging.tcp_state(s.id);
        SessionRecord {
            id: s.id,
            protocol: s.protocol,
            inside: s.inside,
            outside: s.outside,
            remote: s.remote,
            direction: s.direction,
            rule: s
                .rule
                .and_then(|k| self.rules.get(k))
                .map(|e| e.rule.id.clone()),
            interface: s.interface.clone(),
            wild: s.wild,
            clone_template: s.clone_template,
            tcp_state: [tcp[0].as_u8(), tcp[1].as_u8()],
            bytes,
            packets,
            expires_in: aging.expires_in(s.id, now),
        }
    }

    /// Import a session exported by [`Self::get_session`], typically from
    /// a peer. The owning rule must be installed here too.
    pub fn put_session(&mut self, record: SessionRecord, now: u64) -> Result<SessionId, NatError> {
        let now = self.observe(now);
        let rule = match record.rule {
            Some(ref id) => Some(
                self.rules
                    .key_of(id)
                    .ok_or_else(|| NatError::RuleNotFound { id: id.to_string() })?,
            ),
            None => None,
        };
        let tcp = [
            TcpState::from_u8(record.tcp_state[0]).unwrap_or_default(),
            TcpState::from_u8(record.tcp_state[1]).unwrap_or_default(),
        ];
        let ports = ports_for(record.protocol);
        let (mss_clamp, proxy) = rule
            .and_then(|k| self.rules.get(k))
            .map_or((None, None), |e| {
                (e.rule.mss_clamp, e.rule.proxy.as_ref().map(|p| p.label.clone()))
            });

        let id = self
            .table
            .insert(SessionSeed {
                protocol: record.protocol,
                inside: record.inside,
                outside: record.outside,
                remote: record.remote,
                direction: record.direction,
                rule,
                interface: record.interface,
                wild: record.wild,
                clone_template: record.clone_template,
                ports,
                mss_clamp,
                proxy,
                address_interface: None,
                hostmap: None,
            })
            .inspect_err(|e| self.count_insert_error(e))?;

        if let Some(s) = self.table.get(id) {
            s.set_counters(record.bytes, record.packets);
        }
        if let Some(rule) = rule {
            self.rules.acquire(rule);
        }
        let queue = match rule {
            Some(k) if self.rule_age(k) => QueueId::Rule(k, 0),
            _ if record.protocol == Protocol::Tcp => QueueId::Tcp(tcp[0].max(tcp[1])),
            _ => class_queue(record.protocol),
        };
        let aging = self.aging.get_mut();
        aging.enqueue(id, queue, now);
        aging.set_tcp_state(id, tcp);
        NatCounters::bump(&self.counters.added);
        Ok(id)
    }

    /// Remove one session now.
    pub fn remove_session(&mut self, id: SessionId) -> Result<(), NatError> {
        if self.unlink(id, Removal::Flushed) {
            Ok(())
        } else {
            Err(NatError::SessionNotFound { id: id.0 })
        }
    }

    /// Remove every session. Held sessions stay reachable through their
    /// holders until released.
    pub fn flush_sessions(&mut self) -> usize {
        let drained = self.table.drain();
        let n = drained.len();
        for session in drained {
            self.aging.get_mut().remove(session.id);
            self.release_resources(&session);
            if session.holders() > 0 {
                self.retired.insert(session.id, session);
            }
        }
        n
    }

    /// Pin a session so removal defers its reclamation.
    pub fn hold(&self, id: SessionId) -> Result<(), NatError> {
        let session = self
            .table
            .get(id)
            .ok_or(NatError::SessionNotFound { id: id.0 })?;
        session.hold();
        Ok(())
    }

    /// Drop a pin taken with [`Self::hold`]. A removed session is freed
    /// with its last holder.
    pub fn release(&mut self, id: SessionId) -> Result<(), NatError> {
        if let Some(session) = self.table.get(id) {
            session.unhold();
            return Ok(());
        }
        let session = self
            .retired
            .get(&id)
            .ok_or(NatError::SessionNotFound { id: id.0 })?;
        if session.unhold() == 0 {
            self.retired.remove(&id);
        }
        Ok(())
    }

    /// Sessions removed from the table but still held.
    pub fn retired(&self) -> usize {
        self.retired.len()
    }

    /// Follow an interface address change: non-TCP sessions whose outside
    /// address came from `interface` take its new address. Returns how
    /// many sessions changed.
    pub fn sync_interface(
        &mut self,
        interface: &str,
        interface_address: &dyn Fn(&str) -> Option<Ipv4Addr>,
    ) -> usize {
        let Some(addr) = interface_address(interface) else {
            return 0;
        };
        let stale: Vec<SessionId> = self
            .table
            .iter()
            .filter(|s| {
                s.protocol != Protocol::Tcp
                    && s.address_interface.as_deref() == Some(interface)
                    && s.outside.addr != addr
            })
            .map(|s| s.id)
            .collect();
        let mut changed = 0;
        for id in stale {
            if self.table.update(id, |s| s.outside.addr = addr).is_ok() {
                changed += 1;
            }
        }
        changed
    }

    /// Report how an existing session translates `flow`, without creating
    /// or promoting anything.
    pub fn lookup_redirect(&self, flow: &FlowKey) -> Option<RedirectLookup> {
        let Lookup::Hit(id) = self.lookup(flow, LookupMode::Exact) else {
            return None;
        };
        let s = self.table.get(id)?;
        Some(RedirectLookup {
            session: id,
            inside: s.inside,
            outside: s.outside,
            remote: s.remote,
        })
    }

    /// Create a wildcard session a payload proxy expects, owned by the
    /// same rule as `parent`.
    pub fn expect_session(
        &mut self,
        parent: SessionId,
        expected: ExpectedFlow,
        now: u64,
    ) -> Result<SessionId, NatError> {
        let now = self.observe(now);
        let (rule, interface, proxy) = {
            let p = self
                .table
                .get(parent)
                .ok_or(NatError::SessionNotFound { id: parent.0 })?;
            (p.rule, p.interface.clone(), p.proxy.clone())
        };
        let id = self
            .table
            .insert(SessionSeed {
                protocol: expected.protocol,
                inside: expected.inside,
                outside: expected.outside,
                remote: expected.remote,
                direction: expected.direction,
                rule,
                interface,
                wild: expected.wild,
                clone_template: expected.clone_template,
                ports: ports_for(expected.protocol),
                mss_clamp: None,
                proxy,
                address_interface: None,
                hostmap: None,
            })
            .inspect_err(|e| self.count_insert_error(e))?;
        self.register(id, now);
        Ok(id)
    }

    // ── Statistics ────────────────────────────────────────────────

    pub fn stats(&self) -> NatStatsSnapshot {
        let c = &self.counters;
        NatStatsSnapshot {
            sessions_added: NatCounters::get(&c.added),
            sessions_in_use: self.table.len() as u64,
            sessions_expired: NatCounters::get(&c.expired),
            sessions_retired: self.retired.len() as u64,
            wildcards: self.table.wilds() as u64,
            bad_nat: NatCounters::get(&c.bad_nat),
            table_full: NatCounters::get(&c.table_full),
            bucket_overflows: NatCounters::get(&c.bucket_overflows),
            malformed: NatCounters::get(&c.malformed),
            translated_outbound: NatCounters::get(&c.translated[0]),
            translated_inbound: NatCounters::get(&c.translated[1]),
            rules: self.rules.len() as u64,
            hostmaps: self.hostmaps.len() as u64,
            longest_bucket: self.table.longest_bucket(),
            rule_stats: self
                .rules
                .iter()
                .map(|e| RuleStats {
                    id: e.rule.id.clone(),
                    hits: e.hits(),
                    in_use: e.in_use(),
                    space: e.space(),
                    pending_delete: e.is_deleting(),
                })
                .collect(),
        }
    }

    /// Count a packet whose headers could not be parsed.
    pub fn count_malformed(&self) {
        NatCounters::bump(&self.counters.malformed);
    }
}

/// Fields every new session copies from its rule and flow.
fn seed_for(entry: &RuleEntry, key: RuleKey, flow: &FlowKey) -> SessionSeed {
    SessionSeed {
        protocol: flow.protocol,
        inside: flow.local,
        outside: flow.local,
        remote: flow.remote,
        direction: flow.direction,
        rule: Some(key),
        interface: flow.interface.clone(),
        wild: Default::default(),
        clone_template: false,
        ports: flow.ports,
        mss_clamp: entry.rule.mss_clamp,
        proxy: entry.rule.proxy.as_ref().map(|p| p.label.clone()),
        address_interface: None,
        hostmap: None,
    }
}

fn class_queue(protocol: Protocol) -> QueueId {
    match protocol {
        Protocol::Tcp => QueueId::Tcp(TcpState::Closed),
        Protocol::Udp => QueueId::Udp,
        Protocol::Icmp => QueueId::Icmp,
        _ => QueueId::Ip,
    }
}

fn ports_for(protocol: Protocol) -> PortKind {
    match protocol {
        Protocol::Tcp | Protocol::Udp => PortKind::TcpUdp,
        Protocol::Icmp => PortKind::IcmpId,
        _ => PortKind::None,
    }
}
