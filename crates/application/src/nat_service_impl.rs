use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use domain::common::entity::{Protocol, RuleId};
use domain::common::error::DomainError;
use domain::nat::engine::{NatConfig, NatEngine, NatVerdict, Resolvers};
use domain::nat::entity::{
    Direction, ExpectedFlow, NatRule, NatStatsSnapshot, RedirectLookup, SessionId, SessionRecord,
};
use domain::nat::error::NatError;
use domain::nat::packet::Packet;
use domain::nat::table::{FlowKey, Lookup, LookupMode};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use ports::primary::nat_packet_port::NatPacketPort;
use ports::secondary::fragment_cache::{FragmentCache, FragmentKey};
use ports::secondary::interface_address::InterfaceAddressPort;
use ports::secondary::metrics_port::MetricsPort;
use ports::secondary::protocol_proxy::ProxyRegistry;
use tokio_util::sync::CancellationToken;

/// Application-level NAT service.
///
/// Wraps the domain `NatEngine` in a reader/writer lock. Packets hitting an
/// existing session are translated under the shared lock; a miss takes
/// the session-creation mutex, then the exclusive lock for the insert only,
/// and downgrades before rewriting the packet.
pub struct NatAppService {
    engine: RwLock<NatEngine>,
    /// Serializes creation of brand-new sessions.
    create: Mutex<()>,
    fragments: Option<Arc<dyn FragmentCache>>,
    interfaces: Option<Arc<dyn InterfaceAddressPort>>,
    proxies: ProxyRegistry,
    metrics: Arc<dyn MetricsPort>,
    started: Instant,
}

impl NatAppService {
    pub fn new(config: NatConfig, metrics: Arc<dyn MetricsPort>) -> Self {
        Self {
            engine: RwLock::new(NatEngine::new(config)),
            create: Mutex::new(()),
            fragments: None,
            interfaces: None,
            proxies: ProxyRegistry::new(),
            metrics,
            started: Instant::now(),
        }
    }

    /// Set the cache used to translate non-first fragments.
    pub fn set_fragment_cache(&mut self, cache: Arc<dyn FragmentCache>) {
        self.fragments = Some(cache);
    }

    /// Set the resolver for `0/32` (interface address) map rules.
    pub fn set_interface_resolver(&mut self, resolver: Arc<dyn InterfaceAddressPort>) {
        self.interfaces = Some(resolver);
    }

    /// Set the payload proxies rules may bind to.
    pub fn set_proxies(&mut self, proxies: ProxyRegistry) {
        self.proxies = proxies;
    }

    /// Seconds since the service started.
    pub fn now(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    // ── Packet path ───────────────────────────────────────────────

    /// Run `packet` through NAT at the current time.
    pub fn process(&self, packet: &mut Packet, direction: Direction) -> NatVerdict {
        self.process_at(packet, direction, self.now())
    }

    /// Run `packet` through NAT at `now` (seconds).
    pub fn process_at(&self, packet: &mut Packet, direction: Direction, now: u64) -> NatVerdict {
        let verdict = if packet.is_icmp_error() {
            self.icmp_error(packet, direction)
        } else if !packet.is_first_fragment() {
            self.later_fragment(packet, direction, now)
        } else {
            self.transport_packet(packet, direction, now)
        };
        self.metrics
            .record_packet(direction_label(direction), verdict_label(&verdict));
        verdict
    }

    /// Parse raw IPv4 bytes and run them through NAT. Returns the verdict
    /// and the (possibly rewritten) bytes.
    pub fn process_bytes(
        &self,
        data: Vec<u8>,
        interface: &str,
        direction: Direction,
    ) -> Result<(NatVerdict, Vec<u8>), NatError> {
        let mut packet = Packet::parse(data, interface).inspect_err(|e| {
            self.engine.read().count_malformed();
            self.metrics.record_malformed("ip");
            tracing::trace!(interface, "unparseable packet: {e}");
        })?;
        let verdict = self.process(&mut packet, direction);
        Ok((verdict, packet.into_bytes()))
    }

    fn icmp_error(&self, packet: &mut Packet, direction: Direction) -> NatVerdict {
        let engine = self.engine.read();
        match engine.translate_icmp_error(packet, direction) {
            Ok(Some(id)) => {
                tracing::trace!(session = %id, %direction, "ICMP error translated");
                self.metrics.record_translation(direction_label(direction));
                NatVerdict::Translated
            }
            Ok(None) => NatVerdict::Unchanged,
            Err(_) => {
                self.metrics.record_malformed("icmp_error");
                NatVerdict::Unchanged
            }
        }
    }

    fn later_fragment(&self, packet: &mut Packet, direction: Direction, now: u64) -> NatVerdict {
        let Some(cache) = &self.fragments else {
            return NatVerdict::Unchanged;
        };
        let Some(id) = cache.known_fragment(&FragmentKey::of(packet)) else {
            return NatVerdict::Unchanged;
        };
        let engine = self.engine.read();
        match engine.translate(id, packet, direction, now) {
            Ok(()) => {
                self.metrics.record_translation(direction_label(direction));
                NatVerdict::Translated
            }
            // Session went away after the first fragment.
            Err(_) => NatVerdict::Unchanged,
        }
    }

    fn transport_packet(&self, packet: &mut Packet, direction: Direction, now: u64) -> NatVerdict {
        let fragment = packet.is_fragment().then(|| FragmentKey::of(packet));
        let flow = FlowKey::from_packet(packet, direction);

        let read = self.engine.read();
        let found = read.lookup(&flow, LookupMode::Search);
        let (engine, id) = match found {
            Lookup::Hit(id) => (read, id),
            Lookup::Wildcard(_) | Lookup::Miss => {
                drop(read);
                match self.bind_or_create(&flow, packet.tag.as_deref(), now) {
                    Ok(Some(found)) => found,
                    Ok(None) => return NatVerdict::Unchanged,
                    Err(e) => return self.blocked(e, &flow),
                }
            }
        };

        if let Err(e) = engine.translate(id, packet, direction, now) {
            return self.blocked(e, &flow);
        }
        self.metrics.record_translation(direction_label(direction));
        if let (Some(cache), Some(key)) = (&self.fragments, fragment) {
            cache.remember_fragment(key, id, now);
        }

        let proxied = engine
            .session(id)
            .and_then(|s| s.proxy.clone())
            .and_then(|label| engine.get_session(id).ok().map(|r| (label, r)));
        drop(engine);

        match proxied {
            Some((label, record)) => {
                self.proxy_check(&label, &record, packet, direction, now, &flow)
            }
            None => NatVerdict::Translated,
        }
    }

    /// Slow path: promote a wildcard or create a session, then downgrade
    /// to the shared lock for the rest of the packet.
    fn bind_or_create(
        &self,
        flow: &FlowKey,
        tag: Option<&str>,
        now: u64,
    ) -> Result<Option<(RwLockReadGuard<'_, NatEngine>, SessionId)>, NatError> {
        let _create = self.create.lock();
        let mut engine = self.engine.write();

        // Another packet of this flow may have created it while we waited.
        let id = match engine.lookup(flow, LookupMode::Search) {
            Lookup::Hit(id) => id,
            Lookup::Wildcard(wildcard) => {
                let id = engine.promote(wildcard, flow)?;
                tracing::debug!(session = %id, wildcard = %wildcard, "wildcard session bound");
                id
            }
            Lookup::Miss => {
                let address = |interface: &str| {
                    self.interfaces
                        .as_ref()
                        .and_then(|r| r.current_address(interface))
                };
                let proxy_known = |label: &str| self.proxies.contains(label);
                let resolvers = Resolvers {
                    interface_address: &address,
                    proxy_known: &proxy_known,
                };
                let Some(id) = engine.create_session(flow, tag, resolvers, now)? else {
                    return Ok(None);
                };
                self.session_created(&mut engine, id, now)?;
                id
            }
        };
        Ok(Some((RwLockWriteGuard::downgrade(engine), id)))
    }

    fn session_created(
        &self,
        engine: &mut NatEngine,
        id: SessionId,
        now: u64,
    ) -> Result<(), NatError> {
        let record = engine.get_session(id)?;
        tracing::debug!(
            session = %id,
            protocol = %record.protocol,
            inside = %record.inside,
            outside = %record.outside,
            remote = %record.remote,
            rule = ?record.rule,
            "NAT session created"
        );
        self.metrics
            .record_session_created(protocol_label(record.protocol));

        let Some(label) = engine.session(id).and_then(|s| s.proxy.clone()) else {
            return Ok(());
        };
        let Some(proxy) = self.proxies.get(&label) else {
            return Ok(());
        };
        match proxy.new_session(&record) {
            Ok(flows) => {
                Self::expect_flows(engine, id, flows, now);
                Ok(())
            }
            Err(e) => {
                tracing::debug!(proxy = %label, session = %id, "proxy refused session: {e}");
                engine.remove_session(id)?;
                Err(NatError::ProxyRejected { label })
            }
        }
    }

    fn proxy_check(
        &self,
        label: &str,
        record: &SessionRecord,
        packet: &mut Packet,
        direction: Direction,
        now: u64,
        flow: &FlowKey,
    ) -> NatVerdict {
        let Some(proxy) = self.proxies.get(label) else {
            return NatVerdict::Translated;
        };
        match proxy.check(record, packet, direction) {
            Ok(flows) => {
                if !flows.is_empty() {
                    let mut engine = self.engine.write();
                    Self::expect_flows(&mut engine, record.id, flows, now);
                }
                NatVerdict::Translated
            }
            Err(e) => {
                tracing::debug!(proxy = label, session = %record.id, "proxy rejected packet: {e}");
                self.blocked(
                    NatError::ProxyRejected {
                        label: label.to_string(),
                    },
                    flow,
                )
            }
        }
    }

    fn expect_flows(engine: &mut NatEngine, parent: SessionId, flows: Vec<ExpectedFlow>, now: u64) {
        for flow in flows {
            match engine.expect_session(parent, flow, now) {
                Ok(id) => tracing::debug!(session = %id, parent = %parent, "expected flow registered"),
                Err(e) => tracing::warn!(parent = %parent, "cannot register expected flow: {e}"),
            }
        }
    }

    fn blocked(&self, error: NatError, flow: &FlowKey) -> NatVerdict {
        match error {
            NatError::RuleAllocationExhausted { ref rule } => {
                tracing::warn!(
                    rule = %rule,
                    local = %flow.local,
                    remote = %flow.remote,
                    "NAT rule has no free address/port, packet blocked"
                );
            }
            NatError::HashBucketOverflow => {
                self.metrics.record_bucket_overflow();
                tracing::warn!(
                    local = %flow.local,
                    remote = %flow.remote,
                    "session hash bucket full, packet blocked"
                );
            }
            NatError::TableFull { max } => {
                tracing::warn!(max, "session table full, packet blocked");
            }
            ref other => {
                tracing::debug!(local = %flow.local, remote = %flow.remote, "NAT blocked packet: {other}");
            }
        }
        self.metrics.record_blocked(blocked_reason(&error));
        NatVerdict::Blocked(error)
    }

    // ── Rules ─────────────────────────────────────────────────────

    /// Install one rule.
    pub fn add_rule(&self, rule: NatRule) -> Result<(), DomainError> {
        let id = rule.id.clone();
        let mut engine = self.engine.write();
        engine.add_rule(rule)?;
        tracing::info!(rule = %id, "NAT rule added");
        self.update_metrics(&engine);
        Ok(())
    }

    /// Stop matching a rule. Its sessions keep translating until they age
    /// out. Returns whether the rule was freed immediately.
    pub fn remove_rule(&self, id: &str) -> Result<bool, DomainError> {
        let mut engine = self.engine.write();
        let freed = engine.remove_rule(&RuleId(id.to_string()))?;
        tracing::info!(rule = id, freed, "NAT rule removed");
        self.update_metrics(&engine);
        Ok(freed)
    }

    /// Replace every rule. Nothing changes when any rule is invalid.
    pub fn reload_rules(&self, rules: Vec<NatRule>) -> Result<(), DomainError> {
        let mut seen = HashSet::new();
        for rule in &rules {
            rule.validate()
                .map_err(|e| DomainError::InvalidRule(e.to_string()))?;
            if !seen.insert(rule.id.clone()) {
                return Err(DomainError::DuplicateRule(rule.id.to_string()));
            }
        }

        let count = rules.len();
        let mut engine = self.engine.write();
        engine.flush_rules();
        for rule in rules {
            engine.add_rule(rule)?;
        }
        tracing::info!(count, "NAT rules reloaded");
        self.update_metrics(&engine);
        Ok(())
    }

    /// Remove every rule. Returns how many were installed.
    pub fn flush_rules(&self) -> usize {
        let mut engine = self.engine.write();
        let count = engine.flush_rules();
        tracing::info!(count, "NAT rules flushed");
        self.update_metrics(&engine);
        count
    }

    /// Installed rules in configuration order.
    pub fn rules(&self) -> Vec<NatRule> {
        self.engine.read().rules().map(|e| e.rule.clone()).collect()
    }

    pub fn rule_count(&self) -> usize {
        self.engine.read().rule_count()
    }

    // ── Sessions ──────────────────────────────────────────────────

    pub fn session_count(&self) -> usize {
        self.engine.read().session_count()
    }

    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.engine.read().sessions()
    }

    pub fn get_session(&self, id: SessionId) -> Result<SessionRecord, DomainError> {
        Ok(self.engine.read().get_session(id)?)
    }

    /// Import a session exported by a peer.
    pub fn put_session(&self, record: SessionRecord) -> Result<SessionId, DomainError> {
        let now = self.now();
        let mut engine = self.engine.write();
        let id = engine.put_session(record, now)?;
        tracing::debug!(session = %id, "NAT session imported");
        self.update_metrics(&engine);
        Ok(id)
    }

    pub fn remove_session(&self, id: SessionId) -> Result<(), DomainError> {
        let mut engine = self.engine.write();
        engine.remove_session(id)?;
        self.update_metrics(&engine);
        Ok(())
    }

    /// Remove every session. Returns how many were removed.
    pub fn flush_sessions(&self) -> usize {
        let mut engine = self.engine.write();
        let count = engine.flush_sessions();
        tracing::info!(count, "NAT sessions flushed");
        self.update_metrics(&engine);
        count
    }

    /// Pin a session; removal defers reclamation until [`Self::release`].
    pub fn hold(&self, id: SessionId) -> Result<(), DomainError> {
        Ok(self.engine.read().hold(id)?)
    }

    pub fn release(&self, id: SessionId) -> Result<(), DomainError> {
        Ok(self.engine.write().release(id)?)
    }

    /// Report how an existing session translates `flow`.
    pub fn lookup_redirect(&self, flow: &FlowKey) -> Option<RedirectLookup> {
        self.engine.read().lookup_redirect(flow)
    }

    /// Re-resolve the address of `interface` for sessions that follow it.
    pub fn sync_interface(&self, interface: &str) -> usize {
        let Some(resolver) = &self.interfaces else {
            return 0;
        };
        let address = |name: &str| resolver.current_address(name);
        let changed = self.engine.write().sync_interface(interface, &address);
        if changed > 0 {
            tracing::info!(interface, changed, "NAT sessions follow new interface address");
        }
        changed
    }

    // ── Aging ─────────────────────────────────────────────────────

    /// Remove expired sessions at the current time.
    pub fn expire(&self) -> usize {
        self.expire_at(self.now())
    }

    /// Remove sessions whose deadline is before `now` (seconds).
    pub fn expire_at(&self, now: u64) -> usize {
        let mut engine = self.engine.write();
        let expired = engine.expire(now);
        if expired > 0 {
            tracing::debug!(expired, remaining = engine.session_count(), "NAT expiry sweep");
            self.metrics.record_sessions_expired(expired as u64);
        }
        self.update_metrics(&engine);
        drop(engine);

        if let Some(cache) = &self.fragments {
            cache.purge(now);
        }
        expired
    }

    /// Run the periodic expiry sweep until `cancel` fires. Call this from a
    /// spawned Tokio task.
    pub async fn expiry_loop(self: Arc<Self>, period: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.expire();
                }
            }
        }
        tracing::debug!("NAT expiry loop stopped");
    }

    // ── Statistics ────────────────────────────────────────────────

    pub fn stats(&self) -> NatStatsSnapshot {
        self.engine.read().stats()
    }

    fn update_metrics(&self, engine: &NatEngine) {
        let stats = engine.stats();
        self.metrics.set_sessions_in_use(stats.sessions_in_use);
        self.metrics.set_wildcard_sessions(stats.wildcards);
        self.metrics.set_rules_loaded(stats.rules);
    }
}

impl NatPacketPort for NatAppService {
    fn check_outbound(&self, packet: &mut Packet) -> NatVerdict {
        self.process(packet, Direction::Outbound)
    }

    fn check_inbound(&self, packet: &mut Packet) -> NatVerdict {
        self.process(packet, Direction::Inbound)
    }
}

fn direction_label(direction: Direction) -> &'static str {
    match direction {
        Direction::Outbound => "outbound",
        Direction::Inbound => "inbound",
    }
}

fn verdict_label(verdict: &NatVerdict) -> &'static str {
    match verdict {
        NatVerdict::Unchanged => "unchanged",
        NatVerdict::Translated => "translated",
        NatVerdict::Blocked(_) => "blocked",
    }
}

fn protocol_label(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::Tcp => "tcp",
        Protocol::Udp => "udp",
        Protocol::Icmp => "icmp",
        Protocol::Any | Protocol::Other(_) => "other",
    }
}

fn blocked_reason(error: &NatError) -> &'static str {
    match error {
        NatError::RuleAllocationExhausted { .. } => "allocation_exhausted",
        NatError::HashBucketOverflow => "bucket_overflow",
        NatError::TableFull { .. } => "table_full",
        NatError::NoInterfaceAddress { .. } => "no_interface_address",
        NatError::ProxyRejected { .. } => "proxy_rejected",
        _ => "other",
    }
}
