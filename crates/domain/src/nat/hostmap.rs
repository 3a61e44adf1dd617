use std::collections::HashMap;
use std::net::Ipv4Addr;

use super::rules::RuleKey;

/// Handle of a hostmap entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostmapId(u64);

/// Remembers which outside (map) or inside (redirect) address a host pair
/// was given, so later sessions between the same hosts reuse it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hostmap {
    pub rule: RuleKey,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub mapped: Ipv4Addr,
    /// Destination port the entry is bound to, 0 for any.
    pub port: u16,
    refs: u32,
}

impl Hostmap {
    pub fn refs(&self) -> u32 {
        self.refs
    }
}

/// Reference-counted hostmap entries indexed by `(src, dst)`.
#[derive(Debug, Default)]
pub struct HostmapTable {
    entries: HashMap<HostmapId, Hostmap>,
    by_pair: HashMap<(Ipv4Addr, Ipv4Addr), Vec<HostmapId>>,
    next_id: u64,
}

impl HostmapTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: HostmapId) -> Option<&Hostmap> {
        self.entries.get(&id)
    }

    /// Take a reference on an existing entry. `rule: None` accepts an entry
    /// of any rule; `port: 0` accepts any port.
    pub fn acquire(
        &mut self,
        rule: Option<RuleKey>,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        port: u16,
    ) -> Option<(HostmapId, Hostmap)> {
        let ids = self.by_pair.get(&(src, dst))?;
        let id = ids.iter().copied().find(|id| {
            self.entries.get(id).is_some_and(|hm| {
                rule.is_none_or(|r| r == hm.rule) && (port == 0 || port == hm.port)
            })
        })?;
        let hm = self.entries.get_mut(&id)?;
        hm.refs += 1;
        Some((id, hm.clone()))
    }

    /// Take a reference on the entry for `(rule, src, dst, port)`, creating
    /// it with `mapped` when none exists yet.
    pub fn acquire_or_create(
        &mut self,
        rule: RuleKey,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        mapped: Ipv4Addr,
        port: u16,
    ) -> (HostmapId, Hostmap) {
        if let Some(found) = self.acquire(Some(rule), src, dst, port) {
            return found;
        }
        let id = HostmapId(self.next_id);
        self.next_id += 1;
        let hm = Hostmap {
            rule,
            src,
            dst,
            mapped,
            port,
            refs: 1,
        };
        self.entries.insert(id, hm.clone());
        self.by_pair.entry((src, dst)).or_default().push(id);
        (id, hm)
    }

    /// Drop one reference; the entry goes away with the last one.
    pub fn release(&mut self, id: HostmapId) {
        let Some(hm) = self.entries.get_mut(&id) else {
            return;
        };
        hm.refs = hm.refs.saturating_sub(1);
        if hm.refs > 0 {
            return;
        }
        let pair = (hm.src, hm.dst);
        self.entries.remove(&id);
        if let Some(ids) = self.by_pair.get_mut(&pair) {
            ids.retain(|i| *i != id);
            if ids.is_empty() {
                self.by_pair.remove(&pair);
            }
        }
    }
}
