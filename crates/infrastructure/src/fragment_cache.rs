use std::collections::HashMap;

use domain::nat::entity::SessionId;
use parking_lot::Mutex;
use ports::secondary::fragment_cache::{FragmentCache, FragmentKey};

use crate::constants::{FRAGMENT_CACHE_CAPACITY, FRAGMENT_TTL_SECS};

/// In-memory fragment cache with a fixed lifetime per entry and a bounded
/// size. When full, the oldest entry makes room.
pub struct MemoryFragmentCache {
    entries: Mutex<HashMap<FragmentKey, (SessionId, u64)>>,
    ttl: u64,
    capacity: usize,
}

impl MemoryFragmentCache {
    pub fn new(ttl: u64, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for MemoryFragmentCache {
    fn default() -> Self {
        Self::new(FRAGMENT_TTL_SECS, FRAGMENT_CACHE_CAPACITY)
    }
}

impl FragmentCache for MemoryFragmentCache {
    fn known_fragment(&self, key: &FragmentKey) -> Option<SessionId> {
        self.entries.lock().get(key).map(|(id, _)| *id)
    }

    fn remember_fragment(&self, key: FragmentKey, session: SessionId, now: u64) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            let ttl = self.ttl;
            entries.retain(|_, (_, seen)| now.saturating_sub(*seen) < ttl);
            if entries.len() >= self.capacity
                && let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, (_, seen))| *seen)
                    .map(|(k, _)| *k)
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(key, (session, now));
    }

    fn purge(&self, now: u64) {
        let ttl = self.ttl;
        self.entries
            .lock()
            .retain(|_, (_, seen)| now.saturating_sub(*seen) < ttl);
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn key(ident: u16) -> FragmentKey {
        FragmentKey {
            src: Ipv4Addr::new(10, 0, 0, 1),
            dst: Ipv4Addr::new(198, 51, 100, 7),
            ident,
            protocol: 17,
        }
    }

    #[test]
    fn remembers_and_recalls() {
        let cache = MemoryFragmentCache::default();
        cache.remember_fragment(key(1), SessionId(9), 0);
        assert_eq!(cache.known_fragment(&key(1)), Some(SessionId(9)));
        assert_eq!(cache.known_fragment(&key(2)), None);
    }

    #[test]
    fn purge_drops_expired_entries() {
        let cache = MemoryFragmentCache::new(10, 16);
        cache.remember_fragment(key(1), SessionId(1), 0);
        cache.remember_fragment(key(2), SessionId(2), 5);
        cache.purge(10);
        assert_eq!(cache.known_fragment(&key(1)), None);
        assert_eq!(cache.known_fragment(&key(2)), Some(SessionId(2)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn full_cache_evicts_oldest() {
        let cache = MemoryFragmentCache::new(100, 2);
        cache.remember_fragment(key(1), SessionId(1), 1);
        cache.remember_fragment(key(2), SessionId(2), 2);
        cache.remember_fragment(key(3), SessionId(3), 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.known_fragment(&key(1)), None);
        assert_eq!(cache.known_fragment(&key(3)), Some(SessionId(3)));
    }

    #[test]
    fn full_cache_prefers_expired_victims() {
        let cache = MemoryFragmentCache::new(10, 2);
        cache.remember_fragment(key(1), SessionId(1), 0);
        cache.remember_fragment(key(2), SessionId(2), 15);
        cache.remember_fragment(key(3), SessionId(3), 20);
        assert_eq!(cache.known_fragment(&key(1)), None);
        assert_eq!(cache.known_fragment(&key(2)), Some(SessionId(2)));
        assert_eq!(cache.known_fragment(&key(3)), Some(SessionId(3)));
    }
}
