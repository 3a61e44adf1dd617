use std::collections::HashMap;
use std::sync::Arc;

use domain::common::error::DomainError;
use domain::nat::entity::{Direction, ExpectedFlow, SessionRecord};
use domain::nat::packet::Packet;

/// Payload-aware helper attached to sessions of rules that name it
/// (FTP-style protocols that carry addresses in their payload).
///
/// Either hook may return flows the engine should expect; they become
/// wildcard sessions owned by the same rule.
pub trait ProtocolProxy: Send + Sync {
    /// Label rules refer to in their `proxy` field.
    fn label(&self) -> &str;

    /// Called once after a session bound to this proxy is created.
    fn new_session(&self, _session: &SessionRecord) -> Result<Vec<ExpectedFlow>, DomainError> {
        Ok(Vec::new())
    }

    /// Called for every translated packet of the session. An error blocks
    /// the packet.
    fn check(
        &self,
        session: &SessionRecord,
        packet: &mut Packet,
        direction: Direction,
    ) -> Result<Vec<ExpectedFlow>, DomainError>;
}

/// Proxies keyed by label.
#[derive(Default, Clone)]
pub struct ProxyRegistry {
    proxies: HashMap<String, Arc<dyn ProtocolProxy>>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a proxy, replacing any with the same label.
    pub fn register(&mut self, proxy: Arc<dyn ProtocolProxy>) {
        self.proxies.insert(proxy.label().to_string(), proxy);
    }

    pub fn get(&self, label: &str) -> Option<&Arc<dyn ProtocolProxy>> {
        self.proxies.get(label)
    }

    pub fn contains(&self, label: &str) -> bool {
        self.proxies.contains_key(label)
    }

    pub fn labels(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = self.proxies.keys().map(String::as_str).collect();
        labels.sort_unstable();
        labels
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }
}

impl std::fmt::Debug for ProxyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyRegistry")
            .field("labels", &self.labels())
            .finish()
    }
}
