use std::collections::HashMap;
use std::net::Ipv4Addr;

use parking_lot::RwLock;
use ports::secondary::interface_address::InterfaceAddressPort;

/// Interface addresses supplied by configuration or an operator, rather
/// than read from the kernel.
#[derive(Default)]
pub struct StaticInterfaceTable {
    addresses: RwLock<HashMap<String, Ipv4Addr>>,
}

impl StaticInterfaceTable {
    pub fn new(entries: impl IntoIterator<Item = (String, Ipv4Addr)>) -> Self {
        Self {
            addresses: RwLock::new(entries.into_iter().collect()),
        }
    }

    /// Set or change an interface's address. Returns the previous one.
    pub fn set_address(&self, interface: &str, addr: Ipv4Addr) -> Option<Ipv4Addr> {
        self.addresses.write().insert(interface.to_string(), addr)
    }

    pub fn remove(&self, interface: &str) -> Option<Ipv4Addr> {
        self.addresses.write().remove(interface)
    }

    /// Interface names in sorted order.
    pub fn interfaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.addresses.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl InterfaceAddressPort for StaticInterfaceTable {
    fn current_address(&self, interface: &str) -> Option<Ipv4Addr> {
        self.addresses.read().get(interface).copied()
    }
}
