use std::net::Ipv4Addr;

/// Secondary port resolving the current IPv4 address of a network
/// interface, for map rules whose outside address is `0/32`.
pub trait InterfaceAddressPort: Send + Sync {
    /// `None` when the interface is unknown or has no IPv4 address.
    fn current_address(&self, interface: &str) -> Option<Ipv4Addr>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_address_port_is_object_safe() {
        fn _check(port: &dyn InterfaceAddressPort) {
            let _ = port.current_address("eth0");
        }
    }
}
