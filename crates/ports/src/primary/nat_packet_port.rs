use domain::nat::engine::NatVerdict;
use domain::nat::packet::Packet;

/// Primary port through which the filter engine hands packets to NAT.
///
/// Both calls rewrite `packet` in place when the verdict is
/// [`NatVerdict::Translated`].
pub trait NatPacketPort: Send + Sync {
    /// Packet leaving through the NAT interface (map rules).
    fn check_outbound(&self, packet: &mut Packet) -> NatVerdict;

    /// Packet arriving on the NAT interface (redirect rules and replies).
    fn check_inbound(&self, packet: &mut Packet) -> NatVerdict;
}
