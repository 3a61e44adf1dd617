use std::net::Ipv4Addr;

use domain::nat::entity::SessionId;
use domain::nat::packet::Packet;

/// Identity shared by every fragment of one IP datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub ident: u16,
    pub protocol: u8,
}

impl FragmentKey {
    /// Key of `packet` as it arrived, before any rewrite.
    pub fn of(packet: &Packet) -> Self {
        Self {
            src: packet.src(),
            dst: packet.dst(),
            ident: packet.ident(),
            protocol: packet.protocol().to_u8(),
        }
    }
}

/// Secondary port remembering which session the first fragment of a
/// datagram was translated through, so later fragments (which carry no
/// ports) follow it.
pub trait FragmentCache: Send + Sync {
    /// Session the datagram's first fragment used, if still remembered.
    fn known_fragment(&self, key: &FragmentKey) -> Option<SessionId>;

    /// Record the session for a first fragment seen at `now` (seconds).
    fn remember_fragment(&self, key: FragmentKey, session: SessionId, now: u64);

    /// Drop entries older than the implementation's lifetime.
    fn purge(&self, _now: u64) {}
}
