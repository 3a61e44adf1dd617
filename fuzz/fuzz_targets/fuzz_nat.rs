#![no_main]

use std::sync::{Arc, LazyLock};

use libfuzzer_sys::fuzz_target;

use application::nat_service_impl::NatAppService;
use domain::common::entity::Protocol;
use domain::nat::engine::NatConfig;
use domain::nat::entity::{Direction, Ipv4Net, NatMode, NatRule, PortRange};
use ports::test_utils::NoopMetrics;

fn net(s: &str) -> Ipv4Net {
    s.parse().unwrap()
}

static SERVICE: LazyLock<NatAppService> = LazyLock::new(|| {
    let svc = NatAppService::new(NatConfig::default(), Arc::new(NoopMetrics));

    let mut map = NatRule::new("map", NatMode::Map, net("10.0.0.0/8"), net("192.0.2.0/30"));
    map.ports = Some(PortRange {
        start: 20000,
        end: 20063,
    });
    map.flags.tcp_udp = true;
    svc.add_rule(map).unwrap();

    let mut rdr = NatRule::new(
        "rdr",
        NatMode::Redirect,
        net("10.0.0.10/32"),
        net("203.0.113.1/32"),
    );
    rdr.protocol = Protocol::Tcp;
    rdr.ports = Some(PortRange::single(80));
    rdr.target_port = Some(8080);
    svc.add_rule(rdr).unwrap();

    svc.add_rule(NatRule::new(
        "bimap",
        NatMode::Bimap,
        net("10.1.0.5/32"),
        net("198.51.100.5/32"),
    ))
    .unwrap();

    svc
});

// Fuzz the full packet path, ICMP error translation and fragments
// included, against a shared service so sessions accumulate.
//
// Layout:
//   [0]    = direction (bit 0) and clock step (bits 1..8)
//   rest   = raw IPv4 datagram
fuzz_target!(|data: &[u8]| {
    let Some((&control, packet)) = data.split_first() else {
        return;
    };
    let direction = if control & 1 == 0 {
        Direction::Outbound
    } else {
        Direction::Inbound
    };

    let svc = &*SERVICE;
    let now = svc.now() + u64::from(control >> 1);
    svc.expire_at(now);

    if let Ok((_, out)) = svc.process_bytes(packet.to_vec(), "fuzz0", direction) {
        // Translation rewrites headers in place and never grows a datagram.
        assert!(out.len() <= packet.len());
    }
});
