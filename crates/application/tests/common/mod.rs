#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::Arc;

use application::nat_service_impl::NatAppService;
use domain::common::entity::Protocol;
use domain::nat::engine::{NatConfig, NatVerdict};
use domain::nat::entity::{Direction, Ipv4Net, NatMode, NatRule, PortRange};
use domain::nat::packet::Packet;
use ports::test_utils::NoopMetrics;

pub fn ip(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

pub fn net(s: &str) -> Ipv4Net {
    s.parse().unwrap()
}

/// `map if0 10.0.0.0/24 -> 192.0.2.1/32 portmap 20000-29999`
pub fn scenario_a_rule() -> NatRule {
    let mut rule = NatRule::new("map-a", NatMode::Map, net("10.0.0.0/24"), net("192.0.2.1/32"));
    rule.interface = Some("if0".into());
    rule.ports = Some(PortRange {
        start: 20000,
        end: 29999,
    });
    rule.flags.tcp_udp = true;
    rule
}

/// `rdr if0 203.0.113.1/32 port 80 -> 10.0.0.10 port 8080 tcp`
pub fn scenario_b_rule() -> NatRule {
    let mut rule = NatRule::new(
        "rdr-b",
        NatMode::Redirect,
        net("10.0.0.10/32"),
        net("203.0.113.1/32"),
    );
    rule.interface = Some("if0".into());
    rule.protocol = Protocol::Tcp;
    rule.ports = Some(PortRange::single(80));
    rule.target_port = Some(8080);
    rule
}

pub fn service(rules: Vec<NatRule>) -> NatAppService {
    let svc = NatAppService::new(NatConfig::default(), Arc::new(NoopMetrics));
    for rule in rules {
        svc.add_rule(rule).unwrap();
    }
    svc
}

pub fn send(
    svc: &NatAppService,
    bytes: Vec<u8>,
    direction: Direction,
    now: u64,
) -> (NatVerdict, Packet) {
    let mut packet = Packet::parse(bytes, "if0").unwrap();
    let verdict = svc.process_at(&mut packet, direction, now);
    (verdict, packet)
}
