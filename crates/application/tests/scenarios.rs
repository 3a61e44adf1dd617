mod common;

use common::{ip, scenario_a_rule, scenario_b_rule, send, service};
use domain::nat::engine::NatVerdict;
use domain::nat::entity::Direction;
use domain::nat::packet::{TCP_ACK, TCP_SYN, build, checksums_valid};

// ── Scenario A: outbound map with port range ────────────────────────

#[test]
fn scenario_a_syn_is_mapped() {
    let svc = service(vec![scenario_a_rule()]);
    let syn = build::tcp(ip("10.0.0.5"), 5555, ip("8.8.8.8"), 80, TCP_SYN, None);
    let (verdict, p) = send(&svc, syn, Direction::Outbound, 0);

    assert_eq!(verdict, NatVerdict::Translated);
    assert_eq!(p.src(), ip("192.0.2.1"));
    assert_eq!(p.src_port(), Some(20000));
    assert_eq!(p.dst(), ip("8.8.8.8"));
    assert_eq!(p.dst_port(), Some(80));
    assert!(checksums_valid(p.as_bytes()));
}

#[test]
fn scenario_a_reply_is_restored() {
    let svc = service(vec![scenario_a_rule()]);
    let syn = build::tcp(ip("10.0.0.5"), 5555, ip("8.8.8.8"), 80, TCP_SYN, None);
    send(&svc, syn, Direction::Outbound, 0);

    let reply = build::tcp(ip("8.8.8.8"), 80, ip("192.0.2.1"), 20000, TCP_SYN | TCP_ACK, None);
    let (verdict, p) = send(&svc, reply, Direction::Inbound, 1);
    assert_eq!(verdict, NatVerdict::Translated);
    assert_eq!(p.src(), ip("8.8.8.8"));
    assert_eq!(p.dst(), ip("10.0.0.5"));
    assert_eq!(p.dst_port(), Some(5555));
    assert!(checksums_valid(p.as_bytes()));
}

#[test]
fn scenario_a_second_flow_gets_next_port() {
    let svc = service(vec![scenario_a_rule()]);
    let first = build::tcp(ip("10.0.0.5"), 5555, ip("8.8.8.8"), 80, TCP_SYN, None);
    let second = build::tcp(ip("10.0.0.5"), 5556, ip("8.8.8.8"), 80, TCP_SYN, None);
    let (_, a) = send(&svc, first, Direction::Outbound, 0);
    let (_, b) = send(&svc, second, Direction::Outbound, 0);

    assert_eq!(a.src_port(), Some(20000));
    assert_eq!(b.src_port(), Some(20001));
    assert_eq!(svc.session_count(), 2);
}

// ── Scenario B: inbound redirect ────────────────────────────────────

#[test]
fn scenario_b_redirect_and_reply() {
    let svc = service(vec![scenario_b_rule()]);
    let syn = build::tcp(ip("198.51.100.7"), 40000, ip("203.0.113.1"), 80, TCP_SYN, None);
    let (verdict, p) = send(&svc, syn, Direction::Inbound, 0);
    assert_eq!(verdict, NatVerdict::Translated);
    assert_eq!(p.dst(), ip("10.0.0.10"));
    assert_eq!(p.dst_port(), Some(8080));
    assert!(checksums_valid(p.as_bytes()));

    let reply = build::tcp(
        ip("10.0.0.10"),
        8080,
        ip("198.51.100.7"),
        40000,
        TCP_SYN | TCP_ACK,
        None,
    );
    let (verdict, p) = send(&svc, reply, Direction::Outbound, 1);
    assert_eq!(verdict, NatVerdict::Translated);
    assert_eq!(p.src(), ip("203.0.113.1"));
    assert_eq!(p.src_port(), Some(80));
    assert!(checksums_valid(p.as_bytes()));
}

#[test]
fn scenario_b_other_port_passes() {
    let svc = service(vec![scenario_b_rule()]);
    let syn = build::tcp(ip("198.51.100.7"), 40000, ip("203.0.113.1"), 22, TCP_SYN, None);
    let (verdict, p) = send(&svc, syn, Direction::Inbound, 0);
    assert_eq!(verdict, NatVerdict::Unchanged);
    assert_eq!(p.dst(), ip("203.0.113.1"));
    assert_eq!(svc.session_count(), 0);
}

#[test]
fn both_rules_coexist() {
    let svc = service(vec![scenario_a_rule(), scenario_b_rule()]);
    let out = build::tcp(ip("10.0.0.5"), 5555, ip("8.8.8.8"), 80, TCP_SYN, None);
    let inbound = build::tcp(ip("198.51.100.7"), 40000, ip("203.0.113.1"), 80, TCP_SYN, None);
    assert_eq!(send(&svc, out, Direction::Outbound, 0).0, NatVerdict::Translated);
    assert_eq!(send(&svc, inbound, Direction::Inbound, 0).0, NatVerdict::Translated);
    assert_eq!(svc.session_count(), 2);

    let stats = svc.stats();
    assert_eq!(stats.sessions_added, 2);
    assert_eq!(stats.rule_stats.len(), 2);
    assert!(stats.rule_stats.iter().all(|r| r.in_use == 1));
}

#[test]
fn session_record_survives_json() {
    let svc = service(vec![scenario_a_rule()]);
    let syn = build::tcp(ip("10.0.0.5"), 5555, ip("8.8.8.8"), 80, TCP_SYN | TCP_ACK, None);
    send(&svc, syn, Direction::Outbound, 0);

    let json = serde_json::to_string(&svc.sessions()).unwrap();
    let records: Vec<domain::nat::entity::SessionRecord> = serde_json::from_str(&json).unwrap();

    let peer = service(vec![scenario_a_rule()]);
    for record in records {
        peer.put_session(record).unwrap();
    }
    let reply = build::tcp(ip("8.8.8.8"), 80, ip("192.0.2.1"), 20000, TCP_ACK, None);
    let (verdict, p) = send(&peer, reply, Direction::Inbound, 1);
    assert_eq!(verdict, NatVerdict::Translated);
    assert_eq!(p.dst(), ip("10.0.0.5"));
}
