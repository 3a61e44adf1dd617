use std::path::Path;

use anyhow::{Context, Result, bail};
use application::nat_service_impl::NatAppService;
use domain::nat::engine::NatVerdict;
use domain::nat::entity::{Direction, NatMode, NatRule, PortRange, SessionRecord};
use domain::nat::packet::Packet;
use infrastructure::config::AgentConfig;
use serde::Serialize;

use crate::cli::OutputFormat;
use crate::startup::build_runtime;

// ── Check ───────────────────────────────────────────────────────────────

pub fn cmd_check(config_path: &str, output: OutputFormat) -> Result<()> {
    let config = AgentConfig::load(Path::new(config_path))
        .with_context(|| format!("failed to load {config_path}"))?;
    let rules = config.nat_rules()?;
    let nat = config.nat_config();

    if output == OutputFormat::Json {
        let combined = serde_json::json!({
            "table_size": nat.table_size,
            "table_max": nat.table_max,
            "max_bucket": nat.max_bucket(),
            "timeouts": nat.timeouts,
            "interfaces": config.interface_addresses(),
            "rules": rules,
        });
        println!("{}", serde_json::to_string_pretty(&combined)?);
        return Ok(());
    }

    println!("Configuration OK: {config_path}");
    println!("  Table size:   {}", nat.table_size);
    println!("  Table max:    {}", nat.table_max);
    println!("  Max bucket:   {}", nat.max_bucket());
    for (name, addr) in config.interface_addresses() {
        println!("  Interface:    {name} = {addr}");
    }
    println!();

    if rules.is_empty() {
        println!("No NAT rules configured.");
        return Ok(());
    }

    println!(
        "{:<16} {:<9}  {:<6}  {:<8}  {:<18}  {:<18}  {:<11}  {:<6}  FLAGS",
        "ID", "MODE", "PROTO", "IFACE", "FROM", "TO", "PORTS", "TARGET"
    );
    for rule in &rules {
        println!("{}", format_rule(rule));
    }

    println!("\n{} rule(s) total.", rules.len());
    Ok(())
}

fn format_rule(rule: &NatRule) -> String {
    // Redirect rules match on the outside network and translate to the
    // inside one; show them in the direction they are written.
    let (from, to) = if rule.mode == NatMode::Redirect {
        (rule.outside.to_string(), rule.inside.to_string())
    } else {
        (rule.inside.to_string(), rule.outside.to_string())
    };
    let to = match rule.outside_range_end {
        Some(end) if rule.mode != NatMode::Redirect => format!("{}-{end}", rule.outside.addr()),
        _ => to,
    };
    let protocol = if rule.flags.tcp_udp {
        "tcpudp".to_string()
    } else {
        rule.protocol.to_string()
    };

    format!(
        "{:<16} {:<9}  {:<6}  {:<8}  {:<18}  {:<18}  {:<11}  {:<6}  {}",
        truncate(&rule.id.0, 16),
        rule.mode.as_str(),
        protocol,
        rule.interface.as_deref().unwrap_or("*"),
        from,
        to,
        rule.ports.map_or_else(|| "-".to_string(), format_ports),
        rule.target_port
            .map_or_else(|| "-".to_string(), |p| p.to_string()),
        format_flags(rule),
    )
}

fn format_ports(range: PortRange) -> String {
    if range.start == range.end {
        range.start.to_string()
    } else {
        format!("{}-{}", range.start, range.end)
    }
}

fn format_flags(rule: &NatRule) -> String {
    let flags = rule.flags;
    let named = [
        (flags.auto_portmap, "auto"),
        (flags.round_robin, "round-robin"),
        (flags.sticky, "sticky"),
        (flags.fixed_dport, "fixed-dport"),
        (flags.negate_src, "!src"),
        (flags.negate_dst, "!dst"),
        (rule.split_target.is_some(), "split"),
        (rule.proxy.is_some(), "proxy"),
        (rule.filter.is_some(), "filter"),
        (rule.age.is_some(), "age"),
        (rule.mss_clamp.is_some(), "mss"),
    ];
    let set: Vec<&str> = named
        .iter()
        .filter(|(on, _)| *on)
        .map(|(_, name)| *name)
        .collect();
    if set.is_empty() {
        "-".to_string()
    } else {
        set.join(",")
    }
}

// ── Replay ──────────────────────────────────────────────────────────────

/// One packet of a replay trace.
#[derive(Debug, PartialEq, Eq)]
struct TraceLine {
    time: u64,
    direction: Direction,
    interface: String,
    bytes: Vec<u8>,
}

/// Outcome of replaying one trace line.
#[derive(Debug, Serialize)]
struct ReplayStep {
    line: usize,
    time: u64,
    direction: Direction,
    interface: String,
    before: String,
    after: String,
    verdict: String,
}

/// Parse `<seconds> <out|in> <interface> <hex>`. Blank lines and `#`
/// comments yield `None`.
fn parse_trace_line(line: &str) -> Result<Option<TraceLine>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let fields: Vec<&str> = line.split_whitespace().collect();
    let [time, direction, interface, hex_bytes] = fields.as_slice() else {
        bail!("expected `<seconds> <out|in> <interface> <hex>`");
    };

    let time = time
        .parse::<u64>()
        .with_context(|| format!("invalid time '{time}'"))?;
    let direction = match *direction {
        "out" | "outbound" => Direction::Outbound,
        "in" | "inbound" => Direction::Inbound,
        other => bail!("invalid direction '{other}', expected 'out' or 'in'"),
    };
    let bytes = hex::decode(hex_bytes).context("invalid packet hex")?;

    Ok(Some(TraceLine {
        time,
        direction,
        interface: (*interface).to_string(),
        bytes,
    }))
}

fn describe_packet(packet: &Packet) -> String {
    let protocol = packet.protocol();
    if let Some(icmp_type) = packet.icmp_type() {
        return match packet.icmp_id() {
            Some(id) => format!(
                "icmp {} -> {} type {icmp_type} id {id}",
                packet.src(),
                packet.dst()
            ),
            None => format!("icmp {} -> {} type {icmp_type}", packet.src(), packet.dst()),
        };
    }
    match (packet.src_port(), packet.dst_port()) {
        (Some(sport), Some(dport)) => format!(
            "{protocol} {}:{sport} -> {}:{dport}",
            packet.src(),
            packet.dst()
        ),
        _ => format!("{protocol} {} -> {}", packet.src(), packet.dst()),
    }
}

fn verdict_label(verdict: &NatVerdict) -> String {
    match verdict {
        NatVerdict::Unchanged => "unchanged".to_string(),
        NatVerdict::Translated => "translated".to_string(),
        NatVerdict::Blocked(e) => format!("blocked: {e}"),
    }
}

/// Run every packet of `trace` through `service`, expiring sessions as
/// the trace clock advances.
fn replay_trace(service: &NatAppService, trace: &str) -> Result<Vec<ReplayStep>> {
    let mut steps = Vec::new();

    for (idx, raw) in trace.lines().enumerate() {
        let line_no = idx + 1;
        let Some(entry) =
            parse_trace_line(raw).with_context(|| format!("trace line {line_no}"))?
        else {
            continue;
        };

        service.expire_at(entry.time);

        let step = match Packet::parse(entry.bytes, entry.interface.as_str()) {
            Ok(mut packet) => {
                let before = describe_packet(&packet);
                let verdict = service.process_at(&mut packet, entry.direction, entry.time);
                ReplayStep {
                    line: line_no,
                    time: entry.time,
                    direction: entry.direction,
                    interface: entry.interface,
                    before,
                    after: describe_packet(&packet),
                    verdict: verdict_label(&verdict),
                }
            }
            Err(e) => ReplayStep {
                line: line_no,
                time: entry.time,
                direction: entry.direction,
                interface: entry.interface,
                before: "-".to_string(),
                after: "-".to_string(),
                verdict: format!("malformed: {e}"),
            },
        };
        steps.push(step);
    }

    Ok(steps)
}

pub fn cmd_replay(
    config_path: &str,
    file: &str,
    show_sessions: bool,
    output: OutputFormat,
) -> Result<()> {
    let config = AgentConfig::load(Path::new(config_path))
        .with_context(|| format!("failed to load {config_path}"))?;
    let runtime = build_runtime(&config)?;
    let trace =
        std::fs::read_to_string(file).with_context(|| format!("failed to read trace {file}"))?;

    let steps = replay_trace(&runtime.service, &trace)?;
    let sessions = if show_sessions {
        runtime.service.sessions()
    } else {
        Vec::new()
    };

    if output == OutputFormat::Json {
        let combined = serde_json::json!({
            "packets": steps,
            "sessions": sessions,
            "stats": runtime.service.stats(),
        });
        println!("{}", serde_json::to_string_pretty(&combined)?);
        return Ok(());
    }

    for step in &steps {
        println!(
            "{:>5} t={:<6} {:<8} {:<6} {}",
            step.line,
            step.time,
            step.direction.to_string(),
            step.interface,
            step.before
        );
        println!("{:>22} => {}  [{}]", "", step.after, step.verdict);
    }
    println!("\n{} packet(s) replayed.", steps.len());

    if show_sessions {
        print_sessions(&sessions);
    }
    Ok(())
}

fn print_sessions(sessions: &[SessionRecord]) {
    if sessions.is_empty() {
        println!("No active sessions.");
        return;
    }

    println!(
        "\n{:>6}  {:<5}  {:<21}  {:<21}  {:<21}  {:<16}  {:>7}",
        "ID", "PROTO", "INSIDE", "OUTSIDE", "REMOTE", "RULE", "EXPIRES"
    );
    for s in sessions {
        println!(
            "{:>6}  {:<5}  {:<21}  {:<21}  {:<21}  {:<16}  {:>6}s",
            s.id.0,
            s.protocol.to_string(),
            s.inside.to_string(),
            s.outside.to_string(),
            s.remote.to_string(),
            s.rule.as_ref().map_or("-", |r| r.0.as_str()),
            s.expires_in,
        );
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn truncate(s: &str, max: usize) -> String {
    if s.len() > max {
        format!("{}...", &s[..max.saturating_sub(3)])
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    const CONFIG: &str = r"
agent:
  interfaces:
    - name: eth0
      address: 192.0.2.1
nat:
  rules:
    - {id: out, mode: map, interface: eth0, protocol: tcpudp, from: 10.0.0.0/24, to: 0/32, ports: 20000-20100, sticky: true}
";

    /// UDP 10.0.0.5:1234 -> 198.51.100.7:53, no payload.
    const UDP_OUT: &str = "4500001c0001000040114691 0a000005c6336407 04d2003500080000";

    fn udp_out_hex() -> String {
        UDP_OUT.replace(' ', "")
    }

    fn service() -> std::sync::Arc<NatAppService> {
        let config = AgentConfig::from_yaml(CONFIG).unwrap();
        build_runtime(&config).unwrap().service
    }

    // ── Trace parsing ───────────────────────────────────────────────

    #[test]
    fn trace_line_parses_fields() {
        let line = format!("12 out eth0 {}", udp_out_hex());
        let parsed = parse_trace_line(&line).unwrap().unwrap();
        assert_eq!(parsed.time, 12);
        assert_eq!(parsed.direction, Direction::Outbound);
        assert_eq!(parsed.interface, "eth0");
        assert_eq!(parsed.bytes.len(), 28);
    }

    #[test]
    fn trace_comments_and_blanks_are_skipped() {
        assert!(parse_trace_line("").unwrap().is_none());
        assert!(parse_trace_line("   ").unwrap().is_none());
        assert!(parse_trace_line("# recorded on gw1").unwrap().is_none());
    }

    #[test]
    fn trace_line_errors() {
        assert!(parse_trace_line("1 out eth0").is_err());
        assert!(parse_trace_line("x out eth0 45").is_err());
        assert!(parse_trace_line("1 sideways eth0 45").is_err());
        assert!(parse_trace_line("1 in eth0 zz").is_err());
    }

    // ── Replay ──────────────────────────────────────────────────────

    #[test]
    fn replay_translates_outbound_udp() {
        let svc = service();
        let trace = format!("# one packet\n0 out eth0 {}\n", udp_out_hex());
        let steps = replay_trace(&svc, &trace).unwrap();

        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].line, 2);
        assert_eq!(steps[0].verdict, "translated");
        assert_eq!(steps[0].before, "udp 10.0.0.5:1234 -> 198.51.100.7:53");
        assert!(steps[0].after.starts_with("udp 192.0.2.1:"));
        assert_eq!(svc.session_count(), 1);

        let session = &svc.sessions()[0];
        assert_eq!(session.inside.addr, Ipv4Addr::new(10, 0, 0, 5));
        assert!((20000..=20100).contains(&session.outside.port));
    }

    #[test]
    fn replay_reports_malformed_packets_and_continues() {
        let svc = service();
        let trace = format!("0 out eth0 4500\n1 out eth0 {}\n", udp_out_hex());
        let steps = replay_trace(&svc, &trace).unwrap();

        assert_eq!(steps.len(), 2);
        assert!(steps[0].verdict.starts_with("malformed"));
        assert_eq!(steps[1].verdict, "translated");
    }

    #[test]
    fn replay_rejects_bad_trace_line() {
        let svc = service();
        let err = replay_trace(&svc, "0 out eth0\n").unwrap_err();
        assert!(format!("{err:#}").contains("trace line 1"));
    }

    #[test]
    fn replay_clock_expires_sessions() {
        let svc = service();
        let hex = udp_out_hex();
        let trace = format!("0 out eth0 {hex}\n100000 out eth0 {hex}\n");
        let steps = replay_trace(&svc, &trace).unwrap();

        assert_eq!(steps.len(), 2);
        let stats = svc.stats();
        assert_eq!(stats.sessions_expired, 1);
        assert_eq!(stats.sessions_in_use, 1);
    }

    // ── Rule formatting ─────────────────────────────────────────────

    #[test]
    fn format_rule_shows_fields_and_flags() {
        let config = AgentConfig::from_yaml(CONFIG).unwrap();
        let rules = config.nat_rules().unwrap();
        let line = format_rule(&rules[0]);
        assert!(line.starts_with("out "));
        assert!(line.contains("map"));
        assert!(line.contains("tcpudp"));
        assert!(line.contains("10.0.0.0/24"));
        assert!(line.contains("20000-20100"));
        assert!(line.ends_with("sticky"));
    }

    #[test]
    fn format_ports_single_and_range() {
        assert_eq!(format_ports(PortRange { start: 80, end: 80 }), "80");
        assert_eq!(format_ports(PortRange { start: 1, end: 9 }), "1-9");
    }

    #[test]
    fn truncate_long_ids() {
        assert_eq!(truncate("short", 16), "short");
        assert_eq!(truncate("a-very-long-rule-identifier", 10), "a-very-...");
    }
}
