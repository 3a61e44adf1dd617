//! NAT configuration parsing.
//!
//! Rules use ipnat vocabulary: `from` is the side a rule matches and
//! `to` the side it translates to. For `map`, `bimap` and `map_block`
//! that is inside network to outside pool; for `rdr` it is public
//! destination to target.

use std::collections::HashSet;

use domain::common::entity::RuleId;
use domain::nat::aging::NatTimeouts;
use domain::nat::engine::{DEFAULT_TABLE_MAX, DEFAULT_TABLE_SIZE, NatConfig};
use domain::nat::entity::{
    AgeOverride, FilterTuple, NatMode, NatRule, PortRange, PortsPerHost, ProxyBinding, RuleFlags,
};
use serde::{Deserialize, Serialize};

use super::common::{
    ConfigError, MAX_NAT_RULES, MAX_TABLE_MAX, check_limit, parse_addr, parse_cidr,
    parse_protocol,
};

// ── Section ────────────────────────────────────────────────────────

/// The `nat:` section: table sizing, timeouts and the rule list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NatSectionConfig {
    #[serde(default = "default_table_size")]
    pub table_size: usize,

    #[serde(default = "default_table_max")]
    pub table_max: usize,

    /// Longest allowed hash bucket. Derived from `table_size` when unset.
    #[serde(default)]
    pub max_bucket: Option<usize>,

    /// Idle timeout overrides in seconds.
    #[serde(default)]
    pub timeouts: NatTimeouts,

    #[serde(default)]
    pub rules: Vec<NatRuleConfig>,
}

impl Default for NatSectionConfig {
    fn default() -> Self {
        Self {
            table_size: DEFAULT_TABLE_SIZE,
            table_max: DEFAULT_TABLE_MAX,
            max_bucket: None,
            timeouts: NatTimeouts::default(),
            rules: Vec::new(),
        }
    }
}

fn default_table_size() -> usize {
    DEFAULT_TABLE_SIZE
}

fn default_table_max() -> usize {
    DEFAULT_TABLE_MAX
}

impl NatSectionConfig {
    /// Validate the entire NAT section.
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.table_size == 0 {
            return Err(ConfigError::Validation {
                field: "nat.table_size".to_string(),
                message: "table_size must be > 0".to_string(),
            });
        }
        if self.table_max == 0 || self.table_max > MAX_TABLE_MAX {
            return Err(ConfigError::Validation {
                field: "nat.table_max".to_string(),
                message: format!("table_max must be 1-{MAX_TABLE_MAX}"),
            });
        }
        if self.max_bucket == Some(0) {
            return Err(ConfigError::Validation {
                field: "nat.max_bucket".to_string(),
                message: "max_bucket must be > 0".to_string(),
            });
        }

        check_limit("nat.rules", self.rules.len(), MAX_NAT_RULES)?;

        let mut seen = HashSet::new();
        for (idx, rule_cfg) in self.rules.iter().enumerate() {
            rule_cfg.validate(idx)?;
            if !seen.insert(rule_cfg.id.as_str()) {
                return Err(ConfigError::Validation {
                    field: format!("nat.rules[{idx}].id"),
                    message: format!("duplicate rule ID '{}'", rule_cfg.id),
                });
            }
        }
        Ok(())
    }

    /// Engine sizing and timeouts.
    pub fn to_engine_config(&self) -> NatConfig {
        NatConfig {
            table_size: self.table_size,
            table_max: self.table_max,
            max_bucket: self.max_bucket,
            timeouts: self.timeouts,
        }
    }

    /// Convert every rule, in file order.
    pub fn to_domain_rules(&self) -> Result<Vec<NatRule>, ConfigError> {
        self.rules
            .iter()
            .enumerate()
            .map(|(idx, r)| r.to_domain_rule(idx))
            .collect()
    }
}

// ── Rule ───────────────────────────────────────────────────────────

/// YAML representation of a single NAT rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NatRuleConfig {
    pub id: String,

    /// `map`, `rdr`, `bimap` or `map_block`.
    pub mode: String,

    #[serde(default)]
    pub interface: Option<String>,

    /// Interface whose address `0/32` rules translate to.
    #[serde(default)]
    pub out_interface: Option<String>,

    /// `tcp`, `udp`, `tcpudp`, `icmp`, `any` or a protocol number.
    #[serde(default = "default_protocol")]
    pub protocol: String,

    pub from: String,

    pub to: String,

    /// Map: translated source ports. Rdr: matched public ports.
    #[serde(default)]
    pub ports: Option<PortRangeConfig>,

    /// Rdr: first target port.
    #[serde(default)]
    pub target_port: Option<u16>,

    #[serde(default)]
    pub auto_portmap: bool,

    /// Map-block: `auto` or a fixed count.
    #[serde(default)]
    pub ports_per_host: Option<PortsPerHostConfig>,

    #[serde(default)]
    pub round_robin: bool,

    #[serde(default)]
    pub sticky: bool,

    /// Rdr: second target alternated with `to`.
    #[serde(default)]
    pub split_to: Option<String>,

    /// Map: last address of a pool starting at `to`.
    #[serde(default)]
    pub ip_range: Option<String>,

    #[serde(default)]
    pub fixed_dport: bool,

    #[serde(default)]
    pub negate_src: bool,

    #[serde(default)]
    pub negate_dst: bool,

    #[serde(default)]
    pub mss_clamp: Option<u16>,

    #[serde(default)]
    pub age: Option<AgeConfig>,

    /// Only match packets carrying this filter tag.
    #[serde(default)]
    pub tag: Option<String>,

    #[serde(default)]
    pub proxy: Option<ProxyConfig>,

    #[serde(default)]
    pub filter: Option<FilterConfig>,
}

fn default_protocol() -> String {
    "any".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortsPerHostConfig {
    Count(u32),
    Keyword(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgeConfig {
    pub forward: u32,
    /// Defaults to `forward`.
    #[serde(default)]
    pub reverse: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    pub label: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    /// Remote side of the flow.
    #[serde(default)]
    pub peer: Option<String>,
    #[serde(default)]
    pub src_ports: Option<PortRangeConfig>,
    #[serde(default)]
    pub dst_ports: Option<PortRangeConfig>,
}

fn parse_mode(s: &str) -> Option<NatMode> {
    match s.to_lowercase().as_str() {
        "map" => Some(NatMode::Map),
        "rdr" | "redirect" => Some(NatMode::Redirect),
        "bimap" => Some(NatMode::Bimap),
        "map_block" | "map-block" => Some(NatMode::MapBlock),
        _ => None,
    }
}

impl NatRuleConfig {
    /// Validate this rule config.
    pub(super) fn validate(&self, idx: usize) -> Result<(), ConfigError> {
        self.to_domain_rule(idx).map(|_| ())
    }

    /// Convert to a domain `NatRule`. `idx` is the rule's position in
    /// `nat.rules`, used in error field paths.
    pub fn to_domain_rule(&self, idx: usize) -> Result<NatRule, ConfigError> {
        let prefix = format!("nat.rules[{idx}]");

        RuleId(self.id.clone())
            .validate()
            .map_err(|reason| ConfigError::Validation {
                field: format!("{prefix}.id"),
                message: reason.to_string(),
            })?;

        let mode = parse_mode(&self.mode).ok_or_else(|| ConfigError::InvalidValue {
            field: format!("{prefix}.mode"),
            value: self.mode.clone(),
            expected: "map, rdr, bimap, map_block".to_string(),
        })?;

        let (protocol, tcp_udp) =
            parse_protocol(&self.protocol).map_err(|()| ConfigError::InvalidValue {
                field: format!("{prefix}.protocol"),
                value: self.protocol.clone(),
                expected: "tcp, udp, tcpudp, icmp, any, <0-255>".to_string(),
            })?;

        let from = parse_cidr(&self.from).map_err(|e| ConfigError::Validation {
            field: format!("{prefix}.from"),
            message: e.to_string(),
        })?;
        let to = parse_cidr(&self.to).map_err(|e| ConfigError::Validation {
            field: format!("{prefix}.to"),
            message: e.to_string(),
        })?;
        let (inside, outside) = if mode == NatMode::Redirect {
            (to, from)
        } else {
            (from, to)
        };

        let mut rule = NatRule::new(self.id.clone(), mode, inside, outside);
        rule.interface.clone_from(&self.interface);
        rule.out_interface.clone_from(&self.out_interface);
        rule.protocol = protocol;
        rule.ports = self
            .ports
            .as_ref()
            .map(|p| p.to_domain_field(&format!("{prefix}.ports")))
            .transpose()?;
        rule.target_port = self.target_port;
        rule.flags = RuleFlags {
            tcp_udp,
            auto_portmap: self.auto_portmap,
            round_robin: self.round_robin,
            sticky: self.sticky,
            fixed_dport: self.fixed_dport,
            negate_src: self.negate_src,
            negate_dst: self.negate_dst,
        };
        rule.ports_per_host = match &self.ports_per_host {
            None => None,
            Some(PortsPerHostConfig::Count(n)) => Some(PortsPerHost::Fixed(*n)),
            Some(PortsPerHostConfig::Keyword(k)) if k.eq_ignore_ascii_case("auto") => {
                Some(PortsPerHost::Auto)
            }
            Some(PortsPerHostConfig::Keyword(k)) => {
                return Err(ConfigError::InvalidValue {
                    field: format!("{prefix}.ports_per_host"),
                    value: k.clone(),
                    expected: "auto, <count>".to_string(),
                });
            }
        };
        if rule.ports_per_host.is_some() && mode != NatMode::MapBlock {
            return Err(ConfigError::Validation {
                field: format!("{prefix}.ports_per_host"),
                message: "ports_per_host is only valid for map_block rules".to_string(),
            });
        }
        rule.split_target = self
            .split_to
            .as_deref()
            .map(|s| parse_addr(s, &format!("{prefix}.split_to")))
            .transpose()?;
        rule.outside_range_end = self
            .ip_range
            .as_deref()
            .map(|s| parse_addr(s, &format!("{prefix}.ip_range")))
            .transpose()?;
        rule.mss_clamp = self.mss_clamp;
        rule.age = self.age.as_ref().map(|a| AgeOverride {
            forward_secs: a.forward,
            reverse_secs: a.reverse.unwrap_or(a.forward),
        });
        rule.tag.clone_from(&self.tag);
        rule.proxy = self.proxy.as_ref().map(|p| ProxyBinding {
            label: p.label.clone(),
            port: p.port,
        });
        rule.filter = self
            .filter
            .as_ref()
            .map(|f| f.to_domain(&format!("{prefix}.filter")))
            .transpose()?;

        rule.validate().map_err(|e| ConfigError::Validation {
            field: prefix,
            message: e.to_string(),
        })?;
        Ok(rule)
    }
}

impl FilterConfig {
    fn to_domain(&self, prefix: &str) -> Result<FilterTuple, ConfigError> {
        let peer = self
            .peer
            .as_deref()
            .map(|p| {
                parse_cidr(p).map_err(|e| ConfigError::Validation {
                    field: format!("{prefix}.peer"),
                    message: e.to_string(),
                })
            })
            .transpose()?;
        Ok(FilterTuple {
            peer,
            src_ports: self
                .src_ports
                .as_ref()
                .map(|p| p.to_domain_field(&format!("{prefix}.src_ports")))
                .transpose()?,
            dst_ports: self
                .dst_ports
                .as_ref()
                .map(|p| p.to_domain_field(&format!("{prefix}.dst_ports")))
                .transpose()?,
        })
    }
}

// ── Port range config ──────────────────────────────────────────────

/// `80`, `"80"`, `"1024-65535"` or `{ start: 1024, end: 65535 }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortRangeConfig {
    Single(u16),
    Range(String),
    Explicit { start: u16, end: u16 },
}

impl PortRangeConfig {
    pub fn to_domain(&self) -> Result<PortRange, ConfigError> {
        let (start, end) = match self {
            Self::Single(port) => (*port, *port),
            Self::Range(s) => {
                if let Ok(port) = s.trim().parse::<u16>() {
                    (port, port)
                } else {
                    let (start_str, end_str) =
                        s.split_once('-')
                            .ok_or_else(|| ConfigError::InvalidPortRange {
                                value: s.clone(),
                                reason: "expected format 'start-end' (e.g. '1024-65535')"
                                    .to_string(),
                            })?;
                    let parse = |part: &str, which: &str| {
                        part.trim()
                            .parse::<u16>()
                            .map_err(|_| ConfigError::InvalidPortRange {
                                value: s.clone(),
                                reason: format!("invalid {which} port: '{part}'"),
                            })
                    };
                    (parse(start_str, "start")?, parse(end_str, "end")?)
                }
            }
            Self::Explicit { start, end } => (*start, *end),
        };
        if start == 0 {
            return Err(ConfigError::InvalidPortRange {
                value: format!("{start}-{end}"),
                reason: "port 0 is not allowed".to_string(),
            });
        }
        if start > end {
            return Err(ConfigError::InvalidPortRange {
                value: format!("{start}-{end}"),
                reason: format!("start ({start}) must be <= end ({end})"),
            });
        }
        Ok(PortRange { start, end })
    }

    fn to_domain_field(&self, field: &str) -> Result<PortRange, ConfigError> {
        self.to_domain().map_err(|e| ConfigError::Validation {
            field: field.to_string(),
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use domain::common::entity::Protocol;

    use super::*;

    fn rule(yaml: &str) -> NatRuleConfig {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    // ── Map rules ─────────────────────────────────────────────────

    #[test]
    fn map_rule_from_is_inside() {
        let cfg = rule(
            r"
id: map-1
mode: map
interface: eth0
protocol: tcpudp
from: 10.0.0.0/24
to: 192.0.2.1/32
ports: 20000-20100
",
        );
        let r = cfg.to_domain_rule(0).unwrap();
        assert_eq!(r.mode, NatMode::Map);
        assert_eq!(r.inside.to_string(), "10.0.0.0/24");
        assert_eq!(r.outside.to_string(), "192.0.2.1/32");
        assert_eq!(r.ports, Some(PortRange { start: 20000, end: 20100 }));
        assert!(r.flags.tcp_udp);
        assert_eq!(r.protocol, Protocol::Any);
        assert_eq!(r.interface.as_deref(), Some("eth0"));
    }

    #[test]
    fn map_to_interface_address() {
        let cfg = rule("{id: m, mode: map, from: 10.0.0.0/8, to: 0/32, out_interface: ppp0}");
        let r = cfg.to_domain_rule(0).unwrap();
        assert!(r.outside.is_interface_address());
        assert_eq!(r.out_interface.as_deref(), Some("ppp0"));
    }

    #[test]
    fn map_ip_range() {
        let cfg =
            rule("{id: m, mode: map, from: 10.0.0.0/24, to: 192.0.2.10, ip_range: 192.0.2.20}");
        let r = cfg.to_domain_rule(0).unwrap();
        assert_eq!(r.outside_range_end, Some(Ipv4Addr::new(192, 0, 2, 20)));
    }

    #[test]
    fn map_block_ports_per_host() {
        let auto = rule(
            "{id: mb, mode: map_block, from: 10.0.0.0/24, to: 192.0.2.0/30, ports_per_host: auto}",
        );
        assert_eq!(
            auto.to_domain_rule(0).unwrap().ports_per_host,
            Some(PortsPerHost::Auto)
        );
        let fixed = rule(
            "{id: mb, mode: map_block, from: 10.0.0.0/24, to: 192.0.2.0/30, ports_per_host: 100}",
        );
        assert_eq!(
            fixed.to_domain_rule(0).unwrap().ports_per_host,
            Some(PortsPerHost::Fixed(100))
        );
    }

    #[test]
    fn ports_per_host_needs_map_block() {
        let cfg = rule("{id: m, mode: map, from: 10.0.0.0/24, to: 192.0.2.1, ports_per_host: 10}");
        let err = cfg.to_domain_rule(2).unwrap_err();
        assert!(err.to_string().contains("nat.rules[2].ports_per_host"));
    }

    // ── Redirect rules ────────────────────────────────────────────

    #[test]
    fn rdr_rule_from_is_outside() {
        let cfg = rule(
            r"
id: web
mode: rdr
protocol: tcp
from: 203.0.113.5/32
to: 10.0.0.20/32
ports: 80
target_port: 8080
",
        );
        let r = cfg.to_domain_rule(0).unwrap();
        assert_eq!(r.mode, NatMode::Redirect);
        assert_eq!(r.outside.addr(), Ipv4Addr::new(203, 0, 113, 5));
        assert_eq!(r.inside.addr(), Ipv4Addr::new(10, 0, 0, 20));
        assert_eq!(r.ports, Some(PortRange::single(80)));
        assert_eq!(r.target_port, Some(8080));
    }

    #[test]
    fn rdr_split_target() {
        let cfg = rule(
            "{id: lb, mode: rdr, protocol: tcp, from: 203.0.113.5, to: 10.0.0.20, split_to: 10.0.0.21, ports: 80}",
        );
        let r = cfg.to_domain_rule(0).unwrap();
        assert_eq!(r.split_target, Some(Ipv4Addr::new(10, 0, 0, 21)));
    }

    // ── Optional features ─────────────────────────────────────────

    #[test]
    fn age_reverse_defaults_to_forward() {
        let cfg = rule("{id: m, mode: map, from: 10.0.0.0/24, to: 192.0.2.1, age: {forward: 30}}");
        let age = cfg.to_domain_rule(0).unwrap().age.unwrap();
        assert_eq!(age.forward_secs, 30);
        assert_eq!(age.reverse_secs, 30);
    }

    #[test]
    fn proxy_filter_and_tag() {
        let cfg = rule(
            r"
id: ftp
mode: map
protocol: tcp
from: 10.0.0.0/24
to: 192.0.2.1
tag: lan
proxy: {label: ftp, port: 21}
filter:
  peer: 198.51.100.0/24
  dst_ports: 21
",
        );
        let r = cfg.to_domain_rule(0).unwrap();
        assert_eq!(r.tag.as_deref(), Some("lan"));
        assert_eq!(r.proxy.as_ref().map(|p| p.port), Some(21));
        let filter = r.filter.unwrap();
        assert_eq!(filter.peer.unwrap().to_string(), "198.51.100.0/24");
        assert_eq!(filter.dst_ports, Some(PortRange::single(21)));
    }

    // ── Validation paths ──────────────────────────────────────────

    #[test]
    fn bad_from_reports_field_path() {
        let cfg = rule("{id: m, mode: map, from: 10.0.0.0/40, to: 192.0.2.1}");
        let err = cfg.to_domain_rule(3).unwrap_err();
        assert!(err.to_string().contains("nat.rules[3].from"));
    }

    #[test]
    fn unknown_mode_rejected() {
        let cfg = rule("{id: m, mode: nat, from: 10.0.0.0/8, to: 192.0.2.1}");
        assert!(matches!(
            cfg.to_domain_rule(0),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn bimap_size_mismatch_is_domain_error() {
        let cfg = rule("{id: b, mode: bimap, from: 10.0.0.0/24, to: 192.0.2.0/28}");
        let err = cfg.to_domain_rule(1).unwrap_err();
        assert!(err.to_string().contains("nat.rules[1]"));
        assert!(err.to_string().contains("same size"));
    }

    #[test]
    fn unknown_rule_field_rejected() {
        let result: Result<NatRuleConfig, _> =
            serde_yaml_ng::from_str("{id: m, mode: map, from: 10.0.0.0/8, to: 0/32, bogus: 1}");
        assert!(result.is_err());
    }

    // ── Port ranges ───────────────────────────────────────────────

    #[test]
    fn port_range_forms() {
        let single: PortRangeConfig = serde_yaml_ng::from_str("80").unwrap();
        assert_eq!(single.to_domain().unwrap(), PortRange::single(80));
        let range: PortRangeConfig = serde_yaml_ng::from_str("\"1024-2048\"").unwrap();
        assert_eq!(range.to_domain().unwrap(), PortRange { start: 1024, end: 2048 });
        let explicit: PortRangeConfig = serde_yaml_ng::from_str("{start: 5, end: 6}").unwrap();
        assert_eq!(explicit.to_domain().unwrap(), PortRange { start: 5, end: 6 });
    }

    #[test]
    fn port_range_rejects_inverted_and_zero() {
        assert!(PortRangeConfig::Range("2000-1000".to_string()).to_domain().is_err());
        assert!(PortRangeConfig::Single(0).to_domain().is_err());
        assert!(PortRangeConfig::Range("a-b".to_string()).to_domain().is_err());
    }

    // ── Section ───────────────────────────────────────────────────

    #[test]
    fn section_rejects_duplicate_ids() {
        let section: NatSectionConfig = serde_yaml_ng::from_str(
            r"
rules:
  - {id: dup, mode: map, from: 10.0.0.0/24, to: 192.0.2.1}
  - {id: dup, mode: map, from: 10.0.1.0/24, to: 192.0.2.2}
",
        )
        .unwrap();
        let err = section.validate().unwrap_err();
        assert!(err.to_string().contains("nat.rules[1].id"));
    }

    #[test]
    fn section_defaults_and_timeouts() {
        let section: NatSectionConfig =
            serde_yaml_ng::from_str("{table_max: 100, timeouts: {udp: 30}}").unwrap();
        section.validate().unwrap();
        let engine = section.to_engine_config();
        assert_eq!(engine.table_size, DEFAULT_TABLE_SIZE);
        assert_eq!(engine.table_max, 100);
        assert_eq!(engine.timeouts.udp, 30);
        assert_eq!(engine.timeouts.icmp, NatTimeouts::default().icmp);
    }

    #[test]
    fn section_rejects_zero_table() {
        let section: NatSectionConfig = serde_yaml_ng::from_str("{table_size: 0}").unwrap();
        assert!(section.validate().is_err());
    }
}
