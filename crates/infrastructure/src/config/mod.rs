//! Agent configuration: structs, parsing, and validation.
//!
//! The config module is split across sub-modules:
//! - `common`: shared helpers and `ConfigError`
//! - `nat`: the `nat:` section and its rule list

mod common;
mod nat;

pub use common::{ConfigError, parse_cidr};
pub use nat::{
    AgeConfig, FilterConfig, NatRuleConfig, NatSectionConfig, PortRangeConfig,
    PortsPerHostConfig, ProxyConfig,
};

use std::net::Ipv4Addr;
use std::path::Path;

use domain::nat::engine::NatConfig;
use domain::nat::entity::NatRule;
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_EXPIRY_INTERVAL_SECS, DEFAULT_STATS_INTERVAL_SECS};
use common::{MAX_INTERFACES, check_limit, parse_addr, warn_if_world_readable};

// ── Top-level config ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(default)]
    pub agent: AgentInfo,

    #[serde(default)]
    pub nat: NatSectionConfig,
}

impl AgentConfig {
    /// Load config from a YAML file.
    ///
    /// On Unix, logs a warning if the config file is world-readable.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        warn_if_world_readable(path, "config file");
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse config from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the config after deserialization.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.metrics_file.as_deref() == Some("") {
            return Err(ConfigError::Validation {
                field: "agent.metrics_file".to_string(),
                message: "metrics file path must not be empty".to_string(),
            });
        }
        if self.agent.expiry_interval_secs == 0 {
            return Err(ConfigError::Validation {
                field: "agent.expiry_interval_secs".to_string(),
                message: "expiry interval must be > 0".to_string(),
            });
        }

        check_limit(
            "agent.interfaces",
            self.agent.interfaces.len(),
            MAX_INTERFACES,
        )?;
        for (idx, iface) in self.agent.interfaces.iter().enumerate() {
            iface.validate(idx)?;
        }

        self.nat.validate()
    }

    /// Engine sizing and timeouts from the `nat:` section.
    pub fn nat_config(&self) -> NatConfig {
        self.nat.to_engine_config()
    }

    /// Convert NAT rule configs to domain rules.
    pub fn nat_rules(&self) -> Result<Vec<NatRule>, ConfigError> {
        self.nat.to_domain_rules()
    }

    /// Statically configured interface addresses, skipping interfaces
    /// without one.
    pub fn interface_addresses(&self) -> Vec<(String, Ipv4Addr)> {
        self.agent
            .interfaces
            .iter()
            .filter_map(|i| {
                let addr = i.address.as_deref()?.parse::<Ipv4Addr>().ok()?;
                Some((i.name.clone(), addr))
            })
            .collect()
    }
}

// ── Agent info ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentInfo {
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    /// Seconds between session expiry sweeps.
    #[serde(default = "default_expiry_interval")]
    pub expiry_interval_secs: u64,

    /// Seconds between statistics log lines. `0` disables them.
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,

    /// File the OpenMetrics text is written to on every stats tick, for a
    /// node exporter textfile collector.
    #[serde(default)]
    pub metrics_file: Option<String>,

    /// Interfaces referenced by rules, with the address `0/32` rules
    /// translate to.
    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,
}

impl Default for AgentInfo {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            expiry_interval_secs: default_expiry_interval(),
            stats_interval_secs: default_stats_interval(),
            metrics_file: None,
            interfaces: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterfaceConfig {
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
}

impl InterfaceConfig {
    fn validate(&self, idx: usize) -> Result<(), ConfigError> {
        let prefix = format!("agent.interfaces[{idx}]");
        if self.name.is_empty() {
            return Err(ConfigError::Validation {
                field: format!("{prefix}.name"),
                message: "interface name must not be empty".to_string(),
            });
        }
        if let Some(ref addr) = self.address {
            parse_addr(addr, &format!("{prefix}.address"))?;
        }
        Ok(())
    }
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}
fn default_log_format() -> LogFormat {
    LogFormat::Json
}
fn default_expiry_interval() -> u64 {
    DEFAULT_EXPIRY_INTERVAL_SECS
}
fn default_stats_interval() -> u64 {
    DEFAULT_STATS_INTERVAL_SECS
}

// ── Log level ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            _ => Err(format!(
                "invalid log level '{s}': expected error|warn|info|debug|trace"
            )),
        }
    }
}

// ── Log format ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Text => "text",
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" | "pretty" => Ok(Self::Text),
            _ => Err(format!("invalid log format '{s}': expected json|text")),
        }
    }
}
