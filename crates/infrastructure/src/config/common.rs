//! Shared parsing helpers and error types used across all config modules.

use std::net::Ipv4Addr;
use std::path::Path;

use tracing::warn;

use domain::common::entity::Protocol;
use domain::nat::entity::Ipv4Net;

// ── Limits ─────────────────────────────────────────────────────────
//
// Upper bounds on config collections to prevent OOM from excessive config.

/// Maximum NAT rules in one config file.
pub(super) const MAX_NAT_RULES: usize = 4096;
/// Maximum statically configured interfaces.
pub(super) const MAX_INTERFACES: usize = 256;
/// Largest accepted session table.
pub(super) const MAX_TABLE_MAX: usize = 4_000_000;

// ── Config errors ──────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(String),

    #[error("validation error: {field}: {message}")]
    Validation { field: String, message: String },

    #[error("invalid CIDR notation '{value}': {reason}")]
    InvalidCidr { value: String, reason: String },

    #[error("invalid port range '{value}': {reason}")]
    InvalidPortRange { value: String, reason: String },

    #[error("invalid value '{value}' for field '{field}': expected one of {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },
}

impl From<serde_yaml_ng::Error> for ConfigError {
    fn from(e: serde_yaml_ng::Error) -> Self {
        Self::Yaml(e.to_string())
    }
}

// ── Parsing helpers ────────────────────────────────────────────────

/// Parse an IPv4 network like `"10.0.0.0/24"`, `"192.0.2.1"` or the
/// interface address placeholder `"0/32"`.
pub fn parse_cidr(s: &str) -> Result<Ipv4Net, ConfigError> {
    let text = match s.trim() {
        "0/32" => "0.0.0.0/32",
        other => other,
    };
    text.parse::<Ipv4Net>().map_err(|e| ConfigError::InvalidCidr {
        value: s.to_string(),
        reason: e.to_string(),
    })
}

/// Parse a single IPv4 address, reporting failures against `field`.
pub(super) fn parse_addr(s: &str, field: &str) -> Result<Ipv4Addr, ConfigError> {
    s.trim()
        .parse::<Ipv4Addr>()
        .map_err(|e| ConfigError::Validation {
            field: field.to_string(),
            message: format!("invalid IPv4 address '{s}': {e}"),
        })
}

/// Parse a rule protocol. `tcpudp` (or `tcp/udp`) selects both TCP and
/// UDP and is reported as `(Protocol::Any, true)`.
pub(super) fn parse_protocol(s: &str) -> Result<(Protocol, bool), ()> {
    match s.to_lowercase().as_str() {
        "tcpudp" | "tcp/udp" => Ok((Protocol::Any, true)),
        "*" => Ok((Protocol::Any, false)),
        other => other.parse::<Protocol>().map(|p| (p, false)).map_err(|_| ()),
    }
}

/// Log a warning if a file is world-readable (Unix only).
#[cfg(unix)]
pub(super) fn warn_if_world_readable(path: &Path, label: &str) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = std::fs::metadata(path) {
        let mode = metadata.permissions().mode();
        if mode & 0o004 != 0 {
            warn!(
                path = %path.display(),
                mode = format!("{mode:04o}"),
                "{label} is world-readable, consider chmod 640 or stricter",
            );
        }
    }
}

#[cfg(not(unix))]
pub(super) fn warn_if_world_readable(_path: &Path, _label: &str) {}

/// Enforce a maximum count on a config collection.
pub(super) fn check_limit(field: &str, count: usize, max: usize) -> Result<(), ConfigError> {
    if count > max {
        return Err(ConfigError::Validation {
            field: field.to_string(),
            message: format!("count {count} exceeds maximum {max}"),
        });
    }
    Ok(())
}
