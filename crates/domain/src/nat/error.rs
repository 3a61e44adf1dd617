use thiserror::Error;

use crate::common::error::DomainError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NatError {
    #[error("invalid NAT rule: {reason}")]
    InvalidRule { reason: String },

    #[error("duplicate NAT rule: {id}")]
    DuplicateRule { id: String },

    #[error("NAT rule not found: {id}")]
    RuleNotFound { id: String },

    #[error("invalid port range: {start}..{end}")]
    InvalidPortRange { start: u16, end: u16 },

    #[error("NAT session not found: {id}")]
    SessionNotFound { id: u64 },

    /// A rule matched but every address/port in its space is taken.
    #[error("rule {rule} has no free address/port left")]
    RuleAllocationExhausted { rule: String },

    /// A session hash bucket is already at its configured maximum length.
    #[error("session hash bucket overflow")]
    HashBucketOverflow,

    #[error("session table full ({max} entries)")]
    TableFull { max: usize },

    #[error("no address configured on interface {interface}")]
    NoInterfaceAddress { interface: String },

    /// The datagram embedded in an ICMP error is too short to rewrite.
    #[error("malformed embedded packet: {0}")]
    MalformedEmbeddedPacket(&'static str),

    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    #[error("proxy {label} rejected the translation")]
    ProxyRejected { label: String },
}

impl From<NatError> for DomainError {
    fn from(e: NatError) -> Self {
        match e {
            NatError::DuplicateRule { ref id } => DomainError::DuplicateRule(id.clone()),
            NatError::RuleNotFound { ref id } => DomainError::RuleNotFound(id.clone()),
            NatError::InvalidRule { .. } => DomainError::InvalidRule(e.to_string()),
            other => DomainError::EngineError(other.to_string()),
        }
    }
}
