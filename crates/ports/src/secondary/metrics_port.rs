// Focused sub-traits for recording Prometheus metrics, grouped by concern.
//
// All methods take `&self` because the underlying implementation uses
// atomic operations (interior mutability via `prometheus-client`).
//
// Default implementations are no-ops, allowing test mocks to implement
// only the sub-traits relevant to the service under test.

// ── Packet processing metrics ──────────────────────────────────────

pub trait PacketMetrics: Send + Sync {
    /// Record a processed packet with direction and verdict labels.
    fn record_packet(&self, _direction: &str, _verdict: &str) {}

    /// Record a packet whose headers could not be parsed.
    fn record_malformed(&self, _kind: &str) {}
}

// ── NAT session metrics ────────────────────────────────────────────

pub trait NatMetrics: Send + Sync {
    /// Increment the sessions-created counter.
    fn record_session_created(&self, _protocol: &str) {}

    /// Add `count` sessions removed by an expiry sweep.
    fn record_sessions_expired(&self, _count: u64) {}

    /// Record a translated packet for the given direction.
    fn record_translation(&self, _direction: &str) {}

    /// Record a packet blocked by NAT, labelled by reason.
    fn record_blocked(&self, _reason: &str) {}

    /// Increment the bucket-overflow rejection counter.
    fn record_bucket_overflow(&self) {}

    /// Set the number of sessions currently in the table.
    fn set_sessions_in_use(&self, _count: u64) {}

    /// Set the number of wildcard sessions awaiting promotion.
    fn set_wildcard_sessions(&self, _count: u64) {}

    /// Set the number of installed NAT rules.
    fn set_rules_loaded(&self, _count: u64) {}
}

// ── Configuration metrics ──────────────────────────────────────────

pub trait ConfigMetrics: Send + Sync {
    /// Record a configuration reload attempt (success or failure).
    fn record_config_reload(&self, _component: &str, _result: &str) {}
}

// ── Composite super-trait ──────────────────────────────────────────

/// Unified metrics port composing all sub-traits.
///
/// Services accept `Arc<dyn MetricsPort>` for full access. The sub-traits
/// provide default no-op implementations so that test mocks only need to
/// override the methods they care about.
pub trait MetricsPort: PacketMetrics + NatMetrics + ConfigMetrics {}

/// Blanket implementation: any type implementing all sub-traits automatically
/// implements `MetricsPort`.
impl<T> MetricsPort for T where T: PacketMetrics + NatMetrics + ConfigMetrics {}
