use ports::secondary::metrics_port::{ConfigMetrics, NatMetrics, PacketMetrics};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

// ── Label types ─────────────────────────────────────────────────────

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PacketLabels {
    pub direction: String,
    pub verdict: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DirectionLabels {
    pub direction: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReasonLabels {
    pub reason: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct KindLabels {
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProtocolLabels {
    pub protocol: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReloadLabels {
    pub component: String,
    pub result: String,
}

// ── NAT metrics registry ────────────────────────────────────────────

/// Prometheus metrics registry for `natd`.
///
/// All metric families use interior mutability (atomics), so recording
/// only requires `&self`. Wrap in `Arc` to share.
pub struct NatdMetrics {
    registry: Registry,
    pub packets_total: Family<PacketLabels, Counter>,
    pub malformed_total: Family<KindLabels, Counter>,
    pub sessions_created_total: Family<ProtocolLabels, Counter>,
    pub sessions_expired_total: Counter,
    pub translations_total: Family<DirectionLabels, Counter>,
    pub blocked_total: Family<ReasonLabels, Counter>,
    pub bucket_overflows_total: Counter,
    pub sessions_in_use: Gauge,
    pub wildcard_sessions: Gauge,
    pub rules_loaded: Gauge,
    pub config_reloads_total: Family<ReloadLabels, Counter>,
}

impl NatdMetrics {
    /// Create a registry with every metric registered under the `natd`
    /// prefix.
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("natd");

        let packets_total = Family::<PacketLabels, Counter>::default();
        registry.register(
            "packets",
            "Packets seen by the NAT engine by direction and verdict",
            packets_total.clone(),
        );

        let malformed_total = Family::<KindLabels, Counter>::default();
        registry.register(
            "malformed_packets",
            "Packets whose headers could not be parsed",
            malformed_total.clone(),
        );

        let sessions_created_total = Family::<ProtocolLabels, Counter>::default();
        registry.register(
            "sessions_created",
            "NAT sessions created by protocol",
            sessions_created_total.clone(),
        );

        let sessions_expired_total = Counter::default();
        registry.register(
            "sessions_expired",
            "NAT sessions removed by idle expiry",
            sessions_expired_total.clone(),
        );

        let translations_total = Family::<DirectionLabels, Counter>::default();
        registry.register(
            "translations",
            "Packets rewritten by direction",
            translations_total.clone(),
        );

        let blocked_total = Family::<ReasonLabels, Counter>::default();
        registry.register(
            "blocked",
            "Packets a rule matched but could not translate, by reason",
            blocked_total.clone(),
        );

        let bucket_overflows_total = Counter::default();
        registry.register(
            "bucket_overflows",
            "Session creations refused by a full hash bucket",
            bucket_overflows_total.clone(),
        );

        let sessions_in_use = Gauge::default();
        registry.register(
            "sessions_in_use",
            "Sessions currently in the table",
            sessions_in_use.clone(),
        );

        let wildcard_sessions = Gauge::default();
        registry.register(
            "wildcard_sessions",
            "Wildcard sessions awaiting their first packet",
            wildcard_sessions.clone(),
        );

        let rules_loaded = Gauge::default();
        registry.register(
            "rules_loaded",
            "Installed NAT rules",
            rules_loaded.clone(),
        );

        let config_reloads_total = Family::<ReloadLabels, Counter>::default();
        registry.register(
            "config_reloads",
            "Configuration reload attempts",
            config_reloads_total.clone(),
        );

        Self {
            registry,
            packets_total,
            malformed_total,
            sessions_created_total,
            sessions_expired_total,
            translations_total,
            blocked_total,
            bucket_overflows_total,
            sessions_in_use,
            wildcard_sessions,
            rules_loaded,
            config_reloads_total,
        }
    }

    /// Encode all registered metrics to `OpenMetrics` text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

impl Default for NatdMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn gauge_value(count: u64) -> i64 {
    count.try_into().unwrap_or(i64::MAX)
}

// ── Sub-trait implementations ──────────────────────────────────────

impl PacketMetrics for NatdMetrics {
    fn record_packet(&self, direction: &str, verdict: &str) {
        self.packets_total
            .get_or_create(&PacketLabels {
                direction: direction.to_string(),
                verdict: verdict.to_string(),
            })
            .inc();
    }

    fn record_malformed(&self, kind: &str) {
        self.malformed_total
            .get_or_create(&KindLabels {
                kind: kind.to_string(),
            })
            .inc();
    }
}

impl NatMetrics for NatdMetrics {
    fn record_session_created(&self, protocol: &str) {
        self.sessions_created_total
            .get_or_create(&ProtocolLabels {
                protocol: protocol.to_string(),
            })
            .inc();
    }

    fn record_sessions_expired(&self, count: u64) {
        self.sessions_expired_total.inc_by(count);
    }

    fn record_translation(&self, direction: &str) {
        self.translations_total
            .get_or_create(&DirectionLabels {
                direction: direction.to_string(),
            })
            .inc();
    }

    fn record_blocked(&self, reason: &str) {
        self.blocked_total
            .get_or_create(&ReasonLabels {
                reason: reason.to_string(),
            })
            .inc();
    }

    fn record_bucket_overflow(&self) {
        self.bucket_overflows_total.inc();
    }

    fn set_sessions_in_use(&self, count: u64) {
        self.sessions_in_use.set(gauge_value(count));
    }

    fn set_wildcard_sessions(&self, count: u64) {
        self.wildcard_sessions.set(gauge_value(count));
    }

    fn set_rules_loaded(&self, count: u64) {
        self.rules_loaded.set(gauge_value(count));
    }
}

impl ConfigMetrics for NatdMetrics {
    fn record_config_reload(&self, component: &str, result: &str) {
        self.config_reloads_total
            .get_or_create(&ReloadLabels {
                component: component.to_string(),
                result: result.to_string(),
            })
            .inc();
    }
}

// MetricsPort comes from the blanket impl over the three sub-traits.
