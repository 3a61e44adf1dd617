use crate::secondary::metrics_port::{ConfigMetrics, NatMetrics, PacketMetrics};

/// No-op implementation of all metrics sub-traits for use in tests.
///
/// All methods inherit the default no-op implementations from the sub-traits.
pub struct NoopMetrics;

impl PacketMetrics for NoopMetrics {}
impl NatMetrics for NoopMetrics {}
impl ConfigMetrics for NoopMetrics {}
