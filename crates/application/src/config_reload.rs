use std::sync::Arc;

use domain::common::error::DomainError;
use domain::nat::entity::NatRule;
use ports::secondary::metrics_port::MetricsPort;
use tokio::sync::Mutex;

use crate::nat_service_impl::NatAppService;

/// Application-level service for hot-reloading the NAT configuration.
///
/// Serializes reloads (one at a time), records reload metrics and logs
/// the outcome.
pub struct ConfigReloadService {
    nat_service: Arc<NatAppService>,
    metrics: Arc<dyn MetricsPort>,
    reload_mutex: Mutex<()>,
}

impl ConfigReloadService {
    pub fn new(nat_service: Arc<NatAppService>, metrics: Arc<dyn MetricsPort>) -> Self {
        Self {
            nat_service,
            metrics,
            reload_mutex: Mutex::new(()),
        }
    }

    /// Replace the NAT rule set. On failure the previous rules stay
    /// installed.
    pub async fn reload_nat(&self, rules: Vec<NatRule>) -> Result<(), DomainError> {
        let _guard = self.reload_mutex.lock().await;
        let count = rules.len();

        match self.nat_service.reload_rules(rules) {
            Ok(()) => {
                self.metrics.record_config_reload("nat", "success");
                tracing::info!(
                    rule_count = count,
                    sessions = self.nat_service.session_count(),
                    "NAT configuration reloaded successfully"
                );
                Ok(())
            }
            Err(e) => {
                self.metrics.record_config_reload("nat", "failure");
                tracing::warn!(error = %e, "NAT configuration reload failed");
                Err(e)
            }
        }
    }

    /// Re-resolve interface addresses after they changed. Returns the
    /// number of sessions moved to a new address.
    pub async fn resync_interfaces(&self, interfaces: &[String]) -> usize {
        let _guard = self.reload_mutex.lock().await;
        let changed = interfaces
            .iter()
            .map(|iface| self.nat_service.sync_interface(iface))
            .sum();
        if changed > 0 {
            self.metrics.record_config_reload("interfaces", "success");
        }
        changed
    }
}
