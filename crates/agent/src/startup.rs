use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use application::config_reload::ConfigReloadService;
use application::nat_service_impl::NatAppService;
use infrastructure::config::AgentConfig;
use infrastructure::constants::GRACEFUL_SHUTDOWN_TIMEOUT;
use infrastructure::fragment_cache::MemoryFragmentCache;
use infrastructure::interfaces::StaticInterfaceTable;
use infrastructure::logging::init_logging;
use infrastructure::metrics::NatdMetrics;
use ports::secondary::interface_address::InterfaceAddressPort;
use ports::secondary::metrics_port::MetricsPort;
use tracing::{info, warn};

use crate::cli::Cli;

/// Everything `run` and `replay` share: the NAT service and the adapters
/// plugged into it.
pub struct NatRuntime {
    pub service: Arc<NatAppService>,
    pub interfaces: Arc<StaticInterfaceTable>,
    pub metrics: Arc<NatdMetrics>,
}

/// Build the NAT service from a validated config and install its rules.
pub fn build_runtime(config: &AgentConfig) -> anyhow::Result<NatRuntime> {
    let metrics = Arc::new(NatdMetrics::new());
    let interfaces = Arc::new(StaticInterfaceTable::new(config.interface_addresses()));

    let mut service = NatAppService::new(
        config.nat_config(),
        Arc::clone(&metrics) as Arc<dyn MetricsPort>,
    );
    service.set_fragment_cache(Arc::new(MemoryFragmentCache::default()));
    service.set_interface_resolver(Arc::clone(&interfaces) as Arc<dyn InterfaceAddressPort>);
    service.reload_rules(config.nat_rules()?)?;

    Ok(NatRuntime {
        service: Arc::new(service),
        interfaces,
        metrics,
    })
}

/// Run the daemon startup sequence and block until shutdown.
pub async fn run(cli: &Cli) -> anyhow::Result<()> {
    // ── 1. Load config ──────────────────────────────────────────────
    let config = AgentConfig::load(Path::new(&cli.config))?;

    // ── 2. Initialize logging ───────────────────────────────────────
    // CLI flags take precedence over config file
    let log_level = cli.log_level.unwrap_or(config.agent.log_level);
    let log_format = cli.log_format.unwrap_or(config.agent.log_format);
    init_logging(log_level, log_format)?;

    let _root_span = tracing::span!(
        tracing::Level::INFO,
        "service",
        service.name = "natd",
        service.version = env!("CARGO_PKG_VERSION"),
    )
    .entered();

    info!(
        config_path = %cli.config,
        log_level = log_level.as_str(),
        log_format = log_format.as_str(),
        "natd starting"
    );

    // ── 3. Build the NAT service ────────────────────────────────────
    let runtime = build_runtime(&config)?;
    let nat_config = config.nat_config();
    info!(
        rule_count = runtime.service.rule_count(),
        table_size = nat_config.table_size,
        table_max = nat_config.table_max,
        max_bucket = nat_config.max_bucket(),
        interfaces = ?runtime.interfaces.interfaces(),
        "NAT engine initialized"
    );

    let cancel_token = crate::shutdown::create_shutdown_token();

    // ── 4. Spawn the expiry sweep ───────────────────────────────────
    let expiry_period = Duration::from_secs(config.agent.expiry_interval_secs);
    let expiry_handle = tokio::spawn(
        Arc::clone(&runtime.service).expiry_loop(expiry_period, cancel_token.clone()),
    );

    // ── 5. Spawn the stats reporter ─────────────────────────────────
    let stats_handle = if config.agent.stats_interval_secs == 0 {
        None
    } else {
        let service = Arc::clone(&runtime.service);
        let metrics = Arc::clone(&runtime.metrics);
        let metrics_file = config.agent.metrics_file.clone();
        let period = Duration::from_secs(config.agent.stats_interval_secs);
        let stats_cancel = cancel_token.clone();
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    () = stats_cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                log_stats(&service);
                if let Some(ref path) = metrics_file {
                    write_metrics_file(&metrics, path).await;
                }
            }
        }))
    };

    // ── 6. Spawn the config watcher ─────────────────────────────────
    let reload_service = Arc::new(ConfigReloadService::new(
        Arc::clone(&runtime.service),
        Arc::clone(&runtime.metrics) as Arc<dyn MetricsPort>,
    ));
    let reload_handle = crate::reload::spawn_reload_task(
        cli.config.clone(),
        reload_service,
        Arc::clone(&runtime.interfaces),
        cancel_token.clone(),
    );

    // ── 7. Ready, wait for cancellation ─────────────────────────────
    info!("natd ready, waiting for shutdown signal");
    cancel_token.cancelled().await;

    // ── 8. Ordered shutdown sequence ────────────────────────────────
    info!("shutdown phase 1: stopping timers");
    let _ = tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, expiry_handle).await;
    if let Some(handle) = stats_handle {
        let _ = tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, handle).await;
    }

    info!("shutdown phase 2: stopping config watcher");
    let _ = tokio::time::timeout(Duration::from_secs(1), reload_handle).await;

    log_stats(&runtime.service);
    info!("natd stopped");
    Ok(())
}

fn log_stats(service: &NatAppService) {
    let stats = service.stats();
    info!(
        sessions_in_use = stats.sessions_in_use,
        sessions_added = stats.sessions_added,
        sessions_expired = stats.sessions_expired,
        wildcards = stats.wildcards,
        bad_nat = stats.bad_nat,
        table_full = stats.table_full,
        bucket_overflows = stats.bucket_overflows,
        translated_outbound = stats.translated_outbound,
        translated_inbound = stats.translated_inbound,
        rules = stats.rules,
        "NAT statistics"
    );
}

/// Write the OpenMetrics text atomically: temp file, then rename.
async fn write_metrics_file(metrics: &NatdMetrics, path: &str) {
    let text = match metrics.encode() {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "failed to encode metrics");
            return;
        }
    };
    let tmp = format!("{path}.tmp");
    let result = async {
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, path).await
    }
    .await;
    if let Err(e) = result {
        warn!(path, error = %e, "failed to write metrics file");
    }
}
