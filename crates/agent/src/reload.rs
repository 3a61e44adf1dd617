use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use application::config_reload::ConfigReloadService;
use infrastructure::config::AgentConfig;
use infrastructure::interfaces::StaticInterfaceTable;
use notify_debouncer_mini::notify::{self, RecursiveMode};
use notify_debouncer_mini::{DebouncedEvent, DebouncedEventKind, new_debouncer};
use ports::secondary::interface_address::InterfaceAddressPort;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Spawn a background task that watches the config file for changes and
/// listens for SIGHUP, reloading NAT rules and interface addresses.
///
/// Returns the `JoinHandle` so the caller can await cleanup on shutdown.
pub fn spawn_reload_task(
    config_path: String,
    reload_service: Arc<ConfigReloadService>,
    interfaces: Arc<StaticInterfaceTable>,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let (notify_tx, mut notify_rx) = mpsc::channel::<()>(4);

        let mut debouncer = match new_debouncer(
            Duration::from_millis(500),
            move |res: Result<Vec<DebouncedEvent>, notify::Error>| {
                if let Ok(events) = res
                    && events.iter().any(|e| e.kind == DebouncedEventKind::Any)
                {
                    let _ = notify_tx.blocking_send(());
                }
            },
        ) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, "failed to create file watcher, hot-reload disabled");
                return;
            }
        };

        if let Err(e) = debouncer
            .watcher()
            .watch(Path::new(&config_path), RecursiveMode::NonRecursive)
        {
            tracing::warn!(
                path = %config_path,
                error = %e,
                "failed to watch config file, hot-reload disabled"
            );
            return;
        }

        tracing::info!(path = %config_path, "config file watcher started");

        #[cfg(unix)]
        let mut sighup =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(s) => Some(s),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to install SIGHUP handler");
                    None
                }
            };

        loop {
            #[cfg(unix)]
            let hangup = async {
                match sighup.as_mut() {
                    Some(s) => {
                        s.recv().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };
            #[cfg(not(unix))]
            let hangup = std::future::pending::<()>();

            tokio::select! {
                () = cancel_token.cancelled() => {
                    tracing::info!("config watcher shutting down");
                    break;
                }
                _ = notify_rx.recv() => {
                    tracing::info!("config file change detected, reloading");
                }
                () = hangup => {
                    tracing::info!("SIGHUP received, reloading configuration");
                }
            }

            perform_reload(&config_path, &reload_service, &interfaces).await;
        }
    })
}

/// Perform a single config reload: load YAML, convert to domain rules,
/// apply rules, then update interface addresses.
async fn perform_reload(
    config_path: &str,
    reload_service: &ConfigReloadService,
    interfaces: &StaticInterfaceTable,
) {
    // Phase 1: serde deserialization and validation
    let config = match AgentConfig::load(Path::new(config_path)) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "config reload rejected: invalid config");
            return;
        }
    };

    // Phase 2: domain conversion
    let rules = match config.nat_rules() {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "config reload rejected: invalid NAT rules");
            return;
        }
    };

    // Phase 3: rules
    if let Err(e) = reload_service.reload_nat(rules).await {
        tracing::warn!(error = %e, "NAT rule reload failed at application level");
        return;
    }

    // Phase 4: interface addresses
    let changed = apply_interface_addresses(interfaces, &config.interface_addresses());
    if !changed.is_empty() {
        let moved = reload_service.resync_interfaces(&changed).await;
        tracing::info!(interfaces = ?changed, sessions = moved, "interface addresses updated");
    }
}

/// Bring the table in line with `wanted`. Returns the interfaces whose
/// address changed or disappeared, sorted.
fn apply_interface_addresses(
    table: &StaticInterfaceTable,
    wanted: &[(String, Ipv4Addr)],
) -> Vec<String> {
    let wanted: HashMap<&str, Ipv4Addr> = wanted.iter().map(|(n, a)| (n.as_str(), *a)).collect();
    let mut changed = Vec::new();

    for name in table.interfaces() {
        if !wanted.contains_key(name.as_str()) {
            table.remove(&name);
            changed.push(name);
        }
    }
    for (name, addr) in &wanted {
        if table.current_address(name) != Some(*addr) {
            table.set_address(name, *addr);
            changed.push((*name).to_string());
        }
    }

    changed.sort();
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, last: u8) -> (String, Ipv4Addr) {
        (name.to_string(), Ipv4Addr::new(192, 0, 2, last))
    }

    #[test]
    fn unchanged_table_reports_nothing() {
        let table = StaticInterfaceTable::new([entry("eth0", 1)]);
        assert!(apply_interface_addresses(&table, &[entry("eth0", 1)]).is_empty());
    }

    #[test]
    fn new_changed_and_removed_interfaces_are_reported() {
        let table = StaticInterfaceTable::new([entry("eth0", 1), entry("eth1", 2)]);
        let changed =
            apply_interface_addresses(&table, &[entry("eth0", 9), entry("ppp0", 3)]);
        assert_eq!(changed, vec!["eth0", "eth1", "ppp0"]);
        assert_eq!(
            table.current_address("eth0"),
            Some(Ipv4Addr::new(192, 0, 2, 9))
        );
        assert_eq!(table.current_address("eth1"), None);
        assert_eq!(
            table.current_address("ppp0"),
            Some(Ipv4Addr::new(192, 0, 2, 3))
        );
    }
}
