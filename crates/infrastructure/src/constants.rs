use std::time::Duration;

// ── Paths ──────────────────────────────────────────────────────────

pub const DEFAULT_CONFIG_PATH: &str = "/etc/natd/natd.yaml";

// ── Timers ─────────────────────────────────────────────────────────

/// Seconds between session expiry sweeps.
pub const DEFAULT_EXPIRY_INTERVAL_SECS: u64 = 1;

/// Seconds between statistics log lines.
pub const DEFAULT_STATS_INTERVAL_SECS: u64 = 60;

pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// ── Fragment cache ─────────────────────────────────────────────────

/// Seconds a first fragment's session is remembered for its followers.
pub const FRAGMENT_TTL_SECS: u64 = 60;

/// Upper bound on remembered fragment trains.
pub const FRAGMENT_CACHE_CAPACITY: usize = 8192;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_are_positive() {
        assert!(DEFAULT_EXPIRY_INTERVAL_SECS > 0);
        assert!(DEFAULT_STATS_INTERVAL_SECS >= DEFAULT_EXPIRY_INTERVAL_SECS);
    }

    #[test]
    fn shutdown_timeout_is_reasonable() {
        assert!(GRACEFUL_SHUTDOWN_TIMEOUT.as_secs() >= 1);
        assert!(GRACEFUL_SHUTDOWN_TIMEOUT.as_secs() <= 30);
    }

    #[test]
    fn fragment_cache_is_bounded() {
        assert!(FRAGMENT_TTL_SECS > 0);
        assert!(FRAGMENT_CACHE_CAPACITY > 0);
    }
}
