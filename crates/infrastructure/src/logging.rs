use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{ConfigError, LogFormat, LogLevel};

/// Directive used when `RUST_LOG` is unset: the configured level for the
/// NAT crates, warnings for everything else.
pub fn default_directive(level: LogLevel) -> String {
    let level = level.as_str();
    format!("warn,natd={level},application={level},domain={level},infrastructure={level}")
}

/// Initialize structured logging to stdout.
///
/// - `LogFormat::Json`: flattened JSON, one object per line.
/// - `LogFormat::Text`: human-readable colored output.
///
/// `RUST_LOG` overrides the configured level. Fails if a global
/// subscriber is already installed.
pub fn init_logging(level: LogLevel, format: LogFormat) -> Result<(), ConfigError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(level)));

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_target(true)
                    .with_ansi(false),
            )
            .try_init(),
        LogFormat::Text => registry
            .with(fmt::layer().pretty().with_target(true).with_ansi(true))
            .try_init(),
    };

    result.map_err(|e| ConfigError::Validation {
        field: "agent.log_format".to_string(),
        message: format!("cannot install {format} logger: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directive_is_valid_env_filter() {
        for level in [
            LogLevel::Error,
            LogLevel::Warn,
            LogLevel::Info,
            LogLevel::Debug,
            LogLevel::Trace,
        ] {
            let directive = default_directive(level);
            assert!(
                EnvFilter::try_new(&directive).is_ok(),
                "{directive} should be a valid filter"
            );
        }
    }

    #[test]
    fn default_directive_scopes_nat_crates() {
        let directive = default_directive(LogLevel::Debug);
        assert!(directive.starts_with("warn,"));
        assert!(directive.contains("application=debug"));
        assert!(directive.contains("natd=debug"));
    }
}
