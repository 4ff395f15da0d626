//! Logging setup.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Environment variable holding an `EnvFilter` directive.
pub const LOG_ENV: &str = "GATEKEEPER_LOG";

/// Filter from `GATEKEEPER_LOG`, falling back to the configured level.
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| level_filter(&config.level))
}

/// Filter for a configured level directive; `info` if it does not parse.
fn level_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Logs go to stderr. Calling this twice is
/// harmless; the second call is ignored.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = env_filter(config);
    let fmt = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let result = if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt.json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt)
            .try_init()
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::filter::LevelFilter;

    #[test]
    fn test_configured_level_sets_max_level() {
        assert_eq!(level_filter("debug").max_level_hint(), Some(LevelFilter::DEBUG));
        assert_eq!(level_filter("warn").max_level_hint(), Some(LevelFilter::WARN));
    }

    #[test]
    fn test_filter_falls_back_to_info_on_garbage_level() {
        assert_eq!(
            level_filter("gatekeeper=loudest").max_level_hint(),
            Some(LevelFilter::INFO)
        );
    }

    #[test]
    fn test_init_twice_is_harmless() {
        let config = LoggingConfig::default();
        init_tracing(&config);
        init_tracing(&config);
    }
}
