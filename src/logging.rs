//! Logger setup for hosts that do not install their own `log` backend

use crate::config::LoggingConfig;

/// Initialise `env_logger` with the configured level as default filter.
///
/// `RUST_LOG` still takes precedence. Returns `false` when a logger was
/// already installed, which is harmless.
pub fn init(config: &LoggingConfig) -> bool {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.level))
        .format_timestamp_millis()
        .try_init()
        .is_ok()
}
