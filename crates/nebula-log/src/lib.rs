//! Structured logging for the Nebula session server.
//!
//! Provides structured, filterable logging via the `tracing` ecosystem.
//! Supports console output with uptime timestamps and module paths, plus an
//! optional JSON log file for post-mortem analysis. The log level comes from
//! `RUST_LOG` when set, otherwise from the configuration.

use nebula_config::Config;
use std::path::Path;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither `RUST_LOG` nor the config specify one.
pub const DEFAULT_FILTER: &str = "info";

/// Name of the JSON log file created inside the log directory.
pub const LOG_FILE_NAME: &str = "nebula-server.log";

/// Initialize the global tracing subscriber.
///
/// Sets up:
/// - Console output with uptime, module paths, thread names and levels
/// - JSON file logging into `log_dir` when `file_logging` is set
/// - Environment-based filtering (respects RUST_LOG)
///
/// # Examples
///
/// ```no_run
/// use nebula_log::init_logging;
/// use nebula_config::Config;
///
/// let config = Config::default();
/// init_logging(Some(std::path::Path::new("./logs")), true, Some(&config));
/// ```
pub fn init_logging(log_dir: Option<&Path>, file_logging: bool, config: Option<&Config>) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(config)));

    // Worker thread names identify which runtime thread ran a session callback.
    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if file_logging
        && let Some(log_dir) = log_dir
        && std::fs::create_dir_all(log_dir).is_ok()
        && let Ok(log_file) = std::fs::File::create(log_dir.join(LOG_FILE_NAME))
    {
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::uptime())
            .json();

        subscriber.with(file_layer).init();
        return;
    }

    subscriber.init();
}

/// Filter directive taken from the config, or [`DEFAULT_FILTER`].
pub fn filter_directive(config: Option<&Config>) -> String {
    config
        .map(|config| config.log.log_level.trim())
        .filter(|level| !level.is_empty())
        .unwrap_or(DEFAULT_FILTER)
        .to_string()
}

/// Create an `EnvFilter` with the default filter string.
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}
