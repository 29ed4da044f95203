//! Logging Infrastructure
//!
//! Structured logging setup for development (pretty console) and production
//! (JSON console plus a daily rotating JSON file).

use std::fs;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the logging system
///
/// # Arguments
/// * `log_level` - Default level when `RUST_LOG` is unset (defaults to "info")
/// * `json` - JSON console output (defaults to false)
/// * `log_dir` - Optional directory for `ledger-server.YYYY-MM-DD` log files
///
/// Returns an error if a global subscriber is already installed.
pub fn init_logger_with_file(
    log_level: Option<&str>,
    json: Option<bool>,
    log_dir: Option<&str>,
) -> anyhow::Result<()> {
    let level = log_level.unwrap_or("info");
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (pretty_layer, json_layer) = if json.unwrap_or(false) {
        let layer = fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .with_thread_ids(true);
        (None, Some(layer))
    } else {
        let layer = fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_line_number(false);
        (Some(layer), None)
    };

    let file_layer = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, "ledger-server");
            Some(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_target(true)
                    .with_writer(appender),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(pretty_layer)
        .with(json_layer)
        .with(file_layer)
        .try_init()?;

    Ok(())
}
