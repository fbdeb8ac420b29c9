//! Logging configuration using tracing

use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::Result;

/// Environment variable that overrides the default filter.
pub const LOG_ENV_VAR: &str = "WLINK_LOG";

const DEFAULT_FILTER: &str = "widget_link=info,wlink_session=info,wlink_app=info,warn";

const LOG_FILE_NAME: &str = "wlink.log";

/// Initialize the logging subsystem
///
/// Logs are written to `~/.local/share/widget-link/logs/`. Stdout is left
/// alone because the headless runner writes NDJSON events there.
/// Log level is controlled by the `WLINK_LOG` environment variable.
///
/// # Examples
/// ```bash
/// WLINK_LOG=debug wlink --config ./config.toml
/// WLINK_LOG=wlink_session=trace wlink
/// ```
pub fn init() -> Result<()> {
    let log_dir = get_log_directory()?;
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, LOG_FILE_NAME);

    let env_filter =
        EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(true)
                .with_line_number(true)
                .with_timer(fmt::time::ChronoLocal::new(
                    "%Y-%m-%d %H:%M:%S%.3f".to_string(),
                )),
        )
        .init();

    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("widget-link starting");
    if let Ok(log_file) = get_current_log_file() {
        tracing::info!("Log file: {}", log_file.display());
    }
    tracing::info!("═══════════════════════════════════════════════════════");

    Ok(())
}

/// Get the log directory path
fn get_log_directory() -> Result<PathBuf> {
    let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    Ok(base.join("widget-link").join("logs"))
}

/// Get the log file path for the current day
pub fn get_current_log_file() -> Result<PathBuf> {
    let dir = get_log_directory()?;
    Ok(dir.join(LOG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_lives_under_widget_link_dir() {
        let path = get_current_log_file().unwrap();
        assert!(path.ends_with("widget-link/logs/wlink.log"));
    }

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }
}
