//! Structured logging through `tracing`.
//!
//! Console output is pretty for development or JSON for log aggregation;
//! an optional JSON file copy rotates daily.

use anyhow::Context;
use std::path::Path;
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::MonitoringConfig;

/// Install the global subscriber described by `config`.
///
/// `RUST_LOG` takes precedence over `config.log_filter`. Fails if a global
/// subscriber is already installed.
pub fn init_logging(config: &MonitoringConfig) -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_filter)
            .with_context(|| format!("Invalid log filter '{}'", config.log_filter))?,
    };

    let json_layer = config.enable_json_logging.then(|| {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
    });
    let pretty_layer = (!config.enable_json_logging).then(|| {
        fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(true)
    });

    let file_layer = match &config.log_file {
        Some(log_file) => {
            let appender = daily_appender(Path::new(log_file))?;
            Some(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_ansi(false)
                    .with_thread_ids(true)
                    .with_writer(appender),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(pretty_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to set global default subscriber")?;

    info!(
        service_name = %config.service_name,
        log_format = if config.enable_json_logging { "json" } else { "pretty" },
        log_file = ?config.log_file,
        "Logging initialized"
    );

    Ok(())
}

fn daily_appender(log_file: &Path) -> anyhow::Result<RollingFileAppender> {
    let directory = log_file
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let prefix = log_file
        .file_name()
        .with_context(|| format!("Log file '{}' has no file name", log_file.display()))?;
    std::fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create log directory {}", directory.display()))?;
    Ok(RollingFileAppender::new(Rotation::DAILY, directory, prefix))
}

/// Trait to add log context to results
pub trait LogExt<T, E> {
    /// Log the error, if any, with `message` before returning
    fn log_err(self, message: &str) -> Result<T, E>;

    /// Log `message` on success before returning
    fn log_ok(self, message: &str) -> Result<T, E>;
}

impl<T, E: std::fmt::Display> LogExt<T, E> for Result<T, E> {
    fn log_err(self, message: &str) -> Result<T, E> {
        if let Err(ref e) = self {
            tracing::error!("{}: {}", message, e);
        }
        self
    }

    fn log_ok(self, message: &str) -> Result<T, E> {
        if self.is_ok() {
            tracing::info!("{}", message);
        }
        self
    }
}
