use std::fs::OpenOptions;
use std::sync::Mutex;

use anyhow::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::Config;

/// Install the global subscriber: stdout, plus a file when configured.
///
/// `RUST_LOG` takes precedence over the configured `node.log_level`.
pub fn init(config: &Config) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.node.log_level))
        .with_context(|| format!("invalid log level '{}'", config.node.log_level))?;

    let file_layer = if config.logging.log_to_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.logging.log_file_path)
            .with_context(|| format!("cannot open log file {}", config.logging.log_file_path))?;
        Some(
            fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
    } else {
        None
    };

    let stdout_layer = fmt::layer().with_file(true).with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to initialize logging")
}
