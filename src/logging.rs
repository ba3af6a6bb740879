//! Tracing subscriber setup for the `docflow` binary.
//!
//! `RUST_LOG` wins over `[log].level` when set. Output goes to stderr so
//! command output on stdout stays machine-readable.

use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

pub fn init(config: &LogConfig) {
    let filter = build_env_filter(&config.level);
    let fmt_layer = fmt::layer().with_writer(std::io::stderr).with_target(true);

    // try_init: tests and embedders may have installed a subscriber already.
    let _ = if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.compact())
            .try_init()
    };
}

fn build_env_filter(level: &str) -> EnvFilter {
    if let Ok(directives) = std::env::var("RUST_LOG") {
        if let Ok(filter) = EnvFilter::try_new(&directives) {
            return filter;
        }
    }
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}
