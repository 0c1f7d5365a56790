//! Logging setup for node binaries.
//!
//! Library code only emits `tracing` events; installing a subscriber is the
//! binary's decision, made once at startup through one of these helpers.

use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize structured logging with the given base level.
///
/// `RUST_LOG` overrides `level` when set, so operators can turn on
/// per-module filters without a redeploy.
pub fn setup_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();

    Ok(())
}

/// Initialize logging with JSON output for log aggregation pipelines.
pub fn setup_logging_json(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().with_target(false))
        .init();

    Ok(())
}
