use std::env;

use anyhow::{Result, anyhow};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

pub const LOG_ENV: &str = "HEAVY_LIFTER_LOG";
const DEFAULT_FILTER: &str = "info";

/// Operator notices go to stderr so stdout only carries reports.
pub fn init_logging(verbose: bool) -> Result<()> {
    let filter = match env::var(LOG_ENV) {
        Ok(value) if !value.trim().is_empty() => EnvFilter::try_new(value.trim())
            .map_err(|error| anyhow!("invalid {LOG_ENV} filter: {error}"))?,
        _ if verbose => EnvFilter::new("debug"),
        _ => EnvFilter::new(DEFAULT_FILTER),
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .without_time(),
        )
        .with(filter)
        .try_init()
        .map_err(|error| anyhow!("failed to install log subscriber: {error}"))
}
