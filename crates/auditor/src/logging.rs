//! Tracing subscriber setup shared by the OrderProof binaries.

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

const CRATES: [&str; 3] = ["orderproof_auditor", "orderproof_api", "tower_http"];

fn directives(level: &str) -> String {
    CRATES
        .iter()
        .map(|krate| format!("{}={}", krate, level))
        .collect::<Vec<_>>()
        .join(",")
}

/// Initialize tracing subscriber for logging.
///
/// `RUST_LOG` wins over the configured level unless `debug` is set.
pub fn init_logging(debug: bool, config: &LoggingConfig) -> Result<()> {
    let env_filter = if debug {
        EnvFilter::new(format!("{},sqlx=debug", directives("debug")))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives(&config.level)))
    };

    let registry = tracing_subscriber::registry().with(env_filter);

    if config.format == "json" {
        registry
            .with(fmt::layer().json().with_target(true).with_current_span(false))
            .try_init()
            .context("Failed to initialize logging")?;
    } else {
        registry
            .with(fmt::layer().with_target(true).with_line_number(true))
            .try_init()
            .context("Failed to initialize logging")?;
    }

    Ok(())
}
