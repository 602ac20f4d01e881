//! Logging initialization helpers built on tracing.
//!
//! The library itself only emits construction-time `debug!` events; these
//! helpers exist for binaries and examples that want output.

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize structured JSON logging.
///
/// Reads the log level from the `RUST_LOG` environment variable
/// (defaults to "info").
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hint_flow=info,hint_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
    info!("Structured logging initialized");
}

/// Initialize human-readable console logging (for examples/debugging).
pub fn init_console_logging() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,hint_flow=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().pretty())
        .init();
    info!("Console logging initialized");
}
