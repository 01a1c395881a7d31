//! Logging setup.
//!
//! All logs go to **stderr**: stdout carries the handshake line the engine
//! parses to find the server.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Controls log levels (e.g., `info`, `debug`, `lifecycle_provider=debug`)
//!
//! # Examples
//!
//! ```bash
//! # Show engine decisions and per-RPC debug lines
//! RUST_LOG=lifecycle_provider=debug ./lifecycle-provider
//!
//! # Only problems
//! RUST_LOG=warn ./lifecycle-provider
//! ```

use tracing_subscriber::{fmt, prelude::*, registry::Registry, EnvFilter, Layer};

const DEFAULT_LEVEL: &str = "info";

fn stderr_layer(default_level: &str) -> impl Layer<Registry> + Send + Sync {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_filter(filter)
}

/// Initialize the default logging subscriber.
///
/// Respects `RUST_LOG` and defaults to `info`.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn init_logging() {
    init_logging_with_default(DEFAULT_LEVEL);
}

/// Initialize logging with a custom default level, used when `RUST_LOG` is
/// not set.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn init_logging_with_default(default_level: &str) {
    tracing_subscriber::registry()
        .with(stderr_layer(default_level))
        .init();
}

/// Try to initialize logging, returning false if already initialized.
pub fn try_init_logging() -> bool {
    tracing_subscriber::registry()
        .with(stderr_layer(DEFAULT_LEVEL))
        .try_init()
        .is_ok()
}
