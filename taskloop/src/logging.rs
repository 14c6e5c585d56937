//! Development-time tracing for the loop.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Diagnostics via `RUST_LOG` or `-v`, output to
//!   stderr. Not persisted.
//!
//! - **Gate logs (`io/gate`)**: Product artifacts in `<state_dir>/logs/`.
//!   Always written, unaffected by the log level.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter directive for a `-v` count when `RUST_LOG` is unset.
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    }
}

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins when set. Otherwise `verbosity` picks the level.
/// Call once per process; a second call panics.
///
/// # Example
/// ```bash
/// RUST_LOG=taskloop=debug taskloop run
/// ```
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
