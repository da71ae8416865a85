//! Development-time tracing for debugging the reconciler.
//!
//! Product output is the tick report on stdout plus the files on disk;
//! tracing goes to stderr and is controlled by `RUST_LOG` (default `warn`).

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
