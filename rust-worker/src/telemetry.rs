//! Structured JSON logging setup shared by the binaries.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber: `RUST_LOG` filter (default `info`) and
/// flattened JSON events on stdout.
pub fn init() {
    tracing_subscriber::registry()
        .with(filter())
        .with(fmt::layer().json().flatten_event(true))
        .init();
}

/// Same as `init`, but logs go to stderr so stdout stays free for output.
pub fn init_stderr() {
    tracing_subscriber::registry()
        .with(filter())
        .with(
            fmt::layer()
                .json()
                .flatten_event(true)
                .with_writer(std::io::stderr),
        )
        .init();
}
