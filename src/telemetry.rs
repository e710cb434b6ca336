//! Optional tracing setup for embedding applications.
//!
//! The library itself never installs a global subscriber — every `#[instrument]` and log call
//! throughout `engine`, `persistence`, and `worker` is inert until a binary initializes one.
//! This is a convenience for examples and integration tests, not a requirement.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs a `tracing-subscriber` registry with an `RUST_LOG`-driven env filter, falling back
/// to `default_filter` when `RUST_LOG` is unset or invalid.
///
/// Calling this more than once per process panics, the same as any other global subscriber
/// install — intended for a single call near the top of `main`.
pub fn init(default_filter: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
