// src/logging.rs
use tracing_subscriber::EnvFilter;

/// Sets up the global tracing subscriber.
///
/// `RUST_LOG` wins over `default_level` when set. Safe to call more than once.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
