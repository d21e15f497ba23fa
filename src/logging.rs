//! Logging Module
//!
//! Initializes the tracing subscriber from the configured log level.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// `level` is one of `debug`/`info`/`warn`/`error`; anything else falls back
/// to `info`. `RUST_LOG` takes precedence when set so operators can turn on
/// per-module filtering without touching the config file.
pub fn init(level: &str) {
    let level = match level.to_ascii_lowercase().as_str() {
        "debug" => "debug",
        "info" => "info",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("oci_proxy={level},{level}")));

    // try_init so repeated calls (tests, error-path re-init) are harmless
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
