// askdoc/crates/askdoc/src/telemetry.rs

use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global subscriber with `info` as the default level.
pub fn init_tracing() {
    init_tracing_with("info");
}

/// `RUST_LOG` wins over `default_filter` when set. Returns false when a
/// global subscriber was already installed.
pub fn init_tracing_with(default_filter: &str) -> bool {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(env_filter))
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_level(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).is_ok()
}
