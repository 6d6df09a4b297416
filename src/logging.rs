use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs a global `tracing` subscriber reading `RUST_LOG`, defaulting
/// to `info` for this crate. Safe to call more than once; subsequent
/// calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fulfillment_core=info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init();
}

/// Like [`init`], but emits JSON lines. Intended for production embeds.
pub fn init_json() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fulfillment_core=info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().with_target(true))
        .try_init();
}
