//! Tracing setup for deployments embedding the core.
//!
//! Everything in the crate logs through `tracing`; this helper wires up a
//! subscriber with env-filter control (`RUST_LOG`) and optional JSON output
//! for log shippers. Libraries embedding the core in a larger app should
//! configure their own subscriber instead and skip this.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// Safe to call more than once: subsequent calls are no-ops (the first
/// subscriber wins), so tests and embedding apps cannot poison each other.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already initialized, keeping existing one");
    }
}
