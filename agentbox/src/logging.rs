//! Tracing setup for the agentbox worker.
//!
//! Diagnostics go to stderr so that stdout stays reserved for command output
//! (`agentbox parse` prints JSON there).

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `info` if unset, since the worker is long
/// running and its lifecycle lines are the primary operational record.
///
/// # Example
/// ```bash
/// RUST_LOG=agentbox=debug agentbox run --task-id 7 --user-id alice
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
