//! Development tracing for the orchestrator.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted.
//! - **Task Memory (`io/task_memory`)**: the audit trail of every stage and
//!   transition. Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; defaults to `warn`. Output: stderr, compact format.
/// Call once, at process start.
///
/// # Example
/// ```bash
/// RUST_LOG=orchestrator=info vflow validate --dag dag.json --design-context design.json
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
