//! Development-time tracing for debugging orchestration.
//!
//! The library only emits through `tracing`; installing a subscriber is left
//! to the host, which calls [`init`] once at startup.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics via `RUST_LOG`, output to stderr.
//!   Not part of the run's product output.
//!
//! - **Step events (`context::events`)**: Lifecycle and log notifications
//!   delivered to the host's `EventSink`. Unaffected by `RUST_LOG`; use
//!   `TracingSink` to mirror them into tracing.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing subscriber for development logging.
///
/// Reads `RUST_LOG` env var. Defaults to `warn` if unset.
/// Output: stderr, compact format. Call once from the host process; the
/// library never installs a subscriber itself.
///
/// # Example
///
/// A host installs the subscriber before its first run and mirrors step
/// events into the same output with [`TracingSink`](crate::context::TracingSink):
///
/// ```no_run
/// use std::sync::Arc;
///
/// use orchestrator::context::TracingSink;
/// use orchestrator::core::filter::Selection;
/// use orchestrator::run::{RunOptions, run_tests};
/// use orchestrator::tree::{TestDef, TestTree};
///
/// orchestrator::logging::init();
/// let tree = Arc::new(TestTree::new(TestDef::case("smoke")));
/// let report = run_tests(&tree, &Selection::all(), &RunOptions::default(), Arc::new(TracingSink))?;
/// println!("{}", report.statistics.format_summary());
/// # Ok::<(), anyhow::Error>(())
/// ```
///
/// ```bash
/// RUST_LOG=orchestrator=debug my-host
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
