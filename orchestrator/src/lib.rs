//! Test execution orchestration.
//!
//! Turns a declared test tree and a selection into an ordered command tree,
//! then runs it through controllers that start and finish one step context
//! per executed test. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (outcomes, filters, the command
//!   builder with dependency ordering and cycle detection). No I/O, no threads.
//! - **[`context`]**: Runtime step state: the per-thread context tracker, step
//!   contexts and their lifecycle, event publication.
//! - **[`controller`]**: Execution strategies walking the command tree,
//!   including master-test delegation and dependency policies.
//! - **[`io`]**: Side-effecting helpers (TOML config, JSON tree store).
//!
//! [`run::run_tests`] ties the layers together for a single run.

pub mod context;
pub mod controller;
pub mod core;
pub mod io;
pub mod logging;
pub mod report;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tree;
