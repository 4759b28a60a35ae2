//! Top-level orchestration: build the command tree, run it, summarize.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::context::tracker::DEFAULT_CLEANUP_INTERVAL;
use crate::context::{ContextManager, ContextTracker, EventSink};
use crate::controller::{
    CancellationToken, Controller, DependencyPolicy, RunScope, SkipAllController, resolve_controller,
};
use crate::core::builder::build_commands;
use crate::core::filter::Selection;
use crate::core::types::Outcome;
use crate::report::{Statistics, StatisticsSink};
use crate::tree::TestTree;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub dependency_policy: DependencyPolicy,
    /// Dry run: report every selected command as skipped without running it.
    pub skip_execution: bool,
    pub thread_cleanup_interval: Duration,
    pub cancel: CancellationToken,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dependency_policy: DependencyPolicy::default(),
            skip_execution: false,
            thread_cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Combined outcome of the whole run; `None` when nothing matched.
    pub outcome: Option<Outcome>,
    pub command_count: usize,
    pub statistics: Statistics,
}

impl RunReport {
    pub fn is_empty(&self) -> bool {
        self.outcome.is_none()
    }
}

/// Run the tests of `tree` picked by `selection`, publishing step events to
/// `sink`.
///
/// Fails only when the selection cannot be planned (see
/// [`BuildError`](crate::core::builder::BuildError)); test failures are
/// reported through the outcome and the events.
#[instrument(skip_all, fields(tests = tree.len(), exact = selection.exact_filter))]
pub fn run_tests(
    tree: &Arc<TestTree>,
    selection: &Selection,
    options: &RunOptions,
    sink: Arc<dyn EventSink>,
) -> Result<RunReport> {
    let command = build_commands(tree, selection).context("build command tree")?;
    let Some(command) = command else {
        info!("no tests matched the selection");
        return Ok(RunReport::default());
    };
    debug!(plan = %command.render(), "command tree built");

    let statistics = Arc::new(StatisticsSink::new(sink));
    let tracker = Arc::new(ContextTracker::with_cleanup_interval(
        options.thread_cleanup_interval,
    ));
    let manager = Arc::new(
        ContextManager::new(tracker, statistics.clone())
            .with_skip_dynamic_steps(selection.skip_dynamic_tests),
    );
    let scope = RunScope::new(manager)
        .with_policy(options.dependency_policy)
        .with_cancellation(options.cancel.clone());

    let mut root: Box<dyn Controller> = if options.skip_execution {
        Box::new(SkipAllController::skipped())
    } else if options.cancel.is_canceled() {
        Box::new(SkipAllController::canceled())
    } else {
        resolve_controller(&command)
    };
    let outcome = root.run(&command, None, &scope);

    let leaked = scope.manager.running_steps();
    if leaked > 0 {
        warn!(leaked, "steps still running after the root finished");
    }

    let statistics = statistics.statistics();
    info!(outcome = %outcome, summary = %statistics.format_summary(), "run finished");
    Ok(RunReport {
        outcome: Some(outcome),
        command_count: command.test_count(),
        statistics,
    })
}
