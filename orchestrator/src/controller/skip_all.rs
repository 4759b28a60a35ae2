//! Reports a whole subtree without running it.

use std::sync::Arc;

use crate::context::StepContext;
use crate::controller::{Controller, FinishGuard, RunScope, start_context};
use crate::core::command::Command;
use crate::core::types::Outcome;

/// Starts every context in the subtree and finishes it immediately with a
/// fixed outcome, so observers still see a result for every command.
///
/// Used for dry runs, cancellation and dependency skipping. Master tests are
/// not delegated.
#[derive(Debug, Clone)]
pub struct SkipAllController {
    outcome: Outcome,
    note: Option<String>,
}

impl SkipAllController {
    pub fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            note: None,
        }
    }

    pub fn skipped() -> Self {
        Self::new(Outcome::skipped())
    }

    pub fn canceled() -> Self {
        Self::new(Outcome::canceled())
    }

    /// Warning written to the log of the subtree's top step.
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    fn skip(&self, command: &Command, parent: Option<&Arc<StepContext>>, scope: &RunScope, note: Option<&str>) {
        let Some(context) = start_context(command, parent, scope) else {
            return;
        };
        let guard = FinishGuard::new(context);
        if let Some(note) = note {
            guard.context().log().warning(note);
        }
        for child in command.children() {
            self.skip(child, Some(guard.context()), scope, None);
        }
        guard.finish(self.outcome.clone());
        scope.ledger.record(command.test_id(), self.outcome.clone());
    }
}

impl Controller for SkipAllController {
    fn run(&mut self, command: &Command, parent: Option<&Arc<StepContext>>, scope: &RunScope) -> Outcome {
        self.skip(command, parent, scope, self.note.as_deref());
        self.outcome.clone()
    }
}
