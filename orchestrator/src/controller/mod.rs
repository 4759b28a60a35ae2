//! Controllers walk a command tree, starting and finishing step contexts.
//!
//! The recursive controller runs a command and its children in order. A test
//! that carries a [`ControllerFactory`] is a master test: the controller
//! running its parent hands the whole subtree to a controller created by that
//! factory instead of running it itself.

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::context::{ContextManager, Step, StepContext};
use crate::core::command::Command;
use crate::core::types::Outcome;

pub mod cancel;
pub mod policy;
pub mod recursive;
pub mod skip_all;

pub use cancel::CancellationToken;
pub use policy::{DependencyPolicy, OutcomeLedger};
pub use recursive::RecursiveController;
pub use skip_all::SkipAllController;

/// Execution strategy for a command subtree.
pub trait Controller: Send {
    /// Run `command` and everything below it as a child of `parent`.
    ///
    /// Every context started must be finished before returning. The result is
    /// the combined outcome of the subtree.
    fn run(&mut self, command: &Command, parent: Option<&Arc<StepContext>>, scope: &RunScope) -> Outcome;
}

/// Creates the controller of a master test.
pub trait ControllerFactory: Send + Sync {
    fn create(&self) -> Box<dyn Controller>;
}

impl<F> ControllerFactory for F
where
    F: Fn() -> Box<dyn Controller> + Send + Sync,
{
    fn create(&self) -> Box<dyn Controller> {
        self()
    }
}

/// State shared by every controller of one run.
pub struct RunScope {
    pub manager: Arc<ContextManager>,
    pub cancel: CancellationToken,
    pub policy: DependencyPolicy,
    pub ledger: OutcomeLedger,
}

impl RunScope {
    pub fn new(manager: Arc<ContextManager>) -> Self {
        Self {
            manager,
            cancel: CancellationToken::new(),
            policy: DependencyPolicy::default(),
            ledger: OutcomeLedger::new(),
        }
    }

    pub fn with_policy(mut self, policy: DependencyPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Controller for the root command: its own factory if it is a master test,
/// otherwise the recursive controller.
pub fn resolve_controller(command: &Command) -> Box<dyn Controller> {
    match command.test().controller_factory() {
        Some(factory) => factory.create(),
        None => Box::new(RecursiveController::new()),
    }
}

/// Run one command on behalf of `controller`.
///
/// Checks cancellation, applies the dependency policy, hands master tests to
/// their own controller and records the subtree outcome for dependents.
pub fn run_command(
    controller: &mut dyn Controller,
    command: &Command,
    parent: Option<&Arc<StepContext>>,
    scope: &RunScope,
) -> Outcome {
    let outcome = if scope.cancel.is_canceled() {
        debug!(test = %command.full_name(), "run canceled; skipping");
        SkipAllController::canceled().run(command, parent, scope)
    } else if let Some(outcome) = apply_dependency_policy(command, parent, scope) {
        outcome
    } else if let Some(factory) = command.test().controller_factory() {
        info!(test = %command.full_name(), "delegating to master test controller");
        factory.create().run(command, parent, scope)
    } else {
        controller.run(command, parent, scope)
    };
    scope.ledger.record(command.test_id(), outcome.clone());
    outcome
}

fn apply_dependency_policy(
    command: &Command,
    parent: Option<&Arc<StepContext>>,
    scope: &RunScope,
) -> Option<Outcome> {
    if scope.policy == DependencyPolicy::OrderOnly {
        return None;
    }
    let (dependency, outcome) = scope.ledger.first_unsatisfied(command.dependencies())?;
    let note = format!(
        "Dependency '{}' did not pass (outcome: {}).\n",
        command.tree().full_name(dependency),
        outcome
    );
    debug!(test = %command.full_name(), dependency = %dependency.index(), "dependency unsatisfied");

    match scope.policy {
        DependencyPolicy::OrderOnly => None,
        DependencyPolicy::SkipDependents => Some(
            SkipAllController::new(Outcome::skipped())
                .with_note(note)
                .run(command, parent, scope),
        ),
        DependencyPolicy::FailDependents => {
            let Some(context) = start_context(command, parent, scope) else {
                return Some(Outcome::error());
            };
            let guard = FinishGuard::new(context);
            guard.context().log().failure(note);
            let mut skip = SkipAllController::new(Outcome::skipped());
            for child in command.children() {
                skip.run(child, Some(guard.context()), scope);
            }
            guard.finish(Outcome::failed());
            Some(Outcome::failed())
        }
    }
}

/// Start the primary step of `command`. Start failures are host bugs and are
/// logged; the caller reports the command as `error`.
pub fn start_context(
    command: &Command,
    parent: Option<&Arc<StepContext>>,
    scope: &RunScope,
) -> Option<Arc<StepContext>> {
    let step = Step::primary(command, parent.map(|p| p.step()));
    match scope.manager.start_step(parent, step) {
        Ok(context) => Some(context),
        Err(err) => {
            error!(test = %command.full_name(), error = %err, "failed to start step");
            None
        }
    }
}

/// Finishes the context with `error` if dropped before [`FinishGuard::finish`],
/// e.g. while unwinding.
pub struct FinishGuard {
    context: Arc<StepContext>,
    armed: bool,
}

impl FinishGuard {
    pub fn new(context: Arc<StepContext>) -> Self {
        Self {
            context,
            armed: true,
        }
    }

    pub fn context(&self) -> &Arc<StepContext> {
        &self.context
    }

    pub fn finish(mut self, outcome: Outcome) {
        self.armed = false;
        self.context.finish(outcome);
    }
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if self.armed && self.context.finish(Outcome::error()) {
            error!(step = %self.context.step().id, "controller left step unfinished");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{self, AssertUnwindSafe};

    use super::*;
    use crate::context::StepStatus;
    use crate::test_support::{RecordingSink, outcome_of, recording_scope, single_command};

    #[test]
    fn dropped_guard_finishes_with_error() {
        let sink = Arc::new(RecordingSink::default());
        let scope = recording_scope(&sink);
        let command = single_command("leaf");
        let context = start_context(&command, None, &scope).expect("context");

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let _guard = FinishGuard::new(Arc::clone(&context));
            panic!("controller bug");
        }));

        assert!(result.is_err());
        assert_eq!(context.status(), StepStatus::Finished);
        assert_eq!(outcome_of(&sink, "leaf"), Some(Outcome::error()));
        assert_eq!(scope.manager.running_steps(), 0);
    }

    #[test]
    fn finished_guard_keeps_the_given_outcome() {
        let sink = Arc::new(RecordingSink::default());
        let scope = recording_scope(&sink);
        let command = single_command("leaf");
        let context = start_context(&command, None, &scope).expect("context");

        FinishGuard::new(context).finish(Outcome::skipped());

        assert_eq!(outcome_of(&sink, "leaf"), Some(Outcome::skipped()));
        assert_eq!(sink.finished().len(), 1);
    }
}
