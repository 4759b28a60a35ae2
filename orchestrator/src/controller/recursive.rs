//! Default controller: runs a command, then its children in order.

use std::sync::Arc;

use tracing::debug;

use crate::context::StepContext;
use crate::context::step_context::execute_body;
use crate::controller::{Controller, FinishGuard, RunScope, run_command, start_context};
use crate::core::command::Command;
use crate::core::types::{LifecyclePhase, Outcome};

/// Starts a context for the command, runs the test body if there is one, runs
/// each child through [`run_command`] in dependency order and finishes.
///
/// The command's own step reports the body's outcome (`passed` for pure
/// containers); the returned outcome also folds in the children.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecursiveController;

impl RecursiveController {
    pub fn new() -> Self {
        Self
    }
}

impl Controller for RecursiveController {
    fn run(&mut self, command: &Command, parent: Option<&Arc<StepContext>>, scope: &RunScope) -> Outcome {
        let Some(context) = start_context(command, parent, scope) else {
            return Outcome::error();
        };
        let guard = FinishGuard::new(context);
        let context = guard.context();

        if let Err(err) = context.set_lifecycle_phase(LifecyclePhase::execute()) {
            debug!(test = %command.full_name(), error = %err, "step finished before execution");
        }
        let own = match command.test().body() {
            Some(body) => execute_body(context, |context| body.run(context)),
            None => context.outcome(),
        };

        let mut combined = own.clone();
        for child in command.children() {
            let outcome = run_command(self, child, Some(context), scope);
            combined = combined.combine_with(&outcome);
        }

        guard.finish(own);
        combined
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::controller::{CancellationToken, SkipAllController};
    use crate::core::builder::build_commands;
    use crate::core::filter::Selection;
    use crate::tree::{TestDef, TestTree};
    use crate::test_support::{RecordingSink, build_all, outcome_of, recording_scope};

    fn recorder(
        log: &Arc<Mutex<Vec<String>>>,
        id: &str,
    ) -> impl Fn(&Arc<StepContext>) -> anyhow::Result<()> + Send + Sync + 'static {
        let log = Arc::clone(log);
        let id = id.to_string();
        move |_| {
            log.lock().expect("log").push(id.clone());
            Ok(())
        }
    }

    #[test]
    fn runs_children_in_dependency_order() {
        let ran = Arc::new(Mutex::new(Vec::new()));
        let mut tree = TestTree::new(TestDef::group("root"));
        let root = tree.root();
        let a = tree
            .add_child(root, TestDef::case("A").body(recorder(&ran, "A")))
            .expect("A");
        let b = tree
            .add_child(root, TestDef::case("B").body(recorder(&ran, "B")))
            .expect("B");
        tree.add_dependency(a, b);
        let tree = Arc::new(tree);

        let sink = Arc::new(RecordingSink::default());
        let scope = recording_scope(&sink);
        let command = build_commands(&tree, &Selection::all())
            .expect("build")
            .expect("root");
        let outcome = run_command(&mut RecursiveController::new(), &command, None, &scope);

        assert_eq!(outcome, Outcome::passed());
        assert_eq!(*ran.lock().expect("log"), vec!["B", "A"]);
        assert_eq!(scope.manager.running_steps(), 0);
    }

    #[test]
    fn failing_body_does_not_stop_siblings() {
        let mut tree = TestTree::new(TestDef::group("root"));
        let root = tree.root();
        tree.add_child(
            root,
            TestDef::case("bad").body(|_: &Arc<StepContext>| -> anyhow::Result<()> {
                Err(anyhow::anyhow!("broken"))
            }),
        )
        .expect("bad");
        tree.add_child(root, TestDef::case("good")).expect("good");
        let tree = Arc::new(tree);

        let sink = Arc::new(RecordingSink::default());
        let scope = recording_scope(&sink);
        let command = build_all(&tree);
        let outcome = run_command(&mut RecursiveController::new(), &command, None, &scope);

        assert_eq!(outcome, Outcome::error());
        assert_eq!(outcome_of(&sink, "bad"), Some(Outcome::error()));
        assert_eq!(outcome_of(&sink, "good"), Some(Outcome::passed()));
        // The container reports its own outcome, not the children's.
        assert_eq!(outcome_of(&sink, "root"), Some(Outcome::passed()));
        assert_eq!(scope.ledger.get(command.test_id()), Some(Outcome::error()));
    }

    #[test]
    fn cancellation_skips_remaining_siblings() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        let mut tree = TestTree::new(TestDef::group("root"));
        let root = tree.root();
        tree.add_child(
            root,
            TestDef::case("first").body(move |_: &Arc<StepContext>| -> anyhow::Result<()> {
                trigger.cancel();
                Ok(())
            }),
        )
        .expect("first");
        tree.add_child(root, TestDef::case("second")).expect("second");
        let tree = Arc::new(tree);

        let sink = Arc::new(RecordingSink::default());
        let scope = recording_scope(&sink).with_cancellation(token);
        let command = build_all(&tree);
        let outcome = run_command(&mut RecursiveController::new(), &command, None, &scope);

        assert_eq!(outcome_of(&sink, "first"), Some(Outcome::passed()));
        assert_eq!(outcome_of(&sink, "second"), Some(Outcome::canceled()));
        assert_eq!(outcome, Outcome::canceled());
        assert_eq!(sink.finished().len(), 3);
    }

    #[test]
    fn master_test_subtree_is_delegated() {
        let mut tree = TestTree::new(TestDef::group("root"));
        let root = tree.root();
        let master = tree
            .add_child(
                root,
                TestDef::group("master").controller(|| {
                    Box::new(SkipAllController::new(Outcome::ignored())) as Box<dyn Controller>
                }),
            )
            .expect("master");
        tree.add_child(master, TestDef::case("inner")).expect("inner");
        tree.add_child(root, TestDef::case("plain")).expect("plain");
        let tree = Arc::new(tree);

        let sink = Arc::new(RecordingSink::default());
        let scope = recording_scope(&sink);
        let command = build_all(&tree);
        run_command(&mut RecursiveController::new(), &command, None, &scope);

        assert_eq!(outcome_of(&sink, "master"), Some(Outcome::ignored()));
        assert_eq!(outcome_of(&sink, "inner"), Some(Outcome::ignored()));
        assert_eq!(outcome_of(&sink, "plain"), Some(Outcome::passed()));
    }
}
