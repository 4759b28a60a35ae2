//! End-to-end orchestration tests driving `run_tests` over whole trees.
//!
//! These cover command ordering, dependency policies, master-test delegation,
//! dynamic steps, dry runs and the config → tree store → run path.

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use orchestrator::context::{Step, StepContext, StepEvent, streams};
use orchestrator::controller::{
    Controller, DependencyPolicy, FinishGuard, RunScope, start_context,
};
use orchestrator::core::command::Command;
use orchestrator::core::filter::Selection;
use orchestrator::core::types::Outcome;
use orchestrator::io::config::{RunnerConfig, load_config, write_config};
use orchestrator::io::tree_store::load_tree;
use orchestrator::run::{RunOptions, run_tests};
use orchestrator::test_support::{RecordingSink, case, group, outcome_of, tree_fixture};
use orchestrator::tree::{TestDef, TestTree};

fn started_names(sink: &RecordingSink) -> Vec<String> {
    sink.events()
        .into_iter()
        .filter_map(|event| match event {
            StepEvent::StepStarted { step } => Some(step.name),
            _ => None,
        })
        .collect()
}

fn failing(message: &'static str) -> impl Fn(&Arc<StepContext>) -> anyhow::Result<()> + Send + Sync {
    move |_: &Arc<StepContext>| -> anyhow::Result<()> { Err(anyhow::anyhow!(message)) }
}

/// Three cases under one container:
///
/// ```text
/// root
/// ├── login      (2 asserts, dynamic "token refresh" step with 1 assert)
/// ├── checkout   (depends on login)
/// └── report     (order -1, fails)
/// ```
///
/// `report` runs first because of its order, `checkout` after `login`
/// because of the dependency.
#[test]
fn full_run_orders_commands_and_reports_statistics() {
    let mut tree = TestTree::new(TestDef::group("root"));
    let root = tree.root();
    let login = tree
        .add_child(
            root,
            TestDef::case("login").body(|context: &Arc<StepContext>| -> anyhow::Result<()> {
                context.add_assert_count(2)?;
                context.add_metadata("user", "alice")?;
                let refresh = context.run_step(
                    "token refresh",
                    |step: &Arc<StepContext>| -> anyhow::Result<()> {
                        step.add_assert_count(1)?;
                        Ok(())
                    },
                )?;
                anyhow::ensure!(refresh == Outcome::passed(), "refresh {refresh}");
                Ok(())
            }),
        )
        .expect("login");
    let checkout = tree
        .add_child(root, TestDef::case("checkout"))
        .expect("checkout");
    tree.add_child(root, TestDef::case("report").order(-1).body(failing("disk full")))
        .expect("report");
    tree.add_dependency(checkout, login);
    let tree = Arc::new(tree);

    let sink = Arc::new(RecordingSink::default());
    let report = run_tests(&tree, &Selection::all(), &RunOptions::default(), sink.clone())
        .expect("run");

    assert_eq!(
        started_names(&sink),
        vec!["root", "report", "login", "token refresh", "checkout"]
    );
    assert_eq!(report.outcome, Some(Outcome::error()));
    assert_eq!(report.command_count, 4);
    assert_eq!(outcome_of(&sink, "root"), Some(Outcome::passed()));
    assert_eq!(outcome_of(&sink, "report"), Some(Outcome::error()));
    assert_eq!(outcome_of(&sink, "checkout"), Some(Outcome::passed()));

    let stats = report.statistics;
    assert_eq!(stats.step_count, 5);
    assert_eq!(stats.test_count, 4);
    assert_eq!(stats.run_count, 4);
    assert_eq!(stats.passed_count, 3);
    assert_eq!(stats.failed_count, 1);
    assert_eq!(stats.assert_count, 3);

    assert!(sink.all_log_text(streams::FAILURES).contains("disk full"));
    assert!(sink.events().iter().any(|event| matches!(
        event,
        StepEvent::MetadataAdded { key, value, .. } if key == "user" && value == "alice"
    )));
}

fn dependent_chain() -> Arc<TestTree> {
    let mut tree = TestTree::new(TestDef::group("root"));
    let root = tree.root();
    let a = tree
        .add_child(root, TestDef::case("A").body(failing("broken")))
        .expect("A");
    let b = tree.add_child(root, TestDef::case("B")).expect("B");
    let c = tree.add_child(root, TestDef::case("C")).expect("C");
    tree.add_dependency(b, a);
    tree.add_dependency(c, b);
    Arc::new(tree)
}

fn run_with_policy(policy: DependencyPolicy) -> (Arc<RecordingSink>, orchestrator::run::RunReport) {
    let sink = Arc::new(RecordingSink::default());
    let options = RunOptions {
        dependency_policy: policy,
        ..RunOptions::default()
    };
    let report =
        run_tests(&dependent_chain(), &Selection::all(), &options, sink.clone()).expect("run");
    (sink, report)
}

#[test]
fn order_only_policy_still_runs_dependents() {
    let (sink, report) = run_with_policy(DependencyPolicy::OrderOnly);
    assert_eq!(started_names(&sink), vec!["root", "A", "B", "C"]);
    assert_eq!(outcome_of(&sink, "B"), Some(Outcome::passed()));
    assert_eq!(outcome_of(&sink, "C"), Some(Outcome::passed()));
    assert_eq!(report.statistics.passed_count, 2);
}

#[test]
fn skip_dependents_policy_skips_transitively() {
    let (sink, report) = run_with_policy(DependencyPolicy::SkipDependents);
    assert_eq!(outcome_of(&sink, "A"), Some(Outcome::error()));
    assert_eq!(outcome_of(&sink, "B"), Some(Outcome::skipped()));
    assert_eq!(outcome_of(&sink, "C"), Some(Outcome::skipped()));
    assert_eq!(report.statistics.skipped_count, 2);

    let warnings = sink.all_log_text(streams::WARNINGS);
    assert!(warnings.contains("Dependency 'A' did not pass"), "{warnings}");
    assert!(warnings.contains("Dependency 'B' did not pass"), "{warnings}");
}

#[test]
fn fail_dependents_policy_fails_transitively() {
    let (sink, report) = run_with_policy(DependencyPolicy::FailDependents);
    assert_eq!(outcome_of(&sink, "B"), Some(Outcome::failed()));
    assert_eq!(outcome_of(&sink, "C"), Some(Outcome::failed()));
    assert_eq!(report.statistics.failed_count, 3);

    let failures = sink.all_log_text(streams::FAILURES);
    assert!(failures.contains("Dependency 'A' did not pass"), "{failures}");
}

/// Runs every child of the master test twice as separate steps.
struct RepeatController {
    times: usize,
}

impl Controller for RepeatController {
    fn run(&mut self, command: &Command, parent: Option<&Arc<StepContext>>, scope: &RunScope) -> Outcome {
        let Some(context) = start_context(command, parent, scope) else {
            return Outcome::error();
        };
        let guard = FinishGuard::new(context);
        for child in command.children() {
            for iteration in 0..self.times {
                let step = Step::primary(child, Some(guard.context().step()));
                let Ok(run) = guard.context().start_child(step) else {
                    return Outcome::error();
                };
                run.add_metadata("iteration", iteration.to_string())
                    .expect("metadata");
                run.finish(Outcome::passed());
            }
        }
        guard.finish(Outcome::passed());
        Outcome::passed()
    }
}

#[test]
fn master_test_runs_its_subtree_with_its_own_controller() {
    let mut tree = TestTree::new(TestDef::group("root"));
    let root = tree.root();
    let matrix = tree
        .add_child(
            root,
            TestDef::group("matrix")
                .controller(|| Box::new(RepeatController { times: 2 }) as Box<dyn Controller>),
        )
        .expect("matrix");
    tree.add_child(matrix, TestDef::case("row")).expect("row");
    let tree = Arc::new(tree);

    let sink = Arc::new(RecordingSink::default());
    let report = run_tests(&tree, &Selection::all(), &RunOptions::default(), sink.clone())
        .expect("run");

    assert_eq!(started_names(&sink), vec!["root", "matrix", "row", "row"]);
    assert_eq!(report.outcome, Some(Outcome::passed()));
    assert_eq!(report.statistics.test_count, 2);
    assert_eq!(report.statistics.passed_count, 2);
}

#[test]
fn skip_dynamic_steps_reports_them_skipped() {
    let ran = Arc::new(AtomicBool::new(false));
    let seen = Arc::clone(&ran);
    let mut tree = TestTree::new(TestDef::group("root"));
    let root = tree.root();
    tree.add_child(
        root,
        TestDef::case("outer").body(move |context: &Arc<StepContext>| -> anyhow::Result<()> {
            let seen = Arc::clone(&seen);
            let outcome = context.run_step("inner", move |_: &Arc<StepContext>| -> anyhow::Result<()> {
                seen.store(true, Ordering::SeqCst);
                Ok(())
            })?;
            anyhow::ensure!(outcome == Outcome::skipped(), "inner was {outcome}");
            Ok(())
        }),
    )
    .expect("outer");
    let tree = Arc::new(tree);

    let selection = Selection {
        skip_dynamic_tests: true,
        ..Selection::all()
    };
    let sink = Arc::new(RecordingSink::default());
    run_tests(&tree, &selection, &RunOptions::default(), sink.clone()).expect("run");

    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(outcome_of(&sink, "inner"), Some(Outcome::skipped()));
    assert_eq!(outcome_of(&sink, "outer"), Some(Outcome::passed()));
}

#[test]
fn dry_run_never_executes_bodies() {
    let ran = Arc::new(AtomicBool::new(false));
    let seen = Arc::clone(&ran);
    let mut tree = TestTree::new(TestDef::group("root"));
    let root = tree.root();
    tree.add_child(
        root,
        TestDef::case("side effect").body(move |_: &Arc<StepContext>| -> anyhow::Result<()> {
            seen.store(true, Ordering::SeqCst);
            Ok(())
        }),
    )
    .expect("case");
    let options = RunOptions {
        skip_execution: true,
        ..RunOptions::default()
    };

    let sink = Arc::new(RecordingSink::default());
    let report =
        run_tests(&Arc::new(tree), &Selection::all(), &options, sink.clone()).expect("run");

    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(report.outcome, Some(Outcome::skipped()));
    assert_eq!(outcome_of(&sink, "side effect"), Some(Outcome::skipped()));
}

/// Config and tree both come from disk; the include filter narrows the run to
/// `A1` and its ancestors.
#[test]
fn config_and_tree_from_disk_drive_a_run() {
    let mut b = case("B");
    b.dependencies.push("A1".to_string());
    let declared = group("root", vec![group("A", vec![case("A1"), case("A2")]), b]);
    let (dir, schema_path, tree_path) = tree_fixture(&declared);

    let config_path = dir.path().join("config.toml");
    let cfg = RunnerConfig {
        include: vec!["id:A1".to_string()],
        dependency_policy: DependencyPolicy::SkipDependents,
        ..RunnerConfig::default()
    };
    write_config(&config_path, &cfg).expect("write config");
    assert!(fs::read_to_string(&config_path)
        .expect("read config")
        .contains("skip_dependents"));

    let cfg = load_config(&config_path).expect("load config");
    let tree = Arc::new(
        load_tree(&schema_path, &tree_path)
            .expect("load tree")
            .to_tree()
            .expect("tree"),
    );
    let sink = Arc::new(RecordingSink::default());
    let report = run_tests(
        &tree,
        &cfg.selection().expect("selection"),
        &cfg.run_options(),
        sink.clone(),
    )
    .expect("run");

    assert_eq!(started_names(&sink), vec!["root", "A", "A1"]);
    assert_eq!(report.command_count, 3);
    assert_eq!(report.statistics.passed_count, 1);
}
