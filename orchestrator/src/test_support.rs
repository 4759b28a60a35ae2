//! Test-only helpers: event recording, sample trees and fixtures.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::context::{
    ContextManager, ContextTracker, EventSink, LogEvent, NullSink, Step, StepContext, StepEvent,
    StepId,
};
use crate::controller::RunScope;
use crate::core::builder::build_commands;
use crate::core::command::Command;
use crate::core::filter::Selection;
use crate::core::types::Outcome;
use crate::tree::{Metadata, TestDef, TestTree, TreeNode};

/// Captures every published event in order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<StepEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<StepEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// `(step, outcome)` of every `StepFinished` event, in order.
    pub fn finished(&self) -> Vec<(StepId, Outcome)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                StepEvent::StepFinished {
                    step_id, outcome, ..
                } => Some((step_id, outcome)),
                _ => None,
            })
            .collect()
    }

    /// Concatenated text written to `stream` of one step.
    pub fn log_text(&self, step: StepId, stream: &str) -> String {
        self.collect_text(|id| id == step, stream)
    }

    /// Concatenated text written to `stream` of any step.
    pub fn all_log_text(&self, stream: &str) -> String {
        self.collect_text(|_| true, stream)
    }

    fn collect_text(&self, wanted: impl Fn(StepId) -> bool, stream: &str) -> String {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                StepEvent::Log {
                    step_id,
                    log: LogEvent::Write { stream: s, text },
                } if wanted(step_id) && s == stream => Some(text),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, event: StepEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Outcome of the first step named `name`, once it has finished.
pub fn outcome_of(sink: &RecordingSink, name: &str) -> Option<Outcome> {
    let events = sink.events();
    let id = events.iter().find_map(|event| match event {
        StepEvent::StepStarted { step } if step.name == name => Some(step.id),
        _ => None,
    })?;
    events.into_iter().find_map(|event| match event {
        StepEvent::StepFinished {
            step_id, outcome, ..
        } if step_id == id => Some(outcome),
        _ => None,
    })
}

/// Manager with a fresh tracker publishing into `sink`.
pub fn recording_manager(sink: &Arc<RecordingSink>) -> Arc<ContextManager> {
    Arc::new(ContextManager::new(
        Arc::new(ContextTracker::new()),
        sink.clone(),
    ))
}

/// Run scope with default policy over a recording manager.
pub fn recording_scope(sink: &Arc<RecordingSink>) -> RunScope {
    RunScope::new(recording_manager(sink))
}

/// Start a root step for a single-test tree named `id`.
pub fn start_root(manager: &Arc<ContextManager>, id: &str) -> Arc<StepContext> {
    let command = single_command(id);
    manager
        .start_step(None, Step::primary(&command, None))
        .expect("start root")
}

/// Command for a tree holding only a root test case.
pub fn single_command(id: &str) -> Command {
    let tree = Arc::new(TestTree::new(TestDef::case(id)));
    build_all(&tree)
}

/// Context that was never started, for tracker tests.
pub fn scratch_context(name: &str) -> Arc<StepContext> {
    let manager = Arc::new(ContextManager::new(
        Arc::new(ContextTracker::new()),
        Arc::new(NullSink),
    ));
    let step = Step::primary(&single_command(name), None);
    StepContext::new(manager, step, None)
}

/// `root{A{A1, A2}, B}` with test-case leaves.
pub fn sample_tree() -> Arc<TestTree> {
    let mut tree = TestTree::new(TestDef::group("root"));
    let root = tree.root();
    let a = tree.add_child(root, TestDef::group("A")).expect("A");
    tree.add_child(a, TestDef::case("A1")).expect("A1");
    tree.add_child(a, TestDef::case("A2")).expect("A2");
    tree.add_child(root, TestDef::case("B")).expect("B");
    Arc::new(tree)
}

/// Command tree selecting every test.
pub fn build_all(tree: &Arc<TestTree>) -> Command {
    build_commands(tree, &Selection::all())
        .expect("build")
        .expect("root command")
}

/// Declarative container node.
pub fn group(id: &str, children: Vec<TreeNode>) -> TreeNode {
    TreeNode {
        id: id.to_string(),
        name: None,
        order: 0,
        test_case: false,
        metadata: Metadata::new(),
        dependencies: Vec::new(),
        children,
    }
}

/// Declarative test-case leaf.
pub fn case(id: &str) -> TreeNode {
    TreeNode {
        test_case: true,
        ..group(id, Vec::new())
    }
}

/// Write the bundled test tree schema into `dir`.
pub fn write_schema(dir: &Path) -> PathBuf {
    let path = dir.join("test_tree.schema.json");
    fs::write(
        &path,
        include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../schemas/test_tree/v1.schema.json"
        )),
    )
    .expect("write schema");
    path
}

/// Temp directory holding the schema and `tree` serialized as `tree.json`.
///
/// Returns `(dir, schema_path, tree_path)`; keep `dir` alive while the paths
/// are in use.
pub fn tree_fixture(tree: &TreeNode) -> (tempfile::TempDir, PathBuf, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let schema_path = write_schema(dir.path());
    let tree_path = dir.path().join("tree.json");
    let mut buf = serde_json::to_string_pretty(tree).expect("serialize tree");
    buf.push('\n');
    fs::write(&tree_path, buf).expect("write tree");
    (dir, schema_path, tree_path)
}
