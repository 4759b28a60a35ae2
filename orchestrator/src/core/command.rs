//! Execution plan nodes produced by the command builder.

use std::fmt;
use std::sync::Arc;

use crate::tree::{Test, TestId, TestTree};

/// Dependency-ordered mirror of one matched test.
///
/// Immutable once built and freely shareable across threads.
pub struct Command {
    tree: Arc<TestTree>,
    test: TestId,
    full_name: String,
    is_explicit: bool,
    children: Vec<Command>,
    dependencies: Vec<TestId>,
    test_count: usize,
}

impl Command {
    pub(crate) fn new(
        tree: Arc<TestTree>,
        test: TestId,
        is_explicit: bool,
        children: Vec<Command>,
        dependencies: Vec<TestId>,
    ) -> Self {
        let full_name = tree.full_name(test);
        let test_count = 1 + children.iter().map(Command::test_count).sum::<usize>();
        Self {
            tree,
            test,
            full_name,
            is_explicit,
            children,
            dependencies,
            test_count,
        }
    }

    pub fn test(&self) -> &Test {
        self.tree.get(self.test)
    }

    pub fn test_id(&self) -> TestId {
        self.test
    }

    pub fn tree(&self) -> &Arc<TestTree> {
        &self.tree
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// True when the filter matched this test directly rather than pulling it
    /// in as an ancestor or descendant of a match.
    pub fn is_explicit(&self) -> bool {
        self.is_explicit
    }

    /// Children in execution order.
    pub fn children(&self) -> &[Command] {
        &self.children
    }

    /// Declared dependencies of this test that are part of the same plan.
    pub fn dependencies(&self) -> &[TestId] {
        &self.dependencies
    }

    /// Number of commands in this subtree, including this one.
    pub fn test_count(&self) -> usize {
        self.test_count
    }

    pub fn pre_order(&self) -> Vec<&Command> {
        let mut out = Vec::with_capacity(self.test_count);
        let mut stack = vec![self];
        while let Some(command) = stack.pop() {
            out.push(command);
            stack.extend(command.children.iter().rev());
        }
        out
    }

    pub fn find(&self, id: &str) -> Option<&Command> {
        self.pre_order()
            .into_iter()
            .find(|command| command.test().id() == id)
    }

    /// Indented one-line-per-command rendering of the plan.
    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        render_inner(self, 0, &mut lines);
        lines.join("\n")
    }
}

fn render_inner(command: &Command, depth: usize, lines: &mut Vec<String>) {
    let indent = "  ".repeat(depth);
    let marker = if command.is_explicit { "*" } else { "" };
    lines.push(format!("{}- {}{}", indent, command.test().id(), marker));
    for child in &command.children {
        render_inner(child, depth + 1, lines);
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("test", &self.test().id())
            .field("is_explicit", &self.is_explicit)
            .field("children", &self.children)
            .finish()
    }
}
