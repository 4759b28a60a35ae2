//! Builds a dependency-ordered command tree from a test tree and a selection.
//!
//! Three passes:
//! 1. Filtered closure: keep matched subtrees and the ancestors leading to them.
//! 2. Dependency edges: translate each test dependency into an ordering edge
//!    between the two siblings under the lowest common ancestor.
//! 3. Topological sort of every child list (depth-first, three-colour marks).

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument};

use crate::core::command::Command;
use crate::core::filter::{FilterSetResult, Selection};
use crate::tree::{TestId, TestTree};

/// Declaration errors. Any of these makes the whole selection unrunnable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("test '{test}' has an invalid dependency on itself")]
    SelfDependency { test: String },
    #[error("test '{test}' has an invalid dependency on its own descendant '{descendant}'")]
    DependsOnDescendant { test: String, descendant: String },
    #[error("test '{test}' has an invalid dependency on its own ancestor '{ancestor}'")]
    DependsOnAncestor { test: String, ancestor: String },
    #[error("found a test dependency cycle involving test '{test}'")]
    DependencyCycle { test: String },
}

/// Build the command tree for the whole test tree.
///
/// Returns `Ok(None)` when nothing matched the selection.
pub fn build_commands(
    tree: &Arc<TestTree>,
    selection: &Selection,
) -> Result<Option<Command>, BuildError> {
    CommandBuilder::new(tree, selection).build(tree.root())
}

struct Pending {
    test: TestId,
    is_explicit: bool,
    children: Vec<usize>,
    dependencies: Vec<TestId>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

struct CommandBuilder<'a> {
    tree: &'a Arc<TestTree>,
    selection: &'a Selection,
    pending: Vec<Pending>,
    by_test: HashMap<TestId, usize>,
    // Source sibling -> siblings that must run before it.
    sibling_edges: HashMap<usize, Vec<usize>>,
}

impl<'a> CommandBuilder<'a> {
    fn new(tree: &'a Arc<TestTree>, selection: &'a Selection) -> Self {
        Self {
            tree,
            selection,
            pending: Vec::new(),
            by_test: HashMap::new(),
            sibling_edges: HashMap::new(),
        }
    }

    #[instrument(skip_all, fields(tests = self.tree.len(), exact = self.selection.exact_filter))]
    fn build(mut self, root: TestId) -> Result<Option<Command>, BuildError> {
        let has_explicit_ancestor = !self.selection.filter.has_inclusion_rules();
        let Some(root_index) = self.filtered_closure(root, has_explicit_ancestor) else {
            debug!("no tests matched the selection");
            return Ok(None);
        };

        self.populate_dependencies()?;
        self.sort_children(root_index)?;

        let command = self.materialize(root_index);
        debug!(commands = command.test_count(), "built command tree");
        Ok(Some(command))
    }

    fn filtered_closure(&mut self, test_id: TestId, has_explicit_ancestor: bool) -> Option<usize> {
        let tree = Arc::clone(self.tree);
        let test = tree.get(test_id);
        let result = self.selection.filter.evaluate(&tree, test);
        if result == FilterSetResult::Exclude {
            return None;
        }

        let is_match = result == FilterSetResult::Include;
        let is_explicit = is_match && !has_explicit_ancestor;

        let mut children = Vec::with_capacity(test.children().len());
        for &child in test.children() {
            if let Some(index) = self.filtered_closure(child, has_explicit_ancestor || is_explicit)
            {
                children.push(index);
            }
        }

        // Descendants of a match ride along unless the filter is exact. With no
        // inclusion rules every test not excluded is implicitly selected.
        let auto_included = (!self.selection.exact_filter && has_explicit_ancestor)
            || !self.selection.filter.has_inclusion_rules();
        if is_match || !children.is_empty() || auto_included {
            return Some(self.push(test_id, is_explicit, children));
        }
        None
    }

    fn push(&mut self, test: TestId, is_explicit: bool, children: Vec<usize>) -> usize {
        let index = self.pending.len();
        self.pending.push(Pending {
            test,
            is_explicit,
            children,
            dependencies: Vec::new(),
        });
        self.by_test.insert(test, index);
        index
    }

    fn populate_dependencies(&mut self) -> Result<(), BuildError> {
        let tree = Arc::clone(self.tree);
        for index in 0..self.pending.len() {
            let source = self.pending[index].test;
            for &target in tree.get(source).dependencies() {
                if !self.by_test.contains_key(&target) {
                    continue;
                }
                self.pending[index].dependencies.push(target);
                self.add_sibling_edge(source, target)?;
            }
        }
        Ok(())
    }

    fn add_sibling_edge(&mut self, source: TestId, target: TestId) -> Result<(), BuildError> {
        let tree = self.tree;
        if source == target {
            return Err(BuildError::SelfDependency {
                test: tree.full_name(source),
            });
        }

        let source_path = root_first_path(tree, source);
        let target_path = root_first_path(tree, target);

        let mut depth = 0;
        loop {
            if depth == source_path.len() {
                return Err(BuildError::DependsOnDescendant {
                    test: tree.full_name(source),
                    descendant: tree.full_name(target),
                });
            }
            if depth == target_path.len() {
                return Err(BuildError::DependsOnAncestor {
                    test: tree.full_name(source),
                    ancestor: tree.full_name(target),
                });
            }
            if source_path[depth] != target_path[depth] {
                break;
            }
            depth += 1;
        }

        // Every ancestor of a command is itself a command, so both lookups hit.
        let source_sibling = self.by_test[&source_path[depth]];
        let target_sibling = self.by_test[&target_path[depth]];
        let edges = self.sibling_edges.entry(source_sibling).or_default();
        if !edges.contains(&target_sibling) {
            edges.push(target_sibling);
        }
        Ok(())
    }

    fn sort_children(&mut self, parent: usize) -> Result<(), BuildError> {
        let mut children = std::mem::take(&mut self.pending[parent].children);
        if children.is_empty() {
            return Ok(());
        }

        // Pre-sort so independent siblings keep their declared relative order.
        self.sort_by_order(&mut children);

        let mut marks: HashMap<usize, Mark> = HashMap::new();
        let mut ordered = Vec::with_capacity(children.len());
        for &child in &children {
            self.visit(child, &mut marks, &mut ordered)?;
        }
        self.pending[parent].children = ordered;

        for child in children {
            self.sort_children(child)?;
        }
        Ok(())
    }

    fn visit(
        &self,
        node: usize,
        marks: &mut HashMap<usize, Mark>,
        ordered: &mut Vec<usize>,
    ) -> Result<(), BuildError> {
        match marks.get(&node) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::InProgress) => {
                return Err(BuildError::DependencyCycle {
                    test: self.tree.full_name(self.pending[node].test),
                });
            }
            None => {}
        }

        marks.insert(node, Mark::InProgress);
        if let Some(edges) = self.sibling_edges.get(&node) {
            let mut prerequisites = edges.clone();
            self.sort_by_order(&mut prerequisites);
            for prerequisite in prerequisites {
                self.visit(prerequisite, marks, ordered)?;
            }
        }
        marks.insert(node, Mark::Done);
        ordered.push(node);
        Ok(())
    }

    fn sort_by_order(&self, nodes: &mut [usize]) {
        nodes.sort_by_key(|&node| {
            let test = self.pending[node].test;
            (self.tree.get(test).order(), test)
        });
    }

    fn materialize(&mut self, index: usize) -> Command {
        let children: Vec<usize> = std::mem::take(&mut self.pending[index].children);
        let children = children
            .into_iter()
            .map(|child| self.materialize(child))
            .collect();
        let pending = &mut self.pending[index];
        Command::new(
            Arc::clone(self.tree),
            pending.test,
            pending.is_explicit,
            children,
            std::mem::take(&mut pending.dependencies),
        )
    }
}

fn root_first_path(tree: &TestTree, test: TestId) -> Vec<TestId> {
    let mut path: Vec<TestId> = tree.ancestors_inclusive(test).collect();
    path.reverse();
    path
}
