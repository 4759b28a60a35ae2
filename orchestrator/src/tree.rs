//! Declared test tree consumed by the command builder.
//!
//! Tests live in an arena owned by [`TestTree`] and refer to each other by
//! [`TestId`]. The shape is append-only: a test gets exactly one parent when
//! it is added and never moves afterwards.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::StepContext;
use crate::controller::ControllerFactory;

/// Index of a test inside its [`TestTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestId(usize);

impl TestId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Append-only key/value multimap attached to tests and steps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, Vec<String>>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.entry(key.into()).or_default().push(value.into());
    }

    pub fn get(&self, key: &str) -> &[String] {
        self.0.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn first(&self, key: &str) -> Option<&str> {
        self.get(key).first().map(String::as_str)
    }

    pub fn contains(&self, key: &str, value: &str) -> bool {
        self.get(key).iter().any(|v| v == value)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .flat_map(|(key, values)| values.iter().map(move |v| (key.as_str(), v.as_str())))
    }
}

/// Executable body of a test.
///
/// Returning `Err` (or panicking) marks the step as `error`; the body may also
/// set an interim outcome on the context to report something else.
pub trait TestBody: Send + Sync {
    fn run(&self, context: &Arc<StepContext>) -> anyhow::Result<()>;
}

impl<F> TestBody for F
where
    F: Fn(&Arc<StepContext>) -> anyhow::Result<()> + Send + Sync,
{
    fn run(&self, context: &Arc<StepContext>) -> anyhow::Result<()> {
        self(context)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("duplicate test id '{0}'")]
    DuplicateId(String),
    #[error("unknown test id '{0}'")]
    UnknownId(String),
}

/// Declaration of a single test, used to add it to a tree.
#[derive(Clone)]
pub struct TestDef {
    pub id: String,
    pub name: String,
    pub order: i64,
    pub is_test_case: bool,
    pub metadata: Metadata,
    pub body: Option<Arc<dyn TestBody>>,
    pub controller: Option<Arc<dyn ControllerFactory>>,
}

impl TestDef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            order: 0,
            is_test_case: false,
            metadata: Metadata::new(),
            body: None,
            controller: None,
        }
    }

    /// Container named after its id.
    pub fn group(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(id.clone(), id)
    }

    /// Test case named after its id.
    pub fn case(id: impl Into<String>) -> Self {
        Self::group(id).test_case()
    }

    pub fn order(mut self, order: i64) -> Self {
        self.order = order;
        self
    }

    pub fn test_case(mut self) -> Self {
        self.is_test_case = true;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.add(key, value);
        self
    }

    pub fn body<B: TestBody + 'static>(mut self, body: B) -> Self {
        self.body = Some(Arc::new(body));
        self
    }

    /// Mark this test as a master test that runs its own subtree.
    pub fn controller<F: ControllerFactory + 'static>(mut self, factory: F) -> Self {
        self.controller = Some(Arc::new(factory));
        self
    }
}

/// Node in the declared test tree.
pub struct Test {
    index: TestId,
    id: String,
    name: String,
    order: i64,
    is_test_case: bool,
    metadata: Metadata,
    parent: Option<TestId>,
    children: Vec<TestId>,
    dependencies: Vec<TestId>,
    body: Option<Arc<dyn TestBody>>,
    controller: Option<Arc<dyn ControllerFactory>>,
}

impl Test {
    pub fn index(&self) -> TestId {
        self.index
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn order(&self) -> i64 {
        self.order
    }

    pub fn is_test_case(&self) -> bool {
        self.is_test_case
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn parent(&self) -> Option<TestId> {
        self.parent
    }

    pub fn children(&self) -> &[TestId] {
        &self.children
    }

    pub fn dependencies(&self) -> &[TestId] {
        &self.dependencies
    }

    pub fn body(&self) -> Option<&Arc<dyn TestBody>> {
        self.body.as_ref()
    }

    pub fn controller_factory(&self) -> Option<&Arc<dyn ControllerFactory>> {
        self.controller.as_ref()
    }

    pub fn is_master(&self) -> bool {
        self.controller.is_some()
    }
}

impl fmt::Debug for Test {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Test")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("order", &self.order)
            .field("is_test_case", &self.is_test_case)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .field("dependencies", &self.dependencies)
            .field("has_body", &self.body.is_some())
            .field("is_master", &self.controller.is_some())
            .finish()
    }
}

/// Arena holding a whole test tree.
#[derive(Debug)]
pub struct TestTree {
    tests: Vec<Test>,
    by_id: HashMap<String, TestId>,
}

impl TestTree {
    pub fn new(root: TestDef) -> Self {
        let mut tree = Self {
            tests: Vec::new(),
            by_id: HashMap::new(),
        };
        tree.insert(root, None);
        tree
    }

    pub fn root(&self) -> TestId {
        TestId(0)
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    pub fn get(&self, id: TestId) -> &Test {
        &self.tests[id.0]
    }

    pub fn find(&self, id: &str) -> Option<TestId> {
        self.by_id.get(id).copied()
    }

    pub fn tests(&self) -> impl Iterator<Item = &Test> {
        self.tests.iter()
    }

    pub fn add_child(&mut self, parent: TestId, def: TestDef) -> Result<TestId, TreeError> {
        if self.by_id.contains_key(&def.id) {
            return Err(TreeError::DuplicateId(def.id));
        }
        let child = self.insert(def, Some(parent));
        self.tests[parent.0].children.push(child);
        Ok(child)
    }

    /// Declare that `source` must run after `target`. Duplicate edges are ignored.
    ///
    /// Edges are not checked here; the command builder rejects self,
    /// ancestor and descendant dependencies.
    pub fn add_dependency(&mut self, source: TestId, target: TestId) {
        let deps = &mut self.tests[source.0].dependencies;
        if !deps.contains(&target) {
            deps.push(target);
        }
    }

    pub fn add_dependency_by_id(&mut self, source: &str, target: &str) -> Result<(), TreeError> {
        let source = self
            .find(source)
            .ok_or_else(|| TreeError::UnknownId(source.to_string()))?;
        let target = self
            .find(target)
            .ok_or_else(|| TreeError::UnknownId(target.to_string()))?;
        self.add_dependency(source, target);
        Ok(())
    }

    /// `/`-joined names below the root; the root itself has an empty full name.
    pub fn full_name(&self, id: TestId) -> String {
        let mut names: Vec<&str> = self
            .ancestors_inclusive(id)
            .map(|test| self.get(test).name())
            .collect();
        // Drop the root.
        names.pop();
        names.reverse();
        names.join("/")
    }

    /// `id` followed by each of its ancestors up to the root.
    pub fn ancestors_inclusive(&self, id: TestId) -> impl Iterator<Item = TestId> + '_ {
        std::iter::successors(Some(id), move |current| self.get(*current).parent)
    }

    pub fn is_ancestor(&self, ancestor: TestId, of: TestId) -> bool {
        self.ancestors_inclusive(of)
            .skip(1)
            .any(|candidate| candidate == ancestor)
    }

    fn insert(&mut self, def: TestDef, parent: Option<TestId>) -> TestId {
        let index = TestId(self.tests.len());
        self.by_id.insert(def.id.clone(), index);
        self.tests.push(Test {
            index,
            id: def.id,
            name: def.name,
            order: def.order,
            is_test_case: def.is_test_case,
            metadata: def.metadata,
            parent,
            children: Vec::new(),
            dependencies: Vec::new(),
            body: def.body,
            controller: def.controller,
        });
        index
    }
}

/// Declarative, serializable form of a test tree.
///
/// Dependencies refer to other nodes by id. Loaded trees carry no bodies or
/// controller factories, so their leaves simply pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TreeNode {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub order: i64,
    #[serde(default)]
    pub test_case: bool,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    fn def(&self) -> TestDef {
        let name = self.name.clone().unwrap_or_else(|| self.id.clone());
        let mut def = TestDef::new(self.id.clone(), name).order(self.order);
        def.is_test_case = self.test_case;
        def.metadata = self.metadata.clone();
        def
    }

    /// Build the arena form. Dependencies are wired after every node exists so
    /// they may point forward in declaration order.
    pub fn to_tree(&self) -> Result<TestTree, TreeError> {
        let mut tree = TestTree::new(self.def());
        let root = tree.root();
        add_children(&mut tree, root, &self.children)?;
        add_dependencies(&mut tree, self)?;
        Ok(tree)
    }
}

fn add_children(tree: &mut TestTree, parent: TestId, nodes: &[TreeNode]) -> Result<(), TreeError> {
    for node in nodes {
        let child = tree.add_child(parent, node.def())?;
        add_children(tree, child, &node.children)?;
    }
    Ok(())
}

fn add_dependencies(tree: &mut TestTree, node: &TreeNode) -> Result<(), TreeError> {
    for target in &node.dependencies {
        tree.add_dependency_by_id(&node.id, target)?;
    }
    for child in &node.children {
        add_dependencies(tree, child)?;
    }
    Ok(())
}
