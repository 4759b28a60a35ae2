//! Runtime step identities.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::core::command::Command;
use crate::tree::TestId;

static NEXT_STEP_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique step identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(u64);

impl StepId {
    fn next() -> Self {
        StepId(NEXT_STEP_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step-{}", self.0)
    }
}

/// One concrete execution of a test.
///
/// A command may be started several times (data-driven repetition), each time
/// with a fresh [`Step`] and [`StepId`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub parent: Option<StepId>,
    pub test: TestId,
    pub name: String,
    pub full_name: String,
    /// The step created for the test itself rather than a child of it.
    pub is_primary: bool,
    /// Started from test code at run time rather than by a controller.
    pub is_dynamic: bool,
    pub is_test_case: bool,
}

impl Step {
    /// Primary step for `command`, optionally nested under `parent`.
    pub fn primary(command: &Command, parent: Option<&Step>) -> Self {
        let test = command.test();
        Self {
            id: StepId::next(),
            parent: parent.map(|p| p.id),
            test: command.test_id(),
            name: test.name().to_string(),
            full_name: command.full_name().to_string(),
            is_primary: true,
            is_dynamic: false,
            is_test_case: test.is_test_case(),
        }
    }

    /// Non-primary child of `parent` belonging to the same test.
    pub fn child(parent: &Step, name: impl Into<String>, is_dynamic: bool) -> Self {
        let name = name.into();
        let full_name = if parent.full_name.is_empty() {
            name.clone()
        } else {
            format!("{}/{}", parent.full_name, name)
        };
        Self {
            id: StepId::next(),
            parent: Some(parent.id),
            test: parent.test,
            name,
            full_name,
            is_primary: false,
            is_dynamic,
            is_test_case: true,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.full_name.is_empty() {
            write!(f, "(root {})", self.id)
        } else {
            f.write_str(&self.full_name)
        }
    }
}
