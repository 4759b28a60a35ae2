//! Shared deterministic types for orchestration core logic.
//!
//! These types define stable contracts between the command builder, step
//! contexts and controllers. They carry no runtime state and serialize to a
//! stable form for reporting sinks.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Coarse result of a step, ordered by severity.
///
/// Combining two outcomes keeps the more severe status, so the derive order of
/// the variants is significant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Skipped,
    Inconclusive,
    Failed,
}

impl TestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TestStatus::Passed => "passed",
            TestStatus::Skipped => "skipped",
            TestStatus::Inconclusive => "inconclusive",
            TestStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a step: a status refined by an optional category
/// (e.g. `failed/error`, `skipped/ignored`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Outcome {
    pub status: TestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl Outcome {
    pub fn new(status: TestStatus) -> Self {
        Self {
            status,
            category: None,
        }
    }

    /// Empty categories collapse to `None`.
    pub fn with_category(status: TestStatus, category: impl Into<String>) -> Self {
        let category = category.into();
        Self {
            status,
            category: if category.is_empty() {
                None
            } else {
                Some(category)
            },
        }
    }

    pub fn passed() -> Self {
        Self::new(TestStatus::Passed)
    }

    pub fn failed() -> Self {
        Self::new(TestStatus::Failed)
    }

    pub fn error() -> Self {
        Self::with_category(TestStatus::Failed, "error")
    }

    pub fn timeout() -> Self {
        Self::with_category(TestStatus::Failed, "timeout")
    }

    pub fn inconclusive() -> Self {
        Self::new(TestStatus::Inconclusive)
    }

    pub fn canceled() -> Self {
        Self::with_category(TestStatus::Inconclusive, "canceled")
    }

    pub fn skipped() -> Self {
        Self::new(TestStatus::Skipped)
    }

    pub fn ignored() -> Self {
        Self::with_category(TestStatus::Skipped, "ignored")
    }

    pub fn pending() -> Self {
        Self::with_category(TestStatus::Skipped, "pending")
    }

    pub fn explicit() -> Self {
        Self::with_category(TestStatus::Skipped, "explicit")
    }

    /// Keep whichever outcome is more severe.
    ///
    /// On equal status a categorized outcome wins over an uncategorized one so
    /// the category is not lost.
    pub fn combine_with(&self, other: &Outcome) -> Outcome {
        if other.status > self.status
            || (other.status == self.status && self.category.is_none() && other.category.is_some())
        {
            return other.clone();
        }
        self.clone()
    }

    /// Drop the category, keeping only the status.
    pub fn generalize(&self) -> Outcome {
        Outcome::new(self.status)
    }

    pub fn display_name(&self) -> &str {
        self.category.as_deref().unwrap_or(self.status.as_str())
    }
}

impl Default for Outcome {
    fn default() -> Self {
        Self::passed()
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Named stage of step execution.
///
/// Open-ended: the well-known phases are provided as constructors, but any
/// custom phase name is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LifecyclePhase(String);

impl LifecyclePhase {
    pub const STARTING: &'static str = "Starting";
    pub const SET_UP: &'static str = "SetUp";
    pub const EXECUTE: &'static str = "Execute";
    pub const TEAR_DOWN: &'static str = "TearDown";
    pub const FINISHING: &'static str = "Finishing";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn starting() -> Self {
        Self::new(Self::STARTING)
    }

    pub fn set_up() -> Self {
        Self::new(Self::SET_UP)
    }

    pub fn execute() -> Self {
        Self::new(Self::EXECUTE)
    }

    pub fn tear_down() -> Self {
        Self::new(Self::TEAR_DOWN)
    }

    pub fn finishing() -> Self {
        Self::new(Self::FINISHING)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LifecyclePhase {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
