//! What happens to a command whose dependencies did not pass.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::core::types::{Outcome, TestStatus};
use crate::tree::TestId;

/// Dependencies always order execution; the policy decides whether a failed
/// dependency also affects its dependents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyPolicy {
    /// Run dependents regardless of how their dependencies ended.
    #[default]
    OrderOnly,
    /// Report the dependent's whole subtree as skipped.
    SkipDependents,
    /// Report the dependent as failed and its descendants as skipped.
    FailDependents,
}

/// Combined subtree outcome of every command that has run so far.
#[derive(Debug, Default)]
pub struct OutcomeLedger {
    outcomes: Mutex<HashMap<TestId, Outcome>>,
}

impl OutcomeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, test: TestId, outcome: Outcome) {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(test, outcome);
    }

    pub fn get(&self, test: TestId) -> Option<Outcome> {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&test)
            .cloned()
    }

    /// First dependency that ran without passing. Dependencies that have not
    /// run count as satisfied.
    pub fn first_unsatisfied(&self, dependencies: &[TestId]) -> Option<(TestId, Outcome)> {
        let outcomes = self.outcomes.lock().unwrap_or_else(PoisonError::into_inner);
        dependencies.iter().find_map(|dependency| {
            outcomes
                .get(dependency)
                .filter(|outcome| outcome.status != TestStatus::Passed)
                .map(|outcome| (*dependency, outcome.clone()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{TestDef, TestTree};

    #[test]
    fn only_passed_dependencies_are_satisfied() {
        let mut tree = TestTree::new(TestDef::group("root"));
        let a = tree.add_child(tree.root(), TestDef::case("A")).expect("A");
        let b = tree.add_child(tree.root(), TestDef::case("B")).expect("B");
        let c = tree.add_child(tree.root(), TestDef::case("C")).expect("C");

        let ledger = OutcomeLedger::new();
        ledger.record(a, Outcome::passed());
        assert_eq!(ledger.first_unsatisfied(&[a, c]), None);

        ledger.record(b, Outcome::skipped());
        assert_eq!(ledger.first_unsatisfied(&[a, b]), Some((b, Outcome::skipped())));
        assert_eq!(ledger.get(a), Some(Outcome::passed()));
    }

    #[test]
    fn policy_parses_snake_case() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: DependencyPolicy,
        }
        let parsed: Wrapper = toml::from_str("policy = \"fail_dependents\"").expect("parse");
        assert_eq!(parsed.policy, DependencyPolicy::FailDependents);
    }
}
