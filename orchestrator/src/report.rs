//! Run statistics gathered from step events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;

use crate::context::{EventSink, StepEvent, StepId};
use crate::core::types::{Outcome, TestStatus};

/// Totals over one run.
///
/// Only test-case steps count toward the outcome tallies; every finished step
/// counts toward `step_count`. Parents already include their children's
/// asserts and time, so those two are the maximum seen rather than a sum.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub step_count: usize,
    pub test_count: usize,
    pub run_count: usize,
    pub passed_count: usize,
    pub failed_count: usize,
    pub inconclusive_count: usize,
    pub skipped_count: usize,
    pub assert_count: u32,
    pub duration: Duration,
}

impl Statistics {
    pub fn merge_step(&mut self, is_test_case: bool, outcome: &Outcome, assert_count: u32, duration: Duration) {
        self.assert_count = self.assert_count.max(assert_count);
        self.duration = self.duration.max(duration);
        self.step_count += 1;
        if !is_test_case {
            return;
        }
        self.test_count += 1;
        self.add_outcome(outcome);
    }

    pub fn add_outcome(&mut self, outcome: &Outcome) {
        match outcome.status {
            TestStatus::Passed => {
                self.passed_count += 1;
                self.run_count += 1;
            }
            TestStatus::Failed => {
                self.failed_count += 1;
                self.run_count += 1;
            }
            TestStatus::Inconclusive => {
                self.inconclusive_count += 1;
                self.run_count += 1;
            }
            TestStatus::Skipped => self.skipped_count += 1,
        }
    }

    /// One-line summary, e.g. `4 run, 3 passed, 1 failed, 0 inconclusive, 2 skipped`.
    pub fn format_summary(&self) -> String {
        format!(
            "{} run, {} passed, {} failed, {} inconclusive, {} skipped",
            self.run_count,
            self.passed_count,
            self.failed_count,
            self.inconclusive_count,
            self.skipped_count
        )
    }
}

/// Forwards events to an inner sink while gathering [`Statistics`].
pub struct StatisticsSink {
    inner: Arc<dyn EventSink>,
    state: Mutex<StatisticsState>,
}

#[derive(Default)]
struct StatisticsState {
    test_cases: HashMap<StepId, bool>,
    statistics: Statistics,
}

impl StatisticsSink {
    pub fn new(inner: Arc<dyn EventSink>) -> Self {
        Self {
            inner,
            state: Mutex::new(StatisticsState::default()),
        }
    }

    pub fn statistics(&self) -> Statistics {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .statistics
            .clone()
    }
}

impl EventSink for StatisticsSink {
    fn publish(&self, event: StepEvent) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match &event {
                StepEvent::StepStarted { step } => {
                    state.test_cases.insert(step.id, step.is_test_case);
                }
                StepEvent::StepFinished {
                    step_id,
                    outcome,
                    duration,
                    assert_count,
                } => {
                    let is_test_case = state.test_cases.remove(step_id).unwrap_or(false);
                    state
                        .statistics
                        .merge_step(is_test_case, outcome, *assert_count, *duration);
                }
                _ => {}
            }
        }
        self.inner.publish(event);
    }
}
