//! Starts step contexts and routes their events.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::context::ContextError;
use crate::context::events::{EventSink, StepEvent};
use crate::context::step::Step;
use crate::context::step_context::{StepContext, StepStatus};
use crate::context::tracker::ContextTracker;

/// Shared by every context of one run.
pub struct ContextManager {
    tracker: Arc<ContextTracker>,
    sink: Arc<dyn EventSink>,
    skip_dynamic_steps: bool,
    running: AtomicUsize,
}

impl ContextManager {
    pub fn new(tracker: Arc<ContextTracker>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            tracker,
            sink,
            skip_dynamic_steps: false,
            running: AtomicUsize::new(0),
        }
    }

    pub fn with_skip_dynamic_steps(mut self, skip: bool) -> Self {
        self.skip_dynamic_steps = skip;
        self
    }

    pub fn tracker(&self) -> &Arc<ContextTracker> {
        &self.tracker
    }

    pub fn skips_dynamic_steps(&self) -> bool {
        self.skip_dynamic_steps
    }

    /// Contexts started and not yet finished.
    pub fn running_steps(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    /// Create and start a context for `step`.
    ///
    /// `parent` must be the running context of `step.parent`; root steps take
    /// no parent.
    pub fn start_step(
        self: &Arc<Self>,
        parent: Option<&Arc<StepContext>>,
        step: Step,
    ) -> Result<Arc<StepContext>, ContextError> {
        let expected = parent.map(|p| p.step().id);
        if step.parent != expected {
            return Err(ContextError::ParentMismatch {
                step: step.to_string(),
                expected: parent.map_or_else(|| "(none)".to_string(), |p| p.step().to_string()),
            });
        }
        if let Some(parent) = parent {
            if parent.status() != StepStatus::Started {
                return Err(ContextError::NotRunning {
                    step: parent.step().to_string(),
                    action: "start a child step",
                });
            }
        }

        let context = StepContext::new(Arc::clone(self), step, parent);
        self.running.fetch_add(1, Ordering::AcqRel);
        if let Err(err) = context.start() {
            self.running.fetch_sub(1, Ordering::AcqRel);
            return Err(err);
        }
        Ok(context)
    }

    pub(crate) fn publish(&self, event: StepEvent) {
        self.sink.publish(event);
    }

    pub(crate) fn step_finished(&self) {
        self.running.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for ContextManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextManager")
            .field("skip_dynamic_steps", &self.skip_dynamic_steps)
            .field("running", &self.running_steps())
            .finish_non_exhaustive()
    }
}
