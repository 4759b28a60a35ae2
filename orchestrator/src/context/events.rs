//! Step lifecycle notifications and the sinks that receive them.
//!
//! Events are product output: hosts turn them into reports. They are distinct
//! from the tracing diagnostics emitted by the library itself.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::context::step::{Step, StepId};
use crate::core::types::{LifecyclePhase, Outcome};

/// Well-known log stream names.
pub mod streams {
    pub const DEFAULT: &str = "default";
    pub const CONSOLE_OUTPUT: &str = "console-output";
    pub const CONSOLE_ERROR: &str = "console-error";
    pub const DEBUG_TRACE: &str = "debug-trace";
    pub const WARNINGS: &str = "warnings";
    pub const FAILURES: &str = "failures";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogEvent {
    Write {
        stream: String,
        text: String,
    },
    BeginSection {
        stream: String,
        name: String,
    },
    EndSection {
        stream: String,
    },
    Attach {
        name: String,
        content_type: String,
        content: Vec<u8>,
    },
    /// Embed a previously attached attachment into a stream.
    Embed {
        stream: String,
        attachment: String,
    },
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StepEvent {
    /// Published before the `StepStarted` of every root step.
    InstanceStarted {
        step: Step,
    },
    StepStarted {
        step: Step,
    },
    LifecyclePhaseChanged {
        step_id: StepId,
        phase: LifecyclePhase,
    },
    MetadataAdded {
        step_id: StepId,
        key: String,
        value: String,
    },
    StepFinished {
        step_id: StepId,
        outcome: Outcome,
        duration: Duration,
        assert_count: u32,
    },
    Log {
        step_id: StepId,
        log: LogEvent,
    },
}

impl StepEvent {
    pub fn step_id(&self) -> StepId {
        match self {
            StepEvent::InstanceStarted { step } | StepEvent::StepStarted { step } => step.id,
            StepEvent::LifecyclePhaseChanged { step_id, .. }
            | StepEvent::MetadataAdded { step_id, .. }
            | StepEvent::StepFinished { step_id, .. }
            | StepEvent::Log { step_id, .. } => *step_id,
        }
    }
}

/// Receiver of step events.
///
/// Called synchronously from whichever thread mutates the step, so
/// implementations must be cheap and must not call back into the context.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: StepEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: StepEvent) {}
}

/// Forwards events to `tracing`: starts and finishes at `info`, the rest at
/// `debug`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn publish(&self, event: StepEvent) {
        match &event {
            StepEvent::InstanceStarted { step } => {
                info!(step = %step.id, name = %step.full_name, "instance started");
            }
            StepEvent::StepStarted { step } => {
                info!(step = %step.id, name = %step.full_name, "step started");
            }
            StepEvent::StepFinished {
                step_id,
                outcome,
                duration,
                assert_count,
            } => {
                info!(
                    step = %step_id,
                    outcome = %outcome,
                    duration_ms = duration.as_millis() as u64,
                    assert_count,
                    "step finished"
                );
            }
            StepEvent::LifecyclePhaseChanged { step_id, phase } => {
                debug!(step = %step_id, phase = %phase, "lifecycle phase changed");
            }
            StepEvent::MetadataAdded {
                step_id,
                key,
                value,
            } => {
                debug!(step = %step_id, key = %key, value = %value, "metadata added");
            }
            StepEvent::Log { step_id, log } => {
                debug!(step = %step_id, log = ?log, "log");
            }
        }
    }
}
