//! Runtime step state and its propagation across threads.
//!
//! - [`tracker`]: which step context is current on each thread.
//! - [`step_context`]: the lifecycle state machine of one executing step.
//! - [`manager`]: starts step contexts and owns the event sink they publish to.
//! - [`events`]: lifecycle and log notifications delivered to hosts.

use thiserror::Error;

pub mod events;
pub mod log;
pub mod manager;
pub mod step;
pub mod step_context;
pub mod tracker;

pub use events::{EventSink, LogEvent, NullSink, StepEvent, TracingSink, streams};
pub use log::LogWriter;
pub use manager::ContextManager;
pub use step::{Step, StepId};
pub use step_context::{HandlerId, StepContext, StepStatus};
pub use tracker::{ContextTracker, ScopeGuard, ThreadRef};

/// Host protocol violations.
///
/// These indicate a bug in the controller or host, not a failing test.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("cannot {action} unless step '{step}' is running")]
    NotRunning { step: String, action: &'static str },
    #[error("step '{step}' has already been started")]
    AlreadyStarted { step: String },
    #[error("step '{step}' is not a child of step '{expected}'")]
    ParentMismatch { step: String, expected: String },
    #[error("the scope of step '{step}' does not belong to this thread")]
    WrongThread { step: String },
    #[error("the scope of step '{step}' was exited while '{top}' was still entered")]
    UnbalancedExit { step: String, top: String },
    #[error("the scope of step '{step}' has already been exited")]
    AlreadyExited { step: String },
}
