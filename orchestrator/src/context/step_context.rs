//! Lifecycle state machine of one executing step.
//!
//! `Created -> Started -> Finishing -> Finished`. A context is started by the
//! [`ContextManager`](crate::context::ContextManager), finished exactly once
//! (explicitly or by its parent), and read-only afterwards.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::context::events::{LogEvent, StepEvent};
use crate::context::log::LogWriter;
use crate::context::manager::ContextManager;
use crate::context::step::Step;
use crate::context::tracker::ScopeGuard;
use crate::context::ContextError;
use crate::core::types::{LifecyclePhase, Outcome};
use crate::tree::Metadata;

const ORPHANED_MESSAGE: &str = "The test step was orphaned by the test runner!\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StepStatus {
    Created = 0,
    Started = 1,
    Finishing = 2,
    Finished = 3,
}

impl StepStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => StepStatus::Created,
            1 => StepStatus::Started,
            2 => StepStatus::Finishing,
            _ => StepStatus::Finished,
        }
    }
}

/// Subscription returned by [`StepContext::on_finishing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type FinishingHandler = Box<dyn FnOnce(&Arc<StepContext>) + Send>;

struct Inner {
    phase: LifecyclePhase,
    outcome: Outcome,
    metadata: Metadata,
    finishing: Vec<(HandlerId, FinishingHandler)>,
    next_handler: u64,
    started_at: Option<Instant>,
    scope: Option<ScopeGuard>,
    parent_subscription: Option<HandlerId>,
    finishing_thread: Option<ThreadId>,
}

pub struct StepContext {
    step: Step,
    parent: Option<Weak<StepContext>>,
    manager: Arc<ContextManager>,
    status: AtomicU8,
    assert_count: AtomicU32,
    inner: Mutex<Inner>,
    /// Signalled when the status becomes `Finished`.
    finished: Condvar,
    /// Set once the log is closed; held while a log event is published so
    /// nothing is written after the close.
    log_closed: Mutex<bool>,
}

impl StepContext {
    pub(crate) fn new(
        manager: Arc<ContextManager>,
        step: Step,
        parent: Option<&Arc<StepContext>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            step,
            parent: parent.map(Arc::downgrade),
            manager,
            status: AtomicU8::new(StepStatus::Created as u8),
            assert_count: AtomicU32::new(0),
            inner: Mutex::new(Inner {
                phase: LifecyclePhase::starting(),
                outcome: Outcome::passed(),
                metadata: Metadata::new(),
                finishing: Vec::new(),
                next_handler: 0,
                started_at: None,
                scope: None,
                parent_subscription: None,
                finishing_thread: None,
            }),
            finished: Condvar::new(),
            log_closed: Mutex::new(false),
        })
    }

    /// Begin timing, enter the context and subscribe to the parent's
    /// finishing notification.
    pub(crate) fn start(self: &Arc<Self>) -> Result<(), ContextError> {
        {
            let mut inner = self.lock();
            if self.status() != StepStatus::Created || inner.started_at.is_some() {
                return Err(ContextError::AlreadyStarted {
                    step: self.step.to_string(),
                });
            }
            inner.started_at = Some(Instant::now());
        }
        if self.step.is_root() {
            self.manager.publish(StepEvent::InstanceStarted {
                step: self.step.clone(),
            });
        }
        self.manager.publish(StepEvent::StepStarted {
            step: self.step.clone(),
        });
        let scope = self.manager.tracker().enter(Arc::clone(self));
        {
            let mut inner = self.lock();
            inner.scope = Some(scope);
            self.status
                .store(StepStatus::Started as u8, Ordering::Release);
        }
        debug!(step = %self.step.id, name = %self.step, "step started");

        // Subscribe outside our own lock; the parent may invoke the handler
        // immediately if it is already finishing.
        if let Some(parent) = self.parent() {
            let child = Arc::clone(self);
            match parent.on_finishing(move |_| {
                child.orphan();
            }) {
                Ok(id) => self.lock().parent_subscription = Some(id),
                Err(_) => {
                    self.orphan();
                }
            }
        }
        Ok(())
    }

    pub fn step(&self) -> &Step {
        &self.step
    }

    pub fn parent(&self) -> Option<Arc<StepContext>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn manager(&self) -> &Arc<ContextManager> {
        &self.manager
    }

    pub fn status(&self) -> StepStatus {
        StepStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Started or finishing: the states in which mutators are accepted.
    pub fn is_running(&self) -> bool {
        matches!(self.status(), StepStatus::Started | StepStatus::Finishing)
    }

    pub fn is_finished(&self) -> bool {
        self.status() == StepStatus::Finished
    }

    pub fn lifecycle_phase(&self) -> LifecyclePhase {
        self.lock().phase.clone()
    }

    /// Setting the current phase again publishes nothing.
    pub fn set_lifecycle_phase(&self, phase: impl Into<LifecyclePhase>) -> Result<(), ContextError> {
        let phase = phase.into();
        {
            let mut inner = self.lock();
            self.ensure_running("set the lifecycle phase")?;
            if inner.phase == phase {
                return Ok(());
            }
            inner.phase = phase.clone();
        }
        self.manager.publish(StepEvent::LifecyclePhaseChanged {
            step_id: self.step.id,
            phase,
        });
        Ok(())
    }

    pub fn outcome(&self) -> Outcome {
        self.lock().outcome.clone()
    }

    /// Outcome reported if the step finishes without an explicit one, e.g.
    /// when a test body returns normally.
    pub fn set_interim_outcome(&self, outcome: Outcome) -> Result<(), ContextError> {
        let mut inner = self.lock();
        self.ensure_running("set the interim outcome")?;
        inner.outcome = outcome;
        Ok(())
    }

    pub fn metadata(&self) -> Metadata {
        self.lock().metadata.clone()
    }

    pub fn add_metadata(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), ContextError> {
        let (key, value) = (key.into(), value.into());
        {
            let mut inner = self.lock();
            self.ensure_running("add metadata")?;
            inner.metadata.add(key.clone(), value.clone());
        }
        self.manager.publish(StepEvent::MetadataAdded {
            step_id: self.step.id,
            key,
            value,
        });
        Ok(())
    }

    pub fn assert_count(&self) -> u32 {
        self.assert_count.load(Ordering::Acquire)
    }

    /// Lock-free; also counts toward every running ancestor.
    pub fn add_assert_count(&self, count: u32) -> Result<(), ContextError> {
        self.ensure_running("add to the assert count")?;
        self.assert_count.fetch_add(count, Ordering::AcqRel);
        if let Some(parent) = self.parent() {
            if parent.add_assert_count(count).is_err() {
                debug!(step = %self.step.id, "parent finished before child asserts were counted");
            }
        }
        Ok(())
    }

    /// Subscribe to the finishing notification.
    ///
    /// Handlers run once, in subscription order, while this context is still
    /// current. A handler added while the context is already finishing runs
    /// immediately on the caller's thread.
    pub fn on_finishing<F>(self: &Arc<Self>, handler: F) -> Result<HandlerId, ContextError>
    where
        F: FnOnce(&Arc<StepContext>) + Send + 'static,
    {
        let mut inner = self.lock();
        let id = HandlerId(inner.next_handler);
        inner.next_handler += 1;
        match self.status() {
            StepStatus::Created | StepStatus::Started => {
                inner.finishing.push((id, Box::new(handler)));
                Ok(id)
            }
            StepStatus::Finishing => {
                drop(inner);
                invoke_handler(self, Box::new(handler));
                Ok(id)
            }
            StepStatus::Finished => Err(ContextError::NotRunning {
                step: self.step.to_string(),
                action: "subscribe to finishing",
            }),
        }
    }

    /// Returns false when the handler already ran or was never registered.
    pub fn remove_finishing_handler(&self, id: HandlerId) -> bool {
        let mut inner = self.lock();
        let before = inner.finishing.len();
        inner.finishing.retain(|(handler, _)| *handler != id);
        inner.finishing.len() != before
    }

    pub fn elapsed(&self) -> Duration {
        self.lock()
            .started_at
            .map(|started| started.elapsed())
            .unwrap_or_default()
    }

    pub fn log(self: &Arc<Self>) -> LogWriter<'_> {
        LogWriter::new(self)
    }

    /// Start a child step of this one.
    pub fn start_child(self: &Arc<Self>, step: Step) -> Result<Arc<StepContext>, ContextError> {
        self.manager.start_step(Some(self), step)
    }

    /// Run `body` as a dynamic child step named `name` in phase `Execute`.
    ///
    /// Errors and panics become an `error` outcome for the child. When the
    /// manager skips dynamic steps the child is reported as skipped without
    /// running the body.
    pub fn run_step<F>(self: &Arc<Self>, name: impl Into<String>, body: F) -> Result<Outcome, ContextError>
    where
        F: FnOnce(&Arc<StepContext>) -> anyhow::Result<()>,
    {
        let child = self.start_child(Step::child(&self.step, name, true))?;
        if self.manager.skips_dynamic_steps() {
            child.finish(Outcome::skipped());
            return Ok(Outcome::skipped());
        }

        child.set_lifecycle_phase(LifecyclePhase::execute())?;
        let outcome = execute_body(&child, body);
        child.finish(outcome.clone());
        Ok(outcome)
    }

    /// Finish with `outcome`, timing the step from its start.
    ///
    /// Returns false if the step was already finishing or finished.
    pub fn finish(self: &Arc<Self>, outcome: Outcome) -> bool {
        self.finish_inner(outcome, None, false)
    }

    /// Finish with an externally measured duration.
    pub fn finish_with_duration(self: &Arc<Self>, outcome: Outcome, duration: Duration) -> bool {
        self.finish_inner(outcome, Some(duration), false)
    }

    /// Force-finish a step nobody finished: `error` outcome plus an orphan
    /// diagnostic in the failures stream.
    pub fn orphan(self: &Arc<Self>) -> bool {
        self.finish_inner(Outcome::error(), None, true)
    }

    fn finish_inner(
        self: &Arc<Self>,
        outcome: Outcome,
        duration: Option<Duration>,
        orphaned: bool,
    ) -> bool {
        let (handlers, phase_changed, started_at) = {
            let mut inner = self.lock();
            if self
                .status
                .compare_exchange(
                    StepStatus::Started as u8,
                    StepStatus::Finishing as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                // A parent tearing down a child that is finishing elsewhere
                // must not report before the child does.
                if orphaned {
                    self.wait_until_finished(inner);
                }
                return false;
            }
            inner.finishing_thread = Some(thread::current().id());
            inner.outcome = outcome.clone();
            let phase_changed = inner.phase.as_str() != LifecyclePhase::FINISHING;
            inner.phase = LifecyclePhase::finishing();
            (
                std::mem::take(&mut inner.finishing),
                phase_changed,
                inner.started_at,
            )
        };

        if phase_changed {
            self.manager.publish(StepEvent::LifecyclePhaseChanged {
                step_id: self.step.id,
                phase: LifecyclePhase::finishing(),
            });
        }

        if !handlers.is_empty() {
            let scope = self.manager.tracker().enter(Arc::clone(self));
            for (_, handler) in handlers {
                invoke_handler(self, handler);
            }
            if let Err(err) = scope.exit() {
                error!(step = %self.step.id, error = %err, "finishing handlers left the scope unbalanced");
            }
        }

        if orphaned {
            warn!(step = %self.step.id, name = %self.step, "step orphaned by the runner");
            self.log().failure(ORPHANED_MESSAGE);
        }

        self.detach_scope(orphaned);

        {
            let mut closed = self.lock_log();
            *closed = true;
            self.manager.publish(StepEvent::Log {
                step_id: self.step.id,
                log: LogEvent::Close,
            });
        }

        let duration = duration
            .unwrap_or_else(|| started_at.map_or(Duration::ZERO, |started| started.elapsed()));
        let assert_count = self.assert_count();
        self.manager.publish(StepEvent::StepFinished {
            step_id: self.step.id,
            outcome: outcome.clone(),
            duration,
            assert_count,
        });

        let subscription = {
            let mut inner = self.lock();
            self.status
                .store(StepStatus::Finished as u8, Ordering::Release);
            inner.finishing_thread = None;
            inner.parent_subscription.take()
        };
        self.finished.notify_all();
        self.manager.step_finished();

        // Subscribed until now so a parent finishing concurrently waits for
        // this step to report first.
        if let (Some(id), Some(parent)) = (subscription, self.parent()) {
            parent.remove_finishing_handler(id);
        }
        debug!(step = %self.step.id, outcome = %outcome, assert_count, "step finished");
        true
    }

    /// Block while another thread finishes this context. Returns at once when
    /// the caller is the finishing thread itself.
    fn wait_until_finished(&self, mut inner: MutexGuard<'_, Inner>) {
        let me = thread::current().id();
        while self.status() == StepStatus::Finishing && inner.finishing_thread != Some(me) {
            inner = self
                .finished
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn detach_scope(&self, orphaned: bool) {
        let Some(scope) = self.lock().scope.take() else {
            return;
        };
        if orphaned || !scope.is_owner_thread() {
            scope.abandon();
            return;
        }
        if let Err(err) = scope.exit() {
            error!(step = %self.step.id, error = %err, "step scope exited out of order");
        }
    }

    /// Publish a log event for this step unless its log is closed; hands the
    /// event back if it is.
    pub(crate) fn publish_log(&self, log: LogEvent) -> Result<(), LogEvent> {
        let closed = self.lock_log();
        if *closed {
            return Err(log);
        }
        self.manager.publish(StepEvent::Log {
            step_id: self.step.id,
            log,
        });
        Ok(())
    }

    fn ensure_running(&self, action: &'static str) -> Result<(), ContextError> {
        if self.is_running() {
            return Ok(());
        }
        Err(ContextError::NotRunning {
            step: self.step.to_string(),
            action,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_log(&self) -> MutexGuard<'_, bool> {
        self.log_closed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for StepContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepContext")
            .field("step", &self.step)
            .field("status", &self.status())
            .field("assert_count", &self.assert_count())
            .finish_non_exhaustive()
    }
}

fn invoke_handler(context: &Arc<StepContext>, handler: FinishingHandler) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(context))) {
        error!(
            step = %context.step.id,
            panic = %panic_message(payload.as_ref()),
            "finishing handler panicked"
        );
    }
}

/// Run a test body inside `context`, converting errors and panics into an
/// `error` outcome plus a failures log entry. A body that returns normally
/// reports the context's interim outcome.
pub(crate) fn execute_body<F>(context: &Arc<StepContext>, body: F) -> Outcome
where
    F: FnOnce(&Arc<StepContext>) -> anyhow::Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(|| body(context))) {
        Ok(Ok(())) => context.outcome(),
        Ok(Err(err)) => {
            debug!(step = %context.step.id, error = %err, "test body failed");
            context.log().failure(format!("{err:#}\n"));
            Outcome::error()
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            debug!(step = %context.step.id, panic = %message, "test body panicked");
            context.log().failure(format!("panicked: {message}\n"));
            Outcome::error()
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "non-string panic payload".to_string()
}
