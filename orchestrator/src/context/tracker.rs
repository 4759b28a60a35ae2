//! Resolves the current step context of each thread.
//!
//! Resolution order for [`ContextTracker::current_context`]:
//! 1. The innermost live scope entered on the calling thread.
//! 2. The default registered for the calling thread.
//! 3. The global context.
//!
//! Scope stacks are thread-local and keyed by tracker, so reading or writing
//! them takes no lock. Thread defaults and the global context share one mutex,
//! which also guards the lazily started cleanup thread that drops defaults of
//! threads that have exited.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::context::ContextError;
use crate::context::step_context::StepContext;

pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

static NEXT_TRACKER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static SCOPES: RefCell<HashMap<u64, Vec<Arc<Link>>>> = RefCell::new(HashMap::new());
    static THREAD_TOKEN: Arc<()> = Arc::new(());
}

/// Entry of a thread's scope stack. The strong handle lives in the
/// [`ScopeGuard`]; a link left behind on a thread that never exits it keeps
/// nothing alive.
struct Link {
    context: Weak<StepContext>,
    label: String,
    abandoned: AtomicBool,
}

impl Link {
    fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }

    fn is_stale(&self) -> bool {
        self.is_abandoned() || self.context.strong_count() == 0
    }
}

/// Reference to a thread that can outlive it.
///
/// Obtain one on the thread itself with [`ThreadRef::current`] and hand it to
/// whoever registers the default context.
#[derive(Debug, Clone)]
pub struct ThreadRef {
    id: ThreadId,
    name: Option<String>,
    alive: Weak<()>,
}

impl ThreadRef {
    pub fn current() -> Self {
        let thread = thread::current();
        Self {
            id: thread.id(),
            name: thread.name().map(str::to_string),
            alive: THREAD_TOKEN.with(Arc::downgrade),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.strong_count() > 0
    }
}

struct Override {
    thread: ThreadRef,
    context: Arc<StepContext>,
}

#[derive(Default)]
struct State {
    global: Option<Arc<StepContext>>,
    overrides: HashMap<ThreadId, Override>,
    cleanup_running: bool,
    shutdown: bool,
}

struct Shared {
    state: Mutex<State>,
    wake: Condvar,
    cleanup_interval: Duration,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ContextTracker {
    id: u64,
    shared: Arc<Shared>,
}

impl Default for ContextTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextTracker {
    pub fn new() -> Self {
        Self::with_cleanup_interval(DEFAULT_CLEANUP_INTERVAL)
    }

    pub fn with_cleanup_interval(cleanup_interval: Duration) -> Self {
        Self {
            id: NEXT_TRACKER_ID.fetch_add(1, Ordering::Relaxed),
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                wake: Condvar::new(),
                cleanup_interval,
            }),
        }
    }

    pub fn cleanup_interval(&self) -> Duration {
        self.shared.cleanup_interval
    }

    pub fn global_context(&self) -> Option<Arc<StepContext>> {
        self.shared.lock().global.clone()
    }

    pub fn set_global_context(&self, context: Option<Arc<StepContext>>) {
        self.shared.lock().global = context;
    }

    pub fn current_context(&self) -> Option<Arc<StepContext>> {
        if let Some(context) = innermost_live(self.id) {
            return Some(context);
        }
        let state = self.shared.lock();
        state
            .overrides
            .get(&thread::current().id())
            .map(|entry| Arc::clone(&entry.context))
            .or_else(|| state.global.clone())
    }

    /// Push `context` onto the calling thread's scope stack.
    ///
    /// Releasing the returned guard restores the previous current context.
    pub fn enter(&self, context: Arc<StepContext>) -> ScopeGuard {
        enter_scope(self.id, context)
    }

    /// Register (or with `None`, clear) the default context of `thread`.
    ///
    /// Setting the global context as a thread default clears the override.
    pub fn set_thread_default_context(&self, thread: &ThreadRef, context: Option<Arc<StepContext>>) {
        let mut state = self.shared.lock();
        let is_global = match (&context, &state.global) {
            (Some(context), Some(global)) => Arc::ptr_eq(context, global),
            _ => false,
        };
        match context {
            Some(context) if !is_global => {
                state.overrides.insert(
                    thread.id,
                    Override {
                        thread: thread.clone(),
                        context,
                    },
                );
            }
            _ => {
                state.overrides.remove(&thread.id);
            }
        }
        configure_cleanup(&self.shared, &mut state);
    }

    /// Default context of `thread`, falling back to the global context.
    pub fn thread_default_context(&self, thread: &ThreadRef) -> Option<Arc<StepContext>> {
        let state = self.shared.lock();
        state
            .overrides
            .get(&thread.id)
            .map(|entry| Arc::clone(&entry.context))
            .or_else(|| state.global.clone())
    }

    pub fn thread_override_count(&self) -> usize {
        self.shared.lock().overrides.len()
    }

    pub fn is_cleanup_running(&self) -> bool {
        self.shared.lock().cleanup_running
    }

    /// Drop the defaults of threads that have exited. Returns how many were
    /// removed. The background cleanup thread calls this on every interval.
    pub fn cleanup_dead_threads(&self) -> usize {
        let mut state = self.shared.lock();
        let removed = sweep_dead_threads(&mut state);
        configure_cleanup(&self.shared, &mut state);
        removed
    }

    /// Spawn a thread that starts inside the caller's current context.
    pub fn spawn<F, T>(&self, f: F) -> std::io::Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let tracker = self.id;
        let inherited = self.current_context();
        thread::Builder::new().spawn(move || {
            let scope = inherited.map(|context| enter_scope(tracker, context));
            let result = f();
            if let Some(Err(err)) = scope.map(ScopeGuard::exit) {
                error!(error = %err, "inherited context scope was not exited cleanly");
            }
            result
        })
    }
}

impl Drop for ContextTracker {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.shutdown = true;
        state.overrides.clear();
        state.global = None;
        self.shared.wake.notify_all();
    }
}

/// Scope entered with [`ContextTracker::enter`].
///
/// Exit on the thread that entered it, in LIFO order. Dropping the guard
/// exits it and logs any violation.
#[must_use = "dropping the guard exits the scope immediately"]
pub struct ScopeGuard {
    tracker: u64,
    context: Arc<StepContext>,
    link: Arc<Link>,
    thread: ThreadId,
    done: bool,
}

impl ScopeGuard {
    pub fn context(&self) -> &Arc<StepContext> {
        &self.context
    }

    pub fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    /// Pop this scope, restoring the context that was current when it was
    /// entered.
    ///
    /// On error the scope is abandoned: it no longer resolves as current and
    /// is discarded once the scopes above it are gone.
    pub fn exit(mut self) -> Result<(), ContextError> {
        self.done = true;
        let result = exit_scope(self.tracker, &self.link, self.thread);
        if result.is_err() {
            self.link.abandoned.store(true, Ordering::Release);
        }
        result
    }

    /// Give up on the scope without exiting it. Used when the step finishes
    /// from another thread or is torn down by its parent.
    pub fn abandon(mut self) {
        self.done = true;
        self.link.abandoned.store(true, Ordering::Release);
        if self.is_owner_thread() {
            sweep_abandoned(self.tracker);
        }
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Err(err) = exit_scope(self.tracker, &self.link, self.thread) {
            self.link.abandoned.store(true, Ordering::Release);
            error!(error = %err, "context scope dropped out of order");
        }
    }
}

fn enter_scope(tracker: u64, context: Arc<StepContext>) -> ScopeGuard {
    let link = Arc::new(Link {
        context: Arc::downgrade(&context),
        label: context.step().to_string(),
        abandoned: AtomicBool::new(false),
    });
    SCOPES.with(|scopes| {
        let mut scopes = scopes.borrow_mut();
        // Stacks topped by scopes that were abandoned from other threads are
        // trimmed here, as nothing on this thread will exit them.
        scopes.retain(|_, stack| {
            while stack.last().is_some_and(|top| top.is_stale()) {
                stack.pop();
            }
            !stack.is_empty()
        });
        scopes.entry(tracker).or_default().push(Arc::clone(&link));
    });
    ScopeGuard {
        tracker,
        context,
        link,
        thread: thread::current().id(),
        done: false,
    }
}

fn innermost_live(tracker: u64) -> Option<Arc<StepContext>> {
    SCOPES.with(|scopes| {
        let mut scopes = scopes.borrow_mut();
        let stack = scopes.get_mut(&tracker)?;
        while stack.last().is_some_and(|top| top.is_stale()) {
            stack.pop();
        }
        let live = stack
            .iter()
            .rev()
            .filter(|link| !link.is_abandoned())
            .find_map(|link| link.context.upgrade());
        if stack.is_empty() {
            scopes.remove(&tracker);
        }
        live
    })
}

fn exit_scope(tracker: u64, link: &Arc<Link>, owner: ThreadId) -> Result<(), ContextError> {
    let step = link.label.clone();
    if thread::current().id() != owner {
        return Err(ContextError::WrongThread { step });
    }

    SCOPES.with(|scopes| {
        let mut scopes = scopes.borrow_mut();
        let Some(stack) = scopes.get_mut(&tracker) else {
            return Err(ContextError::AlreadyExited { step });
        };
        while stack
            .last()
            .is_some_and(|top| !Arc::ptr_eq(top, link) && top.is_stale())
        {
            stack.pop();
        }

        let result = match stack.last() {
            Some(top) if Arc::ptr_eq(top, link) => {
                stack.pop();
                while stack.last().is_some_and(|top| top.is_stale()) {
                    stack.pop();
                }
                Ok(())
            }
            Some(top) if stack.iter().any(|entry| Arc::ptr_eq(entry, link)) => {
                Err(ContextError::UnbalancedExit {
                    step,
                    top: top.label.clone(),
                })
            }
            _ => Err(ContextError::AlreadyExited { step }),
        };
        if stack.is_empty() {
            scopes.remove(&tracker);
        }
        result
    })
}

fn sweep_abandoned(tracker: u64) {
    SCOPES.with(|scopes| {
        let mut scopes = scopes.borrow_mut();
        if let Some(stack) = scopes.get_mut(&tracker) {
            while stack.last().is_some_and(|top| top.is_stale()) {
                stack.pop();
            }
            if stack.is_empty() {
                scopes.remove(&tracker);
            }
        }
    });
}

fn sweep_dead_threads(state: &mut State) -> usize {
    let before = state.overrides.len();
    state.overrides.retain(|_, entry| entry.thread.is_alive());
    let removed = before - state.overrides.len();
    if removed > 0 {
        debug!(removed, remaining = state.overrides.len(), "dropped defaults of exited threads");
    }
    removed
}

/// Start the cleanup thread when overrides exist, wake it to stop when none do.
fn configure_cleanup(shared: &Arc<Shared>, state: &mut State) {
    if state.overrides.is_empty() {
        if state.cleanup_running {
            shared.wake.notify_all();
        }
        return;
    }
    if state.cleanup_running || state.shutdown {
        return;
    }

    let worker = Arc::clone(shared);
    let spawned = thread::Builder::new()
        .name("context-cleanup".to_string())
        .spawn(move || cleanup_loop(&worker));
    match spawned {
        Ok(_) => {
            state.cleanup_running = true;
            debug!(interval_ms = shared.cleanup_interval.as_millis() as u64, "thread cleanup started");
        }
        Err(err) => warn!(error = %err, "failed to start thread cleanup"),
    }
}

fn cleanup_loop(shared: &Shared) {
    let mut state = shared.lock();
    loop {
        if state.shutdown || state.overrides.is_empty() {
            state.cleanup_running = false;
            debug!("thread cleanup stopped");
            return;
        }
        let (next, timeout) = shared
            .wake
            .wait_timeout(state, shared.cleanup_interval)
            .unwrap_or_else(PoisonError::into_inner);
        state = next;
        if timeout.timed_out() {
            sweep_dead_threads(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::test_support::scratch_context;

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn exited_thread() -> ThreadRef {
        thread::spawn(ThreadRef::current).join().expect("join")
    }

    #[test]
    fn falls_back_to_global_context() {
        let tracker = ContextTracker::new();
        assert!(tracker.current_context().is_none());

        let global = scratch_context("global");
        tracker.set_global_context(Some(Arc::clone(&global)));
        let current = tracker.current_context().expect("current");
        assert!(Arc::ptr_eq(&current, &global));
    }

    #[test]
    fn enter_and_exit_restore_previous_context() {
        let tracker = ContextTracker::new();
        let global = scratch_context("global");
        let outer = scratch_context("outer");
        let inner = scratch_context("inner");
        tracker.set_global_context(Some(Arc::clone(&global)));

        let outer_scope = tracker.enter(Arc::clone(&outer));
        let inner_scope = tracker.enter(Arc::clone(&inner));
        assert!(Arc::ptr_eq(&tracker.current_context().expect("inner"), &inner));

        inner_scope.exit().expect("exit inner");
        assert!(Arc::ptr_eq(&tracker.current_context().expect("outer"), &outer));
        outer_scope.exit().expect("exit outer");
        assert!(Arc::ptr_eq(&tracker.current_context().expect("global"), &global));
    }

    #[test]
    fn out_of_order_exit_is_rejected() {
        let tracker = ContextTracker::new();
        let outer = scratch_context("outer");
        let inner = scratch_context("inner");

        let outer_scope = tracker.enter(Arc::clone(&outer));
        let inner_scope = tracker.enter(Arc::clone(&inner));

        let err = outer_scope.exit().unwrap_err();
        assert!(matches!(err, ContextError::UnbalancedExit { .. }), "{err}");
        // The inner scope still resolves; the rejected outer one is gone once
        // the inner exits.
        assert!(Arc::ptr_eq(&tracker.current_context().expect("inner"), &inner));
        inner_scope.exit().expect("exit inner");
        assert!(tracker.current_context().is_none());
    }

    #[test]
    fn exit_from_another_thread_is_rejected() {
        let tracker = ContextTracker::new();
        let scope = tracker.enter(scratch_context("owned"));
        let err = thread::spawn(move || scope.exit())
            .join()
            .expect("join")
            .unwrap_err();
        assert!(matches!(err, ContextError::WrongThread { .. }), "{err}");
        // Abandoned by the failed exit.
        assert!(tracker.current_context().is_none());
    }

    #[test]
    fn scopes_do_not_leak_between_threads_or_trackers() {
        let tracker = Arc::new(ContextTracker::new());
        let other = ContextTracker::new();
        let scope = tracker.enter(scratch_context("main"));

        let remote = Arc::clone(&tracker);
        let seen = thread::spawn(move || remote.current_context().is_some())
            .join()
            .expect("join");
        assert!(!seen);
        assert!(other.current_context().is_none());
        scope.exit().expect("exit");
    }

    #[test]
    fn spawn_inherits_current_context() {
        let tracker = Arc::new(ContextTracker::new());
        let context = scratch_context("parent");
        let scope = tracker.enter(Arc::clone(&context));

        let remote = Arc::clone(&tracker);
        let inherited = tracker
            .spawn(move || remote.current_context())
            .expect("spawn")
            .join()
            .expect("join")
            .expect("inherited");
        assert!(Arc::ptr_eq(&inherited, &context));
        scope.exit().expect("exit");
    }

    fn scope_depth(tracker: &ContextTracker) -> usize {
        SCOPES.with(|scopes| scopes.borrow().get(&tracker.id).map_or(0, Vec::len))
    }

    #[test]
    fn scope_abandoned_elsewhere_keeps_nothing_alive() {
        let tracker = ContextTracker::new();
        let context = scratch_context("pooled");
        let weak = Arc::downgrade(&context);
        let scope = tracker.enter(context);

        thread::spawn(move || scope.abandon()).join().expect("join");
        assert!(weak.upgrade().is_none());
        assert_eq!(scope_depth(&tracker), 1);

        // The stale link is trimmed on the next lookup.
        assert!(tracker.current_context().is_none());
        assert_eq!(scope_depth(&tracker), 0);

        let other = ContextTracker::new();
        let leftover = other.enter(scratch_context("leftover"));
        thread::spawn(move || leftover.abandon()).join().expect("join");
        let next = tracker.enter(scratch_context("next"));
        assert_eq!(scope_depth(&other), 0);
        next.exit().expect("exit");
        assert_eq!(scope_depth(&tracker), 0);
    }

    #[test]
    fn thread_default_overrides_global() {
        let tracker = ContextTracker::new();
        let global = scratch_context("global");
        let default = scratch_context("default");
        tracker.set_global_context(Some(Arc::clone(&global)));

        let me = ThreadRef::current();
        tracker.set_thread_default_context(&me, Some(Arc::clone(&default)));
        assert!(Arc::ptr_eq(&tracker.current_context().expect("default"), &default));
        assert!(Arc::ptr_eq(
            &tracker.thread_default_context(&me).expect("default"),
            &default
        ));

        tracker.set_thread_default_context(&me, Some(Arc::clone(&global)));
        assert_eq!(tracker.thread_override_count(), 0);
        assert!(Arc::ptr_eq(&tracker.current_context().expect("global"), &global));
    }

    #[test]
    fn cleanup_starts_lazily_and_stops_when_empty() {
        let tracker = ContextTracker::new();
        assert!(!tracker.is_cleanup_running());

        let dead = exited_thread();
        assert!(!dead.is_alive());
        tracker.set_thread_default_context(&dead, Some(scratch_context("stale")));
        assert!(tracker.is_cleanup_running());

        assert_eq!(tracker.cleanup_dead_threads(), 1);
        assert_eq!(tracker.thread_override_count(), 0);
        assert!(wait_until(|| !tracker.is_cleanup_running()));
    }

    #[test]
    fn background_cleanup_drops_exited_threads() {
        let tracker = ContextTracker::with_cleanup_interval(Duration::from_millis(10));
        let me = ThreadRef::current();
        tracker.set_thread_default_context(&me, Some(scratch_context("alive")));
        tracker.set_thread_default_context(&exited_thread(), Some(scratch_context("stale")));
        assert_eq!(tracker.thread_override_count(), 2);

        assert!(wait_until(|| tracker.thread_override_count() == 1));
        assert!(tracker.thread_default_context(&me).is_some());

        tracker.set_thread_default_context(&me, None);
        assert!(wait_until(|| !tracker.is_cleanup_running()));
    }
}
