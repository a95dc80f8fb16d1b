//! Effect Implementation
//!
//! An Effect is a side-effecting computation that re-runs whenever the
//! signals it read change.
//!
//! # How Effects Work
//!
//! 1. When created, the first run is handed to the effect's dispatcher.
//!
//! 2. Every run is tracked with the [`UsageTracker`]. When it finishes, a
//!    listener is registered on the collected usage.
//!
//! 3. When a dependency changes, the listener schedules another run through
//!    the dispatcher. Changes that happen before the run starts are coalesced
//!    into one run, which sees only the latest state.
//!
//! # Failures
//!
//! An action that returns an error is reported to
//! [`SignalEnvironment::report_error`] and stays active. An action that
//! panics is closed and reported as [`SignalError::EffectPanicked`].
//!
//! # Loop detection
//!
//! Each run is an invocation that remembers the nodes it read and the
//! invocations whose writes scheduled it. A write to a node read by the
//! current invocation or any of its causes would trigger itself forever, so
//! it fails with [`SignalError::IllegalState`] and the writing effect is
//! closed. Loops within one synchronous call are caught at the first
//! conflicting write; loops that go through an asynchronous dispatcher are
//! caught when the second hop runs.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::environment::SignalEnvironment;
use crate::error::{Result, SignalError};
use crate::transaction::Transaction;
use crate::tree::CleanupCallback;

use super::dispatcher::Dispatcher;
use super::tracker::UsageTracker;
use super::usage::NodeKey;

/// The body of an effect.
pub type EffectAction = Arc<dyn Fn() -> Result<()> + Send + Sync>;

/// One run of an effect.
struct Invocation {
    effect: Weak<EffectInner>,
    reads: Mutex<HashSet<NodeKey>>,
    causes: SmallVec<[Arc<Invocation>; 1]>,
}

impl Invocation {
    /// Whether writing `key` would re-trigger this invocation or one of its
    /// causes.
    fn conflicts_with(self: &Arc<Self>, key: NodeKey) -> bool {
        let mut visited: HashSet<*const Invocation> = HashSet::new();
        let mut stack = vec![self.clone()];

        while let Some(invocation) = stack.pop() {
            if !visited.insert(Arc::as_ptr(&invocation)) {
                continue;
            }
            if invocation.reads.lock().contains(&key) {
                return true;
            }
            stack.extend(invocation.causes.iter().cloned());
        }
        false
    }
}

thread_local! {
    static CURRENT_INVOCATION: RefCell<Option<Arc<Invocation>>> = const { RefCell::new(None) };
}

/// Restores the previous invocation when dropped.
struct InvocationGuard {
    previous: Option<Arc<Invocation>>,
}

impl InvocationGuard {
    fn enter(invocation: Arc<Invocation>) -> Self {
        let previous = CURRENT_INVOCATION.with(|current| current.replace(Some(invocation)));
        Self { previous }
    }
}

impl Drop for InvocationGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_INVOCATION.with(|current| *current.borrow_mut() = previous);
    }
}

fn current_invocation() -> Option<Arc<Invocation>> {
    CURRENT_INVOCATION.with(|current| current.borrow().clone())
}

/// Remember nodes read by the running effect.
pub(crate) fn record_reads(keys: &[NodeKey]) {
    if keys.is_empty() {
        return;
    }
    if let Some(invocation) = current_invocation() {
        invocation.reads.lock().extend(keys.iter().copied());
    }
}

/// Fail if the running effect is about to write a node that it, or an
/// effect that caused it to run, depends on.
pub(crate) fn check_write(key: NodeKey) -> Result<()> {
    let Some(invocation) = current_invocation() else {
        return Ok(());
    };
    if !invocation.conflicts_with(key) {
        return Ok(());
    }

    tracing::warn!(tree = %key.tree, node = %key.id, "infinite loop detected, closing effect");
    if let Some(effect) = invocation.effect.upgrade() {
        effect.close();
    }
    Err(SignalError::illegal_state(format!(
        "infinite loop detected: effect writes node {} that it depends on",
        key.id
    )))
}

struct EffectInner {
    action: EffectAction,
    dispatcher: Arc<dyn Dispatcher>,
    closed: AtomicBool,
    pending: AtomicBool,
    run_count: AtomicUsize,
    state: Mutex<EffectState>,
}

#[derive(Default)]
struct EffectState {
    cleanup: Option<CleanupCallback>,
    causes: SmallVec<[Arc<Invocation>; 1]>,
}

impl EffectInner {
    fn schedule(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Some(cause) = current_invocation() {
            self.state.lock().causes.push(cause);
        }
        if self.pending.swap(true, Ordering::SeqCst) {
            return;
        }

        let effect = Arc::downgrade(self);
        self.dispatcher.dispatch(Box::new(move || {
            if let Some(effect) = effect.upgrade() {
                effect.run();
            }
        }));
    }

    fn run(self: &Arc<Self>) {
        self.pending.store(false, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let (previous_cleanup, causes) = {
            let mut state = self.state.lock();
            (state.cleanup.take(), std::mem::take(&mut state.causes))
        };
        if let Some(cleanup) = previous_cleanup {
            cleanup();
        }

        let invocation = Arc::new(Invocation {
            effect: Arc::downgrade(self),
            reads: Mutex::new(HashSet::new()),
            causes,
        });
        let run = self.run_count.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(run, "running effect");

        let outcome = {
            let _invocation = InvocationGuard::enter(invocation);
            let action = self.action.clone();
            Transaction::run_without_transaction(|| {
                panic::catch_unwind(AssertUnwindSafe(|| UsageTracker::track(|| action())))
            })
        };

        let usage = match outcome {
            Err(payload) => {
                self.close();
                SignalEnvironment::report_error(&SignalError::EffectPanicked(panic_message(
                    payload.as_ref(),
                )));
                return;
            }
            Ok((result, usage)) => {
                if let Err(error) = result {
                    SignalEnvironment::report_error(&error);
                }
                usage
            }
        };

        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let effect = Arc::downgrade(self);
        let cleanup = usage.on_next_change(Arc::new(move |_immediate| {
            if let Some(effect) = effect.upgrade() {
                effect.schedule();
            }
            false
        }));

        let mut state = self.state.lock();
        if self.closed.load(Ordering::SeqCst) {
            drop(state);
            cleanup();
        } else {
            state.cleanup = Some(cleanup);
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let cleanup = {
            let mut state = self.state.lock();
            state.causes.clear();
            state.cleanup.take()
        };
        if let Some(cleanup) = cleanup {
            cleanup();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A computation that re-runs when the signals it reads change.
///
/// The effect stays active until [`cleanup`](Effect::cleanup) is called or
/// it is dropped.
///
/// # Example
///
/// ```rust,ignore
/// let count = NumberSignal::new(0.0)?;
///
/// let c = count.clone();
/// let effect = Effect::new(move || {
///     println!("Count is: {}", c.value()?);
///     Ok(())
/// });
///
/// count.set(5.0)?;  // Prints: "Count is: 5"
/// ```
#[must_use = "the effect stops when it is dropped"]
pub struct Effect {
    inner: Arc<EffectInner>,
}

impl Effect {
    /// Create an effect that runs on the environment's default dispatcher.
    pub fn new(action: impl Fn() -> Result<()> + Send + Sync + 'static) -> Self {
        Self::with_dispatcher(action, SignalEnvironment::default_dispatcher())
    }

    /// Create an effect whose runs are handed to `dispatcher`.
    pub fn with_dispatcher(
        action: impl Fn() -> Result<()> + Send + Sync + 'static,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        let inner = Arc::new(EffectInner {
            action: Arc::new(action),
            dispatcher,
            closed: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            run_count: AtomicUsize::new(0),
            state: Mutex::new(EffectState::default()),
        });
        inner.schedule();
        Self { inner }
    }

    /// Stop the effect. A run that is already scheduled does nothing.
    pub fn cleanup(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of times the action has been started.
    pub fn run_count(&self) -> usize {
        self.inner.run_count.load(Ordering::SeqCst)
    }
}

impl Drop for Effect {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effect")
            .field("run_count", &self.run_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Shorthand for [`Effect::new`].
pub fn effect(action: impl Fn() -> Result<()> + Send + Sync + 'static) -> Effect {
    Effect::new(action)
}
