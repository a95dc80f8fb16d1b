//! Task dispatchers.
//!
//! Effects and result notifications never run their callbacks directly.
//! Instead they hand a [`Task`] to a [`Dispatcher`], which decides where and
//! when it runs.

use std::collections::VecDeque;
use std::sync::OnceLock;

use parking_lot::Mutex;
use tokio::runtime::{Handle, Runtime};

/// A unit of work handed to a dispatcher.
pub type Task = Box<dyn FnOnce() + Send>;

/// Executes tasks.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, task: Task);
}

impl<F> Dispatcher for F
where
    F: Fn(Task) + Send + Sync,
{
    fn dispatch(&self, task: Task) {
        self(task)
    }
}

/// Runs every task immediately on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct SynchronousDispatcher;

impl Dispatcher for SynchronousDispatcher {
    fn dispatch(&self, task: Task) {
        task();
    }
}

/// Runs tasks on the blocking pool of a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioDispatcher {
    handle: Handle,
}

impl TokioDispatcher {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime of the calling context, if any.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }

    /// A dispatcher backed by a runtime owned by this crate.
    ///
    /// The runtime is built on first use. Returns `None` if it cannot be
    /// created.
    pub fn background() -> Option<Self> {
        static RUNTIME: OnceLock<Option<Runtime>> = OnceLock::new();

        RUNTIME
            .get_or_init(|| {
                tokio::runtime::Builder::new_multi_thread()
                    .thread_name("arbor-dispatch")
                    .enable_all()
                    .build()
                    .map_err(|e| tracing::error!("failed to start dispatcher runtime: {e}"))
                    .ok()
            })
            .as_ref()
            .map(|runtime| Self::new(runtime.handle().clone()))
    }
}

impl Dispatcher for TokioDispatcher {
    fn dispatch(&self, task: Task) {
        // Tasks take locks and may block, keep them off the async workers
        self.handle.spawn_blocking(task);
    }
}

/// Queues tasks until [`run_pending_tasks`](Self::run_pending_tasks) is
/// called.
#[derive(Default)]
pub struct ManualDispatcher {
    queue: Mutex<VecDeque<Task>>,
}

impl ManualDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the tasks that are queued right now.
    ///
    /// Tasks queued while running are left for the next call. Returns the
    /// number of tasks that ran.
    pub fn run_pending_tasks(&self) -> usize {
        let tasks: Vec<Task> = self.queue.lock().drain(..).collect();
        let count = tasks.len();
        for task in tasks {
            task();
        }
        count
    }

    /// Run tasks until the queue stays empty.
    pub fn run_until_idle(&self) -> usize {
        let mut total = 0;
        loop {
            let count = self.run_pending_tasks();
            if count == 0 {
                return total;
            }
            total += count;
        }
    }

    pub fn has_pending_tasks(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    pub fn pending_tasks(&self) -> usize {
        self.queue.lock().len()
    }
}

impl Dispatcher for ManualDispatcher {
    fn dispatch(&self, task: Task) {
        self.queue.lock().push_back(task);
    }
}

impl std::fmt::Debug for ManualDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualDispatcher")
            .field("pending", &self.pending_tasks())
            .finish()
    }
}
