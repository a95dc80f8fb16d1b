//! Operation handles.
//!
//! Every write to a signal returns a [`SignalOperation`] that resolves once
//! the tree has accepted or rejected the command. For synchronous trees this
//! happens before the write returns; for asynchronous trees it happens when
//! the authority confirms the command.
//!
//! Results are published through the environment's result notifier, so a UI
//! can make sure callbacks observe the result on its own thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tokio::sync::Notify;

use crate::environment::SignalEnvironment;
use crate::reactive::dispatcher::Dispatcher;

/// Why an operation did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    /// A precondition of the command did not hold.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The operation was cancelled before it succeeded.
    #[error("operation was cancelled")]
    Cancelled,

    /// The command succeeded but its result could not be decoded.
    #[error("cannot decode result: {0}")]
    Decode(String),
}

pub type OperationResult<R> = std::result::Result<R, OperationError>;

struct ResultSlot<R> {
    value: Mutex<Option<OperationResult<R>>>,
    ready: Condvar,
    notify: Notify,
}

/// Handle to the eventual result of a signal write.
pub struct SignalOperation<R> {
    slot: Arc<ResultSlot<R>>,
}

impl<R> Clone for SignalOperation<R> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<R: Clone + Send + 'static> SignalOperation<R> {
    pub(crate) fn pending() -> Self {
        Self {
            slot: Arc::new(ResultSlot {
                value: Mutex::new(None),
                ready: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// An operation that is already done.
    pub fn resolved_with(result: OperationResult<R>) -> Self {
        let operation = Self::pending();
        operation.resolve(result);
        operation
    }

    /// Store the result and wake all waiters. Only the first call has an
    /// effect; returns whether this call did.
    pub(crate) fn resolve(&self, result: OperationResult<R>) -> bool {
        {
            let mut value = self.slot.value.lock();
            if value.is_some() {
                return false;
            }
            *value = Some(result);
        }
        self.slot.ready.notify_all();
        self.slot.notify.notify_waiters();
        true
    }

    /// Resolve through the environment's result notifier.
    pub(crate) fn complete(&self, result: OperationResult<R>) {
        let operation = self.clone();
        SignalEnvironment::result_notifier().dispatch(Box::new(move || {
            operation.resolve(result);
        }));
    }

    /// The result, if the operation is done.
    pub fn result(&self) -> Option<OperationResult<R>> {
        self.slot.value.lock().clone()
    }

    pub fn is_done(&self) -> bool {
        self.slot.value.lock().is_some()
    }

    /// Whether the operation is done and succeeded.
    pub fn is_success(&self) -> bool {
        matches!(*self.slot.value.lock(), Some(Ok(_)))
    }

    /// Block the current thread until the operation is done.
    pub fn wait(&self) -> OperationResult<R> {
        let mut value = self.slot.value.lock();
        loop {
            if let Some(result) = value.as_ref() {
                return result.clone();
            }
            self.slot.ready.wait(&mut value);
        }
    }

    /// Block for at most `timeout`. Returns `None` if still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<OperationResult<R>> {
        let mut value = self.slot.value.lock();
        if value.is_none() {
            self.slot.ready.wait_for(&mut value, timeout);
        }
        value.clone()
    }

    /// Wait for the result without blocking the executor.
    pub async fn resolved(&self) -> OperationResult<R> {
        loop {
            let notified = self.slot.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.result() {
                return result;
            }
            notified.await;
        }
    }
}

impl<R: std::fmt::Debug> std::fmt::Debug for SignalOperation<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalOperation")
            .field("result", &*self.slot.value.lock())
            .finish()
    }
}

/// Result of inserting a new child: the signal for the child plus the
/// operation that tells whether the insert succeeded.
#[derive(Debug, Clone)]
pub struct InsertOperation<S> {
    pub signal: S,
    pub operation: SignalOperation<()>,
}

impl<S> InsertOperation<S> {
    pub fn new(signal: S, operation: SignalOperation<()>) -> Self {
        Self { signal, operation }
    }
}

/// An operation that may be retried internally and can be cancelled.
#[derive(Debug, Clone)]
pub struct CancelableOperation<R> {
    operation: SignalOperation<R>,
    cancelled: Arc<AtomicBool>,
}

impl<R: Clone + Send + 'static> CancelableOperation<R> {
    pub(crate) fn new() -> Self {
        Self {
            operation: SignalOperation::pending(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stop retrying on conflict.
    ///
    /// If the attempt in flight is rejected, the operation resolves with
    /// [`OperationError::Cancelled`] instead of retrying. If it is accepted,
    /// cancelling has no effect.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn operation(&self) -> &SignalOperation<R> {
        &self.operation
    }

    pub fn result(&self) -> Option<OperationResult<R>> {
        self.operation.result()
    }

    pub fn wait(&self) -> OperationResult<R> {
        self.operation.wait()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_resolution_wins() {
        let operation = SignalOperation::<i32>::pending();
        assert!(!operation.is_done());

        assert!(operation.resolve(Ok(1)));
        assert!(!operation.resolve(Ok(2)));

        assert_eq!(operation.result(), Some(Ok(1)));
        assert!(operation.is_success());
    }

    #[test]
    fn wait_blocks_until_resolved() {
        let operation = SignalOperation::<String>::pending();
        let resolver = operation.clone();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            resolver.resolve(Err(OperationError::Rejected("nope".to_string())));
        });

        assert_eq!(
            operation.wait(),
            Err(OperationError::Rejected("nope".to_string()))
        );
        handle.join().unwrap();
    }

    #[test]
    fn wait_timeout_returns_none_while_pending() {
        let operation = SignalOperation::<()>::pending();
        assert_eq!(operation.wait_timeout(Duration::from_millis(5)), None);
    }

    #[tokio::test]
    async fn resolved_future_completes() {
        let operation = SignalOperation::<u8>::pending();
        let resolver = operation.clone();
        tokio::spawn(async move {
            resolver.resolve(Ok(7));
        });

        assert_eq!(operation.resolved().await, Ok(7));
    }

    #[test]
    fn cancel_only_marks_operation() {
        let operation = CancelableOperation::<()>::new();
        operation.cancel();

        assert!(operation.is_cancelled());
        assert_eq!(operation.result(), None);
    }

    #[test]
    fn cancel_after_success_keeps_result() {
        let operation = CancelableOperation::<i32>::new();
        operation.operation().resolve(Ok(3));
        operation.cancel();

        assert_eq!(operation.result(), Some(Ok(3)));
    }
}
