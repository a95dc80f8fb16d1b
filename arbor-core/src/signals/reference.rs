//! Local reference signals.

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::error::{Result, SignalError};
use crate::id::Id;
use crate::reactive::{check_write, NodeKey, SignalUsage, UsageKind, UsageTracker};
use crate::transaction::Transaction;
use crate::tree::{SignalCommand, SignalTree};

/// A signal holding an arbitrary local value.
///
/// The value never leaves the process, so it does not need to be
/// serializable. All access is serialized by a reentrant lock: ordinary
/// reads and writes wait for the lock, while any access during
/// [`modify`](Self::modify) fails with
/// [`SignalError::ConcurrentModification`].
///
/// Reference signals have no transactional semantics. Using one inside a
/// transaction fails with [`SignalError::IllegalState`].
pub struct ReferenceSignal<T> {
    inner: Arc<ReferenceInner<T>>,
}

struct ReferenceInner<T> {
    value: ReentrantMutex<RefCell<T>>,
    modifying: AtomicBool,
    version: AtomicU64,
    // Carries a change counter so dependents are notified like for any
    // other signal
    changes: Arc<SignalTree>,
}

impl<T> Clone for ReferenceSignal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> PartialEq for ReferenceSignal<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> Eq for ReferenceSignal<T> {}

impl<T> fmt::Debug for ReferenceSignal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceSignal")
            .field("version", &self.inner.version.load(Ordering::SeqCst))
            .field("modifying", &self.inner.modifying.load(Ordering::SeqCst))
            .finish()
    }
}

/// How long a blocked caller waits before checking whether a `modify` began.
const LOCK_POLL: Duration = Duration::from_millis(5);

fn being_modified() -> SignalError {
    SignalError::ConcurrentModification("reference signal is being modified".to_string())
}

/// Clears the modifying flag even if the callback panics.
struct ModifyGuard<'a>(&'a AtomicBool);

impl Drop for ModifyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<T: Clone + Send + 'static> ReferenceSignal<T> {
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(ReferenceInner {
                value: ReentrantMutex::new(RefCell::new(initial)),
                modifying: AtomicBool::new(false),
                version: AtomicU64::new(0),
                changes: SignalTree::synchronous(),
            }),
        }
    }

    fn key(&self) -> NodeKey {
        NodeKey {
            tree: self.inner.changes.id(),
            id: Id::ZERO,
        }
    }

    fn check_access(&self) -> Result<()> {
        if Transaction::in_transaction() {
            return Err(SignalError::illegal_state(
                "reference signals cannot be used inside a transaction",
            ));
        }
        if self.inner.modifying.load(Ordering::SeqCst) {
            return Err(being_modified());
        }
        Ok(())
    }

    /// Wait for the lock, failing as soon as a `modify` is running.
    ///
    /// `modify` raises the flag only while it holds the lock, so a caller that
    /// got the lock with the flag raised is calling from inside `modify`.
    fn lock(&self) -> Result<ReentrantMutexGuard<'_, RefCell<T>>> {
        loop {
            if let Some(guard) = self.inner.value.try_lock_for(LOCK_POLL) {
                if self.inner.modifying.load(Ordering::SeqCst) {
                    return Err(being_modified());
                }
                return Ok(guard);
            }
            if self.inner.modifying.load(Ordering::SeqCst) {
                return Err(being_modified());
            }
        }
    }

    fn check_write(&self) -> Result<()> {
        self.check_access()?;
        check_write(self.key())
    }

    fn track(&self) {
        if UsageTracker::is_active() {
            let changes = &self.inner.changes;
            UsageTracker::register_usage(SignalUsage::capture(
                changes,
                &changes.submitted(),
                Id::ZERO,
                UsageKind::Value,
            ));
        }
    }

    fn notify(&self) {
        let version = self.inner.version.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.changes.commit_single_command(
            SignalCommand::Set {
                command_id: Id::random(),
                target_node_id: Id::ZERO,
                value: version.into(),
            },
            None,
        );
    }

    /// The current value. Registers a dependency when tracked.
    pub fn value(&self) -> Result<T> {
        let value = self.peek()?;
        self.track();
        Ok(value)
    }

    /// The current value without registering a dependency.
    pub fn peek(&self) -> Result<T> {
        self.check_access()?;
        let guard = self.lock()?;
        let value = guard.borrow().clone();
        Ok(value)
    }

    /// Set a new value and return the previous one.
    pub fn set(&self, value: T) -> Result<T> {
        self.check_write()?;
        let previous = self.lock()?.replace(value);
        self.notify();
        Ok(previous)
    }

    /// Set `value` only if the current value equals `expected`. Returns
    /// whether the value was replaced.
    pub fn replace(&self, expected: &T, value: T) -> Result<bool>
    where
        T: PartialEq,
    {
        self.check_write()?;
        let replaced = {
            let guard = self.lock()?;
            let matches = *guard.borrow() == *expected;
            if matches {
                guard.replace(value);
            }
            matches
        };
        if replaced {
            self.notify();
        }
        Ok(replaced)
    }

    /// Replace the value with `updater(current)` while holding the lock and
    /// return the value that was replaced.
    ///
    /// `updater` gets a copy of the value, so it may access this signal
    /// again. Writes it makes are overwritten by its result.
    pub fn update(&self, updater: impl FnOnce(&T) -> T) -> Result<T> {
        self.check_write()?;
        let previous = {
            let guard = self.lock()?;
            let current = guard.borrow().clone();
            let next = updater(&current);
            guard.replace(next)
        };
        self.notify();
        Ok(previous)
    }

    /// Mutate the value in place.
    ///
    /// Any access to this signal from inside `modifier`, or from another
    /// thread while `modifier` runs, fails with
    /// [`SignalError::ConcurrentModification`]. Dependents are notified
    /// once `modifier` returns.
    pub fn modify(&self, modifier: impl FnOnce(&mut T)) -> Result<()> {
        self.check_write()?;
        {
            let guard = self.lock()?;
            self.inner.modifying.store(true, Ordering::SeqCst);
            let _modifying = ModifyGuard(&self.inner.modifying);
            let mut value = guard.borrow_mut();
            modifier(&mut value);
        }
        self.notify();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{Computed, Effect};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn set_update_and_replace() {
        let signal = ReferenceSignal::new(vec![1]);

        assert_eq!(signal.set(vec![2]).unwrap(), vec![1]);
        assert_eq!(signal.update(|v| [v.as_slice(), &[3]].concat()).unwrap(), vec![2]);
        assert!(!signal.replace(&vec![9], vec![0]).unwrap());
        assert!(signal.replace(&vec![2, 3], vec![4]).unwrap());
        assert_eq!(signal.value().unwrap(), vec![4]);
    }

    #[test]
    fn modify_mutates_in_place() {
        let signal = ReferenceSignal::new(String::from("a"));
        signal.modify(|value| value.push('b')).unwrap();
        assert_eq!(signal.peek().unwrap(), "ab");
    }

    #[test]
    fn access_during_modify_fails_fast() {
        let signal = ReferenceSignal::new(0);
        let inner = signal.clone();
        let mut seen = None;

        signal
            .modify(|value| {
                *value = 1;
                seen = Some(inner.value());
            })
            .unwrap();

        assert!(matches!(seen, Some(Err(SignalError::ConcurrentModification(_)))));
        assert_eq!(signal.value().unwrap(), 1);
    }

    #[test]
    fn other_threads_fail_during_modify() {
        let signal = ReferenceSignal::new(0);
        let reader = signal.clone();

        signal
            .modify(|_| {
                let result = thread::spawn(move || reader.peek()).join().unwrap();
                assert!(matches!(result, Err(SignalError::ConcurrentModification(_))));
            })
            .unwrap();
    }

    #[test]
    fn ordinary_operations_block() {
        let signal = ReferenceSignal::new(0_u32);
        let writer = signal.clone();
        let mut pending = None;

        signal
            .update(|value| {
                let handle = thread::spawn(move || writer.set(5));
                thread::sleep(Duration::from_millis(20));
                assert!(!handle.is_finished());
                pending = Some(handle);
                value + 1
            })
            .unwrap();

        let previous = pending.unwrap().join().unwrap().unwrap();
        assert_eq!(previous, 1);
        assert_eq!(signal.peek().unwrap(), 5);
    }

    #[test]
    fn writes_inside_update_do_not_panic() {
        let signal = ReferenceSignal::new(1);
        let inner = signal.clone();
        let mut nested = None;

        let previous = signal
            .update(|value| {
                nested = Some(inner.set(10));
                value + 1
            })
            .unwrap();

        assert_eq!(nested, Some(Ok(1)));
        assert_eq!(previous, 10);
        assert_eq!(signal.peek().unwrap(), 2);

        let inner = signal.clone();
        signal
            .update(|value| {
                inner.update(|v| v * 10).unwrap();
                assert!(inner.replace(&20, 30).unwrap());
                value + 1
            })
            .unwrap();
        assert_eq!(signal.peek().unwrap(), 3);
    }

    #[test]
    fn waiting_callers_fail_once_modify_starts() {
        let signal = ReferenceSignal::new(0);
        let (reader, modifier) = (signal.clone(), signal.clone());
        let (sender, receiver) = mpsc::channel();

        signal
            .update(|value| {
                // The reader passes the flag check and waits for the lock
                thread::spawn(move || sender.send(reader.peek()).unwrap());
                thread::sleep(Duration::from_millis(20));

                modifier
                    .modify(|_| {
                        let result = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
                        assert!(matches!(result, Err(SignalError::ConcurrentModification(_))));
                    })
                    .unwrap();
                value + 1
            })
            .unwrap();

        assert_eq!(signal.peek().unwrap(), 1);
    }

    #[test]
    fn transactions_are_rejected() {
        let signal = ReferenceSignal::new(1);
        let result = Transaction::run_in_transaction(|| signal.value()).into_value();
        assert!(result.is_err_and(|error| error.is_illegal_state()));
    }

    #[test]
    fn dependents_are_notified() {
        let signal = ReferenceSignal::new(1);
        let runs = Arc::new(AtomicUsize::new(0));

        let source = signal.clone();
        let counter = runs.clone();
        let _effect = Effect::new(move || {
            source.value()?;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        signal.modify(|value| *value += 1).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        let source = signal.clone();
        let doubled = Computed::new(move || Ok(source.value()? * 2));
        assert_eq!(doubled.value().unwrap(), 4);
        signal.set(5).unwrap();
        assert_eq!(doubled.value().unwrap(), 10);
    }
}
