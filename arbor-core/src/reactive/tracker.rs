//! Usage Tracker
//!
//! Records which signals a computation reads. Tracking is thread-local: a
//! frame is pushed for each tracked computation and every signal read while
//! the frame is on top registers a [`Usage`] in it. Nested frames are
//! independent, so a computed value that is evaluated inside an effect
//! collects its own dependencies.

use std::cell::RefCell;
use std::sync::Arc;

use super::effect;
use super::usage::{CombinedUsage, NoUsage, Usage};

thread_local! {
    /// `None` frames suspend tracking.
    static FRAMES: RefCell<Vec<Option<Vec<Arc<dyn Usage>>>>> = const { RefCell::new(Vec::new()) };
}

/// Pops its frame when dropped, also when the computation panics.
struct FrameGuard {
    popped: bool,
}

impl FrameGuard {
    fn push(frame: Option<Vec<Arc<dyn Usage>>>) -> Self {
        FRAMES.with(|frames| frames.borrow_mut().push(frame));
        Self { popped: false }
    }

    fn finish(mut self) -> Vec<Arc<dyn Usage>> {
        self.popped = true;
        FRAMES
            .with(|frames| frames.borrow_mut().pop())
            .flatten()
            .unwrap_or_default()
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        if !self.popped {
            FRAMES.with(|frames| {
                frames.borrow_mut().pop();
            });
        }
    }
}

/// Entry points for dependency tracking.
pub struct UsageTracker;

impl UsageTracker {
    /// Run `f` and collect the usages of everything it reads.
    pub fn track<R>(f: impl FnOnce() -> R) -> (R, Arc<dyn Usage>) {
        let guard = FrameGuard::push(Some(Vec::new()));
        let value = f();
        let mut usages = guard.finish();

        let usage: Arc<dyn Usage> = match usages.len() {
            0 => Arc::new(NoUsage),
            1 => usages.remove(0),
            _ => Arc::new(CombinedUsage::new(usages)),
        };
        (value, usage)
    }

    /// Run `f` without recording any reads, even inside a tracked
    /// computation.
    pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
        let _guard = FrameGuard::push(None);
        f()
    }

    /// Whether reads are currently being recorded.
    pub fn is_active() -> bool {
        FRAMES.with(|frames| matches!(frames.borrow().last(), Some(Some(_))))
    }

    /// Add a usage to the current frame. Does nothing when tracking is not
    /// active.
    pub fn register_usage(usage: Arc<dyn Usage>) {
        if !Self::is_active() {
            return;
        }
        effect::record_reads(&usage.dependencies());
        FRAMES.with(|frames| {
            if let Some(Some(frame)) = frames.borrow_mut().last_mut() {
                frame.push(usage);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Id;
    use crate::reactive::usage::{SignalUsage, UsageKind};
    use crate::tree::SignalTree;

    fn root_usage() -> Arc<dyn Usage> {
        let tree = SignalTree::synchronous();
        SignalUsage::capture(&tree, &tree.submitted(), Id::ZERO, UsageKind::Value)
    }

    #[test]
    fn tracking_collects_registered_usages() {
        assert!(!UsageTracker::is_active());

        let ((), usage) = UsageTracker::track(|| {
            assert!(UsageTracker::is_active());
            UsageTracker::register_usage(root_usage());
            UsageTracker::register_usage(root_usage());
        });

        assert_eq!(usage.dependencies().len(), 2);
        assert!(!UsageTracker::is_active());
    }

    #[test]
    fn untracked_reads_are_ignored() {
        let ((), usage) = UsageTracker::track(|| {
            UsageTracker::untracked(|| {
                assert!(!UsageTracker::is_active());
                UsageTracker::register_usage(root_usage());
            });
        });
        assert!(usage.dependencies().is_empty());
    }

    #[test]
    fn nested_frames_are_independent() {
        let ((), outer) = UsageTracker::track(|| {
            let ((), inner) = UsageTracker::track(|| {
                UsageTracker::register_usage(root_usage());
            });
            assert_eq!(inner.dependencies().len(), 1);
        });
        assert!(outer.dependencies().is_empty());
    }

    #[test]
    fn frame_is_popped_after_panic() {
        let outcome = std::panic::catch_unwind(|| {
            UsageTracker::track(|| panic!("boom"));
        });
        assert!(outcome.is_err());
        assert!(!UsageTracker::is_active());
    }
}
