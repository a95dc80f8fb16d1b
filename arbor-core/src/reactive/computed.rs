//! Computed Implementation
//!
//! A Computed is a cached derived value. It re-evaluates only when one of the
//! signals it read has changed since the last evaluation.
//!
//! Reading a computed value inside a tracked computation registers the
//! computed value's own dependencies, so effects react to the underlying
//! signals directly.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;

use super::tracker::UsageTracker;
use super::usage::Usage;

type Compute<T> = Arc<dyn Fn() -> Result<T> + Send + Sync>;

struct Cached<T> {
    value: Result<T>,
    usage: Arc<dyn Usage>,
}

struct ComputedInner<T> {
    compute: Compute<T>,
    cache: Mutex<Option<Cached<T>>>,
}

/// A cached value derived from other signals.
///
/// # Example
///
/// ```rust,ignore
/// let count = NumberSignal::new(2.0)?;
/// let c = count.clone();
/// let doubled = Computed::new(move || Ok(c.value()? * 2.0));
///
/// assert_eq!(doubled.value()?, 4.0);
/// ```
pub struct Computed<T> {
    inner: Arc<ComputedInner<T>>,
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Computed<T> {
    pub fn new(compute: impl Fn() -> Result<T> + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(ComputedInner {
                compute: Arc::new(compute),
                cache: Mutex::new(None),
            }),
        }
    }

    /// The current value, recomputed if a dependency changed. Registers the
    /// dependencies with the current tracker.
    pub fn value(&self) -> Result<T> {
        let cached = {
            let cache = self.inner.cache.lock();
            cache
                .as_ref()
                .filter(|cached| !cached.usage.has_changes())
                .map(|cached| (cached.value.clone(), cached.usage.clone()))
        };

        let (value, usage) = match cached {
            Some(hit) => hit,
            None => {
                let compute = self.inner.compute.clone();
                let (value, usage) = UsageTracker::track(|| compute());
                *self.inner.cache.lock() = Some(Cached {
                    value: value.clone(),
                    usage: usage.clone(),
                });
                (value, usage)
            }
        };

        UsageTracker::register_usage(usage);
        value
    }

    /// The current value without registering dependencies.
    pub fn peek(&self) -> Result<T> {
        UsageTracker::untracked(|| self.value())
    }

    /// Whether the next read will recompute.
    pub fn is_stale(&self) -> bool {
        self.inner
            .cache
            .lock()
            .as_ref()
            .map_or(true, |cached| cached.usage.has_changes())
    }
}

impl<T> std::fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Computed")
            .field("cached", &self.inner.cache.lock().is_some())
            .finish()
    }
}
