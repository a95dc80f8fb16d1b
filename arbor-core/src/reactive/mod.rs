//! Reactive Primitives
//!
//! This module implements the reactive layer on top of signal trees:
//! dependency tracking, effects, computed values and the dispatchers that
//! decide where effect runs happen.
//!
//! # Concepts
//!
//! ## Usages
//!
//! Reading a signal inside [`UsageTracker::track`] records a [`Usage`]: the
//! node that was read and the part of it that matters (its value, its list
//! children, its map children or its last update). A usage can tell whether
//! that part has changed since and can notify a listener on the next change.
//!
//! ## Effects
//!
//! An [`Effect`] re-runs its action whenever a usage recorded by its previous
//! run changes. Runs go through a [`Dispatcher`], so the caller that wrote a
//! signal decides nothing about when or where dependent effects run.
//!
//! ## Computed values
//!
//! A [`Computed`] caches a derived value and recomputes it lazily once one of
//! its usages has changed.
//!
//! # Implementation Notes
//!
//! Tracking is thread-local. Signal reads check whether a tracking frame is
//! active on the current thread and, if so, register their usage there. Only
//! nodes that were actually read become dependencies, never whole trees.

mod computed;
pub mod dispatcher;
mod effect;
mod tracker;
mod usage;

pub use computed::Computed;
pub use dispatcher::{Dispatcher, ManualDispatcher, SynchronousDispatcher, Task, TokioDispatcher};
pub use effect::{effect, Effect, EffectAction};
pub use tracker::UsageTracker;
pub use usage::{NoUsage, NodeKey, TransientListener, Usage, UsageKind};

pub(crate) use effect::check_write;
pub(crate) use usage::SignalUsage;
