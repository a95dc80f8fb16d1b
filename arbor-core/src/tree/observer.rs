//! Change observers for tree nodes.
//!
//! An observer is registered for a single node and fires once, the next time
//! the node changes. It returns `true` to stay registered for the change after
//! that.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::id::Id;

/// Unique identifier for an observer registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

impl ObserverId {
    /// Generate a new unique observer ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ObserverId {
    fn default() -> Self {
        Self::new()
    }
}

/// Callback invoked when an observed node changes. Returns whether to keep
/// observing.
pub type Observer = Box<dyn FnMut() -> bool + Send>;

/// An observer taken out of the registry for invocation.
pub(crate) struct PendingObserver {
    pub(crate) node: Id,
    pub(crate) id: ObserverId,
    pub(crate) observer: Observer,
}

impl PendingObserver {
    /// Invoke the observer; returns it back if it wants to keep observing.
    pub(crate) fn notify(mut self) -> Option<Self> {
        if (self.observer)() {
            Some(self)
        } else {
            None
        }
    }
}

/// Observers grouped by the node they watch.
///
/// Observers are taken out while they run so callbacks never execute under
/// the tree lock. `active` remembers which registrations have not been
/// cleaned up in the meantime, `running` which taken observers saw their node
/// change again before they were put back.
#[derive(Default)]
pub(crate) struct ObserverRegistry {
    by_node: HashMap<Id, Vec<(ObserverId, Observer)>>,
    active: HashSet<ObserverId>,
    running: HashMap<ObserverId, Running>,
}

struct Running {
    node: Id,
    missed: bool,
}

impl ObserverRegistry {
    pub(crate) fn add(&mut self, node: Id, observer: Observer) -> ObserverId {
        let id = ObserverId::new();
        self.by_node.entry(node).or_default().push((id, observer));
        self.active.insert(id);
        id
    }

    pub(crate) fn remove(&mut self, node: Id, id: ObserverId) {
        self.active.remove(&id);
        if let Some(observers) = self.by_node.get_mut(&node) {
            observers.retain(|(observer_id, _)| *observer_id != id);
            if observers.is_empty() {
                self.by_node.remove(&node);
            }
        }
    }

    /// Take all observers of the given nodes. Observers of these nodes that
    /// are still running are marked to be notified again.
    pub(crate) fn take(&mut self, nodes: impl IntoIterator<Item = Id>) -> Vec<PendingObserver> {
        let mut taken = Vec::new();
        for node in nodes {
            for running in self.running.values_mut().filter(|running| running.node == node) {
                running.missed = true;
            }
            if let Some(observers) = self.by_node.remove(&node) {
                for (id, observer) in observers {
                    self.running.insert(id, Running { node, missed: false });
                    taken.push(PendingObserver { node, id, observer });
                }
            }
        }
        taken
    }

    /// Put back an observer that asked to keep observing, unless it was
    /// removed while it was running.
    ///
    /// Returns the observer instead if its node changed while it was running,
    /// so the caller notifies it again.
    pub(crate) fn restore(&mut self, pending: PendingObserver) -> Option<PendingObserver> {
        let missed = self
            .running
            .remove(&pending.id)
            .is_some_and(|running| running.missed);
        if !self.active.contains(&pending.id) {
            return None;
        }
        if missed {
            self.running.insert(
                pending.id,
                Running {
                    node: pending.node,
                    missed: false,
                },
            );
            return Some(pending);
        }

        self.by_node
            .entry(pending.node)
            .or_default()
            .push((pending.id, pending.observer));
        None
    }

    /// Forget an observer that declined to observe further.
    pub(crate) fn retire(&mut self, id: ObserverId) {
        self.active.remove(&id);
        self.running.remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        self.active.len()
    }
}
