//! Usages
//!
//! A [`Usage`] is what a tracked computation depends on. It can tell whether
//! any of its dependencies changed since it was recorded and can notify a
//! listener about the next change.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;

use crate::id::Id;
use crate::transaction::Transaction;
use crate::tree::{CleanupCallback, Data, SignalTree, TreeId, TreeRevision};

/// Called when a usage changes.
///
/// The argument is `true` when the change had already happened at
/// registration time. Returns whether to keep listening.
pub type TransientListener = Arc<dyn Fn(bool) -> bool + Send + Sync>;

/// A node in a specific tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeKey {
    pub tree: TreeId,
    pub id: Id,
}

/// The dependencies recorded by one tracked computation.
pub trait Usage: Send + Sync {
    /// Whether anything changed since the usage was recorded.
    fn has_changes(&self) -> bool;

    /// Invoke `listener` on the next change, or right away if a change
    /// already happened.
    fn on_next_change(&self, listener: TransientListener) -> CleanupCallback;

    /// The nodes this usage depends on.
    fn dependencies(&self) -> Vec<NodeKey> {
        Vec::new()
    }
}

/// A usage without dependencies. It never changes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoUsage;

impl Usage for NoUsage {
    fn has_changes(&self) -> bool {
        false
    }

    fn on_next_change(&self, _listener: TransientListener) -> CleanupCallback {
        Box::new(|| {})
    }
}

/// The part of a node a signal reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageKind {
    Value,
    ListChildren,
    MapChildren,
    LastUpdate,
}

#[derive(Debug, Clone, PartialEq)]
enum Snapshot {
    Value(Value),
    ListChildren(Vec<Id>),
    MapChildren(IndexMap<String, Id>),
    LastUpdate(Id),
}

impl UsageKind {
    fn capture(self, data: &Data) -> Snapshot {
        match self {
            UsageKind::Value => Snapshot::Value(data.value.clone()),
            UsageKind::ListChildren => Snapshot::ListChildren(data.list_children.clone()),
            UsageKind::MapChildren => Snapshot::MapChildren(data.map_children.clone()),
            UsageKind::LastUpdate => Snapshot::LastUpdate(data.last_update),
        }
    }
}

/// Dependency on one part of one node.
pub(crate) struct SignalUsage {
    tree: Arc<SignalTree>,
    id: Id,
    kind: UsageKind,
    original: Snapshot,
}

impl SignalUsage {
    /// Record the current state of `id` in `revision`. Returns [`NoUsage`] if
    /// the node does not exist.
    pub(crate) fn capture(
        tree: &Arc<SignalTree>,
        revision: &TreeRevision,
        id: Id,
        kind: UsageKind,
    ) -> Arc<dyn Usage> {
        let id = revision.resolve_alias(id);
        match revision.data(id) {
            Some(data) => Arc::new(SignalUsage {
                tree: tree.clone(),
                id,
                kind,
                original: kind.capture(data),
            }),
            None => Arc::new(NoUsage),
        }
    }
}

fn current_snapshot(tree: &Arc<SignalTree>, id: Id, kind: UsageKind) -> Option<Snapshot> {
    let revision = Transaction::read(tree).unwrap_or_else(|_| tree.submitted());
    revision.data(id).map(|data| kind.capture(data))
}

impl Usage for SignalUsage {
    fn has_changes(&self) -> bool {
        current_snapshot(&self.tree, self.id, self.kind)
            .is_some_and(|current| current != self.original)
    }

    fn on_next_change(&self, listener: TransientListener) -> CleanupCallback {
        let closed = Arc::new(AtomicBool::new(false));
        let tree: Weak<SignalTree> = Arc::downgrade(&self.tree);
        let (id, kind) = (self.id, self.kind);
        let mut last = self.original.clone();

        let observer_closed = closed.clone();
        let observer_listener = listener.clone();
        let cleanup = self.tree.observe_next_change(id, move || {
            if observer_closed.load(Ordering::SeqCst) {
                return false;
            }
            let Some(tree) = tree.upgrade() else {
                return false;
            };

            // A removed node never changes again
            let Some(current) = current_snapshot(&tree, id, kind) else {
                return false;
            };
            if current == last {
                return true;
            }
            last = current;

            let keep = observer_listener(false);
            if !keep {
                observer_closed.store(true, Ordering::SeqCst);
            }
            keep
        });

        if self.has_changes() && !closed.swap(true, Ordering::SeqCst) {
            if listener(true) {
                closed.store(false, Ordering::SeqCst);
            } else {
                cleanup();
                return Box::new(|| {});
            }
        }
        cleanup
    }

    fn dependencies(&self) -> Vec<NodeKey> {
        vec![NodeKey {
            tree: self.tree.id(),
            id: self.id,
        }]
    }
}

/// Several usages observed as one.
pub(crate) struct CombinedUsage {
    usages: Vec<Arc<dyn Usage>>,
}

impl CombinedUsage {
    pub(crate) fn new(usages: Vec<Arc<dyn Usage>>) -> Self {
        Self { usages }
    }
}

impl Usage for CombinedUsage {
    fn has_changes(&self) -> bool {
        self.usages.iter().any(|usage| usage.has_changes())
    }

    fn on_next_change(&self, listener: TransientListener) -> CleanupCallback {
        let closed = Arc::new(AtomicBool::new(false));
        let cleanups: Arc<Mutex<Vec<CleanupCallback>>> = Arc::new(Mutex::new(Vec::new()));

        let shared: TransientListener = {
            let closed = closed.clone();
            let cleanups = cleanups.clone();
            Arc::new(move |immediate| {
                if closed.load(Ordering::SeqCst) {
                    return false;
                }
                if listener(immediate) {
                    return true;
                }
                closed.store(true, Ordering::SeqCst);
                let registered = std::mem::take(&mut *cleanups.lock());
                for cleanup in registered {
                    cleanup();
                }
                false
            })
        };

        for usage in &self.usages {
            if closed.load(Ordering::SeqCst) {
                break;
            }
            let cleanup = usage.on_next_change(shared.clone());
            if closed.load(Ordering::SeqCst) {
                cleanup();
            } else {
                cleanups.lock().push(cleanup);
            }
        }

        Box::new(move || {
            closed.store(true, Ordering::SeqCst);
            let registered = std::mem::take(&mut *cleanups.lock());
            for cleanup in registered {
                cleanup();
            }
        })
    }

    fn dependencies(&self) -> Vec<NodeKey> {
        self.usages
            .iter()
            .flat_map(|usage| usage.dependencies())
            .collect()
    }
}
