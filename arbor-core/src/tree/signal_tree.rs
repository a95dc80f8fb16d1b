//! Signal Trees
//!
//! A [`SignalTree`] owns the node state behind a family of signals and is the
//! only place where commands are applied.
//!
//! # Revisions
//!
//! Every tree keeps two revisions:
//!
//! - `confirmed`: the state the authority has agreed on.
//! - `submitted`: `confirmed` plus every command that was committed locally
//!   but not yet confirmed. Reads go here, so local writes are visible
//!   immediately.
//!
//! A synchronous tree is its own authority: commits are applied to
//! `confirmed` right away and both revisions are always the same.
//!
//! An asynchronous tree applies commits optimistically to `submitted` and
//! hands them to a [`CommandSubmitter`]. The authority later calls
//! [`SignalTree::confirm`] with the commands in their final order; the tree
//! applies them to `confirmed`, resolves the result handlers and rebuilds
//! `submitted` from the remaining unconfirmed commands.
//!
//! # Callbacks
//!
//! Result handlers, processed-command subscribers and change observers never
//! run while the tree lock is held, so they are free to read from and write to
//! the tree again.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{Result, SignalError};
use crate::id::Id;
use crate::transaction::Transaction;

use super::command::SignalCommand;
use super::observer::{Observer, ObserverId, ObserverRegistry, PendingObserver};
use super::revision::{CommandResult, CommandResults, MutableTreeRevision, TreeRevision};

/// Receives the result of a committed command.
pub type ResultHandler = Box<dyn FnOnce(&CommandResult) + Send>;

/// Undoes a registration when called.
pub type CleanupCallback = Box<dyn FnOnce() + Send>;

/// Notified of every command applied to the confirmed revision.
pub type ProcessedCallback = Arc<dyn Fn(&SignalCommand, &CommandResults) + Send + Sync>;

/// Sends locally committed commands of an asynchronous tree to the
/// authority.
pub trait CommandSubmitter: Send + Sync {
    fn submit(&self, commands: Vec<SignalCommand>);
}

impl<F> CommandSubmitter for F
where
    F: Fn(Vec<SignalCommand>) + Send + Sync,
{
    fn submit(&self, commands: Vec<SignalCommand>) {
        self(commands)
    }
}

/// Process-unique tree identifier. Also defines the lock order for commits
/// that span several trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TreeId(u64);

impl TreeId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tree#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeKind {
    Synchronous,
    Asynchronous,
}

/// A command with its result handlers, as committed together with commands
/// for other trees.
pub(crate) struct TreeCommit {
    pub(crate) tree: Arc<SignalTree>,
    pub(crate) command: SignalCommand,
    pub(crate) handlers: Vec<(Id, ResultHandler)>,
}

struct TreeState {
    confirmed: TreeRevision,
    submitted: TreeRevision,
    unconfirmed: Vec<SignalCommand>,
    pending: HashMap<Id, ResultHandler>,
    observers: ObserverRegistry,
    processed: Vec<(ObserverId, ProcessedCallback)>,
}

/// Callbacks collected under the lock and run after it is released.
#[derive(Default)]
struct Notifications {
    processed: Vec<ProcessedCallback>,
    events: Vec<(SignalCommand, CommandResults)>,
    handlers: Vec<(ResultHandler, CommandResult)>,
    observers: Vec<PendingObserver>,
}

impl TreeState {
    fn new() -> Self {
        let root = TreeRevision::empty();
        Self {
            confirmed: root.clone(),
            submitted: root,
            unconfirmed: Vec::new(),
            pending: HashMap::new(),
            observers: ObserverRegistry::default(),
            processed: Vec::new(),
        }
    }

    /// Store the outcome of a synchronous commit.
    fn finish_commit(
        &mut self,
        revision: Option<MutableTreeRevision>,
        command: SignalCommand,
        results: CommandResults,
        handlers: Vec<(Id, ResultHandler)>,
        out: &mut Notifications,
    ) {
        if let Some(revision) = revision {
            self.confirmed = revision.into_revision();
            self.submitted = self.confirmed.clone();
            if let Some(result) = results.get(&command.command_id()) {
                out.observers.extend(self.observers.take(result.updated_ids()));
            }
        }

        for (id, handler) in handlers {
            let result = results
                .get(&id)
                .cloned()
                .unwrap_or_else(|| CommandResult::fail("No result for command"));
            out.handlers.push((handler, result));
        }

        out.processed = self.processed.iter().map(|(_, cb)| cb.clone()).collect();
        out.events.push((command, results));
    }
}

/// Shared node state behind a set of signals.
pub struct SignalTree {
    id: TreeId,
    kind: TreeKind,
    state: Mutex<TreeState>,
    submitter: Option<Arc<dyn CommandSubmitter>>,
}

impl SignalTree {
    /// Create a tree that applies commits immediately.
    pub fn synchronous() -> Arc<Self> {
        Arc::new(Self {
            id: TreeId::new(),
            kind: TreeKind::Synchronous,
            state: Mutex::new(TreeState::new()),
            submitter: None,
        })
    }

    /// Create a tree whose commits are confirmed by an external authority.
    pub fn asynchronous(submitter: impl CommandSubmitter + 'static) -> Arc<Self> {
        Arc::new(Self {
            id: TreeId::new(),
            kind: TreeKind::Asynchronous,
            state: Mutex::new(TreeState::new()),
            submitter: Some(Arc::new(submitter)),
        })
    }

    pub fn id(&self) -> TreeId {
        self.id
    }

    pub fn kind(&self) -> TreeKind {
        self.kind
    }

    pub fn is_synchronous(&self) -> bool {
        self.kind == TreeKind::Synchronous
    }

    /// The revision agreed on by the authority.
    pub fn confirmed(&self) -> TreeRevision {
        self.state.lock().confirmed.clone()
    }

    /// The confirmed revision plus all pending local commands.
    pub fn submitted(&self) -> TreeRevision {
        self.state.lock().submitted.clone()
    }

    /// Commands committed locally but not yet confirmed.
    pub fn unconfirmed_commands(&self) -> Vec<SignalCommand> {
        self.state.lock().unconfirmed.clone()
    }

    /// Commit one command, optionally with a handler for its result.
    pub fn commit_single_command(&self, command: SignalCommand, handler: Option<ResultHandler>) {
        let id = command.command_id();
        self.commit(command, handler.map(|h| (id, h)).into_iter().collect());
    }

    /// Commit a command with result handlers for the command itself or any of
    /// its sub-commands.
    pub fn commit(&self, command: SignalCommand, handlers: Vec<(Id, ResultHandler)>) {
        let mut notifications = Notifications::default();

        match self.kind {
            TreeKind::Synchronous => {
                let mut state = self.state.lock();
                let mut revision = state.confirmed.to_mutable();
                let results = revision.apply(&command);
                let accepted = results
                    .get(&command.command_id())
                    .is_some_and(CommandResult::is_accepted);
                tracing::debug!(
                    tree = %self.id,
                    command = %command.command_id(),
                    accepted,
                    "committed command"
                );

                state.finish_commit(
                    accepted.then_some(revision),
                    command,
                    results,
                    handlers,
                    &mut notifications,
                );
            }
            TreeKind::Asynchronous => {
                {
                    let mut state = self.state.lock();
                    let mut revision = state.submitted.to_mutable();
                    let results = revision.apply(&command);

                    // A local rejection is not final, the authority decides
                    if let Some(result) = results
                        .get(&command.command_id())
                        .filter(|result| result.is_accepted())
                    {
                        state.submitted = revision.into_revision();
                        notifications
                            .observers
                            .extend(state.observers.take(result.updated_ids()));
                    }

                    state.unconfirmed.push(command.clone());
                    state.pending.extend(handlers);
                }
                tracing::debug!(tree = %self.id, command = %command.command_id(), "submitted command");

                if let Some(submitter) = &self.submitter {
                    submitter.submit(vec![command]);
                }
            }
        }

        self.deliver(notifications);
    }

    /// Commit one command per tree atomically. All trees must be
    /// synchronous; if any command is rejected, nothing is applied and every
    /// handler receives the first rejection.
    pub(crate) fn commit_all(mut commits: Vec<TreeCommit>) {
        commits.sort_by_key(|commit| commit.tree.id);

        let trees: Vec<Arc<SignalTree>> = commits.iter().map(|commit| commit.tree.clone()).collect();
        let mut guards: Vec<_> = trees.iter().map(|tree| tree.state.lock()).collect();

        let mut prepared = Vec::with_capacity(commits.len());
        for (commit, state) in commits.iter().zip(&guards) {
            let mut revision = state.confirmed.to_mutable();
            let results = revision.apply(&commit.command);
            prepared.push((revision, results));
        }

        let failure = commits
            .iter()
            .zip(&prepared)
            .find_map(|(commit, (_, results))| {
                results
                    .get(&commit.command.command_id())
                    .and_then(CommandResult::reject_reason)
                    .map(str::to_owned)
            });
        tracing::debug!(
            trees = commits.len(),
            accepted = failure.is_none(),
            "committed multi-tree transaction"
        );

        let mut notifications: Vec<Notifications> = Vec::with_capacity(commits.len());
        for ((commit, (revision, mut results)), state) in
            commits.into_iter().zip(prepared).zip(guards.iter_mut())
        {
            let revision = match &failure {
                Some(reason) => {
                    for result in results.values_mut() {
                        if result.is_accepted() {
                            *result = CommandResult::fail(reason.clone());
                        }
                    }
                    None
                }
                None => Some(revision),
            };

            let mut out = Notifications::default();
            state.finish_commit(revision, commit.command, results, commit.handlers, &mut out);
            notifications.push(out);
        }
        drop(guards);

        for (tree, out) in trees.iter().zip(notifications) {
            tree.deliver(out);
        }
    }

    /// Apply commands confirmed by the authority.
    ///
    /// Pending handlers of matching local commands are resolved with the
    /// authoritative result and `submitted` is rebuilt from the commands that
    /// are still unconfirmed.
    pub fn confirm(&self, commands: Vec<SignalCommand>) -> Result<()> {
        if self.is_synchronous() {
            return Err(SignalError::illegal_state(
                "a synchronous tree has nothing to confirm",
            ));
        }

        let mut notifications = Notifications::default();
        {
            let mut state = self.state.lock();
            let previous = state.submitted.clone();

            let mut confirmed = state.confirmed.to_mutable();
            for command in &commands {
                let results = confirmed.apply(command);
                for (id, result) in &results {
                    if let Some(handler) = state.pending.remove(id) {
                        notifications.handlers.push((handler, result.clone()));
                    }
                }
                notifications.events.push((command.clone(), results));
            }

            let confirmed_ids: HashSet<Id> = commands.iter().map(SignalCommand::command_id).collect();
            state
                .unconfirmed
                .retain(|command| !confirmed_ids.contains(&command.command_id()));
            state.confirmed = confirmed.into_revision();

            let mut submitted = state.confirmed.to_mutable();
            submitted.apply_all(&state.unconfirmed);
            state.submitted = submitted.into_revision();

            let changed = previous.changed_ids(&state.submitted);
            notifications.observers = state.observers.take(changed);
            notifications.processed = state.processed.iter().map(|(_, cb)| cb.clone()).collect();

            tracing::debug!(
                tree = %self.id,
                confirmed = commands.len(),
                remaining = state.unconfirmed.len(),
                "confirmed commands"
            );
        }

        self.deliver(notifications);
        Ok(())
    }

    /// Confirm every unconfirmed command in commit order, as if the
    /// authority accepted the local order unchanged.
    pub fn confirm_submitted(&self) -> Result<()> {
        let commands = self.unconfirmed_commands();
        self.confirm(commands)
    }

    /// Call `observer` the next time `node` changes.
    ///
    /// Aliases are resolved at registration. The observer stays registered for
    /// one more change each time it returns `true`.
    pub fn observe_next_change(
        self: &Arc<Self>,
        node: Id,
        observer: impl FnMut() -> bool + Send + 'static,
    ) -> CleanupCallback {
        let (node, id) = {
            let mut state = self.state.lock();
            let node = state.submitted.resolve_alias(node);
            let observer: Observer = Box::new(observer);
            (node, state.observers.add(node, observer))
        };

        let tree: Weak<SignalTree> = Arc::downgrade(self);
        Box::new(move || {
            if let Some(tree) = tree.upgrade() {
                tree.state.lock().observers.remove(node, id);
            }
        })
    }

    /// Call `callback` with every command applied to the confirmed revision.
    pub fn subscribe_to_processed(
        self: &Arc<Self>,
        callback: impl Fn(&SignalCommand, &CommandResults) + Send + Sync + 'static,
    ) -> CleanupCallback {
        let id = ObserverId::new();
        self.state.lock().processed.push((id, Arc::new(callback)));

        let tree: Weak<SignalTree> = Arc::downgrade(self);
        Box::new(move || {
            if let Some(tree) = tree.upgrade() {
                tree.state.lock().processed.retain(|(other, _)| *other != id);
            }
        })
    }

    fn deliver(&self, notifications: Notifications) {
        let Notifications {
            processed,
            events,
            handlers,
            observers,
        } = notifications;

        for callback in &processed {
            for (command, results) in &events {
                callback(command, results);
            }
        }

        for (handler, result) in handlers {
            handler(&result);
        }

        let mut queue: VecDeque<PendingObserver> = observers.into();
        while let Some(pending) = queue.pop_front() {
            let id = pending.id;
            tracing::trace!(tree = %self.id, node = %pending.node, "notifying observer");

            // Observers react to committed state, not to the caller's transaction
            let kept = Transaction::run_without_transaction(|| pending.notify());
            let mut state = self.state.lock();
            match kept {
                Some(pending) => queue.extend(state.observers.restore(pending)),
                None => state.observers.retire(id),
            }
        }
    }
}

impl fmt::Debug for SignalTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalTree")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
