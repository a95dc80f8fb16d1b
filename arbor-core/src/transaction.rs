//! Transactions
//!
//! Groups signal writes so they are applied atomically.
//!
//! # Contexts
//!
//! Every thread has a stack of transaction contexts. Signal reads and writes
//! go through the innermost one:
//!
//! - Root: no transaction. Reads see the tree's submitted revision and
//!   writes are committed right away.
//! - Staged: writes are collected per tree. Reads see a view made of a base
//!   snapshot (taken when the tree is first touched) with the collected
//!   commands applied. When the body returns, the commands for each tree are
//!   committed as one transaction command.
//! - Write-through: writes are committed right away, like the root, and are
//!   also applied to the base of every enclosing staged transaction so its
//!   view stays current.
//!
//! A staged transaction validates what it read: the first tracked read of a
//! node adds a last-update condition, so the commit fails if the node was
//! changed by someone else in the meantime.
//!
//! # Trees
//!
//! Several synchronous trees can take part in one staged transaction and are
//! committed atomically. An asynchronous tree cannot be combined with any
//! other tree, since its commit outcome is only known later.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::error::{Result, SignalError};
use crate::id::Id;
use crate::operation::{OperationError, SignalOperation};
use crate::tree::{
    CommandResult, ResultHandler, SignalCommand, SignalTree, TreeCommit, TreeId, TreeRevision,
};

/// How a transaction applies its writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionType {
    /// Collect writes and commit them together at the end.
    #[default]
    Staged,

    /// Commit every write immediately.
    WriteThrough,
}

/// The return value of a transaction body together with the outcome of its
/// commit.
#[derive(Debug, Clone)]
pub struct TransactionOperation<R> {
    pub value: R,
    pub result: SignalOperation<()>,
}

impl<R> TransactionOperation<R> {
    pub fn value(&self) -> &R {
        &self.value
    }

    pub fn into_value(self) -> R {
        self.value
    }
}

/// Entry points for running code in a transaction context.
pub struct Transaction;

thread_local! {
    static STACK: RefCell<Vec<Rc<Context>>> = const { RefCell::new(Vec::new()) };
    static ROOT: Rc<Context> = Rc::new(Context::Root);
}

/// Pops the context pushed by [`push`] even if the body panics.
struct StackGuard;

impl Drop for StackGuard {
    fn drop(&mut self) {
        STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

fn push(context: Rc<Context>) -> StackGuard {
    STACK.with(|stack| stack.borrow_mut().push(context));
    StackGuard
}

fn current() -> Rc<Context> {
    STACK
        .with(|stack| stack.borrow().last().cloned())
        .unwrap_or_else(|| ROOT.with(Rc::clone))
}

impl Transaction {
    /// Run `body` in a staged transaction.
    pub fn run_in_transaction<R>(body: impl FnOnce() -> R) -> TransactionOperation<R> {
        Self::run_in_transaction_with(TransactionType::Staged, body)
    }

    /// Run `body` in a transaction of the given type.
    ///
    /// If `body` panics, staged writes are discarded and the panic continues.
    pub fn run_in_transaction_with<R>(
        kind: TransactionType,
        body: impl FnOnce() -> R,
    ) -> TransactionOperation<R> {
        let parent = current();
        let collector = ResultCollector::new();
        let context = Rc::new(match kind {
            TransactionType::Staged => Context::Staged(Staged::new(parent)),
            TransactionType::WriteThrough => Context::WriteThrough(WriteThrough {
                parent,
                collector: collector.clone(),
            }),
        });

        let value = {
            let _guard = push(context.clone());
            body()
        };

        if let Context::Staged(staged) = &*context {
            staged.commit(&collector);
        }
        collector.finish();

        TransactionOperation {
            value,
            result: collector.operation.clone(),
        }
    }

    /// Run `body` outside of any transaction: reads and writes go straight to
    /// the trees.
    pub fn run_without_transaction<R>(body: impl FnOnce() -> R) -> R {
        let _guard = push(ROOT.with(Rc::clone));
        body()
    }

    /// Whether the current thread is inside a transaction.
    pub fn in_transaction() -> bool {
        !matches!(*current(), Context::Root)
    }

    /// The type of the innermost transaction, if any.
    pub fn current_type() -> Option<TransactionType> {
        match *current() {
            Context::Root => None,
            Context::Staged(_) => Some(TransactionType::Staged),
            Context::WriteThrough(_) => Some(TransactionType::WriteThrough),
        }
    }

    /// The revision of `tree` as seen by the current transaction.
    pub(crate) fn read(tree: &Arc<SignalTree>) -> Result<TreeRevision> {
        current().read(tree)
    }

    /// Add a command to the current transaction.
    pub(crate) fn include(
        tree: &Arc<SignalTree>,
        command: SignalCommand,
        handler: Option<ResultHandler>,
    ) -> Result<()> {
        let id = command.command_id();
        current().include(tree, command, handler.map(|h| (id, h)).into_iter().collect())
    }

    /// Remember that `node` was read so a staged commit fails if it changed.
    pub(crate) fn record_read(tree: &Arc<SignalTree>, node: Id) -> Result<()> {
        match &*current() {
            Context::Staged(staged) => staged.record_read(tree, node),
            _ => Ok(()),
        }
    }
}

enum Context {
    Root,
    Staged(Staged),
    WriteThrough(WriteThrough),
}

impl Context {
    fn read(&self, tree: &Arc<SignalTree>) -> Result<TreeRevision> {
        match self {
            Context::Root => Ok(tree.submitted()),
            Context::Staged(staged) => staged.read(tree),
            Context::WriteThrough(write_through) => write_through.parent.read(tree),
        }
    }

    fn include(
        &self,
        tree: &Arc<SignalTree>,
        command: SignalCommand,
        mut handlers: Vec<(Id, ResultHandler)>,
    ) -> Result<()> {
        match self {
            Context::Root => {
                tree.commit(command, handlers);
                Ok(())
            }
            Context::Staged(staged) => staged.include(tree, command, handlers),
            Context::WriteThrough(write_through) => {
                handlers.push((command.command_id(), write_through.collector.expect()));
                tree.commit(command.clone(), handlers);
                write_through.parent.rebase(tree, &command);
                Ok(())
            }
        }
    }

    /// Commit the outcome of a finished staged transaction.
    fn commit_all(&self, commits: Vec<TreeCommit>) {
        match self {
            Context::Root => commit_to_trees(commits),
            Context::Staged(staged) => {
                for commit in commits {
                    if let Err(error) = staged.include(&commit.tree, commit.command, Vec::new()) {
                        tracing::warn!("rejecting nested transaction: {error}");
                        let result = CommandResult::fail(error.to_string());
                        for (_, handler) in commit.handlers {
                            handler(&result);
                        }
                        continue;
                    }
                    staged.add_handlers(&commit.tree, commit.handlers);
                }
            }
            Context::WriteThrough(write_through) => {
                let applied: Vec<(Arc<SignalTree>, SignalCommand)> = commits
                    .iter()
                    .map(|commit| (commit.tree.clone(), commit.command.clone()))
                    .collect();
                let commits = commits
                    .into_iter()
                    .map(|mut commit| {
                        let id = commit.command.command_id();
                        commit.handlers.push((id, write_through.collector.expect()));
                        commit
                    })
                    .collect();
                commit_to_trees(commits);

                for (tree, command) in applied {
                    write_through.parent.rebase(&tree, &command);
                }
            }
        }
    }

    /// Apply a command that was committed directly to every enclosing staged
    /// transaction's base.
    fn rebase(&self, tree: &Arc<SignalTree>, command: &SignalCommand) {
        match self {
            Context::Root => {}
            Context::Staged(staged) => {
                staged.rebase(tree, command);
                staged.parent.rebase(tree, command);
            }
            Context::WriteThrough(write_through) => write_through.parent.rebase(tree, command),
        }
    }
}

fn commit_to_trees(mut commits: Vec<TreeCommit>) {
    if commits.len() == 1 {
        if let Some(commit) = commits.pop() {
            commit.tree.commit(commit.command, commit.handlers);
        }
    } else if !commits.is_empty() {
        SignalTree::commit_all(commits);
    }
}

struct WriteThrough {
    parent: Rc<Context>,
    collector: Arc<ResultCollector>,
}

struct Staged {
    parent: Rc<Context>,
    trees: RefCell<IndexMap<TreeId, StagedTree>>,
}

struct StagedTree {
    tree: Arc<SignalTree>,
    base: TreeRevision,
    view: TreeRevision,
    commands: Vec<SignalCommand>,
    handlers: Vec<(Id, ResultHandler)>,
    read_nodes: HashSet<Id>,
    // Some staged command does not apply to the base, so the view is the base
    rejected: bool,
}

impl StagedTree {
    fn new(tree: Arc<SignalTree>, base: TreeRevision) -> Self {
        Self {
            tree,
            view: base.clone(),
            base,
            commands: Vec::new(),
            handlers: Vec::new(),
            read_nodes: HashSet::new(),
            rejected: false,
        }
    }

    /// Add a command and apply it to the current view. A failing command
    /// makes the whole view fall back to the base.
    fn stage(&mut self, command: SignalCommand) {
        if !self.rejected {
            let accepted = self
                .view
                .apply_in_place(&command)
                .get(&command.command_id())
                .is_some_and(CommandResult::is_accepted);
            if !accepted {
                self.rejected = true;
                self.view = self.base.clone();
            }
        }
        self.commands.push(command);
    }

    /// Rebuild the view as the base with all staged commands applied as one
    /// transaction. Needed after the base changed.
    fn refresh(&mut self) {
        self.rejected = false;
        if self.commands.is_empty() {
            self.view = self.base.clone();
            return;
        }

        let transaction = SignalCommand::transaction(self.commands.clone());
        let mut working = self.base.to_mutable();
        let accepted = working
            .apply(&transaction)
            .get(&transaction.command_id())
            .is_some_and(CommandResult::is_accepted);

        if accepted {
            self.view = working.into_revision();
        } else {
            self.rejected = true;
            self.view = self.base.clone();
        }
    }
}

impl Staged {
    fn new(parent: Rc<Context>) -> Self {
        Self {
            parent,
            trees: RefCell::new(IndexMap::new()),
        }
    }

    fn ensure(&self, tree: &Arc<SignalTree>) -> Result<()> {
        {
            let trees = self.trees.borrow();
            if trees.contains_key(&tree.id()) {
                return Ok(());
            }

            let mixes_asynchronous = !trees.is_empty()
                && (!tree.is_synchronous()
                    || trees.values().any(|staged| !staged.tree.is_synchronous()));
            if mixes_asynchronous {
                return Err(SignalError::illegal_state(
                    "an asynchronous tree cannot share a transaction with other trees",
                ));
            }
        }

        let base = self.parent.read(tree)?;
        self.trees
            .borrow_mut()
            .insert(tree.id(), StagedTree::new(tree.clone(), base));
        Ok(())
    }

    fn read(&self, tree: &Arc<SignalTree>) -> Result<TreeRevision> {
        self.ensure(tree)?;
        let trees = self.trees.borrow();
        trees
            .get(&tree.id())
            .map(|staged| staged.view.clone())
            .ok_or_else(|| SignalError::illegal_state("tree missing from transaction"))
    }

    fn include(
        &self,
        tree: &Arc<SignalTree>,
        command: SignalCommand,
        handlers: Vec<(Id, ResultHandler)>,
    ) -> Result<()> {
        self.ensure(tree)?;
        let mut trees = self.trees.borrow_mut();
        let staged = trees
            .get_mut(&tree.id())
            .ok_or_else(|| SignalError::illegal_state("tree missing from transaction"))?;

        staged.stage(command);
        staged.handlers.extend(handlers);
        Ok(())
    }

    fn add_handlers(&self, tree: &Arc<SignalTree>, handlers: Vec<(Id, ResultHandler)>) {
        if let Some(staged) = self.trees.borrow_mut().get_mut(&tree.id()) {
            staged.handlers.extend(handlers);
        }
    }

    fn record_read(&self, tree: &Arc<SignalTree>, node: Id) -> Result<()> {
        self.ensure(tree)?;
        let mut trees = self.trees.borrow_mut();
        let Some(staged) = trees.get_mut(&tree.id()) else {
            return Ok(());
        };

        let node = staged.view.resolve_alias(node);
        if !staged.read_nodes.insert(node) {
            return Ok(());
        }
        if let Some(data) = staged.view.data(node) {
            let condition = SignalCommand::LastUpdateCondition {
                command_id: Id::random(),
                target_node_id: node,
                expected_last_update: data.last_update,
            };
            staged.stage(condition);
        }
        Ok(())
    }

    fn rebase(&self, tree: &Arc<SignalTree>, command: &SignalCommand) {
        let mut trees = self.trees.borrow_mut();
        if let Some(staged) = trees.get_mut(&tree.id()) {
            let mut base = staged.base.to_mutable();
            let accepted = base
                .apply(command)
                .get(&command.command_id())
                .is_some_and(CommandResult::is_accepted);
            if accepted {
                staged.base = base.into_revision();
                staged.refresh();
            }
        }
    }

    fn commit(&self, collector: &Arc<ResultCollector>) {
        let trees = std::mem::take(&mut *self.trees.borrow_mut());

        let commits: Vec<TreeCommit> = trees
            .into_values()
            .filter(|staged| !staged.commands.is_empty())
            .map(|staged| {
                let command = SignalCommand::transaction(staged.commands);
                let mut handlers = staged.handlers;
                handlers.push((command.command_id(), collector.expect()));
                TreeCommit {
                    tree: staged.tree,
                    command,
                    handlers,
                }
            })
            .collect();

        tracing::debug!(trees = commits.len(), "committing staged transaction");
        self.parent.commit_all(commits);
    }
}

/// Resolves a transaction's operation once every expected result arrived.
struct ResultCollector {
    operation: SignalOperation<()>,
    progress: Mutex<Progress>,
}

#[derive(Default)]
struct Progress {
    expected: usize,
    received: usize,
    failure: Option<String>,
    finished: bool,
}

impl Progress {
    fn is_complete(&self) -> bool {
        self.finished && self.received == self.expected
    }
}

impl ResultCollector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            operation: SignalOperation::pending(),
            progress: Mutex::new(Progress::default()),
        })
    }

    /// Register one more expected result.
    fn expect(self: &Arc<Self>) -> ResultHandler {
        self.progress.lock().expected += 1;
        let collector = self.clone();
        Box::new(move |result| collector.receive(result))
    }

    fn receive(&self, result: &CommandResult) {
        let complete = {
            let mut progress = self.progress.lock();
            progress.received += 1;
            if let Some(reason) = result.reject_reason() {
                progress.failure.get_or_insert_with(|| reason.to_owned());
            }
            progress.is_complete().then(|| progress.failure.clone())
        };
        if let Some(failure) = complete {
            self.resolve(failure);
        }
    }

    /// No more results will be registered.
    fn finish(&self) {
        let complete = {
            let mut progress = self.progress.lock();
            progress.finished = true;
            progress.is_complete().then(|| progress.failure.clone())
        };
        if let Some(failure) = complete {
            self.resolve(failure);
        }
    }

    fn resolve(&self, failure: Option<String>) {
        let result = match failure {
            None => Ok(()),
            Some(reason) => Err(OperationError::Rejected(reason)),
        };
        self.operation.complete(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn set_root(value: Value) -> SignalCommand {
        SignalCommand::Set {
            command_id: Id::random(),
            target_node_id: Id::ZERO,
            value,
        }
    }

    fn expect_root(value: Value) -> SignalCommand {
        SignalCommand::ValueCondition {
            command_id: Id::random(),
            target_node_id: Id::ZERO,
            expected_value: value,
        }
    }

    fn transaction_root(tree: &Arc<SignalTree>) -> Value {
        Transaction::read(tree)
            .unwrap()
            .data(Id::ZERO)
            .unwrap()
            .value
            .clone()
    }

    fn confirmed_root(tree: &Arc<SignalTree>) -> Value {
        tree.confirmed().data(Id::ZERO).unwrap().value.clone()
    }

    fn submitted_root(tree: &Arc<SignalTree>) -> Value {
        tree.submitted().data(Id::ZERO).unwrap().value.clone()
    }

    #[test]
    fn result_collector_waits_for_all_results() {
        let collector = ResultCollector::new();
        let first = collector.expect();
        let second = collector.expect();
        collector.finish();

        first(&CommandResult::ok());
        assert!(!collector.operation.is_done());

        second(&CommandResult::fail("nope"));
        assert_eq!(
            collector.operation.result(),
            Some(Err(OperationError::Rejected("nope".to_string())))
        );
    }

    #[test]
    fn failing_command_reverts_staged_view() {
        let tree = SignalTree::synchronous();

        Transaction::run_in_transaction(|| {
            Transaction::include(&tree, set_root(json!("value")), None).unwrap();
            assert_eq!(transaction_root(&tree), json!("value"));

            Transaction::include(&tree, expect_root(json!("other")), None).unwrap();
            assert_eq!(transaction_root(&tree), Value::Null);
        });
    }

    #[test]
    fn staged_commands_update_the_view_in_place() {
        let tree = SignalTree::synchronous();
        let mut staged = StagedTree::new(tree.clone(), tree.submitted());

        staged.stage(set_root(json!(1)));
        let storage: *const _ = staged.view.nodes();
        staged.stage(set_root(json!(2)));
        assert!(std::ptr::eq(storage, staged.view.nodes()));
        assert_eq!(staged.view.data(Id::ZERO).unwrap().value, json!(2));
        assert_eq!(tree.submitted().data(Id::ZERO).unwrap().value, Value::Null);
    }

    #[test]
    fn rejected_stage_waits_for_a_new_base() {
        let tree = SignalTree::synchronous();
        let mut staged = StagedTree::new(tree.clone(), tree.submitted());

        staged.stage(expect_root(json!("other")));
        staged.stage(set_root(json!(3)));
        assert!(staged.view.ptr_eq(&staged.base));

        let mut base = staged.base.to_mutable();
        base.apply(&set_root(json!("other")));
        staged.base = base.into_revision();
        staged.refresh();

        assert!(!staged.rejected);
        assert_eq!(staged.view.data(Id::ZERO).unwrap().value, json!(3));
    }

    #[test]
    fn staged_writes_are_invisible_until_commit() {
        let tree = SignalTree::synchronous();

        let operation = Transaction::run_in_transaction(|| {
            Transaction::include(&tree, set_root(json!("staged")), None).unwrap();
            assert_eq!(confirmed_root(&tree), Value::Null);
            assert!(Transaction::in_transaction());
        });

        assert!(operation.result.is_success());
        assert_eq!(confirmed_root(&tree), json!("staged"));
        assert!(!Transaction::in_transaction());
    }

    #[test]
    fn two_synchronous_trees_commit_atomically() {
        let t1 = SignalTree::synchronous();
        let t2 = SignalTree::synchronous();

        let operation = Transaction::run_in_transaction(|| {
            Transaction::include(&t1, set_root(json!(1)), None).unwrap();
            Transaction::include(&t2, expect_root(json!("missing")), None).unwrap();
        });

        assert!(!operation.result.is_success());
        assert_eq!(confirmed_root(&t1), Value::Null);

        let operation = Transaction::run_in_transaction(|| {
            Transaction::include(&t1, set_root(json!(1)), None).unwrap();
            Transaction::include(&t2, set_root(json!(2)), None).unwrap();
        });
        assert!(operation.result.is_success());
        assert_eq!(confirmed_root(&t1), json!(1));
        assert_eq!(confirmed_root(&t2), json!(2));
    }

    #[test]
    fn asynchronous_transaction_is_decided_by_confirmation() {
        let tree = SignalTree::asynchronous(|_: Vec<SignalCommand>| {});

        let operation = Transaction::run_in_transaction(|| {
            Transaction::include(&tree, expect_root(json!("expected")), None).unwrap();
            Transaction::include(&tree, set_root(json!("update")), None).unwrap();
        });

        assert_eq!(submitted_root(&tree), Value::Null);
        assert!(!operation.result.is_done());

        tree.confirm(vec![set_root(json!("expected"))]).unwrap();
        assert_eq!(submitted_root(&tree), json!("update"));

        tree.confirm_submitted().unwrap();
        assert!(operation.result.is_success());
    }

    #[test]
    fn nested_staged_transaction_commits_into_outer() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let s = sent.clone();
        let tree = SignalTree::asynchronous(move |commands: Vec<SignalCommand>| {
            s.lock().extend(commands);
        });
        let command = set_root(json!("inner"));

        Transaction::run_in_transaction(|| {
            Transaction::run_in_transaction(|| {
                Transaction::include(&tree, command.clone(), None).unwrap();
            });
            assert!(sent.lock().is_empty());
            assert_eq!(transaction_root(&tree), json!("inner"));
        });

        let sent = sent.lock();
        assert_eq!(sent.len(), 1);
        let SignalCommand::Transaction { commands: outer, .. } = &sent[0] else {
            panic!("expected a transaction");
        };
        assert_eq!(outer.len(), 1);
        let SignalCommand::Transaction { commands: inner, .. } = &outer[0] else {
            panic!("expected a nested transaction");
        };
        assert_eq!(inner, &vec![command]);
    }

    #[test]
    fn write_through_inside_staged_is_applied_immediately() {
        let tree = SignalTree::synchronous();

        let operation = Transaction::run_in_transaction(|| {
            Transaction::include(&tree, expect_root(json!("expected")), None).unwrap();
            Transaction::include(&tree, set_root(json!("update")), None).unwrap();
            assert_eq!(transaction_root(&tree), Value::Null);

            Transaction::run_in_transaction_with(TransactionType::WriteThrough, || {
                Transaction::include(&tree, set_root(json!("expected")), None).unwrap();
            });

            assert_eq!(confirmed_root(&tree), json!("expected"));
            assert_eq!(transaction_root(&tree), json!("update"));
        });

        assert!(operation.result.is_success());
        assert_eq!(confirmed_root(&tree), json!("update"));
    }

    #[test]
    fn direct_write_during_transaction_ruins_it() {
        let tree = SignalTree::synchronous();

        let operation = Transaction::run_in_transaction(|| {
            Transaction::include(&tree, expect_root(Value::Null), None).unwrap();
            Transaction::include(&tree, set_root(json!("update")), None).unwrap();

            tree.commit_single_command(set_root(json!("unexpected")), None);
            assert_eq!(transaction_root(&tree), json!("update"));
        });

        assert!(!operation.result.is_success());
        assert_eq!(confirmed_root(&tree), json!("unexpected"));
    }

    #[test]
    fn tree_without_changes_resolves() {
        let t1 = SignalTree::synchronous();
        let t2 = SignalTree::synchronous();

        let operation = Transaction::run_in_transaction(|| {
            transaction_root(&t1);
            Transaction::include(&t2, set_root(json!(1)), None).unwrap();
        });
        assert!(operation.result.is_success());

        let empty = Transaction::run_in_transaction(|| ());
        assert!(empty.result.is_success());
    }

    #[test]
    fn asynchronous_tree_cannot_be_mixed() {
        let a1 = SignalTree::asynchronous(|_: Vec<SignalCommand>| {});
        let a2 = SignalTree::asynchronous(|_: Vec<SignalCommand>| {});
        let sync = SignalTree::synchronous();

        Transaction::run_in_transaction(|| {
            Transaction::read(&a1).unwrap();
            assert!(Transaction::read(&a2).unwrap_err().is_illegal_state());
            assert!(Transaction::read(&sync).unwrap_err().is_illegal_state());
        });

        Transaction::run_in_transaction(|| {
            Transaction::read(&sync).unwrap();
            assert!(Transaction::read(&a1).unwrap_err().is_illegal_state());
        });
    }

    #[test]
    fn observer_writes_bypass_transaction() {
        let tree = SignalTree::synchronous();
        let seen = Arc::new(Mutex::new(Value::Null));

        let t = tree.clone();
        let s = seen.clone();
        let _cleanup = tree.observe_next_change(Id::ZERO, move || {
            Transaction::include(&t, set_root(json!("observer")), None).unwrap();
            *s.lock() = transaction_root(&t);
            false
        });

        Transaction::run_in_transaction(|| {
            Transaction::include(&tree, set_root(json!("tx")), None).unwrap();
        });

        assert_eq!(*seen.lock(), json!("observer"));
        assert_eq!(confirmed_root(&tree), json!("observer"));
    }

    #[test]
    fn panicking_body_discards_staged_writes() {
        let tree = SignalTree::synchronous();
        let t = tree.clone();

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            Transaction::run_in_transaction(|| {
                Transaction::include(&t, set_root(json!(1)), None).unwrap();
                panic!("body failed");
            })
        }));

        assert!(outcome.is_err());
        assert!(!Transaction::in_transaction());
        assert_eq!(confirmed_root(&tree), Value::Null);
    }

    #[test]
    fn tracked_reads_are_validated_at_commit() {
        let tree = SignalTree::synchronous();

        let operation = Transaction::run_in_transaction(|| {
            Transaction::record_read(&tree, Id::ZERO).unwrap();
            tree.commit_single_command(set_root(json!("concurrent")), None);
            Transaction::include(&tree, SignalCommand::Insert {
                command_id: Id::random(),
                target_node_id: Id::ZERO,
                scope_owner: None,
                value: Value::Null,
                position: crate::tree::ListPosition::last(),
            }, None)
            .unwrap();
        });

        assert_eq!(
            operation.result.result(),
            Some(Err(OperationError::Rejected("Unexpected last update".to_string())))
        );
    }
}
