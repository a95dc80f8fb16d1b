//! Signals
//!
//! Typed handles onto nodes of a [`SignalTree`]. A signal is only an address
//! (tree, node id and an optional validator), so handles are cheap to clone
//! and two handles to the same node compare equal no matter how they were
//! obtained.
//!
//! # Reading
//!
//! - [`Signal::value`] reads through the current transaction and records a
//!   dependency for effects and computed values.
//! - [`Signal::peek`] reads the same state without recording anything.
//! - [`Signal::peek_confirmed`] reads the tree's confirmed revision.
//!
//! # Writing
//!
//! Every write builds a [`SignalCommand`], checks it against the signal's
//! validator and hands it to the current transaction. The returned operation
//! resolves once the tree has accepted or rejected the command.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Result, SignalError};
use crate::id::Id;
use crate::operation::{CancelableOperation, OperationError, OperationResult, SignalOperation};
use crate::reactive::{check_write, Computed, NodeKey, SignalUsage, UsageKind, UsageTracker};
use crate::transaction::Transaction;
use crate::tree::manipulator::UNEXPECTED_VALUE;
use crate::tree::{CommandResult, NodeModification, ResultHandler, SignalCommand, SignalTree, TreeRevision};

/// Equality and hashing by tree, node id and validator.
macro_rules! signal_identity {
    ($signal:ident $(<$param:ident>)?) => {
        impl$(<$param>)? PartialEq for $signal$(<$param>)? {
            fn eq(&self, other: &Self) -> bool {
                self.core == other.core
            }
        }

        impl$(<$param>)? Eq for $signal$(<$param>)? {}

        impl$(<$param>)? std::hash::Hash for $signal$(<$param>)? {
            fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
                std::hash::Hash::hash(&self.core, state);
            }
        }
    };
}

mod list;
mod map;
mod node;
mod number;
mod reference;
mod value;

pub use list::ListSignal;
pub use map::MapSignal;
pub use node::{NodeSignal, NodeSignalState};
pub use number::NumberSignal;
pub use reference::ReferenceSignal;
pub use value::ValueSignal;

/// Types that can be stored in a signal.
pub trait SignalValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> SignalValue for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Decides whether a signal may submit a command.
pub type Validator = Arc<dyn Fn(&SignalCommand) -> bool + Send + Sync>;

/// The address shared by all typed signals: a tree, a node and the validator
/// that guards writes through this handle.
#[derive(Clone)]
pub struct SignalCore {
    tree: Arc<SignalTree>,
    id: Id,
    validator: Option<Validator>,
}

impl SignalCore {
    pub fn new(tree: Arc<SignalTree>, id: Id) -> Self {
        Self {
            tree,
            id,
            validator: None,
        }
    }

    pub fn tree(&self) -> &Arc<SignalTree> {
        &self.tree
    }

    pub fn id(&self) -> Id {
        self.id
    }

    /// A handle for another node of the same tree, guarded by the same
    /// validator.
    pub(crate) fn child(&self, id: Id) -> Self {
        Self {
            tree: self.tree.clone(),
            id,
            validator: self.validator.clone(),
        }
    }

    /// Both the existing and the new validator must accept a command.
    pub(crate) fn with_validator(&self, validator: Validator) -> Self {
        let validator: Validator = match &self.validator {
            None => validator,
            Some(existing) => {
                let existing = existing.clone();
                Arc::new(move |command: &SignalCommand| existing(command) && validator(command))
            }
        };
        Self {
            tree: self.tree.clone(),
            id: self.id,
            validator: Some(validator),
        }
    }

    pub(crate) fn readonly(&self) -> Self {
        self.with_validator(Arc::new(|_: &SignalCommand| false))
    }

    /// Read through the current transaction and record the dependency.
    pub(crate) fn read_tracked(&self, kind: UsageKind) -> Result<TreeRevision> {
        let revision = Transaction::read(&self.tree)?;
        if revision.data(self.id).is_some() {
            Transaction::record_read(&self.tree, self.id)?;
        }
        if UsageTracker::is_active() {
            UsageTracker::register_usage(SignalUsage::capture(&self.tree, &revision, self.id, kind));
        }
        Ok(revision)
    }

    /// Read through the current transaction without recording anything.
    pub(crate) fn read(&self) -> Result<TreeRevision> {
        Transaction::read(&self.tree)
    }

    /// Validate `command`, check it for effect loops and add it to the
    /// current transaction.
    pub(crate) fn submit(&self, command: SignalCommand, handler: ResultHandler) -> Result<()> {
        if let Some(validator) = &self.validator {
            if !accepts(validator, &command) {
                return Err(SignalError::Unsupported);
            }
        }

        let revision = Transaction::read(&self.tree)?;
        let mut written = Vec::new();
        written_nodes(&command, &mut written);
        for target in written {
            check_write(NodeKey {
                tree: self.tree.id(),
                id: revision.resolve_alias(target),
            })?;
        }

        Transaction::include(&self.tree, command, Some(handler))
    }

    /// Submit a command whose operation carries no value.
    pub(crate) fn submit_void(&self, command: SignalCommand) -> Result<SignalOperation<()>> {
        let (operation, handler) = operation(|_| Ok(()));
        self.submit(command, handler)?;
        Ok(operation)
    }
}

fn accepts(validator: &Validator, command: &SignalCommand) -> bool {
    match command {
        SignalCommand::Transaction { commands, .. } => {
            commands.iter().all(|command| accepts(validator, command))
        }
        command if command.is_condition() => true,
        command => validator(command),
    }
}

fn written_nodes(command: &SignalCommand, out: &mut Vec<Id>) {
    match command {
        SignalCommand::Transaction { commands, .. } => {
            for command in commands {
                written_nodes(command, out);
            }
        }
        SignalCommand::ClearOwner { .. } | SignalCommand::Snapshot { .. } => {}
        command if command.is_condition() => {}
        command => out.push(command.target_node_id()),
    }
}

fn validator_address(validator: &Option<Validator>) -> usize {
    validator
        .as_ref()
        .map_or(0, |validator| Arc::as_ptr(validator) as *const () as usize)
}

impl PartialEq for SignalCore {
    fn eq(&self, other: &Self) -> bool {
        self.tree.id() == other.tree.id()
            && self.id == other.id
            && validator_address(&self.validator) == validator_address(&other.validator)
    }
}

impl Eq for SignalCore {}

impl Hash for SignalCore {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tree.id().hash(state);
        self.id.hash(state);
        validator_address(&self.validator).hash(state);
    }
}

impl fmt::Debug for SignalCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalCore")
            .field("tree", &self.tree.id())
            .field("id", &self.id)
            .field("validated", &self.validator.is_some())
            .finish()
    }
}

/// Read access shared by all tree-backed signals.
pub trait Signal {
    type Value;

    fn core(&self) -> &SignalCore;

    /// The part of the node that `value()` depends on.
    fn usage_kind(&self) -> UsageKind;

    /// Build the signal's value from a revision.
    fn extract(&self, revision: &TreeRevision) -> Result<Self::Value>;

    fn id(&self) -> Id {
        self.core().id()
    }

    fn tree(&self) -> &Arc<SignalTree> {
        self.core().tree()
    }

    /// The current value. Registers a dependency when tracked.
    fn value(&self) -> Result<Self::Value> {
        let revision = self.core().read_tracked(self.usage_kind())?;
        self.extract(&revision)
    }

    /// The current value without registering a dependency.
    fn peek(&self) -> Result<Self::Value> {
        let revision = self.core().read()?;
        self.extract(&revision)
    }

    /// The value in the confirmed revision, ignoring the current transaction
    /// and unconfirmed local changes.
    fn peek_confirmed(&self) -> Result<Self::Value> {
        self.extract(&self.tree().confirmed())
    }

    /// A computed value derived from this signal.
    fn map<U, F>(&self, mapper: F) -> Computed<U>
    where
        Self: Clone + Send + Sync + Sized + 'static,
        U: Clone + Send + Sync + 'static,
        F: Fn(Self::Value) -> U + Send + Sync + 'static,
    {
        let signal = self.clone();
        Computed::new(move || Ok(mapper(signal.value()?)))
    }
}

/// Build an operation and the result handler that resolves it.
pub(crate) fn operation<R>(
    extract: impl FnOnce(&HashMap<Id, NodeModification>) -> OperationResult<R> + Send + 'static,
) -> (SignalOperation<R>, ResultHandler)
where
    R: Clone + Send + 'static,
{
    let operation = SignalOperation::pending();
    let target = operation.clone();
    let handler: ResultHandler = Box::new(move |result: &CommandResult| {
        let outcome = match result {
            CommandResult::Accept { updates } => extract(updates),
            CommandResult::Reject { reason } => Err(OperationError::Rejected(reason.clone())),
        };
        target.complete(outcome);
    });
    (operation, handler)
}

pub(crate) fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Decode a stored value. `null` reads as `None`.
pub(crate) fn from_json<T: DeserializeOwned>(value: &Value) -> Result<Option<T>> {
    if value.is_null() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_value(value.clone())?))
}

/// The value of `id` before or after an update.
pub(crate) fn modified_value(
    updates: &HashMap<Id, NodeModification>,
    id: Id,
    before: bool,
) -> Value {
    updates
        .get(&id)
        .and_then(|modification| {
            let node = if before { &modification.old } else { &modification.new };
            node.as_ref().and_then(|node| node.as_data()).map(|data| data.value.clone())
        })
        .unwrap_or(Value::Null)
}

pub(crate) fn decode_result<T: DeserializeOwned>(value: &Value) -> OperationResult<Option<T>> {
    from_json(value).map_err(|error| OperationError::Decode(error.to_string()))
}

/// Computes the next raw value from the current one, plus the operation
/// result for when the change is accepted.
pub(crate) type UpdateFn<R> = Arc<dyn Fn(&Value) -> Result<(Value, R)> + Send + Sync>;

/// Replace the value of `core` with `compute(current)`, retrying with the new
/// current value whenever someone else changed it first.
pub(crate) fn update_with_retry<R>(
    core: SignalCore,
    compute: UpdateFn<R>,
    operation: CancelableOperation<R>,
) -> Result<()>
where
    R: Clone + Send + 'static,
{
    let current = core
        .read()?
        .data(core.id())
        .map(|data| data.value.clone())
        .unwrap_or(Value::Null);
    let (next, result) = compute(&current)?;

    let command = SignalCommand::transaction(vec![
        SignalCommand::ValueCondition {
            command_id: Id::random(),
            target_node_id: core.id(),
            expected_value: current,
        },
        SignalCommand::Set {
            command_id: Id::random(),
            target_node_id: core.id(),
            value: next,
        },
    ]);

    let retry = core.clone();
    let handler: ResultHandler = Box::new(move |outcome: &CommandResult| {
        let target = operation.operation().clone();
        match outcome.reject_reason() {
            None => target.complete(Ok(result)),
            Some(_) if operation.is_cancelled() => target.complete(Err(OperationError::Cancelled)),
            Some(UNEXPECTED_VALUE) => {
                if let Err(error) = update_with_retry(retry, compute, operation) {
                    target.complete(Err(OperationError::Rejected(error.to_string())));
                }
            }
            Some(reason) => target.complete(Err(OperationError::Rejected(reason.to_owned()))),
        }
    });

    core.submit(command, handler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validators_skip_conditions_and_check_transaction_contents() {
        let validator: Validator =
            Arc::new(|command: &SignalCommand| !matches!(command, SignalCommand::Clear { .. }));
        let deny: Validator = Arc::new(|_: &SignalCommand| false);
        let condition = SignalCommand::ValueCondition {
            command_id: Id::random(),
            target_node_id: Id::ZERO,
            expected_value: json!(1),
        };
        let clear = SignalCommand::Clear {
            command_id: Id::random(),
            target_node_id: Id::ZERO,
        };

        assert!(accepts(&deny, &condition));
        assert!(!accepts(&validator, &SignalCommand::transaction(vec![condition, clear])));
    }

    #[test]
    fn cores_compare_by_tree_id_and_validator() {
        let tree = SignalTree::synchronous();
        let a = SignalCore::new(tree.clone(), Id::ZERO);
        let b = SignalCore::new(tree.clone(), Id::ZERO);
        let other = SignalCore::new(tree, Id::random());

        assert_eq!(a, b);
        assert_ne!(a, other);
        assert_ne!(a, a.readonly());
    }

    #[test]
    fn null_decodes_as_none() {
        assert_eq!(from_json::<String>(&Value::Null), Ok(None));
        assert_eq!(from_json::<String>(&json!("x")), Ok(Some("x".to_string())));
        assert!(from_json::<String>(&json!(1)).is_err());
    }
}
