//! Value signals.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::Result;
use crate::id::Id;
use crate::operation::{CancelableOperation, SignalOperation};
use crate::reactive::UsageKind;
use crate::tree::{SignalCommand, SignalTree, TreeRevision};

use super::{
    decode_result, from_json, modified_value, operation, to_json, update_with_retry, NodeSignal,
    Signal, SignalCore, SignalValue, UpdateFn,
};

/// A signal holding a single value of type `T`.
///
/// The value is stored as JSON in the node. A node without a value (or with
/// `null`) reads as `None`.
pub struct ValueSignal<T> {
    core: SignalCore,
    _value: PhantomData<fn() -> T>,
}

impl<T> Clone for ValueSignal<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            _value: PhantomData,
        }
    }
}

signal_identity!(ValueSignal<T>);

impl<T> fmt::Debug for ValueSignal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ValueSignal").field(&self.core).finish()
    }
}

impl<T: SignalValue> ValueSignal<T> {
    /// Create a signal in a new synchronous tree.
    pub fn new(initial: T) -> Result<Self> {
        let tree = SignalTree::synchronous();
        tree.commit_single_command(
            SignalCommand::Set {
                command_id: Id::random(),
                target_node_id: Id::ZERO,
                value: to_json(&initial)?,
            },
            None,
        );
        Ok(Self::at(tree, Id::ZERO))
    }

    /// A signal for an existing node.
    pub fn at(tree: Arc<SignalTree>, id: Id) -> Self {
        Self::from_core(SignalCore::new(tree, id))
    }

    pub(crate) fn from_core(core: SignalCore) -> Self {
        Self {
            core,
            _value: PhantomData,
        }
    }

    /// Set the value. The operation resolves with the previous value.
    pub fn set(&self, value: T) -> Result<SignalOperation<Option<T>>> {
        let target = self.core.read()?.resolve_alias(self.core.id());
        let (operation, handler) =
            operation(move |updates| decode_result(&modified_value(updates, target, true)));

        self.core.submit(
            SignalCommand::Set {
                command_id: Id::random(),
                target_node_id: self.core.id(),
                value: to_json(&value)?,
            },
            handler,
        )?;
        Ok(operation)
    }

    /// Set the value only if the current value is `expected`. A mismatch
    /// rejects the operation.
    pub fn replace(&self, expected: Option<&T>, value: T) -> Result<SignalOperation<()>> {
        let expected = to_json(&expected)?;
        self.core.submit_void(SignalCommand::transaction(vec![
            SignalCommand::ValueCondition {
                command_id: Id::random(),
                target_node_id: self.core.id(),
                expected_value: expected,
            },
            SignalCommand::Set {
                command_id: Id::random(),
                target_node_id: self.core.id(),
                value: to_json(&value)?,
            },
        ]))
    }

    /// Replace the value with `updater(current)`.
    ///
    /// If the value is changed by someone else before the update is
    /// applied, the updater runs again with the new value until the update
    /// succeeds or the operation is cancelled. Resolves with the value that
    /// was replaced.
    pub fn update(
        &self,
        updater: impl Fn(Option<T>) -> T + Send + Sync + 'static,
    ) -> Result<CancelableOperation<Option<T>>> {
        let compute: UpdateFn<Option<T>> = Arc::new(move |current| {
            let current: Option<T> = from_json(current)?;
            let next = to_json(&updater(current.clone()))?;
            Ok((next, current))
        });

        let operation = CancelableOperation::new();
        update_with_retry(self.core.clone(), compute, operation.clone())?;
        Ok(operation)
    }

    /// A condition that passes only if the value is `expected`. Useful in a
    /// transaction.
    pub fn verify_value(&self, expected: Option<&T>) -> Result<SignalOperation<()>> {
        self.core.submit_void(SignalCommand::ValueCondition {
            command_id: Id::random(),
            target_node_id: self.core.id(),
            expected_value: to_json(&expected)?,
        })
    }

    /// A handle that reads the same value but rejects every change.
    pub fn as_readonly(&self) -> Self {
        Self::from_core(self.core.readonly())
    }

    /// A handle whose changes must also be accepted by `validator`.
    pub fn with_validator(
        &self,
        validator: impl Fn(&SignalCommand) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::from_core(self.core.with_validator(Arc::new(validator)))
    }

    /// The same node as an untyped node signal.
    pub fn as_node(&self) -> NodeSignal {
        NodeSignal::from_core(self.core.clone())
    }
}

impl<T: SignalValue> Signal for ValueSignal<T> {
    type Value = Option<T>;

    fn core(&self) -> &SignalCore {
        &self.core
    }

    fn usage_kind(&self) -> UsageKind {
        UsageKind::Value
    }

    fn extract(&self, revision: &TreeRevision) -> Result<Option<T>> {
        match revision.data(self.core.id()) {
            Some(data) => from_json(&data.value),
            None => Ok(None),
        }
    }
}
