//! List signals.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::Result;
use crate::id::Id;
use crate::operation::{InsertOperation, SignalOperation};
use crate::reactive::UsageKind;
use crate::tree::{ListPosition, SignalCommand, SignalTree, TreeRevision};

use super::{to_json, NodeSignal, Signal, SignalCore, SignalValue, ValueSignal};

/// A signal whose value is an ordered list of child value signals.
///
/// Only the list structure is tracked by [`Signal::value`]. Changes to the
/// value of a child do not affect dependents of the list unless they also
/// read that child.
pub struct ListSignal<T> {
    core: SignalCore,
    _value: PhantomData<fn() -> T>,
}

impl<T> Clone for ListSignal<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            _value: PhantomData,
        }
    }
}

signal_identity!(ListSignal<T>);

impl<T> fmt::Debug for ListSignal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ListSignal").field(&self.core).finish()
    }
}

impl<T: SignalValue> ListSignal<T> {
    /// Create an empty list in a new synchronous tree.
    pub fn new() -> Self {
        Self::at(SignalTree::synchronous(), Id::ZERO)
    }

    pub fn at(tree: Arc<SignalTree>, id: Id) -> Self {
        Self::from_core(SignalCore::new(tree, id))
    }

    pub(crate) fn from_core(core: SignalCore) -> Self {
        Self {
            core,
            _value: PhantomData,
        }
    }

    fn child(&self, id: Id) -> ValueSignal<T> {
        ValueSignal::from_core(self.core.child(id))
    }

    /// Insert a new child at the start of the list.
    pub fn insert_first(&self, value: T) -> Result<InsertOperation<ValueSignal<T>>> {
        self.insert_at(value, ListPosition::first())
    }

    /// Insert a new child at the end of the list.
    pub fn insert_last(&self, value: T) -> Result<InsertOperation<ValueSignal<T>>> {
        self.insert_at(value, ListPosition::last())
    }

    /// Insert a new child at `position`.
    ///
    /// The returned signal refers to the new child right away, even before
    /// the insert has been accepted.
    pub fn insert_at(
        &self,
        value: T,
        position: ListPosition,
    ) -> Result<InsertOperation<ValueSignal<T>>> {
        let command_id = Id::random();
        let operation = self.core.submit_void(SignalCommand::Insert {
            command_id,
            target_node_id: self.core.id(),
            scope_owner: None,
            value: to_json(&value)?,
            position,
        })?;
        Ok(InsertOperation::new(self.child(command_id), operation))
    }

    /// Move a child of this list to `position`.
    pub fn move_to(&self, child: &ValueSignal<T>, position: ListPosition) -> Result<SignalOperation<()>> {
        self.core.submit_void(SignalCommand::AdoptAt {
            command_id: Id::random(),
            target_node_id: self.core.id(),
            child_id: child.id(),
            position,
        })
    }

    /// Remove `child` from the list. Rejected if it is not a child of this
    /// list.
    pub fn remove(&self, child: &ValueSignal<T>) -> Result<SignalOperation<()>> {
        self.core.submit_void(SignalCommand::Remove {
            command_id: Id::random(),
            target_node_id: child.id(),
            expected_parent_id: Some(self.core.id()),
        })
    }

    /// Remove all children.
    pub fn clear(&self) -> Result<SignalOperation<()>> {
        self.core.submit_void(SignalCommand::Clear {
            command_id: Id::random(),
            target_node_id: self.core.id(),
        })
    }

    /// A condition that passes only if `child` is at `position` in this list.
    pub fn verify_position(
        &self,
        child: &ValueSignal<T>,
        position: ListPosition,
    ) -> Result<SignalOperation<()>> {
        self.core.submit_void(SignalCommand::PositionCondition {
            command_id: Id::random(),
            target_node_id: self.core.id(),
            child_id: child.id(),
            position,
        })
    }

    /// A condition that passes only if `child` is anywhere in this list.
    pub fn verify_child(&self, child: &ValueSignal<T>) -> Result<SignalOperation<()>> {
        self.verify_position(child, ListPosition::anywhere())
    }

    pub fn as_readonly(&self) -> Self {
        Self::from_core(self.core.readonly())
    }

    pub fn with_validator(
        &self,
        validator: impl Fn(&SignalCommand) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::from_core(self.core.with_validator(Arc::new(validator)))
    }

    pub fn as_node(&self) -> NodeSignal {
        NodeSignal::from_core(self.core.clone())
    }
}

impl<T: SignalValue> Default for ListSignal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: SignalValue> Signal for ListSignal<T> {
    type Value = Vec<ValueSignal<T>>;

    fn core(&self) -> &SignalCore {
        &self.core
    }

    fn usage_kind(&self) -> UsageKind {
        UsageKind::ListChildren
    }

    fn extract(&self, revision: &TreeRevision) -> Result<Vec<ValueSignal<T>>> {
        Ok(revision
            .data(self.core.id())
            .map(|data| data.list_children.iter().map(|id| self.child(*id)).collect())
            .unwrap_or_default())
    }
}
