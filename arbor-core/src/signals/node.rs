//! Untyped node signals.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::id::Id;
use crate::operation::{InsertOperation, SignalOperation};
use crate::reactive::UsageKind;
use crate::tree::{ListPosition, SignalCommand, SignalTree, TreeRevision};

use super::{
    from_json, to_json, ListSignal, MapSignal, NumberSignal, Signal, SignalCore, SignalValue,
    ValueSignal,
};

/// Snapshot of a node: its value, its parent and its children.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSignalState {
    pub value: Value,
    pub parent: Option<NodeSignal>,
    pub list_children: Vec<NodeSignal>,
    pub map_children: IndexMap<String, NodeSignal>,
}

impl NodeSignalState {
    /// Decode the value of the node.
    pub fn value<T: SignalValue>(&self) -> Result<Option<T>> {
        from_json(&self.value)
    }
}

/// A signal that gives access to every aspect of a node: its value and both
/// kinds of children.
///
/// A node signal depends on the node's last update, so any change to the
/// node itself (but not to its children's values) counts as a change.
#[derive(Clone)]
pub struct NodeSignal {
    core: SignalCore,
}

signal_identity!(NodeSignal);

impl NodeSignal {
    /// Create the root of a new synchronous tree.
    pub fn new() -> Self {
        Self::at(SignalTree::synchronous(), Id::ZERO)
    }

    pub fn at(tree: Arc<SignalTree>, id: Id) -> Self {
        Self::from_core(SignalCore::new(tree, id))
    }

    pub(crate) fn from_core(core: SignalCore) -> Self {
        Self { core }
    }

    fn child(&self, id: Id) -> NodeSignal {
        NodeSignal::from_core(self.core.child(id))
    }

    pub fn as_value<T: SignalValue>(&self) -> ValueSignal<T> {
        ValueSignal::from_core(self.core.clone())
    }

    pub fn as_number(&self) -> NumberSignal {
        NumberSignal::from_core(self.core.clone())
    }

    pub fn as_list<T: SignalValue>(&self) -> ListSignal<T> {
        ListSignal::from_core(self.core.clone())
    }

    pub fn as_map<T: SignalValue>(&self) -> MapSignal<T> {
        MapSignal::from_core(self.core.clone())
    }

    /// Insert a list child holding `value`.
    pub fn insert_child_with_value<T: Serialize>(
        &self,
        value: &T,
        position: ListPosition,
    ) -> Result<InsertOperation<NodeSignal>> {
        self.insert(to_json(value)?, position)
    }

    /// Insert a list child without a value.
    pub fn insert_child(&self, position: ListPosition) -> Result<InsertOperation<NodeSignal>> {
        self.insert(Value::Null, position)
    }

    fn insert(&self, value: Value, position: ListPosition) -> Result<InsertOperation<NodeSignal>> {
        let command_id = Id::random();
        let operation = self.core.submit_void(SignalCommand::Insert {
            command_id,
            target_node_id: self.core.id(),
            scope_owner: None,
            value,
            position,
        })?;
        Ok(InsertOperation::new(self.child(command_id), operation))
    }

    /// Set the value of the map child under `key`, creating it if needed.
    pub fn put_child_with_value<T: Serialize>(
        &self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<SignalOperation<()>> {
        self.core.submit_void(SignalCommand::Put {
            command_id: Id::random(),
            target_node_id: self.core.id(),
            key: key.into(),
            value: to_json(value)?,
        })
    }

    /// Create an empty map child under `key` unless one exists. The returned
    /// signal refers to whichever child ends up under `key`.
    pub fn put_child_if_absent(&self, key: impl Into<String>) -> Result<InsertOperation<NodeSignal>> {
        let command_id = Id::random();
        let operation = self.core.submit_void(SignalCommand::PutIfAbsent {
            command_id,
            target_node_id: self.core.id(),
            scope_owner: None,
            key: key.into(),
            value: Value::Null,
        })?;
        Ok(InsertOperation::new(self.child(command_id), operation))
    }

    /// Move another node of the same tree into this node's list.
    pub fn adopt_at<S: Signal>(&self, node: &S, position: ListPosition) -> Result<SignalOperation<()>> {
        self.core.submit_void(SignalCommand::AdoptAt {
            command_id: Id::random(),
            target_node_id: self.core.id(),
            child_id: node.id(),
            position,
        })
    }

    /// Move another node of the same tree into this node's map under `key`.
    pub fn adopt_as<S: Signal>(&self, node: &S, key: impl Into<String>) -> Result<SignalOperation<()>> {
        self.core.submit_void(SignalCommand::AdoptAs {
            command_id: Id::random(),
            target_node_id: self.core.id(),
            child_id: node.id(),
            key: key.into(),
        })
    }

    /// Remove `child`, wherever it is stored in this node.
    pub fn remove_child(&self, child: &NodeSignal) -> Result<SignalOperation<()>> {
        self.core.submit_void(SignalCommand::Remove {
            command_id: Id::random(),
            target_node_id: child.id(),
            expected_parent_id: Some(self.core.id()),
        })
    }

    /// Remove the map child under `key`.
    pub fn remove_child_by_key(&self, key: impl Into<String>) -> Result<SignalOperation<()>> {
        self.core.submit_void(SignalCommand::RemoveByKey {
            command_id: Id::random(),
            target_node_id: self.core.id(),
            key: key.into(),
        })
    }

    /// Remove all list and map children.
    pub fn clear(&self) -> Result<SignalOperation<()>> {
        self.core.submit_void(SignalCommand::Clear {
            command_id: Id::random(),
            target_node_id: self.core.id(),
        })
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
}

impl Default for NodeSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl Signal for NodeSignal {
    /// `None` if the node does not exist.
    type Value = Option<NodeSignalState>;

    fn core(&self) -> &SignalCore {
        &self.core
    }

    fn usage_kind(&self) -> UsageKind {
        UsageKind::LastUpdate
    }

    fn extract(&self, revision: &TreeRevision) -> Result<Option<NodeSignalState>> {
        Ok(revision.data(self.core.id()).map(|data| NodeSignalState {
            value: data.value.clone(),
            parent: data.parent.map(|parent| self.child(parent)),
            list_children: data.list_children.iter().map(|id| self.child(*id)).collect(),
            map_children: data
                .map_children
                .iter()
                .map(|(key, id)| (key.clone(), self.child(*id)))
                .collect(),
        }))
    }
}

impl fmt::Debug for NodeSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NodeSignal").field(&self.core).finish()
    }
}

/// Renders the node and its descendants, e.g.
/// `NodeSignal[value: 1, listChildren: [NodeSignal[]], mapChildren: [a = NodeSignal[value: "x"]]]`.
impl fmt::Display for NodeSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NodeSignal[")?;

        if let Ok(Some(state)) = self.peek() {
            let mut parts = Vec::new();
            if !state.value.is_null() {
                parts.push(format!("value: {}", state.value));
            }
            if !state.list_children.is_empty() {
                let children: Vec<String> =
                    state.list_children.iter().map(ToString::to_string).collect();
                parts.push(format!("listChildren: [{}]", children.join(", ")));
            }
            if !state.map_children.is_empty() {
                let children: Vec<String> = state
                    .map_children
                    .iter()
                    .map(|(key, child)| format!("{key} = {child}"))
                    .collect();
                parts.push(format!("mapChildren: [{}]", children.join(", ")));
            }
            f.write_str(&parts.join(", "))?;
        }

        f.write_str("]")
    }
}
