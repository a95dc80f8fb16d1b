//! Tree Nodes
//!
//! This module defines the entries stored in a signal tree.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::Id;

/// An entry in a signal tree, addressed by [`Id`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Node {
    /// A node that holds a value and structural links.
    Data(Data),

    /// A redirect to another node.
    ///
    /// Aliases keep an id usable after the entry it was created for turned
    /// out to refer to an existing node, e.g. a `put_if_absent` for a key
    /// that is already present.
    Alias(Alias),
}

impl Node {
    /// Get the data of this node, unless it is an alias.
    pub fn as_data(&self) -> Option<&Data> {
        match self {
            Node::Data(data) => Some(data),
            Node::Alias(_) => None,
        }
    }

    /// Get the alias target, if this is an alias.
    pub fn alias_target(&self) -> Option<Id> {
        match self {
            Node::Alias(alias) => Some(alias.target),
            Node::Data(_) => None,
        }
    }
}

/// Alias node payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alias {
    /// The node this alias redirects to.
    pub target: Id,
}

/// Data node payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Data {
    /// The parent node, `None` for the root and for detached nodes.
    pub parent: Option<Id>,

    /// Id of the command that last modified this node.
    ///
    /// Used by [`LastUpdateCondition`](crate::tree::SignalCommand::LastUpdateCondition)
    /// for optimistic concurrency checks.
    pub last_update: Id,

    /// Owner on whose behalf the node was created, if any.
    #[serde(default)]
    pub scope_owner: Option<Id>,

    /// The value of the node.
    #[serde(default)]
    pub value: Value,

    /// Ordered list children.
    #[serde(default)]
    pub list_children: Vec<Id>,

    /// Keyed map children, in insertion order.
    #[serde(default)]
    pub map_children: IndexMap<String, Id>,
}

impl Data {
    /// Create a detached node without children.
    pub fn new(last_update: Id, scope_owner: Option<Id>, value: Value) -> Self {
        Self {
            parent: None,
            last_update,
            scope_owner,
            value,
            list_children: Vec::new(),
            map_children: IndexMap::new(),
        }
    }

    /// The empty root node of a new tree.
    pub fn root() -> Self {
        Self::new(Id::ZERO, None, Value::Null)
    }

    /// Find the map key under which `child` is stored.
    pub fn key_of(&self, child: Id) -> Option<&str> {
        self.map_children
            .iter()
            .find(|(_, id)| **id == child)
            .map(|(key, _)| key.as_str())
    }

    /// Iterate over all children, list children first.
    pub fn children(&self) -> impl Iterator<Item = Id> + '_ {
        self.list_children
            .iter()
            .chain(self.map_children.values())
            .copied()
    }
}

impl From<Data> for Node {
    fn from(data: Data) -> Self {
        Node::Data(data)
    }
}

impl From<Alias> for Node {
    fn from(alias: Alias) -> Self {
        Node::Alias(alias)
    }
}
