//! Signal Commands
//!
//! Every change to a signal tree is expressed as a [`SignalCommand`]. Commands
//! are plain serializable values so that the same command can be applied
//! optimistically on a client, sent to an authority and confirmed there.
//!
//! # Categories
//!
//! - Conditions (`ValueCondition`, `PositionCondition`, `KeyCondition`,
//!   `LastUpdateCondition`) never modify anything. They are combined with
//!   other commands in a `Transaction` to make the whole transaction depend on
//!   the current state.
//! - Value, map and list mutations operate on the target node.
//! - `AdoptAt`/`AdoptAs` move an existing node under a new parent.
//! - `Clear` and `ClearOwner` remove many nodes at once.
//! - `Transaction` applies a list of commands atomically.
//! - `Snapshot` loads a complete node map into an empty tree.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::Codec;
use crate::environment::SignalEnvironment;
use crate::error::Result;
use crate::id::Id;

use super::node::Node;

/// Position in a list relative to its neighbours.
///
/// `after` and `before` refer to sibling ids; [`Id::EDGE`] refers to the start
/// (for `after`) or end (for `before`) of the list. When both are set, both
/// must hold for the position to match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListPosition {
    pub after: Option<Id>,
    pub before: Option<Id>,
}

impl ListPosition {
    /// The start of the list.
    pub fn first() -> Self {
        Self {
            after: Some(Id::EDGE),
            before: None,
        }
    }

    /// The end of the list.
    pub fn last() -> Self {
        Self {
            after: None,
            before: Some(Id::EDGE),
        }
    }

    /// Directly after `sibling`.
    pub fn after(sibling: Id) -> Self {
        Self {
            after: Some(sibling),
            before: None,
        }
    }

    /// Directly before `sibling`.
    pub fn before(sibling: Id) -> Self {
        Self {
            after: None,
            before: Some(sibling),
        }
    }

    /// Between two adjacent siblings.
    pub fn between(after: Id, before: Id) -> Self {
        Self {
            after: Some(after),
            before: Some(before),
        }
    }

    /// No constraint on the neighbours.
    pub fn anywhere() -> Self {
        Self {
            after: None,
            before: None,
        }
    }
}

/// A serializable operation on a signal tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalCommand {
    /// Passes if the target's value equals `expected_value`.
    ValueCondition {
        command_id: Id,
        target_node_id: Id,
        expected_value: Value,
    },

    /// Passes if `child_id` is a list child of the target at `position`.
    PositionCondition {
        command_id: Id,
        target_node_id: Id,
        child_id: Id,
        position: ListPosition,
    },

    /// Checks the map child stored under `key`.
    ///
    /// `None` requires any child, `Some(Id::ZERO)` requires the key to be
    /// absent, any other id requires that specific child.
    KeyCondition {
        command_id: Id,
        target_node_id: Id,
        key: String,
        expected_child: Option<Id>,
    },

    /// Passes if the target was last modified by `expected_last_update`.
    LastUpdateCondition {
        command_id: Id,
        target_node_id: Id,
        expected_last_update: Id,
    },

    /// Moves `child_id` into the list of the target.
    AdoptAt {
        command_id: Id,
        target_node_id: Id,
        child_id: Id,
        position: ListPosition,
    },

    /// Moves `child_id` into the map of the target.
    AdoptAs {
        command_id: Id,
        target_node_id: Id,
        child_id: Id,
        key: String,
    },

    /// Adds `delta` to a numeric value.
    Increment {
        command_id: Id,
        target_node_id: Id,
        delta: f64,
    },

    /// Removes all children of the target.
    Clear { command_id: Id, target_node_id: Id },

    /// Removes the map child stored under `key`.
    RemoveByKey {
        command_id: Id,
        target_node_id: Id,
        key: String,
    },

    /// Sets the value of the map child under `key`, creating it if needed.
    Put {
        command_id: Id,
        target_node_id: Id,
        key: String,
        value: Value,
    },

    /// Creates a map child under `key` unless one exists.
    ///
    /// The new node gets the command id. If the key is taken, the command id
    /// becomes an alias of the existing child instead.
    PutIfAbsent {
        command_id: Id,
        target_node_id: Id,
        scope_owner: Option<Id>,
        key: String,
        value: Value,
    },

    /// Creates a list child at `position`. The new node gets the command id.
    Insert {
        command_id: Id,
        target_node_id: Id,
        scope_owner: Option<Id>,
        value: Value,
        position: ListPosition,
    },

    /// Sets the value of the target.
    Set {
        command_id: Id,
        target_node_id: Id,
        value: Value,
    },

    /// Detaches the target from its parent, optionally checking the parent.
    Remove {
        command_id: Id,
        target_node_id: Id,
        expected_parent_id: Option<Id>,
    },

    /// Removes every node whose scope owner is `owner_id`.
    ClearOwner { command_id: Id, owner_id: Id },

    /// Applies all commands or none of them.
    Transaction {
        command_id: Id,
        commands: Vec<SignalCommand>,
    },

    /// Loads a complete set of nodes.
    Snapshot {
        command_id: Id,
        nodes: HashMap<Id, Node>,
    },
}

impl SignalCommand {
    /// Get the unique id of this command.
    pub fn command_id(&self) -> Id {
        match self {
            Self::ValueCondition { command_id, .. }
            | Self::PositionCondition { command_id, .. }
            | Self::KeyCondition { command_id, .. }
            | Self::LastUpdateCondition { command_id, .. }
            | Self::AdoptAt { command_id, .. }
            | Self::AdoptAs { command_id, .. }
            | Self::Increment { command_id, .. }
            | Self::Clear { command_id, .. }
            | Self::RemoveByKey { command_id, .. }
            | Self::Put { command_id, .. }
            | Self::PutIfAbsent { command_id, .. }
            | Self::Insert { command_id, .. }
            | Self::Set { command_id, .. }
            | Self::Remove { command_id, .. }
            | Self::ClearOwner { command_id, .. }
            | Self::Transaction { command_id, .. }
            | Self::Snapshot { command_id, .. } => *command_id,
        }
    }

    /// Get the id of the node this command operates on.
    ///
    /// Tree-wide commands target the root.
    pub fn target_node_id(&self) -> Id {
        match self {
            Self::ValueCondition { target_node_id, .. }
            | Self::PositionCondition { target_node_id, .. }
            | Self::KeyCondition { target_node_id, .. }
            | Self::LastUpdateCondition { target_node_id, .. }
            | Self::AdoptAt { target_node_id, .. }
            | Self::AdoptAs { target_node_id, .. }
            | Self::Increment { target_node_id, .. }
            | Self::Clear { target_node_id, .. }
            | Self::RemoveByKey { target_node_id, .. }
            | Self::Put { target_node_id, .. }
            | Self::PutIfAbsent { target_node_id, .. }
            | Self::Insert { target_node_id, .. }
            | Self::Set { target_node_id, .. }
            | Self::Remove { target_node_id, .. } => *target_node_id,
            Self::ClearOwner { .. } | Self::Transaction { .. } | Self::Snapshot { .. } => Id::ZERO,
        }
    }

    /// Whether this command only checks state without modifying it.
    pub fn is_condition(&self) -> bool {
        matches!(
            self,
            Self::ValueCondition { .. }
                | Self::PositionCondition { .. }
                | Self::KeyCondition { .. }
                | Self::LastUpdateCondition { .. }
        )
    }

    /// Wrap commands in a transaction with a fresh id.
    pub fn transaction(commands: Vec<SignalCommand>) -> Self {
        Self::Transaction {
            command_id: Id::random(),
            commands,
        }
    }

    /// Encode a batch of commands with the environment's codec.
    pub fn encode_batch(commands: &[SignalCommand]) -> Result<Vec<u8>> {
        SignalEnvironment::codec().encode(&commands)
    }

    /// Decode a batch produced by [`encode_batch`](Self::encode_batch).
    pub fn decode_batch(bytes: &[u8]) -> Result<Vec<SignalCommand>> {
        Self::decode_batch_with(SignalEnvironment::codec(), bytes)
    }

    /// Decode a batch with an explicit codec.
    pub fn decode_batch_with(codec: Codec, bytes: &[u8]) -> Result<Vec<SignalCommand>> {
        codec.decode(bytes)
    }
}
