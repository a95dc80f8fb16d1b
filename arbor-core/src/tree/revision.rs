//! Tree revisions and command results.
//!
//! A [`TreeRevision`] is an immutable snapshot of all nodes in a tree. Cloning
//! it only bumps a reference count, so readers can hold on to a revision while
//! the tree moves on. [`MutableTreeRevision`] is the working copy that commands
//! are applied to.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::id::Id;

use super::command::SignalCommand;
use super::manipulator::TreeManipulator;
use super::node::{Data, Node};

/// The before and after state of one node touched by a command.
///
/// `old == None` means the node was created, `new == None` means it was
/// removed.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeModification {
    pub old: Option<Node>,
    pub new: Option<Node>,
}

/// Outcome of applying a single command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    /// The command was applied; `updates` lists every changed node.
    Accept {
        updates: HashMap<Id, NodeModification>,
    },

    /// A precondition failed and nothing was changed.
    Reject { reason: String },
}

impl CommandResult {
    /// Accepted without changes.
    pub fn ok() -> Self {
        Self::Accept {
            updates: HashMap::new(),
        }
    }

    /// Rejected with a reason.
    pub fn fail(reason: impl Into<String>) -> Self {
        Self::Reject {
            reason: reason.into(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accept { .. })
    }

    /// The rejection reason, if rejected.
    pub fn reject_reason(&self) -> Option<&str> {
        match self {
            Self::Reject { reason } => Some(reason),
            Self::Accept { .. } => None,
        }
    }

    /// Ids of all nodes this result changed.
    pub fn updated_ids(&self) -> impl Iterator<Item = Id> + '_ {
        let updates = match self {
            Self::Accept { updates } => Some(updates.keys().copied()),
            Self::Reject { .. } => None,
        };
        updates.into_iter().flatten()
    }
}

/// Results keyed by command id. Transactions contribute one entry per
/// sub-command in addition to their own.
pub type CommandResults = HashMap<Id, CommandResult>;

pub(crate) fn resolve_alias_in(nodes: &HashMap<Id, Node>, id: Id) -> Id {
    match nodes.get(&id) {
        Some(Node::Alias(alias)) => alias.target,
        _ => id,
    }
}

pub(crate) fn data_in(nodes: &HashMap<Id, Node>, id: Id) -> Option<&Data> {
    nodes
        .get(&resolve_alias_in(nodes, id))
        .and_then(Node::as_data)
}

fn root_nodes() -> HashMap<Id, Node> {
    let mut nodes = HashMap::new();
    nodes.insert(Id::ZERO, Node::Data(Data::root()));
    nodes
}

/// Immutable snapshot of a signal tree.
#[derive(Debug, Clone)]
pub struct TreeRevision {
    nodes: Arc<HashMap<Id, Node>>,
}

impl TreeRevision {
    /// A revision that only contains an empty root.
    pub fn empty() -> Self {
        Self {
            nodes: Arc::new(root_nodes()),
        }
    }

    /// All nodes, including aliases.
    pub fn nodes(&self) -> &HashMap<Id, Node> {
        &self.nodes
    }

    /// Get the raw node stored under `id` without resolving aliases.
    pub fn node(&self, id: Id) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Follow an alias to its target. Non-alias ids are returned unchanged.
    pub fn resolve_alias(&self, id: Id) -> Id {
        resolve_alias_in(&self.nodes, id)
    }

    /// Get the data of a node, resolving aliases.
    pub fn data(&self, id: Id) -> Option<&Data> {
        data_in(&self.nodes, id)
    }

    /// Create a working copy of this revision.
    pub fn to_mutable(&self) -> MutableTreeRevision {
        MutableTreeRevision {
            nodes: (*self.nodes).clone(),
        }
    }

    /// Apply one command to this revision in place.
    ///
    /// Storage shared with other revisions is copied first, so snapshots
    /// handed out earlier keep their state.
    pub(crate) fn apply_in_place(&mut self, command: &SignalCommand) -> CommandResults {
        let nodes = Arc::make_mut(&mut self.nodes);
        let mut working = MutableTreeRevision::from_nodes(std::mem::take(nodes));
        let results = working.apply(command);
        *nodes = working.nodes;
        results
    }

    /// Whether both revisions share the same storage.
    pub fn ptr_eq(&self, other: &TreeRevision) -> bool {
        Arc::ptr_eq(&self.nodes, &other.nodes)
    }

    /// Ids of all nodes that differ between the two revisions.
    pub fn changed_ids(&self, other: &TreeRevision) -> HashSet<Id> {
        if self.ptr_eq(other) {
            return HashSet::new();
        }

        let mut changed: HashSet<Id> = self
            .nodes
            .iter()
            .filter(|(id, node)| other.nodes.get(id) != Some(*node))
            .map(|(id, _)| *id)
            .collect();
        changed.extend(
            other
                .nodes
                .keys()
                .filter(|id| !self.nodes.contains_key(id))
                .copied(),
        );
        changed
    }
}

impl Default for TreeRevision {
    fn default() -> Self {
        Self::empty()
    }
}

/// Working copy of a tree that commands can be applied to.
#[derive(Debug, Clone)]
pub struct MutableTreeRevision {
    nodes: HashMap<Id, Node>,
}

impl MutableTreeRevision {
    /// A working copy that only contains an empty root.
    pub fn new() -> Self {
        Self { nodes: root_nodes() }
    }

    pub(crate) fn from_nodes(nodes: HashMap<Id, Node>) -> Self {
        Self { nodes }
    }

    pub fn nodes(&self) -> &HashMap<Id, Node> {
        &self.nodes
    }

    pub fn resolve_alias(&self, id: Id) -> Id {
        resolve_alias_in(&self.nodes, id)
    }

    pub fn data(&self, id: Id) -> Option<&Data> {
        data_in(&self.nodes, id)
    }

    /// Apply one command and return the result of the command and of all its
    /// sub-commands.
    ///
    /// A rejected command leaves the revision untouched.
    pub fn apply(&mut self, command: &SignalCommand) -> CommandResults {
        let mut results = CommandResults::new();

        let outcome = if self.data(command.target_node_id()).is_none() {
            Err("Node not found".to_string())
        } else {
            let (outcome, sub_results) = TreeManipulator::new(&self.nodes, command).run();
            results.extend(sub_results);
            outcome
        };

        let result = match outcome {
            Ok(updates) => {
                for (id, modification) in &updates {
                    match &modification.new {
                        Some(node) => {
                            self.nodes.insert(*id, node.clone());
                        }
                        None => {
                            self.nodes.remove(id);
                        }
                    }
                }
                CommandResult::Accept { updates }
            }
            Err(reason) => CommandResult::Reject { reason },
        };

        results.insert(command.command_id(), result);
        results
    }

    /// Apply commands in order and collect all results.
    pub fn apply_all<'a>(
        &mut self,
        commands: impl IntoIterator<Item = &'a SignalCommand>,
    ) -> CommandResults {
        let mut results = CommandResults::new();
        for command in commands {
            results.extend(self.apply(command));
        }
        results
    }

    /// Freeze the current state into an immutable revision.
    pub fn snapshot(&self) -> TreeRevision {
        TreeRevision {
            nodes: Arc::new(self.nodes.clone()),
        }
    }

    pub fn into_revision(self) -> TreeRevision {
        TreeRevision {
            nodes: Arc::new(self.nodes),
        }
    }
}

impl Default for MutableTreeRevision {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::command::ListPosition;
    use serde_json::json;

    fn insert(target: Id, value: serde_json::Value) -> SignalCommand {
        SignalCommand::Insert {
            command_id: Id::random(),
            target_node_id: target,
            scope_owner: None,
            value,
            position: ListPosition::last(),
        }
    }

    #[test]
    fn rejected_command_changes_nothing() {
        let mut revision = MutableTreeRevision::new();
        let before = revision.snapshot();

        let command = SignalCommand::Set {
            command_id: Id::random(),
            target_node_id: Id::random(),
            value: json!(1),
        };
        let results = revision.apply(&command);

        assert_eq!(
            results[&command.command_id()].reject_reason(),
            Some("Node not found")
        );
        assert!(before.changed_ids(&revision.snapshot()).is_empty());
    }

    #[test]
    fn accepted_command_reports_updates() {
        let mut revision = MutableTreeRevision::new();
        let command = insert(Id::ZERO, json!("a"));
        let results = revision.apply(&command);

        let result = &results[&command.command_id()];
        let mut updated: Vec<Id> = result.updated_ids().collect();
        updated.sort();
        let mut expected = vec![Id::ZERO, command.command_id()];
        expected.sort();
        assert_eq!(updated, expected);

        let data = revision.data(command.command_id()).unwrap();
        assert_eq!(data.value, json!("a"));
        assert_eq!(data.parent, Some(Id::ZERO));
    }

    #[test]
    fn apply_in_place_keeps_shared_snapshots() {
        let mut revision = TreeRevision::empty();
        let shared = revision.clone();

        let first = insert(Id::ZERO, json!(1));
        revision.apply_in_place(&first);
        assert!(shared.data(first.command_id()).is_none());
        assert!(!revision.ptr_eq(&shared));

        let storage: *const HashMap<Id, Node> = revision.nodes();
        let second = insert(Id::ZERO, json!(2));
        revision.apply_in_place(&second);
        assert!(std::ptr::eq(storage, revision.nodes()));
        assert_eq!(revision.data(Id::ZERO).unwrap().list_children.len(), 2);
    }

    #[test]
    fn snapshots_are_isolated_from_later_changes() {
        let mut revision = MutableTreeRevision::new();
        let snapshot = revision.snapshot();
        let command = insert(Id::ZERO, json!(1));
        revision.apply(&command);

        assert!(snapshot.data(command.command_id()).is_none());
        let changed = snapshot.changed_ids(&revision.snapshot());
        assert!(changed.contains(&command.command_id()));
        assert!(changed.contains(&Id::ZERO));
    }

    #[test]
    fn cloned_revisions_share_storage() {
        let revision = TreeRevision::empty();
        let clone = revision.clone();
        assert!(revision.ptr_eq(&clone));
        assert!(revision.changed_ids(&clone).is_empty());
    }
}
