//! Command evaluation.
//!
//! A [`TreeManipulator`] evaluates one command against a base node map. It
//! never writes to the base: all changes are collected in an overlay of
//! updated nodes plus a set of detached nodes, and later steps of the same
//! command read through that overlay. Only when every step succeeded are the
//! collected changes turned into [`NodeModification`]s for the caller to
//! write.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::id::Id;

use super::command::{ListPosition, SignalCommand};
use super::node::{Alias, Data, Node};
use super::revision::{CommandResult, CommandResults, MutableTreeRevision, NodeModification};

type Step<T = ()> = std::result::Result<T, String>;

pub(crate) type Outcome = Step<HashMap<Id, NodeModification>>;

/// Rejection reason of a failed value condition.
pub(crate) const UNEXPECTED_VALUE: &str = "Unexpected value";

pub(crate) struct TreeManipulator<'a> {
    base: &'a HashMap<Id, Node>,
    command: &'a SignalCommand,
    updated: HashMap<Id, Node>,
    detached: HashSet<Id>,
    sub_results: CommandResults,
    merged: Option<HashMap<Id, NodeModification>>,
}

impl<'a> TreeManipulator<'a> {
    pub(crate) fn new(base: &'a HashMap<Id, Node>, command: &'a SignalCommand) -> Self {
        Self {
            base,
            command,
            updated: HashMap::new(),
            detached: HashSet::new(),
            sub_results: CommandResults::new(),
            merged: None,
        }
    }

    /// Evaluate the command. Returns the modifications (or the rejection
    /// reason) together with the results of any sub-commands.
    pub(crate) fn run(mut self) -> (Outcome, CommandResults) {
        let command = self.command;
        let outcome = self.handle(command).map(|()| self.collect_updates());
        (outcome, self.sub_results)
    }

    fn command_id(&self) -> Id {
        self.command.command_id()
    }

    fn resolve_alias(&self, id: Id) -> Id {
        match self.updated.get(&id).or_else(|| self.base.get(&id)) {
            Some(Node::Alias(alias)) => alias.target,
            _ => id,
        }
    }

    fn data(&self, id: Id) -> Option<&Data> {
        let id = self.resolve_alias(id);
        if self.detached.contains(&id) {
            return None;
        }
        match self.updated.get(&id) {
            Some(node) => node.as_data(),
            None => self.base.get(&id).and_then(Node::as_data),
        }
    }

    fn require(&self, id: Id) -> Step<(Id, Data)> {
        let id = self.resolve_alias(id);
        self.data(id)
            .cloned()
            .map(|data| (id, data))
            .ok_or_else(|| "Node not found".to_string())
    }

    fn is_same_node(&self, a: Option<Id>, b: Id) -> bool {
        a.map(|a| self.resolve_alias(a)) == Some(self.resolve_alias(b))
    }

    fn map_child(&self, id: Id, key: &str) -> Option<Id> {
        self.data(id)
            .and_then(|data| data.map_children.get(key).copied())
    }

    fn set_value(&mut self, id: Id, value: Value) -> Step {
        let (id, mut data) = self.require(id)?;
        data.last_update = self.command_id();
        data.value = value;
        self.updated.insert(id, Node::Data(data));
        Ok(())
    }

    fn detach(&mut self, id: Id) -> Step {
        let (id, node) = self.require(id)?;
        if id == Id::ZERO {
            return Err("Cannot detach the root".to_string());
        }
        let parent_id = node
            .parent
            .ok_or_else(|| "Node is not attached".to_string())?;
        let (parent_id, mut parent) = self.require(parent_id)?;

        match parent.key_of(id).map(str::to_owned) {
            Some(key) => {
                parent.map_children.shift_remove(&key);
            }
            None => parent.list_children.retain(|child| *child != id),
        }
        parent.last_update = self.command_id();

        self.updated.insert(parent_id, Node::Data(parent));
        self.detached.insert(id);
        Ok(())
    }

    fn attach(
        &mut self,
        parent_id: Id,
        child_id: Id,
        attacher: impl FnOnce(&mut Data, Id) -> Step,
    ) -> Step {
        let child_id = self.resolve_alias(child_id);
        if !self.detached.contains(&child_id) {
            return Err("Node is not detached".to_string());
        }

        let mut ancestor = Some(self.resolve_alias(parent_id));
        while let Some(id) = ancestor {
            if id == child_id {
                return Err("Cannot attach to own descendant".to_string());
            }
            ancestor = self.data(id).and_then(|data| data.parent);
        }

        let (parent_id, mut parent) = self.require(parent_id)?;
        self.detached.remove(&child_id);

        attacher(&mut parent, child_id)?;
        parent.last_update = self.command_id();

        let (_, mut child) = self.require(child_id)?;
        child.parent = Some(parent_id);

        self.updated.insert(parent_id, Node::Data(parent));
        self.updated.insert(child_id, Node::Data(child));
        Ok(())
    }

    fn attach_as(&mut self, parent_id: Id, key: &str, child_id: Id) -> Step {
        self.attach(parent_id, child_id, |parent, child| {
            if parent.map_children.contains_key(key) {
                return Err("Key is in use".to_string());
            }
            parent.map_children.insert(key.to_string(), child);
            Ok(())
        })
    }

    fn attach_at(&mut self, parent_id: Id, position: ListPosition, child_id: Id) -> Step {
        let after = position.after.map(|id| self.resolve_alias(id));
        let before = position.before.map(|id| self.resolve_alias(id));

        self.attach(parent_id, child_id, |parent, child| {
            let index = find_insert_index(&parent.list_children, after, before)
                .ok_or_else(|| "Insert position not matched".to_string())?;
            parent.list_children.insert(index, child);
            Ok(())
        })
    }

    fn create_node(&mut self, id: Id, value: Value, scope_owner: Option<Id>) -> Step {
        if self.data(id).is_some() {
            return Err("Node already exists".to_string());
        }

        // Detached nodes are eligible for attaching
        self.detached.insert(id);
        self.updated.insert(
            id,
            Node::Data(Data::new(self.command_id(), scope_owner, value)),
        );
        Ok(())
    }

    /// Whether `id` is reachable from the root through nodes that are still
    /// attached in the overlay.
    fn is_attached(&self, id: Id) -> bool {
        let mut current = Some(id);
        while let Some(id) = current {
            if id == Id::ZERO {
                return true;
            }
            match self.data(id) {
                Some(data) => current = data.parent,
                None => return false,
            }
        }
        false
    }

    fn handle(&mut self, command: &SignalCommand) -> Step {
        match command {
            SignalCommand::ValueCondition {
                target_node_id,
                expected_value,
                ..
            } => {
                let value = self
                    .data(*target_node_id)
                    .map(|data| data.value.clone())
                    .unwrap_or(Value::Null);
                check(values_equal(&value, expected_value), UNEXPECTED_VALUE)
            }

            SignalCommand::PositionCondition {
                target_node_id,
                child_id,
                position,
                ..
            } => self.check_position(*target_node_id, *child_id, *position),

            SignalCommand::KeyCondition {
                target_node_id,
                key,
                expected_child,
                ..
            } => {
                let actual = self.map_child(*target_node_id, key);
                match expected_child {
                    None => check(actual.is_some(), "Key not present"),
                    Some(Id::ZERO) => check(actual.is_none(), "A key is present"),
                    Some(expected) => {
                        check(self.is_same_node(actual, *expected), "Unexpected child")
                    }
                }
            }

            SignalCommand::LastUpdateCondition {
                target_node_id,
                expected_last_update,
                ..
            } => {
                let last_update = self.data(*target_node_id).map(|data| data.last_update);
                check(
                    last_update == Some(*expected_last_update),
                    "Unexpected last update",
                )
            }

            SignalCommand::AdoptAt {
                target_node_id,
                child_id,
                position,
                ..
            } => {
                self.detach(*child_id)?;
                self.attach_at(*target_node_id, *position, *child_id)
            }

            SignalCommand::AdoptAs {
                target_node_id,
                child_id,
                key,
                ..
            } => {
                self.detach(*child_id)?;
                self.attach_as(*target_node_id, key, *child_id)
            }

            SignalCommand::Increment {
                target_node_id,
                delta,
                ..
            } => {
                let current = match self.data(*target_node_id).map(|data| &data.value) {
                    None | Some(Value::Null) => 0.0,
                    Some(Value::Number(number)) => number.as_f64().unwrap_or(0.0),
                    Some(_) => return Err("Value is not numeric".to_string()),
                };
                let value = serde_json::Number::from_f64(current + delta)
                    .map(Value::Number)
                    .ok_or_else(|| "Value is not a finite number".to_string())?;
                self.set_value(*target_node_id, value)
            }

            SignalCommand::Clear { target_node_id, .. } => {
                let (id, mut data) = self.require(*target_node_id)?;
                self.detached.extend(data.children());
                if self.detached.is_empty() {
                    return Ok(());
                }

                data.list_children.clear();
                data.map_children.clear();
                data.last_update = self.command_id();
                self.updated.insert(id, Node::Data(data));
                Ok(())
            }

            SignalCommand::RemoveByKey {
                target_node_id,
                key,
                ..
            } => match self.map_child(*target_node_id, key) {
                Some(child) => self.detach(child),
                None => Err("Key not present".to_string()),
            },

            SignalCommand::Put {
                command_id,
                target_node_id,
                key,
                value,
            } => match self.map_child(*target_node_id, key) {
                Some(child) => self.set_value(child, value.clone()),
                None => {
                    self.create_node(*command_id, value.clone(), None)?;
                    self.attach_as(*target_node_id, key, *command_id)
                }
            },

            SignalCommand::PutIfAbsent {
                command_id,
                target_node_id,
                scope_owner,
                key,
                value,
            } => match self.map_child(*target_node_id, key) {
                Some(child) => {
                    if self.data(*command_id).is_some() {
                        return Err("Node already exists".to_string());
                    }
                    let target = self.resolve_alias(child);
                    self.updated
                        .insert(*command_id, Node::Alias(Alias { target }));
                    Ok(())
                }
                None => {
                    self.create_node(*command_id, value.clone(), *scope_owner)?;
                    self.attach_as(*target_node_id, key, *command_id)
                }
            },

            SignalCommand::Insert {
                command_id,
                target_node_id,
                scope_owner,
                value,
                position,
            } => {
                self.create_node(*command_id, value.clone(), *scope_owner)?;
                self.attach_at(*target_node_id, *position, *command_id)
            }

            SignalCommand::Set {
                target_node_id,
                value,
                ..
            } => self.set_value(*target_node_id, value.clone()),

            SignalCommand::Remove {
                target_node_id,
                expected_parent_id,
                ..
            } => {
                if let Some(expected) = expected_parent_id {
                    let parent = self.data(*target_node_id).and_then(|data| data.parent);
                    if !self.is_same_node(parent, *expected) {
                        return Err("Not a child".to_string());
                    }
                }
                self.detach(*target_node_id)
            }

            SignalCommand::ClearOwner { owner_id, .. } => {
                let mut owned: Vec<Id> = self
                    .base
                    .iter()
                    .filter_map(|(id, node)| {
                        node.as_data()
                            .filter(|data| data.scope_owner == Some(*owner_id))
                            .map(|_| *id)
                    })
                    .collect();
                owned.sort();

                for id in owned {
                    // Descendants of an already removed owned node go away with it
                    if self.is_attached(id) {
                        self.detach(id)?;
                    }
                }
                Ok(())
            }

            SignalCommand::Snapshot { nodes, .. } => {
                self.updated
                    .extend(nodes.iter().map(|(id, node)| (*id, node.clone())));
                Ok(())
            }

            SignalCommand::Transaction { commands, .. } => {
                self.merged = Some(self.handle_transaction(commands)?);
                Ok(())
            }
        }
    }

    fn check_position(&self, target: Id, child: Id, position: ListPosition) -> Step {
        let child = self.resolve_alias(child);
        let children: &[Id] = self
            .data(target)
            .map(|data| data.list_children.as_slice())
            .unwrap_or(&[]);
        let index = children
            .iter()
            .position(|id| *id == child)
            .ok_or_else(|| "Not a child".to_string())?;

        let child_at = |index: Option<usize>, expected: Id| {
            let actual = index.and_then(|index| children.get(index)).copied();
            self.is_same_node(actual, expected)
        };

        match position.after {
            Some(Id::EDGE) if index != 0 => return Err("Not the first child".to_string()),
            Some(Id::EDGE) | None => {}
            Some(after) => {
                if !child_at(index.checked_sub(1), after) {
                    return Err("Not after the provided child".to_string());
                }
            }
        }

        match position.before {
            Some(Id::EDGE) if index + 1 != children.len() => {
                Err("Not the last child".to_string())
            }
            Some(Id::EDGE) | None => Ok(()),
            Some(before) => check(
                child_at(Some(index + 1), before),
                "Not before the provided child",
            ),
        }
    }

    fn handle_transaction(&mut self, commands: &[SignalCommand]) -> Outcome {
        let mut scratchpad = MutableTreeRevision::from_nodes(self.base.clone());

        let mut first_reject = None;
        for command in commands {
            let results = scratchpad.apply(command);
            let own = results.get(&command.command_id()).cloned();
            self.sub_results.extend(results);

            if let Some(CommandResult::Reject { reason }) = own {
                first_reject = Some(reason);
                break;
            }
        }

        if let Some(reason) = first_reject {
            for command in commands {
                let replace = !matches!(
                    self.sub_results.get(&command.command_id()),
                    Some(CommandResult::Reject { .. })
                );
                if replace {
                    self.sub_results
                        .insert(command.command_id(), CommandResult::fail(reason.clone()));
                }
            }
            for result in self.sub_results.values_mut() {
                if result.is_accepted() {
                    *result = CommandResult::fail(reason.clone());
                }
            }
            return Err(reason);
        }

        // Merge in command order so the first old and the last new state win
        let mut updates: HashMap<Id, NodeModification> = HashMap::new();
        for command in commands {
            if let Some(CommandResult::Accept { updates: step }) =
                self.sub_results.get(&command.command_id())
            {
                for (id, modification) in step {
                    updates
                        .entry(*id)
                        .and_modify(|existing| existing.new = modification.new.clone())
                        .or_insert_with(|| modification.clone());
                }
            }
        }
        updates.retain(|_, modification| modification.old != modification.new);
        Ok(updates)
    }

    fn collect_updates(&mut self) -> HashMap<Id, NodeModification> {
        if let Some(merged) = self.merged.take() {
            return merged;
        }

        let mut updates: HashMap<Id, NodeModification> = self
            .updated
            .iter()
            .filter(|(id, _)| !self.detached.contains(id))
            .map(|(id, node)| {
                let modification = NodeModification {
                    old: self.base.get(id).cloned(),
                    new: Some(node.clone()),
                };
                (*id, modification)
            })
            .collect();

        if self.detached.is_empty() {
            return updates;
        }

        let mut reverse_aliases: HashMap<Id, Vec<Id>> = HashMap::new();
        for (id, node) in self.base {
            if let Some(target) = node.alias_target() {
                reverse_aliases.entry(target).or_default().push(*id);
            }
        }

        let mut to_remove: Vec<Id> = self.detached.iter().copied().collect();
        while let Some(removed) = to_remove.pop() {
            for id in std::iter::once(removed)
                .chain(reverse_aliases.get(&removed).into_iter().flatten().copied())
            {
                updates.insert(
                    id,
                    NodeModification {
                        old: self.base.get(&id).cloned(),
                        new: None,
                    },
                );
            }

            if let Some(data) = self.base.get(&removed).and_then(Node::as_data) {
                to_remove.extend(data.children());
            }
        }

        updates
    }
}

fn check(condition: bool, reason: &str) -> Step {
    if condition {
        Ok(())
    } else {
        Err(reason.to_string())
    }
}

/// Finds the index for inserting between `after` and `before`. `after` wins
/// when both are given; `before` must then match the node at that index.
fn find_insert_index(children: &[Id], after: Option<Id>, before: Option<Id>) -> Option<usize> {
    match after {
        Some(after) => {
            let index = if after == Id::EDGE {
                0
            } else {
                children.iter().position(|id| *id == after)? + 1
            };

            if let Some(before) = before {
                let at_index = children.get(index).copied().unwrap_or(Id::EDGE);
                if at_index != before {
                    return None;
                }
            }
            Some(index)
        }
        None => match before? {
            Id::EDGE => Some(children.len()),
            before => children.iter().position(|id| *id == before),
        },
    }
}

/// JSON equality that compares numbers by value, so `2` matches `2.0`.
pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(key, a)| b.get(key).is_some_and(|b| values_equal(a, b)))
        }
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixture {
        tree: MutableTreeRevision,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                tree: MutableTreeRevision::new(),
            }
        }

        fn apply(&mut self, command: SignalCommand) -> CommandResult {
            let id = command.command_id();
            let mut results = self.tree.apply(&command);
            results.remove(&id).unwrap()
        }

        fn accept(&mut self, command: SignalCommand) {
            let result = self.apply(command);
            assert!(result.is_accepted(), "{result:?}");
        }

        fn reject(&mut self, command: SignalCommand, reason: &str) {
            let result = self.apply(command);
            assert_eq!(result.reject_reason(), Some(reason));
        }

        fn insert(&mut self, parent: Id, value: Value, position: ListPosition) -> Id {
            let id = Id::random();
            self.accept(SignalCommand::Insert {
                command_id: id,
                target_node_id: parent,
                scope_owner: None,
                value,
                position,
            });
            id
        }

        fn put(&mut self, parent: Id, key: &str, value: Value) -> Id {
            let id = Id::random();
            self.accept(SignalCommand::Put {
                command_id: id,
                target_node_id: parent,
                key: key.to_string(),
                value,
            });
            id
        }

        fn list(&self, id: Id) -> Vec<Id> {
            self.tree.data(id).unwrap().list_children.clone()
        }

        fn value(&self, id: Id) -> Value {
            self.tree.data(id).unwrap().value.clone()
        }
    }

    #[test]
    fn set_updates_value_and_last_update() {
        let mut fixture = Fixture::new();
        let command = SignalCommand::Set {
            command_id: Id::random(),
            target_node_id: Id::ZERO,
            value: json!("hello"),
        };
        let command_id = command.command_id();
        fixture.accept(command);

        let root = fixture.tree.data(Id::ZERO).unwrap();
        assert_eq!(root.value, json!("hello"));
        assert_eq!(root.last_update, command_id);
    }

    #[test]
    fn insert_positions() {
        let mut fixture = Fixture::new();
        let b = fixture.insert(Id::ZERO, json!("b"), ListPosition::last());
        let a = fixture.insert(Id::ZERO, json!("a"), ListPosition::first());
        let d = fixture.insert(Id::ZERO, json!("d"), ListPosition::last());
        let c = fixture.insert(Id::ZERO, json!("c"), ListPosition::between(b, d));

        assert_eq!(fixture.list(Id::ZERO), vec![a, b, c, d]);
    }

    #[test]
    fn insert_rejects_unmatched_position() {
        let mut fixture = Fixture::new();
        let a = fixture.insert(Id::ZERO, json!("a"), ListPosition::last());
        let b = fixture.insert(Id::ZERO, json!("b"), ListPosition::last());

        fixture.reject(
            SignalCommand::Insert {
                command_id: Id::random(),
                target_node_id: Id::ZERO,
                scope_owner: None,
                value: Value::Null,
                position: ListPosition::between(b, a),
            },
            "Insert position not matched",
        );
        fixture.reject(
            SignalCommand::Insert {
                command_id: Id::random(),
                target_node_id: Id::ZERO,
                scope_owner: None,
                value: Value::Null,
                position: ListPosition::anywhere(),
            },
            "Insert position not matched",
        );
        assert_eq!(fixture.list(Id::ZERO), vec![a, b]);
    }

    #[test]
    fn insert_with_existing_id_is_rejected() {
        let mut fixture = Fixture::new();
        let a = fixture.insert(Id::ZERO, json!("a"), ListPosition::last());

        fixture.reject(
            SignalCommand::Insert {
                command_id: a,
                target_node_id: Id::ZERO,
                scope_owner: None,
                value: Value::Null,
                position: ListPosition::last(),
            },
            "Node already exists",
        );
    }

    #[test]
    fn put_updates_existing_child() {
        let mut fixture = Fixture::new();
        let child = fixture.put(Id::ZERO, "key", json!(1));
        fixture.accept(SignalCommand::Put {
            command_id: Id::random(),
            target_node_id: Id::ZERO,
            key: "key".to_string(),
            value: json!(2),
        });

        let root = fixture.tree.data(Id::ZERO).unwrap();
        assert_eq!(root.map_children.len(), 1);
        assert_eq!(fixture.value(child), json!(2));
    }

    #[test]
    fn put_if_absent_creates_alias_for_existing_key() {
        let mut fixture = Fixture::new();
        let child = fixture.put(Id::ZERO, "key", json!("first"));

        let alias = Id::random();
        fixture.accept(SignalCommand::PutIfAbsent {
            command_id: alias,
            target_node_id: Id::ZERO,
            scope_owner: None,
            key: "key".to_string(),
            value: json!("second"),
        });

        assert_eq!(fixture.tree.resolve_alias(alias), child);
        assert_eq!(fixture.value(alias), json!("first"));

        // Writes through the alias land on the target
        fixture.accept(SignalCommand::Set {
            command_id: Id::random(),
            target_node_id: alias,
            value: json!("third"),
        });
        assert_eq!(fixture.value(child), json!("third"));
    }

    #[test]
    fn removing_a_node_removes_subtree_and_aliases() {
        let mut fixture = Fixture::new();
        let parent = fixture.put(Id::ZERO, "parent", Value::Null);
        let child = fixture.insert(parent, json!(1), ListPosition::last());
        let alias = Id::random();
        fixture.accept(SignalCommand::PutIfAbsent {
            command_id: alias,
            target_node_id: Id::ZERO,
            scope_owner: None,
            key: "parent".to_string(),
            value: Value::Null,
        });

        fixture.accept(SignalCommand::RemoveByKey {
            command_id: Id::random(),
            target_node_id: Id::ZERO,
            key: "parent".to_string(),
        });

        let nodes = fixture.tree.nodes();
        assert!(!nodes.contains_key(&parent));
        assert!(!nodes.contains_key(&child));
        assert!(!nodes.contains_key(&alias));
        assert!(fixture.tree.data(Id::ZERO).unwrap().map_children.is_empty());
    }

    #[test]
    fn remove_checks_expected_parent() {
        let mut fixture = Fixture::new();
        let a = fixture.put(Id::ZERO, "a", Value::Null);
        let child = fixture.insert(a, Value::Null, ListPosition::last());

        fixture.reject(
            SignalCommand::Remove {
                command_id: Id::random(),
                target_node_id: child,
                expected_parent_id: Some(Id::ZERO),
            },
            "Not a child",
        );
        fixture.accept(SignalCommand::Remove {
            command_id: Id::random(),
            target_node_id: child,
            expected_parent_id: Some(a),
        });
        assert!(fixture.list(a).is_empty());
    }

    #[test]
    fn root_cannot_be_removed() {
        let mut fixture = Fixture::new();
        fixture.reject(
            SignalCommand::Remove {
                command_id: Id::random(),
                target_node_id: Id::ZERO,
                expected_parent_id: None,
            },
            "Cannot detach the root",
        );
    }

    #[test]
    fn adopt_moves_node_between_parents() {
        let mut fixture = Fixture::new();
        let list = fixture.put(Id::ZERO, "list", Value::Null);
        let item = fixture.insert(list, json!("item"), ListPosition::last());

        fixture.accept(SignalCommand::AdoptAs {
            command_id: Id::random(),
            target_node_id: Id::ZERO,
            child_id: item,
            key: "moved".to_string(),
        });

        assert!(fixture.list(list).is_empty());
        let root = fixture.tree.data(Id::ZERO).unwrap();
        assert_eq!(root.map_children.get("moved"), Some(&item));
        assert_eq!(fixture.tree.data(item).unwrap().parent, Some(Id::ZERO));
    }

    #[test]
    fn adopt_into_own_descendant_is_rejected() {
        let mut fixture = Fixture::new();
        let parent = fixture.put(Id::ZERO, "parent", Value::Null);
        let child = fixture.insert(parent, Value::Null, ListPosition::last());

        fixture.reject(
            SignalCommand::AdoptAt {
                command_id: Id::random(),
                target_node_id: child,
                child_id: parent,
                position: ListPosition::last(),
            },
            "Cannot attach to own descendant",
        );
        assert_eq!(fixture.list(parent), vec![child]);
    }

    #[test]
    fn adopt_within_same_list_reorders() {
        let mut fixture = Fixture::new();
        let a = fixture.insert(Id::ZERO, json!("a"), ListPosition::last());
        let b = fixture.insert(Id::ZERO, json!("b"), ListPosition::last());
        let c = fixture.insert(Id::ZERO, json!("c"), ListPosition::last());

        fixture.accept(SignalCommand::AdoptAt {
            command_id: Id::random(),
            target_node_id: Id::ZERO,
            child_id: c,
            position: ListPosition::first(),
        });
        assert_eq!(fixture.list(Id::ZERO), vec![c, a, b]);
    }

    #[test]
    fn increment_handles_null_and_non_numeric() {
        let mut fixture = Fixture::new();
        let counter = fixture.put(Id::ZERO, "counter", Value::Null);
        fixture.accept(SignalCommand::Increment {
            command_id: Id::random(),
            target_node_id: counter,
            delta: 2.0,
        });
        fixture.accept(SignalCommand::Increment {
            command_id: Id::random(),
            target_node_id: counter,
            delta: 0.5,
        });
        assert_eq!(fixture.value(counter), json!(2.5));

        let text = fixture.put(Id::ZERO, "text", json!("x"));
        fixture.reject(
            SignalCommand::Increment {
                command_id: Id::random(),
                target_node_id: text,
                delta: 1.0,
            },
            "Value is not numeric",
        );
    }

    #[test]
    fn clear_removes_all_children() {
        let mut fixture = Fixture::new();
        let a = fixture.insert(Id::ZERO, Value::Null, ListPosition::last());
        let b = fixture.put(Id::ZERO, "b", Value::Null);

        fixture.accept(SignalCommand::Clear {
            command_id: Id::random(),
            target_node_id: Id::ZERO,
        });

        let root = fixture.tree.data(Id::ZERO).unwrap();
        assert!(root.list_children.is_empty());
        assert!(root.map_children.is_empty());
        assert!(fixture.tree.data(a).is_none());
        assert!(fixture.tree.data(b).is_none());
    }

    #[test]
    fn clear_owner_removes_owned_nodes() {
        let mut fixture = Fixture::new();
        let owner = Id::random();
        let owned = Id::random();
        fixture.accept(SignalCommand::Insert {
            command_id: owned,
            target_node_id: Id::ZERO,
            scope_owner: Some(owner),
            value: Value::Null,
            position: ListPosition::last(),
        });
        let nested = Id::random();
        fixture.accept(SignalCommand::Insert {
            command_id: nested,
            target_node_id: owned,
            scope_owner: Some(owner),
            value: Value::Null,
            position: ListPosition::last(),
        });
        let other = fixture.insert(Id::ZERO, Value::Null, ListPosition::last());

        fixture.accept(SignalCommand::ClearOwner {
            command_id: Id::random(),
            owner_id: owner,
        });

        assert_eq!(fixture.list(Id::ZERO), vec![other]);
        assert!(!fixture.tree.nodes().contains_key(&nested));
    }

    #[test]
    fn conditions() {
        let mut fixture = Fixture::new();
        let a = fixture.insert(Id::ZERO, json!(2), ListPosition::last());
        let b = fixture.insert(Id::ZERO, Value::Null, ListPosition::last());
        let keyed = fixture.put(Id::ZERO, "key", Value::Null);

        fixture.accept(SignalCommand::ValueCondition {
            command_id: Id::random(),
            target_node_id: a,
            expected_value: json!(2.0),
        });
        fixture.reject(
            SignalCommand::ValueCondition {
                command_id: Id::random(),
                target_node_id: a,
                expected_value: json!(3),
            },
            "Unexpected value",
        );

        fixture.accept(SignalCommand::PositionCondition {
            command_id: Id::random(),
            target_node_id: Id::ZERO,
            child_id: a,
            position: ListPosition::between(Id::EDGE, b),
        });
        fixture.reject(
            SignalCommand::PositionCondition {
                command_id: Id::random(),
                target_node_id: Id::ZERO,
                child_id: a,
                position: ListPosition::last(),
            },
            "Not the last child",
        );

        fixture.accept(SignalCommand::KeyCondition {
            command_id: Id::random(),
            target_node_id: Id::ZERO,
            key: "key".to_string(),
            expected_child: Some(keyed),
        });
        fixture.reject(
            SignalCommand::KeyCondition {
                command_id: Id::random(),
                target_node_id: Id::ZERO,
                key: "key".to_string(),
                expected_child: Some(Id::ZERO),
            },
            "A key is present",
        );
        fixture.reject(
            SignalCommand::KeyCondition {
                command_id: Id::random(),
                target_node_id: Id::ZERO,
                key: "missing".to_string(),
                expected_child: None,
            },
            "Key not present",
        );

        let last_update = fixture.tree.data(a).unwrap().last_update;
        fixture.accept(SignalCommand::LastUpdateCondition {
            command_id: Id::random(),
            target_node_id: a,
            expected_last_update: last_update,
        });
    }

    #[test]
    fn transaction_is_all_or_nothing() {
        let mut fixture = Fixture::new();
        let inserted = Id::random();
        let failing = Id::random();
        let transaction = SignalCommand::Transaction {
            command_id: Id::random(),
            commands: vec![
                SignalCommand::Insert {
                    command_id: inserted,
                    target_node_id: Id::ZERO,
                    scope_owner: None,
                    value: json!(1),
                    position: ListPosition::last(),
                },
                SignalCommand::ValueCondition {
                    command_id: failing,
                    target_node_id: Id::ZERO,
                    expected_value: json!("nope"),
                },
            ],
        };
        let transaction_id = transaction.command_id();

        let results = fixture.tree.apply(&transaction);

        assert_eq!(results[&transaction_id].reject_reason(), Some("Unexpected value"));
        assert_eq!(results[&inserted].reject_reason(), Some("Unexpected value"));
        assert_eq!(results[&failing].reject_reason(), Some("Unexpected value"));
        assert!(fixture.list(Id::ZERO).is_empty());
    }

    #[test]
    fn transaction_merges_updates() {
        let mut fixture = Fixture::new();
        let first = Id::random();
        let second = Id::random();
        let transaction = SignalCommand::Transaction {
            command_id: Id::random(),
            commands: vec![
                SignalCommand::Set {
                    command_id: first,
                    target_node_id: Id::ZERO,
                    value: json!(1),
                },
                SignalCommand::Set {
                    command_id: second,
                    target_node_id: Id::ZERO,
                    value: json!(2),
                },
            ],
        };
        let transaction_id = transaction.command_id();
        let results = fixture.tree.apply(&transaction);

        let CommandResult::Accept { updates } = &results[&transaction_id] else {
            panic!("transaction rejected");
        };
        let root = &updates[&Id::ZERO];
        assert_eq!(root.old.as_ref().and_then(Node::as_data).unwrap().value, Value::Null);
        assert_eq!(root.new.as_ref().and_then(Node::as_data).unwrap().value, json!(2));
        assert!(results[&first].is_accepted());
        assert_eq!(fixture.value(Id::ZERO), json!(2));
    }

    #[test]
    fn snapshot_loads_nodes() {
        let mut source = Fixture::new();
        let child = source.put(Id::ZERO, "key", json!("value"));

        let mut target = Fixture::new();
        target.accept(SignalCommand::Snapshot {
            command_id: Id::random(),
            nodes: source.tree.nodes().clone(),
        });

        assert_eq!(target.value(child), json!("value"));
        assert_eq!(target.tree.nodes(), source.tree.nodes());
    }

    #[test]
    fn numbers_compare_by_value() {
        assert!(values_equal(&json!(2), &json!(2.0)));
        assert!(values_equal(&json!({"a": [1]}), &json!({"a": [1.0]})));
        assert!(!values_equal(&json!(1), &json!("1")));
    }
}
