//! Map signals.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::Result;
use crate::id::Id;
use crate::operation::{InsertOperation, SignalOperation};
use crate::reactive::UsageKind;
use crate::tree::{SignalCommand, SignalTree, TreeRevision};

use super::{to_json, NodeSignal, Signal, SignalCore, SignalValue, ValueSignal};

/// A signal whose value is a string-keyed map of child value signals, in
/// insertion order.
pub struct MapSignal<T> {
    core: SignalCore,
    _value: PhantomData<fn() -> T>,
}

impl<T> Clone for MapSignal<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            _value: PhantomData,
        }
    }
}

signal_identity!(MapSignal<T>);

impl<T> fmt::Debug for MapSignal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MapSignal").field(&self.core).finish()
    }
}

impl<T: SignalValue> MapSignal<T> {
    /// Create an empty map in a new synchronous tree.
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

    /// Set the value under `key`, creating the entry if needed.
    pub fn put(&self, key: impl Into<String>, value: T) -> Result<SignalOperation<()>> {
        self.core.submit_void(SignalCommand::Put {
            command_id: Id::random(),
            target_node_id: self.core.id(),
            key: key.into(),
            value: to_json(&value)?,
        })
    }

    /// Create an entry under `key` unless one exists.
    ///
    /// The returned signal refers to the entry under `key` in both cases:
    /// either the new node, or an alias of the existing one.
    pub fn put_if_absent(
        &self,
        key: impl Into<String>,
        value: T,
    ) -> Result<InsertOperation<ValueSignal<T>>> {
        let command_id = Id::random();
        let operation = self.core.submit_void(SignalCommand::PutIfAbsent {
            command_id,
            target_node_id: self.core.id(),
            scope_owner: None,
            key: key.into(),
            value: to_json(&value)?,
        })?;
        Ok(InsertOperation::new(self.child(command_id), operation))
    }

    /// Remove the entry under `key`. Rejected if there is none.
    pub fn remove(&self, key: impl Into<String>) -> Result<SignalOperation<()>> {
        self.core.submit_void(SignalCommand::RemoveByKey {
            command_id: Id::random(),
            target_node_id: self.core.id(),
            key: key.into(),
        })
    }

    /// Remove all entries.
    pub fn clear(&self) -> Result<SignalOperation<()>> {
        self.core.submit_void(SignalCommand::Clear {
            command_id: Id::random(),
            target_node_id: self.core.id(),
        })
    }

    /// A condition that passes only if `key` maps to `child`.
    pub fn verify_key(
        &self,
        key: impl Into<String>,
        child: &ValueSignal<T>,
    ) -> Result<SignalOperation<()>> {
        self.key_condition(key.into(), Some(child.id()))
    }

    /// A condition that passes only if some entry exists under `key`.
    pub fn verify_has_key(&self, key: impl Into<String>) -> Result<SignalOperation<()>> {
        self.key_condition(key.into(), None)
    }

    /// A condition that passes only if there is no entry under `key`.
    pub fn verify_key_absent(&self, key: impl Into<String>) -> Result<SignalOperation<()>> {
        self.key_condition(key.into(), Some(Id::ZERO))
    }

    fn key_condition(&self, key: String, expected_child: Option<Id>) -> Result<SignalOperation<()>> {
        self.core.submit_void(SignalCommand::KeyCondition {
            command_id: Id::random(),
            target_node_id: self.core.id(),
            key,
            expected_child,
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

    pub fn as_node(&self) -> NodeSignal {
        NodeSignal::from_core(self.core.clone())
    }
}

impl<T: SignalValue> Default for MapSignal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: SignalValue> Signal for MapSignal<T> {
    type Value = IndexMap<String, ValueSignal<T>>;

    fn core(&self) -> &SignalCore {
        &self.core
    }

    fn usage_kind(&self) -> UsageKind {
        UsageKind::MapChildren
    }

    fn extract(&self, revision: &TreeRevision) -> Result<IndexMap<String, ValueSignal<T>>> {
        Ok(revision
            .data(self.core.id())
            .map(|data| {
                data.map_children
                    .iter()
                    .map(|(key, id)| (key.clone(), self.child(*id)))
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationError;

    #[test]
    fn put_creates_then_updates() {
        let map = MapSignal::new();
        map.put("a", 1_i64).unwrap();
        let first = map.value().unwrap()["a"].clone();

        map.put("a", 2).unwrap();

        let entries = map.value().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries["a"], first);
        assert_eq!(first.value().unwrap(), Some(2));
    }

    #[test]
    fn keys_keep_insertion_order() {
        let map = MapSignal::new();
        for key in ["z", "a", "m"] {
            map.put(key, key.to_string()).unwrap();
        }

        let keys: Vec<String> = map.peek().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }

    #[test]
    fn put_if_absent_aliases_existing_entry() {
        let map = MapSignal::new();
        let created = map.put_if_absent("key", "first".to_string()).unwrap();
        let existing = map.put_if_absent("key", "second".to_string()).unwrap();

        assert!(created.operation.is_success());
        assert!(existing.operation.is_success());
        assert_ne!(created.signal.id(), existing.signal.id());
        assert_eq!(existing.signal.value().unwrap(), Some("first".to_string()));

        existing.signal.set("changed".to_string()).unwrap();
        assert_eq!(created.signal.value().unwrap(), Some("changed".to_string()));
        assert!(map.verify_key("key", &existing.signal).unwrap().is_success());
    }

    #[test]
    fn remove_and_clear() {
        let map = MapSignal::new();
        map.put("a", 1_i64).unwrap();
        map.put("b", 2).unwrap();

        assert!(map.remove("a").unwrap().is_success());
        assert!(matches!(
            map.remove("a").unwrap().result(),
            Some(Err(OperationError::Rejected(_)))
        ));

        map.clear().unwrap();
        assert!(map.value().unwrap().is_empty());
    }

    #[test]
    fn key_conditions() {
        let map = MapSignal::new();
        map.put("present", true).unwrap();
        let child = map.value().unwrap()["present"].clone();

        assert!(map.verify_has_key("present").unwrap().is_success());
        assert!(!map.verify_has_key("missing").unwrap().is_success());
        assert!(map.verify_key_absent("missing").unwrap().is_success());
        assert!(!map.verify_key_absent("present").unwrap().is_success());
        assert!(map.verify_key("present", &child).unwrap().is_success());
        assert!(!map.verify_key("missing", &child).unwrap().is_success());
    }
}
