//! Signal Factories
//!
//! Factories hand out signals by name. A shared factory keeps one tree per
//! name, so every caller asking for the same name sees the same data, no
//! matter which typed view it asks for. An exclusive factory creates a new
//! tree on every call.

use std::sync::OnceLock;

use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::operation::OperationError;
use crate::signals::{ListSignal, MapSignal, NodeSignal, NumberSignal, SignalValue, ValueSignal};
use crate::transaction::Transaction;

/// Source of named signals.
pub trait SignalFactory: Send + Sync {
    /// The node stored under `name`.
    fn node(&self, name: &str) -> NodeSignal;

    /// Forget the signal stored under `name`.
    fn remove(&self, name: &str);

    /// Forget all signals.
    fn clear(&self);

    /// A value signal under `name`, set to `default` unless it already has
    /// a value.
    fn value<T: SignalValue>(&self, name: &str, default: T) -> Result<ValueSignal<T>>
    where
        Self: Sized,
    {
        let node = self.node(name);
        write_default(&node, name, serde_json::to_value(&default)?)?;
        Ok(node.as_value())
    }

    /// A number signal under `name`, set to `default` unless it already has
    /// a value.
    fn number(&self, name: &str, default: f64) -> Result<NumberSignal>
    where
        Self: Sized,
    {
        let node = self.node(name);
        write_default(&node, name, serde_json::to_value(default)?)?;
        Ok(node.as_number())
    }

    fn list<T: SignalValue>(&self, name: &str) -> ListSignal<T>
    where
        Self: Sized,
    {
        self.node(name).as_list()
    }

    fn map<T: SignalValue>(&self, name: &str) -> MapSignal<T>
    where
        Self: Sized,
    {
        self.node(name).as_map()
    }
}

/// Set the value of `node` only if it has none yet.
fn write_default(node: &NodeSignal, name: &str, default: Value) -> Result<()> {
    let operation = Transaction::run_without_transaction(|| {
        node.as_value::<Value>().replace(None, default)
    })?;

    if let Some(Err(OperationError::Rejected(_))) = operation.result() {
        debug!(name, "keeping existing value");
    }
    Ok(())
}

/// Returns the same signal for the same name until it is removed.
#[derive(Default)]
pub struct SharedSignalFactory {
    signals: DashMap<String, NodeSignal>,
}

impl SharedSignalFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered names.
    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}

impl SignalFactory for SharedSignalFactory {
    fn node(&self, name: &str) -> NodeSignal {
        self.signals
            .entry(name.to_string())
            .or_insert_with(NodeSignal::new)
            .clone()
    }

    fn remove(&self, name: &str) {
        self.signals.remove(name);
    }

    fn clear(&self) {
        self.signals.clear();
    }
}

/// Returns a new signal on every call.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExclusiveSignalFactory;

impl SignalFactory for ExclusiveSignalFactory {
    fn node(&self, _name: &str) -> NodeSignal {
        NodeSignal::new()
    }

    fn remove(&self, _name: &str) {}

    fn clear(&self) {}
}

static SHARED: OnceLock<SharedSignalFactory> = OnceLock::new();

/// The process-wide shared factory.
pub fn in_memory_shared() -> &'static SharedSignalFactory {
    SHARED.get_or_init(SharedSignalFactory::new)
}

/// The process-wide exclusive factory.
pub fn in_memory_exclusive() -> &'static ExclusiveSignalFactory {
    static EXCLUSIVE: ExclusiveSignalFactory = ExclusiveSignalFactory;
    &EXCLUSIVE
}
