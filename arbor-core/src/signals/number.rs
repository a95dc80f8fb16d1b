//! Number signals.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{Result, SignalError};
use crate::id::Id;
use crate::operation::{CancelableOperation, OperationError, SignalOperation};
use crate::reactive::UsageKind;
use crate::tree::{SignalCommand, SignalTree, TreeRevision};

use super::{
    modified_value, operation, to_json, update_with_retry, NodeSignal, Signal, SignalCore,
    UpdateFn,
};

/// A signal holding a number. A missing value reads as zero.
///
/// Increments are applied relative to the value at commit time, so
/// concurrent increments never conflict.
#[derive(Clone)]
pub struct NumberSignal {
    core: SignalCore,
}

signal_identity!(NumberSignal);

impl fmt::Debug for NumberSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NumberSignal").field(&self.core).finish()
    }
}

fn number(value: &Value) -> Result<f64> {
    match value {
        Value::Null => Ok(0.0),
        Value::Number(number) => number
            .as_f64()
            .ok_or_else(|| SignalError::TypeMismatch(format!("{number} is not a finite number"))),
        other => Err(SignalError::TypeMismatch(format!("{other} is not a number"))),
    }
}

fn json_number(value: f64) -> Result<Value> {
    to_json(&value)
}

fn number_result(value: &Value) -> std::result::Result<f64, OperationError> {
    number(value).map_err(|error| OperationError::Decode(error.to_string()))
}

impl NumberSignal {
    /// Create a signal in a new synchronous tree.
    pub fn new(initial: f64) -> Result<Self> {
        let tree = SignalTree::synchronous();
        tree.commit_single_command(
            SignalCommand::Set {
                command_id: Id::random(),
                target_node_id: Id::ZERO,
                value: json_number(initial)?,
            },
            None,
        );
        Ok(Self::at(tree, Id::ZERO))
    }

    pub fn at(tree: Arc<SignalTree>, id: Id) -> Self {
        Self::from_core(SignalCore::new(tree, id))
    }

    pub(crate) fn from_core(core: SignalCore) -> Self {
        Self { core }
    }

    /// The value truncated to an integer.
    pub fn value_as_int(&self) -> Result<i64> {
        Ok(self.value()? as i64)
    }

    /// Set the value. The operation resolves with the previous value.
    pub fn set(&self, value: f64) -> Result<SignalOperation<f64>> {
        let target = self.core.read()?.resolve_alias(self.core.id());
        let (operation, handler) =
            operation(move |updates| number_result(&modified_value(updates, target, true)));

        self.core.submit(
            SignalCommand::Set {
                command_id: Id::random(),
                target_node_id: self.core.id(),
                value: json_number(value)?,
            },
            handler,
        )?;
        Ok(operation)
    }

    /// Set the value only if it currently is `expected`.
    pub fn replace(&self, expected: f64, value: f64) -> Result<SignalOperation<()>> {
        self.core.submit_void(SignalCommand::transaction(vec![
            SignalCommand::ValueCondition {
                command_id: Id::random(),
                target_node_id: self.core.id(),
                expected_value: json_number(expected)?,
            },
            SignalCommand::Set {
                command_id: Id::random(),
                target_node_id: self.core.id(),
                value: json_number(value)?,
            },
        ]))
    }

    /// Add `delta` to the value. The operation resolves with the value
    /// after the increment, as it was when the increment was applied.
    pub fn increment_by(&self, delta: f64) -> Result<SignalOperation<f64>> {
        let target = self.core.read()?.resolve_alias(self.core.id());
        let (operation, handler) =
            operation(move |updates| number_result(&modified_value(updates, target, false)));

        self.core.submit(
            SignalCommand::Increment {
                command_id: Id::random(),
                target_node_id: self.core.id(),
                delta,
            },
            handler,
        )?;
        Ok(operation)
    }

    /// Replace the value with `updater(current)`, retrying on conflicts.
    /// Resolves with the value that was replaced.
    pub fn update(
        &self,
        updater: impl Fn(f64) -> f64 + Send + Sync + 'static,
    ) -> Result<CancelableOperation<f64>> {
        let compute: UpdateFn<f64> = Arc::new(move |current| {
            let current = number(current)?;
            Ok((json_number(updater(current))?, current))
        });

        let operation = CancelableOperation::new();
        update_with_retry(self.core.clone(), compute, operation.clone())?;
        Ok(operation)
    }

    pub fn verify_value(&self, expected: f64) -> Result<SignalOperation<()>> {
        self.core.submit_void(SignalCommand::ValueCondition {
            command_id: Id::random(),
            target_node_id: self.core.id(),
            expected_value: json_number(expected)?,
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

impl Signal for NumberSignal {
    type Value = f64;

    fn core(&self) -> &SignalCore {
        &self.core
    }

    fn usage_kind(&self) -> UsageKind {
        UsageKind::Value
    }

    fn extract(&self, revision: &TreeRevision) -> Result<f64> {
        match revision.data(self.core.id()) {
            Some(data) => number(&data.value),
            None => Ok(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Transaction;

    #[test]
    fn missing_value_reads_as_zero() {
        let signal = NumberSignal::at(SignalTree::synchronous(), Id::ZERO);
        assert_eq!(signal.value().unwrap(), 0.0);
        assert_eq!(signal.value_as_int().unwrap(), 0);
    }

    #[test]
    fn increment_resolves_with_new_value() {
        let signal = NumberSignal::new(1.5).unwrap();
        let operation = signal.increment_by(2.0).unwrap();

        assert_eq!(operation.result(), Some(Ok(3.5)));
        assert_eq!(signal.value_as_int().unwrap(), 3);
    }

    #[test]
    fn set_resolves_with_previous_value() {
        let signal = NumberSignal::new(4.0).unwrap();
        assert_eq!(signal.set(7.0).unwrap().result(), Some(Ok(4.0)));
        assert_eq!(signal.peek().unwrap(), 7.0);
    }

    #[test]
    fn integer_and_float_values_compare_equal() {
        let signal = NumberSignal::new(2.0).unwrap();
        signal.increment_by(1.0).unwrap();

        assert!(signal.replace(3.0, 4.0).unwrap().is_success());
        assert!(signal.verify_value(4.0).unwrap().is_success());
    }

    #[test]
    fn increments_in_transaction_apply_to_committed_value() {
        let signal = NumberSignal::new(0.0).unwrap();

        let (in_transaction, direct) = Transaction::run_in_transaction(|| {
            let first = signal.increment_by(1.0).unwrap();
            let direct =
                Transaction::run_without_transaction(|| signal.increment_by(2.0).unwrap());
            (first, direct)
        })
        .into_value();

        assert_eq!(direct.result(), Some(Ok(2.0)));
        assert_eq!(in_transaction.result(), Some(Ok(3.0)));
        assert_eq!(signal.value().unwrap(), 3.0);
    }

    #[test]
    fn update_doubles_value() {
        let signal = NumberSignal::new(21.0).unwrap();
        let operation = signal.update(|value| value * 2.0).unwrap();

        assert_eq!(operation.result(), Some(Ok(21.0)));
        assert_eq!(signal.value().unwrap(), 42.0);
    }
}
