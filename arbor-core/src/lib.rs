//! Arbor Core
//!
//! This crate provides the core of Arbor, a replicated tree of reactive
//! signals. It implements:
//!
//! - Signal trees that apply serializable commands, either locally or
//!   optimistically while a remote authority confirms them
//! - Typed signals (values, numbers, lists, maps, nodes) over tree nodes
//! - Staged and write-through transactions spanning several trees
//! - Dependency tracking, effects and computed values
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `tree`: nodes, commands, revisions and the trees that apply them
//! - `transaction`: thread-local transaction contexts
//! - `reactive`: usage tracking, effects, computed values and dispatchers
//! - `signals`: typed handles onto tree nodes
//! - `factory`: named signal registries
//! - `environment`: process-wide configuration
//!
//! # Example
//!
//! ```rust,ignore
//! use arbor_core::{effect, Signal, Transaction, ValueSignal};
//!
//! // Create a signal
//! let name = ValueSignal::new("World".to_string())?;
//!
//! // Create an effect
//! let greeter = name.clone();
//! let _effect = effect(move || {
//!     println!("Hello, {}!", greeter.value()?.unwrap_or_default());
//!     Ok(())
//! });
//!
//! // Update the signal in a transaction
//! Transaction::run_in_transaction(|| name.set("Arbor".to_string()));
//! // Effect runs after the commit, prints: "Hello, Arbor!"
//! ```

pub mod codec;
pub mod environment;
pub mod error;
pub mod factory;
pub mod id;
pub mod operation;
pub mod reactive;
pub mod signals;
pub mod transaction;
pub mod tree;

pub use codec::Codec;
pub use environment::{EnvironmentConfig, SignalEnvironment};
pub use error::{Result, SignalError};
pub use factory::{in_memory_exclusive, in_memory_shared, ExclusiveSignalFactory, SharedSignalFactory, SignalFactory};
pub use id::Id;
pub use operation::{CancelableOperation, InsertOperation, OperationError, OperationResult, SignalOperation};
pub use reactive::{effect, Computed, Effect, UsageTracker};
pub use signals::{
    ListSignal, MapSignal, NodeSignal, NodeSignalState, NumberSignal, ReferenceSignal, Signal,
    ValueSignal,
};
pub use transaction::{Transaction, TransactionOperation, TransactionType};
pub use tree::{ListPosition, SignalCommand, SignalTree};
