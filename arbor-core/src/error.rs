//! Error types shared by the whole crate.
//!
//! Precondition failures of individual commands are not errors in this sense:
//! they are reported through [`CommandResult::Reject`](crate::tree::CommandResult)
//! and surface as [`OperationError`](crate::operation::OperationError) on the
//! operation handle. `SignalError` covers contract violations that are raised
//! at the call site.

use thiserror::Error;

/// Errors raised synchronously by signal operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalError {
    /// The signal (or one of its validators) does not allow the operation.
    #[error("operation not supported by this signal")]
    Unsupported,

    /// A reference signal was accessed while it was being modified.
    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),

    /// The operation is not allowed in the current state, e.g. an effect
    /// writing a value it depends on.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The stored value could not be read as the requested type.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// Malformed id text.
    #[error("invalid id: {0}")]
    InvalidId(String),

    /// `SignalEnvironment::initialize` was called more than once.
    #[error("signal environment is already initialized")]
    AlreadyInitialized,

    /// An effect action panicked and has been closed.
    #[error("effect panicked: {0}")]
    EffectPanicked(String),

    /// Encoding or decoding a command batch failed.
    #[error("codec error: {0}")]
    Codec(String),
}

impl SignalError {
    pub(crate) fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState(message.into())
    }

    /// Whether this is an [`IllegalState`](Self::IllegalState) error.
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, Self::IllegalState(_))
    }
}

impl From<serde_json::Error> for SignalError {
    fn from(error: serde_json::Error) -> Self {
        Self::TypeMismatch(error.to_string())
    }
}

/// Crate-wide result alias.
pub type Result<T, E = SignalError> = std::result::Result<T, E>;
