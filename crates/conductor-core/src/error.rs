//! Error types for state mutation.
//!
//! Every variant here is a caller error or an availability error. They are
//! returned synchronously to whoever invoked the operation; a rejected call
//! never mutates the snapshot and never emits an envelope.

use conductor_types::UnknownModule;

/// Errors returned by [`StateManager`](crate::state::StateManager) operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    /// The named module is not part of the fixed module set.
    #[error("invalid module: {0}")]
    InvalidModule(String),

    /// A numeric field is outside its allowed range.
    #[error("{field} out of range: {value} (expected {expected})")]
    OutOfRange {
        /// Name of the offending field.
        field: &'static str,
        /// The rejected value.
        value: f64,
        /// Human-readable description of the valid range.
        expected: &'static str,
    },

    /// The request is structurally invalid (empty text, empty patch, ...).
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The owner task has stopped; the process is shutting down.
    #[error("state manager unavailable")]
    Unavailable,
}

impl From<UnknownModule> for CoreError {
    fn from(err: UnknownModule) -> Self {
        Self::InvalidModule(err.0)
    }
}
