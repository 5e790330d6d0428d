//! Error types for telemetry delivery.
//!
//! These never leave the publisher: the worker logs and counts them. They
//! exist so the retry policy can branch on *why* a delivery failed.

/// A single delivery attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TelemetryError {
    /// The metrics store answered 401; the configured credential is invalid.
    #[error("telemetry credential rejected (401)")]
    AuthRejected,

    /// Network error, timeout, 429, or 5xx. Worth retrying.
    #[error("transient telemetry failure: {0}")]
    Transient(String),

    /// Any other non-success status. Not retried.
    #[error("telemetry event rejected with status {0}")]
    Rejected(u16),

    /// The envelope could not be encoded.
    #[error("failed to encode telemetry event: {0}")]
    Encode(String),

    /// The HTTP client could not be built.
    #[error("failed to build telemetry client: {0}")]
    Client(String),
}

impl TelemetryError {
    /// Whether the retry policy should try again.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
