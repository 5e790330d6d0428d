//! Error types for the stream client.

/// Errors observed while connecting to or reading from the event stream.
///
/// None of these reach the owner of a [`StreamHandle`](crate::StreamHandle):
/// connection failures feed the reconnect loop and malformed lines are
/// skipped. They surface in logs and in transport implementations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The connection attempt failed (DNS, refused, TLS, ...).
    #[error("connect failed: {0}")]
    Connect(String),

    /// The server closed the stream or the body errored mid-read.
    #[error("transport closed: {0}")]
    TransportClosed(String),

    /// The server answered with a non-success status.
    #[error("unexpected status: {0}")]
    Status(u16),

    /// A complete line was not a valid envelope.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
}
