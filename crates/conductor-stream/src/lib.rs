//! Reconnecting client for the Conductor event stream.
//!
//! Consumers (the telemetry relay, dashboards written in Rust) use this crate
//! to follow `GET /stream` across transport drops without losing or
//! duplicating envelopes.
//!
//! # Modules
//!
//! - [`client`] -- [`StreamClient`] reconnect loop and its [`StreamHandle`].
//! - [`framing`] -- Incremental NDJSON line decoder.
//! - [`transport`] -- [`Transport`] seam and the `reqwest`-backed
//!   [`HttpTransport`].
//! - [`error`] -- [`StreamError`].

pub mod client;
pub mod error;
pub mod framing;
pub mod transport;

pub use client::{ConnectionState, StreamClient, StreamHandle, StreamStats};
pub use error::StreamError;
pub use framing::LineFramer;
pub use transport::{Connection, EPOCH_HEADER, HttpTransport, Transport};
