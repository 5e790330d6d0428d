//! Telemetry forwarding for the Conductor coordination core.
//!
//! The [`TelemetryPublisher`] registers with the dispatcher as an
//! [`EnvelopeSink`](conductor_core::EnvelopeSink) and forwards every envelope
//! to an external metrics store. Delivery is best-effort: outages are visible
//! in logs and [`TelemetryStats`], never in the pipeline.

pub mod error;
pub mod publisher;

pub use error::TelemetryError;
pub use publisher::{API_KEY_HEADER, TelemetryEvent, TelemetryPublisher, TelemetryStats};
