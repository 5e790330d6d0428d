//! Shared application state for the Conductor HTTP surface.
//!
//! [`AppState`] bundles the handles the handlers need: the state manager for
//! mutations and reads, the dispatcher for stream subscriptions, and the
//! telemetry publisher for counters. Every field is a cheap cloneable handle;
//! nothing here holds the snapshot itself.

use std::time::Duration;

use conductor_core::{Dispatcher, StateManager};
use conductor_telemetry::TelemetryPublisher;

/// Shared state for the Axum application.
///
/// Wrapped in [`Arc`](std::sync::Arc) and injected via Axum's `State`
/// extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Handle to the snapshot owner task.
    pub state: StateManager,
    /// Fan-out broker backing `GET /stream`.
    pub dispatcher: Dispatcher,
    /// Outbound telemetry, when enabled.
    pub telemetry: Option<TelemetryPublisher>,
    /// Per-process stream epoch advertised in `x-conductor-epoch`.
    pub epoch: String,
    /// Quiet period after which an open stream gets a keepalive.
    pub keepalive: Duration,
}

impl AppState {
    /// Bundle the handles.
    pub fn new(
        state: StateManager,
        dispatcher: Dispatcher,
        telemetry: Option<TelemetryPublisher>,
        epoch: impl Into<String>,
        keepalive: Duration,
    ) -> Self {
        Self {
            state,
            dispatcher,
            telemetry,
            epoch: epoch.into(),
            keepalive,
        }
    }
}
