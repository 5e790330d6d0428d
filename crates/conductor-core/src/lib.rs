//! Coordination core for Conductor: state ownership and event fan-out.
//!
//! This crate owns the single authoritative snapshot of the running pipeline
//! and the broker that pushes every committed change to live subscribers.
//!
//! # Modules
//!
//! - [`state`] -- [`StateManager`] handle and the owner task that serializes
//!   every mutation.
//! - [`dispatcher`] -- Non-blocking fan-out with bounded per-subscriber
//!   mailboxes and replay history.
//! - [`memory`] -- [`SummaryTrigger`] seam for the external summarizer.
//! - [`backoff`] -- Doubling-with-cap delay schedule used by reconnecting
//!   clients and telemetry retries.
//! - [`config`] -- Configuration loading from `conductor-config.yaml`.
//! - [`error`] -- [`CoreError`] returned by state operations.
//!
//! [`StateManager`]: state::StateManager
//! [`SummaryTrigger`]: memory::SummaryTrigger
//! [`CoreError`]: error::CoreError

pub mod backoff;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod memory;
pub mod state;

pub use backoff::{Backoff, BackoffPolicy};
pub use config::{ConductorConfig, ConfigError};
pub use dispatcher::{Dispatcher, DispatcherStats, EnvelopeSink, SubscriberInfo, Subscription};
pub use error::CoreError;
pub use memory::{LogSummaryTrigger, SummaryRequest, SummaryTrigger};
pub use state::{Operation, PersonaPatch, StateManager};
