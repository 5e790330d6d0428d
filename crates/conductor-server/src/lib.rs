//! HTTP and `WebSocket` surface for the Conductor coordination core.
//!
//! Exposes the state manager's operations as REST endpoints, serves the
//! live envelope stream, and wires the runtime together for the
//! `conductor` and `conductor-relay` binaries.
//!
//! # Modules
//!
//! - [`error`] -- API error responses.
//! - [`handlers`] -- REST handlers.
//! - [`router`] -- Route table.
//! - [`server`] -- Bind and serve with graceful shutdown.
//! - [`startup`] -- Logging and runtime wiring.
//! - [`state`] -- Shared handler state.
//! - [`stream`] -- `GET /stream` over `WebSocket` or NDJSON.

pub mod error;
pub mod handlers;
pub mod router;
pub mod server;
pub mod startup;
pub mod state;
pub mod stream;

pub use error::ApiError;
pub use router::build_router;
pub use server::{ServerError, start_server};
pub use startup::{Conductor, StartupError, init_tracing, load_config, start};
pub use state::AppState;
