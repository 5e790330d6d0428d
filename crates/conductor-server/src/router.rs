//! Axum router construction for the Conductor API.
//!
//! Assembles all routes (REST + stream) into a single [`Router`] with CORS
//! middleware enabled for cross-origin dashboard and overlay access.

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;
use crate::stream;

/// Build the complete Axum router for the Conductor server.
///
/// The router includes:
/// - `GET /status`, `GET /health`, `GET /metrics` -- reads
/// - `GET /stream` -- `WebSocket` or NDJSON envelope stream
/// - `POST /toggle/{module}` and `POST /modules/{module}/heartbeat`
/// - `POST /persona`, `/tts`, `/obs/scene`, `/vts/expr`, `/expression`
/// - `POST /events/asr`, `POST /memory/summary`
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Reads
        .route("/status", get(handlers::get_status))
        .route("/health", get(handlers::get_health))
        .route("/metrics", get(handlers::get_metrics))
        // Stream
        .route("/stream", get(stream::stream))
        // Modules
        .route("/toggle/{module}", post(handlers::toggle_module))
        .route("/modules/{module}/heartbeat", post(handlers::module_heartbeat))
        // Performance controls
        .route("/persona", post(handlers::update_persona))
        .route("/tts", post(handlers::request_tts))
        .route("/obs/scene", post(handlers::change_scene))
        .route("/vts/expr", post(handlers::vts_expression))
        .route("/expression", post(handlers::avatar_expression))
        // Speech and memory
        .route("/events/asr", post(handlers::asr_event))
        .route("/memory/summary", post(handlers::memory_summary))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
