//! REST endpoint handlers for the Conductor control surface.
//!
//! Reads are served from the state manager's latest committed snapshot and
//! never wait on the owner task. Mutations go through the owner and answer
//! `202 Accepted` with the sequence number of the emitted envelope.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/status` | Full snapshot |
//! | `GET` | `/health` | Status and module health |
//! | `GET` | `/metrics` | Dispatcher and telemetry counters |
//! | `POST` | `/toggle/{module}` | Enable or disable a module |
//! | `POST` | `/modules/{module}/heartbeat` | Module heartbeat |
//! | `POST` | `/persona` | Partial persona update |
//! | `POST` | `/tts` | Speech request |
//! | `POST` | `/obs/scene` | Scene switch |
//! | `POST` | `/vts/expr` | Avatar client expression |
//! | `POST` | `/expression` | Generator-driven expression |
//! | `POST` | `/events/asr` | Partial or final transcript |
//! | `POST` | `/memory/summary` | Record a memory summary |

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use conductor_core::{DispatcherStats, PersonaPatch, SubscriberInfo};
use conductor_telemetry::TelemetryStats;
use conductor_types::{Envelope, ExpressionTarget, HealthSnapshot, Snapshot, SystemStatus};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

/// Body of `POST /toggle/{module}`.
#[derive(Debug, Deserialize)]
pub struct ToggleBody {
    /// New enabled flag.
    pub enabled: bool,
}

/// Body of `POST /modules/{module}/heartbeat`.
#[derive(Debug, Deserialize)]
pub struct HeartbeatBody {
    /// Observed latency in milliseconds.
    pub latency_ms: f64,
}

/// Body of `POST /tts`.
#[derive(Debug, Deserialize)]
pub struct TtsBody {
    /// Text to speak.
    pub text: String,
    /// Optional voice override.
    #[serde(default)]
    pub voice: Option<String>,
}

/// Body of `POST /obs/scene`.
#[derive(Debug, Deserialize)]
pub struct SceneBody {
    /// Scene identifier.
    pub scene: String,
}

/// Body of `POST /vts/expr` and `POST /expression`.
#[derive(Debug, Deserialize)]
pub struct ExpressionBody {
    /// Expression name.
    pub expression: String,
    /// Optional intensity in `[0, 1]`.
    #[serde(default)]
    pub intensity: Option<f64>,
}

/// Transcript kind on `POST /events/asr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsrKind {
    /// In-flight result.
    Partial,
    /// Finalized utterance.
    Final,
}

/// Body of `POST /events/asr`.
#[derive(Debug, Deserialize)]
pub struct AsrBody {
    /// Partial or final.
    pub kind: AsrKind,
    /// Recognized text.
    pub text: String,
    /// Recognizer confidence in `[0, 1]`.
    pub confidence: f64,
}

/// Body of `POST /memory/summary`.
#[derive(Debug, Deserialize)]
pub struct SummaryBody {
    /// Summary text.
    pub text: String,
}

/// Response to an accepted mutation.
#[derive(Debug, Serialize)]
pub struct Accepted {
    /// Always `true`.
    pub ok: bool,
    /// Sequence number of the emitted envelope.
    pub seq: u64,
    /// Kind of the emitted envelope.
    #[serde(rename = "type")]
    pub kind: &'static str,
}

fn accepted(envelope: &Envelope) -> (StatusCode, Json<Accepted>) {
    (
        StatusCode::ACCEPTED,
        Json(Accepted {
            ok: true,
            seq: envelope.seq,
            kind: envelope.kind(),
        }),
    )
}

/// Response of `GET /metrics`.
#[derive(Debug, Serialize)]
pub struct Metrics {
    /// Aggregate status.
    pub status: SystemStatus,
    /// Dispatcher counters.
    pub dispatcher: DispatcherStats,
    /// Per-subscriber queue state.
    pub subscribers: Vec<SubscriberInfo>,
    /// Telemetry counters, when telemetry is enabled.
    pub telemetry: Option<TelemetryStats>,
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

/// `GET /status`
pub async fn get_status(State(app): State<Arc<AppState>>) -> Json<Snapshot> {
    Json(app.state.snapshot())
}

/// `GET /health`
pub async fn get_health(State(app): State<Arc<AppState>>) -> Json<HealthSnapshot> {
    Json(app.state.health_snapshot())
}

/// `GET /metrics`
pub async fn get_metrics(State(app): State<Arc<AppState>>) -> Json<Metrics> {
    Json(Metrics {
        status: app.state.current().status,
        dispatcher: app.dispatcher.stats(),
        subscribers: app.dispatcher.subscribers(),
        telemetry: app.telemetry.as_ref().map(conductor_telemetry::TelemetryPublisher::stats),
    })
}

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

/// `POST /toggle/{module}`
pub async fn toggle_module(
    State(app): State<Arc<AppState>>,
    Path(module): Path<String>,
    Json(body): Json<ToggleBody>,
) -> Result<impl IntoResponse, ApiError> {
    let envelope = app.state.apply_module_toggle(&module, body.enabled).await?;
    Ok(accepted(&envelope))
}

/// `POST /modules/{module}/heartbeat`
pub async fn module_heartbeat(
    State(app): State<Arc<AppState>>,
    Path(module): Path<String>,
    Json(body): Json<HeartbeatBody>,
) -> Result<impl IntoResponse, ApiError> {
    let envelope = app
        .state
        .apply_module_health(&module, body.latency_ms)
        .await?;
    Ok(accepted(&envelope))
}

/// `POST /persona`
pub async fn update_persona(
    State(app): State<Arc<AppState>>,
    Json(patch): Json<PersonaPatch>,
) -> Result<impl IntoResponse, ApiError> {
    let envelope = app.state.apply_persona_update(patch).await?;
    Ok(accepted(&envelope))
}

/// `POST /tts`
pub async fn request_tts(
    State(app): State<Arc<AppState>>,
    Json(body): Json<TtsBody>,
) -> Result<impl IntoResponse, ApiError> {
    let envelope = app.state.apply_tts_request(body.text, body.voice).await?;
    Ok(accepted(&envelope))
}

/// `POST /obs/scene`
pub async fn change_scene(
    State(app): State<Arc<AppState>>,
    Json(body): Json<SceneBody>,
) -> Result<impl IntoResponse, ApiError> {
    let envelope = app.state.apply_scene_change(body.scene).await?;
    Ok(accepted(&envelope))
}

/// `POST /vts/expr`
pub async fn vts_expression(
    State(app): State<Arc<AppState>>,
    Json(body): Json<ExpressionBody>,
) -> Result<impl IntoResponse, ApiError> {
    let envelope = app
        .state
        .apply_expression(ExpressionTarget::Vts, body.expression, body.intensity)
        .await?;
    Ok(accepted(&envelope))
}

/// `POST /expression`
pub async fn avatar_expression(
    State(app): State<Arc<AppState>>,
    Json(body): Json<ExpressionBody>,
) -> Result<impl IntoResponse, ApiError> {
    let envelope = app
        .state
        .apply_expression(ExpressionTarget::Avatar, body.expression, body.intensity)
        .await?;
    Ok(accepted(&envelope))
}

/// `POST /events/asr`
pub async fn asr_event(
    State(app): State<Arc<AppState>>,
    Json(body): Json<AsrBody>,
) -> Result<impl IntoResponse, ApiError> {
    let envelope = match body.kind {
        AsrKind::Partial => {
            app.state
                .handle_asr_partial(body.text, body.confidence)
                .await?
        }
        AsrKind::Final => app.state.handle_asr_final(body.text, body.confidence).await?,
    };
    Ok(accepted(&envelope))
}

/// `POST /memory/summary`
pub async fn memory_summary(
    State(app): State<Arc<AppState>>,
    Json(body): Json<SummaryBody>,
) -> Result<impl IntoResponse, ApiError> {
    let envelope = app.state.apply_memory_summary(body.text).await?;
    Ok(accepted(&envelope))
}
