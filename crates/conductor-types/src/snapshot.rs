//! The authoritative system snapshot and the records it aggregates.
//!
//! A [`Snapshot`] is a plain value. The State Manager owns the only live
//! instance; everybody else receives clones, so nothing in this module is
//! shared or interior-mutable.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::ids::SummaryId;

// ---------------------------------------------------------------------------
// Modules
// ---------------------------------------------------------------------------

/// The fixed set of workers and integrations the core tracks.
///
/// The set is closed: names outside of it are rejected at the boundary, which
/// keeps the snapshot's module map stable for the lifetime of the process.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS,
)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum ModuleName {
    /// Speech recognition and voice activity detection.
    Asr,
    /// Response generator (language model backend).
    Llm,
    /// Speech synthesis.
    Tts,
    /// Stream scene switching.
    Obs,
    /// Avatar expression client.
    Vts,
    /// Chat ingestion.
    Chat,
    /// Long-term memory summarizer.
    Memory,
    /// Content moderation.
    Moderation,
}

impl ModuleName {
    /// Every known module, in map order.
    pub const ALL: [Self; 8] = [
        Self::Asr,
        Self::Llm,
        Self::Tts,
        Self::Obs,
        Self::Vts,
        Self::Chat,
        Self::Memory,
        Self::Moderation,
    ];

    /// Stable lowercase identifier used on the wire and in telemetry.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Asr => "asr",
            Self::Llm => "llm",
            Self::Tts => "tts",
            Self::Obs => "obs",
            Self::Vts => "vts",
            Self::Chat => "chat",
            Self::Memory => "memory",
            Self::Moderation => "moderation",
        }
    }
}

impl fmt::Display for ModuleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string does not name a known module.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown module: {0}")]
pub struct UnknownModule(pub String);

impl FromStr for ModuleName {
    type Err = UnknownModule;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| UnknownModule(s.to_owned()))
    }
}

/// Whether a module is currently enabled and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum ModuleState {
    /// Enabled and reporting.
    Online,
    /// Disabled or never seen.
    Offline,
}

/// Health record for a single module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct ModuleHealth {
    /// Online/offline state.
    pub state: ModuleState,
    /// Last reported latency in milliseconds (never negative).
    pub latency_ms: f64,
    /// When this record last changed.
    pub last_updated: DateTime<Utc>,
}

impl ModuleHealth {
    /// An offline record with zero latency, stamped at `at`.
    pub const fn offline(at: DateTime<Utc>) -> Self {
        Self {
            state: ModuleState::Offline,
            latency_ms: 0.0,
            last_updated: at,
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

/// Overall system status shown to dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum SystemStatus {
    /// Every enabled module is responsive.
    Online,
    /// At least one enabled module is past its health threshold.
    Degraded,
    /// No module is responsive.
    Offline,
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// The persona driving the response generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Persona {
    /// Free-form style label (e.g. `"chaotic"`).
    pub style: String,
    /// How unpredictable responses are, in `[0, 1]`.
    pub chaos_level: f64,
    /// Delivery energy, in `[0, 1]`.
    pub energy: f64,
    /// Family-friendly output filter.
    pub family_mode: bool,
    /// When the persona last changed.
    pub last_updated: DateTime<Utc>,
}

/// A speech-recognition result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Transcript {
    /// Recognized text.
    pub text: String,
    /// Recognizer confidence in `[0, 1]`.
    pub confidence: f64,
    /// When the result was received.
    pub at: DateTime<Utc>,
}

/// Most-recent transcript fields and the conversation turn counter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct TranscriptState {
    /// The in-flight partial for the current utterance.
    pub partial: Option<Transcript>,
    /// The last finalized utterance.
    pub last_final: Option<Transcript>,
    /// Number of finalized utterances since start.
    pub turns: u64,
}

/// A speech-synthesis request accepted by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct TtsRecord {
    /// Text to speak.
    pub text: String,
    /// Optional voice override.
    pub voice: Option<String>,
    /// When the request was accepted.
    pub requested_at: DateTime<Utc>,
}

/// Where an expression change is aimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum ExpressionTarget {
    /// The external avatar client (hotkey-driven expressions).
    Vts,
    /// The generic avatar expression channel (driven by the generator).
    Avatar,
}

/// An avatar expression change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct ExpressionRecord {
    /// Which channel the expression was sent on.
    pub target: ExpressionTarget,
    /// Expression name.
    pub expression: String,
    /// Optional intensity in `[0, 1]`.
    pub intensity: Option<f64>,
    /// When the expression was applied.
    pub at: DateTime<Utc>,
}

/// A conversation summary produced by the external memory worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct MemorySummary {
    /// Summary identifier.
    pub id: SummaryId,
    /// Summary text.
    pub text: String,
    /// Turn counter at the time the summary was recorded.
    pub turn: u64,
    /// When the summary was recorded.
    pub created_at: DateTime<Utc>,
}

/// Short-term memory bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct MemoryState {
    /// Finalized turns buffered since the last summary.
    pub buffer_length: u64,
    /// Turns between summary requests (always greater than zero).
    pub summary_interval: u64,
    /// Whether summaries are restored into context on restart.
    pub restore_enabled: bool,
    /// The most recent summary, if any.
    pub current_summary: Option<MemorySummary>,
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Point-in-time state of the coordinated system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Snapshot {
    /// Aggregate status derived from module health.
    pub status: SystemStatus,
    /// Current persona.
    pub persona: Persona,
    /// Health per known module.
    pub modules: BTreeMap<ModuleName, ModuleHealth>,
    /// Current stage/scene identifier.
    pub scene: String,
    /// Most recent expression change.
    pub last_expression: Option<ExpressionRecord>,
    /// Most recent speech request.
    pub last_tts: Option<TtsRecord>,
    /// Most recent transcripts and the turn counter.
    pub transcript: TranscriptState,
    /// Memory bookkeeping.
    pub memory: MemoryState,
    /// Whether restored context is injected into the generator.
    pub restore_context: bool,
}

impl Snapshot {
    /// Project the cheap liveness subset.
    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            status: self.status,
            modules: self.modules.clone(),
        }
    }
}

/// The subset of a [`Snapshot`] needed for liveness checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct HealthSnapshot {
    /// Aggregate status.
    pub status: SystemStatus,
    /// Health per known module.
    pub modules: BTreeMap<ModuleName, ModuleHealth>,
}
