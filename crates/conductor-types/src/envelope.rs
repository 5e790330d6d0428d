//! The wire-level event envelope shared by every producer and consumer.
//!
//! An [`Envelope`] is one JSON object: the metadata fields (`seq`, `ts`,
//! `source`) plus the flattened [`Event`], whose `type` field is the
//! discriminator. On the stream each envelope occupies exactly one line.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::snapshot::{
    ExpressionRecord, MemorySummary, ModuleHealth, ModuleName, Persona, Snapshot, Transcript,
    TtsRecord,
};

/// Stable identifier of the component that emitted an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum Source {
    /// The coordination core itself.
    Core,
    /// Speech recognition.
    Asr,
    /// Response generator.
    Llm,
    /// Speech synthesis.
    Tts,
    /// Scene switching.
    Obs,
    /// Avatar expression client.
    Vts,
    /// Chat ingestion.
    Chat,
    /// Memory summarizer.
    Memory,
    /// Content moderation.
    Moderation,
}

impl Source {
    /// Lowercase identifier, identical to the serialized form.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Core => "core",
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

impl From<ModuleName> for Source {
    fn from(module: ModuleName) -> Self {
        match module {
            ModuleName::Asr => Self::Asr,
            ModuleName::Llm => Self::Llm,
            ModuleName::Tts => Self::Tts,
            ModuleName::Obs => Self::Obs,
            ModuleName::Vts => Self::Vts,
            ModuleName::Chat => Self::Chat,
            ModuleName::Memory => Self::Memory,
            ModuleName::Moderation => Self::Moderation,
        }
    }
}

/// One committed state change, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum Event {
    /// Full snapshot, emitted when the aggregate status changes.
    Status {
        /// The snapshot after the change.
        snapshot: Box<Snapshot>,
    },
    /// A module was enabled or disabled.
    #[serde(rename = "module.toggle")]
    ModuleToggle {
        /// The toggled module.
        module: ModuleName,
        /// New enabled flag.
        enabled: bool,
    },
    /// A module reported a heartbeat.
    #[serde(rename = "module.health")]
    ModuleHealth {
        /// The reporting module.
        module: ModuleName,
        /// Its health record after the heartbeat.
        health: ModuleHealth,
    },
    /// The persona changed.
    PersonaUpdate {
        /// The full persona after the change.
        persona: Persona,
    },
    /// A speech request was accepted.
    TtsRequest {
        /// The accepted request.
        request: TtsRecord,
    },
    /// The active scene changed.
    ObsScene {
        /// New scene identifier.
        scene: String,
    },
    /// An expression was sent to the avatar client.
    VtsExpression {
        /// The applied expression.
        expression: ExpressionRecord,
    },
    /// A generator-driven avatar expression.
    Expression {
        /// The applied expression.
        expression: ExpressionRecord,
    },
    /// An in-flight recognition result.
    AsrPartial {
        /// The partial transcript.
        transcript: Transcript,
    },
    /// A finalized utterance.
    AsrFinal {
        /// The final transcript.
        transcript: Transcript,
        /// Turn counter after this utterance.
        turn: u64,
    },
    /// A memory summary was recorded.
    MemorySummary {
        /// The recorded summary.
        summary: MemorySummary,
    },
}

impl Event {
    /// The wire discriminator for this event.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::ModuleToggle { .. } => "module.toggle",
            Self::ModuleHealth { .. } => "module.health",
            Self::PersonaUpdate { .. } => "persona_update",
            Self::TtsRequest { .. } => "tts_request",
            Self::ObsScene { .. } => "obs_scene",
            Self::VtsExpression { .. } => "vts_expression",
            Self::Expression { .. } => "expression",
            Self::AsrPartial { .. } => "asr_partial",
            Self::AsrFinal { .. } => "asr_final",
            Self::MemorySummary { .. } => "memory_summary",
        }
    }

    /// The component this event originates from.
    pub const fn source(&self) -> Source {
        match self {
            Self::Status { .. } | Self::ModuleToggle { .. } | Self::PersonaUpdate { .. } => {
                Source::Core
            }
            Self::ModuleHealth { module, .. } => match module {
                ModuleName::Asr => Source::Asr,
                ModuleName::Llm => Source::Llm,
                ModuleName::Tts => Source::Tts,
                ModuleName::Obs => Source::Obs,
                ModuleName::Vts => Source::Vts,
                ModuleName::Chat => Source::Chat,
                ModuleName::Memory => Source::Memory,
                ModuleName::Moderation => Source::Moderation,
            },
            Self::TtsRequest { .. } => Source::Tts,
            Self::ObsScene { .. } => Source::Obs,
            Self::VtsExpression { .. } => Source::Vts,
            Self::Expression { .. } => Source::Llm,
            Self::AsrPartial { .. } | Self::AsrFinal { .. } => Source::Asr,
            Self::MemorySummary { .. } => Source::Memory,
        }
    }
}

/// An immutable, sequenced event as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Process-wide sequence number, strictly increasing.
    pub seq: u64,
    /// When the change was committed.
    pub ts: DateTime<Utc>,
    /// Emitting component.
    pub source: Source,
    /// The event itself (carries the `type` discriminator).
    #[serde(flatten)]
    pub event: Event,
}

impl Envelope {
    /// Wrap an event, deriving `source` from its kind.
    pub fn new(seq: u64, ts: DateTime<Utc>, event: Event) -> Self {
        let source = event.source();
        Self {
            seq,
            ts,
            source,
            event,
        }
    }

    /// The wire discriminator of the wrapped event.
    pub const fn kind(&self) -> &'static str {
        self.event.kind()
    }

    /// Encode as a single newline-terminated JSON line.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if the envelope cannot be encoded.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// The event's kind-specific fields, without the `type` discriminator.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if the event cannot be encoded.
    pub fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        let mut value = serde_json::to_value(&self.event)?;
        if let Some(map) = value.as_object_mut() {
            map.remove("type");
        }
        Ok(value)
    }
}
