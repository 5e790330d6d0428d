//! Shared type definitions for the Conductor coordination core.
//!
//! This crate is the single source of truth for everything that crosses a
//! process boundary: the [`Envelope`] streamed to subscribers and forwarded
//! to telemetry, and the [`Snapshot`] served by `GET /status`. Types flow to
//! `TypeScript` via `ts-rs` for dashboards.
//!
//! # Modules
//!
//! - [`envelope`] -- Tagged event union and its sequenced wire wrapper
//! - [`snapshot`] -- The authoritative snapshot and its records
//! - [`ids`] -- Type-safe UUID wrappers

pub mod envelope;
pub mod ids;
pub mod snapshot;

pub use envelope::{Envelope, Event, Source};
pub use ids::{SubscriberId, SummaryId};
pub use snapshot::{
    ExpressionRecord, ExpressionTarget, HealthSnapshot, MemoryState, MemorySummary, ModuleHealth,
    ModuleName, ModuleState, Persona, Snapshot, SystemStatus, Transcript, TranscriptState,
    TtsRecord, UnknownModule,
};

#[cfg(test)]
mod tests {
    //! `TypeScript` binding generation for dashboard consumers.

    #[test]
    fn export_bindings() {
        // ts-rs writes the files into `bindings/` relative to the crate root.
        use ts_rs::TS;

        let _ = crate::ids::SubscriberId::export_all();
        let _ = crate::ids::SummaryId::export_all();

        let _ = crate::snapshot::ModuleName::export_all();
        let _ = crate::snapshot::SystemStatus::export_all();
        let _ = crate::snapshot::Snapshot::export_all();
        let _ = crate::snapshot::HealthSnapshot::export_all();

        let _ = crate::envelope::Source::export_all();
        let _ = crate::envelope::Event::export_all();
    }
}
