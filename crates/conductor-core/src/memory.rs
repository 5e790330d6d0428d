//! Memory-summary trigger seam.
//!
//! Summary production lives outside the core. The state manager only decides
//! *when* a summary is due and hands the relevant context to a
//! [`SummaryTrigger`]; the external worker later reports the result through
//! `apply_memory_summary`.

use conductor_types::Transcript;
use tracing::info;

/// Context handed to the summarizer when a summary is due.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRequest {
    /// Turn counter at the time of the request.
    pub turn: u64,
    /// Finalized turns buffered since the last summary.
    pub buffer_length: u64,
    /// The utterance that made the summary due.
    pub transcript: Transcript,
}

/// Receives summary requests from the state manager's owner task.
///
/// Called while the owner holds the snapshot, so implementations must return
/// quickly (spawn or enqueue, never await external I/O inline).
pub trait SummaryTrigger: Send + Sync + 'static {
    /// A summary is due.
    fn request_summary(&self, request: SummaryRequest);
}

/// Default trigger: records the request in the log and nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSummaryTrigger;

impl SummaryTrigger for LogSummaryTrigger {
    fn request_summary(&self, request: SummaryRequest) {
        info!(
            turn = request.turn,
            buffer_length = request.buffer_length,
            "memory summary due"
        );
    }
}

/// Whether a summary is due after `buffer_length` turns.
pub(crate) const fn summary_due(buffer_length: u64, interval: u64) -> bool {
    buffer_length > 0 && matches!(buffer_length.checked_rem(interval), Some(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_on_each_multiple_of_interval() {
        let due: Vec<u64> = (0..=10).filter(|n| summary_due(*n, 4)).collect();
        assert_eq!(due, vec![4, 8]);
    }

    #[test]
    fn zero_interval_never_fires() {
        assert!(!summary_due(5, 0));
    }
}
