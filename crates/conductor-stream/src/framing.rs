//! Newline-delimited JSON framing.
//!
//! Transport deliveries carry no meaning: one envelope may span several
//! chunks, and one chunk may hold several envelopes. [`LineFramer`] buffers
//! bytes until a `\n` arrives and only then parses the line.

use conductor_types::Envelope;
use tracing::{debug, warn};

use crate::error::StreamError;

/// Incremental NDJSON decoder for one connection.
#[derive(Debug)]
pub struct LineFramer {
    buf: Vec<u8>,
    max_line_bytes: usize,
    /// Skipping the remainder of an oversized line.
    discarding: bool,
    malformed: u64,
    oversized: u64,
}

impl LineFramer {
    /// A framer that discards lines longer than `max_line_bytes`.
    pub const fn new(max_line_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_line_bytes,
            discarding: false,
            malformed: 0,
            oversized: 0,
        }
    }

    /// Feed a chunk and return every envelope completed by it, in order.
    pub fn push(&mut self, mut chunk: &[u8]) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Some(pos) = chunk.iter().position(|b| *b == b'\n') {
            let (head, rest) = chunk.split_at(pos);
            chunk = rest.get(1..).unwrap_or_default();

            if self.discarding {
                self.discarding = false;
            } else if self.buf.len().saturating_add(head.len()) > self.max_line_bytes {
                self.note_oversized();
            } else {
                self.buf.extend_from_slice(head);
                if let Some(envelope) = self.decode_line() {
                    out.push(envelope);
                }
            }
            self.buf.clear();
        }

        if !chunk.is_empty() && !self.discarding {
            if self.buf.len().saturating_add(chunk.len()) > self.max_line_bytes {
                self.buf.clear();
                self.discarding = true;
                self.note_oversized();
            } else {
                self.buf.extend_from_slice(chunk);
            }
        }
        out
    }

    /// Drop any partial line (the connection ended).
    pub fn reset(&mut self) {
        if !self.buf.is_empty() {
            debug!(bytes = self.buf.len(), "discarding unterminated line");
        }
        self.buf.clear();
        self.discarding = false;
    }

    /// Bytes currently buffered for an incomplete line.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Complete lines that failed to parse.
    pub const fn malformed(&self) -> u64 {
        self.malformed
    }

    /// Lines discarded for exceeding the size limit.
    pub const fn oversized(&self) -> u64 {
        self.oversized
    }

    fn note_oversized(&mut self) {
        self.oversized = self.oversized.saturating_add(1);
        warn!(
            max_line_bytes = self.max_line_bytes,
            "discarding oversized stream line"
        );
    }

    fn decode_line(&mut self) -> Option<Envelope> {
        let line = self.buf.strip_suffix(b"\r").unwrap_or(self.buf.as_slice());
        if line.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        match serde_json::from_slice::<Envelope>(line) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                self.malformed = self.malformed.saturating_add(1);
                let err = StreamError::MalformedEnvelope(e.to_string());
                warn!(error = %err, bytes = line.len(), "skipping malformed stream line");
                None
            }
        }
    }
}
