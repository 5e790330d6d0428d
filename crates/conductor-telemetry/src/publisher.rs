//! The telemetry publisher and its delivery worker.
//!
//! [`TelemetryPublisher::publish`] never waits: it `try_send`s onto a bounded
//! queue and counts a drop when the queue is full. A single worker task
//! drains the queue and `POST`s each event to `{base_url}/events`.
//!
//! Delivery outcomes:
//!
//! | Response                       | Action                                   |
//! |--------------------------------|------------------------------------------|
//! | 2xx                            | counted as sent                          |
//! | 401                            | credential marked rejected, event dropped, every later event dropped without a request |
//! | 429, 5xx, network, timeout     | retried on the backoff schedule up to `max_attempts`, then dropped |
//! | other 4xx                      | dropped without retry                    |

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use conductor_core::backoff::{Backoff, BackoffPolicy};
use conductor_core::config::TelemetryConfig;
use conductor_core::dispatcher::EnvelopeSink;
use conductor_types::Envelope;
use reqwest::StatusCode;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::TelemetryError;

/// Header carrying the metrics-store credential.
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Request body accepted by the metrics store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryEvent {
    /// The envelope's `type`.
    pub event_type: String,
    /// The emitting component; always populated.
    pub source: String,
    /// The event's fields without the `type` discriminator.
    pub payload: serde_json::Value,
    /// Commit time of the envelope.
    pub ts: DateTime<Utc>,
}

impl TelemetryEvent {
    /// Convert an envelope into the store's event shape.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, TelemetryError> {
        let payload = envelope
            .payload()
            .map_err(|e| TelemetryError::Encode(e.to_string()))?;
        Ok(Self {
            event_type: envelope.kind().to_owned(),
            source: envelope.source.as_str().to_owned(),
            payload,
            ts: envelope.ts,
        })
    }
}

/// Point-in-time publisher counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TelemetryStats {
    /// Events accepted by the store.
    pub sent: u64,
    /// Failed delivery attempts (each retry counts).
    pub failed: u64,
    /// Events given up on: queue full, retries exhausted, rejected.
    pub dropped: u64,
    /// The credential was rejected; no further requests are made.
    pub auth_rejected: bool,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    auth_rejected: AtomicBool,
}

impl Counters {
    fn drop_one(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn rejected(&self) -> bool {
        self.auth_rejected.load(Ordering::Acquire)
    }

    /// Mark the credential rejected. Returns `true` only for the first call.
    fn reject(&self) -> bool {
        !self.auth_rejected.swap(true, Ordering::AcqRel)
    }

    /// Count an event dropped because the credential was rejected.
    ///
    /// The rejection itself is logged once when it happens; later drops only
    /// show up in `dropped`.
    fn drop_rejected(&self, envelope: &Envelope) {
        self.drop_one();
        debug!(
            seq = envelope.seq,
            kind = envelope.kind(),
            "telemetry credential rejected, dropping event"
        );
    }
}

/// Cloneable, non-blocking handle feeding the delivery worker.
#[derive(Debug, Clone)]
pub struct TelemetryPublisher {
    tx: mpsc::Sender<Arc<Envelope>>,
    counters: Arc<Counters>,
}

impl TelemetryPublisher {
    /// Start the delivery worker.
    ///
    /// The worker stops when `cancel` fires or every publisher handle is
    /// dropped. Queued events are not drained on shutdown.
    pub fn spawn(
        config: &TelemetryConfig,
        policy: BackoffPolicy,
        cancel: CancellationToken,
    ) -> Result<(Self, JoinHandle<()>), TelemetryError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| TelemetryError::Client(e.to_string()))?;

        let (publisher, rx) = Self::channel(config.queue_capacity);
        let worker = Worker {
            client,
            url: format!("{}/events", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            policy,
            max_attempts: config.max_attempts.max(1),
            counters: Arc::clone(&publisher.counters),
        };
        info!(
            url = %worker.url,
            authenticated = worker.api_key.is_some(),
            "telemetry publisher started"
        );
        let task = tokio::spawn(worker.run(rx, cancel));
        Ok((publisher, task))
    }

    fn channel(capacity: usize) -> (Self, mpsc::Receiver<Arc<Envelope>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                counters: Arc::new(Counters::default()),
            },
            rx,
        )
    }

    /// Queue an envelope for delivery. Returns `false` if it was dropped.
    pub fn publish(&self, envelope: Arc<Envelope>) -> bool {
        if self.counters.rejected() {
            self.counters.drop_rejected(&envelope);
            return false;
        }
        match self.tx.try_send(envelope) {
            Ok(()) => true,
            Err(TrySendError::Full(envelope)) => {
                self.counters.drop_one();
                warn!(seq = envelope.seq, "telemetry queue full, dropping event");
                false
            }
            Err(TrySendError::Closed(envelope)) => {
                self.counters.drop_one();
                debug!(seq = envelope.seq, "telemetry worker stopped, dropping event");
                false
            }
        }
    }

    /// Current counters.
    pub fn stats(&self) -> TelemetryStats {
        TelemetryStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            auth_rejected: self.counters.rejected(),
        }
    }
}

impl EnvelopeSink for TelemetryPublisher {
    fn name(&self) -> &'static str {
        "telemetry"
    }

    fn offer(&self, envelope: &Arc<Envelope>) {
        self.publish(Arc::clone(envelope));
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct Worker {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    policy: BackoffPolicy,
    max_attempts: u32,
    counters: Arc<Counters>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<Arc<Envelope>>, cancel: CancellationToken) {
        loop {
            let envelope = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            self.handle(&envelope, &cancel).await;
        }
        debug!("telemetry worker stopped");
    }

    async fn handle(&self, envelope: &Envelope, cancel: &CancellationToken) {
        if self.counters.rejected() {
            self.counters.drop_rejected(envelope);
            return;
        }

        let result = match TelemetryEvent::from_envelope(envelope) {
            Ok(event) => self.deliver(&event, cancel).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(TelemetryError::AuthRejected) => {
                self.counters.drop_one();
                if self.counters.reject() {
                    error!(
                        url = %self.url,
                        seq = envelope.seq,
                        "metrics store rejected the telemetry credential (401); fix telemetry.api_key, no further events will be sent"
                    );
                }
            }
            Err(e) => {
                self.counters.drop_one();
                warn!(error = %e, seq = envelope.seq, kind = envelope.kind(), "telemetry event dropped");
            }
        }
    }

    async fn deliver(
        &self,
        event: &TelemetryEvent,
        cancel: &CancellationToken,
    ) -> Result<(), TelemetryError> {
        let mut backoff = Backoff::new(self.policy);
        let mut attempt: u32 = 1;
        loop {
            let err = match self.send_once(event).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            if !err.is_retryable() || attempt >= self.max_attempts {
                return Err(err);
            }

            let delay = backoff.next_delay();
            debug!(error = %err, attempt, ?delay, "retrying telemetry event");
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(err),
                () = tokio::time::sleep(delay) => {}
            }
            attempt = attempt.saturating_add(1);
        }
    }

    async fn send_once(&self, event: &TelemetryEvent) -> Result<(), TelemetryError> {
        let mut request = self.client.post(&self.url).json(event);
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TelemetryError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status == StatusCode::UNAUTHORIZED {
            Err(TelemetryError::AuthRejected)
        } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Err(TelemetryError::Transient(format!("metrics store returned {status}")))
        } else {
            Err(TelemetryError::Rejected(status.as_u16()))
        }
    }
}
