//! The reconnecting stream client.
//!
//! ```text
//!            ┌──────────── backoff elapsed ────────────┐
//!            ▼                                          │
//!   Disconnected ──► Connecting ──► Open ──► (closed) ──┘
//!                         │                       ▲
//!                         └──── connect failed ───┘
//! ```
//!
//! Every failure advances the [`Backoff`] cursor; an `Open` period of at
//! least `sustained_open` resets it. The client remembers the highest `seq`
//! it delivered, resumes with `since`, and drops anything at or below that
//! watermark, so reconnects neither lose retained envelopes nor duplicate
//! them. When the server's stream epoch changes (the server restarted) the
//! watermark no longer applies; the client resets it and resynchronizes from
//! the start of the server's history.
//!
//! A peer that vanishes without closing the connection is caught by the
//! idle deadline: when no bytes (envelopes or keepalive lines) arrive for
//! that long, the connection is treated as dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use conductor_core::backoff::{Backoff, BackoffPolicy};
use conductor_types::Envelope;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::framing::LineFramer;
use crate::transport::{Connection, Transport};

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting to (re)connect.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// Receiving envelopes.
    Open,
}

/// Client counters.
#[derive(Debug, Default)]
pub struct StreamStats {
    connects: AtomicU64,
    delivered: AtomicU64,
    duplicates: AtomicU64,
    malformed: AtomicU64,
    oversized: AtomicU64,
}

impl StreamStats {
    /// Successful connections.
    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    /// Envelopes handed to the owner.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Envelopes skipped because their `seq` was already delivered.
    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    /// Lines skipped because they did not parse as envelopes.
    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Lines discarded for exceeding the size limit.
    pub fn oversized(&self) -> u64 {
        self.oversized.load(Ordering::Relaxed)
    }
}

/// A stream client not yet started.
#[derive(Debug)]
pub struct StreamClient<T> {
    transport: T,
    policy: BackoffPolicy,
    max_line_bytes: usize,
    idle_timeout: Option<Duration>,
}

impl<T: Transport> StreamClient<T> {
    /// Configure a client over `transport`, with no idle deadline.
    pub const fn new(transport: T, policy: BackoffPolicy, max_line_bytes: usize) -> Self {
        Self {
            transport,
            policy,
            max_line_bytes,
            idle_timeout: None,
        }
    }

    /// Treat an open connection as dropped after `timeout` without data.
    ///
    /// Must exceed the server's keepalive interval.
    #[must_use]
    pub const fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Start the reconnect loop; envelopes are sent to `deliver` in order.
    ///
    /// The loop ends when the handle is shut down or dropped, or when the
    /// receiving side of `deliver` is closed.
    pub fn spawn(self, deliver: mpsc::Sender<Envelope>) -> StreamHandle {
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let stats = Arc::new(StreamStats::default());
        let worker = Worker {
            transport: self.transport,
            backoff: Backoff::new(self.policy),
            framer: LineFramer::new(self.max_line_bytes),
            idle_timeout: self.idle_timeout,
            deliver,
            state: state_tx,
            stats: Arc::clone(&stats),
            last_seq: None,
            epoch: None,
            resync: false,
        };
        let task = tokio::spawn(worker.run(cancel.clone()));
        StreamHandle {
            cancel,
            task: Some(task),
            state: state_rx,
            stats,
        }
    }
}

/// Controls a running stream client.
///
/// Dropping the handle cancels the loop.
#[derive(Debug)]
pub struct StreamHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    state: watch::Receiver<ConnectionState>,
    stats: Arc<StreamStats>,
}

impl StreamHandle {
    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Counters.
    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    /// Stop the loop and wait for it to release the transport.
    ///
    /// Safe during a backoff wait: no reconnect is attempted afterwards.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        let Some(task) = self.task.take() else {
            return;
        };
        if let Err(e) = task.await {
            warn!(error = %e, "stream client task ended abnormally");
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Closed {
    Cancelled,
    OwnerGone,
    Resync,
    Ended(Option<String>),
}

struct Worker<T> {
    transport: T,
    backoff: Backoff,
    framer: LineFramer,
    idle_timeout: Option<Duration>,
    deliver: mpsc::Sender<Envelope>,
    state: watch::Sender<ConnectionState>,
    stats: Arc<StreamStats>,
    last_seq: Option<u64>,
    epoch: Option<String>,
    resync: bool,
}

impl<T: Transport> Worker<T> {
    async fn run(mut self, cancel: CancellationToken) {
        loop {
            let since = if self.resync { Some(0) } else { self.last_seq };
            self.resync = false;
            self.state.send_replace(ConnectionState::Connecting);

            let attempt = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                result = self.transport.connect(since) => result,
            };

            let failure = match attempt {
                Ok(connection) => {
                    let opened = Instant::now();
                    match self.pump(connection, since, &cancel).await {
                        Closed::Cancelled | Closed::OwnerGone => break,
                        Closed::Resync => continue,
                        Closed::Ended(reason) => {
                            let open_for = opened.elapsed();
                            if self.backoff.record_open(open_for) {
                                debug!(?open_for, "sustained connection, backoff reset");
                            }
                            reason.unwrap_or_else(|| "server closed stream".to_owned())
                        }
                    }
                }
                Err(e) => e.to_string(),
            };

            self.framer.reset();
            self.state.send_replace(ConnectionState::Disconnected);
            let delay = self.backoff.next_delay();
            warn!(
                reason = %failure,
                attempt = self.backoff.attempt(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "stream disconnected, reconnecting"
            );

            if !sleep_or_cancel(delay, &cancel).await {
                break;
            }
        }
        self.state.send_replace(ConnectionState::Disconnected);
        debug!("stream client stopped");
    }

    async fn pump(
        &mut self,
        connection: Connection,
        since: Option<u64>,
        cancel: &CancellationToken,
    ) -> Closed {
        let Connection { epoch, mut chunks } = connection;

        let changed = matches!((&self.epoch, &epoch), (Some(old), Some(new)) if old != new);
        if epoch.is_some() {
            self.epoch.clone_from(&epoch);
        }
        if changed {
            info!(?epoch, "stream epoch changed, resetting sequence watermark");
            self.last_seq = None;
            if since.is_some_and(|s| s > 0) {
                self.resync = true;
                return Closed::Resync;
            }
        }

        self.stats.connects.fetch_add(1, Ordering::Relaxed);
        self.state.send_replace(ConnectionState::Open);
        info!(?since, ?epoch, "stream open");

        loop {
            let idle_timeout = self.idle_timeout;
            let next = async {
                match idle_timeout {
                    Some(idle) => tokio::time::timeout(idle, chunks.next()).await.ok(),
                    None => Some(chunks.next().await),
                }
            };
            let chunk = tokio::select! {
                biased;
                () = cancel.cancelled() => return Closed::Cancelled,
                chunk = next => chunk,
            };
            let bytes = match chunk {
                Some(Some(Ok(bytes))) => bytes,
                Some(Some(Err(e))) => return Closed::Ended(Some(e.to_string())),
                Some(None) => return Closed::Ended(None),
                None => return Closed::Ended(Some("idle timeout".to_owned())),
            };
            let envelopes = self.framer.push(&bytes);
            self.stats
                .malformed
                .store(self.framer.malformed(), Ordering::Relaxed);
            self.stats
                .oversized
                .store(self.framer.oversized(), Ordering::Relaxed);
            for envelope in envelopes {
                if self.last_seq.is_some_and(|last| envelope.seq <= last) {
                    self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                    debug!(seq = envelope.seq, "skipping already delivered envelope");
                    continue;
                }
                let seq = envelope.seq;
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Closed::Cancelled,
                    sent = self.deliver.send(envelope) => {
                        if sent.is_err() {
                            debug!("stream owner dropped receiver");
                            return Closed::OwnerGone;
                        }
                    }
                }
                self.last_seq = Some(seq);
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Sleep for `delay`; `false` if cancelled first.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}
