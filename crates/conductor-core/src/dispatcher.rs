//! Event dispatcher: non-blocking fan-out of envelopes to live subscribers.
//!
//! Every subscriber owns an independent bounded mailbox. [`Dispatcher::publish`]
//! pushes into each mailbox and returns immediately; it never waits for a
//! subscriber to drain. When a mailbox is full the **oldest** buffered
//! envelope is discarded and that subscriber's drop counter is incremented,
//! so slow consumers always converge on the newest state.
//!
//! ```text
//!   publish(env)
//!       │            (Arc-clone per subscriber)
//!       ├──────────► [mailbox S1] ─► delivery task S1 ─► socket
//!       ├──────────► [mailbox S2] ─► delivery task S2 ─► socket
//!       ├──────────► [mailbox SN] ─► delivery task SN ─► socket
//!       └──────────► sinks (telemetry publisher, ...)
//! ```
//!
//! Guarantees:
//! - per-subscriber FIFO in `publish` order;
//! - no ordering across subscribers;
//! - registration (including history replay) is atomic with respect to
//!   `publish`, so a subscriber joining with `since` sees no gap and no
//!   duplicate between replayed and live envelopes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use conductor_types::{Envelope, SubscriberId};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::debug;

use crate::config::DispatcherConfig;

/// Lock a std mutex, recovering the guard if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A consumer of every published envelope that is not a stream subscriber.
///
/// `offer` runs on the publishing task and must not block: implementations
/// hand the envelope to their own queue and return.
pub trait EnvelopeSink: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Accept an envelope for asynchronous processing.
    fn offer(&self, envelope: &Arc<Envelope>);
}

// ---------------------------------------------------------------------------
// Mailbox
// ---------------------------------------------------------------------------

/// Bounded drop-oldest queue feeding one subscriber.
#[derive(Debug)]
struct Mailbox {
    queue: Mutex<VecDeque<Arc<Envelope>>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
    last_activity: Mutex<DateTime<Utc>>,
}

impl Mailbox {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            last_activity: Mutex::new(Utc::now()),
        }
    }

    /// Enqueue, evicting the oldest entry when full. Returns `true` on eviction.
    fn push(&self, envelope: Arc<Envelope>) -> bool {
        let evicted = {
            let mut queue = lock(&self.queue);
            let evicted = if queue.len() >= self.capacity {
                queue.pop_front().is_some()
            } else {
                false
            };
            queue.push_back(envelope);
            evicted
        };
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }

    fn pop(&self) -> Option<Arc<Envelope>> {
        let envelope = lock(&self.queue).pop_front();
        if envelope.is_some() {
            *lock(&self.last_activity) = Utc::now();
        }
        envelope
    }

    fn len(&self) -> usize {
        lock(&self.queue).len()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Receiving end of one subscriber's mailbox.
///
/// Dropping the subscription unregisters it from the dispatcher.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    mailbox: Arc<Mailbox>,
    dispatcher: Weak<Inner>,
}

impl Subscription {
    /// This subscriber's identifier.
    pub const fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next envelope.
    ///
    /// Returns `None` once the subscriber has been removed (by
    /// [`Dispatcher::unsubscribe`] or [`Dispatcher::close`]) and its mailbox
    /// is empty.
    pub async fn recv(&self) -> Option<Arc<Envelope>> {
        loop {
            if let Some(envelope) = self.mailbox.pop() {
                return Some(envelope);
            }
            if self.mailbox.is_closed() {
                return None;
            }
            self.mailbox.notify.notified().await;
        }
    }

    /// Take the next envelope if one is already buffered.
    pub fn try_recv(&self) -> Option<Arc<Envelope>> {
        self.mailbox.pop()
    }

    /// Envelopes discarded from this mailbox because it was full.
    pub fn dropped(&self) -> u64 {
        self.mailbox.dropped.load(Ordering::Relaxed)
    }

    /// Envelopes currently buffered.
    pub fn queued(&self) -> usize {
        self.mailbox.len()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.dispatcher.upgrade() {
            inner.remove(self.id);
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Point-in-time view of one subscriber.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriberInfo {
    /// Subscriber identifier.
    pub id: SubscriberId,
    /// Envelopes waiting in its mailbox.
    pub queued: usize,
    /// Envelopes dropped from its mailbox.
    pub dropped: u64,
    /// Last time the subscriber took an envelope.
    pub last_activity: DateTime<Utc>,
}

/// Dispatcher counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    /// Live subscribers.
    pub subscribers: usize,
    /// Envelopes published since start.
    pub published: u64,
    /// Envelopes dropped across all mailboxes since start.
    pub dropped: u64,
    /// Envelopes retained for replay.
    pub history: usize,
}

#[derive(Debug, Default)]
struct Registry {
    subscribers: HashMap<SubscriberId, Arc<Mailbox>>,
    history: VecDeque<Arc<Envelope>>,
}

struct Inner {
    registry: Mutex<Registry>,
    sinks: Vec<Arc<dyn EnvelopeSink>>,
    mailbox_capacity: usize,
    history_capacity: usize,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("sinks", &self.sinks.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field("mailbox_capacity", &self.mailbox_capacity)
            .field("history_capacity", &self.history_capacity)
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn remove(&self, id: SubscriberId) -> bool {
        let removed = lock(&self.registry).subscribers.remove(&id);
        removed.is_some_and(|mailbox| {
            mailbox.close();
            debug!(subscriber = %id, "subscriber removed");
            true
        })
    }
}

/// Cloneable handle to the fan-out broker.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Create a dispatcher with the given sinks.
    pub fn new(config: &DispatcherConfig, sinks: Vec<Arc<dyn EnvelopeSink>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry::default()),
                sinks,
                mailbox_capacity: config.mailbox_capacity.max(1),
                history_capacity: config.history_capacity,
                published: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Fan an envelope out to every subscriber and sink.
    ///
    /// Returns the number of subscribers it was queued for. Never blocks on
    /// delivery.
    pub fn publish(&self, envelope: Arc<Envelope>) -> usize {
        let delivered = {
            let mut registry = lock(&self.inner.registry);
            if self.inner.history_capacity > 0 {
                if registry.history.len() >= self.inner.history_capacity {
                    registry.history.pop_front();
                }
                registry.history.push_back(Arc::clone(&envelope));
            }
            for (id, mailbox) in &registry.subscribers {
                if mailbox.push(Arc::clone(&envelope)) {
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        subscriber = %id,
                        seq = envelope.seq,
                        "subscriber mailbox full, dropped oldest envelope"
                    );
                }
            }
            registry.subscribers.len()
        };
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        for sink in &self.inner.sinks {
            sink.offer(&envelope);
        }

        delivered
    }

    /// Register a subscriber that receives envelopes published from now on.
    pub fn subscribe(&self) -> Subscription {
        self.subscribe_since(None)
    }

    /// Register a subscriber, first replaying retained envelopes with
    /// `seq > since`.
    ///
    /// Replay is subject to the same mailbox bound as live delivery.
    pub fn subscribe_since(&self, since: Option<u64>) -> Subscription {
        let id = SubscriberId::new();
        let mailbox = Arc::new(Mailbox::new(self.inner.mailbox_capacity));
        {
            let mut registry = lock(&self.inner.registry);
            if let Some(since) = since {
                for envelope in registry.history.iter().filter(|e| e.seq > since) {
                    if mailbox.push(Arc::clone(envelope)) {
                        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            registry.subscribers.insert(id, Arc::clone(&mailbox));
        }
        debug!(subscriber = %id, ?since, "subscriber registered");
        Subscription {
            id,
            mailbox,
            dispatcher: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a subscriber. Returns `false` if it was not registered.
    ///
    /// The subscriber's pending `recv` wakes up and drains what is left.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.inner.remove(id)
    }

    /// Remove every subscriber (process shutdown). Queues are not drained.
    pub fn close(&self) {
        let drained: Vec<Arc<Mailbox>> = lock(&self.inner.registry)
            .subscribers
            .drain()
            .map(|(_, mailbox)| mailbox)
            .collect();
        for mailbox in &drained {
            mailbox.close();
        }
    }

    /// Counters for `/metrics`.
    pub fn stats(&self) -> DispatcherStats {
        let registry = lock(&self.inner.registry);
        DispatcherStats {
            subscribers: registry.subscribers.len(),
            published: self.inner.published.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            history: registry.history.len(),
        }
    }

    /// Per-subscriber view.
    pub fn subscribers(&self) -> Vec<SubscriberInfo> {
        let registry = lock(&self.inner.registry);
        registry
            .subscribers
            .iter()
            .map(|(id, mailbox)| SubscriberInfo {
                id: *id,
                queued: mailbox.len(),
                dropped: mailbox.dropped.load(Ordering::Relaxed),
                last_activity: *lock(&mailbox.last_activity),
            })
            .collect()
    }
}
