//! Reconnect-loop tests against scripted in-memory transports.
//!
//! Tokio's clock is paused so backoff delays are observed exactly and the
//! tests finish instantly.

#![allow(clippy::unwrap_used)]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use conductor_core::BackoffPolicy;
use conductor_stream::{Connection, ConnectionState, StreamClient, StreamError, Transport};
use conductor_types::{Envelope, Event};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;

enum Step {
    Fail,
    Open {
        epoch: Option<&'static str>,
        chunks: Vec<String>,
        /// `None` keeps the connection open forever.
        close_after: Option<Duration>,
    },
    /// Sends `first`, then a blank line every `every`, forever.
    Keepalive { first: String, every: Duration },
}

#[derive(Clone, Default)]
struct Scripted {
    steps: Arc<Mutex<VecDeque<Step>>>,
    calls: Arc<Mutex<Vec<(Instant, Option<u64>)>>>,
}

impl Scripted {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Arc::new(Mutex::new(steps.into())),
            calls: Arc::default(),
        }
    }

    fn since_values(&self) -> Vec<Option<u64>> {
        self.calls.lock().unwrap().iter().map(|(_, s)| *s).collect()
    }

    fn gaps(&self) -> Vec<Duration> {
        let calls = self.calls.lock().unwrap();
        calls
            .windows(2)
            .map(|w| w[1].0.duration_since(w[0].0))
            .collect()
    }
}

impl Transport for Scripted {
    fn connect(
        &self,
        since: Option<u64>,
    ) -> impl Future<Output = Result<Connection, StreamError>> + Send {
        self.calls.lock().unwrap().push((Instant::now(), since));
        let step = self.steps.lock().unwrap().pop_front().unwrap_or(Step::Fail);
        async move {
            match step {
                Step::Fail => Err(StreamError::Connect("connection refused".to_owned())),
                Step::Open {
                    epoch,
                    chunks,
                    close_after,
                } => {
                    let data = futures::stream::iter(
                        chunks.into_iter().map(|c| Ok::<_, StreamError>(Bytes::from(c))),
                    );
                    let chunks = match close_after {
                        Some(after) => data
                            .chain(
                                futures::stream::once(tokio::time::sleep(after))
                                    .filter_map(|()| futures::future::ready(None)),
                            )
                            .boxed(),
                        None => data.chain(futures::stream::pending()).boxed(),
                    };
                    Ok(Connection {
                        epoch: epoch.map(str::to_owned),
                        chunks,
                    })
                }
                Step::Keepalive { first, every } => {
                    let blanks = futures::stream::unfold((), move |()| async move {
                        tokio::time::sleep(every).await;
                        Some((Ok::<_, StreamError>(Bytes::from_static(b"\n")), ()))
                    });
                    let first = futures::future::ready(Ok(Bytes::from(first)));
                    let chunks = futures::stream::once(first).chain(blanks).boxed();
                    Ok(Connection {
                        epoch: None,
                        chunks,
                    })
                }
            }
        }
    }
}

fn policy() -> BackoffPolicy {
    BackoffPolicy {
        base: Duration::from_millis(500),
        max: Duration::from_secs(10),
        sustained_open: Duration::from_secs(5),
    }
}

fn line(seq: u64) -> String {
    Envelope::new(
        seq,
        Utc::now(),
        Event::ObsScene {
            scene: format!("scene-{seq}"),
        },
    )
    .to_line()
    .unwrap()
}

fn lines(seqs: &[u64]) -> String {
    seqs.iter().map(|s| line(*s)).collect()
}

async fn collect(rx: &mut mpsc::Receiver<Envelope>, n: usize) -> Vec<u64> {
    let mut out = Vec::new();
    while out.len() < n {
        out.push(rx.recv().await.unwrap().seq);
    }
    out
}

#[tokio::test(start_paused = true)]
async fn failed_connects_follow_doubling_schedule_with_cap() {
    let transport = Scripted::new(Vec::new());
    let (tx, _rx) = mpsc::channel(16);
    let handle = StreamClient::new(transport.clone(), policy(), 4096).spawn(tx);

    tokio::time::sleep(Duration::from_secs(40)).await;
    handle.shutdown().await;

    let gaps: Vec<u64> = transport
        .gaps()
        .iter()
        .take(7)
        .map(|d| u64::try_from(d.as_millis()).unwrap())
        .collect();
    assert_eq!(gaps, vec![500, 1000, 2000, 4000, 8000, 10_000, 10_000]);
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_backoff_prevents_reconnect() {
    let transport = Scripted::new(Vec::new());
    let (tx, _rx) = mpsc::channel(16);
    let handle = StreamClient::new(transport.clone(), policy(), 4096).spawn(tx);
    let state = handle.watch_state();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.since_values().len(), 1);
    handle.shutdown().await;

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.since_values().len(), 1);
    assert_eq!(*state.borrow(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn dropping_handle_cancels_loop() {
    let transport = Scripted::new(Vec::new());
    let (tx, _rx) = mpsc::channel(16);
    let handle = StreamClient::new(transport.clone(), policy(), 4096).spawn(tx);

    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(handle);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.since_values().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn sustained_open_resets_backoff() {
    let transport = Scripted::new(vec![
        Step::Fail,
        Step::Fail,
        Step::Open {
            epoch: None,
            chunks: Vec::new(),
            close_after: Some(Duration::from_secs(6)),
        },
    ]);
    let (tx, _rx) = mpsc::channel(16);
    let handle = StreamClient::new(transport.clone(), policy(), 4096).spawn(tx);

    tokio::time::sleep(Duration::from_secs(10)).await;
    handle.shutdown().await;

    let gaps = transport.gaps();
    assert_eq!(gaps.first(), Some(&Duration::from_millis(500)));
    assert_eq!(gaps.get(1), Some(&Duration::from_millis(1000)));
    // Six seconds open, then the schedule starts again at the base delay.
    assert_eq!(gaps.get(2), Some(&Duration::from_millis(6500)));
    assert_eq!(gaps.get(3), Some(&Duration::from_millis(1000)));
}

#[tokio::test(start_paused = true)]
async fn short_open_keeps_escalating() {
    let transport = Scripted::new(vec![
        Step::Fail,
        Step::Fail,
        Step::Open {
            epoch: None,
            chunks: Vec::new(),
            close_after: Some(Duration::from_secs(1)),
        },
    ]);
    let (tx, _rx) = mpsc::channel(16);
    let handle = StreamClient::new(transport.clone(), policy(), 4096).spawn(tx);

    tokio::time::sleep(Duration::from_secs(10)).await;
    handle.shutdown().await;

    assert_eq!(transport.gaps().get(2), Some(&Duration::from_millis(3000)));
}

#[tokio::test(start_paused = true)]
async fn reconnect_resumes_after_last_seq_without_duplicates() {
    let transport = Scripted::new(vec![
        Step::Open {
            epoch: Some("a"),
            chunks: vec![lines(&[1, 2, 3])],
            close_after: Some(Duration::ZERO),
        },
        Step::Open {
            epoch: Some("a"),
            chunks: vec![lines(&[2, 3, 4])],
            close_after: None,
        },
    ]);
    let (tx, mut rx) = mpsc::channel(16);
    let handle = StreamClient::new(transport.clone(), policy(), 4096).spawn(tx);

    assert_eq!(collect(&mut rx, 4).await, vec![1, 2, 3, 4]);
    assert_eq!(transport.since_values(), vec![None, Some(3)]);
    assert_eq!(handle.stats().duplicates(), 2);
    assert_eq!(handle.stats().delivered(), 4);
    assert_eq!(handle.state(), ConnectionState::Open);
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn envelope_split_across_chunks_is_delivered_once() {
    let payload = lines(&[10, 11]);
    let (a, b) = payload.split_at(payload.len() / 3);
    let transport = Scripted::new(vec![Step::Open {
        epoch: None,
        chunks: vec![a.to_owned(), b.to_owned()],
        close_after: None,
    }]);
    let (tx, mut rx) = mpsc::channel(16);
    let handle = StreamClient::new(transport, policy(), 4096).spawn(tx);

    assert_eq!(collect(&mut rx, 2).await, vec![10, 11]);
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn epoch_change_resets_watermark_and_resyncs() {
    let transport = Scripted::new(vec![
        Step::Open {
            epoch: Some("a"),
            chunks: vec![lines(&[5, 6])],
            close_after: Some(Duration::ZERO),
        },
        Step::Open {
            epoch: Some("b"),
            chunks: vec![lines(&[7])],
            close_after: None,
        },
        Step::Open {
            epoch: Some("b"),
            chunks: vec![lines(&[1, 2])],
            close_after: None,
        },
    ]);
    let (tx, mut rx) = mpsc::channel(16);
    let handle = StreamClient::new(transport.clone(), policy(), 4096).spawn(tx);

    assert_eq!(collect(&mut rx, 4).await, vec![5, 6, 1, 2]);
    assert_eq!(transport.since_values(), vec![None, Some(6), Some(0)]);
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn loop_stops_when_receiver_is_dropped() {
    let transport = Scripted::new(vec![Step::Open {
        epoch: None,
        chunks: vec![lines(&[1, 2])],
        close_after: None,
    }]);
    let (tx, rx) = mpsc::channel(1);
    drop(rx);
    let handle = StreamClient::new(transport.clone(), policy(), 4096).spawn(tx);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(transport.since_values().len(), 1);
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn silent_connection_times_out_and_resumes() {
    let transport = Scripted::new(vec![
        Step::Open {
            epoch: Some("a"),
            chunks: vec![lines(&[1])],
            close_after: None,
        },
        Step::Open {
            epoch: Some("a"),
            chunks: vec![lines(&[2])],
            close_after: None,
        },
    ]);
    let (tx, mut rx) = mpsc::channel(16);
    let handle = StreamClient::new(transport.clone(), policy(), 4096)
        .with_idle_timeout(Duration::from_secs(15))
        .spawn(tx);

    assert_eq!(collect(&mut rx, 2).await, vec![1, 2]);
    assert_eq!(transport.since_values(), vec![None, Some(1)]);
    // Fifteen silent seconds count as a sustained open, so the retry uses
    // the base delay.
    assert_eq!(transport.gaps(), vec![Duration::from_millis(15_500)]);
    assert_eq!(handle.stats().connects(), 2);
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn keepalive_lines_hold_connection_open() {
    let transport = Scripted::new(vec![Step::Keepalive {
        first: lines(&[1]),
        every: Duration::from_secs(10),
    }]);
    let (tx, mut rx) = mpsc::channel(16);
    let handle = StreamClient::new(transport.clone(), policy(), 4096)
        .with_idle_timeout(Duration::from_secs(15))
        .spawn(tx);

    assert_eq!(collect(&mut rx, 1).await, vec![1]);
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(transport.since_values().len(), 1);
    assert_eq!(handle.state(), ConnectionState::Open);
    assert_eq!(handle.stats().malformed(), 0);
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn bad_lines_are_counted_and_skipped() {
    let oversized = format!("{}\n", "x".repeat(5000));
    let transport = Scripted::new(vec![Step::Open {
        epoch: None,
        chunks: vec!["not json\n".to_owned(), oversized, lines(&[1, 2])],
        close_after: None,
    }]);
    let (tx, mut rx) = mpsc::channel(16);
    let handle = StreamClient::new(transport, policy(), 4096).spawn(tx);

    assert_eq!(collect(&mut rx, 2).await, vec![1, 2]);
    assert_eq!(handle.stats().malformed(), 1);
    assert_eq!(handle.stats().oversized(), 1);
    handle.shutdown().await;
}
