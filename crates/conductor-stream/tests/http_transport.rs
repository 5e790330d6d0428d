//! `HttpTransport` against a real Axum server bound on `127.0.0.1:0`.

#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::routing::get;
use chrono::Utc;
use conductor_core::BackoffPolicy;
use conductor_stream::{EPOCH_HEADER, HttpTransport, StreamClient, StreamError, Transport};
use conductor_types::{Envelope, Event};
use futures::StreamExt;
use tokio::sync::mpsc;

#[derive(Clone, Default)]
struct Recorded {
    since: Arc<Mutex<Vec<Option<u64>>>>,
}

async fn stream(
    State(recorded): State<Recorded>,
    Query(params): Query<HashMap<String, String>>,
) -> ([(&'static str, &'static str); 1], String) {
    let since = params.get("since").and_then(|s| s.parse::<u64>().ok());
    recorded.since.lock().unwrap().push(since);
    let body: String = (1..=3)
        .filter(|seq| since.is_none_or(|s| *seq > s))
        .map(|seq| {
            Envelope::new(
                seq,
                Utc::now(),
                Event::ObsScene {
                    scene: format!("scene-{seq}"),
                },
            )
            .to_line()
            .unwrap()
        })
        .collect();
    ([(EPOCH_HEADER, "epoch-1")], body)
}

async fn serve() -> (String, Recorded) {
    let recorded = Recorded::default();
    let app = Router::new()
        .route("/stream", get(stream))
        .with_state(recorded.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), recorded)
}

#[tokio::test]
async fn connect_reads_epoch_and_body() {
    let (base, _recorded) = serve().await;
    let transport = HttpTransport::new(format!("{base}/stream")).unwrap();

    let connection = transport.connect(None).await.unwrap();
    assert_eq!(connection.epoch.as_deref(), Some("epoch-1"));

    let bytes: Vec<u8> = connection
        .chunks
        .map(|c| c.unwrap().to_vec())
        .concat()
        .await;
    let text = String::from_utf8(bytes).unwrap();
    assert_eq!(text.lines().count(), 3);
}

#[tokio::test]
async fn non_success_status_is_reported() {
    let (base, _recorded) = serve().await;
    let transport = HttpTransport::new(format!("{base}/nope")).unwrap();
    let result = transport.connect(None).await;
    assert_eq!(result.err(), Some(StreamError::Status(404)));
}

#[tokio::test]
async fn client_resumes_with_since_after_server_closes() {
    let (base, recorded) = serve().await;
    let transport = HttpTransport::new(format!("{base}/stream")).unwrap();
    let policy = BackoffPolicy {
        base: Duration::from_millis(20),
        max: Duration::from_millis(100),
        sustained_open: Duration::from_secs(5),
    };
    let (tx, mut rx) = mpsc::channel(16);
    let handle = StreamClient::new(transport, policy, 64 * 1024).spawn(tx);

    let mut seqs = Vec::new();
    for _ in 0..3 {
        seqs.push(rx.recv().await.unwrap().seq);
    }
    assert_eq!(seqs, vec![1, 2, 3]);

    // Wait for at least one reconnect.
    tokio::time::timeout(Duration::from_secs(5), async {
        while recorded.since.lock().unwrap().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    handle.shutdown().await;

    let since = recorded.since.lock().unwrap().clone();
    assert_eq!(since.first(), Some(&None));
    assert_eq!(since.get(1), Some(&Some(3)));
    assert!(rx.try_recv().is_err());
}
