//! `GET /stream`: the live envelope stream.
//!
//! One route serves two transports. A request carrying `WebSocket` upgrade
//! headers gets one envelope per text frame; a plain HTTP request gets a
//! chunked NDJSON body with one envelope per line. Both register a
//! dispatcher subscription, optionally replaying retained history after
//! `?since=<seq>`, and both advertise the process stream epoch in the
//! `x-conductor-epoch` header so reconnecting clients can detect a restart.
//!
//! Quiet streams get a keepalive every `server.keepalive_ms`: a blank line
//! on NDJSON, a `Ping` frame on `WebSocket`.
//!
//! A slow consumer never holds up the pipeline: its mailbox drops the oldest
//! envelopes and the subscriber's drop counter shows up in `/metrics`.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderValue, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use conductor_core::Subscription;
use conductor_stream::EPOCH_HEADER;
use serde::Deserialize;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};
use tracing::{debug, warn};

use crate::state::AppState;

/// Query parameters of `GET /stream`.
#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    /// Replay retained envelopes with a greater `seq` before going live.
    pub since: Option<u64>,
}

/// Upgrade to a `WebSocket` when requested, otherwise stream NDJSON.
///
/// # Route
///
/// `GET /stream`
pub async fn stream(
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(app): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
) -> Response {
    let subscription = app.dispatcher.subscribe_since(query.since);
    debug!(
        subscriber = %subscription.id(),
        since = ?query.since,
        websocket = upgrade.is_ok(),
        "stream subscriber connected"
    );

    let keepalive = app.keepalive;
    let mut response = match upgrade {
        Ok(ws) => ws
            .on_upgrade(move |socket| deliver_ws(socket, subscription, keepalive))
            .into_response(),
        Err(_) => ndjson(subscription, keepalive),
    };

    match HeaderValue::from_str(&app.epoch) {
        Ok(value) => {
            response.headers_mut().insert(EPOCH_HEADER, value);
        }
        Err(e) => warn!(error = %e, "stream epoch is not a valid header value"),
    }
    response
}

/// Ticker that fires once per `every` of silence on a stream.
fn keepalive_ticker(every: Duration) -> Interval {
    let mut ticker = interval_at(
        Instant::now().checked_add(every).unwrap_or_else(Instant::now),
        every,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Build a chunked NDJSON body that drains `subscription`.
///
/// A quiet stream gets a blank line every `keepalive` so clients can tell
/// an idle connection from a dead one. The body ends when the subscriber
/// is removed (dispatcher shutdown).
fn ndjson(subscription: Subscription, keepalive: Duration) -> Response {
    let ticker = keepalive_ticker(keepalive);
    let lines = futures::stream::unfold(
        (subscription, ticker),
        |(subscription, mut ticker)| async move {
            loop {
                tokio::select! {
                    envelope = subscription.recv() => {
                        let envelope = envelope?;
                        match envelope.to_line() {
                            Ok(line) => {
                                ticker.reset();
                                let chunk = Ok::<_, Infallible>(Bytes::from(line));
                                return Some((chunk, (subscription, ticker)));
                            }
                            Err(e) => {
                                warn!(error = %e, seq = envelope.seq, "failed to encode envelope");
                            }
                        }
                    }
                    _ = ticker.tick() => {
                        let chunk = Ok(Bytes::from_static(b"\n"));
                        return Some((chunk, (subscription, ticker)));
                    }
                }
            }
        },
    );

    let mut response = Body::from_stream(lines).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/x-ndjson"),
    );
    response
}

/// Forward each envelope as a text frame until either side goes away.
///
/// A quiet socket gets a `Ping` every `keepalive`.
async fn deliver_ws(mut socket: WebSocket, subscription: Subscription, keepalive: Duration) {
    let mut ticker = keepalive_ticker(keepalive);
    loop {
        tokio::select! {
            envelope = subscription.recv() => {
                let Some(envelope) = envelope else {
                    debug!("subscriber removed, closing WebSocket");
                    if let Err(e) = socket.send(Message::Close(None)).await {
                        debug!(error = %e, "WebSocket close frame not sent");
                    }
                    return;
                };
                let json = match serde_json::to_string(envelope.as_ref()) {
                    Ok(j) => j,
                    Err(e) => {
                        warn!(error = %e, seq = envelope.seq, "failed to encode envelope");
                        continue;
                    }
                };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    debug!("WebSocket client disconnected (send failed)");
                    return;
                }
                ticker.reset();
            }
            _ = ticker.tick() => {
                if socket.send(Message::Ping(Bytes::new())).await.is_err() {
                    debug!("WebSocket client disconnected (ping failed)");
                    return;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("WebSocket client disconnected");
                        return;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            debug!("WebSocket client disconnected (pong failed)");
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "WebSocket error");
                        return;
                    }
                    _ => {
                        // Clients have nothing to say on this stream.
                    }
                }
            }
        }
    }
}
