//! Conductor relay: follows a remote Conductor stream and forwards every
//! envelope to the telemetry store.
//!
//! Runs out of process so a metrics store outage or a slow network never
//! touches the core. The stream client resumes with `?since=` after drops,
//! so envelopes are forwarded once each across reconnects.

use std::sync::Arc;

use conductor_stream::{HttpTransport, StreamClient};
use conductor_telemetry::TelemetryPublisher;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Envelopes buffered between the stream client and the publisher.
const RELAY_BUFFER: usize = 256;

/// Application entry point.
///
/// # Errors
///
/// Returns an error if configuration or client construction fails.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (config, source) = conductor_server::load_config()?;
    conductor_server::init_tracing(&config.logging);
    if let Some(path) = source {
        info!(path = %path.display(), "configuration loaded");
    }
    if !config.telemetry.enabled {
        warn!("telemetry.enabled is false; the relay forwards regardless");
    }

    let cancel = CancellationToken::new();
    let policy = config.backoff.policy();
    let (publisher, telemetry_task) =
        TelemetryPublisher::spawn(&config.telemetry, policy, cancel.child_token())?;

    let transport = HttpTransport::new(config.stream.url.clone())?;
    let (tx, mut rx) = mpsc::channel(RELAY_BUFFER);
    let stream = StreamClient::new(transport, policy, config.stream.max_line_bytes)
        .with_idle_timeout(config.stream.idle_timeout())
        .spawn(tx);
    info!(url = config.stream.url, "relay following stream");

    loop {
        tokio::select! {
            envelope = rx.recv() => {
                let Some(envelope) = envelope else {
                    warn!("stream client stopped");
                    break;
                };
                // Drops are counted by the publisher.
                let _ = publisher.publish(Arc::new(envelope));
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "failed to listen for Ctrl-C");
                }
                info!("shutdown requested");
                break;
            }
        }
    }

    let stats = stream.stats();
    info!(
        connects = stats.connects(),
        delivered = stats.delivered(),
        duplicates = stats.duplicates(),
        malformed = stats.malformed(),
        oversized = stats.oversized(),
        "stream client stopping"
    );
    stream.shutdown().await;
    cancel.cancel();
    if let Err(e) = telemetry_task.await {
        error!(error = %e, "telemetry task ended abnormally");
    }

    let sent = publisher.stats();
    info!(sent = sent.sent, failed = sent.failed, dropped = sent.dropped, "relay stopped");
    Ok(())
}
