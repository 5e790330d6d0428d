//! Conductor binary: the coordination core behind a streaming control
//! surface.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `CONDUCTOR_CONFIG` or `conductor-config.yaml`
//! 2. Initialize structured logging (tracing)
//! 3. Start telemetry, dispatcher and state manager
//! 4. Bind the HTTP listener and serve until `Ctrl-C`
//! 5. Stop background tasks and close open streams

use conductor_server::server;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Application entry point.
///
/// # Errors
///
/// Returns an error if configuration, binding, or serving fails.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (config, source) = conductor_server::load_config()?;
    conductor_server::init_tracing(&config.logging);
    match source {
        Some(path) => info!(path = %path.display(), "configuration loaded"),
        None => info!("config file not found, using defaults"),
    }
    info!(
        host = config.server.host,
        port = config.server.port,
        telemetry = config.telemetry.enabled,
        "conductor starting"
    );

    let cancel = CancellationToken::new();
    let conductor = conductor_server::start(&config, cancel.clone())?;
    let listener = server::bind(&config.server).await?;

    let mut serve = tokio::spawn(server::serve(listener, conductor.app(), cancel));

    let served = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "failed to listen for Ctrl-C");
            }
            info!("shutdown requested");
            None
        }
        result = &mut serve => Some(result),
    };

    conductor.shutdown().await;
    let result = match served {
        Some(result) => result,
        None => serve.await,
    };
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "server exited with error"),
        Err(e) => error!(error = %e, "server task ended abnormally"),
    }

    info!("conductor stopped");
    Ok(())
}
