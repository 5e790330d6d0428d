//! Conductor HTTP server lifecycle management.
//!
//! Provides [`start_server`] which binds to a TCP port and runs the Axum
//! server until the provided [`CancellationToken`] fires.

use std::net::SocketAddr;
use std::sync::Arc;

use conductor_core::config::ServerSection;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::router::build_router;
use crate::state::AppState;

/// Bind the configured address.
///
/// Split from [`serve`] so callers learn about bind failures (and the
/// actual port, when `0` was requested) before the server task starts.
///
/// # Errors
///
/// Returns [`ServerError::Bind`] if the address is invalid or in use.
pub async fn bind(config: &ServerSection) -> Result<TcpListener, ServerError> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| ServerError::Bind(format!("invalid address: {e}")))?;

    TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::Bind(format!("bind failed on {addr}: {e}")))
}

/// Serve requests on `listener` until `cancel` fires.
///
/// In-flight requests finish; open streams end once the dispatcher closes
/// their subscriptions.
///
/// # Errors
///
/// Returns [`ServerError::Serve`] on a fatal I/O error.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    let router = build_router(state);
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Conductor server listening");
    }

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| ServerError::Serve(format!("serve error: {e}")))
}

/// Bind and serve in one step.
///
/// # Errors
///
/// Returns an error if binding or serving fails.
pub async fn start_server(
    config: &ServerSection,
    state: Arc<AppState>,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    let listener = bind(config).await?;
    serve(listener, state, cancel).await
}

/// Errors that can occur when starting or running the Conductor server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind to the network address.
    #[error("bind error: {0}")]
    Bind(String),

    /// The server encountered a fatal error while serving.
    #[error("serve error: {0}")]
    Serve(String),
}
