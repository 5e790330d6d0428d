//! Process wiring for the Conductor binary and integration tests.
//!
//! [`start`] builds the runtime in dependency order: telemetry first (it is
//! a dispatcher sink), then the dispatcher, then the state manager that
//! publishes into it. The returned [`Conductor`] owns the background tasks
//! and tears them down in reverse on [`Conductor::shutdown`].

use std::path::PathBuf;
use std::sync::Arc;

use conductor_core::config::LoggingConfig;
use conductor_core::{
    ConductorConfig, ConfigError, Dispatcher, EnvelopeSink, LogSummaryTrigger, StateManager,
};
use conductor_telemetry::{TelemetryError, TelemetryPublisher};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::state::AppState;

/// Errors that can occur while starting Conductor.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    /// The telemetry publisher could not be built.
    #[error("telemetry start error: {0}")]
    Telemetry(#[from] TelemetryError),
}

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "CONDUCTOR_CONFIG";

/// Load configuration from [`CONFIG_ENV`], else `conductor-config.yaml` in
/// the working directory.
///
/// A missing file is not an error: defaults plus environment overrides are
/// used instead. Returns the path that was read, if any, so the caller can
/// log it once tracing is up.
pub fn load_config() -> Result<(ConductorConfig, Option<PathBuf>), ConfigError> {
    let path = std::env::var_os(CONFIG_ENV)
        .map_or_else(|| PathBuf::from("conductor-config.yaml"), PathBuf::from);
    if path.exists() {
        let config = ConductorConfig::from_file(&path)?;
        Ok((config, Some(path)))
    } else {
        let mut config = ConductorConfig::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok((config, None))
    }
}

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins over `logging.level`. Returns `false` when a subscriber
/// was already installed, in which case nothing changes.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.is_ok()
}

/// A running Conductor core.
#[derive(Debug)]
pub struct Conductor {
    app: Arc<AppState>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Wire telemetry, dispatcher and state manager under `cancel`.
///
/// Must be called from within a Tokio runtime.
///
/// # Errors
///
/// Returns [`StartupError::Telemetry`] if telemetry is enabled and its HTTP
/// client cannot be built.
pub fn start(config: &ConductorConfig, cancel: CancellationToken) -> Result<Conductor, StartupError> {
    let mut tasks = Vec::new();
    let mut sinks: Vec<Arc<dyn EnvelopeSink>> = Vec::new();

    let telemetry = if config.telemetry.enabled {
        let (publisher, task) = TelemetryPublisher::spawn(
            &config.telemetry,
            config.backoff.policy(),
            cancel.child_token(),
        )?;
        tasks.push(task);
        sinks.push(Arc::new(publisher.clone()));
        Some(publisher)
    } else {
        info!("telemetry disabled");
        None
    };

    let dispatcher = Dispatcher::new(&config.dispatcher, sinks);
    let (state, task) = StateManager::spawn(
        config,
        dispatcher.clone(),
        Arc::new(LogSummaryTrigger),
        cancel.child_token(),
    );
    tasks.push(task);

    let epoch = Uuid::now_v7().to_string();
    info!(
        %epoch,
        mailbox_capacity = config.dispatcher.mailbox_capacity,
        history_capacity = config.dispatcher.history_capacity,
        summary_interval = config.memory.summary_interval,
        "conductor core started"
    );

    Ok(Conductor {
        app: Arc::new(AppState::new(
            state,
            dispatcher,
            telemetry,
            epoch,
            config.server.keepalive(),
        )),
        cancel,
        tasks,
    })
}

impl Conductor {
    /// Shared handler state.
    pub fn app(&self) -> Arc<AppState> {
        Arc::clone(&self.app)
    }

    /// Stop the background tasks and end open streams.
    ///
    /// Subsequent mutations through any surviving [`AppState`] answer
    /// `503`.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.app.dispatcher.close();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        info!("conductor core stopped");
    }
}
