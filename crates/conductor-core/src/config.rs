//! Configuration loading and typed config structures for Conductor.
//!
//! The canonical configuration lives in `conductor-config.yaml` at the
//! project root. This module defines strongly-typed structs that mirror the
//! YAML structure, and provides a loader that reads, overrides from the
//! environment, and validates the file. Every field has a default, so an
//! empty document is a valid configuration.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::backoff::BackoffPolicy;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// A value parsed but is not usable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level Conductor configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ConductorConfig {
    /// HTTP listener settings.
    #[serde(default)]
    pub server: ServerSection,

    /// Fan-out settings.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// State manager settings (health, initial values).
    #[serde(default)]
    pub state: StateConfig,

    /// Memory bookkeeping.
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Reconnect/retry schedule shared by the stream client and telemetry.
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Outbound telemetry.
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Stream client settings (used by the relay).
    #[serde(default)]
    pub stream: StreamConfig,

    /// Logging.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ConductorConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// Environment variables override YAML values:
    /// - `CONDUCTOR_HOST` overrides `server.host`
    /// - `CONDUCTOR_PORT` overrides `server.port`
    /// - `TELEMETRY_BASE_URL` overrides `telemetry.base_url`
    /// - `TELEMETRY_API_KEY` overrides `telemetry.api_key` (empty clears it)
    /// - `CONDUCTOR_STREAM_URL` overrides `stream.url`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if the content is not valid YAML, or
    /// [`ConfigError::Invalid`] if validation fails.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = serde_yml::from_str(&contents)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a YAML string.
    ///
    /// No environment overrides are applied.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML, or
    /// [`ConfigError::Invalid`] if validation fails.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Override values with environment variables when set.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `CONDUCTOR_PORT` is not a port.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("CONDUCTOR_HOST") {
            self.server.host = val;
        }
        if let Ok(val) = std::env::var("CONDUCTOR_PORT") {
            self.server.port = val
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("CONDUCTOR_PORT={val}: {e}")))?;
        }
        if let Ok(val) = std::env::var("TELEMETRY_BASE_URL") {
            self.telemetry.base_url = val;
        }
        if let Ok(val) = std::env::var("TELEMETRY_API_KEY") {
            self.telemetry.api_key = Some(val).filter(|k| !k.is_empty());
        }
        if let Ok(val) = std::env::var("CONDUCTOR_STREAM_URL") {
            self.stream.url = val;
        }
        Ok(())
    }

    /// Reject values the runtime cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("dispatcher.mailbox_capacity", self.dispatcher.mailbox_capacity),
            ("dispatcher.history_capacity", self.dispatcher.history_capacity),
            ("state.command_capacity", self.state.command_capacity),
            ("telemetry.queue_capacity", self.telemetry.queue_capacity),
            ("stream.max_line_bytes", self.stream.max_line_bytes),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
        }
        if self.memory.summary_interval == 0 {
            return Err(ConfigError::Invalid(
                "memory.summary_interval must be greater than 0".to_owned(),
            ));
        }
        if self.state.health_sweep_ms == 0 {
            return Err(ConfigError::Invalid(
                "state.health_sweep_ms must be greater than 0".to_owned(),
            ));
        }
        if self.backoff.base_ms == 0 || self.backoff.base_ms > self.backoff.max_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff.base_ms ({}) must be in 1..=backoff.max_ms ({})",
                self.backoff.base_ms, self.backoff.max_ms
            )));
        }
        if self.server.keepalive_ms == 0 || self.stream.idle_timeout_ms <= self.server.keepalive_ms {
            return Err(ConfigError::Invalid(format!(
                "stream.idle_timeout_ms ({}) must exceed server.keepalive_ms ({}), which must be positive",
                self.stream.idle_timeout_ms, self.server.keepalive_ms
            )));
        }
        if self.telemetry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "telemetry.max_attempts must be at least 1".to_owned(),
            ));
        }
        let persona = &self.state.persona;
        for (name, value) in [
            ("state.persona.chaos_level", persona.chaos_level),
            ("state.persona.energy", persona.energy),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!("{name} must be within [0, 1]")));
            }
        }
        Ok(())
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerSection {
    /// Address to bind (e.g. `0.0.0.0`).
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Quiet period after which an open stream gets a keepalive.
    #[serde(default = "default_keepalive_ms")]
    pub keepalive_ms: u64,
}

impl ServerSection {
    /// Keepalive interval as a [`Duration`].
    pub const fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            keepalive_ms: default_keepalive_ms(),
        }
    }
}

/// Fan-out settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DispatcherConfig {
    /// Envelopes buffered per subscriber before the oldest is dropped.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,

    /// Recent envelopes retained for `since` replay.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: default_mailbox_capacity(),
            history_capacity: default_history_capacity(),
        }
    }
}

/// Initial persona values.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PersonaDefaults {
    /// Style label.
    #[serde(default = "default_persona_style")]
    pub style: String,

    /// Chaos level in `[0, 1]`.
    #[serde(default = "default_chaos_level")]
    pub chaos_level: f64,

    /// Energy in `[0, 1]`.
    #[serde(default = "default_energy")]
    pub energy: f64,

    /// Family-friendly mode.
    #[serde(default)]
    pub family_mode: bool,
}

impl Default for PersonaDefaults {
    fn default() -> Self {
        Self {
            style: default_persona_style(),
            chaos_level: default_chaos_level(),
            energy: default_energy(),
            family_mode: false,
        }
    }
}

/// State manager settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StateConfig {
    /// Pending commands buffered in front of the owner task.
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,

    /// Silence after which an online module counts as non-responsive.
    #[serde(default = "default_health_threshold_ms")]
    pub health_threshold_ms: u64,

    /// Interval of the periodic health sweep.
    #[serde(default = "default_health_sweep_ms")]
    pub health_sweep_ms: u64,

    /// Scene reported before the first scene change.
    #[serde(default = "default_initial_scene")]
    pub initial_scene: String,

    /// Initial value of `restore_context`.
    #[serde(default)]
    pub restore_context: bool,

    /// Initial persona.
    #[serde(default)]
    pub persona: PersonaDefaults,
}

impl StateConfig {
    /// Health threshold as a [`Duration`].
    pub const fn health_threshold(&self) -> Duration {
        Duration::from_millis(self.health_threshold_ms)
    }

    /// Sweep interval as a [`Duration`].
    pub const fn health_sweep(&self) -> Duration {
        Duration::from_millis(self.health_sweep_ms)
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            command_capacity: default_command_capacity(),
            health_threshold_ms: default_health_threshold_ms(),
            health_sweep_ms: default_health_sweep_ms(),
            initial_scene: default_initial_scene(),
            restore_context: false,
            persona: PersonaDefaults::default(),
        }
    }
}

/// Memory bookkeeping settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MemoryConfig {
    /// Finalized turns between summary requests.
    #[serde(default = "default_summary_interval")]
    pub summary_interval: u64,

    /// Whether summaries are restored on restart.
    #[serde(default = "default_true")]
    pub restore_enabled: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            summary_interval: default_summary_interval(),
            restore_enabled: true,
        }
    }
}

/// Reconnect/retry schedule.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BackoffConfig {
    /// First delay.
    #[serde(default = "default_backoff_base_ms")]
    pub base_ms: u64,

    /// Delay cap.
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,

    /// Open period after which the schedule resets.
    #[serde(default = "default_sustained_open_ms")]
    pub sustained_open_ms: u64,
}

impl BackoffConfig {
    /// Build the runtime policy.
    pub const fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.base_ms),
            max: Duration::from_millis(self.max_ms),
            sustained_open: Duration::from_millis(self.sustained_open_ms),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_backoff_base_ms(),
            max_ms: default_backoff_max_ms(),
            sustained_open_ms: default_sustained_open_ms(),
        }
    }
}

/// Outbound telemetry settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TelemetryConfig {
    /// Whether the in-process publisher is started.
    #[serde(default)]
    pub enabled: bool,

    /// Base URL of the metrics store; events go to `{base_url}/events`.
    #[serde(default = "default_telemetry_base_url")]
    pub base_url: String,

    /// Credential sent as `X-API-Key`. Absent means unauthenticated.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Events buffered before new ones are dropped.
    #[serde(default = "default_telemetry_queue_capacity")]
    pub queue_capacity: usize,

    /// Delivery attempts per event (first try included).
    #[serde(default = "default_telemetry_max_attempts")]
    pub max_attempts: u32,

    /// Per-request timeout.
    #[serde(default = "default_telemetry_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_telemetry_base_url(),
            api_key: None,
            queue_capacity: default_telemetry_queue_capacity(),
            max_attempts: default_telemetry_max_attempts(),
            request_timeout_ms: default_telemetry_request_timeout_ms(),
        }
    }
}

/// Stream client settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StreamConfig {
    /// Full URL of the NDJSON stream endpoint.
    #[serde(default = "default_stream_url")]
    pub url: String,

    /// Longest accepted line; longer lines are discarded.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,

    /// An open connection silent for this long is treated as dropped.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

impl StreamConfig {
    /// Idle deadline as a [`Duration`].
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: default_stream_url(),
            max_line_bytes: default_max_line_bytes(),
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Default value functions
// ---------------------------------------------------------------------------

fn default_host() -> String {
    "0.0.0.0".to_owned()
}

const fn default_port() -> u16 {
    8787
}

const fn default_keepalive_ms() -> u64 {
    10_000
}

const fn default_mailbox_capacity() -> usize {
    256
}

const fn default_history_capacity() -> usize {
    1024
}

fn default_persona_style() -> String {
    "neutral".to_owned()
}

const fn default_chaos_level() -> f64 {
    0.3
}

const fn default_energy() -> f64 {
    0.6
}

const fn default_command_capacity() -> usize {
    128
}

const fn default_health_threshold_ms() -> u64 {
    5_000
}

const fn default_health_sweep_ms() -> u64 {
    1_000
}

fn default_initial_scene() -> String {
    "starting".to_owned()
}

const fn default_summary_interval() -> u64 {
    20
}

const fn default_backoff_base_ms() -> u64 {
    500
}

const fn default_backoff_max_ms() -> u64 {
    10_000
}

const fn default_sustained_open_ms() -> u64 {
    5_000
}

fn default_telemetry_base_url() -> String {
    "http://127.0.0.1:9000".to_owned()
}

const fn default_telemetry_queue_capacity() -> usize {
    512
}

const fn default_telemetry_max_attempts() -> u32 {
    5
}

const fn default_telemetry_request_timeout_ms() -> u64 {
    3_000
}

fn default_stream_url() -> String {
    "http://127.0.0.1:8787/stream".to_owned()
}

const fn default_max_line_bytes() -> usize {
    1024 * 1024
}

const fn default_idle_timeout_ms() -> u64 {
    30_000
}

fn default_log_level() -> String {
    "info".to_owned()
}

const fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ConductorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 8787);
        assert_eq!(config.backoff.base_ms, 500);
        assert!(config.telemetry.api_key.is_none());
    }

    #[test]
    fn parse_empty_yaml() {
        let config = ConductorConfig::parse("{}").ok();
        assert_eq!(config, Some(ConductorConfig::default()));
    }

    #[test]
    fn parse_partial_yaml() {
        let yaml = r#"
server:
  port: 9100
dispatcher:
  mailbox_capacity: 8
telemetry:
  enabled: true
  base_url: "https://metrics.example.test"
  api_key: "secret"
backoff:
  base_ms: 250
  max_ms: 4000
"#;
        let config = ConductorConfig::parse(yaml).ok();
        let config = config.unwrap_or_default();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.dispatcher.mailbox_capacity, 8);
        assert_eq!(config.dispatcher.history_capacity, 1024);
        assert!(config.telemetry.enabled);
        assert_eq!(config.telemetry.api_key.as_deref(), Some("secret"));
        assert_eq!(config.backoff.policy().base, Duration::from_millis(250));
        assert_eq!(config.backoff.policy().max, Duration::from_secs(4));
    }

    #[test]
    fn zero_mailbox_is_rejected() {
        let result = ConductorConfig::parse("dispatcher:\n  mailbox_capacity: 0\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn inverted_backoff_is_rejected() {
        let result = ConductorConfig::parse("backoff:\n  base_ms: 5000\n  max_ms: 100\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn idle_timeout_must_exceed_keepalive() {
        let result = ConductorConfig::parse(
            "server:\n  keepalive_ms: 10000\nstream:\n  idle_timeout_ms: 5000\n",
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let config = ConductorConfig::parse("stream:\n  idle_timeout_ms: 45000\n").ok();
        let config = config.unwrap_or_default();
        assert_eq!(config.stream.idle_timeout(), Duration::from_secs(45));
        assert_eq!(config.server.keepalive(), Duration::from_secs(10));
    }

    #[test]
    fn zero_summary_interval_is_rejected() {
        let result = ConductorConfig::parse("memory:\n  summary_interval: 0\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn persona_out_of_range_is_rejected() {
        let result = ConductorConfig::parse("state:\n  persona:\n    energy: 1.5\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn malformed_yaml_is_a_yaml_error() {
        let result = ConductorConfig::parse("server: [unterminated");
        assert!(matches!(result, Err(ConfigError::Yaml { .. })));
    }

    #[test]
    fn load_project_config_file() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../conductor-config.yaml");
        let contents = std::fs::read_to_string(&path).unwrap_or_default();
        let config = ConductorConfig::parse(&contents);
        assert!(config.is_ok(), "project config should parse: {config:?}");
    }
}
