//! State Manager: the single owner of the authoritative [`Snapshot`].
//!
//! One owner task holds the snapshot. [`StateManager`] is a cheap, cloneable
//! handle that sends [`Operation`]s to it over a bounded channel and awaits
//! the reply. The owner validates, applies, stamps a sequence number, and
//! publishes exactly one [`Envelope`] per accepted operation through the
//! [`Dispatcher`]. Readers never touch the owner: the latest committed
//! snapshot is mirrored in a `watch` channel.
//!
//! ```text
//!   HTTP handler ─┐
//!   HTTP handler ─┼─► mpsc<Command> ─► owner task ─┬─► watch<Arc<Snapshot>> ─► readers
//!   health sweep ─┘   (bounded)        (validate,  └─► Dispatcher::publish
//!                                       apply, seq)
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use conductor_types::{
    Envelope, Event, ExpressionRecord, ExpressionTarget, HealthSnapshot, MemoryState,
    MemorySummary, ModuleHealth, ModuleName, ModuleState, Persona, Snapshot, SummaryId,
    SystemStatus, Transcript, TranscriptState, TtsRecord,
};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConductorConfig;
use crate::dispatcher::Dispatcher;
use crate::error::CoreError;
use crate::memory::{SummaryRequest, SummaryTrigger, summary_due};

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// A partial persona update. Absent fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PersonaPatch {
    /// New style label.
    #[serde(default)]
    pub style: Option<String>,
    /// New chaos level in `[0, 1]`.
    #[serde(default)]
    pub chaos_level: Option<f64>,
    /// New energy in `[0, 1]`.
    #[serde(default)]
    pub energy: Option<f64>,
    /// New family-mode flag.
    #[serde(default)]
    pub family_mode: Option<bool>,
}

impl PersonaPatch {
    /// `true` when no field is set.
    pub const fn is_empty(&self) -> bool {
        self.style.is_none()
            && self.chaos_level.is_none()
            && self.energy.is_none()
            && self.family_mode.is_none()
    }
}

/// A mutation request for the owner task.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// In-flight recognition result; overwrites the previous partial.
    AsrPartial {
        /// Recognized text.
        text: String,
        /// Confidence in `[0, 1]`.
        confidence: f64,
    },
    /// Finalized utterance.
    AsrFinal {
        /// Recognized text.
        text: String,
        /// Confidence in `[0, 1]`.
        confidence: f64,
    },
    /// Partial persona update.
    PersonaUpdate(PersonaPatch),
    /// Enable or disable a module.
    ModuleToggle {
        /// Target module.
        module: ModuleName,
        /// New enabled flag.
        enabled: bool,
    },
    /// Module heartbeat.
    ModuleHealth {
        /// Reporting module.
        module: ModuleName,
        /// Reported latency in milliseconds.
        latency_ms: f64,
    },
    /// Speech request.
    TtsRequest {
        /// Text to speak.
        text: String,
        /// Optional voice override.
        voice: Option<String>,
    },
    /// Scene switch.
    SceneChange {
        /// New scene identifier.
        scene: String,
    },
    /// Avatar expression change.
    Expression {
        /// Channel the expression is sent on.
        target: ExpressionTarget,
        /// Expression name.
        expression: String,
        /// Optional intensity in `[0, 1]`.
        intensity: Option<f64>,
    },
    /// Externally produced memory summary.
    MemorySummary {
        /// Summary text.
        text: String,
    },
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

fn unit_interval(field: &'static str, value: f64) -> Result<f64, CoreError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(CoreError::OutOfRange {
            field,
            value,
            expected: "a finite value within [0, 1]",
        })
    }
}

fn non_negative(field: &'static str, value: f64) -> Result<f64, CoreError> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(CoreError::OutOfRange {
            field,
            value,
            expected: "a finite value >= 0",
        })
    }
}

fn non_empty(field: &'static str, value: String) -> Result<String, CoreError> {
    if value.trim().is_empty() {
        Err(CoreError::MalformedEnvelope(format!("{field} must not be empty")))
    } else {
        Ok(value)
    }
}

/// Never move a field's timestamp backwards.
fn stamp(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    previous.max(now)
}

/// Aggregate status from module health.
///
/// `offline` when nothing is online, `degraded` when any online module has
/// been silent longer than `threshold`, `online` otherwise.
pub fn derive_status<'a>(
    modules: impl IntoIterator<Item = &'a ModuleHealth>,
    now: DateTime<Utc>,
    threshold: TimeDelta,
) -> SystemStatus {
    let mut any_online = false;
    for health in modules {
        if health.state != ModuleState::Online {
            continue;
        }
        any_online = true;
        if now.signed_duration_since(health.last_updated) > threshold {
            return SystemStatus::Degraded;
        }
    }
    if any_online {
        SystemStatus::Online
    } else {
        SystemStatus::Offline
    }
}

// ---------------------------------------------------------------------------
// SnapshotState (pure, synchronous)
// ---------------------------------------------------------------------------

/// Result of applying an accepted operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    /// The event to publish.
    pub event: Event,
    /// Set when the operation made a memory summary due.
    pub summary: Option<SummaryRequest>,
}

impl Applied {
    const fn event(event: Event) -> Self {
        Self {
            event,
            summary: None,
        }
    }
}

/// The snapshot plus the rules for changing it.
///
/// Holds no channels and does no I/O; the owner task wraps it.
#[derive(Debug, Clone)]
pub struct SnapshotState {
    snapshot: Snapshot,
    health_threshold: TimeDelta,
    announced: SystemStatus,
}

impl SnapshotState {
    /// Initial state: every module offline, persona and scene from config.
    pub fn new(config: &ConductorConfig, now: DateTime<Utc>) -> Self {
        let persona = &config.state.persona;
        let snapshot = Snapshot {
            status: SystemStatus::Offline,
            persona: Persona {
                style: persona.style.clone(),
                chaos_level: persona.chaos_level,
                energy: persona.energy,
                family_mode: persona.family_mode,
                last_updated: now,
            },
            modules: ModuleName::ALL
                .into_iter()
                .map(|m| (m, ModuleHealth::offline(now)))
                .collect(),
            scene: config.state.initial_scene.clone(),
            last_expression: None,
            last_tts: None,
            transcript: TranscriptState::default(),
            memory: MemoryState {
                buffer_length: 0,
                summary_interval: config.memory.summary_interval,
                restore_enabled: config.memory.restore_enabled,
                current_summary: None,
            },
            restore_context: config.state.restore_context,
        };
        Self {
            snapshot,
            health_threshold: TimeDelta::from_std(config.state.health_threshold())
                .unwrap_or(TimeDelta::MAX),
            announced: SystemStatus::Offline,
        }
    }

    /// Current snapshot.
    pub const fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Validate and apply one operation.
    ///
    /// On error the snapshot is unchanged.
    pub fn apply(&mut self, op: Operation, now: DateTime<Utc>) -> Result<Applied, CoreError> {
        let applied = match op {
            Operation::AsrPartial { text, confidence } => {
                let transcript = self.transcript(text, confidence, now)?;
                self.snapshot.transcript.partial = Some(transcript.clone());
                self.mark_online(ModuleName::Asr, None, now);
                Applied::event(Event::AsrPartial { transcript })
            }
            Operation::AsrFinal { text, confidence } => self.asr_final(text, confidence, now)?,
            Operation::PersonaUpdate(patch) => self.persona(patch, now)?,
            Operation::ModuleToggle { module, enabled } => {
                let entry = self.module_entry(module);
                let last_updated = stamp(entry.last_updated, now);
                let state = if enabled {
                    ModuleState::Online
                } else {
                    ModuleState::Offline
                };
                self.snapshot.modules.insert(
                    module,
                    ModuleHealth {
                        state,
                        latency_ms: entry.latency_ms,
                        last_updated,
                    },
                );
                Applied::event(Event::ModuleToggle { module, enabled })
            }
            Operation::ModuleHealth { module, latency_ms } => {
                let latency_ms = non_negative("latency_ms", latency_ms)?;
                let health = self.mark_online(module, Some(latency_ms), now);
                Applied::event(Event::ModuleHealth { module, health })
            }
            Operation::TtsRequest { text, voice } => {
                let text = non_empty("text", text)?;
                let previous = self.snapshot.last_tts.as_ref().map(|t| t.requested_at);
                let request = TtsRecord {
                    text,
                    voice: voice.filter(|v| !v.trim().is_empty()),
                    requested_at: previous.map_or(now, |p| stamp(p, now)),
                };
                self.snapshot.last_tts = Some(request.clone());
                Applied::event(Event::TtsRequest { request })
            }
            Operation::SceneChange { scene } => {
                let scene = non_empty("scene", scene)?;
                self.snapshot.scene.clone_from(&scene);
                Applied::event(Event::ObsScene { scene })
            }
            Operation::Expression {
                target,
                expression,
                intensity,
            } => {
                let expression = non_empty("expression", expression)?;
                let intensity = intensity
                    .map(|i| unit_interval("intensity", i))
                    .transpose()?;
                let previous = self.snapshot.last_expression.as_ref().map(|e| e.at);
                let record = ExpressionRecord {
                    target,
                    expression,
                    intensity,
                    at: previous.map_or(now, |p| stamp(p, now)),
                };
                self.snapshot.last_expression = Some(record.clone());
                Applied::event(match target {
                    ExpressionTarget::Vts => Event::VtsExpression { expression: record },
                    ExpressionTarget::Avatar => Event::Expression { expression: record },
                })
            }
            Operation::MemorySummary { text } => {
                let text = non_empty("text", text)?;
                let previous = self
                    .snapshot
                    .memory
                    .current_summary
                    .as_ref()
                    .map(|s| s.created_at);
                let summary = MemorySummary {
                    id: SummaryId::new(),
                    text,
                    turn: self.snapshot.transcript.turns,
                    created_at: previous.map_or(now, |p| stamp(p, now)),
                };
                self.snapshot.memory.buffer_length = 0;
                self.snapshot.memory.current_summary = Some(summary.clone());
                Applied::event(Event::MemorySummary { summary })
            }
        };
        self.snapshot.status = self.derive(now);
        Ok(applied)
    }

    /// Recompute the aggregate status.
    ///
    /// Returns a `status` event when it differs from the last announced
    /// status.
    pub fn refresh_health(&mut self, now: DateTime<Utc>) -> Option<Event> {
        let status = self.derive(now);
        self.snapshot.status = status;
        if status == self.announced {
            return None;
        }
        self.announced = status;
        Some(Event::Status {
            snapshot: Box::new(self.snapshot.clone()),
        })
    }

    fn derive(&self, now: DateTime<Utc>) -> SystemStatus {
        derive_status(self.snapshot.modules.values(), now, self.health_threshold)
    }

    fn module_entry(&self, module: ModuleName) -> ModuleHealth {
        self.snapshot
            .modules
            .get(&module)
            .cloned()
            .unwrap_or_else(|| ModuleHealth::offline(DateTime::<Utc>::MIN_UTC))
    }

    fn mark_online(
        &mut self,
        module: ModuleName,
        latency_ms: Option<f64>,
        now: DateTime<Utc>,
    ) -> ModuleHealth {
        let entry = self.module_entry(module);
        let health = ModuleHealth {
            state: ModuleState::Online,
            latency_ms: latency_ms.unwrap_or(entry.latency_ms),
            last_updated: stamp(entry.last_updated, now),
        };
        self.snapshot.modules.insert(module, health.clone());
        health
    }

    fn transcript(
        &self,
        text: String,
        confidence: f64,
        now: DateTime<Utc>,
    ) -> Result<Transcript, CoreError> {
        let text = non_empty("text", text)?;
        let confidence = unit_interval("confidence", confidence)?;
        let state = &self.snapshot.transcript;
        let previous = state
            .partial
            .iter()
            .chain(state.last_final.iter())
            .map(|t| t.at)
            .max();
        Ok(Transcript {
            text,
            confidence,
            at: previous.map_or(now, |p| stamp(p, now)),
        })
    }

    fn asr_final(
        &mut self,
        text: String,
        confidence: f64,
        now: DateTime<Utc>,
    ) -> Result<Applied, CoreError> {
        let transcript = self.transcript(text, confidence, now)?;
        let turn = self.snapshot.transcript.turns.saturating_add(1);
        let buffer_length = self.snapshot.memory.buffer_length.saturating_add(1);

        self.snapshot.transcript.partial = None;
        self.snapshot.transcript.last_final = Some(transcript.clone());
        self.snapshot.transcript.turns = turn;
        self.snapshot.memory.buffer_length = buffer_length;
        self.mark_online(ModuleName::Asr, None, now);

        let summary = summary_due(buffer_length, self.snapshot.memory.summary_interval).then(|| {
            SummaryRequest {
                turn,
                buffer_length,
                transcript: transcript.clone(),
            }
        });
        Ok(Applied {
            event: Event::AsrFinal { transcript, turn },
            summary,
        })
    }

    fn persona(&mut self, patch: PersonaPatch, now: DateTime<Utc>) -> Result<Applied, CoreError> {
        if patch.is_empty() {
            return Err(CoreError::MalformedEnvelope(
                "persona update sets no fields".to_owned(),
            ));
        }
        let style = patch.style.map(|s| non_empty("style", s)).transpose()?;
        let chaos_level = patch
            .chaos_level
            .map(|v| unit_interval("chaos_level", v))
            .transpose()?;
        let energy = patch.energy.map(|v| unit_interval("energy", v)).transpose()?;

        let persona = &mut self.snapshot.persona;
        if let Some(style) = style {
            persona.style = style;
        }
        if let Some(chaos_level) = chaos_level {
            persona.chaos_level = chaos_level;
        }
        if let Some(energy) = energy {
            persona.energy = energy;
        }
        if let Some(family_mode) = patch.family_mode {
            persona.family_mode = family_mode;
        }
        persona.last_updated = stamp(persona.last_updated, now);
        Ok(Applied::event(Event::PersonaUpdate {
            persona: persona.clone(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Owner task
// ---------------------------------------------------------------------------

/// Wall-clock time that advances with the tokio clock.
///
/// Anchored once at start, so it never runs backwards and follows paused
/// time in tests.
#[derive(Debug, Clone, Copy)]
struct Clock {
    wall: DateTime<Utc>,
    origin: Instant,
}

impl Clock {
    fn start() -> Self {
        Self {
            wall: Utc::now(),
            origin: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        TimeDelta::from_std(self.origin.elapsed())
            .ok()
            .and_then(|elapsed| self.wall.checked_add_signed(elapsed))
            .unwrap_or(self.wall)
    }
}

#[derive(Debug)]
enum Command {
    Apply {
        op: Operation,
        reply: oneshot::Sender<Result<Arc<Envelope>, CoreError>>,
    },
    RefreshHealth {
        reply: oneshot::Sender<Option<Arc<Envelope>>>,
    },
}

struct Owner {
    state: SnapshotState,
    seq: u64,
    clock: Clock,
    dispatcher: Dispatcher,
    trigger: Arc<dyn SummaryTrigger>,
    snapshot_tx: watch::Sender<Arc<Snapshot>>,
}

impl Owner {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        sweep_every: Duration,
        cancel: CancellationToken,
    ) {
        let mut sweep = tokio::time::interval(sweep_every);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        sweep.tick().await;

        info!(sweep = ?sweep_every, "state manager started");
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = sweep.tick() => {
                    self.refresh_health();
                }
            }
        }
        info!(seq = self.seq, "state manager stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Apply { op, reply } => {
                let now = self.clock.now();
                let result = match self.state.apply(op, now) {
                    Ok(applied) => {
                        let envelope = self.commit(applied.event, now);
                        if let Some(request) = applied.summary {
                            self.trigger.request_summary(request);
                        }
                        Ok(envelope)
                    }
                    Err(err) => {
                        debug!(error = %err, "operation rejected");
                        Err(err)
                    }
                };
                if reply.send(result).is_err() {
                    debug!("caller dropped before reply");
                }
            }
            Command::RefreshHealth { reply } => {
                let envelope = self.refresh_health();
                if reply.send(envelope).is_err() {
                    debug!("caller dropped before reply");
                }
            }
        }
    }

    fn refresh_health(&mut self) -> Option<Arc<Envelope>> {
        let now = self.clock.now();
        let before = self.state.snapshot().status;
        match self.state.refresh_health(now) {
            Some(event) => {
                let status = self.state.snapshot().status;
                if status == SystemStatus::Degraded {
                    warn!(?status, "system status changed");
                } else {
                    info!(?status, "system status changed");
                }
                Some(self.commit(event, now))
            }
            None => {
                if before != self.state.snapshot().status {
                    self.snapshot_tx
                        .send_replace(Arc::new(self.state.snapshot().clone()));
                }
                None
            }
        }
    }

    fn commit(&mut self, event: Event, now: DateTime<Utc>) -> Arc<Envelope> {
        self.seq = self.seq.saturating_add(1);
        let envelope = Arc::new(Envelope::new(self.seq, now, event));
        self.snapshot_tx
            .send_replace(Arc::new(self.state.snapshot().clone()));
        let delivered = self.dispatcher.publish(Arc::clone(&envelope));
        debug!(
            seq = envelope.seq,
            kind = envelope.kind(),
            subscribers = delivered,
            "envelope committed"
        );
        envelope
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable handle to the owner task.
#[derive(Debug, Clone)]
pub struct StateManager {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<Arc<Snapshot>>,
}

impl StateManager {
    /// Spawn the owner task.
    ///
    /// The task stops when `cancel` fires or every handle is dropped.
    pub fn spawn(
        config: &ConductorConfig,
        dispatcher: Dispatcher,
        trigger: Arc<dyn SummaryTrigger>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let clock = Clock::start();
        let state = SnapshotState::new(config, clock.now());
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(state.snapshot().clone()));
        let (commands_tx, commands_rx) = mpsc::channel(config.state.command_capacity.max(1));

        let owner = Owner {
            state,
            seq: 0,
            clock,
            dispatcher,
            trigger,
            snapshot_tx,
        };
        let task = tokio::spawn(owner.run(commands_rx, config.state.health_sweep(), cancel));

        (
            Self {
                commands: commands_tx,
                snapshot: snapshot_rx,
            },
            task,
        )
    }

    /// Point-in-time copy of the snapshot.
    pub fn snapshot(&self) -> Snapshot {
        (**self.snapshot.borrow()).clone()
    }

    /// Shared reference to the latest committed snapshot.
    pub fn current(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.borrow())
    }

    /// Status and module health only.
    pub fn health_snapshot(&self) -> HealthSnapshot {
        self.snapshot.borrow().health()
    }

    /// Send an operation and wait for the committed envelope.
    pub async fn apply(&self, op: Operation) -> Result<Arc<Envelope>, CoreError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Apply { op, reply })
            .await
            .map_err(|_closed| CoreError::Unavailable)?;
        response.await.map_err(|_closed| CoreError::Unavailable)?
    }

    /// Record an in-flight recognition result.
    pub async fn handle_asr_partial(
        &self,
        text: impl Into<String> + Send,
        confidence: f64,
    ) -> Result<Arc<Envelope>, CoreError> {
        self.apply(Operation::AsrPartial {
            text: text.into(),
            confidence,
        })
        .await
    }

    /// Record a finalized utterance and advance the turn counter.
    pub async fn handle_asr_final(
        &self,
        text: impl Into<String> + Send,
        confidence: f64,
    ) -> Result<Arc<Envelope>, CoreError> {
        self.apply(Operation::AsrFinal {
            text: text.into(),
            confidence,
        })
        .await
    }

    /// Apply a partial persona update.
    pub async fn apply_persona_update(
        &self,
        patch: PersonaPatch,
    ) -> Result<Arc<Envelope>, CoreError> {
        self.apply(Operation::PersonaUpdate(patch)).await
    }

    /// Enable or disable a module by name.
    pub async fn apply_module_toggle(
        &self,
        module: &str,
        enabled: bool,
    ) -> Result<Arc<Envelope>, CoreError> {
        let module: ModuleName = module.parse()?;
        self.apply(Operation::ModuleToggle { module, enabled }).await
    }

    /// Record a module heartbeat.
    pub async fn apply_module_health(
        &self,
        module: &str,
        latency_ms: f64,
    ) -> Result<Arc<Envelope>, CoreError> {
        let module: ModuleName = module.parse()?;
        self.apply(Operation::ModuleHealth { module, latency_ms })
            .await
    }

    /// Record a speech request.
    pub async fn apply_tts_request(
        &self,
        text: impl Into<String> + Send,
        voice: Option<String>,
    ) -> Result<Arc<Envelope>, CoreError> {
        self.apply(Operation::TtsRequest {
            text: text.into(),
            voice,
        })
        .await
    }

    /// Switch the active scene.
    pub async fn apply_scene_change(
        &self,
        scene: impl Into<String> + Send,
    ) -> Result<Arc<Envelope>, CoreError> {
        self.apply(Operation::SceneChange {
            scene: scene.into(),
        })
        .await
    }

    /// Apply an avatar expression.
    pub async fn apply_expression(
        &self,
        target: ExpressionTarget,
        expression: impl Into<String> + Send,
        intensity: Option<f64>,
    ) -> Result<Arc<Envelope>, CoreError> {
        self.apply(Operation::Expression {
            target,
            expression: expression.into(),
            intensity,
        })
        .await
    }

    /// Record an externally produced memory summary.
    pub async fn apply_memory_summary(
        &self,
        text: impl Into<String> + Send,
    ) -> Result<Arc<Envelope>, CoreError> {
        self.apply(Operation::MemorySummary { text: text.into() })
            .await
    }

    /// Recompute the aggregate status now instead of waiting for the sweep.
    ///
    /// Returns the `status` envelope if the status changed.
    pub async fn refresh_health(&self) -> Result<Option<Arc<Envelope>>, CoreError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::RefreshHealth { reply })
            .await
            .map_err(|_closed| CoreError::Unavailable)?;
        response.await.map_err(|_closed| CoreError::Unavailable)
    }
}
