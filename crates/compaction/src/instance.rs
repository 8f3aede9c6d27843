//! Memory instance — the compaction pipeline for one threshold configuration.
//!
//! A [`MemoryInstance`] is a handle. The state it fronts (conversation
//! window, observation set, counters, active cycles) lives in a pipeline
//! task that owns it exclusively:
//!
//! ```text
//!   ingest / context / clear ──┐
//!                              ├──► mpsc ──► Pipeline ──► watch<PipelineSnapshot>
//!   worker completions ────────┘                │
//!                                               └──► spawn Observer / Reflector
//! ```
//!
//! Callers never block on a cycle: `ingest` is a channel send, workers run on
//! their own tasks, and their results come back as commands. Results are
//! therefore applied one at a time in completion order, and a result whose
//! cycle is no longer the stage's active one is dropped.
//!
//! When the thresholds of a scope change, the replacement pipeline takes over
//! from its predecessor: the window, the observation set, the counters and
//! any running cycles move across, and the predecessor forwards every later
//! command (late worker results included) to its successor.

use chrono::Utc;
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;
use tidemark_core::error::{CompactionError, Error};
use tidemark_core::event::DomainEvent;
use tidemark_core::harness::{ThresholdConfig, TokenCount};
use tidemark_core::message::Message;
use tidemark_core::progress::{CycleKind, CycleStatus, ProgressEvent};
use tidemark_core::provider::{ModelResolver, Provider};
use tidemark_core::storage::{ObservationRecord, ObservationStore, RecordKind};
use tidemark_core::tokens::estimate_message_tokens;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::accountant::{ConsistencyWarning, TokenAccountant, TokenAccountantState, percent_of};
use crate::bridge::{BridgeReader, RuntimeMirror};
use crate::buffer::{BlockReason, BufferController, GateDecision};
use crate::cycle::{CompactionCycle, CycleConfig, CycleId, CycleOutcome};
use crate::progress::{ProgressReporter, progress_event};
use crate::worker::{
    CompactionOutput, CompactionWorker, ConversationWindow, ObservationSet, ObservationStage,
    PendingMessage, ReflectionStage, Stage, WorkerInput,
};

const KINDS: [CycleKind; 2] = [CycleKind::Observation, CycleKind::Reflection];

/// Collaborators shared by every instance an engine builds.
#[derive(Clone)]
pub struct InstanceDeps {
    pub bridge: BridgeReader,
    pub resolver: Arc<dyn ModelResolver>,
    pub reporter: Arc<dyn ProgressReporter>,
}

// ── Snapshots ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageSnapshot {
    /// Status of the active cycle, `Idle` when there is none.
    pub status: CycleStatus,
    pub cycle_id: Option<CycleId>,
    /// Backpressure is refusing new starts.
    pub blocked: bool,
    pub completed_cycles: u64,
    pub failed_cycles: u64,
    pub last: Option<CycleOutcome>,
}

/// Everything observable about a pipeline, published after every command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineSnapshot {
    pub config: ThresholdConfig,
    pub tokens: TokenAccountantState,
    pub observation: StageSnapshot,
    pub reflection: StageSnapshot,
    pub unobserved_messages: usize,
    pub records: usize,
    pub epoch: u64,
    pub generation: u64,
    /// Stored observations have been read.
    pub loaded: bool,
}

impl PipelineSnapshot {
    fn new(config: ThresholdConfig) -> Self {
        Self {
            config,
            tokens: TokenAccountantState::default(),
            observation: StageSnapshot::default(),
            reflection: StageSnapshot::default(),
            unobserved_messages: 0,
            records: 0,
            epoch: 0,
            generation: 0,
            loaded: false,
        }
    }

    pub fn observation_percent(&self) -> f64 {
        percent_of(self.tokens.pending_tokens, self.config.observation_threshold)
    }

    pub fn reflection_percent(&self) -> f64 {
        percent_of(self.tokens.observation_tokens, self.config.reflection_threshold)
    }

    pub fn stage(&self, kind: CycleKind) -> &StageSnapshot {
        match kind {
            CycleKind::Observation => &self.observation,
            CycleKind::Reflection => &self.reflection,
        }
    }
}

/// What the agent should see: compressed history plus the raw messages no
/// observation covers yet.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryContext {
    /// `<observations>` block, empty when nothing has been observed.
    pub observations: String,
    pub messages: Vec<Message>,
    pub observation_tokens: TokenCount,
    pub pending_tokens: TokenCount,
}

impl MemoryContext {
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty() && self.messages.is_empty()
    }
}

// ── Handle ────────────────────────────────────────────────────────────────

enum Command {
    Ingest(PendingMessage),
    Completed(Completion),
    Context(oneshot::Sender<MemoryContext>),
    Clear(oneshot::Sender<()>),
    Barrier(oneshot::Sender<()>),
    Handoff {
        successor: mpsc::WeakUnboundedSender<Command>,
        reply: oneshot::Sender<Handoff>,
    },
}

/// Pipeline state passed from an evicted instance to its replacement.
struct Handoff {
    messages: Vec<PendingMessage>,
    records: Vec<ObservationRecord>,
    tokens: TokenAccountantState,
    /// Running cycles only; buffered ones are prepared again if still due.
    observation: Option<CompactionCycle>,
    reflection: Option<CompactionCycle>,
    last_cycle_id: CycleId,
    epoch: u64,
}

struct Completion {
    kind: CycleKind,
    cycle_id: CycleId,
    epoch: u64,
    result: Result<CompactionOutput, CompactionError>,
}

pub struct MemoryInstance {
    config: ThresholdConfig,
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<PipelineSnapshot>,
}

impl MemoryInstance {
    /// Spawn the pipeline for `config` on the current tokio runtime.
    ///
    /// The pipeline only starts new cycles while the bridge's thresholds
    /// equal `config`; once the harness moves on it finishes in-flight work
    /// and goes quiet.
    pub fn spawn(config: ThresholdConfig, storage: Arc<dyn ObservationStore>, deps: InstanceDeps) -> Self {
        Self::start(config, storage, deps, None)
    }

    /// Spawn a pipeline that takes over `predecessor`'s state instead of
    /// loading from storage. Both must serve the same scope.
    pub fn spawn_after(
        predecessor: &MemoryInstance,
        config: ThresholdConfig,
        storage: Arc<dyn ObservationStore>,
        deps: InstanceDeps,
    ) -> Self {
        debug_assert_eq!(predecessor.config.scope, config.scope);
        Self::start(config, storage, deps, Some(predecessor.commands.clone()))
    }

    fn start(
        config: ThresholdConfig,
        storage: Arc<dyn ObservationStore>,
        deps: InstanceDeps,
        predecessor: Option<mpsc::UnboundedSender<Command>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(PipelineSnapshot::new(config.clone()));
        let pipeline = Pipeline::new(config.clone(), storage, deps, tx.downgrade(), snapshot_tx);
        tokio::spawn(pipeline.run(predecessor, rx));
        Self {
            config,
            commands: tx,
            snapshots: snapshot_rx,
        }
    }

    pub fn config(&self) -> &ThresholdConfig {
        &self.config
    }

    /// Add a message to the window, estimating its size.
    pub fn ingest(&self, message: Message) {
        let tokens = estimate_message_tokens(&message);
        self.ingest_counted(message, tokens);
    }

    /// Add a message whose token count is already known.
    pub fn ingest_counted(&self, message: Message, tokens: TokenCount) {
        if self.send(Command::Ingest(PendingMessage { message, tokens })).is_err() {
            warn!(scope = %self.config.scope, "Memory pipeline stopped, message not tracked");
        }
    }

    pub async fn context(&self) -> Result<MemoryContext, Error> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Context(tx))?;
        rx.await.map_err(|_| pipeline_stopped())
    }

    /// Drop the window, the observation set and stored records. Cycles in
    /// flight are abandoned; their results will be discarded.
    pub async fn clear(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Clear(tx))?;
        rx.await.map_err(|_| pipeline_stopped())
    }

    /// Resolves once every command sent before it has been applied. Does not
    /// wait for running cycles.
    pub async fn settle(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Barrier(tx))?;
        rx.await.map_err(|_| pipeline_stopped())
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<PipelineSnapshot> {
        self.snapshots.clone()
    }

    pub fn observation_percent(&self) -> f64 {
        self.snapshots.borrow().observation_percent()
    }

    pub fn reflection_percent(&self) -> f64 {
        self.snapshots.borrow().reflection_percent()
    }

    fn send(&self, command: Command) -> Result<(), Error> {
        self.commands.send(command).map_err(|_| pipeline_stopped())
    }
}

fn pipeline_stopped() -> Error {
    Error::Internal("memory pipeline stopped".into())
}

// ── Pipeline ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct StageState {
    active: Option<CompactionCycle>,
    blocked: bool,
    completed: u64,
    failed: u64,
    last: Option<CycleOutcome>,
    /// Counter value a failed cycle left behind. No new start until the
    /// counter moves away from it.
    held_at: Option<TokenCount>,
    /// Generation a configuration error was last reported for.
    config_error_generation: Option<u64>,
}

impl StageState {
    fn snapshot(&self) -> StageSnapshot {
        StageSnapshot {
            status: self.active.as_ref().map_or(CycleStatus::Idle, |c| c.status),
            cycle_id: self.active.as_ref().map(|c| c.cycle_id),
            blocked: self.blocked,
            completed_cycles: self.completed,
            failed_cycles: self.failed,
            last: self.last.clone(),
        }
    }
}

struct Pipeline {
    config: ThresholdConfig,
    storage: Arc<dyn ObservationStore>,
    bridge: BridgeReader,
    resolver: Arc<dyn ModelResolver>,
    reporter: Arc<dyn ProgressReporter>,
    /// Weak so that dropping the handle stops the pipeline once workers finish.
    commands: mpsc::WeakUnboundedSender<Command>,
    snapshots: watch::Sender<PipelineSnapshot>,

    accountant: TokenAccountant,
    controller: BufferController,
    observation: StageState,
    reflection: StageState,
    messages: Vec<PendingMessage>,
    records: Vec<ObservationRecord>,

    last_cycle_id: CycleId,
    epoch: u64,
    generation: u64,
    superseded: bool,
    loaded: bool,
    /// Set once this pipeline handed its state to a replacement.
    successor: Option<mpsc::WeakUnboundedSender<Command>>,
}

impl Pipeline {
    fn new(
        config: ThresholdConfig,
        storage: Arc<dyn ObservationStore>,
        deps: InstanceDeps,
        commands: mpsc::WeakUnboundedSender<Command>,
        snapshots: watch::Sender<PipelineSnapshot>,
    ) -> Self {
        Self {
            config,
            storage,
            bridge: deps.bridge,
            resolver: deps.resolver,
            reporter: deps.reporter,
            commands,
            snapshots,
            accountant: TokenAccountant::new(),
            controller: BufferController::new(),
            observation: StageState::default(),
            reflection: StageState::default(),
            messages: Vec::new(),
            records: Vec::new(),
            last_cycle_id: 0,
            epoch: 0,
            generation: 0,
            superseded: false,
            loaded: false,
            successor: None,
        }
    }

    async fn run(
        mut self,
        predecessor: Option<mpsc::UnboundedSender<Command>>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let adopted = match predecessor {
            Some(predecessor) => self.take_over(predecessor).await,
            None => false,
        };
        if !adopted {
            self.load().await;
        }
        self.pump();
        self.publish();

        while let Some(command) = commands.recv().await {
            if let Some(successor) = &self.successor {
                match successor.upgrade() {
                    Some(successor) => {
                        let _ = successor.send(command);
                    }
                    None => debug!(scope = %self.config.scope, "Successor pipeline gone, dropping command"),
                }
                continue;
            }
            match command {
                Command::Ingest(pending) => {
                    self.accountant.record_message(pending.tokens);
                    self.messages.push(pending);
                    self.pump();
                    self.publish();
                }
                Command::Completed(done) => {
                    self.complete(done).await;
                    self.pump();
                    self.publish();
                }
                Command::Context(reply) => {
                    let _ = reply.send(self.context());
                }
                Command::Clear(reply) => {
                    self.clear().await;
                    self.publish();
                    let _ = reply.send(());
                }
                Command::Barrier(reply) => {
                    self.publish();
                    let _ = reply.send(());
                }
                Command::Handoff { successor, reply } => {
                    let _ = reply.send(self.hand_off());
                    self.successor = Some(successor);
                    self.publish();
                }
            }
        }
        debug!(scope = %self.config.scope, "Memory pipeline stopped");
    }

    /// Ask `predecessor` for its state and adopt it. Returns false when the
    /// predecessor is gone, in which case the caller loads from storage.
    async fn take_over(&mut self, predecessor: mpsc::UnboundedSender<Command>) -> bool {
        let (reply, rx) = oneshot::channel();
        let command = Command::Handoff {
            successor: self.commands.clone(),
            reply,
        };
        if predecessor.send(command).is_err() {
            return false;
        }
        drop(predecessor);
        let Ok(handoff) = rx.await else {
            return false;
        };

        let counters = handoff.tokens;
        self.messages = handoff.messages;
        self.records = handoff.records;
        self.accountant = TokenAccountant::restore(counters);
        self.last_cycle_id = handoff.last_cycle_id;
        self.epoch = handoff.epoch;
        for cycle in [handoff.observation, handoff.reflection].into_iter().flatten() {
            let kind = cycle.kind;
            let counter = self.counter(kind);
            self.controller.note_started(kind, counter);
            self.stage_mut(kind).active = Some(cycle);
        }
        info!(
            scope = %self.config.scope,
            messages = self.messages.len(),
            records = self.records.len(),
            pending_tokens = counters.pending_tokens,
            "Took over memory from previous instance"
        );
        self.loaded = true;
        true
    }

    /// Give up the window, records, counters and running cycles. The
    /// pipeline holds nothing afterwards and only forwards commands.
    fn hand_off(&mut self) -> Handoff {
        let running = |stage: &mut StageState| stage.active.take().filter(CompactionCycle::is_running);
        let handoff = Handoff {
            messages: std::mem::take(&mut self.messages),
            records: std::mem::take(&mut self.records),
            tokens: self.accountant.snapshot(),
            observation: running(&mut self.observation),
            reflection: running(&mut self.reflection),
            last_cycle_id: self.last_cycle_id,
            epoch: self.epoch,
        };
        self.accountant.reset();
        debug!(
            scope = %self.config.scope,
            messages = handoff.messages.len(),
            records = handoff.records.len(),
            "Handing memory over to replacement instance"
        );
        handoff
    }

    async fn load(&mut self) {
        match self.storage.load(&self.config.scope).await {
            Ok(records) => {
                let tokens: TokenCount = records.iter().map(|r| r.tokens).sum();
                if !records.is_empty() {
                    info!(
                        scope = %self.config.scope,
                        store = self.storage.name(),
                        records = records.len(),
                        tokens,
                        "Loaded stored observations"
                    );
                }
                // Keep cycle ids increasing across restarts
                self.last_cycle_id = records.iter().map(|r| r.cycle_id).max().unwrap_or(0);
                self.accountant = TokenAccountant::with_observation_tokens(tokens);
                self.records = records;
            }
            Err(e) => {
                warn!(scope = %self.config.scope, store = self.storage.name(), error = %e, "Failed to load observations, starting empty");
            }
        }
        self.loaded = true;
    }

    async fn persist(&self) {
        if let Err(e) = self.storage.save(&self.config.scope, &self.records).await {
            warn!(scope = %self.config.scope, store = self.storage.name(), error = %e, "Failed to persist observations");
            self.reporter.notify(DomainEvent::ErrorOccurred {
                context: format!("persist observations for scope {}", self.config.scope),
                error_message: e.to_string(),
                timestamp: Utc::now(),
            });
        }
    }

    // ── Gate evaluation ──────────────────────────────────────────────

    fn pump(&mut self) {
        let mirror = self.bridge.snapshot();
        if mirror.generation != self.generation {
            self.reconfigured(&mirror);
        }
        if mirror.thresholds != self.config {
            if !self.superseded {
                debug!(scope = %self.config.scope, "Harness thresholds moved on, no new cycles for this instance");
                self.superseded = true;
            }
            return;
        }
        self.superseded = false;
        for kind in KINDS {
            self.pump_stage(kind, &mirror);
        }
    }

    fn pump_stage(&mut self, kind: CycleKind, mirror: &RuntimeMirror) {
        let counter = self.counter(kind);
        let threshold = match kind {
            CycleKind::Observation => self.config.observation_threshold,
            CycleKind::Reflection => self.config.reflection_threshold,
        };
        if threshold == 0 {
            self.report_config_error(
                kind,
                CompactionError::Config(format!("{kind} threshold must be greater than zero")),
            );
            return;
        }

        let stage = self.stage_mut(kind);
        if stage.held_at.is_some_and(|held| held != counter) {
            stage.held_at = None;
        }
        let held = stage.held_at.is_some();

        let active = self.stage(kind).active.as_ref().map(|c| c.status);
        let decision = self
            .controller
            .evaluate(kind, counter, threshold, &mirror.policy(kind), active);
        if !matches!(decision, GateDecision::Blocked { .. }) {
            self.stage_mut(kind).blocked = false;
        }

        match decision {
            GateDecision::Idle => self.discard_buffering(kind, "backlog below activation point"),
            GateDecision::Buffer if active.is_none() => self.begin_buffering(kind),
            GateDecision::Buffer | GateDecision::Wait => {}
            // The last attempt failed on exactly this input
            GateDecision::Start if held => {}
            GateDecision::Start => self.start_cycle(kind, mirror),
            GateDecision::Blocked { backlog, limit, reason } => self.block(kind, backlog, limit, reason),
        }
    }

    fn reconfigured(&mut self, mirror: &RuntimeMirror) {
        debug!(
            scope = %self.config.scope,
            from = self.generation,
            to = mirror.generation,
            "Pipeline picked up new configuration"
        );
        self.generation = mirror.generation;
        self.controller.reset();
        for kind in KINDS {
            let stage = self.stage_mut(kind);
            stage.blocked = false;
            stage.held_at = None;
            // Buffered work was prepared against the old configuration
            self.discard_buffering(kind, "configuration changed");
        }
    }

    fn begin_buffering(&mut self, kind: CycleKind) {
        let model_id = self.bridge.current_model(kind.into());
        if let Err(err) = self.resolve(&model_id) {
            self.report_config_error(kind, err);
            return;
        }
        let mut cycle = CompactionCycle::new(self.next_cycle_id(), kind, self.epoch);
        cycle.begin_buffering();
        debug!(kind = %kind, cycle_id = cycle.cycle_id, model = %model_id, "Buffering compaction cycle");
        let event = self.event(kind, CycleStatus::Buffering, Some(&cycle));
        self.reporter.report(&event);
        self.stage_mut(kind).active = Some(cycle);
    }

    fn start_cycle(&mut self, kind: CycleKind, mirror: &RuntimeMirror) {
        let config = mirror.cycle_config(kind, self.config.reflection_threshold);
        let provider = match self.resolve(&config.model_id) {
            Ok(provider) => provider,
            Err(err) => {
                self.discard_buffering(kind, "model unavailable");
                self.report_config_error(kind, err);
                return;
            }
        };

        let buffered = self.stage_mut(kind).active.take();
        let cycle = match buffered {
            Some(cycle) => cycle,
            None => CompactionCycle::new(self.next_cycle_id(), kind, self.epoch),
        };
        match kind {
            CycleKind::Observation => {
                let window = ConversationWindow {
                    messages: self.messages.clone(),
                };
                self.launch::<ObservationStage>(cycle, window, config, provider);
            }
            CycleKind::Reflection => {
                let set = ObservationSet {
                    records: self.records.clone(),
                };
                self.launch::<ReflectionStage>(cycle, set, config, provider);
            }
        }
    }

    fn launch<S: Stage>(
        &mut self,
        mut cycle: CompactionCycle,
        input: S::Input,
        config: CycleConfig,
        provider: Arc<dyn Provider>,
    ) {
        if input.is_empty() {
            return;
        }
        let model_id = config.model_id.clone();
        if !cycle.start(config, input.input_tokens()) {
            return;
        }
        let counter = self.counter(S::KIND);
        self.controller.note_started(S::KIND, counter);
        info!(
            kind = %S::KIND,
            cycle_id = cycle.cycle_id,
            model = %model_id,
            input_tokens = cycle.input_tokens,
            "Compaction cycle started"
        );
        let event = self.event(S::KIND, CycleStatus::Running, Some(&cycle));
        self.reporter.report(&event);
        self.spawn_worker::<S>(cycle.clone(), input, provider);
        self.stage_mut(S::KIND).active = Some(cycle);
    }

    fn spawn_worker<S: Stage>(&self, cycle: CompactionCycle, input: S::Input, provider: Arc<dyn Provider>) {
        let Some(commands) = self.commands.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let (cycle_id, epoch) = (cycle.cycle_id, cycle.epoch);
            let worker = tokio::spawn(async move { CompactionWorker::<S>::run(&cycle, input, provider).await });
            let result = match worker.await {
                Ok(result) => result,
                Err(e) => Err(CompactionError::Aborted(e.to_string())),
            };
            let _ = commands.send(Command::Completed(Completion {
                kind: S::KIND,
                cycle_id,
                epoch,
                result,
            }));
        });
    }

    fn discard_buffering(&mut self, kind: CycleKind, reason: &str) {
        let discarded = self
            .stage_mut(kind)
            .active
            .take_if(|c| c.status == CycleStatus::Buffering);
        if let Some(cycle) = discarded {
            debug!(kind = %kind, cycle_id = cycle.cycle_id, reason, "Discarding buffered cycle");
            let event = self.event(kind, CycleStatus::Idle, None);
            self.reporter.report(&event);
        }
    }

    fn block(&mut self, kind: CycleKind, backlog: TokenCount, limit: TokenCount, reason: BlockReason) {
        if self.stage(kind).blocked {
            return;
        }
        self.stage_mut(kind).blocked = true;
        warn!(kind = %kind, backlog, limit, reason = %reason, "Compaction backpressure, refusing new cycles");

        let active = self.stage(kind).active.as_ref();
        let status = active.map_or(CycleStatus::Idle, |c| c.status);
        let mut event = self.event(kind, status, active);
        event.warning = Some(format!("{reason} ({backlog} of {limit} tokens)"));
        self.reporter.report(&event);
    }

    fn report_config_error(&mut self, kind: CycleKind, err: CompactionError) {
        let generation = self.generation;
        let stage = self.stage_mut(kind);
        if stage.config_error_generation == Some(generation) {
            return;
        }
        stage.config_error_generation = Some(generation);
        error!(kind = %kind, scope = %self.config.scope, error = %err, "Compaction configuration error, stage stays idle");

        let mut event = self.event(kind, CycleStatus::Failed, None);
        event.error = Some(err.to_string());
        self.reporter.report(&event);
    }

    // ── Completions ──────────────────────────────────────────────────

    async fn complete(&mut self, done: Completion) {
        let kind = done.kind;
        let active_id = self
            .stage(kind)
            .active
            .as_ref()
            .filter(|c| c.is_running())
            .map(|c| c.cycle_id);
        if done.epoch != self.epoch || active_id != Some(done.cycle_id) {
            warn!(
                kind = %kind,
                cycle_id = done.cycle_id,
                active_cycle_id = ?active_id,
                "Dropping stale compaction result"
            );
            self.reporter.notify(DomainEvent::StaleCompletionDropped {
                kind,
                cycle_id: done.cycle_id,
                active_cycle_id: active_id,
                timestamp: Utc::now(),
            });
            return;
        }
        let Some(mut cycle) = self.stage_mut(kind).active.take() else {
            return;
        };

        match done.result {
            Ok(output) => {
                let warning = match kind {
                    CycleKind::Observation => self.apply_observation(&cycle, &output),
                    CycleKind::Reflection => self.apply_reflection(&cycle, &output),
                };
                cycle.complete(output.output_tokens);
                self.controller.note_reduced(kind);
                info!(
                    kind = %kind,
                    cycle_id = cycle.cycle_id,
                    input_tokens = cycle.input_tokens,
                    output_tokens = output.output_tokens,
                    ratio = ?cycle.compression_ratio(),
                    duration_ms = ?cycle.duration_ms(),
                    "Compaction cycle complete"
                );

                if let Some(w) = warning {
                    self.reporter.notify(DomainEvent::CounterClamped {
                        kind: w.kind,
                        requested: w.requested,
                        available: w.available,
                        timestamp: Utc::now(),
                    });
                }
                let stage = self.stage_mut(kind);
                stage.completed += 1;
                stage.last = Some(cycle.outcome(None));

                let mut event = self.event(kind, CycleStatus::Complete, Some(&cycle));
                event.warning = warning.map(|w| w.to_string());
                self.reporter.report(&event);
                self.persist().await;
            }
            Err(err) => {
                cycle.fail();
                warn!(kind = %kind, cycle_id = cycle.cycle_id, error = %err, "Compaction cycle failed");

                let counter = self.counter(kind);
                let stage = self.stage_mut(kind);
                stage.failed += 1;
                stage.last = Some(cycle.outcome(Some(err.to_string())));
                stage.held_at = Some(counter);

                let mut event = self.event(kind, CycleStatus::Failed, Some(&cycle));
                event.error = Some(err.to_string());
                self.reporter.report(&event);
            }
        }
    }

    fn apply_observation(&mut self, cycle: &CompactionCycle, output: &CompactionOutput) -> Option<ConsistencyWarning> {
        self.messages.retain(|m| !output.covered.contains(&m.message.id));
        self.records.push(ObservationRecord::new(
            RecordKind::Observation,
            output.text.clone(),
            output.output_tokens,
            cycle.cycle_id,
        ));
        ObservationStage::account(&mut self.accountant, cycle.input_tokens, output.output_tokens)
    }

    fn apply_reflection(&mut self, cycle: &CompactionCycle, output: &CompactionOutput) -> Option<ConsistencyWarning> {
        self.records.retain(|r| !output.covered.contains(&r.id));
        // Everything older was folded in, so the reflection leads the set
        self.records.insert(
            0,
            ObservationRecord::new(
                RecordKind::Reflection,
                output.text.clone(),
                output.output_tokens,
                cycle.cycle_id,
            ),
        );
        ReflectionStage::account(&mut self.accountant, cycle.input_tokens, output.output_tokens)
    }

    // ── Commands ─────────────────────────────────────────────────────

    async fn clear(&mut self) {
        self.epoch += 1;
        self.messages.clear();
        self.records.clear();
        self.accountant.reset();
        self.controller.reset();
        for kind in KINDS {
            let stage = self.stage_mut(kind);
            stage.blocked = false;
            stage.held_at = None;
            if let Some(cycle) = stage.active.take() {
                debug!(kind = %kind, cycle_id = cycle.cycle_id, status = ?cycle.status, "Abandoning cycle on clear");
            }
        }
        if let Err(e) = self.storage.clear(&self.config.scope).await {
            warn!(scope = %self.config.scope, error = %e, "Failed to clear stored observations");
        }
        info!(scope = %self.config.scope, epoch = self.epoch, "Memory cleared");
        for kind in KINDS {
            let event = self.event(kind, CycleStatus::Idle, None);
            self.reporter.report(&event);
        }
    }

    fn context(&self) -> MemoryContext {
        let tokens = self.accountant.snapshot();
        MemoryContext {
            observations: render_observations(&self.records),
            messages: self.messages.iter().map(|m| m.message.clone()).collect(),
            observation_tokens: tokens.observation_tokens,
            pending_tokens: tokens.pending_tokens,
        }
    }

    fn publish(&self) {
        self.snapshots.send_replace(PipelineSnapshot {
            config: self.config.clone(),
            tokens: self.accountant.snapshot(),
            observation: self.observation.snapshot(),
            reflection: self.reflection.snapshot(),
            unobserved_messages: self.messages.len(),
            records: self.records.len(),
            epoch: self.epoch,
            generation: self.generation,
            loaded: self.loaded,
        });
    }

    // ── Helpers ──────────────────────────────────────────────────────

    fn resolve(&self, model_id: &str) -> Result<Arc<dyn Provider>, CompactionError> {
        self.resolver
            .resolve(model_id)
            .map_err(|e| CompactionError::ModelUnavailable {
                model: model_id.to_string(),
                reason: e.to_string(),
            })
    }

    fn event(&self, kind: CycleKind, status: CycleStatus, cycle: Option<&CompactionCycle>) -> ProgressEvent {
        progress_event(kind, status, cycle, self.accountant.snapshot(), &self.config)
    }

    /// The counter `kind`'s threshold is compared against.
    fn counter(&self, kind: CycleKind) -> TokenCount {
        let tokens = self.accountant.snapshot();
        match kind {
            CycleKind::Observation => tokens.pending_tokens,
            CycleKind::Reflection => tokens.observation_tokens,
        }
    }

    fn next_cycle_id(&mut self) -> CycleId {
        self.last_cycle_id += 1;
        self.last_cycle_id
    }

    fn stage(&self, kind: CycleKind) -> &StageState {
        match kind {
            CycleKind::Observation => &self.observation,
            CycleKind::Reflection => &self.reflection,
        }
    }

    fn stage_mut(&mut self, kind: CycleKind) -> &mut StageState {
        match kind {
            CycleKind::Observation => &mut self.observation,
            CycleKind::Reflection => &mut self.reflection,
        }
    }
}

fn render_observations(records: &[ObservationRecord]) -> String {
    if records.is_empty() {
        return String::new();
    }
    let mut out = String::from("<observations>\n");
    for record in records {
        let label = match record.kind {
            RecordKind::Observation => "Observation",
            RecordKind::Reflection => "Reflection",
        };
        let _ = writeln!(
            out,
            "## {label} ({})\n{}\n",
            record.created_at.format("%Y-%m-%d %H:%M UTC"),
            record.content.trim()
        );
    }
    out.push_str("</observations>");
    out
}
