//! Process supervisor
//!
//! Runs one `llama-server` per loaded model. Every model id has a slot
//! moving through `Idle -> Loading -> Running -> Stopping -> Idle`; a load
//! that fails or times out goes straight back to `Idle`. Each slot carries
//! a [`Generation`] so the background half of a load can never commit
//! after the slot was stopped.

mod command;
mod ports;
mod process;

pub use command::{split_command_line, LaunchCommand};
pub use ports::PortPool;
pub use process::{parse_context_size, OutputSink, ProcessExit, ProcessInfo, ProcessRecord, OUTPUT_HISTORY};

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use crate::catalog::ModelCatalog;
use crate::lifecycle::Generation;
use crate::storage::settings::AppSettings;
use crate::types::config::LaunchOptions;
use crate::types::model::ModelEntry;

/// Pause between spawn and the first readiness check
const SPAWN_SETTLE: Duration = Duration::from_millis(500);

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("No free port in {start}-{end}")]
    NoFreePort { start: u16, end: u16 },

    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("llama-server exited before it was ready (exit code {0:?})")]
    ExitedEarly(Option<i32>),

    #[error("llama-server did not report a context size within {0:?}")]
    LoadTimeout(Duration),
}

/// Lifecycle notifications, for WebSocket/SSE style consumers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SupervisorEvent {
    Loading { model_id: String },
    Loaded { model_id: String, port: u16, ctx_size: u64 },
    LoadFailed { model_id: String, reason: String },
    Stopped { model_id: String },
    Exited { model_id: String, code: Option<i32> },
}

impl SupervisorEvent {
    pub fn model_id(&self) -> &str {
        match self {
            Self::Loading { model_id }
            | Self::Loaded { model_id, .. }
            | Self::LoadFailed { model_id, .. }
            | Self::Stopped { model_id }
            | Self::Exited { model_id, .. } => model_id,
        }
    }
}

/// Where a slot is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotPhase {
    Idle,
    Loading,
    Running,
    Stopping,
}

/// Supervisor tuning, usually derived from [`AppSettings`]
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub llama_bin_dir: Option<PathBuf>,
    pub port_range: RangeInclusive<u16>,
    pub stop_grace: Duration,
    pub load_timeout: Duration,
}

impl SupervisorConfig {
    pub fn from_settings(settings: &AppSettings) -> Self {
        Self {
            llama_bin_dir: settings.llama_bin_dir.clone(),
            port_range: settings.model_port_start..=settings.model_port_end,
            stop_grace: settings.stop_grace(),
            load_timeout: settings.load_timeout(),
        }
    }
}

struct Slot {
    generation: Generation,
    state: Mutex<SlotState>,
}

struct SlotState {
    phase: SlotPhase,
    process: Option<Arc<ProcessRecord>>,
    port: Option<u16>,
}

impl Slot {
    fn new() -> Self {
        Self {
            generation: Generation::new(),
            state: Mutex::new(SlotState {
                phase: SlotPhase::Idle,
                process: None,
                port: None,
            }),
        }
    }
}

enum LoadOutcome {
    Ready(u64),
    Exited(ProcessExit),
    TimedOut,
}

pub struct ProcessSupervisor {
    catalog: Arc<ModelCatalog>,
    config: SupervisorConfig,
    ports: PortPool,
    slots: DashMap<String, Arc<Slot>>,
    events: broadcast::Sender<SupervisorEvent>,
    sink: Option<OutputSink>,
}

impl ProcessSupervisor {
    pub fn new(catalog: Arc<ModelCatalog>, config: SupervisorConfig, sink: Option<OutputSink>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            catalog,
            ports: PortPool::new(config.port_range.clone()),
            config,
            slots: DashMap::new(),
            events,
            sink,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Start loading `model_id` in the background.
    ///
    /// Returns false without side effects when the id is unknown or the
    /// slot is not idle. Completion is reported through [`Self::subscribe`].
    /// Must be called from within a Tokio runtime.
    pub fn load_model_async(self: &Arc<Self>, model_id: &str, options: LaunchOptions) -> bool {
        let Some(entry) = self.catalog.find_model_by_id(model_id) else {
            tracing::warn!("Refusing to load unknown model {}", model_id);
            return false;
        };

        let slot = self.slot(model_id);
        let generation = {
            let mut state = slot.state.lock();
            if state.phase != SlotPhase::Idle {
                tracing::debug!("Refusing to load {}: slot is {:?}", model_id, state.phase);
                return false;
            }
            state.phase = SlotPhase::Loading;
            slot.generation.begin()
        };

        tracing::info!("Loading model {}", model_id);
        self.emit(SupervisorEvent::Loading {
            model_id: model_id.to_string(),
        });

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_load(slot, entry, options, generation).await;
        });
        true
    }

    /// Stop a loading or running model. Returns false when there was nothing to stop.
    pub async fn stop(&self, model_id: &str) -> bool {
        let Some(slot) = self.slots.get(model_id).map(|s| Arc::clone(s.value())) else {
            return false;
        };
        if !self.stop_slot(model_id, &slot, None).await {
            return false;
        }
        self.emit(SupervisorEvent::Stopped {
            model_id: model_id.to_string(),
        });
        true
    }

    /// Stop every loading or running model, continuing past failures
    pub async fn shutdown_all(self: &Arc<Self>) {
        let ids: Vec<String> = self.slots.iter().map(|s| s.key().clone()).collect();
        let mut stops = JoinSet::new();
        for id in ids {
            let this = Arc::clone(self);
            stops.spawn(async move { this.stop(&id).await });
        }
        while let Some(result) = stops.join_next().await {
            if let Err(e) = result {
                tracing::error!("Stopping a model during shutdown failed: {}", e);
            }
        }
        tracing::info!("All models stopped");
    }

    pub fn is_loading(&self, model_id: &str) -> bool {
        self.phase(model_id) == SlotPhase::Loading
    }

    pub fn phase(&self, model_id: &str) -> SlotPhase {
        self.slots
            .get(model_id)
            .map(|slot| slot.state.lock().phase)
            .unwrap_or(SlotPhase::Idle)
    }

    /// Processes whose slot reached `Running`, keyed by model id
    pub fn get_loaded_processes(&self) -> HashMap<String, Arc<ProcessRecord>> {
        self.slots
            .iter()
            .filter_map(|slot| {
                let state = slot.state.lock();
                match (&state.phase, &state.process) {
                    (SlotPhase::Running, Some(process)) => Some((slot.key().clone(), Arc::clone(process))),
                    _ => None,
                }
            })
            .collect()
    }

    /// Port owned by a loading or running model
    pub fn get_port(&self, model_id: &str) -> Option<u16> {
        let slot = self.slots.get(model_id)?;
        let state = slot.state.lock();
        match state.phase {
            SlotPhase::Loading | SlotPhase::Running => state.port,
            _ => None,
        }
    }

    /// Process attached to a slot, whether or not it finished loading
    pub fn process(&self, model_id: &str) -> Option<Arc<ProcessRecord>> {
        let slot = self.slots.get(model_id)?;
        let state = slot.state.lock();
        state.process.clone()
    }

    fn slot(&self, model_id: &str) -> Arc<Slot> {
        Arc::clone(
            self.slots
                .entry(model_id.to_string())
                .or_insert_with(|| Arc::new(Slot::new()))
                .value(),
        )
    }

    fn emit(&self, event: SupervisorEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn run_load(self: Arc<Self>, slot: Arc<Slot>, entry: ModelEntry, options: LaunchOptions, generation: u64) {
        let model_id = entry.model_id.clone();

        let record = match self.spawn_for(&slot, &entry, &options, generation) {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::debug!("Load of {} superseded before launch", model_id);
                return;
            }
            Err(e) => {
                tracing::error!("Failed to load {}: {}", model_id, e);
                if self.reset_if_current(&slot, generation) {
                    self.emit(SupervisorEvent::LoadFailed {
                        model_id,
                        reason: e.to_string(),
                    });
                }
                return;
            }
        };

        tokio::time::sleep(SPAWN_SETTLE).await;
        tracing::debug!("{} started with pid {:?}", model_id, record.pid());

        let timeout = self.config.load_timeout;
        let outcome = tokio::time::timeout(timeout, async {
            tokio::select! {
                biased;
                Some(ctx) = record.wait_ready() => LoadOutcome::Ready(ctx),
                exit = record.wait_exit() => LoadOutcome::Exited(exit),
            }
        })
        .await
        .unwrap_or(LoadOutcome::TimedOut);

        match outcome {
            LoadOutcome::Ready(ctx_size) => {
                let committed = {
                    let mut state = slot.state.lock();
                    let current = slot.generation.is_current(generation) && state.phase == SlotPhase::Loading;
                    if current {
                        state.phase = SlotPhase::Running;
                    }
                    current
                };
                if !committed {
                    return;
                }

                tracing::info!("Model {} ready on port {} (n_ctx = {})", model_id, record.port(), ctx_size);
                self.emit(SupervisorEvent::Loaded {
                    model_id: model_id.clone(),
                    port: record.port(),
                    ctx_size,
                });

                let exit = record.wait_exit().await;
                if self.reset_if_current(&slot, generation) {
                    record.terminate(Duration::ZERO).await;
                    tracing::warn!("Model {} exited unexpectedly (exit code {:?})", model_id, exit.code);
                    self.emit(SupervisorEvent::Exited {
                        model_id,
                        code: exit.code,
                    });
                }
            }
            LoadOutcome::Exited(exit) => {
                if self.reset_if_current(&slot, generation) {
                    record.terminate(Duration::ZERO).await;
                    let reason = SupervisorError::ExitedEarly(exit.code);
                    tracing::error!("Failed to load {}: {}", model_id, reason);
                    self.emit(SupervisorEvent::LoadFailed {
                        model_id,
                        reason: reason.to_string(),
                    });
                }
            }
            LoadOutcome::TimedOut => {
                if self.stop_slot(&model_id, &slot, Some(generation)).await {
                    let reason = SupervisorError::LoadTimeout(timeout);
                    tracing::error!("Failed to load {}: {}", model_id, reason);
                    self.emit(SupervisorEvent::LoadFailed {
                        model_id,
                        reason: reason.to_string(),
                    });
                }
            }
        }
    }

    /// Reserve a port and spawn the server, attaching it to the slot only
    /// while `generation` is current. `Ok(None)` means the load was superseded.
    fn spawn_for(
        &self,
        slot: &Slot,
        entry: &ModelEntry,
        options: &LaunchOptions,
        generation: u64,
    ) -> Result<Option<Arc<ProcessRecord>>, SupervisorError> {
        let port = self.ports.acquire(options.port).ok_or(SupervisorError::NoFreePort {
            start: *self.config.port_range.start(),
            end: *self.config.port_range.end(),
        })?;
        let launch = LaunchCommand::build(self.config.llama_bin_dir.as_deref(), entry, options, port);

        let mut state = slot.state.lock();
        if !slot.generation.is_current(generation) || state.phase != SlotPhase::Loading {
            self.ports.release(port);
            return Ok(None);
        }

        match ProcessRecord::spawn(&entry.model_id, &launch, port, self.sink.clone()) {
            Ok(record) => {
                state.process = Some(Arc::clone(&record));
                state.port = Some(port);
                Ok(Some(record))
            }
            Err(e) => {
                self.ports.release(port);
                Err(e)
            }
        }
    }

    /// Return a slot whose process is gone to `Idle`, unless a stop or a
    /// newer load already owns it.
    fn reset_if_current(&self, slot: &Slot, generation: u64) -> bool {
        let mut state = slot.state.lock();
        if !slot.generation.is_current(generation) {
            return false;
        }
        if !matches!(state.phase, SlotPhase::Loading | SlotPhase::Running) {
            return false;
        }
        state.phase = SlotPhase::Idle;
        state.process = None;
        if let Some(port) = state.port.take() {
            self.ports.release(port);
        }
        true
    }

    /// Tear down a loading or running slot. With `expected`, only the load
    /// of that generation is torn down.
    async fn stop_slot(&self, model_id: &str, slot: &Slot, expected: Option<u64>) -> bool {
        let (process, port) = {
            let mut state = slot.state.lock();
            if !matches!(state.phase, SlotPhase::Loading | SlotPhase::Running) {
                return false;
            }
            if expected.is_some_and(|g| !slot.generation.is_current(g)) {
                return false;
            }
            slot.generation.invalidate();
            state.phase = SlotPhase::Stopping;
            (state.process.take(), state.port.take())
        };

        tracing::info!("Stopping model {}", model_id);
        if let Some(process) = process {
            let exit = process.terminate(self.config.stop_grace).await;
            tracing::debug!("{} stopped (exit code {:?})", model_id, exit.code);
        }
        if let Some(port) = port {
            self.ports.release(port);
        }

        slot.state.lock().phase = SlotPhase::Idle;
        true
    }
}
