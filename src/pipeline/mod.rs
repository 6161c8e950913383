//! Pipeline assembly and supervision.
//!
//! The pipeline is a linear chain of stages, each on its own thread,
//! connected by stage channels. A dedicated supervision thread owns the
//! supervisor, the performance monitor and the quality controller, and talks
//! to the outside world through a [`PipelineHandle`].
//!
//! # Architecture
//!
//! ```text
//! [capture] ─ch─► [detect] ─ch─► [align] ─ch─► [transform] ─ch─► [merge] ─ch─┐
//!     ▲               ▲              ▲               ▲                ▲       │
//!     └── QualityState (read before every frame) ────┴────────────────┘       ▼
//!                                                               FallbackManager ──► output sink
//! supervision thread: pump supervisor ─► monitor ─► quality controller
//! heartbeat thread:   FallbackManager::tick
//! ```
//!
//! # Design
//!
//! - **Tagged stage kinds** - resolved once in [`PipelineBuilder::build`].
//! - **Latest-wins channels** - slow stages skip frames instead of queueing.
//! - **Separate heartbeat timer** - a stalled pipeline is still detected.
//! - **Control surface** - commands travel over a crossbeam channel.

pub mod bridge;

pub use bridge::{PipelineCommand, PipelineHandle, PipelineStatus};

use crate::arena::StageChannel;
use crate::config::{CoreConfig, PersistedState};
use crate::error::{LiveCoreError, Result};
use crate::fallback::{self, FallbackManager};
use crate::monitor::{PerformanceMonitor, ScoreBreakdown};
use crate::quality::{AdaptiveQualityController, QualityAction};
use crate::stage::{
    FramePusher, StageDescriptor, StageId, StageKind, StageState, StageSupervisor,
};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Channel capacity for commands (control surface -> pipeline)
const CMD_CHANNEL_CAPACITY: usize = 64;

struct CustomStage {
    name: String,
    kind: StageKind,
    budget: Duration,
}

/// Assembles a [`Pipeline`] from configuration.
pub struct PipelineBuilder {
    config: CoreConfig,
    persisted: Option<PersistedState>,
    persist_path: Option<PathBuf>,
    kind_overrides: Vec<(String, StageKind)>,
    custom: Vec<CustomStage>,
}

impl PipelineBuilder {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            config,
            persisted: None,
            persist_path: None,
            kind_overrides: Vec::new(),
            custom: Vec::new(),
        }
    }

    /// Apply state saved by a previous session
    pub fn with_persisted_state(mut self, state: PersistedState) -> Self {
        self.persisted = Some(state);
        self
    }

    /// Write the persisted state to `path` on shutdown
    pub fn persist_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.persist_path = Some(path.into());
        self
    }

    /// Replace the operation of a configured stage, keeping its budget and flags
    pub fn with_stage_kind(mut self, stage: impl Into<String>, kind: StageKind) -> Self {
        self.kind_overrides.push((stage.into(), kind));
        self
    }

    /// Append a stage after the configured ones
    pub fn with_custom_stage(
        mut self,
        name: impl Into<String>,
        kind: StageKind,
        budget: Duration,
    ) -> Self {
        self.custom.push(CustomStage {
            name: name.into(),
            kind,
            budget,
        });
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        let config = self.config;
        config.validate()?;

        let format = config.arena.format;
        let slots = config.arena.slots_per_channel;
        let persisted = self.persisted.unwrap_or_default();

        let quality = AdaptiveQualityController::new(config.quality.clone()).restore(&persisted);
        let mut supervisor = StageSupervisor::new(config.supervisor.clone(), quality.shared());
        let mut monitor = PerformanceMonitor::new(config.monitor.clone());
        let mut overrides: HashMap<String, StageKind> = self.kind_overrides.into_iter().collect();

        let mut pusher: Option<FramePusher> = None;
        let mut upstream: Option<StageChannel> = None;

        for stage in &config.stages {
            let (resolved, stage_pusher) =
                StageKind::resolve(&stage.kind, &config.capture, format);
            let kind = match overrides.remove(&stage.name) {
                Some(custom) => {
                    if custom.is_source() != resolved.is_source() {
                        return Err(LiveCoreError::Config(format!(
                            "stage '{}' cannot change between source and relay",
                            stage.name
                        )));
                    }
                    custom
                }
                None => {
                    if stage_pusher.is_some() {
                        pusher = stage_pusher;
                    }
                    resolved
                }
            };

            let enabled = persisted
                .stage_enabled(&stage.name)
                .unwrap_or(stage.enabled);
            let output = StageChannel::new(stage.name.clone(), format, slots)?;
            let descriptor = StageDescriptor {
                id: StageId::default(),
                name: stage.name.clone(),
                kind,
                upstream: upstream.take(),
                output: output.clone(),
                budget: Duration::from_millis(stage.budget_ms),
                work: Duration::from_millis(stage.work_ms),
                enabled,
                state: StageState::Stopped,
            };
            let budget = descriptor.budget;
            let id = supervisor.add(descriptor);
            monitor.register_stage(id, stage.name.clone(), budget);
            upstream = Some(output);
        }

        if let Some(name) = overrides.keys().next() {
            return Err(LiveCoreError::UnknownStage(name.clone()));
        }

        for custom in self.custom {
            if custom.kind.is_source() {
                return Err(LiveCoreError::Config(format!(
                    "custom stage '{}' cannot be a source",
                    custom.name
                )));
            }
            if supervisor.find(&custom.name).is_some() {
                return Err(LiveCoreError::Config(format!(
                    "duplicate stage name '{}'",
                    custom.name
                )));
            }
            let enabled = persisted.stage_enabled(&custom.name).unwrap_or(true);
            let output = StageChannel::new(custom.name.clone(), format, slots)?;
            let descriptor = StageDescriptor {
                id: StageId::default(),
                name: custom.name.clone(),
                kind: custom.kind,
                upstream: upstream.take(),
                output: output.clone(),
                budget: custom.budget,
                work: Duration::ZERO,
                enabled,
                state: StageState::Stopped,
            };
            let id = supervisor.add(descriptor);
            monitor.register_stage(id, custom.name, custom.budget);
            upstream = Some(output);
        }

        let final_channel =
            upstream.ok_or_else(|| LiveCoreError::Config("no stages configured".to_string()))?;
        let mut fallback = FallbackManager::new(config.fallback.clone(), final_channel.clone())?;
        for source in &config.loopback_sources {
            fallback.register(source)?;
        }

        tracing::info!(
            "Pipeline assembled: {} stages, {} frames, {} slots per channel, quality {}",
            supervisor.len(),
            format,
            slots,
            quality.published()
        );

        Ok(Pipeline {
            tick_interval: config.supervisor.tick_interval(),
            supervisor,
            monitor,
            quality,
            fallback: Arc::new(Mutex::new(fallback)),
            final_channel,
            pusher,
            persist_path: self.persist_path,
            started_at: None,
            last_score: None,
        })
    }
}

/// An assembled pipeline.
///
/// Either drive it by hand with [`Pipeline::start`] and [`Pipeline::step`],
/// or hand it to a supervision thread with [`Pipeline::spawn`].
pub struct Pipeline {
    tick_interval: Duration,
    supervisor: StageSupervisor,
    monitor: PerformanceMonitor,
    quality: AdaptiveQualityController,
    fallback: Arc<Mutex<FallbackManager>>,
    final_channel: StageChannel,
    pusher: Option<FramePusher>,
    persist_path: Option<PathBuf>,
    started_at: Option<Instant>,
    last_score: Option<ScoreBreakdown>,
}

impl Pipeline {
    pub fn supervisor(&self) -> &StageSupervisor {
        &self.supervisor
    }

    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    pub fn quality(&self) -> &AdaptiveQualityController {
        &self.quality
    }

    pub fn fallback(&self) -> &Arc<Mutex<FallbackManager>> {
        &self.fallback
    }

    /// Channel the output sink ultimately reads through the fallback manager
    pub fn final_channel(&self) -> &StageChannel {
        &self.final_channel
    }

    /// Producer handle when the first stage is a push capture
    pub fn pusher(&self) -> Option<&FramePusher> {
        self.pusher.as_ref()
    }

    pub fn last_score(&self) -> Option<ScoreBreakdown> {
        self.last_score
    }

    /// Start every stage
    pub fn start(&mut self) -> Result<()> {
        self.started_at = Some(Instant::now());
        self.supervisor.start_all()
    }

    /// One supervision tick: health, performance, quality.
    pub fn step(&mut self, now: Instant) {
        self.supervisor.pump(now, &mut self.monitor);
        self.monitor
            .record_output(now, self.final_channel.generation());

        if self.monitor.has_signal() {
            let score = self.monitor.composite_score(now);
            match self.quality.tick(now, score.score) {
                QualityAction::Degraded | QualityAction::Restored => {
                    tracing::debug!(
                        "Score {:.2} (fps {:.1}, fps term {:.2}, processing {:.2}, queue {:.2})",
                        score.score,
                        score.fps,
                        score.fps_term,
                        score.processing_term,
                        score.queue_term
                    );
                }
                _ => {}
            }
            self.last_score = Some(score);
        }
    }

    pub fn set_stage_enabled(&mut self, stage: &str, enabled: bool) -> Result<()> {
        let id = self
            .supervisor
            .find(stage)
            .ok_or_else(|| LiveCoreError::UnknownStage(stage.to_string()))?;
        self.supervisor.set_enabled(id, enabled)
    }

    pub fn restart_stage(&mut self, stage: &str) -> Result<()> {
        let id = self
            .supervisor
            .find(stage)
            .ok_or_else(|| LiveCoreError::UnknownStage(stage.to_string()))?;
        self.supervisor.restart(id)
    }

    /// `None` hands quality back to the automatic loop
    pub fn set_quality_override(&mut self, factor: Option<f32>) {
        self.quality.set_override(factor);
    }

    pub fn status(&self, now: Instant) -> PipelineStatus {
        PipelineStatus {
            uptime: self
                .started_at
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or_default(),
            stages: self.supervisor.reports(),
            stage_stats: self
                .monitor
                .all_stats()
                .into_iter()
                .map(|(_, stats)| stats)
                .collect(),
            fps: self.monitor.fps(),
            score: self.last_score,
            quality: self.quality.snapshot(),
            fallback: self.fallback.lock().status(now),
        }
    }

    /// What the next session should start from
    pub fn persisted_state(&self) -> PersistedState {
        let automatic = self.quality.automatic();
        PersistedState {
            quality_scale: automatic.scale,
            frame_skip: automatic.frame_skip,
            stages: self
                .supervisor
                .descriptors()
                .map(|d| (d.name.clone(), d.enabled))
                .collect(),
            ..Default::default()
        }
    }

    /// Stop every stage and persist state if a path was configured
    pub fn stop(&mut self) -> PersistedState {
        self.supervisor.stop_all();
        let mut state = self.persisted_state();
        if let Some(path) = &self.persist_path {
            match state.save_to(path) {
                Ok(()) => tracing::info!("Saved pipeline state to {:?}", path),
                Err(e) => tracing::warn!("Failed to save pipeline state: {}", e),
            }
        }
        state
    }

    /// Start the stages, the supervision thread and the heartbeat timer.
    pub fn spawn(mut self) -> Result<PipelineHandle> {
        self.start()?;

        let (cmd_tx, cmd_rx) = crossbeam_channel::bounded(CMD_CHANNEL_CAPACITY);
        let (timer_tx, timer_rx) = crossbeam_channel::bounded(1);
        let status = Arc::new(Mutex::new(self.status(Instant::now())));
        let manager = Arc::clone(&self.fallback);
        let pusher = self.pusher.clone();

        let timer = fallback::spawn_heartbeat_timer(Arc::clone(&manager), timer_rx)?;
        let published = Arc::clone(&status);
        let worker = std::thread::Builder::new()
            .name("pipeline-supervisor".to_string())
            .spawn(move || self.run(cmd_rx, published))?;

        Ok(PipelineHandle::new(
            cmd_tx, status, manager, pusher, worker, timer, timer_tx,
        ))
    }

    fn handle_command(&mut self, command: PipelineCommand) {
        match command {
            PipelineCommand::SetStageEnabled {
                stage,
                enabled,
                reply,
            } => {
                let _ = reply.send(self.set_stage_enabled(&stage, enabled));
            }
            PipelineCommand::RestartStage { stage, reply } => {
                let _ = reply.send(self.restart_stage(&stage));
            }
            PipelineCommand::SetQualityOverride(factor) => self.set_quality_override(factor),
            // Handled by the run loop
            PipelineCommand::Shutdown => {}
        }
    }

    /// Supervision loop. Returns the state persisted on exit.
    fn run(
        mut self,
        commands: Receiver<PipelineCommand>,
        status: Arc<Mutex<PipelineStatus>>,
    ) -> PersistedState {
        tracing::info!(
            "Pipeline supervision started ({} stages)",
            self.supervisor.len()
        );
        let mut next_tick = Instant::now();

        loop {
            let timeout = next_tick.saturating_duration_since(Instant::now());
            match commands.recv_timeout(timeout) {
                Ok(PipelineCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(command) => {
                    self.handle_command(command);
                    if Instant::now() < next_tick {
                        continue;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
            }

            let now = Instant::now();
            self.step(now);
            *status.lock() = self.status(now);
            next_tick = now + self.tick_interval;
        }

        let state = self.stop();
        *status.lock() = self.status(Instant::now());
        tracing::info!("Pipeline supervision exiting");
        state
    }
}
