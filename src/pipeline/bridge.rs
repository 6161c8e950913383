//! Thread boundary between the running pipeline and its controller.
//!
//! `PipelineHandle` is the control surface: stage toggles and restarts go to
//! the supervision thread as [`PipelineCommand`]s, status is read from the
//! snapshot that thread publishes every tick, and output frames come straight
//! from the fallback manager.

use crate::config::{LoopbackSourceConfig, PersistedState};
use crate::error::{LiveCoreError, Result};
use crate::fallback::{FallbackManager, FallbackStatus};
use crate::monitor::{ScoreBreakdown, StageStats};
use crate::quality::QualitySnapshot;
use crate::stage::{FramePusher, StageReport};
use crate::types::Frame;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How long a control call waits for the supervision thread to answer
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Commands sent to the supervision thread.
#[derive(Debug, Clone)]
pub enum PipelineCommand {
    /// Enable or bypass a stage by name
    SetStageEnabled {
        stage: String,
        enabled: bool,
        reply: Sender<Result<()>>,
    },
    /// Replace a stage's execution context, clearing its crash history
    RestartStage {
        stage: String,
        reply: Sender<Result<()>>,
    },
    /// Pin the quality scale; `None` restores automatic control
    SetQualityOverride(Option<f32>),
    /// Stop every stage, persist state and exit
    Shutdown,
}

/// Everything the control surface reports about a running pipeline
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub uptime: Duration,
    pub stages: Vec<StageReport>,
    pub stage_stats: Vec<StageStats>,
    /// End-to-end frames per second at the final channel
    pub fps: f64,
    /// Latest composite score, once the monitor has enough history
    pub score: Option<ScoreBreakdown>,
    pub quality: QualitySnapshot,
    pub fallback: FallbackStatus,
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "fps {:.1} | quality {} | fallback {}",
            self.fps, self.quality.published, self.fallback.state
        )?;
        if let Some(source) = &self.fallback.active_source {
            write!(f, " ({})", source)?;
        }
        if let Some(score) = &self.score {
            write!(f, " | score {:.2}", score.score)?;
        }
        for stage in &self.stages {
            write!(f, " | {}={}", stage.name, stage.state)?;
            if !stage.enabled {
                write!(f, "(off)")?;
            }
        }
        Ok(())
    }
}

/// Controller-side handle of a spawned pipeline.
///
/// Dropping the handle shuts the pipeline down; call
/// [`PipelineHandle::shutdown`] to get the persisted state back.
pub struct PipelineHandle {
    cmd_tx: Sender<PipelineCommand>,
    status: Arc<Mutex<PipelineStatus>>,
    fallback: Arc<Mutex<FallbackManager>>,
    pusher: Option<FramePusher>,
    worker: Option<JoinHandle<PersistedState>>,
    timer: Option<JoinHandle<()>>,
    timer_stop: Sender<()>,
}

impl PipelineHandle {
    pub(crate) fn new(
        cmd_tx: Sender<PipelineCommand>,
        status: Arc<Mutex<PipelineStatus>>,
        fallback: Arc<Mutex<FallbackManager>>,
        pusher: Option<FramePusher>,
        worker: JoinHandle<PersistedState>,
        timer: JoinHandle<()>,
        timer_stop: Sender<()>,
    ) -> Self {
        Self {
            cmd_tx,
            status,
            fallback,
            pusher,
            worker: Some(worker),
            timer: Some(timer),
            timer_stop,
        }
    }

    fn send(&self, command: PipelineCommand) -> Result<()> {
        self.cmd_tx
            .send(command)
            .map_err(|_| LiveCoreError::Channel("pipeline thread has exited".to_string()))
    }

    fn request(&self, build: impl FnOnce(Sender<Result<()>>) -> PipelineCommand) -> Result<()> {
        let (reply_tx, reply_rx): (Sender<Result<()>>, Receiver<Result<()>>) =
            crossbeam_channel::bounded(1);
        self.send(build(reply_tx))?;
        reply_rx.recv_timeout(REPLY_TIMEOUT).map_err(|e| {
            LiveCoreError::Channel(format!("no reply from pipeline thread: {}", e))
        })?
    }

    /// Enable a stage or put it in bypass. Disabling the source starves the
    /// live chain, which hands output to the fallback manager.
    pub fn set_stage_enabled(&self, stage: &str, enabled: bool) -> Result<()> {
        self.request(|reply| PipelineCommand::SetStageEnabled {
            stage: stage.to_string(),
            enabled,
            reply,
        })
    }

    pub fn restart_stage(&self, stage: &str) -> Result<()> {
        self.request(|reply| PipelineCommand::RestartStage {
            stage: stage.to_string(),
            reply,
        })
    }

    /// Pin the quality scale, or hand it back to the automatic loop with `None`
    pub fn set_quality_override(&self, factor: Option<f32>) -> Result<()> {
        self.send(PipelineCommand::SetQualityOverride(factor))
    }

    pub fn register_loopback_source(&self, config: LoopbackSourceConfig) -> Result<()> {
        self.fallback.lock().register(&config)
    }

    /// Latest status; the fallback part is read fresh
    pub fn get_pipeline_status(&self) -> PipelineStatus {
        let mut status = self.status.lock().clone();
        status.fallback = self.fallback.lock().status(Instant::now());
        status
    }

    /// The frame the output sink should show now; live or fallback, never empty
    pub fn get_current_output_frame(&self) -> Result<Frame> {
        self.fallback
            .lock()
            .get_current_output_frame(Instant::now())
    }

    /// Producer handle when the first stage is a push capture
    pub fn pusher(&self) -> Option<&FramePusher> {
        self.pusher.as_ref()
    }

    /// Stop the pipeline and return the state it persisted
    pub fn shutdown(mut self) -> Result<PersistedState> {
        self.stop_threads()
            .ok_or_else(|| LiveCoreError::Channel("pipeline thread panicked".to_string()))
    }

    fn stop_threads(&mut self) -> Option<PersistedState> {
        let _ = self.cmd_tx.send(PipelineCommand::Shutdown);
        let state = self.worker.take().and_then(|worker| worker.join().ok());

        let _ = self.timer_stop.send(());
        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }
        state
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop_threads();
        }
    }
}
