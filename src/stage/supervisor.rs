//! Stage Supervisor
//!
//! Owns every stage's descriptor and execution context. The supervisor is
//! driven by [`StageSupervisor::pump`], called periodically from the
//! pipeline's supervision thread, which:
//!
//! 1. drains performance samples, marking stages `Degraded` when a unit of
//!    work overruns `budget * budget_multiple` and forwarding them to the
//!    monitor
//! 2. reaps finished threads; a panic or an error return is a crash
//! 3. hard-kills stages busy for longer than the hang timeout
//! 4. restarts crashed stages after their backoff delay, or marks them
//!    `Failed` once `max_attempts` runs have crashed within the window
//!
//! A hard kill revokes the stage's writer lease and detaches its thread.
//! Whatever the detached thread does afterwards cannot reach the channel.

use crate::config::SupervisorSettings;
use crate::error::{LiveCoreError, Result};
use crate::monitor::{PerformanceMonitor, PerformanceSample, SampleKind};
use crate::quality::SharedQuality;
use crate::stage::runner::{StageControl, StageExit, StageRuntime};
use crate::stage::{StageDescriptor, StageHealth, StageId, StageState};
use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Samples buffered between two supervision ticks before stages start dropping them
const SAMPLE_QUEUE: usize = 4096;

/// Status of one stage for reporting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    pub id: StageId,
    pub name: String,
    pub kind: String,
    pub state: StageState,
    pub enabled: bool,
    pub budget_ms: u64,
    /// Restarts performed since the pipeline started
    pub restarts: u32,
    /// Crashes counted against the current restart window
    pub recent_crashes: u32,
    pub last_error: Option<String>,
    pub frames_published: u64,
    pub generation: u64,
}

struct SupervisedStage {
    descriptor: StageDescriptor,
    health: Arc<StageHealth>,
    control: Option<Sender<StageControl>>,
    handle: Option<JoinHandle<Result<StageExit>>>,
    crashes: VecDeque<Instant>,
    restarts: u32,
    restart_at: Option<Instant>,
    stop_requested_at: Option<Instant>,
    last_error: Option<String>,
}

impl SupervisedStage {
    fn set_state(&mut self, state: StageState) {
        if self.descriptor.state != state {
            tracing::info!(
                "Stage '{}' {} -> {}",
                self.descriptor.name,
                self.descriptor.state,
                state
            );
            self.descriptor.state = state;
        }
    }

    /// Revoke the lease and let the thread go
    fn detach(&mut self) {
        self.descriptor.output.revoke_writer();
        self.control = None;
        self.handle = None;
    }
}

pub struct StageSupervisor {
    settings: SupervisorSettings,
    quality: Arc<SharedQuality>,
    samples_tx: Sender<PerformanceSample>,
    samples_rx: Receiver<PerformanceSample>,
    stages: Vec<SupervisedStage>,
}

impl StageSupervisor {
    pub fn new(settings: SupervisorSettings, quality: Arc<SharedQuality>) -> Self {
        let (samples_tx, samples_rx) = crossbeam_channel::bounded(SAMPLE_QUEUE);
        Self {
            settings,
            quality,
            samples_tx,
            samples_rx,
            stages: Vec::new(),
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Take ownership of a stage. Its id must match its position.
    pub fn add(&mut self, mut descriptor: StageDescriptor) -> StageId {
        let id = StageId(self.stages.len() as u32);
        descriptor.id = id;
        descriptor.state = StageState::Stopped;
        self.stages.push(SupervisedStage {
            descriptor,
            health: Arc::new(StageHealth::new()),
            control: None,
            handle: None,
            crashes: VecDeque::new(),
            restarts: 0,
            restart_at: None,
            stop_requested_at: None,
            last_error: None,
        });
        id
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<StageId> {
        self.stages
            .iter()
            .find(|s| s.descriptor.name == name)
            .map(|s| s.descriptor.id)
    }

    pub fn descriptor(&self, id: StageId) -> Option<&StageDescriptor> {
        self.stages.get(id.0 as usize).map(|s| &s.descriptor)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &StageDescriptor> {
        self.stages.iter().map(|s| &s.descriptor)
    }

    pub fn state(&self, id: StageId) -> Option<StageState> {
        self.descriptor(id).map(|d| d.state)
    }

    pub fn health(&self, id: StageId) -> Option<Arc<StageHealth>> {
        self.stages.get(id.0 as usize).map(|s| Arc::clone(&s.health))
    }

    fn stage_mut(&mut self, id: StageId) -> Result<&mut SupervisedStage> {
        self.stages
            .get_mut(id.0 as usize)
            .ok_or_else(|| LiveCoreError::UnknownStage(id.to_string()))
    }

    pub fn start_all(&mut self) -> Result<()> {
        for index in 0..self.stages.len() {
            self.start(StageId(index as u32))?;
        }
        Ok(())
    }

    /// Start a stopped stage. Active stages are left alone.
    pub fn start(&mut self, id: StageId) -> Result<()> {
        let stage = self.stage_mut(id)?;
        if stage.descriptor.state.is_active() || stage.handle.is_some() {
            return Ok(());
        }
        stage.crashes.clear();
        stage.restart_at = None;
        self.spawn(id)
    }

    fn spawn(&mut self, id: StageId) -> Result<()> {
        let quality = Arc::clone(&self.quality);
        let samples = self.samples_tx.clone();
        let stage = self.stage_mut(id)?;

        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let descriptor = &stage.descriptor;
        let runtime = StageRuntime {
            id,
            name: descriptor.name.clone(),
            operation: descriptor.kind.instantiate(),
            upstream: descriptor.upstream.clone(),
            writer: descriptor.output.claim_writer(),
            quality,
            enabled: descriptor.enabled,
            work: descriptor.work,
            control: control_rx,
            samples,
            health: Arc::clone(&stage.health),
        };

        stage.set_state(StageState::Starting);
        let handle = runtime.spawn().map_err(|e| LiveCoreError::StageCrashed {
            stage: id,
            reason: format!("failed to spawn thread: {}", e),
        })?;
        stage.handle = Some(handle);
        stage.control = Some(control_tx);
        stage.stop_requested_at = None;
        Ok(())
    }

    /// Ask a stage to stop after its current unit of work.
    pub fn stop(&mut self, id: StageId) -> Result<()> {
        let now = Instant::now();
        let stage = self.stage_mut(id)?;
        stage.restart_at = None;
        match &stage.control {
            Some(control) if stage.handle.is_some() => {
                let _ = control.send(StageControl::Stop);
                stage.stop_requested_at = Some(now);
                stage.set_state(StageState::Stopping);
            }
            _ => {
                if stage.descriptor.state != StageState::Failed {
                    stage.set_state(StageState::Stopped);
                }
            }
        }
        Ok(())
    }

    /// Throw away the current execution context and start a fresh one.
    ///
    /// Clears the crash history, so a `Failed` stage gets a new budget.
    pub fn restart(&mut self, id: StageId) -> Result<()> {
        let stage = self.stage_mut(id)?;
        if stage.handle.is_some() {
            stage.detach();
        }
        stage.crashes.clear();
        stage.restart_at = None;
        stage.restarts += 1;
        tracing::info!("Stage '{}' restart requested", stage.descriptor.name);
        self.spawn(id)
    }

    /// Enable or bypass a stage. Takes effect on its next loop iteration.
    pub fn set_enabled(&mut self, id: StageId, enabled: bool) -> Result<()> {
        let stage = self.stage_mut(id)?;
        stage.descriptor.enabled = enabled;
        if let Some(control) = &stage.control {
            let _ = control.send(StageControl::SetEnabled(enabled));
        }
        Ok(())
    }

    /// One supervision tick.
    pub fn pump(&mut self, now: Instant, monitor: &mut PerformanceMonitor) {
        self.drain_samples(monitor);
        for index in 0..self.stages.len() {
            let id = StageId(index as u32);
            self.reap(id, now);
            self.check_hang(id, now);
            self.check_restart(id, now);
        }
    }

    fn drain_samples(&mut self, monitor: &mut PerformanceMonitor) {
        let multiple = self.settings.budget_multiple;
        while let Ok(sample) = self.samples_rx.try_recv() {
            if let Some(stage) = self.stages.get_mut(sample.stage.0 as usize) {
                // Samples from a detached context no longer describe this stage
                if stage.handle.is_none() {
                    continue;
                }
                if stage.descriptor.state == StageState::Starting {
                    stage.set_state(StageState::Running);
                }
                if sample.kind == SampleKind::Processed {
                    let budget = stage.descriptor.budget;
                    if sample.duration > budget.mul_f64(multiple) {
                        let err = LiveCoreError::StageBudgetExceeded {
                            stage: stage.descriptor.id,
                            elapsed: sample.duration,
                            budget,
                        };
                        tracing::warn!("{}", err);
                        if stage.descriptor.state == StageState::Running {
                            stage.set_state(StageState::Degraded);
                        }
                    } else if sample.duration <= budget
                        && stage.descriptor.state == StageState::Degraded
                    {
                        stage.set_state(StageState::Running);
                    }
                }
            }
            monitor.record(sample);
        }
    }

    /// Collect a finished thread, if any
    fn reap(&mut self, id: StageId, now: Instant) {
        let Some(stage) = self.stages.get_mut(id.0 as usize) else {
            return;
        };
        if !stage.handle.as_ref().is_some_and(|h| h.is_finished()) {
            // Stop grace expired: abandon the thread
            if let (Some(requested), StageState::Stopping) =
                (stage.stop_requested_at, stage.descriptor.state)
            {
                if now.saturating_duration_since(requested) >= self.settings.stop_grace() {
                    tracing::warn!(
                        "Stage '{}' ignored stop for {:?}, hard-killing",
                        stage.descriptor.name,
                        self.settings.stop_grace()
                    );
                    stage.detach();
                    stage.stop_requested_at = None;
                    stage.set_state(StageState::Stopped);
                }
            }
            return;
        }

        let Some(handle) = stage.handle.take() else {
            return;
        };
        stage.control = None;
        let outcome = handle.join();
        let stopping = stage.descriptor.state == StageState::Stopping;
        stage.stop_requested_at = None;

        let reason = match outcome {
            Ok(Ok(StageExit::Stopped)) if stopping => {
                stage.set_state(StageState::Stopped);
                return;
            }
            Ok(Ok(exit)) => format!("exited unexpectedly ({:?})", exit),
            Ok(Err(e)) => e.to_string(),
            Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
        };
        if stopping {
            stage.set_state(StageState::Stopped);
            return;
        }
        self.record_crash(id, now, reason);
    }

    fn check_hang(&mut self, id: StageId, now: Instant) {
        let hang_timeout = self.settings.hang_timeout();
        let multiple = self.settings.budget_multiple;
        let Some(stage) = self.stages.get_mut(id.0 as usize) else {
            return;
        };
        if stage.handle.is_none() {
            return;
        }
        let Some(busy) = stage.health.busy_for(now) else {
            return;
        };

        if busy >= hang_timeout {
            tracing::error!(
                "Stage '{}' busy for {:?}, hard-killing",
                stage.descriptor.name,
                busy
            );
            stage.detach();
            self.record_crash(id, now, format!("hung for {:?}", busy));
        } else if busy > stage.descriptor.budget.mul_f64(multiple)
            && stage.descriptor.state == StageState::Running
        {
            stage.set_state(StageState::Degraded);
        }
    }

    fn record_crash(&mut self, id: StageId, now: Instant, reason: String) {
        let window = self.settings.restart_window();
        let max_attempts = self.settings.max_attempts;
        let Some(stage) = self.stages.get_mut(id.0 as usize) else {
            return;
        };

        let err = LiveCoreError::StageCrashed {
            stage: id,
            reason: reason.clone(),
        };
        tracing::error!("Stage '{}': {}", stage.descriptor.name, err);
        stage.last_error = Some(reason);

        while stage
            .crashes
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) > window)
        {
            stage.crashes.pop_front();
        }
        stage.crashes.push_back(now);

        let crashes = stage.crashes.len() as u32;
        if crashes >= max_attempts {
            tracing::error!(
                "Stage '{}' crashed {} times within {:?}, giving up",
                stage.descriptor.name,
                crashes,
                window
            );
            stage.descriptor.output.revoke_writer();
            stage.restart_at = None;
            stage.set_state(StageState::Failed);
            return;
        }

        let delay = self.settings.backoff_delay(crashes - 1);
        tracing::warn!(
            "Stage '{}' restarting in {:?} (attempt {} of {})",
            stage.descriptor.name,
            delay,
            crashes + 1,
            max_attempts
        );
        stage.restart_at = Some(now + delay);
        stage.set_state(StageState::Starting);
    }

    fn check_restart(&mut self, id: StageId, now: Instant) {
        let Some(stage) = self.stages.get_mut(id.0 as usize) else {
            return;
        };
        let Some(at) = stage.restart_at else {
            return;
        };
        if now < at {
            return;
        }
        stage.restart_at = None;
        stage.restarts += 1;
        if let Err(e) = self.spawn(id) {
            self.record_crash(id, now, e.to_string());
        }
    }

    /// Stop every stage, waiting up to the grace period before hard-killing.
    pub fn stop_all(&mut self) {
        for index in 0..self.stages.len() {
            let _ = self.stop(StageId(index as u32));
        }

        let deadline = Instant::now() + self.settings.stop_grace();
        loop {
            let pending = self.stages.iter().any(|s| s.handle.is_some());
            if !pending || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
            let now = Instant::now();
            for index in 0..self.stages.len() {
                self.reap(StageId(index as u32), now);
            }
        }

        for stage in &mut self.stages {
            if stage.handle.is_some() {
                tracing::warn!(
                    "Stage '{}' did not stop within {:?}, hard-killing",
                    stage.descriptor.name,
                    self.settings.stop_grace()
                );
                stage.detach();
            }
            if stage.descriptor.state != StageState::Failed {
                stage.set_state(StageState::Stopped);
            }
        }
    }

    pub fn reports(&self) -> Vec<StageReport> {
        self.stages
            .iter()
            .map(|s| StageReport {
                id: s.descriptor.id,
                name: s.descriptor.name.clone(),
                kind: s.descriptor.kind.label().to_string(),
                state: s.descriptor.state,
                enabled: s.descriptor.enabled,
                budget_ms: s.descriptor.budget.as_millis() as u64,
                restarts: s.restarts,
                recent_crashes: s.crashes.len() as u32,
                last_error: s.last_error.clone(),
                frames_published: s.health.frames_published(),
                generation: s.descriptor.output.generation(),
            })
            .collect()
    }
}

impl Drop for StageSupervisor {
    fn drop(&mut self) {
        if self.stages.iter().any(|s| s.handle.is_some()) {
            self.stop_all();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::StageChannel;
    use crate::config::MonitorSettings;
    use crate::quality::QualityState;
    use crate::stage::operation::{StageContext, StageKind, StageOperation};
    use crate::types::{FrameFormat, PixelLayout};

    struct Crasher;

    impl StageOperation for Crasher {
        fn name(&self) -> &str {
            "crasher"
        }

        fn process(&mut self, _ctx: &mut StageContext<'_>) -> Result<()> {
            Err(LiveCoreError::StageCrashed {
                stage: StageId(0),
                reason: "boom".to_string(),
            })
        }
    }

    fn settings() -> SupervisorSettings {
        SupervisorSettings {
            backoff_initial_ms: 1,
            backoff_max_ms: 5,
            stop_grace_ms: 200,
            ..Default::default()
        }
    }

    fn descriptor(kind: StageKind) -> StageDescriptor {
        let format = FrameFormat::new(4, 4, PixelLayout::Gray8);
        StageDescriptor {
            id: StageId(0),
            name: "src".to_string(),
            kind,
            upstream: None,
            output: StageChannel::new("src", format, 2).unwrap(),
            budget: Duration::from_millis(10),
            work: Duration::ZERO,
            enabled: true,
            state: StageState::Stopped,
        }
    }

    fn pump_until(
        supervisor: &mut StageSupervisor,
        monitor: &mut PerformanceMonitor,
        id: StageId,
        want: StageState,
    ) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            supervisor.pump(Instant::now(), monitor);
            if supervisor.state(id) == Some(want) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_repeated_crashes_mark_failed() {
        let mut supervisor =
            StageSupervisor::new(settings(), SharedQuality::new(QualityState::FULL));
        let mut monitor = PerformanceMonitor::new(MonitorSettings::default());
        let id = supervisor.add(descriptor(StageKind::custom("crasher", true, || {
            Box::new(Crasher)
        })));
        supervisor.start(id).unwrap();

        assert!(pump_until(&mut supervisor, &mut monitor, id, StageState::Failed));
        let report = &supervisor.reports()[0];
        assert_eq!(report.recent_crashes, 3);
        assert_eq!(report.restarts, 2);
        assert!(report.last_error.as_deref().unwrap().contains("boom"));

        // No further restarts once failed
        for _ in 0..20 {
            supervisor.pump(Instant::now(), &mut monitor);
        }
        assert_eq!(supervisor.reports()[0].restarts, 2);
    }

    #[test]
    fn test_stop_is_cooperative() {
        let mut supervisor =
            StageSupervisor::new(settings(), SharedQuality::new(QualityState::FULL));
        let mut monitor = PerformanceMonitor::new(MonitorSettings::default());
        let id = supervisor.add(descriptor(StageKind::Capture {
            fps: 100,
            pattern: crate::pattern::PatternKind::Gradient,
        }));
        supervisor.start(id).unwrap();
        assert!(pump_until(&mut supervisor, &mut monitor, id, StageState::Running));

        supervisor.stop(id).unwrap();
        assert!(pump_until(&mut supervisor, &mut monitor, id, StageState::Stopped));
        assert_eq!(supervisor.reports()[0].recent_crashes, 0);
    }

    #[test]
    fn test_manual_restart_revives_failed_stage() {
        let mut supervisor =
            StageSupervisor::new(settings(), SharedQuality::new(QualityState::FULL));
        let mut monitor = PerformanceMonitor::new(MonitorSettings::default());
        let id = supervisor.add(descriptor(StageKind::custom("crasher", true, || {
            Box::new(Crasher)
        })));
        supervisor.start(id).unwrap();
        assert!(pump_until(&mut supervisor, &mut monitor, id, StageState::Failed));

        supervisor.restart(id).unwrap();
        assert_eq!(supervisor.state(id), Some(StageState::Starting));
        assert_eq!(supervisor.reports()[0].recent_crashes, 0);
        supervisor.stop_all();
    }

    #[test]
    fn test_unknown_stage() {
        let mut supervisor =
            StageSupervisor::new(settings(), SharedQuality::new(QualityState::FULL));
        assert!(matches!(
            supervisor.stop(StageId(9)),
            Err(LiveCoreError::UnknownStage(_))
        ));
    }
}
