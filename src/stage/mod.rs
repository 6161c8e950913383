//! Pipeline stages and their supervision.
//!
//! A stage reads the latest frame from its upstream channel (or from a
//! capture input when it is the first stage), consults the shared quality
//! state, does a bounded amount of work into a slot of its own channel and
//! publishes it. Every stage runs on its own OS thread.
//!
//! - [`operation`] - the operation trait, its context and the tagged stage kind
//! - [`builtin`] - built-in capture, detect, align, transform and merge stages
//! - [`runner`] - the per-stage run loop
//! - [`supervisor`] - lifecycle, restart policy and hang detection

pub mod builtin;
pub mod operation;
pub mod runner;
pub mod supervisor;

pub use builtin::{FramePusher, FrameSource, PushCapture, SyntheticCapture};
pub use operation::{
    AnyStage, FrameView, OperationFactory, StageContext, StageKind, StageOperation,
};
pub use supervisor::{StageReport, StageSupervisor};

use crate::arena::StageChannel;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Position of a stage in the pipeline
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct StageId(pub u32);

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StageId({})", self.0)
    }
}

/// Lifecycle of a stage's execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StageState {
    #[default]
    Stopped,
    Starting,
    Running,
    /// Running, but recent work overran the budget multiple
    Degraded,
    Stopping,
    /// Restart budget exhausted; the output channel no longer advances
    Failed,
}

impl StageState {
    /// Whether an execution context is (or should be) alive
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Degraded)
    }
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Degraded => "degraded",
            Self::Stopping => "stopping",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Identity, wiring and budget of one stage
#[derive(Clone)]
pub struct StageDescriptor {
    pub id: StageId,
    pub name: String,
    pub kind: StageKind,
    pub upstream: Option<StageChannel>,
    pub output: StageChannel,
    /// Declared maximum processing time per frame
    pub budget: Duration,
    /// Simulated per-frame work at full scale
    pub work: Duration,
    pub enabled: bool,
    pub state: StageState,
}

impl StageDescriptor {
    pub fn is_source(&self) -> bool {
        self.upstream.is_none()
    }
}

impl std::fmt::Debug for StageDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind.label())
            .field("upstream", &self.upstream.as_ref().map(|c| c.name().to_string()))
            .field("output", &self.output.name())
            .field("budget", &self.budget)
            .field("enabled", &self.enabled)
            .field("state", &self.state)
            .finish()
    }
}

/// Liveness counters a stage thread updates and its supervisor reads.
///
/// All fields are atomics so the supervisor never blocks a stage.
pub struct StageHealth {
    base: Instant,
    /// Nanos since `base` + 1 when the current unit of work began; 0 when idle
    busy_since: AtomicU64,
    frames_published: AtomicU64,
    loops: AtomicU64,
}

impl StageHealth {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            busy_since: AtomicU64::new(0),
            frames_published: AtomicU64::new(0),
            loops: AtomicU64::new(0),
        }
    }

    /// Mark the start of a unit of work
    pub fn begin_work(&self) {
        let nanos = self.base.elapsed().as_nanos() as u64 + 1;
        self.busy_since.store(nanos, Ordering::Release);
    }

    pub fn end_work(&self) {
        self.busy_since.store(0, Ordering::Release);
        self.loops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish(&self) {
        self.frames_published.fetch_add(1, Ordering::Relaxed);
    }

    /// How long the current unit of work has been running, if any
    pub fn busy_for(&self, now: Instant) -> Option<Duration> {
        let since = self.busy_since.load(Ordering::Acquire);
        if since == 0 {
            return None;
        }
        let started = self.base + Duration::from_nanos(since - 1);
        Some(now.saturating_duration_since(started))
    }

    pub fn frames_published(&self) -> u64 {
        self.frames_published.load(Ordering::Relaxed)
    }

    /// Completed loop iterations, idle ones included
    pub fn loops(&self) -> u64 {
        self.loops.load(Ordering::Relaxed)
    }
}

impl Default for StageHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_id_display() {
        assert_eq!(StageId(7).to_string(), "StageId(7)");
    }

    #[test]
    fn test_active_states() {
        assert!(StageState::Running.is_active());
        assert!(StageState::Degraded.is_active());
        assert!(!StageState::Failed.is_active());
        assert!(!StageState::Stopped.is_active());
    }

    #[test]
    fn test_health_busy_tracking() {
        let health = StageHealth::new();
        assert!(health.busy_for(Instant::now()).is_none());
        health.begin_work();
        std::thread::sleep(Duration::from_millis(5));
        let busy = health.busy_for(Instant::now()).unwrap();
        assert!(busy >= Duration::from_millis(5));
        health.end_work();
        assert!(health.busy_for(Instant::now()).is_none());
        assert_eq!(health.loops(), 1);
    }
}
