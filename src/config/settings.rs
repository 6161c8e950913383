//! Tuning sections of the pipeline configuration
//!
//! Every section is plain serde data with sensible defaults so that partial
//! configuration files work. Durations are stored as integer milliseconds
//! and exposed as [`Duration`] through accessor methods.
//!
//! # Main Types
//!
//! - [`ArenaSettings`] - Slot pool sizing and the negotiated frame format
//! - [`CaptureSettings`] - Synthetic capture pacing
//! - [`SupervisorSettings`] - Budgets, restart policy, hang detection
//! - [`MonitorSettings`] - Rolling windows and composite score weights
//! - [`QualitySettings`] - Controller cadence, thresholds, steps, bounds
//! - [`FallbackSettings`] - Heartbeat timeouts and transition mode

use crate::error::{LiveCoreError, Result};
use crate::pattern::PatternKind;
use crate::types::FrameFormat;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Minimum slots per channel; one current frame plus one being written
pub const MIN_SLOTS_PER_CHANNEL: usize = 2;

// ==================== Arena ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaSettings {
    /// Slots allocated for every channel
    pub slots_per_channel: usize,

    /// Frame shape shared by every channel
    pub format: FrameFormat,
}

impl Default for ArenaSettings {
    fn default() -> Self {
        Self {
            slots_per_channel: 3,
            format: FrameFormat::default(),
        }
    }
}

// ==================== Capture ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Frames per second produced by the synthetic capture source
    pub fps: u32,

    /// Pattern rendered by the synthetic capture source
    pub pattern: PatternKind,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            fps: 30,
            pattern: PatternKind::MovingBlock,
        }
    }
}

impl CaptureSettings {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / self.fps.max(1) as u64)
    }
}

// ==================== Supervisor ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// A unit of work longer than `budget * budget_multiple` marks the stage degraded
    pub budget_multiple: f64,

    /// Runs allowed (first start included) within `restart_window_ms` before giving up
    pub max_attempts: u32,

    /// Crashes older than this no longer count against the attempt budget
    pub restart_window_ms: u64,

    /// Delay before the first restart
    pub backoff_initial_ms: u64,

    /// Cap on the restart delay
    pub backoff_max_ms: u64,

    /// Growth factor between consecutive restart delays
    pub backoff_multiplier: f64,

    /// A stage busy on one unit of work for this long is hard-killed
    pub hang_timeout_ms: u64,

    /// How long a cooperative stop may take before the stage is abandoned
    pub stop_grace_ms: u64,

    /// Period of the supervision loop
    pub tick_ms: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            budget_multiple: 4.0,
            max_attempts: 3,
            restart_window_ms: 60_000,
            backoff_initial_ms: 100,
            backoff_max_ms: 2_000,
            backoff_multiplier: 2.0,
            hang_timeout_ms: 5_000,
            stop_grace_ms: 500,
            tick_ms: 20,
        }
    }
}

impl SupervisorSettings {
    /// Delay before restart number `attempt` (0-indexed)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.max(1.0).powi(attempt as i32);
        let delay = self.backoff_initial_ms as f64 * multiplier;
        Duration::from_millis(delay.min(self.backoff_max_ms as f64) as u64)
    }

    pub fn restart_window(&self) -> Duration {
        Duration::from_millis(self.restart_window_ms)
    }

    pub fn hang_timeout(&self) -> Duration {
        Duration::from_millis(self.hang_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

// ==================== Monitor ====================

/// Relative weights of the composite performance score terms
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub fps: f64,
    pub processing: f64,
    pub queue: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            fps: 0.5,
            processing: 0.3,
            queue: 0.2,
        }
    }
}

impl ScoreWeights {
    /// Weights scaled to sum to 1.0; all-zero weights fall back to equal thirds
    pub fn normalized(&self) -> ScoreWeights {
        let total = self.fps.max(0.0) + self.processing.max(0.0) + self.queue.max(0.0);
        if total <= f64::EPSILON {
            return ScoreWeights {
                fps: 1.0 / 3.0,
                processing: 1.0 / 3.0,
                queue: 1.0 / 3.0,
            };
        }
        ScoreWeights {
            fps: self.fps.max(0.0) / total,
            processing: self.processing.max(0.0) / total,
            queue: self.queue.max(0.0) / total,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// End-to-end frame rate the pipeline aims for
    pub target_fps: f64,

    /// Rolling window length in time
    pub window_ms: u64,

    /// Rolling window length in samples, per stage
    pub window_samples: usize,

    /// Average superseded frames per read that counts as full queue pressure
    pub queue_pressure_limit: f64,

    pub weights: ScoreWeights,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            target_fps: 30.0,
            window_ms: 2_000,
            window_samples: 240,
            queue_pressure_limit: 4.0,
            weights: ScoreWeights::default(),
        }
    }
}

impl MonitorSettings {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

// ==================== Quality ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualitySettings {
    /// How often the controller samples the composite score
    pub sample_interval_ms: u64,

    /// Minimum time between two quality changes
    pub cooldown_ms: u64,

    /// Scores strictly below this degrade quality
    pub low_threshold: f64,

    /// Scores strictly above this restore quality
    pub high_threshold: f64,

    /// Scale decrease per degrade step
    pub step_down: f32,

    /// Scale increase per restore step
    pub step_up: f32,

    pub min_scale: f32,
    pub max_scale: f32,

    /// Largest frame-skip interval the controller may set
    pub max_frame_skip: u32,
}

impl Default for QualitySettings {
    fn default() -> Self {
        Self {
            sample_interval_ms: 1_000,
            cooldown_ms: 1_000,
            low_threshold: 0.6,
            high_threshold: 0.9,
            step_down: 0.1,
            step_up: 0.05,
            min_scale: 0.3,
            max_scale: 1.0,
            max_frame_skip: 3,
        }
    }
}

impl QualitySettings {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.min_scale > 0.0 && self.min_scale <= self.max_scale && self.max_scale <= 1.0) {
            return Err(LiveCoreError::Config(format!(
                "quality scale bounds must satisfy 0 < min <= max <= 1 (got {} .. {})",
                self.min_scale, self.max_scale
            )));
        }
        if self.low_threshold >= self.high_threshold {
            return Err(LiveCoreError::Config(format!(
                "quality low threshold {} must be below high threshold {}",
                self.low_threshold, self.high_threshold
            )));
        }
        if self.step_down <= 0.0 || self.step_up <= 0.0 {
            return Err(LiveCoreError::Config(
                "quality steps must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// ==================== Fallback ====================

/// How the output switches between live and fallback frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TransitionMode {
    /// Switch on the tick the state changes
    #[default]
    Immediate,
    /// Keep showing the previous output for `ms` before switching
    Delayed { ms: u64 },
    /// Cross-fade from the previous output over `ms`
    Gradual { ms: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackSettings {
    /// Heartbeat absence that confirms a stall
    pub detection_timeout_ms: u64,

    /// Heartbeat absence that starts suspecting a stall
    pub suspect_after_ms: u64,

    /// Continuous heartbeat required before returning to live output
    pub recovery_delay_ms: u64,

    /// Period of the heartbeat timer
    pub check_interval_ms: u64,

    pub transition: TransitionMode,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            detection_timeout_ms: 2_000,
            suspect_after_ms: 250,
            recovery_delay_ms: 3_000,
            check_interval_ms: 50,
            transition: TransitionMode::Immediate,
        }
    }
}

impl FallbackSettings {
    pub fn detection_timeout(&self) -> Duration {
        Duration::from_millis(self.detection_timeout_ms)
    }

    /// Never longer than the detection timeout
    pub fn suspect_after(&self) -> Duration {
        Duration::from_millis(self.suspect_after_ms.min(self.detection_timeout_ms))
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let settings = SupervisorSettings::default();
        assert_eq!(settings.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(settings.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(settings.backoff_delay(2), Duration::from_millis(400));
        assert_eq!(settings.backoff_delay(10), Duration::from_millis(2_000));
    }

    #[test]
    fn test_weights_normalize() {
        let weights = ScoreWeights {
            fps: 2.0,
            processing: 1.0,
            queue: 1.0,
        }
        .normalized();
        assert!((weights.fps - 0.5).abs() < 1e-9);
        assert!((weights.fps + weights.processing + weights.queue - 1.0).abs() < 1e-9);

        let zero = ScoreWeights {
            fps: 0.0,
            processing: 0.0,
            queue: 0.0,
        }
        .normalized();
        assert!((zero.queue - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_quality_validation() {
        assert!(QualitySettings::default().validate().is_ok());

        let inverted = QualitySettings {
            min_scale: 0.8,
            max_scale: 0.5,
            ..Default::default()
        };
        assert!(inverted.validate().is_err());

        let thresholds = QualitySettings {
            low_threshold: 0.9,
            high_threshold: 0.6,
            ..Default::default()
        };
        assert!(thresholds.validate().is_err());
    }

    #[test]
    fn test_suspect_never_exceeds_detection() {
        let settings = FallbackSettings {
            detection_timeout_ms: 100,
            suspect_after_ms: 500,
            ..Default::default()
        };
        assert_eq!(settings.suspect_after(), Duration::from_millis(100));
    }
}
