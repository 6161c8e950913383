//! Adaptive Quality Controller
//!
//! The controller owns the process-wide [`QualityState`]: a continuous scale
//! factor and a discrete frame-skip interval. It samples the monitor's
//! composite score at a fixed cadence and steps quality down when the score
//! is low and back up when it is high, never changing more than once per
//! cooldown window.
//!
//! Stages never see the controller. They hold a [`SharedQuality`] handle and
//! load the packed state with a single atomic read before each frame.
//!
//! # Manual override
//!
//! An override pins the *published* state. The automatic state keeps
//! tracking observed scores underneath, so clearing the override hands
//! control straight back to the automatic loop.

use crate::config::{PersistedState, QualitySettings};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// The shared throughput/fidelity knob
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityState {
    /// Resolution factor in `(0.0, 1.0]`
    pub scale: f32,
    /// Process one captured frame, then skip this many
    pub frame_skip: u32,
}

impl Default for QualityState {
    fn default() -> Self {
        Self::FULL
    }
}

impl QualityState {
    pub const FULL: QualityState = QualityState {
        scale: 1.0,
        frame_skip: 0,
    };

    pub fn new(scale: f32, frame_skip: u32) -> Self {
        Self { scale, frame_skip }
    }

    /// Clamp into the configured bounds
    pub fn clamped(self, settings: &QualitySettings) -> Self {
        let scale = if self.scale.is_finite() {
            self.scale.clamp(settings.min_scale, settings.max_scale)
        } else {
            settings.max_scale
        };
        Self {
            scale,
            frame_skip: self.frame_skip.min(settings.max_frame_skip),
        }
    }

    /// Whether capture sequence number `sequence` should be processed
    #[inline]
    pub fn admits(&self, sequence: u64) -> bool {
        self.frame_skip == 0 || sequence % (self.frame_skip as u64 + 1) == 0
    }

    #[inline]
    fn pack(self) -> u64 {
        ((self.scale.to_bits() as u64) << 32) | self.frame_skip as u64
    }

    #[inline]
    fn unpack(packed: u64) -> Self {
        Self {
            scale: f32::from_bits((packed >> 32) as u32),
            frame_skip: packed as u32,
        }
    }
}

impl std::fmt::Display for QualityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "scale {:.2}, skip {}", self.scale, self.frame_skip)
    }
}

/// Lock-free cell stages read the quality state from
#[derive(Debug)]
pub struct SharedQuality {
    packed: AtomicU64,
}

impl SharedQuality {
    pub fn new(state: QualityState) -> Arc<Self> {
        Arc::new(Self {
            packed: AtomicU64::new(state.pack()),
        })
    }

    #[inline]
    pub fn load(&self) -> QualityState {
        QualityState::unpack(self.packed.load(Ordering::Acquire))
    }

    fn store(&self, state: QualityState) {
        self.packed.store(state.pack(), Ordering::Release);
    }
}

/// Outcome of one controller tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityAction {
    /// Sampling cadence has not elapsed; the score was ignored
    NotDue,
    /// Score inside the dead band, or already at the relevant bound
    Hold,
    /// A change was wanted but the cooldown has not elapsed
    Cooldown,
    Degraded,
    Restored,
}

/// Reporting view of the controller
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualitySnapshot {
    /// What stages currently see
    pub published: QualityState,
    /// What the automatic loop would publish without an override
    pub automatic: QualityState,
    pub overridden: bool,
    /// Automatic changes applied so far
    pub changes: u64,
}

pub struct AdaptiveQualityController {
    settings: QualitySettings,
    shared: Arc<SharedQuality>,
    automatic: QualityState,
    override_scale: Option<f32>,
    last_sample: Option<Instant>,
    last_change: Option<Instant>,
    changes: u64,
}

impl AdaptiveQualityController {
    pub fn new(settings: QualitySettings) -> Self {
        let automatic = QualityState::new(settings.max_scale, 0);
        Self {
            shared: SharedQuality::new(automatic),
            settings,
            automatic,
            override_scale: None,
            last_sample: None,
            last_change: None,
            changes: 0,
        }
    }

    /// Start from a previously persisted automatic state
    pub fn with_initial(mut self, initial: QualityState) -> Self {
        self.automatic = initial.clamped(&self.settings);
        self.publish();
        self
    }

    /// Start from the state saved by the previous session
    pub fn restore(self, persisted: &PersistedState) -> Self {
        let initial = QualityState::new(persisted.quality_scale, persisted.frame_skip);
        self.with_initial(initial)
    }

    /// Handle stages read from
    pub fn shared(&self) -> Arc<SharedQuality> {
        Arc::clone(&self.shared)
    }

    pub fn settings(&self) -> &QualitySettings {
        &self.settings
    }

    pub fn automatic(&self) -> QualityState {
        self.automatic
    }

    pub fn published(&self) -> QualityState {
        self.shared.load()
    }

    pub fn snapshot(&self) -> QualitySnapshot {
        QualitySnapshot {
            published: self.published(),
            automatic: self.automatic,
            overridden: self.override_scale.is_some(),
            changes: self.changes,
        }
    }

    /// Feed one composite score observed at `now`.
    pub fn tick(&mut self, now: Instant, score: f64) -> QualityAction {
        if let Some(last) = self.last_sample {
            if now.saturating_duration_since(last) < self.settings.sample_interval() {
                return QualityAction::NotDue;
            }
        }
        self.last_sample = Some(now);

        let degrade = score < self.settings.low_threshold;
        let restore = score > self.settings.high_threshold;
        if !degrade && !restore {
            return QualityAction::Hold;
        }

        if let Some(changed) = self.last_change {
            if now.saturating_duration_since(changed) < self.settings.cooldown() {
                return QualityAction::Cooldown;
            }
        }

        let next = if degrade {
            self.step_down(self.automatic)
        } else {
            self.step_up(self.automatic)
        };
        if next == self.automatic {
            return QualityAction::Hold;
        }

        let previous = self.automatic;
        self.automatic = next;
        self.last_change = Some(now);
        self.changes += 1;
        self.publish();

        if degrade {
            tracing::info!(
                "Quality degraded ({}) -> ({}) at score {:.2}",
                previous,
                next,
                score
            );
            QualityAction::Degraded
        } else {
            tracing::info!(
                "Quality restored ({}) -> ({}) at score {:.2}",
                previous,
                next,
                score
            );
            QualityAction::Restored
        }
    }

    /// Pin the published scale (`Some`) or return to automatic control (`None`).
    pub fn set_override(&mut self, factor: Option<f32>) {
        let factor = factor.map(|f| {
            QualityState::new(f, 0)
                .clamped(&self.settings)
                .scale
        });
        if factor != self.override_scale {
            match factor {
                Some(f) => tracing::info!("Quality override set to {:.2}", f),
                None => tracing::info!("Quality override cleared, automatic control resumed"),
            }
        }
        self.override_scale = factor;
        self.publish();
    }

    pub fn override_scale(&self) -> Option<f32> {
        self.override_scale
    }

    fn publish(&self) {
        let state = match self.override_scale {
            Some(scale) => QualityState::new(scale, 0),
            None => self.automatic,
        };
        self.shared.store(state);
    }

    /// Scale first, then frame skip once the scale floor is reached
    fn step_down(&self, state: QualityState) -> QualityState {
        if state.scale > self.settings.min_scale {
            let scale = round_step(state.scale - self.settings.step_down);
            return QualityState::new(scale, state.frame_skip).clamped(&self.settings);
        }
        QualityState::new(state.scale, state.frame_skip + 1).clamped(&self.settings)
    }

    /// Frame skip first, then scale
    fn step_up(&self, state: QualityState) -> QualityState {
        if state.frame_skip > 0 {
            return QualityState::new(state.scale, state.frame_skip - 1);
        }
        let scale = round_step(state.scale + self.settings.step_up);
        QualityState::new(scale, 0).clamped(&self.settings)
    }
}

/// Keeps repeated steps from accumulating float drift
#[inline]
fn round_step(value: f32) -> f32 {
    (value * 1000.0).round() / 1000.0
}
