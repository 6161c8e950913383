//! What the output sink sees while the output switches between origins.

use crate::config::TransitionMode;
use std::time::{Duration, Instant};

/// Progress of one switch
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransitionPhase {
    /// Keep serving the previous output
    Hold,
    /// Mix the previous output into the new one; weight of the new one
    Blend(f32),
    Done,
}

/// A switch of output origin that is still in progress
#[derive(Debug, Clone, Copy)]
pub struct Transition {
    mode: TransitionMode,
    started: Instant,
}

impl Transition {
    /// `None` when the mode switches instantly
    pub fn begin(mode: TransitionMode, now: Instant) -> Option<Self> {
        match mode {
            TransitionMode::Immediate => None,
            TransitionMode::Delayed { ms } | TransitionMode::Gradual { ms } if ms == 0 => None,
            _ => Some(Self { mode, started: now }),
        }
    }

    pub fn phase(&self, now: Instant) -> TransitionPhase {
        let elapsed = now.saturating_duration_since(self.started);
        match self.mode {
            TransitionMode::Immediate => TransitionPhase::Done,
            TransitionMode::Delayed { ms } => {
                if elapsed < Duration::from_millis(ms) {
                    TransitionPhase::Hold
                } else {
                    TransitionPhase::Done
                }
            }
            TransitionMode::Gradual { ms } => {
                let window = Duration::from_millis(ms);
                if elapsed >= window {
                    TransitionPhase::Done
                } else {
                    TransitionPhase::Blend(elapsed.as_secs_f32() / window.as_secs_f32())
                }
            }
        }
    }
}

/// Per-byte linear mix: `from * (1 - alpha) + to * alpha`.
///
/// Buffers of different length are not blended; `to` is returned as is.
pub fn blend(from: &[u8], to: &[u8], alpha: f32) -> Vec<u8> {
    if from.len() != to.len() {
        return to.to_vec();
    }
    let alpha = alpha.clamp(0.0, 1.0);
    let keep = 1.0 - alpha;
    from.iter()
        .zip(to)
        .map(|(&a, &b)| (a as f32 * keep + b as f32 * alpha).round() as u8)
        .collect()
}
