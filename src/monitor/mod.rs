//! Performance Monitor
//!
//! Aggregates per-stage [`PerformanceSample`]s into bounded rolling windows
//! and measures end-to-end frames per second at the final channel. The
//! [`PerformanceMonitor::composite_score`] folds frame rate, processing
//! pressure and queue pressure into a single number in `[0, 1]` that drives
//! the quality controller.
//!
//! Every query takes `now` explicitly so behaviour is reproducible in tests.

use crate::config::MonitorSettings;
use crate::stage::StageId;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

/// Processing time at which a stage counts as fully saturated, as a multiple of its budget
pub const PROCESSING_SATURATION: f64 = 2.0;

/// What a stage did in one loop iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SampleKind {
    /// A frame was processed and published
    Processed,
    /// No new upstream generation; no work done
    Idle,
    /// No free output slot; the frame was dropped
    Dropped,
    /// The quality controller's frame skip left this frame out
    Skipped,
}

#[derive(Debug, Clone, Copy)]
pub struct PerformanceSample {
    pub stage: StageId,
    pub at: Instant,
    pub duration: Duration,
    /// Upstream generations superseded since the stage's previous read
    pub queue_depth: u32,
    pub kind: SampleKind,
}

impl PerformanceSample {
    pub fn new(stage: StageId, at: Instant, duration: Duration, kind: SampleKind) -> Self {
        Self {
            stage,
            at,
            duration,
            queue_depth: 0,
            kind,
        }
    }

    pub fn with_queue_depth(mut self, depth: u32) -> Self {
        self.queue_depth = depth;
        self
    }

    pub fn dropped(&self) -> bool {
        self.kind == SampleKind::Dropped
    }
}

/// Lifetime totals per stage; the four counters never mix
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageCounters {
    pub processed: u64,
    /// Arena exhaustion (`NoCapacity`)
    pub dropped: u64,
    /// Upstream frames never seen because a newer one replaced them
    pub superseded: u64,
    /// Controller frame-skip decisions
    pub skipped: u64,
    pub idle: u64,
    /// Processed frames that exceeded the declared budget
    pub over_budget: u64,
}

/// Rolling-window view of one stage
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageStats {
    pub name: String,
    pub budget: Duration,
    pub avg_processing: Duration,
    pub max_processing: Duration,
    /// Dropped / (processed + dropped) over the window
    pub drop_rate: f64,
    pub avg_queue_depth: f64,
    pub window_samples: usize,
    pub totals: StageCounters,
}

/// The composite score and the terms it was built from
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub fps: f64,
    /// `min(fps / target, 1)`
    pub fps_term: f64,
    /// `1 - worst stage processing pressure`
    pub processing_term: f64,
    /// `1 - worst stage queue pressure`
    pub queue_term: f64,
    pub score: f64,
}

struct StageWindow {
    name: String,
    budget: Duration,
    samples: VecDeque<PerformanceSample>,
    totals: StageCounters,
}

impl StageWindow {
    fn processed(&self) -> impl Iterator<Item = &PerformanceSample> {
        self.samples
            .iter()
            .filter(|s| s.kind == SampleKind::Processed)
    }

    fn avg_processing(&self) -> Option<Duration> {
        let (count, total) = self
            .processed()
            .fold((0u32, Duration::ZERO), |(n, t), s| (n + 1, t + s.duration));
        (count > 0).then(|| total / count)
    }

    fn avg_queue_depth(&self) -> f64 {
        let (count, total) = self
            .processed()
            .fold((0u64, 0u64), |(n, t), s| (n + 1, t + s.queue_depth as u64));
        if count == 0 {
            0.0
        } else {
            total as f64 / count as f64
        }
    }
}

pub struct PerformanceMonitor {
    settings: MonitorSettings,
    stages: BTreeMap<StageId, StageWindow>,
    /// (observed at, final channel generation)
    output: VecDeque<(Instant, u64)>,
}

impl PerformanceMonitor {
    pub fn new(settings: MonitorSettings) -> Self {
        Self {
            settings,
            stages: BTreeMap::new(),
            output: VecDeque::new(),
        }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    pub fn register_stage(&mut self, id: StageId, name: impl Into<String>, budget: Duration) {
        self.stages.insert(
            id,
            StageWindow {
                name: name.into(),
                budget,
                samples: VecDeque::with_capacity(self.settings.window_samples),
                totals: StageCounters::default(),
            },
        );
    }

    pub fn record(&mut self, sample: PerformanceSample) {
        let capacity = self.settings.window_samples.max(1);
        let Some(window) = self.stages.get_mut(&sample.stage) else {
            tracing::trace!("Sample for unregistered stage {} ignored", sample.stage);
            return;
        };

        let totals = &mut window.totals;
        match sample.kind {
            SampleKind::Processed => {
                totals.processed += 1;
                totals.superseded += sample.queue_depth as u64;
                if sample.duration > window.budget {
                    totals.over_budget += 1;
                }
            }
            SampleKind::Idle => totals.idle += 1,
            SampleKind::Dropped => totals.dropped += 1,
            SampleKind::Skipped => totals.skipped += 1,
        }

        // Idle loops carry no timing signal and would crowd real samples out
        if sample.kind == SampleKind::Idle {
            return;
        }
        if window.samples.len() >= capacity {
            window.samples.pop_front();
        }
        window.samples.push_back(sample);
    }

    /// Note the final channel's generation as seen at `now`
    pub fn record_output(&mut self, now: Instant, generation: u64) {
        if let Some(&(_, last)) = self.output.back() {
            if generation < last {
                self.output.clear();
            }
        }
        self.output.push_back((now, generation));
        self.prune(now);
    }

    /// Drop samples older than the time window
    pub fn prune(&mut self, now: Instant) {
        let window = self.settings.window();
        let fresh = |at: Instant| now.saturating_duration_since(at) <= window;

        for stage in self.stages.values_mut() {
            while stage.samples.front().is_some_and(|s| !fresh(s.at)) {
                stage.samples.pop_front();
            }
        }
        // Keep one observation older than the window as the rate baseline
        while self.output.len() > 2 && self.output.get(1).is_some_and(|(at, _)| !fresh(*at)) {
            self.output.pop_front();
        }
    }

    /// End-to-end frame rate measured at the final channel
    pub fn fps(&self) -> f64 {
        let (Some(&(t0, g0)), Some(&(t1, g1))) = (self.output.front(), self.output.back()) else {
            return 0.0;
        };
        let elapsed = t1.saturating_duration_since(t0).as_secs_f64();
        if elapsed <= f64::EPSILON {
            return 0.0;
        }
        g1.saturating_sub(g0) as f64 / elapsed
    }

    /// Whether enough output history exists for a meaningful score
    pub fn has_signal(&self) -> bool {
        match (self.output.front(), self.output.back()) {
            (Some((t0, _)), Some((t1, _))) => {
                t1.saturating_duration_since(*t0) >= self.settings.window() / 2
            }
            _ => false,
        }
    }

    pub fn stage_stats(&self, id: StageId) -> Option<StageStats> {
        let window = self.stages.get(&id)?;
        let mut max_processing = Duration::ZERO;
        let mut processed = 0u64;
        let mut dropped = 0u64;
        for sample in &window.samples {
            match sample.kind {
                SampleKind::Processed => {
                    processed += 1;
                    max_processing = max_processing.max(sample.duration);
                }
                SampleKind::Dropped => dropped += 1,
                _ => {}
            }
        }
        let attempts = processed + dropped;
        Some(StageStats {
            name: window.name.clone(),
            budget: window.budget,
            avg_processing: window.avg_processing().unwrap_or_default(),
            max_processing,
            drop_rate: if attempts == 0 {
                0.0
            } else {
                dropped as f64 / attempts as f64
            },
            avg_queue_depth: window.avg_queue_depth(),
            window_samples: window.samples.len(),
            totals: window.totals,
        })
    }

    pub fn all_stats(&self) -> Vec<(StageId, StageStats)> {
        self.stages
            .keys()
            .filter_map(|id| self.stage_stats(*id).map(|s| (*id, s)))
            .collect()
    }

    /// Worst stage's average processing time relative to its budget, in `[0, 1]`
    fn processing_pressure(&self) -> f64 {
        self.stages
            .values()
            .filter_map(|w| {
                let avg = w.avg_processing()?;
                let budget = w.budget.as_secs_f64().max(1e-6);
                Some(avg.as_secs_f64() / (budget * PROCESSING_SATURATION))
            })
            .fold(0.0f64, f64::max)
            .clamp(0.0, 1.0)
    }

    /// Worst stage's average superseded-frame count, in `[0, 1]`
    fn queue_pressure(&self) -> f64 {
        let limit = self.settings.queue_pressure_limit.max(1e-6);
        self.stages
            .values()
            .map(|w| w.avg_queue_depth() / limit)
            .fold(0.0f64, f64::max)
            .clamp(0.0, 1.0)
    }

    pub fn composite_score(&mut self, now: Instant) -> ScoreBreakdown {
        self.prune(now);
        let weights = self.settings.weights.normalized();
        let fps = self.fps();
        let fps_term = if self.settings.target_fps > 0.0 {
            (fps / self.settings.target_fps).clamp(0.0, 1.0)
        } else {
            1.0
        };
        let processing_term = 1.0 - self.processing_pressure();
        let queue_term = 1.0 - self.queue_pressure();
        let score = (weights.fps * fps_term
            + weights.processing * processing_term
            + weights.queue * queue_term)
            .clamp(0.0, 1.0);

        ScoreBreakdown {
            fps,
            fps_term,
            processing_term,
            queue_term,
            score,
        }
    }
}
