//! Fallback Manager
//!
//! Sits beside the pipeline's terminal channel and decides what the output
//! sink sees. A new generation on that channel is the pipeline's heartbeat.
//!
//! ```text
//!              absence > suspect_after           absence >= detection_timeout
//! MainActive ───────────────────────► Detecting ─────────────────────────────► FallbackActive
//!     ▲      ◄─────── heartbeat ──────                                              │   ▲
//!     │                                                            fresh heartbeat  │   │ gap
//!     └──────────────── continuous for recovery_delay ───────────── Recovering ◄────┘   │
//!                                                                        └──────────────┘
//! ```
//!
//! While falling back the manager serves the highest-priority healthy
//! loopback source, falling through the list when a source fails. A
//! built-in synthetic pattern sits below every registered source and
//! cannot fail once the manager exists.

pub mod source;
pub mod transition;

pub use source::{FileSequenceSource, LoopbackSource, PatternSource, StaticImageSource};
pub use transition::{Transition, TransitionPhase};

use crate::arena::StageChannel;
use crate::config::{FallbackSettings, LoopbackSourceConfig};
use crate::error::{LiveCoreError, Result};
use crate::pattern::PatternKind;
use crate::types::{Frame, FrameFormat, FrameMeta, FrameOrigin};
use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Id of the built-in last-resort source
pub const LAST_RESORT_ID: &str = "builtin:pattern";

/// Fallback state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum FallbackState {
    /// Serving the live pipeline
    #[default]
    MainActive,
    /// Heartbeat missing; still serving the last live frame
    Detecting,
    /// Serving a loopback source
    FallbackActive,
    /// Heartbeat is back; still serving the loopback source until it proves stable
    Recovering,
}

impl FallbackState {
    /// Whether output currently comes from a loopback source
    pub fn serves_fallback(&self) -> bool {
        matches!(self, Self::FallbackActive | Self::Recovering)
    }
}

impl std::fmt::Display for FallbackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::MainActive => "main-active",
            Self::Detecting => "detecting",
            Self::FallbackActive => "fallback-active",
            Self::Recovering => "recovering",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputTarget {
    Live,
    Source(usize),
    LastResort,
}

struct RegisteredSource {
    id: String,
    priority: i32,
    source: Box<dyn LoopbackSource>,
    /// Failed during the current fallback episode
    failed: bool,
    last_error: Option<String>,
}

/// Status of one registered source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceStatus {
    pub id: String,
    pub priority: i32,
    pub healthy: bool,
    pub failed: bool,
    pub last_error: Option<String>,
}

/// Snapshot of the manager for the control surface
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallbackStatus {
    pub state: FallbackState,
    /// Loopback source in use while falling back
    pub active_source: Option<String>,
    pub heartbeat_age_ms: u64,
    /// Output switches since startup
    pub switches: u64,
    pub sources: Vec<SourceStatus>,
}

pub struct FallbackManager {
    settings: FallbackSettings,
    format: FrameFormat,
    live: StageChannel,
    state: FallbackState,
    started_at: Instant,
    last_heartbeat: Option<Instant>,
    seen_generation: u64,
    fallback_since: Option<Instant>,
    recovery_since: Option<Instant>,
    /// Registration order is the tie-breaker for equal priorities
    sources: Vec<RegisteredSource>,
    last_resort: PatternSource,
    serving: OutputTarget,
    previous: Option<(OutputTarget, Transition)>,
    sequence: u64,
    switches: u64,
}

impl FallbackManager {
    /// Create a manager watching `live`.
    ///
    /// Fails with `AllSourcesExhausted` if the last-resort pattern cannot be
    /// set up for the channel's format.
    pub fn new(settings: FallbackSettings, live: StageChannel) -> Result<Self> {
        let now = Instant::now();
        let format = live.format();
        let mut last_resort = PatternSource::new(LAST_RESORT_ID, PatternKind::ColorBars, 30);
        last_resort
            .open(format, now)
            .map_err(|e| LiveCoreError::AllSourcesExhausted(e.to_string()))?;

        Ok(Self {
            settings,
            format,
            seen_generation: live.generation(),
            live,
            state: FallbackState::MainActive,
            started_at: now,
            last_heartbeat: None,
            fallback_since: None,
            recovery_since: None,
            sources: Vec::new(),
            last_resort,
            serving: OutputTarget::Live,
            previous: None,
            sequence: 0,
            switches: 0,
        })
    }

    pub fn settings(&self) -> &FallbackSettings {
        &self.settings
    }

    pub fn state(&self) -> FallbackState {
        self.state
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    /// Register a source described by configuration
    pub fn register(&mut self, config: &LoopbackSourceConfig) -> Result<()> {
        self.register_source(&config.id, config.priority, source::from_config(config))
    }

    /// Register a source. New sources take part in the next selection.
    pub fn register_source(
        &mut self,
        id: &str,
        priority: i32,
        source: Box<dyn LoopbackSource>,
    ) -> Result<()> {
        if id == LAST_RESORT_ID || self.sources.iter().any(|s| s.id == id) {
            return Err(LiveCoreError::Config(format!(
                "Loopback source '{}' is already registered",
                id
            )));
        }
        tracing::info!(
            "Registered loopback source '{}' (priority {}): {}",
            id,
            priority,
            source.describe()
        );
        self.sources.push(RegisteredSource {
            id: id.to_string(),
            priority,
            source,
            failed: false,
            last_error: None,
        });
        Ok(())
    }

    /// Id of the source output currently comes from, if not live
    pub fn active_source(&self) -> Option<&str> {
        match self.serving {
            OutputTarget::Live => None,
            OutputTarget::Source(index) => Some(self.sources[index].id.as_str()),
            OutputTarget::LastResort => Some(LAST_RESORT_ID),
        }
    }

    /// Note a heartbeat from the terminal stage
    pub fn record_heartbeat(&mut self, at: Instant) {
        if self.last_heartbeat.map_or(true, |last| at > last) {
            self.last_heartbeat = Some(at);
        }
        // Recovery is timed from the first beat after falling back
        if self.recovery_since.is_none() && self.fallback_since.is_some_and(|since| at > since) {
            self.recovery_since = Some(at);
        }
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.last_heartbeat
    }

    fn heartbeat_age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat.unwrap_or(self.started_at))
    }

    /// A new terminal generation counts as a heartbeat
    fn observe_live(&mut self, now: Instant) {
        let generation = self.live.generation();
        if generation != self.seen_generation {
            self.seen_generation = generation;
            let at = self.live.last_published_at().unwrap_or(now);
            self.record_heartbeat(at);
        }
    }

    /// Advance the state machine. Called from the heartbeat timer.
    pub fn tick(&mut self, now: Instant) -> FallbackState {
        self.observe_live(now);

        // Each transition is evaluated against the same heartbeat age, so a
        // long absence walks MainActive -> Detecting -> FallbackActive at once
        for _ in 0..4 {
            let next = self.next_state(now);
            if next == self.state {
                break;
            }
            self.enter(next, now);
        }

        if self.state.serves_fallback() {
            if let OutputTarget::Source(index) = self.serving {
                if !self.sources[index].source.is_healthy() {
                    self.fail_over(index, "reported unhealthy".to_string(), now);
                }
            }
        }
        self.state
    }

    fn next_state(&self, now: Instant) -> FallbackState {
        let age = self.heartbeat_age(now);
        match self.state {
            FallbackState::MainActive if age > self.settings.suspect_after() => {
                FallbackState::Detecting
            }
            FallbackState::Detecting if age >= self.settings.detection_timeout() => {
                FallbackState::FallbackActive
            }
            FallbackState::Detecting if age <= self.settings.suspect_after() => {
                FallbackState::MainActive
            }
            FallbackState::FallbackActive => {
                let fresh = match (self.last_heartbeat, self.fallback_since) {
                    (Some(beat), Some(since)) => beat > since,
                    _ => false,
                };
                if fresh {
                    FallbackState::Recovering
                } else {
                    FallbackState::FallbackActive
                }
            }
            FallbackState::Recovering => {
                if age > self.settings.suspect_after() {
                    FallbackState::FallbackActive
                } else if self.recovery_since.is_some_and(|since| {
                    now.saturating_duration_since(since) >= self.settings.recovery_delay()
                }) {
                    FallbackState::MainActive
                } else {
                    FallbackState::Recovering
                }
            }
            state => state,
        }
    }

    fn enter(&mut self, next: FallbackState, now: Instant) {
        let from = self.state;
        tracing::info!(
            "Fallback {} -> {} (heartbeat age {:?})",
            from,
            next,
            self.heartbeat_age(now)
        );
        self.state = next;

        match next {
            FallbackState::MainActive => {
                self.fallback_since = None;
                self.recovery_since = None;
                if from == FallbackState::Recovering {
                    for source in &mut self.sources {
                        source.failed = false;
                    }
                    self.switch_output(OutputTarget::Live, now, true);
                }
            }
            FallbackState::Detecting => {}
            FallbackState::FallbackActive => {
                self.fallback_since = Some(now);
                self.recovery_since = None;
                if !from.serves_fallback() {
                    let target = self.select(now);
                    self.switch_output(target, now, true);
                }
            }
            FallbackState::Recovering => {
                if self.recovery_since.is_none() {
                    self.recovery_since = Some(self.last_heartbeat.unwrap_or(now));
                }
            }
        }
    }

    /// Highest-priority healthy source, or the last resort
    fn select(&mut self, now: Instant) -> OutputTarget {
        let mut order: Vec<usize> = (0..self.sources.len()).collect();
        // Stable sort keeps registration order among equal priorities
        order.sort_by_key(|&i| std::cmp::Reverse(self.sources[i].priority));

        for index in order {
            let format = self.format;
            let entry = &mut self.sources[index];
            if entry.failed || !entry.source.is_healthy() {
                continue;
            }
            match entry.source.open(format, now) {
                Ok(()) => {
                    tracing::info!(
                        "Serving loopback source '{}' ({})",
                        entry.id,
                        entry.source.describe()
                    );
                    return OutputTarget::Source(index);
                }
                Err(e) => {
                    tracing::warn!("{}", e);
                    entry.failed = true;
                    entry.last_error = Some(e.to_string());
                }
            }
        }

        tracing::warn!("No registered loopback source available, serving built-in pattern");
        OutputTarget::LastResort
    }

    fn fail_over(&mut self, index: usize, reason: String, now: Instant) {
        let entry = &mut self.sources[index];
        let err = LiveCoreError::SourceUnavailable {
            source_id: entry.id.clone(),
            reason,
        };
        tracing::warn!("{}", err);
        entry.failed = true;
        entry.last_error = Some(err.to_string());

        let target = self.select(now);
        // The failed source cannot be shown during a transition
        self.switch_output(target, now, false);

        if self.state != FallbackState::FallbackActive {
            tracing::info!("Fallback {} -> {}", self.state, FallbackState::FallbackActive);
            self.state = FallbackState::FallbackActive;
        }
        self.fallback_since = Some(now);
        self.recovery_since = None;
    }

    fn switch_output(&mut self, target: OutputTarget, now: Instant, animate: bool) {
        if target == self.serving {
            return;
        }
        self.previous = if animate {
            Transition::begin(self.settings.transition, now).map(|t| (self.serving, t))
        } else {
            None
        };
        self.serving = target;
        self.switches += 1;
    }

    /// The frame the output sink should show at `now`.
    ///
    /// Never empty: before the first live frame the built-in pattern is served.
    pub fn get_current_output_frame(&mut self, now: Instant) -> Result<Frame> {
        let to = self.render_serving(now)?;

        let Some((from, transition)) = self.previous else {
            return Ok(to);
        };
        match transition.phase(now) {
            TransitionPhase::Done => {
                self.previous = None;
                Ok(to)
            }
            TransitionPhase::Hold => match self.render(from, now) {
                Ok(Some(held)) => Ok(held),
                _ => {
                    self.previous = None;
                    Ok(to)
                }
            },
            TransitionPhase::Blend(alpha) => match self.render(from, now) {
                Ok(Some(old)) => {
                    let data = transition::blend(&old.data, &to.data, alpha);
                    let origin = FrameOrigin::Transition {
                        from: old.origin.to_string(),
                        to: to.origin.to_string(),
                    };
                    Ok(Frame::new(self.format, to.meta, origin, Bytes::from(data)))
                }
                _ => {
                    self.previous = None;
                    Ok(to)
                }
            },
        }
    }

    /// Render the current target, failing over through the source list
    fn render_serving(&mut self, now: Instant) -> Result<Frame> {
        for _ in 0..=self.sources.len() + 1 {
            match self.render(self.serving, now) {
                Ok(Some(frame)) => return Ok(frame),
                // No live frame yet
                Ok(None) => return self.render_last_resort(now),
                Err(e) => match self.serving {
                    OutputTarget::Source(index) => self.fail_over(index, e.to_string(), now),
                    _ => return Err(e),
                },
            }
        }
        self.render_last_resort(now)
    }

    fn render(&mut self, target: OutputTarget, now: Instant) -> Result<Option<Frame>> {
        match target {
            OutputTarget::Live => Ok(self.read_live()),
            OutputTarget::Source(index) => {
                let data = self.sources[index].source.frame(now)?;
                if data.len() != self.format.byte_size() {
                    return Err(LiveCoreError::FormatMismatch {
                        expected: self.format.byte_size(),
                        actual: data.len(),
                    });
                }
                let origin = FrameOrigin::Fallback {
                    source_id: self.sources[index].id.clone(),
                };
                Ok(Some(self.fallback_frame(now, origin, data)))
            }
            OutputTarget::LastResort => self.render_last_resort(now).map(Some),
        }
    }

    fn render_last_resort(&mut self, now: Instant) -> Result<Frame> {
        let data = self
            .last_resort
            .frame(now)
            .map_err(|e| LiveCoreError::AllSourcesExhausted(e.to_string()))?;
        let origin = FrameOrigin::Fallback {
            source_id: LAST_RESORT_ID.to_string(),
        };
        Ok(self.fallback_frame(now, origin, data))
    }

    fn fallback_frame(&mut self, now: Instant, origin: FrameOrigin, data: Bytes) -> Frame {
        let meta = FrameMeta::new(self.sequence, now);
        self.sequence += 1;
        Frame::new(self.format, meta, origin, data)
    }

    /// Copy of the latest live frame, if one was ever published
    fn read_live(&self) -> Option<Frame> {
        for _ in 0..3 {
            let read = self.live.read_latest()?;
            let generation = read.generation();
            match read.consume(|data, meta| (Bytes::copy_from_slice(data), *meta)) {
                Ok((data, meta)) => {
                    return Some(Frame::new(
                        self.format,
                        meta,
                        FrameOrigin::Live { generation },
                        data,
                    ))
                }
                Err(LiveCoreError::StaleRead { .. }) => continue,
                Err(e) => {
                    tracing::debug!("Live read failed: {}", e);
                    return None;
                }
            }
        }
        None
    }

    pub fn status(&self, now: Instant) -> FallbackStatus {
        FallbackStatus {
            state: self.state,
            active_source: self.active_source().map(str::to_string),
            heartbeat_age_ms: self.heartbeat_age(now).as_millis() as u64,
            switches: self.switches,
            sources: self
                .sources
                .iter()
                .map(|s| SourceStatus {
                    id: s.id.clone(),
                    priority: s.priority,
                    healthy: s.source.is_healthy(),
                    failed: s.failed,
                    last_error: s.last_error.clone(),
                })
                .collect(),
        }
    }
}

/// Run `tick` every check interval until `shutdown` fires or disconnects.
///
/// The timer owns its own thread so a stalled pipeline is still detected.
pub fn spawn_heartbeat_timer(
    manager: Arc<Mutex<FallbackManager>>,
    shutdown: Receiver<()>,
) -> std::io::Result<JoinHandle<()>> {
    let interval = manager.lock().settings().check_interval();
    std::thread::Builder::new()
        .name("fallback-heartbeat".to_string())
        .spawn(move || loop {
            match shutdown.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    manager.lock().tick(Instant::now());
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    tracing::debug!("Heartbeat timer stopped");
                    break;
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransitionMode;
    use crate::fallback::source::MockLoopbackSource;
    use crate::types::PixelLayout;

    fn format() -> FrameFormat {
        FrameFormat::new(4, 2, PixelLayout::Gray8)
    }

    fn manager(transition: TransitionMode) -> FallbackManager {
        let live = StageChannel::new("final", format(), 3).unwrap();
        let settings = FallbackSettings {
            transition,
            ..Default::default()
        };
        FallbackManager::new(settings, live).unwrap()
    }

    fn healthy_mock(fill: u8) -> Box<MockLoopbackSource> {
        let mut source = MockLoopbackSource::new();
        source.expect_describe().return_const(format!("mock {}", fill));
        source.expect_is_healthy().return_const(true);
        source.expect_open().returning(|_, _| Ok(()));
        source
            .expect_frame()
            .returning(move |_| Ok(Bytes::from(vec![fill; 8])));
        Box::new(source)
    }

    fn unhealthy_mock() -> Box<MockLoopbackSource> {
        let mut source = MockLoopbackSource::new();
        source.expect_describe().return_const("down".to_string());
        source.expect_is_healthy().return_const(false);
        source.expect_open().never();
        source.expect_frame().never();
        Box::new(source)
    }

    fn origin_id(frame: &Frame) -> String {
        match &frame.origin {
            FrameOrigin::Fallback { source_id } => source_id.clone(),
            other => panic!("expected fallback frame, got {}", other),
        }
    }

    #[test]
    fn test_stall_selects_highest_priority_healthy_source() {
        let mut manager = manager(TransitionMode::Immediate);
        manager.register_source("top", 10, unhealthy_mock()).unwrap();
        manager.register_source("mid", 5, healthy_mock(5)).unwrap();
        manager.register_source("low", 1, healthy_mock(1)).unwrap();

        let t0 = Instant::now();
        manager.record_heartbeat(t0);
        assert_eq!(manager.tick(t0 + Duration::from_millis(100)), FallbackState::MainActive);
        assert_eq!(manager.tick(t0 + Duration::from_millis(500)), FallbackState::Detecting);
        assert_eq!(
            manager.tick(t0 + Duration::from_millis(2_500)),
            FallbackState::FallbackActive
        );

        let frame = manager
            .get_current_output_frame(t0 + Duration::from_millis(2_500))
            .unwrap();
        assert_eq!(origin_id(&frame), "mid");
        assert_eq!(&frame.data[..], &[5u8; 8]);
    }

    #[test]
    fn test_transient_gap_does_not_fall_back() {
        let mut manager = manager(TransitionMode::Immediate);
        let t0 = Instant::now();
        manager.record_heartbeat(t0);
        assert_eq!(manager.tick(t0 + Duration::from_millis(600)), FallbackState::Detecting);

        manager.record_heartbeat(t0 + Duration::from_millis(700));
        assert_eq!(
            manager.tick(t0 + Duration::from_millis(750)),
            FallbackState::MainActive
        );
    }

    #[test]
    fn test_equal_priorities_use_registration_order() {
        let mut manager = manager(TransitionMode::Immediate);
        manager.register_source("first", 3, healthy_mock(1)).unwrap();
        manager.register_source("second", 3, healthy_mock(2)).unwrap();

        let t0 = Instant::now();
        manager.record_heartbeat(t0);
        manager.tick(t0 + Duration::from_secs(3));
        assert_eq!(manager.active_source(), Some("first"));
    }

    #[test]
    fn test_open_failure_falls_through_to_last_resort() {
        let mut manager = manager(TransitionMode::Immediate);
        let mut broken = MockLoopbackSource::new();
        broken.expect_describe().return_const("broken".to_string());
        broken.expect_is_healthy().return_const(true);
        broken.expect_open().times(1).returning(|_, _| {
            Err(LiveCoreError::SourceUnavailable {
                source_id: "broken".to_string(),
                reason: "gone".to_string(),
            })
        });
        manager.register_source("broken", 1, Box::new(broken)).unwrap();

        let t0 = Instant::now();
        manager.record_heartbeat(t0);
        manager.tick(t0 + Duration::from_secs(3));
        assert_eq!(manager.active_source(), Some(LAST_RESORT_ID));

        let frame = manager.get_current_output_frame(t0 + Duration::from_secs(3)).unwrap();
        assert_eq!(origin_id(&frame), LAST_RESORT_ID);
        assert_eq!(frame.size(), format().byte_size());
    }

    #[test]
    fn test_frame_error_fails_over_to_next_source() {
        let mut manager = manager(TransitionMode::Immediate);
        let mut flaky = MockLoopbackSource::new();
        flaky.expect_describe().return_const("flaky".to_string());
        flaky.expect_is_healthy().return_const(true);
        flaky.expect_open().returning(|_, _| Ok(()));
        flaky.expect_frame().returning(|_| {
            Err(LiveCoreError::SourceUnavailable {
                source_id: "flaky".to_string(),
                reason: "decoder died".to_string(),
            })
        });
        manager.register_source("flaky", 9, Box::new(flaky)).unwrap();
        manager.register_source("backup", 1, healthy_mock(7)).unwrap();

        let t0 = Instant::now();
        manager.record_heartbeat(t0);
        manager.tick(t0 + Duration::from_secs(3));
        assert_eq!(manager.active_source(), Some("flaky"));

        let frame = manager.get_current_output_frame(t0 + Duration::from_secs(3)).unwrap();
        assert_eq!(origin_id(&frame), "backup");
        let status = manager.status(t0 + Duration::from_secs(3));
        assert!(status.sources[0].failed);
        assert!(status.sources[0].last_error.as_deref().unwrap().contains("decoder died"));
    }

    #[test]
    fn test_recovery_requires_continuous_heartbeat() {
        let mut manager = manager(TransitionMode::Immediate);
        let t0 = Instant::now();
        manager.record_heartbeat(t0);
        manager.tick(t0 + Duration::from_secs(3));
        assert_eq!(manager.state(), FallbackState::FallbackActive);

        let resumed = t0 + Duration::from_millis(3_100);
        manager.record_heartbeat(resumed);
        assert_eq!(manager.tick(resumed), FallbackState::Recovering);

        // Heartbeat drops out again before the recovery delay
        assert_eq!(
            manager.tick(resumed + Duration::from_millis(800)),
            FallbackState::FallbackActive
        );
        assert!(manager.state().serves_fallback());
    }

    #[test]
    fn test_continuous_heartbeat_returns_to_main() {
        let mut manager = manager(TransitionMode::Immediate);
        manager.register_source("loop", 1, healthy_mock(4)).unwrap();
        let t0 = Instant::now();
        manager.record_heartbeat(t0);
        assert_eq!(
            manager.tick(t0 + Duration::from_millis(2_500)),
            FallbackState::FallbackActive
        );

        // 3.5s of heartbeats every 100ms against a 3s recovery delay
        let mut at = t0 + Duration::from_millis(2_600);
        let end = at + Duration::from_millis(3_500);
        let mut seen_recovering = false;
        while at <= end {
            manager.record_heartbeat(at);
            let state = manager.tick(at);
            seen_recovering |= state == FallbackState::Recovering;
            if at < t0 + Duration::from_millis(5_000) {
                assert_ne!(state, FallbackState::MainActive);
            }
            at += Duration::from_millis(100);
        }
        assert!(seen_recovering);
        assert_eq!(manager.state(), FallbackState::MainActive);
        assert!(manager.active_source().is_none());
    }

    #[test]
    fn test_recovery_delay_counts_from_first_fresh_heartbeat() {
        let mut manager = manager(TransitionMode::Immediate);
        let t0 = Instant::now();
        manager.record_heartbeat(t0);
        assert_eq!(manager.tick(t0 + Duration::from_secs(3)), FallbackState::FallbackActive);

        // Two beats land between coarse checks
        manager.record_heartbeat(t0 + Duration::from_millis(3_100));
        manager.record_heartbeat(t0 + Duration::from_millis(3_200));
        assert_eq!(
            manager.tick(t0 + Duration::from_millis(3_200)),
            FallbackState::Recovering
        );

        let due = t0 + Duration::from_millis(6_100);
        manager.record_heartbeat(due);
        assert_eq!(manager.tick(due), FallbackState::MainActive);
    }

    #[test]
    fn test_repaired_source_is_selected_in_next_episode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("still.raw");
        std::fs::write(&path, [0u8; 5]).unwrap();

        let mut manager = manager(TransitionMode::Immediate);
        manager
            .register_source("still", 10, Box::new(StaticImageSource::new("still", &path)))
            .unwrap();
        manager.register_source("backup", 1, healthy_mock(1)).unwrap();

        // First stall: the still cannot be loaded
        let t0 = Instant::now();
        manager.record_heartbeat(t0);
        manager.tick(t0 + Duration::from_secs(3));
        assert_eq!(manager.active_source(), Some("backup"));

        // Repaired while falling back, then live output recovers
        std::fs::write(&path, [9u8; 8]).unwrap();
        let resumed = t0 + Duration::from_millis(3_100);
        manager.record_heartbeat(resumed);
        manager.tick(resumed);
        let back = resumed + Duration::from_secs(3);
        manager.record_heartbeat(back);
        assert_eq!(manager.tick(back), FallbackState::MainActive);

        // Second stall picks the higher priority source again
        let stalled = back + Duration::from_secs(3);
        assert_eq!(manager.tick(stalled), FallbackState::FallbackActive);
        assert_eq!(manager.active_source(), Some("still"));
        let frame = manager.get_current_output_frame(stalled).unwrap();
        assert_eq!(&frame.data[..], &[9u8; 8]);
    }

    #[test]
    fn test_output_before_first_live_frame_is_valid() {
        let mut manager = manager(TransitionMode::Immediate);
        let frame = manager.get_current_output_frame(Instant::now()).unwrap();
        assert_eq!(frame.size(), format().byte_size());
        assert_eq!(manager.state(), FallbackState::MainActive);
    }

    #[test]
    fn test_live_publish_is_a_heartbeat() {
        let live = StageChannel::new("final", format(), 3).unwrap();
        let writer = live.claim_writer();
        let mut manager = FallbackManager::new(FallbackSettings::default(), live).unwrap();
        assert!(manager.last_heartbeat().is_none());

        let mut slot = writer.acquire_write_slot().unwrap();
        slot.data_mut().fill(3);
        writer.publish(slot).unwrap();

        manager.tick(Instant::now());
        assert!(manager.last_heartbeat().is_some());
        let frame = manager.get_current_output_frame(Instant::now()).unwrap();
        assert!(frame.origin.is_live());
        assert_eq!(&frame.data[..], &[3u8; 8]);
    }

    #[test]
    fn test_delayed_transition_holds_previous_output() {
        let live = StageChannel::new("final", format(), 3).unwrap();
        let writer = live.claim_writer();
        let settings = FallbackSettings {
            transition: TransitionMode::Delayed { ms: 500 },
            ..Default::default()
        };
        let mut manager = FallbackManager::new(settings, live).unwrap();
        manager.register_source("loop", 1, healthy_mock(8)).unwrap();

        let mut slot = writer.acquire_write_slot().unwrap();
        slot.data_mut().fill(2);
        writer.publish(slot).unwrap();
        manager.tick(Instant::now());
        let t0 = manager.last_heartbeat().unwrap();

        let stalled = t0 + Duration::from_secs(3);
        assert_eq!(manager.tick(stalled), FallbackState::FallbackActive);
        // Still the frozen live frame during the delay
        let held = manager.get_current_output_frame(stalled).unwrap();
        assert!(held.origin.is_live());

        let after = stalled + Duration::from_millis(600);
        let switched = manager.get_current_output_frame(after).unwrap();
        assert_eq!(origin_id(&switched), "loop");
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut manager = manager(TransitionMode::Immediate);
        manager.register_source("a", 1, healthy_mock(1)).unwrap();
        assert!(manager.register_source("a", 2, healthy_mock(2)).is_err());
        assert!(manager
            .register_source(LAST_RESORT_ID, 2, healthy_mock(2))
            .is_err());
    }
}
