//! Mock construction helpers

use bytes::Bytes;
use livecore::error::{LiveCoreError, Result};
use livecore::stage::{StageContext, StageOperation};
use livecore::{FrameFormat, LoopbackSource};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Relay operation that fails every frame
pub struct FailingOp;

impl StageOperation for FailingOp {
    fn name(&self) -> &str {
        "failing"
    }

    fn process(&mut self, ctx: &mut StageContext<'_>) -> Result<()> {
        Err(LiveCoreError::StageCrashed {
            stage: ctx.stage,
            reason: "injected failure".to_string(),
        })
    }
}

/// Relay operation that panics once it has processed `after` frames
pub struct PanickingOp {
    pub after: u64,
    seen: u64,
}

impl PanickingOp {
    pub fn new(after: u64) -> Self {
        Self { after, seen: 0 }
    }
}

impl StageOperation for PanickingOp {
    fn name(&self) -> &str {
        "panicking"
    }

    fn process(&mut self, ctx: &mut StageContext<'_>) -> Result<()> {
        self.seen += 1;
        if self.seen > self.after {
            panic!("injected panic after {} frames", self.after);
        }
        ctx.copy_input()
    }
}

/// Relay operation that blocks inside `process` while `stuck` is set
pub struct StuckOp {
    pub stuck: Arc<AtomicBool>,
}

impl StageOperation for StuckOp {
    fn name(&self) -> &str {
        "stuck"
    }

    fn process(&mut self, ctx: &mut StageContext<'_>) -> Result<()> {
        while self.stuck.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
        }
        ctx.copy_input()
    }
}

/// Relay operation that sleeps `delay` per frame and counts what it processed
pub struct SlowOp {
    pub delay: Duration,
    /// Sleeps `delay` per frame while set
    pub slow: Arc<AtomicBool>,
    pub processed: Arc<AtomicU64>,
}

impl SlowOp {
    pub fn new(delay: Duration, slow: &Arc<AtomicBool>) -> Self {
        Self {
            delay,
            slow: Arc::clone(slow),
            processed: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl StageOperation for SlowOp {
    fn name(&self) -> &str {
        "slow"
    }

    fn process(&mut self, ctx: &mut StageContext<'_>) -> Result<()> {
        if self.slow.load(Ordering::SeqCst) {
            std::thread::sleep(self.delay);
        }
        self.processed.fetch_add(1, Ordering::Relaxed);
        ctx.copy_input()
    }
}

/// Loopback source whose health and failures are driven by the test
pub struct ScriptedSource {
    pub fill: u8,
    pub healthy: Arc<AtomicBool>,
    pub failing: Arc<AtomicBool>,
    format: Option<FrameFormat>,
}

impl ScriptedSource {
    pub fn new(fill: u8) -> Self {
        Self {
            fill,
            healthy: Arc::new(AtomicBool::new(true)),
            failing: Arc::new(AtomicBool::new(false)),
            format: None,
        }
    }
}

impl LoopbackSource for ScriptedSource {
    fn describe(&self) -> String {
        format!("scripted fill {}", self.fill)
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn open(&mut self, format: FrameFormat, _now: Instant) -> Result<()> {
        self.format = Some(format);
        Ok(())
    }

    fn frame(&mut self, _now: Instant) -> Result<Bytes> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(LiveCoreError::SourceUnavailable {
                source_id: "scripted".to_string(),
                reason: "injected failure".to_string(),
            });
        }
        let size = self.format.map(|f| f.byte_size()).unwrap_or(0);
        Ok(Bytes::from(vec![self.fill; size]))
    }
}

/// Write `count` raw frames named `frame_000.raw`.. filled with `10 * (i + 1)`
pub fn write_frame_sequence(dir: &Path, format: FrameFormat, count: usize) -> Vec<PathBuf> {
    (0..count)
        .map(|i| {
            let path = dir.join(format!("frame_{:03}.raw", i));
            std::fs::write(&path, vec![(10 * (i + 1)) as u8; format.byte_size()])
                .expect("write frame");
            path
        })
        .collect()
}

/// Write one raw frame filled with `value`
pub fn write_static_frame(path: &Path, format: FrameFormat, value: u8) {
    std::fs::write(path, vec![value; format.byte_size()]).expect("write frame");
}
