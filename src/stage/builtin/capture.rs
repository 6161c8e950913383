//! Capture stage and the frame sources that feed it.
//!
//! The first stage of a pipeline has no upstream channel. It either polls a
//! paced synthetic source or receives frames pushed by the embedding
//! application through a [`FramePusher`].

use crate::error::{LiveCoreError, Result};
use crate::pattern::{self, PatternKind};
use crate::stage::operation::StageContext;
use crate::types::FrameFormat;
use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Opaque producer of raw frames for the first stage.
pub trait FrameSource: Send {
    fn describe(&self) -> String;

    /// Wait up to `timeout` for the next frame. `Ok(false)` means nothing yet.
    fn wait_frame(&mut self, timeout: Duration) -> Result<bool>;

    /// Write the pending frame into `out`.
    fn read_frame(&mut self, format: &FrameFormat, out: &mut [u8]) -> Result<()>;

    /// Drop the pending frame unread.
    fn skip_frame(&mut self);
}

// ==================== Synthetic ====================

/// Pattern source paced at a fixed frame rate
pub struct SyntheticCapture {
    pattern: PatternKind,
    interval: Duration,
    next_due: Option<Instant>,
    phase: u64,
}

impl SyntheticCapture {
    pub fn new(pattern: PatternKind, fps: u32) -> Self {
        Self {
            pattern,
            interval: Duration::from_nanos(1_000_000_000 / fps.max(1) as u64),
            next_due: None,
            phase: 0,
        }
    }
}

impl FrameSource for SyntheticCapture {
    fn describe(&self) -> String {
        format!("synthetic {:?} every {:?}", self.pattern, self.interval)
    }

    fn wait_frame(&mut self, timeout: Duration) -> Result<bool> {
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            std::thread::sleep((due - now).min(timeout));
            if Instant::now() < due {
                return Ok(false);
            }
        }
        // Fall behind gracefully instead of bursting to catch up
        let next = due + self.interval;
        self.next_due = Some(next.max(Instant::now()));
        Ok(true)
    }

    fn read_frame(&mut self, format: &FrameFormat, out: &mut [u8]) -> Result<()> {
        pattern::render(self.pattern, format, self.phase, out);
        self.phase += 1;
        Ok(())
    }

    fn skip_frame(&mut self) {
        self.phase += 1;
    }
}

// ==================== Push ====================

/// Producer handle for a push-capture stage.
///
/// Cloneable; every clone feeds the same stage.
#[derive(Clone)]
pub struct FramePusher {
    tx: Sender<Bytes>,
    format: FrameFormat,
    dropped: Arc<AtomicU64>,
}

impl FramePusher {
    /// Create a pusher and the receiving end for a capture stage
    pub fn bounded(format: FrameFormat, capacity: usize) -> (FramePusher, Receiver<Bytes>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        (
            FramePusher {
                tx,
                format,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    /// Offer a raw frame. Returns `false` if it was dropped because the stage is behind.
    pub fn push(&self, data: impl Into<Bytes>) -> Result<bool> {
        let data = data.into();
        if data.len() != self.format.byte_size() {
            return Err(LiveCoreError::FormatMismatch {
                expected: self.format.byte_size(),
                actual: data.len(),
            });
        }
        match self.tx.try_send(data) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Ok(false)
            }
            Err(TrySendError::Disconnected(_)) => Err(LiveCoreError::Channel(
                "push capture receiver is gone".to_string(),
            )),
        }
    }

    /// Frames rejected because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Source fed by a [`FramePusher`]; only the newest queued frame is used
pub struct PushCapture {
    frames: Receiver<Bytes>,
    pending: Option<Bytes>,
    disconnected: bool,
}

impl PushCapture {
    pub fn new(frames: Receiver<Bytes>) -> Self {
        Self {
            frames,
            pending: None,
            disconnected: false,
        }
    }
}

impl FrameSource for PushCapture {
    fn describe(&self) -> String {
        "push capture".to_string()
    }

    fn wait_frame(&mut self, timeout: Duration) -> Result<bool> {
        if self.pending.is_some() {
            return Ok(true);
        }
        match self.frames.recv_timeout(timeout) {
            Ok(mut frame) => {
                while let Ok(newer) = self.frames.try_recv() {
                    frame = newer;
                }
                self.pending = Some(frame);
                Ok(true)
            }
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(RecvTimeoutError::Disconnected) => {
                if !self.disconnected {
                    tracing::warn!("Push capture input disconnected; no further frames");
                    self.disconnected = true;
                }
                std::thread::sleep(timeout);
                Ok(false)
            }
        }
    }

    fn read_frame(&mut self, format: &FrameFormat, out: &mut [u8]) -> Result<()> {
        let frame = self.pending.take().ok_or_else(|| {
            LiveCoreError::Channel("read_frame called with no pending frame".to_string())
        })?;
        if frame.len() != out.len() || frame.len() != format.byte_size() {
            return Err(LiveCoreError::FormatMismatch {
                expected: out.len(),
                actual: frame.len(),
            });
        }
        out.copy_from_slice(&frame);
        Ok(())
    }

    fn skip_frame(&mut self) {
        self.pending = None;
    }
}

// ==================== Stage ====================

/// First stage of a pipeline
pub struct CaptureStage {
    source: Box<dyn FrameSource>,
}

impl CaptureStage {
    pub fn new(source: Box<dyn FrameSource>) -> Self {
        Self { source }
    }

    pub fn name(&self) -> &str {
        "capture"
    }

    pub fn on_start(&mut self) -> Result<()> {
        tracing::debug!("Capture starting from {}", self.source.describe());
        Ok(())
    }

    pub fn poll_input(&mut self, timeout: Duration) -> Result<bool> {
        self.source.wait_frame(timeout)
    }

    pub fn skip_input(&mut self) {
        self.source.skip_frame();
    }

    pub fn process(&mut self, ctx: &mut StageContext<'_>) -> Result<()> {
        self.source.read_frame(&ctx.format, ctx.output)
    }

    pub fn on_stop(&mut self) {}
}
