//! Stage operation abstraction.
//!
//! Two-layer design:
//! - **`StageOperation` trait** - for stages supplied by the embedding
//!   application (model calls, custom effects, test doubles).
//! - **`BuiltinStage` enum** - for the built-in stages. Dispatch is a plain
//!   `match` on the hot path.
//!
//! `AnyStage` wraps either variant so the run loop handles both uniformly.
//! `StageKind` is the tagged description resolved once at pipeline assembly;
//! every (re)start of a stage instantiates a fresh `AnyStage` from it.

use crate::config::{CaptureSettings, EffectKind, StageKindConfig};
use crate::error::{LiveCoreError, Result};
use crate::pattern::PatternKind;
use crate::quality::QualityState;
use crate::stage::builtin::{
    AlignStage, BuiltinStage, CaptureStage, DetectStage, FramePusher, MergeStage,
    PassthroughStage, PushCapture, SyntheticCapture, TransformStage,
};
use crate::stage::StageId;
use crate::types::{FrameFormat, FrameMeta};
use bytes::Bytes;
use crossbeam_channel::Receiver;
use std::sync::Arc;
use std::time::Duration;

/// Borrowed view of the upstream frame
#[derive(Clone, Copy)]
pub struct FrameView<'a> {
    pub data: &'a [u8],
    pub meta: &'a FrameMeta,
}

/// Everything an operation sees for one unit of work.
pub struct StageContext<'a> {
    pub stage: StageId,
    /// Negotiated format of both input and output
    pub format: FrameFormat,
    /// Quality state loaded just before this frame
    pub quality: QualityState,
    /// Upstream frame; `None` for source stages
    pub input: Option<FrameView<'a>>,
    /// Output slot, exclusively owned until publish
    pub output: &'a mut [u8],
    /// Output metadata, pre-filled from the input (or fresh for sources)
    pub meta: &'a mut FrameMeta,
}

impl StageContext<'_> {
    /// Copy the upstream frame into the output slot.
    pub fn copy_input(&mut self) -> Result<()> {
        let Some(input) = self.input else {
            return Ok(());
        };
        if input.data.len() != self.output.len() {
            return Err(LiveCoreError::FormatMismatch {
                expected: self.output.len(),
                actual: input.data.len(),
            });
        }
        self.output.copy_from_slice(input.data);
        Ok(())
    }
}

/// Trait for stages supplied from outside the crate.
pub trait StageOperation: Send {
    /// Human-readable name of this operation.
    fn name(&self) -> &str;

    /// Called each time the stage's execution context starts.
    fn on_start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Source stages: wait up to `timeout` for the next raw frame.
    ///
    /// Returns `Ok(false)` if nothing is ready yet. Non-source stages keep the default.
    fn poll_input(&mut self, _timeout: Duration) -> Result<bool> {
        Ok(true)
    }

    /// Source stages: discard the ready input without processing it.
    fn skip_input(&mut self) {}

    /// Do one bounded unit of work into `ctx.output`.
    fn process(&mut self, ctx: &mut StageContext<'_>) -> Result<()>;

    /// Called when the execution context exits cooperatively.
    fn on_stop(&mut self) {}
}

/// Builds a fresh operation for every start of a custom stage
pub type OperationFactory = Arc<dyn Fn() -> Box<dyn StageOperation> + Send + Sync>;

/// What a stage does, resolved once when the pipeline is assembled
#[derive(Clone)]
pub enum StageKind {
    Capture { fps: u32, pattern: PatternKind },
    PushCapture { frames: Receiver<Bytes> },
    Detect { threshold: u8 },
    Align { grid: u32 },
    Transform { effect: EffectKind },
    Merge { opacity: f32 },
    Passthrough,
    Custom {
        label: String,
        source: bool,
        factory: OperationFactory,
    },
}

impl StageKind {
    /// Resolve a configured kind. Push capture also yields the producer handle.
    pub fn resolve(
        config: &StageKindConfig,
        capture: &CaptureSettings,
        format: FrameFormat,
    ) -> (StageKind, Option<FramePusher>) {
        match config {
            StageKindConfig::Capture => (
                StageKind::Capture {
                    fps: capture.fps,
                    pattern: capture.pattern,
                },
                None,
            ),
            StageKindConfig::PushCapture { capacity } => {
                let (pusher, frames) = FramePusher::bounded(format, *capacity);
                (StageKind::PushCapture { frames }, Some(pusher))
            }
            StageKindConfig::Detect { threshold } => (
                StageKind::Detect {
                    threshold: *threshold,
                },
                None,
            ),
            StageKindConfig::Align { grid } => (StageKind::Align { grid: *grid }, None),
            StageKindConfig::Transform { effect } => {
                (StageKind::Transform { effect: *effect }, None)
            }
            StageKindConfig::Merge { opacity } => (
                StageKind::Merge {
                    opacity: opacity.clamp(0.0, 1.0),
                },
                None,
            ),
            StageKindConfig::Passthrough => (StageKind::Passthrough, None),
        }
    }

    /// Wrap a custom operation factory
    pub fn custom<F>(label: impl Into<String>, source: bool, factory: F) -> Self
    where
        F: Fn() -> Box<dyn StageOperation> + Send + Sync + 'static,
    {
        StageKind::Custom {
            label: label.into(),
            source,
            factory: Arc::new(factory),
        }
    }

    pub fn is_source(&self) -> bool {
        match self {
            StageKind::Capture { .. } | StageKind::PushCapture { .. } => true,
            StageKind::Custom { source, .. } => *source,
            _ => false,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            StageKind::Capture { .. } => "capture",
            StageKind::PushCapture { .. } => "push_capture",
            StageKind::Detect { .. } => "detect",
            StageKind::Align { .. } => "align",
            StageKind::Transform { .. } => "transform",
            StageKind::Merge { .. } => "merge",
            StageKind::Passthrough => "passthrough",
            StageKind::Custom { label, .. } => label,
        }
    }

    /// Fresh operation state for one run of the stage
    pub fn instantiate(&self) -> AnyStage {
        let builtin = match self {
            StageKind::Capture { fps, pattern } => BuiltinStage::Capture(CaptureStage::new(
                Box::new(SyntheticCapture::new(*pattern, *fps)),
            )),
            StageKind::PushCapture { frames } => BuiltinStage::Capture(CaptureStage::new(
                Box::new(PushCapture::new(frames.clone())),
            )),
            StageKind::Detect { threshold } => BuiltinStage::Detect(DetectStage::new(*threshold)),
            StageKind::Align { grid } => BuiltinStage::Align(AlignStage::new(*grid)),
            StageKind::Transform { effect } => {
                BuiltinStage::Transform(TransformStage::new(*effect))
            }
            StageKind::Merge { opacity } => BuiltinStage::Merge(MergeStage::new(*opacity)),
            StageKind::Passthrough => BuiltinStage::Passthrough(PassthroughStage),
            StageKind::Custom { factory, .. } => return AnyStage::Plugin(factory()),
        };
        AnyStage::Builtin(builtin)
    }
}

/// Either a built-in stage or a plugin operation
pub enum AnyStage {
    Builtin(BuiltinStage),
    Plugin(Box<dyn StageOperation>),
}

impl AnyStage {
    pub fn name(&self) -> &str {
        match self {
            AnyStage::Builtin(s) => s.name(),
            AnyStage::Plugin(p) => p.name(),
        }
    }

    pub fn on_start(&mut self) -> Result<()> {
        match self {
            AnyStage::Builtin(s) => s.on_start(),
            AnyStage::Plugin(p) => p.on_start(),
        }
    }

    pub fn poll_input(&mut self, timeout: Duration) -> Result<bool> {
        match self {
            AnyStage::Builtin(s) => s.poll_input(timeout),
            AnyStage::Plugin(p) => p.poll_input(timeout),
        }
    }

    pub fn skip_input(&mut self) {
        match self {
            AnyStage::Builtin(s) => s.skip_input(),
            AnyStage::Plugin(p) => p.skip_input(),
        }
    }

    pub fn process(&mut self, ctx: &mut StageContext<'_>) -> Result<()> {
        match self {
            AnyStage::Builtin(s) => s.process(ctx),
            AnyStage::Plugin(p) => p.process(ctx),
        }
    }

    pub fn on_stop(&mut self) {
        match self {
            AnyStage::Builtin(s) => s.on_stop(),
            AnyStage::Plugin(p) => p.on_stop(),
        }
    }
}
