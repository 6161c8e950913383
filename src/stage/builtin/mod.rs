//! Built-in stage implementations.
//!
//! Each built-in stage is a plain struct with inherent lifecycle methods;
//! [`BuiltinStage`] dispatches to them with a `match`.

mod capture;
mod detect;
mod merge;
mod transform;

pub use capture::{CaptureStage, FramePusher, FrameSource, PushCapture, SyntheticCapture};
pub use detect::{AlignStage, DetectStage};
pub use merge::{MergeStage, PassthroughStage};
pub use transform::TransformStage;

use crate::error::Result;
use crate::stage::operation::StageContext;
use crate::types::{FrameFormat, Region};
use std::time::Duration;

/// Enum dispatch for built-in stages.
pub enum BuiltinStage {
    Capture(CaptureStage),
    Detect(DetectStage),
    Align(AlignStage),
    Transform(TransformStage),
    Merge(MergeStage),
    Passthrough(PassthroughStage),
}

impl BuiltinStage {
    pub fn name(&self) -> &str {
        match self {
            BuiltinStage::Capture(s) => s.name(),
            BuiltinStage::Detect(s) => s.name(),
            BuiltinStage::Align(s) => s.name(),
            BuiltinStage::Transform(s) => s.name(),
            BuiltinStage::Merge(s) => s.name(),
            BuiltinStage::Passthrough(s) => s.name(),
        }
    }

    pub fn on_start(&mut self) -> Result<()> {
        match self {
            BuiltinStage::Capture(s) => s.on_start(),
            _ => Ok(()),
        }
    }

    pub fn poll_input(&mut self, timeout: Duration) -> Result<bool> {
        match self {
            BuiltinStage::Capture(s) => s.poll_input(timeout),
            _ => Ok(true),
        }
    }

    pub fn skip_input(&mut self) {
        if let BuiltinStage::Capture(s) = self {
            s.skip_input();
        }
    }

    pub fn process(&mut self, ctx: &mut StageContext<'_>) -> Result<()> {
        match self {
            BuiltinStage::Capture(s) => s.process(ctx),
            BuiltinStage::Detect(s) => s.process(ctx),
            BuiltinStage::Align(s) => s.process(ctx),
            BuiltinStage::Transform(s) => s.process(ctx),
            BuiltinStage::Merge(s) => s.process(ctx),
            BuiltinStage::Passthrough(s) => s.process(ctx),
        }
    }

    pub fn on_stop(&mut self) {
        if let BuiltinStage::Capture(s) = self {
            s.on_stop();
        }
    }
}

/// Sampling stride for a quality scale: 1 at full scale, coarser below
#[inline]
pub(crate) fn stride_for_scale(scale: f32) -> u32 {
    (1.0 / scale.max(0.05)).round().max(1.0) as u32
}

/// Visit every pixel of `region` that lies inside `buf`.
pub(crate) fn for_each_pixel(
    format: &FrameFormat,
    region: Region,
    buf: &mut [u8],
    mut f: impl FnMut(u32, u32, &mut [u8]),
) {
    let region = region.clamp_to(format);
    let bpp = format.layout.bytes_per_pixel();
    for y in region.y..region.bottom() {
        for x in region.x..region.right() {
            let offset = format.offset(x, y);
            if let Some(px) = buf.get_mut(offset..offset + bpp) {
                f(x, y, px);
            }
        }
    }
}

/// Number of leading colour bytes in a pixel (alpha excluded)
#[inline]
pub(crate) fn color_bytes(format: &FrameFormat) -> usize {
    format.layout.bytes_per_pixel().min(3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelLayout;

    #[test]
    fn test_stride_for_scale() {
        assert_eq!(stride_for_scale(1.0), 1);
        assert_eq!(stride_for_scale(0.5), 2);
        assert_eq!(stride_for_scale(0.3), 3);
        assert_eq!(stride_for_scale(0.0), 20);
    }

    #[test]
    fn test_for_each_pixel_clamps_region() {
        let format = FrameFormat::new(4, 4, PixelLayout::Gray8);
        let mut buf = vec![0u8; format.byte_size()];
        let mut visited = 0;
        for_each_pixel(&format, Region::new(2, 2, 10, 10), &mut buf, |_, _, px| {
            px[0] = 1;
            visited += 1;
        });
        assert_eq!(visited, 4);
        assert_eq!(buf.iter().filter(|&&b| b == 1).count(), 4);
    }
}
