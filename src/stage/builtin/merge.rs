//! Final composition and the passthrough stage.

use super::{color_bytes, for_each_pixel};
use crate::error::Result;
use crate::pattern::write_rgb;
use crate::stage::operation::StageContext;
use crate::types::Region;

const OUTLINE_RGB: [u8; 3] = [40, 220, 90];
const OUTLINE_WIDTH: u32 = 2;

/// Blends an outline of the region of interest over the frame
pub struct MergeStage {
    opacity: f32,
}

impl MergeStage {
    pub fn new(opacity: f32) -> Self {
        Self { opacity }
    }

    pub fn name(&self) -> &str {
        "merge"
    }

    pub fn process(&mut self, ctx: &mut StageContext<'_>) -> Result<()> {
        ctx.copy_input()?;
        let format = ctx.format;
        let Some(roi) = ctx.meta.roi.map(|r| r.clamp_to(&format)) else {
            return Ok(());
        };
        if roi.is_empty() || self.opacity <= 0.0 {
            return Ok(());
        }

        let mut target = [0u8; 4];
        write_rgb(format.layout, OUTLINE_RGB, &mut target[..format.layout.bytes_per_pixel()]);
        let colors = color_bytes(&format);
        let alpha = self.opacity.clamp(0.0, 1.0);

        let width = OUTLINE_WIDTH.min(roi.width).min(roi.height);
        let edges = [
            Region::new(roi.x, roi.y, roi.width, width),
            Region::new(roi.x, roi.bottom() - width, roi.width, width),
            Region::new(roi.x, roi.y + width, width, roi.height.saturating_sub(width * 2)),
            Region::new(
                roi.right() - width,
                roi.y + width,
                width,
                roi.height.saturating_sub(width * 2),
            ),
        ];
        for edge in edges.iter().filter(|e| !e.is_empty()) {
            for_each_pixel(&format, *edge, ctx.output, |_, _, px| {
                for (c, t) in px.iter_mut().zip(target.iter()).take(colors) {
                    *c = (*c as f32 * (1.0 - alpha) + *t as f32 * alpha).round() as u8;
                }
            });
        }
        Ok(())
    }
}

/// Copies input to output unchanged
pub struct PassthroughStage;

impl PassthroughStage {
    pub fn name(&self) -> &str {
        "passthrough"
    }

    pub fn process(&mut self, ctx: &mut StageContext<'_>) -> Result<()> {
        ctx.copy_input()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::QualityState;
    use crate::stage::operation::FrameView;
    use crate::stage::StageId;
    use crate::types::{FrameFormat, FrameMeta, PixelLayout};

    #[test]
    fn test_outline_drawn_around_roi() {
        let format = FrameFormat::new(8, 8, PixelLayout::Rgb8);
        let input = vec![0u8; format.byte_size()];
        let mut input_meta = FrameMeta::default();
        input_meta.roi = Some(Region::new(1, 1, 6, 6));
        let mut meta = input_meta;
        let mut output = vec![0u8; format.byte_size()];
        let mut ctx = StageContext {
            stage: StageId(4),
            format,
            quality: QualityState::FULL,
            input: Some(FrameView {
                data: &input,
                meta: &input_meta,
            }),
            output: &mut output,
            meta: &mut meta,
        };
        MergeStage::new(1.0).process(&mut ctx).unwrap();

        let px = |x: u32, y: u32| &output[format.offset(x, y)..format.offset(x, y) + 3];
        assert_eq!(px(1, 1), &OUTLINE_RGB);
        assert_eq!(px(6, 4), &OUTLINE_RGB);
        // Interior and outside untouched
        assert_eq!(px(4, 4), &[0, 0, 0]);
        assert_eq!(px(0, 0), &[0, 0, 0]);
    }

    #[test]
    fn test_passthrough_copies() {
        let format = FrameFormat::new(2, 2, PixelLayout::Gray8);
        let input = vec![9u8; 4];
        let input_meta = FrameMeta::default();
        let mut meta = input_meta;
        let mut output = vec![0u8; 4];
        let mut ctx = StageContext {
            stage: StageId(5),
            format,
            quality: QualityState::FULL,
            input: Some(FrameView {
                data: &input,
                meta: &input_meta,
            }),
            output: &mut output,
            meta: &mut meta,
        };
        PassthroughStage.process(&mut ctx).unwrap();
        assert_eq!(output, input);
    }
}
