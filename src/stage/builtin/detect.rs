//! Region-of-interest detection and alignment.

use super::stride_for_scale;
use crate::error::Result;
use crate::stage::operation::StageContext;
use crate::types::Region;

/// Finds the bounding box of pixels at or above a luminance threshold.
///
/// Sampling gets coarser as the quality scale drops, which is what makes
/// this stage cheaper under load.
pub struct DetectStage {
    threshold: u8,
}

impl DetectStage {
    pub fn new(threshold: u8) -> Self {
        Self { threshold }
    }

    pub fn name(&self) -> &str {
        "detect"
    }

    pub fn process(&mut self, ctx: &mut StageContext<'_>) -> Result<()> {
        ctx.copy_input()?;

        let format = ctx.format;
        let layout = format.layout;
        let bpp = layout.bytes_per_pixel();
        let stride = stride_for_scale(ctx.quality.scale);
        let data = &*ctx.output;

        let mut bounds: Option<(u32, u32, u32, u32)> = None;
        for y in (0..format.height).step_by(stride as usize) {
            for x in (0..format.width).step_by(stride as usize) {
                let offset = format.offset(x, y);
                let Some(px) = data.get(offset..offset + bpp) else {
                    continue;
                };
                if layout.luma(px) < self.threshold {
                    continue;
                }
                bounds = Some(match bounds {
                    None => (x, y, x, y),
                    Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
                });
            }
        }

        ctx.meta.roi = bounds.map(|(x0, y0, x1, y1)| {
            Region::new(x0, y0, x1 - x0 + stride, y1 - y0 + stride).clamp_to(&format)
        });
        Ok(())
    }
}

/// Snaps the region of interest outward onto a grid
pub struct AlignStage {
    grid: u32,
}

impl AlignStage {
    pub fn new(grid: u32) -> Self {
        Self { grid }
    }

    pub fn name(&self) -> &str {
        "align"
    }

    pub fn process(&mut self, ctx: &mut StageContext<'_>) -> Result<()> {
        ctx.copy_input()?;
        let format = ctx.format;
        ctx.meta.roi = ctx
            .meta
            .roi
            .map(|roi| roi.snapped(self.grid).clamp_to(&format))
            .filter(|roi| !roi.is_empty());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::QualityState;
    use crate::stage::operation::FrameView;
    use crate::stage::StageId;
    use crate::types::{FrameFormat, FrameMeta, PixelLayout};

    fn run(
        stage: &mut impl FnMut(&mut StageContext<'_>) -> Result<()>,
        input: &[u8],
        input_meta: FrameMeta,
        scale: f32,
    ) -> (Vec<u8>, FrameMeta) {
        let format = FrameFormat::new(8, 8, PixelLayout::Gray8);
        let mut output = vec![0u8; format.byte_size()];
        let mut meta = input_meta;
        let mut ctx = StageContext {
            stage: StageId(1),
            format,
            quality: QualityState::new(scale, 0),
            input: Some(FrameView {
                data: input,
                meta: &input_meta,
            }),
            output: &mut output,
            meta: &mut meta,
        };
        stage(&mut ctx).unwrap();
        (output, meta)
    }

    fn frame_with_block() -> Vec<u8> {
        let mut data = vec![10u8; 64];
        for y in 2..4 {
            for x in 3..6 {
                data[y * 8 + x] = 240;
            }
        }
        data
    }

    #[test]
    fn test_detect_finds_bright_block() {
        let mut detect = DetectStage::new(200);
        let input = frame_with_block();
        let (output, meta) = run(&mut |ctx| detect.process(ctx), &input, FrameMeta::default(), 1.0);
        assert_eq!(output, input);
        assert_eq!(meta.roi, Some(Region::new(3, 2, 3, 2)));
    }

    #[test]
    fn test_detect_nothing_bright() {
        let mut detect = DetectStage::new(200);
        let input = vec![5u8; 64];
        let (_, meta) = run(&mut |ctx| detect.process(ctx), &input, FrameMeta::default(), 1.0);
        assert_eq!(meta.roi, None);
    }

    #[test]
    fn test_detect_coarse_sampling_still_covers_block() {
        let mut detect = DetectStage::new(200);
        let input = frame_with_block();
        let (_, meta) = run(&mut |ctx| detect.process(ctx), &input, FrameMeta::default(), 0.5);
        let roi = meta.roi.unwrap();
        assert!(roi.contains(4, 2));
    }

    #[test]
    fn test_align_snaps_to_grid() {
        let mut align = AlignStage::new(4);
        let input = vec![0u8; 64];
        let mut meta = FrameMeta::default();
        meta.roi = Some(Region::new(3, 2, 3, 2));
        let (_, out) = run(&mut |ctx| align.process(ctx), &input, meta, 1.0);
        assert_eq!(out.roi, Some(Region::new(0, 0, 8, 4)));
    }
}
