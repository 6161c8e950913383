//! Effect stage: applies a visual effect inside the region of interest.

use super::{color_bytes, for_each_pixel};
use crate::config::EffectKind;
use crate::error::Result;
use crate::stage::operation::StageContext;
use crate::types::Region;

/// Block edge of the pixelate effect at full scale
const PIXELATE_BASE: f32 = 6.0;

pub struct TransformStage {
    effect: EffectKind,
}

impl TransformStage {
    pub fn new(effect: EffectKind) -> Self {
        Self { effect }
    }

    pub fn name(&self) -> &str {
        "transform"
    }

    pub fn process(&mut self, ctx: &mut StageContext<'_>) -> Result<()> {
        ctx.copy_input()?;
        let format = ctx.format;
        let region = ctx.meta.roi.unwrap_or_else(|| format.full_region());
        let colors = color_bytes(&format);
        let layout = format.layout;

        match self.effect {
            EffectKind::Invert => for_each_pixel(&format, region, ctx.output, |_, _, px| {
                for c in px.iter_mut().take(colors) {
                    *c = 255 - *c;
                }
            }),
            EffectKind::Grayscale => for_each_pixel(&format, region, ctx.output, |_, _, px| {
                let y = layout.luma(px);
                px.iter_mut().take(colors).for_each(|c| *c = y);
            }),
            EffectKind::Pixelate => {
                let block = (PIXELATE_BASE / ctx.quality.scale.max(0.05)).round() as u32;
                pixelate(ctx, region, block.clamp(2, 64));
            }
        }
        Ok(())
    }
}

/// Flood each `block`-sized cell with the colour of its top-left pixel
fn pixelate(ctx: &mut StageContext<'_>, region: Region, block: u32) {
    let format = ctx.format;
    let bpp = format.layout.bytes_per_pixel();
    let region = region.clamp_to(&format);
    let out = &mut *ctx.output;

    let mut cell_y = region.y;
    while cell_y < region.bottom() {
        let mut cell_x = region.x;
        while cell_x < region.right() {
            let anchor = format.offset(cell_x, cell_y);
            let Some(src) = out.get(anchor..anchor + bpp) else {
                return;
            };
            let mut color = [0u8; 4];
            color[..bpp].copy_from_slice(src);

            let cell = Region::new(cell_x, cell_y, block, block);
            let clipped = Region::new(
                cell.x,
                cell.y,
                cell.right().min(region.right()) - cell.x,
                cell.bottom().min(region.bottom()) - cell.y,
            );
            for_each_pixel(&format, clipped, out, |_, _, px| {
                px.copy_from_slice(&color[..bpp]);
            });
            cell_x += block;
        }
        cell_y += block;
    }
}
