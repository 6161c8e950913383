//! Deterministic synthetic frame patterns.
//!
//! Used by the synthetic capture source and by the last-resort loopback
//! source. Rendering writes every byte of the target buffer and has no
//! failure path, which is what lets the fallback chain bottom out here.

use crate::types::{FrameFormat, PixelLayout};
use serde::{Deserialize, Serialize};

/// Which pattern to render
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    /// Eight vertical SMPTE-style bars
    #[default]
    ColorBars,
    /// Horizontal gradient that scrolls with `phase`
    Gradient,
    /// 32px checkerboard that inverts every 30 phases
    Checkerboard,
    /// Dark background with a bright square bouncing across it
    MovingBlock,
}

const BARS: [[u8; 3]; 8] = [
    [235, 235, 235],
    [235, 235, 16],
    [16, 235, 235],
    [16, 235, 16],
    [235, 16, 235],
    [235, 16, 16],
    [16, 16, 235],
    [16, 16, 16],
];

/// Render `kind` at animation step `phase` into `out`.
///
/// Only `min(out.len(), format.byte_size())` bytes are touched.
pub fn render(kind: PatternKind, format: &FrameFormat, phase: u64, out: &mut [u8]) {
    let bpp = format.layout.bytes_per_pixel();
    let width = format.width.max(1);
    let height = format.height.max(1);
    let block = moving_block(format, phase);

    for (i, px) in out
        .chunks_exact_mut(bpp)
        .take(format.width as usize * format.height as usize)
        .enumerate()
    {
        let x = (i % width as usize) as u32;
        let y = (i / width as usize) as u32;
        let rgb = match kind {
            PatternKind::ColorBars => BARS[(x as usize * BARS.len()) / width as usize],
            PatternKind::Gradient => {
                let v = ((x as u64 * 255 / width as u64 + phase * 4) % 256) as u8;
                let w = (y as u64 * 255 / height as u64) as u8;
                [v, w, 255 - v]
            }
            PatternKind::Checkerboard => {
                let flip = (phase / 30) % 2 == 1;
                let on = ((x / 32) + (y / 32)) % 2 == 0;
                if on ^ flip {
                    [220, 220, 220]
                } else {
                    [30, 30, 30]
                }
            }
            PatternKind::MovingBlock => {
                if block.contains(x, y) {
                    [250, 250, 250]
                } else {
                    let v = (16 + (y * 48 / height)) as u8;
                    [v, v, v + 8]
                }
            }
        };
        write_rgb(format.layout, rgb, px);
    }
}

/// Where the bright square of [`PatternKind::MovingBlock`] sits at `phase`
pub fn moving_block(format: &FrameFormat, phase: u64) -> crate::types::Region {
    let size = (format.width.min(format.height) / 4).max(1);
    let span_x = format.width.saturating_sub(size).max(1) as u64;
    let span_y = format.height.saturating_sub(size).max(1) as u64;
    let bounce = |p: u64, span: u64| {
        let t = p % (span * 2);
        if t < span {
            t
        } else {
            span * 2 - t
        }
    };
    crate::types::Region::new(
        bounce(phase * 3, span_x) as u32,
        bounce(phase * 2, span_y) as u32,
        size,
        size,
    )
}

#[inline]
pub(crate) fn write_rgb(layout: PixelLayout, rgb: [u8; 3], px: &mut [u8]) {
    match layout {
        PixelLayout::Gray8 => px[0] = PixelLayout::Rgb8.luma(&rgb),
        PixelLayout::Rgb8 => px.copy_from_slice(&rgb),
        PixelLayout::Rgba8 => {
            px[..3].copy_from_slice(&rgb);
            px[3] = 255;
        }
        PixelLayout::Bgra8 => {
            px[0] = rgb[2];
            px[1] = rgb[1];
            px[2] = rgb[0];
            px[3] = 255;
        }
    }
}
