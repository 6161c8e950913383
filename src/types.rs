//! Core frame types for livecore
//!
//! This module contains the data structures describing what flows through
//! the pipeline: the negotiated frame shape, per-frame metadata, and the
//! owned [`Frame`] handed to the output sink.
//!
//! # Main Types
//!
//! - [`PixelLayout`] - Byte layout of one pixel
//! - [`FrameFormat`] - Width/height/layout negotiated once at pipeline start
//! - [`Region`] - Axis-aligned rectangle in pixel coordinates
//! - [`FrameMeta`] - Metadata travelling alongside each published slot
//! - [`Frame`] - Immutable frame as seen by the output sink
//!
//! # Memory Management
//!
//! Frames inside the pipeline live in arena slots and are never copied on
//! handoff. Only the output boundary materialises a [`Frame`], backed by a
//! reference-counted [`Bytes`] buffer so the sink can hold it as long as it
//! likes without pinning a slot.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Byte layout of a single pixel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PixelLayout {
    /// 8-bit luminance
    Gray8,
    /// 8-bit red, green, blue
    Rgb8,
    /// 8-bit red, green, blue, alpha
    #[default]
    Rgba8,
    /// 8-bit blue, green, red, alpha
    Bgra8,
}

impl PixelLayout {
    /// Bytes per pixel for this layout
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelLayout::Gray8 => 1,
            PixelLayout::Rgb8 => 3,
            PixelLayout::Rgba8 | PixelLayout::Bgra8 => 4,
        }
    }

    /// Approximate luminance of the pixel starting at `px`.
    ///
    /// `px` must hold at least [`bytes_per_pixel`](Self::bytes_per_pixel) bytes.
    pub fn luma(&self, px: &[u8]) -> u8 {
        let (r, g, b) = match self {
            PixelLayout::Gray8 => return px[0],
            PixelLayout::Rgb8 | PixelLayout::Rgba8 => (px[0], px[1], px[2]),
            PixelLayout::Bgra8 => (px[2], px[1], px[0]),
        };
        ((r as u32 * 77 + g as u32 * 150 + b as u32 * 29) >> 8) as u8
    }
}

impl std::fmt::Display for PixelLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PixelLayout::Gray8 => write!(f, "gray8"),
            PixelLayout::Rgb8 => write!(f, "rgb8"),
            PixelLayout::Rgba8 => write!(f, "rgba8"),
            PixelLayout::Bgra8 => write!(f, "bgra8"),
        }
    }
}

/// Shape of every frame in a pipeline, fixed for the pipeline's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameFormat {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub layout: PixelLayout,
}

impl Default for FrameFormat {
    fn default() -> Self {
        Self {
            width: 640,
            height: 360,
            layout: PixelLayout::Rgba8,
        }
    }
}

impl FrameFormat {
    pub fn new(width: u32, height: u32, layout: PixelLayout) -> Self {
        Self {
            width,
            height,
            layout,
        }
    }

    /// Bytes in one row
    #[inline]
    pub fn stride(&self) -> usize {
        self.width as usize * self.layout.bytes_per_pixel()
    }

    /// Bytes in one full frame
    #[inline]
    pub fn byte_size(&self) -> usize {
        self.stride() * self.height as usize
    }

    /// Byte offset of pixel (x, y)
    #[inline]
    pub fn offset(&self, x: u32, y: u32) -> usize {
        y as usize * self.stride() + x as usize * self.layout.bytes_per_pixel()
    }

    /// The whole frame as a region
    pub fn full_region(&self) -> Region {
        Region::new(0, 0, self.width, self.height)
    }

    /// Whether the format describes a non-empty frame
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

impl std::fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.layout)
    }
}

/// Axis-aligned rectangle in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Exclusive right edge
    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    /// Exclusive bottom edge
    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    /// Intersect with the bounds of `format`
    pub fn clamp_to(&self, format: &FrameFormat) -> Region {
        let x = self.x.min(format.width);
        let y = self.y.min(format.height);
        let right = self.right().min(format.width);
        let bottom = self.bottom().min(format.height);
        Region::new(x, y, right - x, bottom - y)
    }

    /// Expand outward so every edge lands on a multiple of `grid`
    pub fn snapped(&self, grid: u32) -> Region {
        if grid <= 1 {
            return *self;
        }
        let x = self.x - self.x % grid;
        let y = self.y - self.y % grid;
        let right = self.right().div_ceil(grid) * grid;
        let bottom = self.bottom().div_ceil(grid) * grid;
        Region::new(x, y, right - x, bottom - y)
    }
}

/// Metadata travelling alongside a frame through the pipeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameMeta {
    /// Capture sequence number, assigned by the source stage
    pub sequence: u64,
    /// When the source stage produced the frame
    pub captured_at: Instant,
    /// Quality scale factor the frame was last processed at
    pub scale: f32,
    /// Region of interest found by detection, if any
    pub roi: Option<Region>,
}

impl FrameMeta {
    pub fn new(sequence: u64, captured_at: Instant) -> Self {
        Self {
            sequence,
            captured_at,
            scale: 1.0,
            roi: None,
        }
    }
}

impl Default for FrameMeta {
    fn default() -> Self {
        Self::new(0, Instant::now())
    }
}

/// Where an output frame came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOrigin {
    /// The live pipeline's terminal channel at the given generation
    Live { generation: u64 },
    /// A loopback source
    Fallback { source_id: String },
    /// A blend produced while cross-fading between two outputs
    Transition { from: String, to: String },
}

impl FrameOrigin {
    pub fn is_live(&self) -> bool {
        matches!(self, FrameOrigin::Live { .. })
    }
}

impl std::fmt::Display for FrameOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameOrigin::Live { generation } => write!(f, "live@{}", generation),
            FrameOrigin::Fallback { source_id } => write!(f, "fallback:{}", source_id),
            FrameOrigin::Transition { from, to } => write!(f, "{} -> {}", from, to),
        }
    }
}

/// An immutable frame as handed to the output sink
#[derive(Clone)]
pub struct Frame {
    pub format: FrameFormat,
    pub meta: FrameMeta,
    pub origin: FrameOrigin,
    pub data: Bytes,
}

impl Frame {
    pub fn new(format: FrameFormat, meta: FrameMeta, origin: FrameOrigin, data: Bytes) -> Self {
        Self {
            format,
            meta,
            origin,
            data,
        }
    }

    /// Size of the pixel data in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("format", &self.format)
            .field("sequence", &self.meta.sequence)
            .field("origin", &self.origin)
            .field("size", &self.size())
            .finish()
    }
}
