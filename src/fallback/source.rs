//! Loopback sources the fallback manager can substitute for live output.

use crate::config::{LoopbackKind, LoopbackSourceConfig};
use crate::error::{LiveCoreError, Result};
use crate::pattern::{self, PatternKind};
use crate::types::FrameFormat;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// A provider of substitute frames.
///
/// `open` is called each time the source is selected; `frame` is then
/// polled for every output frame while it stays active. Returning an error
/// from either makes the manager fall through to the next source.
#[cfg_attr(test, mockall::automock)]
pub trait LoopbackSource: Send {
    fn describe(&self) -> String;

    /// Cheap liveness check of the underlying provider
    fn is_healthy(&self) -> bool;

    fn open(&mut self, format: FrameFormat, now: Instant) -> Result<()>;

    /// Frame to show at `now`
    fn frame(&mut self, now: Instant) -> Result<Bytes>;
}

/// Build the source a config entry describes
pub fn from_config(config: &LoopbackSourceConfig) -> Box<dyn LoopbackSource> {
    match &config.kind {
        LoopbackKind::FileSequence { dir } => Box::new(FileSequenceSource::new(
            &config.id,
            dir,
            config.fps,
            config.loop_playback,
        )),
        LoopbackKind::StaticImage { path } => Box::new(StaticImageSource::new(&config.id, path)),
        LoopbackKind::Pattern { pattern } => {
            Box::new(PatternSource::new(&config.id, *pattern, config.fps))
        }
    }
}

/// Index of the frame due `elapsed` after playback began
fn frame_index(elapsed: Duration, fps: u32, len: usize, looping: bool) -> usize {
    if len == 0 {
        return 0;
    }
    let index = (elapsed.as_secs_f64() * fps.max(1) as f64) as usize;
    if looping {
        index % len
    } else {
        index.min(len - 1)
    }
}

fn read_raw_frame(id: &str, path: &Path, format: &FrameFormat) -> Result<Bytes> {
    let data = std::fs::read(path).map_err(|e| LiveCoreError::SourceUnavailable {
        source_id: id.to_string(),
        reason: format!("failed to read {}: {}", path.display(), e),
    })?;
    if data.len() != format.byte_size() {
        return Err(LiveCoreError::SourceUnavailable {
            source_id: id.to_string(),
            reason: LiveCoreError::FormatMismatch {
                expected: format.byte_size(),
                actual: data.len(),
            }
            .to_string(),
        });
    }
    Ok(Bytes::from(data))
}

// ==================== File Sequence ====================

/// Directory of raw frames, played back in file name order.
///
/// The whole sequence is read on `open`, so serving frames never touches
/// the disk while the manager lock is held.
pub struct FileSequenceSource {
    id: String,
    dir: PathBuf,
    fps: u32,
    looping: bool,
    frames: Vec<Bytes>,
    opened_at: Option<Instant>,
}

impl FileSequenceSource {
    pub fn new(id: &str, dir: impl Into<PathBuf>, fps: u32, looping: bool) -> Self {
        Self {
            id: id.to_string(),
            dir: dir.into(),
            fps,
            looping,
            frames: Vec::new(),
            opened_at: None,
        }
    }

    fn unavailable(&self, reason: String) -> LiveCoreError {
        LiveCoreError::SourceUnavailable {
            source_id: self.id.clone(),
            reason,
        }
    }
}

impl LoopbackSource for FileSequenceSource {
    fn describe(&self) -> String {
        format!("file sequence {} ({} frames)", self.dir.display(), self.frames.len())
    }

    // Failures during an episode are tracked by the manager; a failed
    // read does not make the directory itself unhealthy
    fn is_healthy(&self) -> bool {
        self.dir.is_dir()
    }

    fn open(&mut self, format: FrameFormat, now: Instant) -> Result<()> {
        self.frames.clear();
        self.opened_at = None;

        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| self.unavailable(format!("cannot list {}: {}", self.dir.display(), e)))?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .collect();
        files.sort();
        if files.is_empty() {
            return Err(self.unavailable(format!("{} holds no frames", self.dir.display())));
        }

        let frames = files
            .iter()
            .map(|path| read_raw_frame(&self.id, path, &format))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            "Loopback '{}' loaded {} frames from {}",
            self.id,
            frames.len(),
            self.dir.display()
        );
        self.frames = frames;
        self.opened_at = Some(now);
        Ok(())
    }

    fn frame(&mut self, now: Instant) -> Result<Bytes> {
        let Some(opened_at) = self.opened_at else {
            return Err(self.unavailable("not opened".to_string()));
        };
        let index = frame_index(
            now.saturating_duration_since(opened_at),
            self.fps,
            self.frames.len(),
            self.looping,
        );
        Ok(self.frames[index].clone())
    }
}

// ==================== Static Image ====================

/// A single raw frame shown indefinitely
pub struct StaticImageSource {
    id: String,
    path: PathBuf,
    data: Option<Bytes>,
}

impl StaticImageSource {
    pub fn new(id: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.to_string(),
            path: path.into(),
            data: None,
        }
    }
}

impl LoopbackSource for StaticImageSource {
    fn describe(&self) -> String {
        format!("static image {}", self.path.display())
    }

    fn is_healthy(&self) -> bool {
        self.path.is_file()
    }

    fn open(&mut self, format: FrameFormat, _now: Instant) -> Result<()> {
        self.data = None;
        let data = read_raw_frame(&self.id, &self.path, &format)?;
        self.data = Some(data);
        Ok(())
    }

    fn frame(&mut self, _now: Instant) -> Result<Bytes> {
        self.data
            .clone()
            .ok_or_else(|| LiveCoreError::SourceUnavailable {
                source_id: self.id.clone(),
                reason: "not opened".to_string(),
            })
    }
}

// ==================== Pattern ====================

/// Synthetic pattern; the only source that cannot fail once opened
pub struct PatternSource {
    id: String,
    pattern: PatternKind,
    fps: u32,
    format: Option<FrameFormat>,
    opened_at: Option<Instant>,
    buffer: Vec<u8>,
}

impl PatternSource {
    pub fn new(id: &str, pattern: PatternKind, fps: u32) -> Self {
        Self {
            id: id.to_string(),
            pattern,
            fps,
            format: None,
            opened_at: None,
            buffer: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl LoopbackSource for PatternSource {
    fn describe(&self) -> String {
        format!("{:?} pattern at {} fps", self.pattern, self.fps)
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn open(&mut self, format: FrameFormat, now: Instant) -> Result<()> {
        if !format.is_valid() {
            return Err(LiveCoreError::SourceUnavailable {
                source_id: self.id.clone(),
                reason: format!("invalid frame format {:?}", format),
            });
        }
        self.buffer = vec![0; format.byte_size()];
        self.format = Some(format);
        self.opened_at.get_or_insert(now);
        Ok(())
    }

    fn frame(&mut self, now: Instant) -> Result<Bytes> {
        let (Some(format), Some(opened_at)) = (self.format, self.opened_at) else {
            return Err(LiveCoreError::SourceUnavailable {
                source_id: self.id.clone(),
                reason: "not opened".to_string(),
            });
        };
        let phase = (now.saturating_duration_since(opened_at).as_secs_f64() * self.fps.max(1) as f64)
            as u64;
        pattern::render(self.pattern, &format, phase, &mut self.buffer);
        Ok(Bytes::copy_from_slice(&self.buffer))
    }
}
