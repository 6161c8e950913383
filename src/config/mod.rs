//! Configuration and persisted state for the pipeline core
//!
//! This module handles:
//! - The pipeline configuration file (TOML) describing stages, arena sizing
//!   and every tuning knob
//! - The persisted pipeline state (JSON) written on graceful shutdown and
//!   read back at startup
//!
//! # App Data Location
//!
//! Persisted state lives in the platform data directory:
//! - **Linux**: `~/.local/share/dev.livecore.pipeline/`
//! - **macOS**: `~/Library/Application Support/dev.livecore.pipeline/`
//! - **Windows**: `%APPDATA%\dev.livecore.pipeline\`
//!
//! Setting `LIVECORE_DATA_DIR` overrides the location.
//!
//! # Example
//!
//! ```ignore
//! use livecore::config::{CoreConfig, PersistedState};
//!
//! let config = CoreConfig::load_or_default("livecore.toml");
//! let state = PersistedState::load_or_default();
//! ```

pub mod settings;

pub use settings::*;

use crate::error::{LiveCoreError, Result};
use crate::pattern::PatternKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Application identifier for data directories
pub const APP_ID: &str = "dev.livecore.pipeline";

/// Persisted state filename
pub const STATE_FILE: &str = "pipeline_state.json";

/// Environment variable overriding the data directory
pub const DATA_DIR_ENV: &str = "LIVECORE_DATA_DIR";

/// Current persisted state format version
pub const STATE_VERSION: u32 = 1;

// ==================== App Data Directory ====================

/// Get the application data directory path
pub fn app_data_dir() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
        if !dir.is_empty() {
            return Some(PathBuf::from(dir));
        }
    }
    dirs_next::data_dir().map(|p| p.join(APP_ID))
}

/// Ensure the app data directory exists
pub fn ensure_app_data_dir() -> Result<PathBuf> {
    let dir = app_data_dir().ok_or_else(|| {
        LiveCoreError::Config("Could not determine app data directory".to_string())
    })?;

    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| {
            LiveCoreError::Config(format!("Failed to create app data directory: {}", e))
        })?;
    }

    Ok(dir)
}

/// Get the path to the persisted state file
pub fn state_path() -> Option<PathBuf> {
    app_data_dir().map(|p| p.join(STATE_FILE))
}

// ==================== Stage Configuration ====================

/// Visual effect applied by a transform stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EffectKind {
    #[default]
    Invert,
    Grayscale,
    /// Block size shrinks with the quality scale factor
    Pixelate,
}

/// What a stage does, resolved once when the pipeline is assembled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageKindConfig {
    /// Paced synthetic capture source
    Capture,
    /// Capture source fed by a [`FramePusher`](crate::stage::FramePusher)
    PushCapture {
        #[serde(default = "default_push_capacity")]
        capacity: usize,
    },
    /// Finds the bounding box of bright pixels
    Detect {
        #[serde(default = "default_detect_threshold")]
        threshold: u8,
    },
    /// Snaps the region of interest to a grid
    Align {
        #[serde(default = "default_align_grid")]
        grid: u32,
    },
    /// Applies an effect inside the region of interest
    Transform {
        #[serde(default)]
        effect: EffectKind,
    },
    /// Blends an outline of the region of interest onto the frame
    Merge {
        #[serde(default = "default_merge_opacity")]
        opacity: f32,
    },
    /// Copies input to output unchanged
    Passthrough,
}

fn default_push_capacity() -> usize {
    4
}

fn default_detect_threshold() -> u8 {
    200
}

fn default_align_grid() -> u32 {
    16
}

fn default_merge_opacity() -> f32 {
    0.6
}

impl StageKindConfig {
    /// Whether the stage produces frames instead of reading an upstream channel
    pub fn is_source(&self) -> bool {
        matches!(self, Self::Capture | Self::PushCapture { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Capture => "capture",
            Self::PushCapture { .. } => "push_capture",
            Self::Detect { .. } => "detect",
            Self::Align { .. } => "align",
            Self::Transform { .. } => "transform",
            Self::Merge { .. } => "merge",
            Self::Passthrough => "passthrough",
        }
    }
}

/// One entry of the ordered stage list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,

    pub kind: StageKindConfig,

    /// Declared maximum processing time per frame
    #[serde(default = "default_budget_ms")]
    pub budget_ms: u64,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Extra simulated work per frame, standing in for an opaque model call
    #[serde(default)]
    pub work_ms: u64,
}

fn default_budget_ms() -> u64 {
    20
}

fn default_true() -> bool {
    true
}

impl StageConfig {
    pub fn new(name: impl Into<String>, kind: StageKindConfig) -> Self {
        Self {
            name: name.into(),
            kind,
            budget_ms: default_budget_ms(),
            enabled: true,
            work_ms: 0,
        }
    }

    pub fn with_budget_ms(mut self, budget_ms: u64) -> Self {
        self.budget_ms = budget_ms;
        self
    }

    pub fn with_work_ms(mut self, work_ms: u64) -> Self {
        self.work_ms = work_ms;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// capture -> detect -> align -> transform -> merge
pub fn default_stages() -> Vec<StageConfig> {
    vec![
        StageConfig::new("capture", StageKindConfig::Capture).with_budget_ms(10),
        StageConfig::new(
            "detect",
            StageKindConfig::Detect {
                threshold: default_detect_threshold(),
            },
        ),
        StageConfig::new(
            "align",
            StageKindConfig::Align {
                grid: default_align_grid(),
            },
        )
        .with_budget_ms(5),
        StageConfig::new(
            "transform",
            StageKindConfig::Transform {
                effect: EffectKind::Invert,
            },
        ),
        StageConfig::new(
            "merge",
            StageKindConfig::Merge {
                opacity: default_merge_opacity(),
            },
        )
        .with_budget_ms(10),
    ]
}

// ==================== Loopback Source Configuration ====================

/// Where a loopback source gets its frames from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopbackKind {
    /// Directory of raw frame files played in name order
    FileSequence { dir: PathBuf },
    /// A single raw frame file
    StaticImage { path: PathBuf },
    /// Rendered pattern; cannot fail
    Pattern {
        #[serde(default)]
        pattern: PatternKind,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopbackSourceConfig {
    pub id: String,

    pub kind: LoopbackKind,

    /// Higher wins; ties go to the earlier registration
    #[serde(default)]
    pub priority: i32,

    /// Restart from the first frame after the last one
    #[serde(default = "default_true", rename = "loop")]
    pub loop_playback: bool,

    /// Playback rate of sequences and patterns
    #[serde(default = "default_loopback_fps")]
    pub fps: u32,
}

fn default_loopback_fps() -> u32 {
    30
}

impl LoopbackSourceConfig {
    pub fn new(id: impl Into<String>, kind: LoopbackKind, priority: i32) -> Self {
        Self {
            id: id.into(),
            kind,
            priority,
            loop_playback: true,
            fps: default_loopback_fps(),
        }
    }
}

// ==================== Core Configuration ====================

/// Complete pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub arena: ArenaSettings,
    pub capture: CaptureSettings,
    pub supervisor: SupervisorSettings,
    pub monitor: MonitorSettings,
    pub quality: QualitySettings,
    pub fallback: FallbackSettings,
    pub stages: Vec<StageConfig>,
    pub loopback_sources: Vec<LoopbackSourceConfig>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            arena: ArenaSettings::default(),
            capture: CaptureSettings::default(),
            supervisor: SupervisorSettings::default(),
            monitor: MonitorSettings::default(),
            quality: QualitySettings::default(),
            fallback: FallbackSettings::default(),
            stages: default_stages(),
            loopback_sources: Vec::new(),
        }
    }
}

impl CoreConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: CoreConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            LiveCoreError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        Self::from_toml_str(&content).map_err(|e| e.with_context(format!("{:?}", path)))
    }

    /// Load a configuration file, returning defaults if any error occurs
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save the configuration as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    LiveCoreError::Config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| LiveCoreError::Serialization(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content).map_err(|e| {
            LiveCoreError::Config(format!("Failed to write config file {:?}: {}", path, e))
        })
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.arena.slots_per_channel < MIN_SLOTS_PER_CHANNEL {
            return Err(LiveCoreError::Config(format!(
                "arena needs at least {} slots per channel (got {})",
                MIN_SLOTS_PER_CHANNEL, self.arena.slots_per_channel
            )));
        }
        if !self.arena.format.is_valid() {
            return Err(LiveCoreError::Config(format!(
                "invalid frame format {}",
                self.arena.format
            )));
        }
        if self.monitor.target_fps <= 0.0 {
            return Err(LiveCoreError::Config(
                "monitor target_fps must be positive".to_string(),
            ));
        }
        if self.supervisor.max_attempts == 0 {
            return Err(LiveCoreError::Config(
                "supervisor max_attempts must be at least 1".to_string(),
            ));
        }
        self.quality.validate()?;

        let Some(first) = self.stages.first() else {
            return Err(LiveCoreError::Config("no stages configured".to_string()));
        };
        if !first.kind.is_source() {
            return Err(LiveCoreError::Config(format!(
                "first stage '{}' must be a capture stage",
                first.name
            )));
        }

        let mut names = HashSet::new();
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err(LiveCoreError::Config("stage name is empty".to_string()));
            }
            if !names.insert(stage.name.as_str()) {
                return Err(LiveCoreError::Config(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
            if stage.budget_ms == 0 {
                return Err(LiveCoreError::Config(format!(
                    "stage '{}' has a zero budget",
                    stage.name
                )));
            }
        }
        if let Some(extra) = self.stages.iter().skip(1).find(|s| s.kind.is_source()) {
            return Err(LiveCoreError::Config(format!(
                "capture stage '{}' must come first",
                extra.name
            )));
        }

        let mut ids = HashSet::new();
        for source in &self.loopback_sources {
            if !ids.insert(source.id.as_str()) {
                return Err(LiveCoreError::Config(format!(
                    "duplicate loopback source id '{}'",
                    source.id
                )));
            }
        }

        Ok(())
    }
}

// ==================== Persisted State ====================

/// What survives a restart: the quality knob and per-stage enabled flags
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default = "default_state_version")]
    pub version: u32,

    /// Last automatic quality scale factor
    pub quality_scale: f32,

    /// Last automatic frame-skip interval
    #[serde(default)]
    pub frame_skip: u32,

    /// Enabled flags keyed by stage name
    #[serde(default)]
    pub stages: BTreeMap<String, bool>,

    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
}

fn default_state_version() -> u32 {
    STATE_VERSION
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            quality_scale: 1.0,
            frame_skip: 0,
            stages: BTreeMap::new(),
            saved_at: None,
        }
    }
}

impl PersistedState {
    /// Enabled flag for `stage`, if one was saved
    pub fn stage_enabled(&self, stage: &str) -> Option<bool> {
        self.stages.get(stage).copied()
    }

    /// Load from the default location
    pub fn load() -> Result<Self> {
        let path = state_path().ok_or_else(|| {
            LiveCoreError::Config("Could not determine state path".to_string())
        })?;
        Self::load_from(path)
    }

    /// Load from `path`; a missing file yields defaults
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| LiveCoreError::Config(format!("Failed to read state {:?}: {}", path, e)))?;

        let state: PersistedState = serde_json::from_str(&content).map_err(|e| {
            LiveCoreError::Serialization(format!("Failed to parse state {:?}: {}", path, e))
        })?;

        if state.version > STATE_VERSION {
            return Err(LiveCoreError::Config(format!(
                "state version {} is newer than supported version {}",
                state.version, STATE_VERSION
            )));
        }
        Ok(state)
    }

    /// Load state, returning defaults on any error
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_else(|e| {
            tracing::warn!("Failed to load pipeline state, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save to the default location, stamping `saved_at`
    pub fn save(&mut self) -> Result<()> {
        let dir = ensure_app_data_dir()?;
        self.save_to(dir.join(STATE_FILE))
    }

    /// Save to `path`, stamping `saved_at`
    pub fn save_to(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.version = STATE_VERSION;
        self.saved_at = Some(Utc::now());

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    LiveCoreError::Config(format!("Failed to create state directory: {}", e))
                })?;
            }
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .map_err(|e| LiveCoreError::Config(format!("Failed to write state {:?}: {}", path, e)))?;

        tracing::debug!("Pipeline state saved to {:?}", path);
        Ok(())
    }
}
