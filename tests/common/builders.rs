//! Test data builders for creating test objects

use super::test_format;
use livecore::config::{
    EffectKind, FallbackSettings, QualitySettings, StageKindConfig, TransitionMode,
};
use livecore::{CoreConfig, FrameFormat, LoopbackKind, LoopbackSourceConfig, StageConfig};
use std::path::Path;

/// Builder for pipeline configurations with test-friendly timings.
///
/// Defaults to a two stage chain, `capture -> relay`, at 100 fps with
/// fallback and supervisor timings shrunk to tens of milliseconds.
pub struct ConfigBuilder {
    config: CoreConfig,
    stages: Vec<StageConfig>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        let mut config = CoreConfig::default();
        config.arena.format = test_format();
        config.arena.slots_per_channel = 3;
        config.capture.fps = 100;
        config.supervisor.backoff_initial_ms = 5;
        config.supervisor.backoff_max_ms = 20;
        config.supervisor.hang_timeout_ms = 300;
        config.supervisor.stop_grace_ms = 300;
        config.supervisor.tick_ms = 5;
        config.monitor.target_fps = 100.0;
        config.monitor.window_ms = 200;
        config.fallback = FallbackSettings {
            detection_timeout_ms: 150,
            suspect_after_ms: 40,
            recovery_delay_ms: 150,
            check_interval_ms: 5,
            transition: TransitionMode::Immediate,
        };
        Self {
            config,
            stages: Vec::new(),
        }
    }

    pub fn format(mut self, format: FrameFormat) -> Self {
        self.config.arena.format = format;
        self
    }

    pub fn slots(mut self, slots: usize) -> Self {
        self.config.arena.slots_per_channel = slots;
        self
    }

    pub fn capture_fps(mut self, fps: u32) -> Self {
        self.config.capture.fps = fps;
        self
    }

    pub fn stage(mut self, stage: StageConfig) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn fallback(mut self, settings: FallbackSettings) -> Self {
        self.config.fallback = settings;
        self
    }

    pub fn transition(mut self, mode: TransitionMode) -> Self {
        self.config.fallback.transition = mode;
        self
    }

    pub fn quality(mut self, settings: QualitySettings) -> Self {
        self.config.quality = settings;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.supervisor.max_attempts = attempts;
        self
    }

    pub fn loopback(mut self, source: LoopbackSourceConfig) -> Self {
        self.config.loopback_sources.push(source);
        self
    }

    pub fn build(mut self) -> CoreConfig {
        self.config.stages = if self.stages.is_empty() {
            vec![
                capture_stage("capture"),
                StageConfig::new("relay", StageKindConfig::Passthrough),
            ]
        } else {
            self.stages
        };
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub fn capture_stage(name: &str) -> StageConfig {
    StageConfig::new(name, StageKindConfig::Capture).with_budget_ms(20)
}

pub fn transform_stage(name: &str, effect: EffectKind) -> StageConfig {
    StageConfig::new(name, StageKindConfig::Transform { effect }).with_budget_ms(20)
}

pub fn pattern_loopback(id: &str, priority: i32) -> LoopbackSourceConfig {
    LoopbackSourceConfig::new(
        id,
        LoopbackKind::Pattern {
            pattern: Default::default(),
        },
        priority,
    )
}

pub fn file_sequence_loopback(id: &str, dir: &Path, priority: i32) -> LoopbackSourceConfig {
    LoopbackSourceConfig::new(
        id,
        LoopbackKind::FileSequence {
            dir: dir.to_path_buf(),
        },
        priority,
    )
}

pub fn static_image_loopback(id: &str, path: &Path, priority: i32) -> LoopbackSourceConfig {
    LoopbackSourceConfig::new(
        id,
        LoopbackKind::StaticImage {
            path: path.to_path_buf(),
        },
        priority,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .slots(2)
            .stage(capture_stage("cam"))
            .stage(transform_stage("fx", EffectKind::Invert))
            .loopback(pattern_loopback("bars", 1))
            .build();

        assert_eq!(config.arena.slots_per_channel, 2);
        assert_eq!(config.stages.len(), 2);
        assert_eq!(config.stages[1].name, "fx");
        assert_eq!(config.loopback_sources[0].id, "bars");
        assert!(config.validate().is_ok());
    }
}
