//! End-to-end: spawned pipeline driven through its control surface

mod common;

use common::builders::{pattern_loopback, ConfigBuilder};
use common::{test_format, test_timeout, wait_until};
use livecore::config::StageKindConfig;
use livecore::{
    FallbackState, FrameOrigin, LiveCoreError, PipelineBuilder, PipelineHandle, StageConfig,
};
use std::time::Duration;

fn spawn_default() -> PipelineHandle {
    let config = ConfigBuilder::new()
        .loopback(pattern_loopback("bars", 1))
        .build();
    PipelineBuilder::new(config).build().unwrap().spawn().unwrap()
}

fn output_is_live(handle: &PipelineHandle) -> bool {
    handle
        .get_current_output_frame()
        .is_ok_and(|frame| frame.origin.is_live())
}

#[test]
fn test_output_starts_live() {
    let handle = spawn_default();
    assert!(wait_until(test_timeout(), || output_is_live(&handle)));

    let frame = handle.get_current_output_frame().unwrap();
    assert_eq!(frame.size(), test_format().byte_size());
    assert!(wait_until(test_timeout(), || handle.get_pipeline_status().fps > 0.0));

    let status = handle.get_pipeline_status();
    assert_eq!(status.stages.len(), 2);
    assert_eq!(status.fallback.state, FallbackState::MainActive);
    assert!(status.to_string().contains("fps"));
    handle.shutdown().unwrap();
}

#[test]
fn test_disabling_capture_falls_back_then_recovers() {
    let handle = spawn_default();
    assert!(wait_until(test_timeout(), || output_is_live(&handle)));

    handle.set_stage_enabled("capture", false).unwrap();
    assert!(wait_until(test_timeout(), || {
        handle.get_pipeline_status().fallback.state == FallbackState::FallbackActive
    }));
    let frame = handle.get_current_output_frame().unwrap();
    assert_eq!(
        frame.origin,
        FrameOrigin::Fallback {
            source_id: "bars".to_string()
        }
    );
    assert_eq!(
        handle.get_pipeline_status().fallback.active_source.as_deref(),
        Some("bars")
    );

    handle.set_stage_enabled("capture", true).unwrap();
    assert!(wait_until(test_timeout(), || {
        handle.get_pipeline_status().fallback.state == FallbackState::MainActive
    }));
    assert!(wait_until(test_timeout(), || output_is_live(&handle)));

    let state = handle.shutdown().unwrap();
    assert_eq!(state.stage_enabled("capture"), Some(true));
}

#[test]
fn test_control_errors_are_reported() {
    let handle = spawn_default();

    assert!(matches!(
        handle.set_stage_enabled("nope", false),
        Err(LiveCoreError::UnknownStage(_))
    ));
    assert!(matches!(
        handle.restart_stage("nope"),
        Err(LiveCoreError::UnknownStage(_))
    ));
    assert!(handle
        .register_loopback_source(pattern_loopback("bars", 9))
        .is_err());
    assert!(handle
        .register_loopback_source(pattern_loopback("late", 9))
        .is_ok());
    handle.shutdown().unwrap();
}

#[test]
fn test_quality_override_reaches_status() {
    let handle = spawn_default();

    handle.set_quality_override(Some(0.5)).unwrap();
    assert!(wait_until(test_timeout(), || {
        let quality = handle.get_pipeline_status().quality;
        quality.overridden && quality.published.scale == 0.5
    }));

    handle.set_quality_override(None).unwrap();
    assert!(wait_until(test_timeout(), || {
        !handle.get_pipeline_status().quality.overridden
    }));
    handle.shutdown().unwrap();
}

#[test]
fn test_pushed_frames_reach_output() {
    let config = ConfigBuilder::new()
        .stage(StageConfig::new("push", StageKindConfig::PushCapture { capacity: 4 }).with_budget_ms(20))
        .stage(StageConfig::new("relay", StageKindConfig::Passthrough).with_budget_ms(20))
        .build();
    let handle = PipelineBuilder::new(config).build().unwrap().spawn().unwrap();
    let format = test_format();

    let pusher = handle.pusher().expect("push capture exposes a pusher");
    assert_eq!(pusher.format(), format);
    assert!(wait_until(test_timeout(), || {
        let _ = pusher.push(vec![42u8; format.byte_size()]);
        handle
            .get_current_output_frame()
            .is_ok_and(|f| f.origin.is_live() && f.data.iter().all(|&b| b == 42))
    }));

    // Wrong-sized frames are refused at the producer
    assert!(pusher.push(vec![0u8; 3]).is_err());
    handle.shutdown().unwrap();
}

#[test]
fn test_restart_stage_through_handle() {
    let handle = spawn_default();
    assert!(wait_until(test_timeout(), || output_is_live(&handle)));

    handle.restart_stage("relay").unwrap();
    assert!(wait_until(test_timeout(), || {
        handle
            .get_pipeline_status()
            .stages
            .iter()
            .any(|s| s.name == "relay" && s.restarts == 1 && s.state.is_active())
    }));
    std::thread::sleep(Duration::from_millis(50));
    assert!(output_is_live(&handle));
    handle.shutdown().unwrap();
}
