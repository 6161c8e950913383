//! Fallback manager against real loopback sources on disk

mod common;

use common::builders::{file_sequence_loopback, static_image_loopback};
use common::mock_helpers::{write_frame_sequence, write_static_frame, ScriptedSource};
use common::test_format;
use livecore::config::{FallbackSettings, TransitionMode};
use livecore::fallback::LAST_RESORT_ID;
use livecore::{FallbackManager, FallbackState, FrameOrigin, StageChannel};
use std::time::{Duration, Instant};

fn settings(transition: TransitionMode) -> FallbackSettings {
    FallbackSettings {
        detection_timeout_ms: 150,
        suspect_after_ms: 40,
        recovery_delay_ms: 150,
        check_interval_ms: 5,
        transition,
    }
}

fn publish(channel: &StageChannel, fill: u8) -> u64 {
    let writer = channel.claim_writer();
    let mut slot = writer.acquire_write_slot().unwrap();
    slot.data_mut().fill(fill);
    writer.publish(slot).unwrap()
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn source_of(origin: &FrameOrigin) -> Option<&str> {
    match origin {
        FrameOrigin::Fallback { source_id } => Some(source_id.as_str()),
        _ => None,
    }
}

#[test]
fn test_priority_fail_over_and_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let format = test_format();
    let sequence_dir = dir.path().join("sequence");
    std::fs::create_dir(&sequence_dir).unwrap();
    let frames = write_frame_sequence(&sequence_dir, format, 3);
    let still = dir.path().join("still.raw");
    write_static_frame(&still, format, 77);

    let live = StageChannel::new("final", format, 2).unwrap();
    let mut manager = FallbackManager::new(settings(TransitionMode::Immediate), live.clone()).unwrap();
    manager.register(&static_image_loopback("still", &still, 5)).unwrap();
    manager
        .register(&file_sequence_loopback("sequence", &sequence_dir, 10))
        .unwrap();

    publish(&live, 200);
    let t0 = Instant::now();
    assert_eq!(manager.tick(t0), FallbackState::MainActive);
    let frame = manager.get_current_output_frame(t0).unwrap();
    assert!(frame.origin.is_live());
    assert!(frame.data.iter().all(|&b| b == 200));

    // Suspected, still showing the last live frame
    assert_eq!(manager.tick(t0 + ms(60)), FallbackState::Detecting);
    assert!(manager.get_current_output_frame(t0 + ms(60)).unwrap().origin.is_live());

    // Confirmed: highest priority source takes over
    let switched = t0 + ms(200);
    assert_eq!(manager.tick(switched), FallbackState::FallbackActive);
    assert_eq!(manager.active_source(), Some("sequence"));
    let frame = manager.get_current_output_frame(switched).unwrap();
    assert_eq!(source_of(&frame.origin), Some("sequence"));
    assert!(frame.data.iter().all(|&b| b == 10));

    // Playback advances at the source's frame rate
    let frame = manager.get_current_output_frame(switched + ms(40)).unwrap();
    assert!(frame.data.iter().all(|&b| b == 20));

    // Playback comes from memory even if the files go away
    for path in &frames {
        std::fs::remove_file(path).unwrap();
    }
    let frame = manager.get_current_output_frame(switched + ms(70)).unwrap();
    assert_eq!(source_of(&frame.origin), Some("sequence"));
    assert!(frame.data.iter().all(|&b| b == 30));

    // The directory disappears: the next check fails over to the still
    std::fs::remove_dir(&sequence_dir).unwrap();
    manager.tick(switched + ms(75));
    assert_eq!(manager.active_source(), Some("still"));
    let frame = manager.get_current_output_frame(switched + ms(75)).unwrap();
    assert_eq!(source_of(&frame.origin), Some("still"));
    assert!(frame.data.iter().all(|&b| b == 77));
    assert_eq!(manager.state(), FallbackState::FallbackActive);

    // The still becomes unhealthy: the built-in pattern is all that is left
    std::fs::remove_file(&still).unwrap();
    manager.tick(switched + ms(80));
    assert_eq!(manager.active_source(), Some(LAST_RESORT_ID));
    let frame = manager.get_current_output_frame(switched + ms(80)).unwrap();
    assert_eq!(source_of(&frame.origin), Some(LAST_RESORT_ID));
    assert_eq!(frame.size(), format.byte_size());

    let status = manager.status(switched + ms(80));
    assert!(status.sources.iter().all(|s| s.failed));

    // Live heartbeats return and hold for the recovery delay
    let back = switched + ms(100);
    let mut now = back;
    while now < back + ms(140) {
        manager.record_heartbeat(now);
        assert_eq!(manager.tick(now), FallbackState::Recovering);
        assert!(!manager.get_current_output_frame(now).unwrap().origin.is_live());
        now += ms(20);
    }
    manager.record_heartbeat(back + ms(160));
    assert_eq!(manager.tick(back + ms(160)), FallbackState::MainActive);
    assert!(manager
        .get_current_output_frame(back + ms(160))
        .unwrap()
        .origin
        .is_live());

    let status = manager.status(back + ms(160));
    assert!(status.sources.iter().all(|s| !s.failed));
    assert!(status.switches >= 4);
}

#[test]
fn test_short_gap_never_leaves_live_output() {
    let live = StageChannel::new("final", test_format(), 2).unwrap();
    let mut manager = FallbackManager::new(settings(TransitionMode::Immediate), live.clone()).unwrap();
    manager
        .register_source("scripted", 1, Box::new(ScriptedSource::new(9)))
        .unwrap();

    publish(&live, 1);
    let t0 = Instant::now();
    manager.tick(t0);
    assert_eq!(manager.tick(t0 + ms(100)), FallbackState::Detecting);

    manager.record_heartbeat(t0 + ms(120));
    assert_eq!(manager.tick(t0 + ms(125)), FallbackState::MainActive);
    assert_eq!(manager.status(t0 + ms(125)).switches, 0);
    assert!(manager
        .get_current_output_frame(t0 + ms(125))
        .unwrap()
        .origin
        .is_live());
}

#[test]
fn test_gradual_transition_blends_into_fallback() {
    let live = StageChannel::new("final", test_format(), 2).unwrap();
    let mut manager =
        FallbackManager::new(settings(TransitionMode::Gradual { ms: 100 }), live.clone()).unwrap();
    manager
        .register_source("black", 1, Box::new(ScriptedSource::new(0)))
        .unwrap();

    publish(&live, 200);
    let t0 = Instant::now();
    manager.tick(t0);
    let switched = t0 + ms(200);
    assert_eq!(manager.tick(switched), FallbackState::FallbackActive);

    let mid = manager.get_current_output_frame(switched + ms(50)).unwrap();
    assert!(matches!(mid.origin, FrameOrigin::Transition { .. }));
    assert!(mid.data.iter().all(|&b| b > 0 && b < 200));

    let done = manager.get_current_output_frame(switched + ms(150)).unwrap();
    assert_eq!(source_of(&done.origin), Some("black"));
    assert!(done.data.iter().all(|&b| b == 0));
}

#[test]
fn test_delayed_transition_holds_previous_output() {
    let live = StageChannel::new("final", test_format(), 2).unwrap();
    let mut manager =
        FallbackManager::new(settings(TransitionMode::Delayed { ms: 100 }), live.clone()).unwrap();
    manager
        .register_source("black", 1, Box::new(ScriptedSource::new(0)))
        .unwrap();

    publish(&live, 200);
    let t0 = Instant::now();
    manager.tick(t0);
    let switched = t0 + ms(200);
    manager.tick(switched);

    let held = manager.get_current_output_frame(switched + ms(50)).unwrap();
    assert!(held.origin.is_live());
    let after = manager.get_current_output_frame(switched + ms(120)).unwrap();
    assert_eq!(source_of(&after.origin), Some("black"));
}

#[test]
fn test_wrong_sized_sequence_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("bad.raw"), [1u8, 2, 3]).unwrap();

    let live = StageChannel::new("final", test_format(), 2).unwrap();
    let mut manager = FallbackManager::new(settings(TransitionMode::Immediate), live.clone()).unwrap();
    manager
        .register(&file_sequence_loopback("bad", dir.path(), 10))
        .unwrap();
    manager
        .register_source("good", 1, Box::new(ScriptedSource::new(5)))
        .unwrap();

    publish(&live, 1);
    let t0 = Instant::now();
    manager.tick(t0);
    manager.tick(t0 + ms(200));

    // The sequence cannot be loaded, so the next source takes over
    let frame = manager.get_current_output_frame(t0 + ms(200)).unwrap();
    assert_eq!(source_of(&frame.origin), Some("good"));
    let status = manager.status(t0 + ms(200));
    let bad = status.sources.iter().find(|s| s.id == "bad").unwrap();
    assert!(bad.failed);
    assert!(bad.last_error.is_some());
}
