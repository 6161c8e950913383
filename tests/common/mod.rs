//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use livecore::{FrameFormat, PixelLayout};
use std::time::{Duration, Instant};

/// Upper bound for anything that waits on stage threads
pub fn test_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Small frame so tests stay fast
pub fn test_format() -> FrameFormat {
    FrameFormat::new(32, 16, PixelLayout::Gray8)
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Assert two floats are approximately equal
pub fn assert_float_eq(a: f64, b: f64, epsilon: f64) {
    assert!(
        (a - b).abs() < epsilon,
        "Expected {} to be approximately equal to {} (epsilon: {})",
        a,
        b,
        epsilon
    );
}
