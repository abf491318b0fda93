//! Frame timing utilities
//!
//! Visibility code never reads a global timer; it is handed a `FrameClock`
//! owned by the host so that timed behaviour (occlusion re-test cooldowns)
//! is reproducible under test.

use std::time::{Duration, Instant};

/// Monotonic frame clock
#[derive(Debug, Clone)]
pub struct FrameClock {
    start: Option<Instant>,
    elapsed: Duration,
    delta: Duration,
    frame_count: u64,
}

impl FrameClock {
    /// Create a clock that follows wall time on each `tick`
    pub fn new() -> Self {
        Self {
            start: Some(Instant::now()),
            elapsed: Duration::ZERO,
            delta: Duration::ZERO,
            frame_count: 0,
        }
    }

    /// Create a clock that only moves when `advance` is called
    pub fn manual() -> Self {
        Self {
            start: None,
            elapsed: Duration::ZERO,
            delta: Duration::ZERO,
            frame_count: 0,
        }
    }

    /// Call once per frame to update timing
    pub fn tick(&mut self) {
        if let Some(start) = self.start {
            let now = start.elapsed();
            self.delta = now.saturating_sub(self.elapsed);
            self.elapsed = now;
        }
        self.frame_count += 1;
    }

    /// Step a manual clock forward
    pub fn advance(&mut self, step: Duration) {
        self.delta = step;
        self.elapsed += step;
        self.frame_count += 1;
    }

    /// Time since the clock was created
    pub fn now(&self) -> Duration {
        self.elapsed
    }

    /// Get delta time in seconds
    pub fn delta_secs(&self) -> f32 {
        self.delta.as_secs_f32()
    }

    /// Get total frame count
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}
