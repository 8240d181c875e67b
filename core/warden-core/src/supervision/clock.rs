use std::time::{Duration, Instant, SystemTime};

use tracing::warn;

const DEFAULT_TOLERANCE: Duration = Duration::from_secs(5);

/// Detects wall-clock jumps by comparing against the monotonic clock.
///
/// Moving the system clock is the cheapest way to step outside the
/// monitoring window, so each pass reports how far the two clocks diverged.
pub struct ClockWatch {
    wall: SystemTime,
    mono: Instant,
    tolerance: Duration,
}

impl ClockWatch {
    pub fn new() -> Self {
        Self::with_tolerance(DEFAULT_TOLERANCE)
    }

    pub fn with_tolerance(tolerance: Duration) -> Self {
        Self {
            wall: SystemTime::now(),
            mono: Instant::now(),
            tolerance,
        }
    }

    /// Compares clocks and re-arms. Returns the signed drift in seconds when
    /// it exceeds the tolerance.
    pub fn check(&mut self) -> Option<i64> {
        self.check_at(SystemTime::now(), Instant::now())
    }

    fn check_at(&mut self, wall: SystemTime, mono: Instant) -> Option<i64> {
        let mono_elapsed = mono.saturating_duration_since(self.mono).as_secs_f64();
        let wall_elapsed = match wall.duration_since(self.wall) {
            Ok(forward) => forward.as_secs_f64(),
            Err(backward) => -backward.duration().as_secs_f64(),
        };
        self.wall = wall;
        self.mono = mono;

        let drift = wall_elapsed - mono_elapsed;
        if drift.abs() > self.tolerance.as_secs_f64() {
            let drift = drift.round() as i64;
            warn!(drift_secs = drift, "System clock changed; possible tampering");
            Some(drift)
        } else {
            None
        }
    }
}

impl Default for ClockWatch {
    fn default() -> Self {
        Self::new()
    }
}
