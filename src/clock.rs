//! Clocks exposed to the engine.
//!
//! Monotonic time is measured from the moment the platform was built and
//! truncated to millisecond resolution. Wall-clock time is whole
//! milliseconds since the Unix epoch and may jump with system adjustments.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Monotonic and wall-clock time source of a platform.
#[derive(Debug, Clone, Copy)]
pub struct PlatformClock {
    /// The instant when this clock was created.
    epoch: Instant,
}

impl PlatformClock {
    /// Creates a clock whose monotonic origin is now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Seconds since construction, truncated to whole milliseconds.
    ///
    /// Never decreases between calls.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn monotonic_seconds(&self) -> f64 {
        self.epoch.elapsed().as_millis() as f64 / 1000.0
    }

    /// Milliseconds since the Unix epoch, truncated.
    ///
    /// Clocks set before 1970 report `0.0`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn wall_clock_millis(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |since| since.as_millis()) as f64
    }

    /// The instant the monotonic clock counts from.
    #[must_use]
    pub fn epoch(&self) -> Instant {
        self.epoch
    }
}

impl Default for PlatformClock {
    fn default() -> Self {
        Self::new()
    }
}
