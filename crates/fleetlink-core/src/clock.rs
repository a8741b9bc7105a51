//! Clock abstraction.
//!
//! Every component that needs time receives an `Arc<dyn Clock>` at
//! construction. Production code uses [`SystemClock`]; tests drive state
//! transitions deterministically with [`ManualClock`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::types::{TimePoint, Timestamp};

/// Source of wall-clock and monotonic time.
pub trait Clock: fmt::Debug + Send + Sync {
    /// Milliseconds since the Unix epoch. May jump when the wall clock is
    /// adjusted.
    fn system_time_ms(&self) -> Timestamp;

    /// Milliseconds since an arbitrary anchor. Never goes backwards.
    fn monotonic_ms(&self) -> Timestamp;

    /// Both readings taken back to back.
    fn time_point(&self) -> TimePoint {
        TimePoint {
            system_time_ms: self.system_time_ms(),
            monotonic_time_ms: self.monotonic_ms(),
        }
    }
}

/// Clock backed by the operating system.
///
/// The monotonic reading is anchored to the instant the clock was created.
pub struct SystemClock {
    anchor: Instant,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            anchor: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SystemClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemClock").finish_non_exhaustive()
    }
}

impl Clock for SystemClock {
    fn system_time_ms(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as Timestamp)
            .unwrap_or(0)
    }

    fn monotonic_ms(&self) -> Timestamp {
        self.anchor.elapsed().as_millis() as Timestamp
    }
}

/// Manually advanced clock for tests.
///
/// Wall and monotonic time move together through [`ManualClock::advance`];
/// [`ManualClock::jump_wall`] moves only the wall clock, mimicking an NTP
/// step.
#[derive(Debug, Default)]
pub struct ManualClock {
    system_ms: AtomicU64,
    monotonic_ms: AtomicU64,
}

impl ManualClock {
    #[must_use]
    pub fn new(system_time_ms: Timestamp) -> Self {
        Self {
            system_ms: AtomicU64::new(system_time_ms),
            monotonic_ms: AtomicU64::new(0),
        }
    }

    /// Advance both readings by `delta_ms`.
    pub fn advance(&self, delta_ms: Timestamp) {
        self.system_ms.fetch_add(delta_ms, Ordering::SeqCst);
        self.monotonic_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    /// Step the wall clock to an absolute value, leaving monotonic time
    /// untouched.
    pub fn jump_wall(&self, system_time_ms: Timestamp) {
        self.system_ms.store(system_time_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn system_time_ms(&self) -> Timestamp {
        self.system_ms.load(Ordering::SeqCst)
    }

    fn monotonic_ms(&self) -> Timestamp {
        self.monotonic_ms.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_both_readings() {
        let clock = ManualClock::new(1_000);
        clock.advance(250);
        assert_eq!(clock.system_time_ms(), 1_250);
        assert_eq!(clock.monotonic_ms(), 250);
    }

    #[test]
    fn wall_jump_leaves_monotonic_untouched() {
        let clock = ManualClock::new(1_000);
        clock.advance(100);
        clock.jump_wall(5_000_000);
        assert_eq!(clock.system_time_ms(), 5_000_000);
        assert_eq!(clock.monotonic_ms(), 100);
    }

    #[test]
    fn system_clock_monotonic_does_not_regress() {
        let clock = SystemClock::new();
        let a = clock.monotonic_ms();
        let b = clock.monotonic_ms();
        assert!(b >= a);
    }
}
