//! Game timebase
//!
//! All scheduling in the simulation (respawn delays, placement retries,
//! status-effect expiry) is expressed in [`TickCount`] values: milliseconds
//! since the clock started, stored in 32 bits. The counter wraps after about
//! 49.7 days, so durations are always computed with wrapping subtraction and
//! never by comparing two raw values.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Millisecond timestamp that wraps around at `u32::MAX`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TickCount(u32);

impl TickCount {
    /// The zero timestamp
    pub const ZERO: TickCount = TickCount(0);

    /// Create a timestamp from a raw millisecond value
    pub const fn from_millis(ms: u32) -> Self {
        Self(ms)
    }

    /// Raw millisecond value
    pub const fn as_millis(self) -> u32 {
        self.0
    }

    /// Milliseconds elapsed from `earlier` to `self`.
    ///
    /// Uses wrapping subtraction, so a value recorded after the counter
    /// wrapped still produces the short forward distance.
    pub const fn elapsed_since(self, earlier: TickCount) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }

    /// Whether at least `ms` milliseconds have passed since `earlier`
    pub const fn has_elapsed(self, earlier: TickCount, ms: u32) -> bool {
        self.elapsed_since(earlier) >= ms
    }

    /// Timestamp `ms` milliseconds after this one (wrapping)
    pub const fn add_millis(self, ms: u32) -> Self {
        Self(self.0.wrapping_add(ms))
    }
}

impl fmt::Display for TickCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Monotonic clock producing [`TickCount`] values
#[derive(Debug, Clone, Copy)]
pub struct GameClock {
    start: Instant,
}

impl GameClock {
    /// Start a new clock at zero
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Current time. Truncation to 32 bits is the wraparound.
    pub fn now(&self) -> TickCount {
        TickCount(self.start.elapsed().as_millis() as u32)
    }
}

impl Default for GameClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elapsed_simple() {
        let a = TickCount::from_millis(1_000);
        let b = TickCount::from_millis(2_500);
        assert_eq!(b.elapsed_since(a), 1_500);
        assert!(b.has_elapsed(a, 1_500));
        assert!(!b.has_elapsed(a, 1_501));
    }

    #[test]
    fn test_elapsed_across_wraparound() {
        let a = TickCount::from_millis(u32::MAX - 99);
        let b = a.add_millis(300);
        assert_eq!(b.as_millis(), 200);
        assert_eq!(b.elapsed_since(a), 300);
        assert!(b.has_elapsed(a, 300));
        assert!(!b.has_elapsed(a, 301));
    }

    #[test]
    fn test_add_millis_wraps() {
        let t = TickCount::from_millis(u32::MAX);
        assert_eq!(t.add_millis(1), TickCount::ZERO);
    }

    #[test]
    fn test_clock_monotonic() {
        let clock = GameClock::new();
        let first = clock.now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = clock.now();
        assert!(second.elapsed_since(first) >= 5);
    }
}
