use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A source of epoch timestamps for heartbeats and timeouts.
///
/// Driver and clients compare each other's heartbeats across process
/// boundaries, so every implementation must report time since the UNIX epoch.
pub trait Clock: Send + Sync + 'static {
    /// Returns the current timestamp in nanoseconds since the UNIX epoch.
    fn now(&self) -> u64;

    fn now_ms(&self) -> i64 {
        (self.now() / 1_000_000) as i64
    }
}

fn wall_clock_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// A clock that uses `std::time::SystemTime`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        wall_clock_ns()
    }
}

/// A clock that uses the CPU's Time-Stamp Counter (TSC) via the `quanta` crate.
///
/// Anchored to `SystemTime` at construction, then advanced by TSC ticks, so it
/// never jumps backwards on NTP adjustments.
#[derive(Debug, Clone)]
pub struct QuantaClock {
    clock: quanta::Clock,
    start_wall_ns: u64,
    start_instant: quanta::Instant,
}

impl Default for QuantaClock {
    fn default() -> Self {
        let clock = quanta::Clock::new();
        let start_instant = clock.now();
        Self {
            clock,
            start_wall_ns: wall_clock_ns(),
            start_instant,
        }
    }
}

impl QuantaClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for QuantaClock {
    fn now(&self) -> u64 {
        let delta = self.clock.now().duration_since(self.start_instant);
        self.start_wall_ns + delta.as_nanos() as u64
    }
}

/// A clock that only moves when told to. Share one between a driver and its
/// clients to step through timeouts deterministically.
#[derive(Debug)]
pub struct ManualClock {
    now_ns: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ns: u64) -> Self {
        Self {
            now_ns: AtomicU64::new(start_ns),
        }
    }

    /// Starts at the current wall-clock time.
    pub fn starting_now() -> Self {
        Self::new(wall_clock_ns())
    }

    pub fn advance(&self, delta: Duration) {
        self.now_ns
            .fetch_add(delta.as_nanos() as u64, Ordering::AcqRel);
    }

    pub fn set(&self, now_ns: u64) {
        self.now_ns.store(now_ns, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now_ns.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::{Clock, ManualClock, QuantaClock, SystemClock};
    use std::time::Duration;

    #[test]
    fn manual_clock_moves_only_when_advanced() {
        let clock = ManualClock::new(5_000_000);
        assert_eq!(clock.now_ms(), 5);
        clock.advance(Duration::from_millis(10));
        assert_eq!(clock.now_ms(), 15);
    }

    #[test]
    fn quanta_clock_tracks_wall_clock() {
        let system = SystemClock.now();
        let quanta = QuantaClock::new().now();
        let skew = system.abs_diff(quanta);
        assert!(skew < 1_000_000_000, "skew {skew}ns");
    }
}
