//! Injectable time source.
//!
//! Lease expiry, heartbeat deadlines, and reaper cooldowns all compare
//! millisecond Unix timestamps. The [`Clock`] trait makes that comparable
//! time injectable so tests can freeze or advance it deterministically.
//! Production code uses [`SystemClock`]; the testing crate provides a
//! simulated clock.

use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Get current Unix timestamp in milliseconds.
///
/// Returns 0 if system time is before the UNIX epoch, so callers never
/// panic on a misconfigured clock.
#[inline]
pub fn current_time_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Trait for injectable millisecond time sources.
pub trait Clock: Send + Sync + 'static {
    /// Current Unix timestamp in milliseconds.
    fn now_ms(&self) -> u64;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now_ms(&self) -> u64 {
        current_time_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_advances() {
        let clock = SystemClock;
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000, "system clock is after 2020");
    }
}
