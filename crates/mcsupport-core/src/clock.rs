//! Wall-clock abstraction.
//!
//! Everything that compares timestamps against windows reads time through
//! [`Clock`] so replays and tests can drive it explicitly.

use std::sync::atomic::{AtomicU64, Ordering};


/// Milliseconds since the Unix epoch according to the operating system.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Source of "now" in unix milliseconds.
pub trait Clock: Send + Sync {
    fn now_unix_ms(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
/// Reads the operating system clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_ms(&self) -> u64 {
        current_unix_timestamp_ms()
    }
}

#[derive(Debug, Default)]
/// Clock that only moves when told to.
pub struct ManualClock {
    now_unix_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(now_unix_ms: u64) -> Self {
        Self {
            now_unix_ms: AtomicU64::new(now_unix_ms),
        }
    }

    pub fn set(&self, now_unix_ms: u64) {
        self.now_unix_ms.store(now_unix_ms, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, delta_ms: u64) -> u64 {
        let previous = self.now_unix_ms.fetch_add(delta_ms, Ordering::SeqCst);
        previous.saturating_add(delta_ms)
    }

    pub fn advance_secs(&self, delta_secs: u64) -> u64 {
        self.advance_ms(delta_secs.saturating_mul(1_000))
    }
}

impl Clock for ManualClock {
    fn now_unix_ms(&self) -> u64 {
        self.now_unix_ms.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::{current_unix_timestamp_ms, Clock, ManualClock, SystemClock};

    #[test]
    fn unit_manual_clock_only_moves_when_advanced() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_unix_ms(), 1_000);
        assert_eq!(clock.advance_secs(30), 31_000);
        clock.set(5);
        assert_eq!(clock.now_unix_ms(), 5);
    }

    #[test]
    fn unit_system_clock_tracks_wall_time() {
        let before = current_unix_timestamp_ms();
        assert!(SystemClock.now_unix_ms() >= before);
    }
}
