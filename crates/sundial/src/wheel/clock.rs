//! Tick arithmetic for the wheel

use crate::scheduler::deadline_after;
use std::time::{Duration, Instant};

/// Maps monotonic instants to wheel ticks counted from a fixed epoch.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WheelClock {
    epoch: Instant,
    tick_nanos: u64,
}

impl WheelClock {
    pub(crate) fn new(epoch: Instant, tick_nanos: u64) -> Self {
        debug_assert!(tick_nanos > 0);
        Self { epoch, tick_nanos }
    }

    pub(crate) fn tick_duration(&self) -> Duration {
        Duration::from_nanos(self.tick_nanos)
    }

    fn elapsed_nanos(&self, at: Instant) -> u64 {
        u64::try_from(at.saturating_duration_since(self.epoch).as_nanos()).unwrap_or(u64::MAX)
    }

    /// Tick containing `at` (rounded down)
    pub(crate) fn tick_at(&self, at: Instant) -> u64 {
        self.elapsed_nanos(at) / self.tick_nanos
    }

    /// First tick whose start is at or after `deadline` (rounded up), so a
    /// task drained on that tick never fires early.
    pub(crate) fn due_tick(&self, deadline: Instant) -> u64 {
        self.elapsed_nanos(deadline).div_ceil(self.tick_nanos)
    }

    /// Start of `tick`
    pub(crate) fn instant_of(&self, tick: u64) -> Instant {
        deadline_after(self.epoch, Duration::from_nanos(tick.saturating_mul(self.tick_nanos)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1_000_000;

    #[test]
    fn test_tick_rounding() {
        let epoch = Instant::now();
        let clock = WheelClock::new(epoch, 10 * MS);

        assert_eq!(clock.tick_at(epoch), 0);
        assert_eq!(clock.due_tick(epoch), 0);

        let at = epoch + Duration::from_millis(25);
        assert_eq!(clock.tick_at(at), 2);
        assert_eq!(clock.due_tick(at), 3);

        let exact = epoch + Duration::from_millis(30);
        assert_eq!(clock.tick_at(exact), 3);
        assert_eq!(clock.due_tick(exact), 3);
    }

    #[test]
    fn test_due_tick_never_early() {
        let epoch = Instant::now();
        let clock = WheelClock::new(epoch, 7 * MS);
        for offset in 0..100u64 {
            let deadline = epoch + Duration::from_micros(offset * 331);
            assert!(clock.instant_of(clock.due_tick(deadline)) >= deadline);
        }
    }

    #[test]
    fn test_before_epoch_is_tick_zero() {
        let before = Instant::now();
        let clock = WheelClock::new(before + Duration::from_millis(5), MS);
        assert_eq!(clock.tick_at(before), 0);
        assert_eq!(clock.due_tick(before), 0);
    }

    #[test]
    fn test_instant_of() {
        let epoch = Instant::now();
        let clock = WheelClock::new(epoch, 10 * MS);
        assert_eq!(clock.instant_of(4), epoch + Duration::from_millis(40));
        assert_eq!(clock.tick_duration(), Duration::from_millis(10));
    }
}
