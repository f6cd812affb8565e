//! Time sources: the wall clock and a manually steered simulation clock.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, TimeDelta, Utc};

/// Abstraction over "current time".
///
/// The timer never reads the OS clock directly; it asks its injected source,
/// so the same dispatch logic runs against real time in production and a
/// steered clock in tests.
pub trait TimeSource: Send + Sync + fmt::Debug {
    /// Current time according to this source.
    fn now(&self) -> DateTime<Utc>;

    /// Steer the clock forward to `target`.
    ///
    /// Returns `true` when the source honoured the jump. The wall clock
    /// cannot be steered and always returns `false`.
    fn advance_to(&self, target: DateTime<Utc>) -> bool;
}

/// Wall-clock time source backed by the OS clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn advance_to(&self, _target: DateTime<Utc>) -> bool {
        false
    }
}

/// Manually advanced clock for deterministic tests.
///
/// The clock never moves backwards: steering towards an earlier instant
/// leaves the current value in place.
#[derive(Debug)]
pub struct SimulatedClock {
    now: Mutex<DateTime<Utc>>,
}

impl SimulatedClock {
    /// Create a clock frozen at `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward by `delta`, returning the new value.
    ///
    /// A non-positive or overflowing delta leaves the clock unchanged.
    pub fn advance(&self, delta: TimeDelta) -> DateTime<Utc> {
        let mut now = self.lock_now();
        if let Some(next) = now.checked_add_signed(delta) {
            if next > *now {
                *now = next;
            }
        }
        *now
    }

    /// Move the clock forward to `target`, returning the new value.
    pub fn set(&self, target: DateTime<Utc>) -> DateTime<Utc> {
        let mut now = self.lock_now();
        if target > *now {
            *now = target;
        }
        *now
    }

    fn lock_now(&self) -> std::sync::MutexGuard<'_, DateTime<Utc>> {
        self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TimeSource for SimulatedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.lock_now()
    }

    fn advance_to(&self, target: DateTime<Utc>) -> bool {
        self.set(target);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at_ms(ms: i64) -> DateTime<Utc> {
        DateTime::UNIX_EPOCH
            .checked_add_signed(TimeDelta::milliseconds(ms))
            .unwrap_or(DateTime::UNIX_EPOCH)
    }

    #[test]
    fn simulated_clock_starts_frozen() {
        let clock = SimulatedClock::new(at_ms(1_000));
        assert_eq!(clock.now(), at_ms(1_000));
        assert_eq!(clock.now(), at_ms(1_000));
    }

    #[test]
    fn simulated_clock_advances_by_delta() {
        let clock = SimulatedClock::new(at_ms(0));
        let after = clock.advance(TimeDelta::milliseconds(250));
        assert_eq!(after, at_ms(250));
        assert_eq!(clock.now(), at_ms(250));
    }

    #[test]
    fn simulated_clock_never_moves_backwards() {
        let clock = SimulatedClock::new(at_ms(500));
        clock.set(at_ms(100));
        assert_eq!(clock.now(), at_ms(500));

        clock.advance(TimeDelta::milliseconds(-50));
        assert_eq!(clock.now(), at_ms(500));
    }

    #[test]
    fn simulated_clock_honours_steering() {
        let clock = SimulatedClock::new(at_ms(0));
        assert!(clock.advance_to(at_ms(42)));
        assert_eq!(clock.now(), at_ms(42));
    }

    #[test]
    fn system_clock_refuses_steering() {
        let clock = SystemClock;
        assert!(!clock.advance_to(at_ms(0)));
    }

    #[test]
    fn system_clock_tracks_wall_time() {
        let clock = SystemClock;
        let before = Utc::now();
        let read = clock.now();
        let after = Utc::now();
        assert!(read >= before && read <= after);
    }
}
