//! Triggers: stateful generators of successive fire times.
//!
//! A trigger maps a reference time to the next fire time and nothing else;
//! it has no execution side effects. The timer queries triggers in a
//! monotonically increasing sequence as the clock advances.

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::{Error, Result};

/// A schedule for one timer task.
///
/// Calendar and day-of-week schedules are built above this layer as
/// sequences of [`Trigger::one_time`] registrations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Fires exactly once at a fixed instant.
    OneTime {
        at: DateTime<Utc>,
        consumed: bool,
    },
    /// Fires at `reference + n * period`, phase-locked to the reference
    /// fixed on the first query. Dispatch delay on one firing never shifts
    /// the phase of later ones.
    FixedRate {
        initial_delay: TimeDelta,
        period: TimeDelta,
        /// Most recent computed fire time; the next is one period later.
        last_fire: Option<DateTime<Utc>>,
    },
    /// Fires one period after each dispatch, so the gap between fires
    /// stretches with dispatch delay instead of compressing.
    FixedDelay {
        initial_delay: TimeDelta,
        period: TimeDelta,
        started: bool,
    },
}

impl Trigger {
    /// Trigger that fires once at `at`.
    ///
    /// An instant already in the past fires on the next dispatch pass.
    #[must_use]
    pub const fn one_time(at: DateTime<Utc>) -> Self {
        Self::OneTime {
            at,
            consumed: false,
        }
    }

    /// Phase-stable periodic trigger: the nth fire time is
    /// `first + (n - 1) * period` where `first` is fixed at schedule time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NonPositivePeriod`] unless `period` is positive.
    pub fn fixed_rate(initial_delay: TimeDelta, period: TimeDelta) -> Result<Self> {
        if period <= TimeDelta::zero() {
            return Err(Error::non_positive_period(period.num_milliseconds()));
        }
        Ok(Self::FixedRate {
            initial_delay,
            period,
            last_fire: None,
        })
    }

    /// Periodic trigger spaced one period after each dispatch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NonPositivePeriod`] unless `period` is positive.
    pub fn fixed_delay(initial_delay: TimeDelta, period: TimeDelta) -> Result<Self> {
        if period <= TimeDelta::zero() {
            return Err(Error::non_positive_period(period.num_milliseconds()));
        }
        Ok(Self::FixedDelay {
            initial_delay,
            period,
            started: false,
        })
    }

    /// Compute the next fire time, given that the clock reads `after`.
    ///
    /// Returns `None` once the trigger is exhausted (or if the next fire
    /// time would overflow the calendar).
    pub fn next_fire_time(&mut self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::OneTime { at, consumed } => {
                if *consumed {
                    None
                } else {
                    *consumed = true;
                    Some(*at)
                }
            }
            Self::FixedRate {
                initial_delay,
                period,
                last_fire,
            } => {
                let next = match last_fire {
                    None => after.checked_add_signed(*initial_delay)?,
                    Some(last) => last.checked_add_signed(*period)?,
                };
                *last_fire = Some(next);
                Some(next)
            }
            Self::FixedDelay {
                initial_delay,
                period,
                started,
            } => {
                let delay = if *started { *period } else { *initial_delay };
                *started = true;
                after.checked_add_signed(delay)
            }
        }
    }

    /// Whether any fire times remain.
    #[must_use]
    pub const fn has_more_fire_times(&self) -> bool {
        match self {
            Self::OneTime { consumed, .. } => !*consumed,
            Self::FixedRate { .. } | Self::FixedDelay { .. } => true,
        }
    }
}
