//! Fail-fast error types for scheduling defects.
//!
//! These cover caller mistakes caught at construction or schedule time.
//! Runtime backpressure is not an error: a refused submission is reported
//! through `Task::rejected`, never through this type.

use thiserror::Error;

/// Caller defects detected at construction or schedule time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A task key must be a non-empty string.
    #[error("task key must not be empty")]
    EmptyTaskKey,

    /// Periodic triggers must move time forward.
    #[error("trigger period must be positive, got {period_ms}ms")]
    NonPositivePeriod { period_ms: i64 },

    /// The trigger has no fire times left to schedule.
    #[error("trigger has no remaining fire times")]
    TriggerExhausted,

    /// The timer was cancelled and accepts no new registrations.
    #[error("timer has been cancelled")]
    TimerCancelled,

    /// The injected time source refused to be steered.
    #[error("time source cannot be steered to a target instant")]
    ClockNotAdjustable,
}

impl Error {
    /// Create a non-positive period error.
    #[must_use]
    pub const fn non_positive_period(period_ms: i64) -> Self {
        Self::NonPositivePeriod { period_ms }
    }
}

/// Result alias for scheduling operations.
pub type Result<T> = std::result::Result<T, Error>;
