//! Task vocabulary: keys, queue bounds, execution outcomes and rejection
//! reasons.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Identity under which ordering and backpressure are enforced.
///
/// Submissions sharing a key never run concurrently and execute in
/// submission order; no ordering exists across distinct keys. Construction
/// rejects an empty key, so every task the executor ever sees has a usable
/// one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey(String);

impl TaskKey {
    /// Create a key from a non-empty string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyTaskKey`] for an empty string.
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(Error::EmptyTaskKey);
        }
        Ok(Self(key))
    }

    /// Get the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bound on pending executions for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueBound {
    /// Never reject for this key; pool-wide capacity is the only limit.
    Unlimited,
    /// At most this many pending executions behind the in-flight one.
    /// `Limit(0)` means run immediately or reject, no queueing.
    Limit(usize),
}

impl QueueBound {
    /// Whether a queue currently holding `pending` entries admits one more.
    #[must_use]
    pub fn admits(&self, pending: usize) -> bool {
        match self {
            Self::Unlimited => true,
            Self::Limit(bound) => pending < *bound,
        }
    }

    /// Check if this bound never rejects.
    #[must_use]
    pub const fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }
}

/// Why a submission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectedReason {
    /// The pending queue for the task's key is at its bound.
    QueueFull,
    /// The executor is shut down.
    PoolShutdown,
}

impl RejectedReason {
    /// Human-readable cause, suitable for logs and operator reports.
    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::QueueFull => "pending queue for the task's key is at its bound",
            Self::PoolShutdown => "executor is shut down and accepts no new work",
        }
    }
}

impl fmt::Display for RejectedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull => write!(f, "QUEUE_FULL"),
            Self::PoolShutdown => write!(f, "POOL_SHUTDOWN"),
        }
    }
}

/// Outcome of a single execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    /// The work ran to completion.
    Success,
    /// The fire was stale (its timer task was unscheduled) and was not run.
    Skipped,
    /// The work failed; the error goes to the executor's failure handler.
    Failed {
        /// Error message
        error: String,
    },
}

impl ExecutionResult {
    /// Create a failed result.
    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
        }
    }

    /// Check if execution completed successfully.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Check if execution failed.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// A named, keyed unit of schedulable work.
///
/// Execution state (pending position, in-flight flag) lives in the executor,
/// never on the task, so one task value can be submitted many times.
/// Implementations must tolerate `execute` being invoked with a fire time
/// that is already in the past: the timestamp is the logical scheduled fire
/// time, not the instant a worker picked the task up.
#[async_trait]
pub trait Task: Send + Sync {
    /// Ordering and backpressure group for this task.
    fn key(&self) -> &TaskKey;

    /// Name used in diagnostics and logs.
    fn name(&self) -> &str;

    /// Pending-queue bound for this task's key.
    ///
    /// `None` inherits the executor's configured default.
    fn queue_bound(&self) -> Option<QueueBound> {
        None
    }

    /// Perform the work for the firing scheduled at `fire_time`.
    async fn execute(&self, fire_time: DateTime<Utc>) -> ExecutionResult;

    /// Called synchronously on the submitting thread when a submission is
    /// refused. A submission sees exactly one of `execute` or `rejected`.
    fn rejected(&self, _reason: RejectedReason) {}
}
