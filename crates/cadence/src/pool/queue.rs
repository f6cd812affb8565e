//! Per-key pending queue bookkeeping.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::task::Task;

/// A task paired with the logical fire time of one submission.
///
/// The timestamp handed to `execute` is this scheduled fire time, never the
/// wall-clock instant a worker actually started.
#[derive(Clone)]
pub(crate) struct TaskWrapper {
    pub(crate) task: Arc<dyn Task>,
    pub(crate) fire_time: DateTime<Utc>,
}

/// Pending executions for one key.
///
/// Exists only while the key has work: created on first submission, removed
/// the moment the pending list is empty with nothing in flight. `in_flight`
/// means exactly one execution for this key is currently assigned to a
/// worker.
#[derive(Default)]
pub(crate) struct KeyQueue {
    pub(crate) pending: VecDeque<TaskWrapper>,
    pub(crate) in_flight: bool,
}

impl KeyQueue {
    pub(crate) fn is_idle(&self) -> bool {
        !self.in_flight && self.pending.is_empty()
    }

    pub(crate) fn drain_pending(&mut self) -> Vec<TaskWrapper> {
        self.pending.drain(..).collect()
    }
}
