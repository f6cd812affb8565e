//! Ordered, bounded-queue executor.
//!
//! Guarantees per key: serial, submission-ordered execution (never two
//! concurrent executions of one key, never reordered) and bounded pending
//! memory (a full queue rejects instead of buffering). Unrelated keys run
//! fully in parallel on a bounded set of workers.
//!
//! The key map is guarded by one short-lived lock; no user callback and no
//! `await` ever runs under it. Per-key serialization comes from the
//! `in_flight` flag, not from holding the lock across executions.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::task::{ExecutionResult, QueueBound, RejectedReason, Task, TaskKey};

mod queue;

use queue::{KeyQueue, TaskWrapper};

/// Handler for errors escaping `Task::execute`.
///
/// Nothing a task does may crash the executor; failures land here and the
/// key's next pending entry still dispatches.
pub trait FailureHandler: Send + Sync {
    /// Called with the failed task's key, name and error message.
    fn execution_failed(&self, key: &TaskKey, task_name: &str, error: &str);
}

/// Failure handler that logs through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingFailureHandler;

impl FailureHandler for LoggingFailureHandler {
    fn execution_failed(&self, key: &TaskKey, task_name: &str, error: &str) {
        error!(key = %key, task = %task_name, error = %error, "Task execution failed");
    }
}

/// Configuration for the ordered executor.
///
/// Everything is a constructor parameter; nothing is read from files or the
/// environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Maximum concurrently running executions across all keys.
    pub max_concurrency: usize,
    /// Bound applied to tasks that do not declare their own.
    pub default_queue_bound: QueueBound,
    /// On a full queue, discard the key's whole backlog instead of rejecting
    /// only the newest arrival. Appropriate when queued work is addressed to
    /// an unresponsive downstream target.
    pub flush_on_reject: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            default_queue_bound: QueueBound::Unlimited,
            flush_on_reject: false,
        }
    }
}

struct ExecutorShared {
    config: ExecutorConfig,
    capacity: Semaphore,
    keys: Mutex<HashMap<TaskKey, KeyQueue>>,
    failure_handler: Arc<dyn FailureHandler>,
    shut_down: AtomicBool,
    active: AtomicUsize,
}

/// Ordered, bounded-queue worker pool.
///
/// Cheap to clone; clones share state, so independent executor instances
/// can coexist (there is no process-wide singleton).
#[derive(Clone)]
pub struct OrderedExecutor {
    shared: Arc<ExecutorShared>,
}

impl OrderedExecutor {
    /// Create an executor that logs failures through `tracing`.
    #[must_use]
    pub fn new(config: ExecutorConfig) -> Self {
        Self::with_failure_handler(config, Arc::new(LoggingFailureHandler))
    }

    /// Create an executor with a caller-supplied failure handler.
    #[must_use]
    pub fn with_failure_handler(
        config: ExecutorConfig,
        failure_handler: Arc<dyn FailureHandler>,
    ) -> Self {
        let permits = config.max_concurrency.max(1);
        Self {
            shared: Arc::new(ExecutorShared {
                config,
                capacity: Semaphore::new(permits),
                keys: Mutex::new(HashMap::new()),
                failure_handler,
                shut_down: AtomicBool::new(false),
                active: AtomicUsize::new(0),
            }),
        }
    }

    /// Submit one execution of `task`, stamped with its scheduled
    /// `fire_time`.
    ///
    /// Admission is decided under the key's bookkeeping lock: an idle key
    /// dispatches immediately, a busy key queues FIFO up to the task's
    /// bound, and anything beyond the bound is reported through
    /// `Task::rejected` synchronously on the calling thread. Submission
    /// never returns an error. Must be called from within a tokio runtime.
    pub fn submit(&self, task: Arc<dyn Task>, fire_time: DateTime<Utc>) {
        let bound = task
            .queue_bound()
            .unwrap_or(self.shared.config.default_queue_bound);
        let key = task.key().clone();
        let wrapper = TaskWrapper { task, fire_time };

        let refused = {
            let mut keys = lock(&self.shared.keys);
            if self.shared.shut_down.load(Ordering::Acquire) {
                Some((RejectedReason::PoolShutdown, Vec::new(), wrapper))
            } else {
                let entry = keys.entry(key.clone()).or_default();
                if !entry.in_flight {
                    entry.in_flight = true;
                    drop(keys);
                    self.spawn_key_worker(key, wrapper);
                    return;
                }
                if bound.admits(entry.pending.len()) {
                    entry.pending.push_back(wrapper);
                    None
                } else {
                    let flushed = if self.shared.config.flush_on_reject {
                        entry.drain_pending()
                    } else {
                        Vec::new()
                    };
                    Some((RejectedReason::QueueFull, flushed, wrapper))
                }
            }
        };

        let Some((reason, flushed, wrapper)) = refused else {
            return;
        };

        // Callbacks run outside the lock; rejected() may resubmit or cancel.
        match reason {
            RejectedReason::QueueFull => warn!(
                key = %key,
                task = %wrapper.task.name(),
                flushed = flushed.len(),
                "Pending queue full, rejecting submission"
            ),
            RejectedReason::PoolShutdown => debug!(
                key = %key,
                task = %wrapper.task.name(),
                "Executor shut down, rejecting submission"
            ),
        }
        wrapper.task.rejected(reason);
        for stale in flushed {
            stale.task.rejected(reason);
        }
    }

    /// Shut the executor down.
    ///
    /// In-flight executions finish; every still-pending entry is rejected
    /// with `PoolShutdown` exactly once; later submissions are rejected
    /// outright. Idempotent.
    pub fn shutdown(&self) {
        if self
            .shared
            .shut_down
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let drained: Vec<TaskWrapper> = {
            let mut keys = lock(&self.shared.keys);
            let mut drained = Vec::new();
            keys.retain(|_, entry| {
                drained.append(&mut entry.drain_pending());
                entry.in_flight
            });
            drained
        };

        info!(pending = drained.len(), "Executor shut down, rejecting pending work");
        for wrapper in drained {
            wrapper.task.rejected(RejectedReason::PoolShutdown);
        }
    }

    /// Wait until no execution is running and no key is tracked.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        let Some(deadline) = tokio::time::Instant::now().checked_add(timeout) else {
            return false;
        };
        loop {
            if self.is_idle() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Check whether the executor has been shut down.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::Acquire)
    }

    /// Number of pending (not yet running) executions for `key`.
    #[must_use]
    pub fn pending_count(&self, key: &TaskKey) -> usize {
        lock(&self.shared.keys)
            .get(key)
            .map_or(0, |entry| entry.pending.len())
    }

    /// Number of executions currently on a worker.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Snapshot of the keys with tracked work.
    #[must_use]
    pub fn tracked_keys(&self) -> Vec<TaskKey> {
        lock(&self.shared.keys).keys().cloned().collect()
    }

    fn is_idle(&self) -> bool {
        self.active_count() == 0 && lock(&self.shared.keys).is_empty()
    }

    fn spawn_key_worker(&self, key: TaskKey, first: TaskWrapper) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let mut wrapper = first;
            loop {
                shared.run_one(&key, wrapper).await;
                match shared.next_for_key(&key) {
                    Some(next) => wrapper = next,
                    None => break,
                }
            }
        });
    }
}

impl ExecutorShared {
    async fn run_one(&self, key: &TaskKey, wrapper: TaskWrapper) {
        let permit = match self.capacity.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                // The capacity semaphore is never closed; if it somehow is,
                // report rather than drop silently.
                wrapper.task.rejected(RejectedReason::PoolShutdown);
                return;
            }
        };

        self.active.fetch_add(1, Ordering::AcqRel);
        let outcome = AssertUnwindSafe(wrapper.task.execute(wrapper.fire_time))
            .catch_unwind()
            .await;
        match outcome {
            Ok(ExecutionResult::Success) => {
                debug!(key = %key, task = %wrapper.task.name(), "Execution complete");
            }
            Ok(ExecutionResult::Skipped) => {
                debug!(key = %key, task = %wrapper.task.name(), "Execution skipped");
            }
            Ok(ExecutionResult::Failed { error }) => {
                self.failure_handler
                    .execution_failed(key, wrapper.task.name(), &error);
            }
            Err(panic) => {
                self.failure_handler
                    .execution_failed(key, wrapper.task.name(), &panic_message(&*panic));
            }
        }
        self.active.fetch_sub(1, Ordering::AcqRel);
        drop(permit);
    }

    /// Completion bookkeeping: hand back the oldest pending entry, or clear
    /// the in-flight flag and drop the key the moment it goes idle.
    fn next_for_key(&self, key: &TaskKey) -> Option<TaskWrapper> {
        let mut keys = lock(&self.keys);
        let entry = keys.get_mut(key)?;
        if let Some(next) = entry.pending.pop_front() {
            return Some(next);
        }
        entry.in_flight = false;
        keys.remove(key);
        None
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "task panicked".to_string())
}
