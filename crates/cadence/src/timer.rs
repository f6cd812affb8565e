//! Timer: fire-time bookkeeping and dispatch.
//!
//! The timer owns the set of scheduled timer tasks and an injected
//! [`TimeSource`]. As the clock reaches a task's fire time, the timer
//! computes and re-registers the task's next fire time, then hands the due
//! firing to the executor. Rescheduling happens at dispatch, not at
//! completion, so a slow execution never delays or suppresses the schedule;
//! it only fills the key's pending queue until the bound rejects.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::interval;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::TimeSource;
use crate::error::{Error, Result};
use crate::pool::OrderedExecutor;
use crate::task::{ExecutionResult, QueueBound, RejectedReason, Task, TaskKey};
use crate::trigger::Trigger;

/// Unique identifier for a scheduled timer task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimerTaskId(String);

impl TimerTaskId {
    /// Create a new unique timer task ID.
    #[must_use]
    pub fn new() -> Self {
        Self(format!("timer-task-{}", Uuid::new_v4()))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TimerTaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TimerTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Timer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerConfig {
    /// Tick interval for the wall-clock dispatch loop.
    pub tick_interval_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 10,
        }
    }
}

/// A registered timer task: the work, its schedule, and its lifecycle flag.
struct TimerEntry {
    id: TimerTaskId,
    task: Arc<dyn Task>,
    trigger: Mutex<Trigger>,
    /// Set by `unschedule`; a fire already handed to the executor re-checks
    /// this flag when a worker picks it up.
    unscheduled: AtomicBool,
}

/// Fire-time bookkeeping, ordered by (fire time, registration sequence).
struct ScheduleState {
    queue: BinaryHeap<Reverse<(DateTime<Utc>, u64, TimerTaskId)>>,
    entries: HashMap<TimerTaskId, Arc<TimerEntry>>,
    next_seq: u64,
}

impl ScheduleState {
    fn push_fire(&mut self, fire_time: DateTime<Utc>, id: TimerTaskId) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.queue.push(Reverse((fire_time, seq, id)));
    }
}

struct TimerShared {
    config: TimerConfig,
    clock: Arc<dyn TimeSource>,
    executor: OrderedExecutor,
    schedule: Mutex<ScheduleState>,
    cancelled: AtomicBool,
    running: AtomicBool,
}

/// Owns the scheduled timer tasks and dispatches them to the executor as
/// their fire times come due.
///
/// Cheap to clone; clones share state, so independent timer instances can
/// coexist (there is no process-wide singleton).
#[derive(Clone)]
pub struct Timer {
    shared: Arc<TimerShared>,
}

impl Timer {
    /// Create a timer over `clock`, dispatching into `executor`.
    #[must_use]
    pub fn new(clock: Arc<dyn TimeSource>, executor: OrderedExecutor) -> Self {
        Self::with_config(TimerConfig::default(), clock, executor)
    }

    /// Create a timer with an explicit configuration.
    #[must_use]
    pub fn with_config(
        config: TimerConfig,
        clock: Arc<dyn TimeSource>,
        executor: OrderedExecutor,
    ) -> Self {
        Self {
            shared: Arc::new(TimerShared {
                config,
                clock,
                executor,
                schedule: Mutex::new(ScheduleState {
                    queue: BinaryHeap::new(),
                    entries: HashMap::new(),
                    next_seq: 0,
                }),
                cancelled: AtomicBool::new(false),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Register `task` to fire according to `trigger`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TimerCancelled`] after `cancel_all`, or
    /// [`Error::TriggerExhausted`] if `trigger` yields no first fire time.
    pub fn schedule(&self, task: Arc<dyn Task>, mut trigger: Trigger) -> Result<TimerTaskId> {
        if self.shared.cancelled.load(Ordering::Acquire) {
            return Err(Error::TimerCancelled);
        }

        let now = self.shared.clock.now();
        let Some(first_fire) = trigger.next_fire_time(now) else {
            return Err(Error::TriggerExhausted);
        };

        let id = TimerTaskId::new();
        let entry = Arc::new(TimerEntry {
            id: id.clone(),
            task,
            trigger: Mutex::new(trigger),
            unscheduled: AtomicBool::new(false),
        });

        {
            let mut schedule = lock(&self.shared.schedule);
            schedule.push_fire(first_fire, id.clone());
            schedule.entries.insert(id.clone(), entry);
        }

        debug!(id = %id, fire_time = %first_fire, "Scheduled timer task");
        Ok(id)
    }

    /// Remove a timer task from the schedule.
    ///
    /// Prevents future fires. An execution already running is not
    /// interrupted, and a fire already handed to the executor is skipped
    /// when a worker picks it up. Returns whether the id was scheduled.
    pub fn unschedule(&self, id: &TimerTaskId) -> bool {
        let removed = {
            let mut schedule = lock(&self.shared.schedule);
            schedule.entries.remove(id)
        };
        // Stale heap entries for the id are skipped lazily during dispatch.
        match removed {
            Some(entry) => {
                entry.unscheduled.store(true, Ordering::Release);
                debug!(id = %id, "Unscheduled timer task");
                true
            }
            None => false,
        }
    }

    /// Unschedule every task and refuse new registrations.
    ///
    /// Returns the number of tasks removed.
    pub fn cancel_all(&self) -> usize {
        self.shared.cancelled.store(true, Ordering::Release);
        let mut schedule = lock(&self.shared.schedule);
        let count = schedule.entries.len();
        for entry in schedule.entries.values() {
            entry.unscheduled.store(true, Ordering::Release);
        }
        schedule.entries.clear();
        schedule.queue.clear();
        info!(count, "Cancelled all timer tasks");
        count
    }

    /// Dispatch every task due at the clock's current time, in fire-time
    /// order. Returns the number of dispatches.
    pub fn run_pending(&self) -> usize {
        self.dispatch_due(self.shared.clock.now(), false)
    }

    /// Advance a simulated clock to `target`, dispatching every fire time on
    /// the way in fire-time order, without sleeping. Returns the number of
    /// dispatches.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClockNotAdjustable`] when the injected time source
    /// refuses to be steered (the wall clock).
    pub fn fast_forward_to(&self, target: DateTime<Utc>) -> Result<usize> {
        let clock = &self.shared.clock;
        if !clock.advance_to(clock.now()) {
            return Err(Error::ClockNotAdjustable);
        }
        let dispatched = self.dispatch_due(target, true);
        clock.advance_to(target);
        Ok(dispatched)
    }

    /// Run the wall-clock dispatch loop until [`Timer::stop`].
    ///
    /// Ticks at the configured interval and dispatches everything due.
    /// Returns immediately if the loop is already running.
    pub async fn start(&self) {
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        info!(
            tick_interval_ms = self.shared.config.tick_interval_ms,
            "Timer starting"
        );
        let mut ticker = interval(Duration::from_millis(
            self.shared.config.tick_interval_ms.max(1),
        ));
        loop {
            ticker.tick().await;
            if !self.shared.running.load(Ordering::Acquire) {
                break;
            }
            self.run_pending();
        }
        info!("Timer stopped");
    }

    /// Stop the dispatch loop after its current tick.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
    }

    /// Check if the dispatch loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Submit ad-hoc work immediately, stamped with the current time.
    ///
    /// This is the executor's general submission path; the work competes
    /// with scheduled firings under the same per-key ordering and bounds.
    pub fn submit_now(&self, task: Arc<dyn Task>) {
        self.shared.executor.submit(task, self.shared.clock.now());
    }

    /// Number of timer tasks currently scheduled.
    #[must_use]
    pub fn scheduled_count(&self) -> usize {
        lock(&self.shared.schedule).entries.len()
    }

    /// Earliest pending fire time, if any.
    #[must_use]
    pub fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        let mut schedule = lock(&self.shared.schedule);
        loop {
            let fire_and_id = schedule
                .queue
                .peek()
                .map(|Reverse((fire, _, id))| (*fire, id.clone()));
            let (fire, id) = fire_and_id?;
            if schedule.entries.contains_key(&id) {
                return Some(fire);
            }
            // Stale entry for an unscheduled id; drop it and keep looking.
            let _ = schedule.queue.pop();
        }
    }

    /// The executor this timer dispatches into.
    #[must_use]
    pub fn executor(&self) -> &OrderedExecutor {
        &self.shared.executor
    }

    fn dispatch_due(&self, limit: DateTime<Utc>, steer_clock: bool) -> usize {
        let mut dispatched = 0usize;
        while let Some((entry, fire_time)) = self.pop_due(limit) {
            if steer_clock {
                self.shared.clock.advance_to(fire_time);
            }
            dispatched = dispatched.saturating_add(1);
            self.shared
                .executor
                .submit(Arc::new(ScheduledFire { entry }), fire_time);
        }
        dispatched
    }

    /// Pop the earliest fire due at or before `limit`, re-registering the
    /// task's next fire time before handing the due one back.
    fn pop_due(&self, limit: DateTime<Utc>) -> Option<(Arc<TimerEntry>, DateTime<Utc>)> {
        let mut schedule = lock(&self.shared.schedule);
        loop {
            match schedule.queue.peek() {
                Some(Reverse((fire, _, _))) if *fire <= limit => {}
                _ => return None,
            }
            let Some(Reverse((fire_time, _, id))) = schedule.queue.pop() else {
                return None;
            };

            let Some(entry) = schedule.entries.get(&id).map(Arc::clone) else {
                // Unscheduled since this fire was registered; skip it.
                continue;
            };

            // Compute the next fire relative to the fire being dispatched,
            // so the sequence is identical under real and simulated clocks.
            let next = lock(&entry.trigger).next_fire_time(fire_time);
            match next {
                Some(next_fire) => schedule.push_fire(next_fire, id),
                None => {
                    // Trigger exhausted; this dispatch is the task's last.
                    schedule.entries.remove(&id);
                }
            }

            return Some((entry, fire_time));
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One dispatch of a scheduled timer task.
///
/// Re-checks the unscheduled flag when a worker picks the fire up: a fire
/// that raced an `unschedule` is skipped rather than run stale.
struct ScheduledFire {
    entry: Arc<TimerEntry>,
}

#[async_trait]
impl Task for ScheduledFire {
    fn key(&self) -> &TaskKey {
        self.entry.task.key()
    }

    fn name(&self) -> &str {
        self.entry.task.name()
    }

    fn queue_bound(&self) -> Option<QueueBound> {
        self.entry.task.queue_bound()
    }

    async fn execute(&self, fire_time: DateTime<Utc>) -> ExecutionResult {
        if self.entry.unscheduled.load(Ordering::Acquire) {
            debug!(
                id = %self.entry.id,
                task = %self.entry.task.name(),
                "Skipping stale fire of unscheduled task"
            );
            return ExecutionResult::Skipped;
        }
        self.entry.task.execute(fire_time).await
    }

    fn rejected(&self, reason: RejectedReason) {
        self.entry.task.rejected(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimulatedClock;
    use crate::pool::ExecutorConfig;
    use chrono::TimeDelta;

    struct Noop {
        key: TaskKey,
    }

    #[async_trait]
    impl Task for Noop {
        fn key(&self) -> &TaskKey {
            &self.key
        }

        fn name(&self) -> &str {
            "noop"
        }

        async fn execute(&self, _fire_time: DateTime<Utc>) -> ExecutionResult {
            ExecutionResult::Success
        }
    }

    fn noop_task(key: &str) -> Option<Arc<dyn Task>> {
        let key = TaskKey::new(key).ok()?;
        Some(Arc::new(Noop { key }))
    }

    fn at_ms(ms: i64) -> DateTime<Utc> {
        DateTime::UNIX_EPOCH
            .checked_add_signed(TimeDelta::milliseconds(ms))
            .unwrap_or(DateTime::UNIX_EPOCH)
    }

    #[test]
    fn timer_task_id_display() {
        let id = TimerTaskId::new();
        assert!(format!("{id}").starts_with("timer-task-"));
        assert_eq!(id.as_str(), format!("{id}"));
    }

    #[test]
    fn timer_config_default() {
        let config = TimerConfig::default();
        assert_eq!(config.tick_interval_ms, 10);
    }

    #[tokio::test]
    async fn schedule_tracks_fire_time() {
        let clock = Arc::new(SimulatedClock::new(at_ms(0)));
        let executor = OrderedExecutor::new(ExecutorConfig::default());
        let timer = Timer::new(clock, executor);

        let Some(task) = noop_task("unit-key") else {
            return;
        };
        let trigger = Trigger::one_time(at_ms(500));
        let id = timer.schedule(task, trigger);

        assert!(id.is_ok());
        assert_eq!(timer.scheduled_count(), 1);
        assert_eq!(timer.next_fire_time(), Some(at_ms(500)));
    }

    #[tokio::test]
    async fn unschedule_removes_entry() {
        let clock = Arc::new(SimulatedClock::new(at_ms(0)));
        let executor = OrderedExecutor::new(ExecutorConfig::default());
        let timer = Timer::new(clock, executor);

        let Some(task) = noop_task("unit-key") else {
            return;
        };
        let id = timer
            .schedule(task, Trigger::one_time(at_ms(500)))
            .unwrap_or_default();

        assert!(timer.unschedule(&id));
        assert!(!timer.unschedule(&id));
        assert_eq!(timer.scheduled_count(), 0);
        assert_eq!(timer.next_fire_time(), None);
    }

    #[tokio::test]
    async fn cancel_all_refuses_new_registrations() {
        let clock = Arc::new(SimulatedClock::new(at_ms(0)));
        let executor = OrderedExecutor::new(ExecutorConfig::default());
        let timer = Timer::new(clock, executor);

        if let Some(task) = noop_task("unit-key") {
            let _ = timer.schedule(task, Trigger::one_time(at_ms(500)));
        }
        assert_eq!(timer.cancel_all(), 1);

        let Some(task) = noop_task("unit-key") else {
            return;
        };
        let result = timer.schedule(task, Trigger::one_time(at_ms(900)));
        assert!(matches!(result, Err(Error::TimerCancelled)));
    }

    #[tokio::test]
    async fn fast_forward_requires_steerable_clock() {
        let executor = OrderedExecutor::new(ExecutorConfig::default());
        let timer = Timer::new(Arc::new(crate::clock::SystemClock), executor);

        let result = timer.fast_forward_to(at_ms(1_000));
        assert!(matches!(result, Err(Error::ClockNotAdjustable)));
    }
}
