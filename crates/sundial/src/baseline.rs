//! Baseline scheduler: one ordered structure, one dispatcher thread
//!
//! Pending tasks are kept ordered by deadline under a single mutex. The
//! dispatcher waits on a condvar until the earliest deadline (or until a new
//! earlier task or a cancellation wakes it), pops everything that is due, and
//! fires it with the lock released.
//!
//! Every producer and the dispatcher contend on the same lock, so this
//! variant is meant for moderate schedule rates and as a correctness
//! reference for [`WheelScheduler`](crate::WheelScheduler).

use crate::config::SchedulerConfig;
use crate::dispatch::Dispatch;
use crate::error::{SchedulerError, SchedulerResult};
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::scheduler::{deadline_after, Scheduler};
use crate::stats::{Counters, SchedulerStats};
use crate::task::{Canceller, Job, Task, TaskEntry, TaskId};
use crate::thread::{join_all, spawn_named};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Pending tasks ordered by (deadline, id); the id breaks deadline ties
type PendingMap = BTreeMap<(Instant, TaskId), Arc<TaskEntry>>;

/// State shared between producers, cancellers and the dispatcher
struct Shared {
    /// Tasks waiting for their deadline
    pending: Mutex<PendingMap>,
    /// Wakes the dispatcher on an earlier deadline, a cancellation, or shutdown
    notify: Condvar,
    /// Shutdown signal, only written while holding `pending`
    shutdown: AtomicBool,
    dispatch: Dispatch,
    counters: Arc<Counters>,
}

impl Shared {
    fn run_loop(&self) {
        let mut pending = self.pending.lock();
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            let due = Self::pop_due(&mut pending, Instant::now());
            if !due.is_empty() {
                tracing::trace!(count = due.len(), "firing due tasks");
                MutexGuard::unlocked(&mut pending, || {
                    for entry in due {
                        self.dispatch.fire(entry);
                    }
                });
                continue;
            }

            let next_wake = pending.keys().next().map(|&(wake_at, _)| wake_at);
            match next_wake {
                // Wait with timeout - will wake early if an earlier entry is added
                Some(wake_at) => {
                    self.notify.wait_until(&mut pending, wake_at);
                }
                None => self.notify.wait(&mut pending),
            }
        }

        tracing::debug!("baseline dispatcher shutting down");
    }

    /// Remove every entry due at `now`, moving each to Dispatching.
    fn pop_due(pending: &mut PendingMap, now: Instant) -> Vec<Arc<TaskEntry>> {
        let mut due = Vec::new();
        while let Some(slot) = pending.first_entry() {
            if slot.key().0 > now {
                break;
            }
            let entry = slot.remove();
            // Cancellation removes entries under this same lock, so anything
            // still in the map is pending
            if entry.begin_dispatch() {
                due.push(entry);
            }
        }
        due
    }

    fn signal_shutdown(&self) {
        let _pending = self.pending.lock();
        self.shutdown.store(true, Ordering::Release);
        self.notify.notify_all();
    }
}

impl Canceller for Shared {
    fn cancel(&self, entry: &Arc<TaskEntry>) -> bool {
        let key = (entry.deadline(), entry.id());
        let mut pending = self.pending.lock();

        let was_first = pending.keys().next() == Some(&key);
        // Absent means the dispatcher already popped it
        if pending.remove(&key).is_none() {
            return false;
        }
        let cancelled = entry.try_cancel();
        debug_assert!(cancelled, "entry {} in map but not pending", entry.id());

        self.counters.cancelled();
        if was_first {
            self.notify.notify_one();
        }
        cancelled
    }
}

/// Scheduler backed by a single deadline-ordered map and one dispatcher.
pub struct BaselineScheduler {
    shared: Arc<Shared>,
    lifecycle: Lifecycle,
    handles: Mutex<Vec<JoinHandle<()>>>,
    thread_name: String,
    stop_timeout: Duration,
}

impl BaselineScheduler {
    /// Create a stopped scheduler.
    pub fn new(config: SchedulerConfig) -> SchedulerResult<Self> {
        config.validate()?;
        let counters = Arc::new(Counters::default());
        Ok(Self {
            shared: Arc::new(Shared {
                pending: Mutex::new(BTreeMap::new()),
                notify: Condvar::new(),
                shutdown: AtomicBool::new(false),
                dispatch: Dispatch::new(&config, counters.clone()),
                counters,
            }),
            lifecycle: Lifecycle::new(),
            handles: Mutex::new(Vec::new()),
            thread_name: format!("{}-timer", config.thread_name),
            stop_timeout: config.stop_timeout,
        })
    }

    /// Number of tasks waiting for their deadline
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }
}

impl Scheduler for BaselineScheduler {
    fn start(&self) -> SchedulerResult<()> {
        self.lifecycle.start(|| {
            self.shared.shutdown.store(false, Ordering::Release);
            self.shared.dispatch.open();
            let shared = Arc::clone(&self.shared);
            let handle = spawn_named(self.thread_name.clone(), move || shared.run_loop())?;
            self.handles.lock().push(handle);
            tracing::debug!(thread = %self.thread_name, "baseline scheduler started");
            Ok(())
        })
    }

    fn stop(&self) -> SchedulerResult<()> {
        self.lifecycle.stop(|| {
            let started = Instant::now();
            self.shared.signal_shutdown();
            join_all(&mut self.handles.lock(), self.stop_timeout)?;
            self.shared
                .dispatch
                .quiesce(self.stop_timeout.saturating_sub(started.elapsed()))?;
            tracing::debug!(thread = %self.thread_name, "baseline scheduler stopped");
            Ok(())
        })
    }

    fn schedule_job(&self, work: Job, delay: Duration) -> SchedulerResult<Task> {
        self.lifecycle.ensure_running()?;

        let deadline = deadline_after(Instant::now(), delay);
        let entry = Arc::new(TaskEntry::new(deadline, 0, work));

        let earliest = {
            let mut pending = self.shared.pending.lock();
            let earliest = pending
                .keys()
                .next()
                .map_or(true, |&(first, _)| deadline < first);
            pending.insert((deadline, entry.id()), entry.clone());
            earliest
        };
        // The dispatcher may be sleeping towards a later deadline
        if earliest {
            self.shared.notify.notify_one();
        }

        self.shared.counters.scheduled();
        Ok(Task::new(entry, self.shared.clone()))
    }

    fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    fn stats(&self) -> SchedulerStats {
        self.shared.counters.snapshot(self.pending_count())
    }
}

impl Drop for BaselineScheduler {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            if !matches!(err, SchedulerError::Failed) {
                tracing::warn!(error = %err, "baseline scheduler did not stop cleanly");
            }
        }
    }
}
