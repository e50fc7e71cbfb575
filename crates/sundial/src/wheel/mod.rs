//! Concurrent time-wheel scheduler
//!
//! The wheel is a fixed array of `N` buckets, each covering one tick of
//! duration `T`. A task due at tick `t` lives in bucket `t mod N`; its
//! revolution is `t / N`.
//!
//! # Dispatch
//!
//! Dispatcher threads share a cursor holding the next tick to drain. A
//! dispatcher sleeps until that tick starts, claims it with a CAS on the
//! cursor, locks the tick's bucket, and takes every entry of the current
//! revolution (moving each Pending -> Dispatching). The lock is released
//! before any work runs, either inline or on the configured executor.
//!
//! # Cancellation
//!
//! `cancel` locks the bucket its entry was placed in, the same lock the
//! drain takes. Whichever of the two gets the lock first decides the task:
//! a drain removes the entry before releasing the lock, so a later cancel
//! finds nothing and returns `false`; a cancel removes it first, so the
//! drain never sees it.
//!
//! # Insertion
//!
//! Each bucket records the highest tick it was drained for. A producer whose
//! target tick was already drained moves to the next tick instead, so a task
//! due "now" is picked up on the next tick rather than a revolution later.

mod bucket;
mod clock;

use self::bucket::Bucket;
use self::clock::WheelClock;
use crate::config::SchedulerConfig;
use crate::dispatch::Dispatch;
use crate::error::{SchedulerError, SchedulerResult};
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::scheduler::{deadline_after, Scheduler};
use crate::stats::{Counters, SchedulerStats};
use crate::task::{Canceller, Job, Task, TaskEntry};
use crate::thread::{join_all, spawn_named};
use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// State shared by producers, cancellers and dispatcher threads
struct Wheel {
    clock: WheelClock,
    buckets: Box<[CachePadded<Mutex<Bucket>>]>,
    /// Next tick to be claimed by a dispatcher
    cursor: AtomicU64,
    /// Entries currently held in buckets
    pending: AtomicUsize,
    /// Shutdown flag; dispatchers sleep on `wake` while holding it
    shutdown: Mutex<bool>,
    wake: Condvar,
    dispatch: Dispatch,
    counters: Arc<Counters>,
}

impl Wheel {
    fn slot(&self, tick: u64) -> usize {
        (tick % self.buckets.len() as u64) as usize
    }

    fn revolution(&self, tick: u64) -> u64 {
        tick / self.buckets.len() as u64
    }

    /// Place a new entry in the first undrained tick at or after its due tick.
    fn insert(&self, deadline: Instant, work: Job) -> Arc<TaskEntry> {
        let due = self.clock.due_tick(deadline);
        // Ticks before the cursor are claimed; start from the cursor
        let mut tick = due.max(self.cursor.load(Ordering::Acquire));
        loop {
            let mut bucket = self.buckets[self.slot(tick)].lock();
            if bucket.has_drained(tick) {
                drop(bucket);
                tick += 1;
                continue;
            }
            let entry = Arc::new(TaskEntry::new(deadline, tick, work));
            bucket.insert(entry.clone());
            self.pending.fetch_add(1, Ordering::Relaxed);
            return entry;
        }
    }

    /// Drain `tick`, appending dispatched entries to `out`.
    fn drain(&self, tick: u64, out: &mut Vec<Arc<TaskEntry>>) {
        let removed = self.buckets[self.slot(tick)].lock().drain(tick, out);
        if removed > 0 {
            self.pending.fetch_sub(removed, Ordering::Relaxed);
            tracing::trace!(
                tick,
                slot = self.slot(tick),
                revolution = self.revolution(tick),
                removed,
                "drained bucket"
            );
        }
    }

    fn run_loop(&self, dispatcher: usize) {
        let mut due = Vec::new();
        loop {
            let tick = self.cursor.load(Ordering::Acquire);
            if !self.sleep_until(self.clock.instant_of(tick)) {
                break;
            }
            // Another dispatcher claimed this tick while we slept
            if self
                .cursor
                .compare_exchange(tick, tick + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            self.drain(tick, &mut due);
            for entry in due.drain(..) {
                self.dispatch.fire(entry);
            }
        }

        tracing::debug!(dispatcher, "wheel dispatcher shutting down");
    }

    /// Sleep until `deadline`. Returns `false` if shutdown was signalled.
    fn sleep_until(&self, deadline: Instant) -> bool {
        let mut shutdown = self.shutdown.lock();
        loop {
            if *shutdown {
                return false;
            }
            if Instant::now() >= deadline {
                return true;
            }
            self.wake.wait_until(&mut shutdown, deadline);
        }
    }

    fn signal_shutdown(&self, stop: bool) {
        *self.shutdown.lock() = stop;
        if stop {
            self.wake.notify_all();
        }
    }
}

impl Canceller for Wheel {
    fn cancel(&self, entry: &Arc<TaskEntry>) -> bool {
        let mut bucket = self.buckets[self.slot(entry.tick())].lock();
        if !bucket.remove(entry) {
            return false;
        }
        let cancelled = entry.try_cancel();
        debug_assert!(cancelled, "entry {} in bucket but not pending", entry.id());
        drop(bucket);

        self.pending.fetch_sub(1, Ordering::Relaxed);
        self.counters.cancelled();
        cancelled
    }
}

/// Scheduler backed by a bucketed time wheel with per-bucket locking.
///
/// Without an executor the dispatcher runs work itself, so slow work delays
/// later ticks; configure an executor (or several dispatchers) to isolate
/// the wheel from the work it fires.
pub struct WheelScheduler {
    wheel: Arc<Wheel>,
    lifecycle: Lifecycle,
    handles: Mutex<Vec<JoinHandle<()>>>,
    dispatchers: usize,
    thread_name: String,
    stop_timeout: Duration,
}

impl WheelScheduler {
    /// Create a stopped scheduler.
    pub fn new(config: SchedulerConfig) -> SchedulerResult<Self> {
        config.validate()?;
        let counters = Arc::new(Counters::default());
        let buckets = (0..config.wheel_size)
            .map(|_| CachePadded::new(Mutex::new(Bucket::default())))
            .collect();

        Ok(Self {
            wheel: Arc::new(Wheel {
                clock: WheelClock::new(Instant::now(), config.effective_tick_nanos()),
                buckets,
                cursor: AtomicU64::new(0),
                pending: AtomicUsize::new(0),
                shutdown: Mutex::new(false),
                wake: Condvar::new(),
                dispatch: Dispatch::new(&config, counters.clone()),
                counters,
            }),
            lifecycle: Lifecycle::new(),
            handles: Mutex::new(Vec::new()),
            dispatchers: config.dispatchers,
            thread_name: config.thread_name,
            stop_timeout: config.stop_timeout,
        })
    }

    /// Duration of one tick
    pub fn tick(&self) -> Duration {
        self.wheel.clock.tick_duration()
    }

    /// Number of buckets
    pub fn wheel_size(&self) -> usize {
        self.wheel.buckets.len()
    }

    /// Number of tasks waiting in buckets
    pub fn pending_count(&self) -> usize {
        self.wheel.pending.load(Ordering::Relaxed)
    }

    fn spawn_dispatchers(&self) -> SchedulerResult<()> {
        self.wheel.signal_shutdown(false);
        self.wheel.dispatch.open();

        // Nothing to catch up on: skip the ticks that passed while stopped
        if self.pending_count() == 0 {
            let now = self.wheel.clock.tick_at(Instant::now());
            self.wheel.cursor.fetch_max(now, Ordering::AcqRel);
        }

        let mut handles = self.handles.lock();
        for i in 0..self.dispatchers {
            let wheel = Arc::clone(&self.wheel);
            let name = format!("{}-wheel-{}", self.thread_name, i);
            match spawn_named(name, move || wheel.run_loop(i)) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    self.wheel.signal_shutdown(true);
                    let _ = join_all(&mut handles, self.stop_timeout);
                    return Err(err);
                }
            }
        }

        tracing::debug!(
            tick = ?self.tick(),
            wheel_size = self.wheel_size(),
            dispatchers = self.dispatchers,
            "wheel scheduler started"
        );
        Ok(())
    }
}

impl Scheduler for WheelScheduler {
    fn start(&self) -> SchedulerResult<()> {
        self.lifecycle.start(|| self.spawn_dispatchers())
    }

    fn stop(&self) -> SchedulerResult<()> {
        self.lifecycle.stop(|| {
            let started = Instant::now();
            self.wheel.signal_shutdown(true);
            join_all(&mut self.handles.lock(), self.stop_timeout)?;
            // Drained tasks may still be queued on the executor
            self.wheel
                .dispatch
                .quiesce(self.stop_timeout.saturating_sub(started.elapsed()))?;
            tracing::debug!(pending = self.pending_count(), "wheel scheduler stopped");
            Ok(())
        })
    }

    fn schedule_job(&self, work: Job, delay: Duration) -> SchedulerResult<Task> {
        self.lifecycle.ensure_running()?;

        let deadline = deadline_after(Instant::now(), delay);
        let entry = self.wheel.insert(deadline, work);
        self.wheel.counters.scheduled();
        Ok(Task::new(entry, self.wheel.clone()))
    }

    fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    fn stats(&self) -> SchedulerStats {
        self.wheel.counters.snapshot(self.pending_count())
    }
}

impl Drop for WheelScheduler {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            if !matches!(err, SchedulerError::Failed) {
                tracing::warn!(error = %err, "wheel scheduler did not stop cleanly");
            }
        }
    }
}
