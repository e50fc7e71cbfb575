//! Adapter onto an existing delayed-execution facility
//!
//! [`DelegatingScheduler`] forwards every `schedule` to a
//! [`DelayedExecutor`] and wraps the returned [`DelegateHandle`] so that
//! [`Task::cancel`] reports the delegate's own cancellation outcome.
//! [`TokioDelayedExecutor`] provides the facility on a tokio runtime, either
//! owned by the executor or borrowed from the host.

use crate::config::SchedulerConfig;
use crate::dispatch::Dispatch;
use crate::error::{SchedulerError, SchedulerResult};
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::scheduler::{deadline_after, Scheduler};
use crate::stats::{Counters, SchedulerStats};
use crate::task::{Canceller, Job, Task, TaskEntry};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::{Builder, Handle, Runtime};

/// A generic facility that runs a job once after a delay.
pub trait DelayedExecutor: Send + Sync {
    /// Bring the facility up. Called from [`Scheduler::start`].
    fn start(&self) -> SchedulerResult<()> {
        Ok(())
    }

    /// Tear the facility down within `timeout`. Called from [`Scheduler::stop`].
    fn stop(&self, _timeout: Duration) -> SchedulerResult<()> {
        Ok(())
    }

    /// Run `job` once `delay` has elapsed.
    fn execute_after(&self, job: Job, delay: Duration) -> SchedulerResult<Box<dyn DelegateHandle>>;
}

/// Handle to one job submitted to a [`DelayedExecutor`]
pub trait DelegateHandle: Send + Sync {
    /// Prevent the job from running. Returns `true` only if this call did so.
    fn cancel(&self) -> bool;
}

/// Cancellation path for delegated tasks
struct DelegatedCancel {
    handle: Box<dyn DelegateHandle>,
    pending: Arc<AtomicUsize>,
    counters: Arc<Counters>,
}

impl Canceller for DelegatedCancel {
    fn cancel(&self, entry: &Arc<TaskEntry>) -> bool {
        if !self.handle.cancel() {
            return false;
        }
        // The delegate dropped the job; the entry can only still be pending
        // unless the delegate reported a cancel after starting it
        if !entry.try_cancel() {
            return false;
        }
        self.pending.fetch_sub(1, Ordering::Relaxed);
        self.counters.cancelled();
        true
    }
}

/// Scheduler that forwards to a [`DelayedExecutor`].
pub struct DelegatingScheduler {
    delegate: Arc<dyn DelayedExecutor>,
    lifecycle: Lifecycle,
    dispatch: Dispatch,
    counters: Arc<Counters>,
    pending: Arc<AtomicUsize>,
    stop_timeout: Duration,
}

impl DelegatingScheduler {
    /// Create a stopped scheduler on top of `delegate`.
    pub fn new(delegate: Arc<dyn DelayedExecutor>, config: SchedulerConfig) -> SchedulerResult<Self> {
        config.validate()?;
        let counters = Arc::new(Counters::default());
        Ok(Self {
            delegate,
            lifecycle: Lifecycle::new(),
            dispatch: Dispatch::new(&config, counters.clone()),
            counters,
            pending: Arc::new(AtomicUsize::new(0)),
            stop_timeout: config.stop_timeout,
        })
    }
}

impl Scheduler for DelegatingScheduler {
    fn start(&self) -> SchedulerResult<()> {
        self.lifecycle.start(|| {
            self.delegate.start()?;
            self.dispatch.open();
            Ok(())
        })
    }

    /// Stops firing, then stops the delegate. Jobs of a delegate that keeps
    /// running (such as a borrowed tokio runtime) stay armed, but one that
    /// wakes while the scheduler is stopped does nothing and its task stays
    /// `Pending`.
    fn stop(&self) -> SchedulerResult<()> {
        self.lifecycle.stop(|| {
            let started = Instant::now();
            self.dispatch.quiesce(self.stop_timeout)?;
            self.delegate
                .stop(self.stop_timeout.saturating_sub(started.elapsed()))
        })
    }

    fn schedule_job(&self, work: Job, delay: Duration) -> SchedulerResult<Task> {
        self.lifecycle.ensure_running()?;

        let entry = Arc::new(TaskEntry::new(deadline_after(Instant::now(), delay), 0, work));
        let job: Job = {
            let entry = entry.clone();
            let dispatch = self.dispatch.clone();
            let pending = self.pending.clone();
            Box::new(move || {
                // A job waking after stop leaves its task pending
                let Some(admission) = dispatch.admit() else {
                    return;
                };
                if entry.begin_dispatch() {
                    pending.fetch_sub(1, Ordering::Relaxed);
                    dispatch.fire_admitted(entry, admission);
                }
            })
        };

        self.pending.fetch_add(1, Ordering::Relaxed);
        let handle = match self.delegate.execute_after(job, delay) {
            Ok(handle) => handle,
            Err(err) => {
                self.pending.fetch_sub(1, Ordering::Relaxed);
                return Err(err);
            }
        };

        self.counters.scheduled();
        let canceller = DelegatedCancel {
            handle,
            pending: self.pending.clone(),
            counters: self.counters.clone(),
        };
        Ok(Task::new(entry, Arc::new(canceller)))
    }

    fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    fn stats(&self) -> SchedulerStats {
        self.counters.snapshot(self.pending.load(Ordering::Relaxed))
    }
}

impl Drop for DelegatingScheduler {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            if !matches!(err, SchedulerError::Failed) {
                tracing::warn!(error = %err, "delegating scheduler did not stop cleanly");
            }
        }
    }
}

const WAITING: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;

/// Handle to a delayed job on a tokio runtime
struct TokioHandle {
    state: Arc<AtomicU8>,
    join: tokio::task::JoinHandle<()>,
}

impl DelegateHandle for TokioHandle {
    fn cancel(&self) -> bool {
        let cancelled = self
            .state
            .compare_exchange(WAITING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if cancelled {
            self.join.abort();
        }
        cancelled
    }
}

enum RuntimeSource {
    Owned {
        worker_threads: usize,
        thread_name: String,
        runtime: Mutex<Option<Runtime>>,
    },
    Borrowed(Handle),
}

/// [`DelayedExecutor`] backed by tokio timers.
///
/// Jobs sleep on the runtime and then run on its blocking pool. An owned
/// runtime is built by `start` and shut down by `stop`, which drops every
/// job still sleeping. A borrowed runtime belongs to the host; `stop` leaves
/// it and its jobs alone.
pub struct TokioDelayedExecutor {
    source: RuntimeSource,
}

impl TokioDelayedExecutor {
    /// Executor owning a multi-threaded runtime with `worker_threads` workers
    /// (0 = number of CPU cores).
    pub fn owned(worker_threads: usize, thread_name: impl Into<String>) -> Self {
        let worker_threads = if worker_threads == 0 {
            num_cpus::get()
        } else {
            worker_threads
        };
        Self {
            source: RuntimeSource::Owned {
                worker_threads,
                thread_name: thread_name.into(),
                runtime: Mutex::new(None),
            },
        }
    }

    /// Executor using a runtime owned by the host.
    pub fn with_handle(handle: Handle) -> Self {
        Self {
            source: RuntimeSource::Borrowed(handle),
        }
    }

    fn handle(&self) -> SchedulerResult<Handle> {
        match &self.source {
            RuntimeSource::Owned { runtime, .. } => runtime
                .lock()
                .as_ref()
                .map(|rt| rt.handle().clone())
                .ok_or_else(|| SchedulerError::Delegate("tokio runtime is not running".to_string())),
            RuntimeSource::Borrowed(handle) => Ok(handle.clone()),
        }
    }
}

impl DelayedExecutor for TokioDelayedExecutor {
    fn start(&self) -> SchedulerResult<()> {
        let RuntimeSource::Owned {
            worker_threads,
            thread_name,
            runtime,
        } = &self.source
        else {
            return Ok(());
        };

        let mut runtime = runtime.lock();
        if runtime.is_none() {
            let rt = Builder::new_multi_thread()
                .worker_threads(*worker_threads)
                .thread_name(thread_name.clone())
                .enable_time()
                .build()
                .map_err(|source| SchedulerError::Spawn {
                    name: thread_name.clone(),
                    source,
                })?;
            *runtime = Some(rt);
            tracing::debug!(worker_threads, thread = %thread_name, "tokio delegate started");
        }
        Ok(())
    }

    fn stop(&self, timeout: Duration) -> SchedulerResult<()> {
        if let RuntimeSource::Owned { runtime, .. } = &self.source {
            let rt = runtime.lock().take();
            if let Some(rt) = rt {
                rt.shutdown_timeout(timeout);
                tracing::debug!("tokio delegate stopped");
            }
        }
        Ok(())
    }

    fn execute_after(&self, job: Job, delay: Duration) -> SchedulerResult<Box<dyn DelegateHandle>> {
        let handle = self.handle()?;
        let state = Arc::new(AtomicU8::new(WAITING));
        let task_state = state.clone();

        let join = handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if task_state
                .compare_exchange(WAITING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let _ = tokio::task::spawn_blocking(job).await;
            }
        });

        Ok(Box::new(TokioHandle { state, join }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SchedulerExt;
    use crate::task::TaskState;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    /// Delegate that records submissions and never runs them
    #[derive(Default)]
    struct Recording {
        delays: Mutex<Vec<Duration>>,
        jobs: Mutex<Vec<Job>>,
        cancel_outcome: bool,
        fail_start: bool,
        fail_stop: bool,
    }

    struct FixedHandle(bool);

    impl DelegateHandle for FixedHandle {
        fn cancel(&self) -> bool {
            self.0
        }
    }

    impl DelayedExecutor for Recording {
        fn start(&self) -> SchedulerResult<()> {
            if self.fail_start {
                return Err(SchedulerError::Delegate("unavailable".to_string()));
            }
            Ok(())
        }

        fn stop(&self, _timeout: Duration) -> SchedulerResult<()> {
            if self.fail_stop {
                return Err(SchedulerError::Delegate("stuck".to_string()));
            }
            Ok(())
        }

        fn execute_after(&self, job: Job, delay: Duration) -> SchedulerResult<Box<dyn DelegateHandle>> {
            self.delays.lock().push(delay);
            self.jobs.lock().push(job);
            Ok(Box::new(FixedHandle(self.cancel_outcome)))
        }
    }

    fn started(delegate: Arc<dyn DelayedExecutor>) -> DelegatingScheduler {
        let scheduler = DelegatingScheduler::new(delegate, SchedulerConfig::default()).unwrap();
        scheduler.start().unwrap();
        scheduler
    }

    #[test]
    fn test_forwards_delay() {
        let delegate = Arc::new(Recording::default());
        let scheduler = started(delegate.clone());
        scheduler.schedule(|| {}, Duration::from_millis(1500)).unwrap();
        assert_eq!(*delegate.delays.lock(), vec![Duration::from_millis(1500)]);
        assert_eq!(scheduler.stats().pending, 1);
    }

    #[test]
    fn test_cancel_reflects_delegate_refusal() {
        let delegate = Arc::new(Recording {
            cancel_outcome: false,
            ..Default::default()
        });
        let scheduler = started(delegate.clone());
        let task = scheduler.schedule(|| {}, Duration::from_secs(1)).unwrap();

        assert!(!task.cancel());
        assert_eq!(task.state(), TaskState::Pending);

        // The delegate still owns the job and may fire it
        let job = delegate.jobs.lock().pop().unwrap();
        job();
        assert_eq!(task.state(), TaskState::Fired);
        assert_eq!(scheduler.stats().fired, 1);
    }

    #[test]
    fn test_cancel_reflects_delegate_success() {
        let delegate = Arc::new(Recording {
            cancel_outcome: true,
            ..Default::default()
        });
        let scheduler = started(delegate);
        let task = scheduler.schedule(|| {}, Duration::from_secs(1)).unwrap();

        assert!(task.cancel());
        assert_eq!(task.state(), TaskState::Cancelled);
        assert!(!task.cancel());

        let stats = scheduler.stats();
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn test_job_after_cancel_is_noop() {
        let delegate = Arc::new(Recording {
            cancel_outcome: true,
            ..Default::default()
        });
        let scheduler = started(delegate.clone());
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let task = scheduler
            .schedule(move || flag.store(true, Ordering::SeqCst), Duration::from_secs(1))
            .unwrap();
        assert!(task.cancel());

        // A delegate that runs the job anyway cannot resurrect the task
        let job = delegate.jobs.lock().pop().unwrap();
        job();
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(task.state(), TaskState::Cancelled);
    }

    #[test]
    fn test_delegate_start_failure() {
        let delegate = Arc::new(Recording {
            fail_start: true,
            ..Default::default()
        });
        let scheduler = DelegatingScheduler::new(delegate, SchedulerConfig::default()).unwrap();
        assert!(matches!(scheduler.start(), Err(SchedulerError::Delegate(_))));
        assert_eq!(scheduler.state(), LifecycleState::Stopped);
    }

    #[test]
    fn test_tokio_owned_fire_and_cancel() {
        let delegate = Arc::new(TokioDelayedExecutor::owned(2, "sundial-tokio-test"));
        let scheduler = started(delegate);

        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let task = scheduler
            .schedule(move || flag.store(true, Ordering::SeqCst), Duration::from_millis(20))
            .unwrap();

        let cancelled_ran = Arc::new(AtomicBool::new(false));
        let flag = cancelled_ran.clone();
        let cancelled = scheduler
            .schedule(move || flag.store(true, Ordering::SeqCst), Duration::from_millis(50))
            .unwrap();
        assert!(cancelled.cancel());

        thread::sleep(Duration::from_millis(150));
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(task.state(), TaskState::Fired);
        assert!(!task.cancel());
        assert!(!cancelled_ran.load(Ordering::SeqCst));

        scheduler.stop().unwrap();
        assert!(matches!(
            scheduler.schedule(|| {}, Duration::ZERO),
            Err(SchedulerError::NotRunning { .. })
        ));
    }

    #[test]
    fn test_tokio_owned_requires_start() {
        let delegate = TokioDelayedExecutor::owned(1, "sundial-tokio-test");
        assert!(matches!(
            delegate.execute_after(Box::new(|| {}), Duration::ZERO),
            Err(SchedulerError::Delegate(_))
        ));
    }

    #[test]
    fn test_tokio_borrowed_handle() {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .enable_time()
            .build()
            .unwrap();
        let delegate = Arc::new(TokioDelayedExecutor::with_handle(runtime.handle().clone()));
        let scheduler = started(delegate);

        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        scheduler
            .schedule(move || flag.store(true, Ordering::SeqCst), Duration::from_millis(10))
            .unwrap();

        thread::sleep(Duration::from_millis(100));
        assert!(fired.load(Ordering::SeqCst));

        // Stopping the scheduler leaves the host runtime running
        scheduler.stop().unwrap();
        assert!(runtime.handle().block_on(async { true }));
    }

    #[test]
    fn test_tokio_borrowed_job_waking_after_stop_does_not_fire() {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .enable_time()
            .build()
            .unwrap();
        let delegate = Arc::new(TokioDelayedExecutor::with_handle(runtime.handle().clone()));
        let scheduler = started(delegate);

        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let task = scheduler
            .schedule(move || flag.store(true, Ordering::SeqCst), Duration::from_millis(50))
            .unwrap();

        scheduler.stop().unwrap();
        assert_eq!(scheduler.state(), LifecycleState::Stopped);
        thread::sleep(Duration::from_millis(200));
        assert!(!fired.load(Ordering::SeqCst));
        assert_eq!(task.state(), TaskState::Pending);

        // Tasks scheduled after a restart fire again
        scheduler.start().unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        scheduler
            .schedule(move || flag.store(true, Ordering::SeqCst), Duration::from_millis(10))
            .unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(fired.load(Ordering::SeqCst));
        scheduler.stop().unwrap();
    }

    #[test]
    fn test_drop_logs_failed_stop() {
        let logs = crate::testing::capture_logs(|| {
            let delegate = Arc::new(Recording {
                fail_stop: true,
                ..Default::default()
            });
            drop(started(delegate));
        });
        assert!(logs.contains("delegating scheduler did not stop cleanly"), "{}", logs);
    }
}
