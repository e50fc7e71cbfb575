//! The scheduler capability contract and variant selection

use crate::baseline::BaselineScheduler;
use crate::config::SchedulerConfig;
use crate::delegate::{DelayedExecutor, DelegatingScheduler};
use crate::error::SchedulerResult;
use crate::lifecycle::LifecycleState;
use crate::stats::SchedulerStats;
use crate::task::{Job, Task};
use crate::wheel::WheelScheduler;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Fires units of work after a delay and lets callers cancel them first.
///
/// All methods take `&self`; a scheduler is shared between producer threads
/// behind an `Arc`.
pub trait Scheduler: Send + Sync {
    /// Spawn the dispatcher thread(s). A no-op if already running.
    fn start(&self) -> SchedulerResult<()>;

    /// Signal and join the dispatcher thread(s). A no-op if already stopped.
    ///
    /// When this returns `Ok`, no task starts firing any more and every task
    /// already handed out for firing (including work queued on an executor)
    /// has finished, except work calling `stop` on its own scheduler. Waiting
    /// is bounded by the configured stop timeout.
    fn stop(&self) -> SchedulerResult<()>;

    /// Schedule `work` to run once `delay` has elapsed.
    ///
    /// Never runs `work` on the calling thread. Fails with
    /// [`SchedulerError::NotRunning`](crate::SchedulerError::NotRunning)
    /// unless the scheduler is running.
    fn schedule_job(&self, work: Job, delay: Duration) -> SchedulerResult<Task>;

    /// Current lifecycle state
    fn state(&self) -> LifecycleState;

    /// Counter snapshot
    fn stats(&self) -> SchedulerStats;
}

/// Convenience methods for any [`Scheduler`]
pub trait SchedulerExt: Scheduler {
    /// Schedule a closure to run once `delay` has elapsed.
    fn schedule<F>(&self, work: F, delay: Duration) -> SchedulerResult<Task>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_job(Box::new(work), delay)
    }
}

impl<S: Scheduler + ?Sized> SchedulerExt for S {}

/// Which scheduler implementation to build
#[derive(Clone)]
pub enum SchedulerKind {
    /// Single ordered structure, one dispatcher thread
    Baseline,
    /// Concurrent bucketed time wheel
    Wheel,
    /// Pass-through onto an existing delayed-execution facility
    Delegating(Arc<dyn DelayedExecutor>),
}

impl fmt::Debug for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerKind::Baseline => f.write_str("Baseline"),
            SchedulerKind::Wheel => f.write_str("Wheel"),
            SchedulerKind::Delegating(_) => f.write_str("Delegating"),
        }
    }
}

/// Build a scheduler of the given kind. The scheduler is not started.
pub fn build(kind: SchedulerKind, config: SchedulerConfig) -> SchedulerResult<Arc<dyn Scheduler>> {
    let scheduler: Arc<dyn Scheduler> = match kind {
        SchedulerKind::Baseline => Arc::new(BaselineScheduler::new(config)?),
        SchedulerKind::Wheel => Arc::new(WheelScheduler::new(config)?),
        SchedulerKind::Delegating(delegate) => Arc::new(DelegatingScheduler::new(delegate, config)?),
    };
    Ok(scheduler)
}

/// Absolute deadline for a delay, saturating far in the future on overflow.
pub(crate) fn deadline_after(now: Instant, delay: Duration) -> Instant {
    // ~30 years; `Instant` cannot represent arbitrary far-future points
    const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}
