//! Scheduler counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Scheduler statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Tasks accepted by `schedule`
    pub scheduled: u64,

    /// Tasks whose work has run
    pub fired: u64,

    /// Tasks cancelled before they were drained
    pub cancelled: u64,

    /// Fired tasks whose work panicked
    pub faults: u64,

    /// Tasks still waiting in the scheduler
    pub pending: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    scheduled: AtomicU64,
    fired: AtomicU64,
    cancelled: AtomicU64,
    faults: AtomicU64,
}

impl Counters {
    pub(crate) fn scheduled(&self) {
        self.scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn fired(&self) {
        self.fired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, pending: usize) -> SchedulerStats {
        SchedulerStats {
            scheduled: self.scheduled.load(Ordering::Relaxed),
            fired: self.fired.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            pending,
        }
    }
}
