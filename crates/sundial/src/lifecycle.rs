//! Scheduler lifecycle state machine

use crate::error::{SchedulerError, SchedulerResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a scheduler instance
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    /// Not running; `schedule` is rejected
    Stopped = 0,
    /// `start` is spawning dispatcher threads
    Starting = 1,
    /// Accepting and firing tasks
    Running = 2,
    /// `stop` is signalling and joining dispatcher threads
    Stopping = 3,
    /// A stop failed; the instance is unusable
    Failed = 4,
}

impl LifecycleState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LifecycleState::Stopped,
            1 => LifecycleState::Starting,
            2 => LifecycleState::Running,
            3 => LifecycleState::Stopping,
            _ => LifecycleState::Failed,
        }
    }
}

/// Serializes start/stop and publishes the current state to producers.
pub(crate) struct Lifecycle {
    state: AtomicU8,
    transition: Mutex<()>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::Stopped as u8),
            transition: Mutex::new(()),
        }
    }

    pub(crate) fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set(&self, state: LifecycleState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Reject producers unless the scheduler is running.
    pub(crate) fn ensure_running(&self) -> SchedulerResult<()> {
        match self.state() {
            LifecycleState::Running => Ok(()),
            LifecycleState::Failed => Err(SchedulerError::Failed),
            state => Err(SchedulerError::NotRunning { state }),
        }
    }

    /// Run `spawn` to move Stopped -> Running.
    ///
    /// Calling this while already running is a no-op. If `spawn` fails the
    /// state falls back to Stopped; `spawn` is responsible for tearing down
    /// whatever it started before failing.
    pub(crate) fn start<F>(&self, spawn: F) -> SchedulerResult<()>
    where
        F: FnOnce() -> SchedulerResult<()>,
    {
        let _guard = self.transition.lock();
        match self.state() {
            LifecycleState::Stopped => {}
            LifecycleState::Failed => return Err(SchedulerError::Failed),
            _ => return Ok(()),
        }

        self.set(LifecycleState::Starting);
        match spawn() {
            Ok(()) => {
                self.set(LifecycleState::Running);
                Ok(())
            }
            Err(err) => {
                self.set(LifecycleState::Stopped);
                Err(err)
            }
        }
    }

    /// Run `shutdown` to move Running -> Stopped.
    ///
    /// Calling this while stopped is a no-op. If `shutdown` fails the
    /// instance becomes Failed. On a failed instance `shutdown` is retried
    /// so a caller can find out whether the stuck threads have since exited,
    /// but the instance stays Failed either way.
    pub(crate) fn stop<F>(&self, shutdown: F) -> SchedulerResult<()>
    where
        F: FnOnce() -> SchedulerResult<()>,
    {
        let _guard = self.transition.lock();
        match self.state() {
            LifecycleState::Failed => return shutdown(),
            LifecycleState::Running => {}
            _ => return Ok(()),
        }

        self.set(LifecycleState::Stopping);
        match shutdown() {
            Ok(()) => {
                self.set(LifecycleState::Stopped);
                Ok(())
            }
            Err(err) => {
                self.set(LifecycleState::Failed);
                Err(err)
            }
        }
    }
}
