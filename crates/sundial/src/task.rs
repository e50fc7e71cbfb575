//! Task handles and their shared state
//!
//! A [`Task`] is returned by every `schedule` call. The scheduler keeps the
//! matching [`TaskEntry`] in its backing structure until the entry either
//! fires or is cancelled; the handle and the structure share the entry
//! through an `Arc`.
//!
//! The entry's state moves away from `Pending` exactly once:
//!
//! ```text
//! Pending -> Dispatching -> Fired
//! Pending -> Cancelled
//! ```

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A unit of work: an opaque zero-argument callable run once.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Unique identifier for a scheduled task
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    /// Generate a new unique TaskId
    pub fn new() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// State of a scheduled task
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Waiting in the scheduler for its deadline
    Pending = 0,
    /// Drained by a dispatcher; the work is queued or running
    Dispatching = 1,
    /// The work has run (successfully or not)
    Fired = 2,
    /// Cancelled before it was drained
    Cancelled = 3,
}

impl TaskState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TaskState::Pending,
            1 => TaskState::Dispatching,
            2 => TaskState::Fired,
            _ => TaskState::Cancelled,
        }
    }

    /// Whether this state is terminal
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Fired | TaskState::Cancelled)
    }
}

/// Scheduler-side record of one task.
pub(crate) struct TaskEntry {
    id: TaskId,
    deadline: Instant,
    /// Wheel tick the entry was placed at (0 for variants without a wheel)
    tick: u64,
    state: AtomicU8,
    work: Mutex<Option<Job>>,
}

impl TaskEntry {
    pub(crate) fn new(deadline: Instant, tick: u64, work: Job) -> Self {
        Self {
            id: TaskId::new(),
            deadline,
            tick,
            state: AtomicU8::new(TaskState::Pending as u8),
            work: Mutex::new(Some(work)),
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    pub(crate) fn tick(&self) -> u64 {
        self.tick
    }

    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Pending -> Cancelled. Drops the work on success.
    pub(crate) fn try_cancel(&self) -> bool {
        if self.transition(TaskState::Pending, TaskState::Cancelled) {
            self.work.lock().take();
            true
        } else {
            false
        }
    }

    /// Pending -> Dispatching
    pub(crate) fn begin_dispatch(&self) -> bool {
        self.transition(TaskState::Pending, TaskState::Dispatching)
    }

    /// Take the work out of a dispatching entry. Returns `None` on any
    /// other state or if the work was already taken.
    pub(crate) fn take_work(&self) -> Option<Job> {
        if self.state() != TaskState::Dispatching {
            return None;
        }
        self.work.lock().take()
    }

    /// Dispatching -> Fired
    pub(crate) fn mark_fired(&self) {
        let fired = self.transition(TaskState::Dispatching, TaskState::Fired);
        debug_assert!(fired, "task {} fired from state {:?}", self.id, self.state());
    }
}

impl fmt::Debug for TaskEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskEntry")
            .field("id", &self.id)
            .field("deadline", &self.deadline)
            .field("tick", &self.tick)
            .field("state", &self.state())
            .finish()
    }
}

/// Removes an entry from whatever structure holds it.
///
/// Implementations must decide the fire/cancel race under the same lock the
/// dispatcher uses to drain the entry.
pub(crate) trait Canceller: Send + Sync {
    fn cancel(&self, entry: &Arc<TaskEntry>) -> bool;
}

/// A cancellable handle for one scheduled unit of work.
///
/// Clones share the same underlying task.
#[derive(Clone)]
pub struct Task {
    entry: Arc<TaskEntry>,
    canceller: Arc<dyn Canceller>,
}

impl Task {
    pub(crate) fn new(entry: Arc<TaskEntry>, canceller: Arc<dyn Canceller>) -> Self {
        Self { entry, canceller }
    }

    /// Cancel the task.
    ///
    /// Returns `true` only for the call that moved the task from pending to
    /// cancelled; the work is then guaranteed never to run. Returns `false`
    /// if the task already fired, is being dispatched, or was cancelled
    /// before.
    pub fn cancel(&self) -> bool {
        if self.entry.state() != TaskState::Pending {
            return false;
        }
        self.canceller.cancel(&self.entry)
    }

    /// Task identifier
    pub fn id(&self) -> TaskId {
        self.entry.id()
    }

    /// Current state
    pub fn state(&self) -> TaskState {
        self.entry.state()
    }

    /// Monotonic time at which the task becomes due
    pub fn deadline(&self) -> Instant {
        self.entry.deadline()
    }

    /// Whether the task has fired or been cancelled
    pub fn is_done(&self) -> bool {
        self.entry.state().is_terminal()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id())
            .field("deadline", &self.deadline())
            .field("state", &self.state())
            .finish()
    }
}
