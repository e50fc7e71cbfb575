//! Fault reporting for units of work
//!
//! A panic raised by a job is caught where the job runs (on a dispatcher
//! thread or inside a worker-pool invocation) and handed to the host's
//! [`FaultHandler`]. It never reaches the dispatcher loop, other tasks, or
//! the caller of `schedule`.

use crate::task::TaskId;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// A unit of work failed while executing
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("task {task} panicked: {message}")]
pub struct WorkFault {
    /// Task whose work failed
    pub task: TaskId,
    /// Panic message, if it was a string
    pub message: String,
}

/// Host-supplied sink for unit-of-work failures.
pub trait FaultHandler: Send + Sync {
    /// Called once per failed unit of work, on the thread that ran it
    fn handle(&self, fault: WorkFault);
}

impl<F> FaultHandler for F
where
    F: Fn(WorkFault) + Send + Sync,
{
    fn handle(&self, fault: WorkFault) {
        self(fault)
    }
}

/// Default sink: logs every fault at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogFaults;

impl FaultHandler for LogFaults {
    fn handle(&self, fault: WorkFault) {
        tracing::error!(task = %fault.task, message = %fault.message, "scheduled task panicked");
    }
}

/// Run `work`, converting a panic into a [`WorkFault`].
pub(crate) fn catch_fault<F: FnOnce()>(task: TaskId, work: F) -> Result<(), WorkFault> {
    panic::catch_unwind(AssertUnwindSafe(work)).map_err(|payload| WorkFault {
        task,
        message: panic_message(payload.as_ref()),
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
