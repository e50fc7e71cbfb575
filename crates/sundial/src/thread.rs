//! Named thread spawning and bounded joins

use crate::error::{SchedulerError, SchedulerResult};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Spawn a named OS thread.
pub(crate) fn spawn_named<F>(name: String, f: F) -> SchedulerResult<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .map_err(|source| SchedulerError::Spawn { name, source })
}

/// Join every handle within `timeout`.
///
/// Joined handles are removed from `handles`; threads still alive at the
/// deadline stay in it so a later call can retry. A handle belonging to the
/// calling thread (a job stopping its own scheduler) is detached rather than
/// joined.
pub(crate) fn join_all(handles: &mut Vec<JoinHandle<()>>, timeout: Duration) -> SchedulerResult<()> {
    let deadline = Instant::now() + timeout;
    let current = thread::current().id();
    let mut stuck = Vec::new();
    let mut panicked = None;

    for handle in handles.drain(..) {
        if handle.thread().id() == current {
            continue;
        }
        loop {
            if handle.is_finished() {
                let name = handle.thread().name().unwrap_or("<unnamed>").to_string();
                if handle.join().is_err() {
                    panicked = Some(name);
                }
                break;
            }
            if Instant::now() >= deadline {
                stuck.push(handle);
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    let remaining = stuck.len();
    *handles = stuck;

    if remaining > 0 {
        return Err(SchedulerError::StopTimeout {
            timeout,
            stuck: remaining,
        });
    }
    match panicked {
        Some(name) => Err(SchedulerError::DispatcherPanicked(name)),
        None => Ok(()),
    }
}
