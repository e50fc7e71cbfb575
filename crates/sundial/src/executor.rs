//! Worker pools for running drained tasks off the dispatcher thread

use crate::error::SchedulerResult;
use crate::task::Job;
use crate::thread::{join_all, spawn_named};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::panic::{self, AssertUnwindSafe};
use std::thread::JoinHandle;
use std::time::Duration;

/// Accepts units of work and runs them independently of the caller.
///
/// Schedulers hand every drained task to the executor and move on without
/// waiting for it to finish.
pub trait Executor: Send + Sync {
    /// Submit a job. A rejected job is handed back to the caller.
    fn execute(&self, job: Job) -> Result<(), Job>;
}

/// Fixed-size pool of named worker threads fed by an unbounded channel.
pub struct ThreadPool {
    job_tx: RwLock<Option<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl ThreadPool {
    /// Spawn a pool of `size` workers named `{name}-{i}`.
    /// If `size` is 0, defaults to the number of CPU cores.
    pub fn new(size: usize, name: &str) -> SchedulerResult<Self> {
        let size = if size == 0 { num_cpus::get() } else { size };
        let (job_tx, job_rx) = channel::unbounded::<Job>();

        let mut handles = Vec::with_capacity(size);
        for i in 0..size {
            let rx = job_rx.clone();
            match spawn_named(format!("{}-{}", name, i), move || Self::worker_loop(rx)) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    // Disconnect the channel so already spawned workers exit
                    drop(job_tx);
                    let _ = join_all(&mut handles, Duration::from_secs(2));
                    return Err(err);
                }
            }
        }

        tracing::debug!(size, name, "worker pool started");
        Ok(Self {
            job_tx: RwLock::new(Some(job_tx)),
            handles: Mutex::new(handles),
            size,
        })
    }

    /// Number of worker threads
    pub fn size(&self) -> usize {
        self.size
    }

    /// Stop accepting jobs, let workers drain the queue, and join them.
    pub fn shutdown(&self, timeout: Duration) -> SchedulerResult<()> {
        self.job_tx.write().take();
        join_all(&mut self.handles.lock(), timeout)
    }

    fn worker_loop(jobs: Receiver<Job>) {
        // Runs until every sender is gone and the queue is empty
        while let Ok(job) = jobs.recv() {
            // Scheduler jobs isolate their own faults; this only protects
            // the worker from jobs submitted directly by the host.
            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                tracing::warn!("worker pool job panicked");
            }
        }
    }
}

impl Executor for ThreadPool {
    fn execute(&self, job: Job) -> Result<(), Job> {
        match self.job_tx.read().as_ref() {
            Some(tx) => tx.send(job).map_err(|err| err.into_inner()),
            None => Err(job),
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        let _ = self.shutdown(Duration::from_secs(2));
    }
}
