//! Execution of drained tasks

use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, SchedulerResult};
use crate::executor::Executor;
use crate::fault::{catch_fault, FaultHandler};
use crate::stats::Counters;
use crate::task::{Job, TaskEntry};
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::sync::Arc;
use std::time::{Duration, Instant};

thread_local! {
    /// Gate whose work the current thread is running, by address
    static RUNNING_UNDER: Cell<usize> = const { Cell::new(0) };
}

#[derive(Debug, Default)]
struct GateState {
    open: bool,
    in_flight: usize,
}

/// Tracks tasks from the moment they are handed out for firing until their
/// work returns, so `stop` can wait for them.
#[derive(Debug, Default)]
struct Gate {
    state: Mutex<GateState>,
    idle: Condvar,
}

impl Gate {
    fn addr(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }
}

/// One task counted as in flight; released on drop.
pub(crate) struct Admission {
    gate: Arc<Gate>,
}

impl Drop for Admission {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.gate.idle.notify_all();
        }
    }
}

/// Runs drained entries inline or on the configured worker pool.
#[derive(Clone)]
pub(crate) struct Dispatch {
    executor: Option<Arc<dyn Executor>>,
    faults: Arc<dyn FaultHandler>,
    counters: Arc<Counters>,
    gate: Arc<Gate>,
}

impl Dispatch {
    pub(crate) fn new(config: &SchedulerConfig, counters: Arc<Counters>) -> Self {
        Self {
            executor: config.executor.clone(),
            faults: config.faults.clone(),
            counters,
            gate: Arc::new(Gate::default()),
        }
    }

    /// Accept work again after a stop.
    pub(crate) fn open(&self) {
        self.gate.state.lock().open = true;
    }

    /// Refuse further [`admit`](Self::admit) calls and wait until every task
    /// already handed out has finished running.
    ///
    /// Work of this dispatch running on the calling thread (a job stopping
    /// its own scheduler) is not waited for.
    pub(crate) fn quiesce(&self, timeout: Duration) -> SchedulerResult<()> {
        let deadline = Instant::now() + timeout;
        let own = RUNNING_UNDER.with(|running| usize::from(running.get() == self.gate.addr()));

        let mut state = self.gate.state.lock();
        state.open = false;
        while state.in_flight > own {
            if self.gate.idle.wait_until(&mut state, deadline).timed_out() && state.in_flight > own {
                return Err(SchedulerError::StopTimeout {
                    timeout,
                    stuck: state.in_flight - own,
                });
            }
        }
        Ok(())
    }

    /// Count a task as in flight unless the dispatch has been quiesced.
    pub(crate) fn admit(&self) -> Option<Admission> {
        let mut state = self.gate.state.lock();
        if !state.open {
            return None;
        }
        state.in_flight += 1;
        Some(Admission {
            gate: self.gate.clone(),
        })
    }

    fn track(&self) -> Admission {
        self.gate.state.lock().in_flight += 1;
        Admission {
            gate: self.gate.clone(),
        }
    }

    /// Fire an entry that is already `Dispatching`.
    ///
    /// Must be called without holding any scheduler lock. With a worker
    /// pool this returns as soon as the job is queued.
    pub(crate) fn fire(&self, entry: Arc<TaskEntry>) {
        let admission = self.track();
        self.fire_admitted(entry, admission);
    }

    /// Like [`fire`](Self::fire), for an entry admitted by [`admit`](Self::admit).
    pub(crate) fn fire_admitted(&self, entry: Arc<TaskEntry>, admission: Admission) {
        match &self.executor {
            Some(executor) => {
                let this = self.clone();
                let job: Job = Box::new(move || this.run(&entry, admission));
                if let Err(job) = executor.execute(job) {
                    tracing::warn!("worker pool rejected a task; running it on the dispatcher");
                    job();
                }
            }
            None => self.run(&entry, admission),
        }
    }

    /// Run the entry's work on the current thread, reporting a panic to the
    /// fault sink. The admission is released once the work has returned.
    fn run(&self, entry: &TaskEntry, admission: Admission) {
        let Some(work) = entry.take_work() else {
            return;
        };

        let outer = RUNNING_UNDER.with(|running| running.replace(self.gate.addr()));
        let result = catch_fault(entry.id(), work);
        entry.mark_fired();
        self.counters.fired();

        if let Err(fault) = result {
            self.counters.fault();
            let task = fault.task;
            if catch_fault(task, || self.faults.handle(fault)).is_err() {
                tracing::error!(task = %task, "fault handler panicked");
            }
        }
        RUNNING_UNDER.with(|running| running.set(outer));
        drop(admission);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ThreadPool;
    use crate::fault::WorkFault;
    use crate::task::TaskState;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    fn dispatching(work: Job) -> Arc<TaskEntry> {
        let entry = Arc::new(TaskEntry::new(Instant::now(), 0, work));
        assert!(entry.begin_dispatch());
        entry
    }

    #[test]
    fn test_fire_inline() {
        let counters = Arc::new(Counters::default());
        let dispatch = Dispatch::new(&SchedulerConfig::default(), counters.clone());

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let entry = dispatching(Box::new(move || flag.store(true, Ordering::SeqCst)));

        dispatch.fire(entry.clone());
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(entry.state(), TaskState::Fired);
        assert_eq!(counters.snapshot(0).fired, 1);
    }

    #[test]
    fn test_fire_reports_fault() {
        let faults = Arc::new(Mutex::new(Vec::<WorkFault>::new()));
        let sink = faults.clone();
        let config = SchedulerConfig::default().faults(Arc::new(move |f: WorkFault| sink.lock().push(f)));
        let counters = Arc::new(Counters::default());
        let dispatch = Dispatch::new(&config, counters.clone());

        let entry = dispatching(Box::new(|| panic!("handler exploded")));
        dispatch.fire(entry.clone());

        assert_eq!(entry.state(), TaskState::Fired);
        let faults = faults.lock();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].task, entry.id());
        assert_eq!(faults[0].message, "handler exploded");

        let stats = counters.snapshot(0);
        assert_eq!(stats.fired, 1);
        assert_eq!(stats.faults, 1);
    }

    #[test]
    fn test_panicking_fault_handler_is_contained() {
        let config = SchedulerConfig::default().faults(Arc::new(|_: WorkFault| panic!("sink broke")));
        let dispatch = Dispatch::new(&config, Arc::new(Counters::default()));

        let entry = dispatching(Box::new(|| panic!("work broke")));
        dispatch.fire(entry.clone());
        assert_eq!(entry.state(), TaskState::Fired);
    }

    #[test]
    fn test_fire_on_pool() {
        let pool = Arc::new(ThreadPool::new(2, "sundial-dispatch-test").unwrap());
        let config = SchedulerConfig::default().executor(pool.clone());
        let dispatch = Dispatch::new(&config, Arc::new(Counters::default()));

        let thread_name = Arc::new(Mutex::new(None));
        let slot = thread_name.clone();
        let entry = dispatching(Box::new(move || {
            *slot.lock() = std::thread::current().name().map(str::to_string);
        }));

        dispatch.fire(entry.clone());
        pool.shutdown(Duration::from_secs(2)).unwrap();

        assert_eq!(entry.state(), TaskState::Fired);
        let name = thread_name.lock().clone().unwrap();
        assert!(name.starts_with("sundial-dispatch-test-"));
    }

    #[test]
    fn test_rejected_job_runs_inline() {
        let pool = Arc::new(ThreadPool::new(1, "sundial-dispatch-test").unwrap());
        pool.shutdown(Duration::from_secs(2)).unwrap();
        let config = SchedulerConfig::default().executor(pool);
        let dispatch = Dispatch::new(&config, Arc::new(Counters::default()));

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let entry = dispatching(Box::new(move || flag.store(true, Ordering::SeqCst)));

        dispatch.fire(entry.clone());
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(entry.state(), TaskState::Fired);
    }

    #[test]
    fn test_quiesce_waits_for_queued_work() {
        let pool = Arc::new(ThreadPool::new(1, "sundial-dispatch-test").unwrap());
        let config = SchedulerConfig::default().executor(pool);
        let dispatch = Dispatch::new(&config, Arc::new(Counters::default()));
        dispatch.open();

        dispatch.fire(dispatching(Box::new(|| std::thread::sleep(Duration::from_millis(200)))));
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let queued = dispatching(Box::new(move || flag.store(true, Ordering::SeqCst)));
        dispatch.fire(queued.clone());

        dispatch.quiesce(Duration::from_secs(2)).unwrap();
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(queued.state(), TaskState::Fired);
    }

    #[test]
    fn test_quiesce_times_out() {
        let pool = Arc::new(ThreadPool::new(1, "sundial-dispatch-test").unwrap());
        let config = SchedulerConfig::default().executor(pool);
        let dispatch = Dispatch::new(&config, Arc::new(Counters::default()));

        dispatch.fire(dispatching(Box::new(|| std::thread::sleep(Duration::from_millis(300)))));
        std::thread::sleep(Duration::from_millis(20));
        assert!(matches!(
            dispatch.quiesce(Duration::from_millis(50)),
            Err(SchedulerError::StopTimeout { stuck: 1, .. })
        ));
        dispatch.quiesce(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn test_admit_refused_after_quiesce() {
        let dispatch = Dispatch::new(&SchedulerConfig::default(), Arc::new(Counters::default()));
        assert!(dispatch.admit().is_none());

        dispatch.open();
        let admission = dispatch.admit().unwrap();
        drop(admission);

        dispatch.quiesce(Duration::from_millis(10)).unwrap();
        assert!(dispatch.admit().is_none());
    }

    #[test]
    fn test_quiesce_from_own_work_does_not_wait_for_itself() {
        let dispatch = Dispatch::new(&SchedulerConfig::default(), Arc::new(Counters::default()));
        dispatch.open();

        let outcome = Arc::new(Mutex::new(None));
        let slot = outcome.clone();
        let inner = dispatch.clone();
        let entry = dispatching(Box::new(move || {
            *slot.lock() = Some(inner.quiesce(Duration::from_millis(50)).is_ok());
        }));
        dispatch.fire(entry);
        assert_eq!(*outcome.lock(), Some(true));
    }
}
