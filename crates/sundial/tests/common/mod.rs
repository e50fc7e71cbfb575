//! Shared helpers for the scheduler integration tests

#![allow(dead_code)]

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use sundial::{
    build, Scheduler, SchedulerConfig, SchedulerKind, ThreadPool, TokioDelayedExecutor,
};

/// Scheduler configurations every contract test runs against
#[derive(Debug, Clone, Copy)]
pub enum Variant {
    /// Baseline, work runs on the dispatcher
    Baseline,
    /// Baseline handing work to a worker pool
    BaselinePool,
    /// Wheel with one-millisecond ticks
    WheelMillis,
    /// Wheel with coarse 100ms ticks
    WheelCoarse,
    /// Wheel with coarse ticks and a worker pool
    WheelPool,
    /// Wheel with several dispatcher threads
    WheelMulti,
    /// Delegation onto an owned tokio runtime
    Tokio,
    /// Delegation onto a tokio runtime the test owns
    TokioBorrowed,
}

impl Variant {
    pub fn build(self, config: SchedulerConfig) -> Arc<dyn Scheduler> {
        let config = config.thread_name(format!("test-{:?}", self).to_lowercase());
        let (kind, config) = match self {
            Variant::Baseline => (SchedulerKind::Baseline, config),
            Variant::BaselinePool => (SchedulerKind::Baseline, config.executor(pool())),
            Variant::WheelMillis => (SchedulerKind::Wheel, config.tick(Duration::ZERO)),
            Variant::WheelCoarse => (SchedulerKind::Wheel, config.tick(Duration::from_millis(100))),
            Variant::WheelPool => (
                SchedulerKind::Wheel,
                config.tick(Duration::from_millis(100)).executor(pool()),
            ),
            Variant::WheelMulti => (
                SchedulerKind::Wheel,
                config.tick(Duration::from_millis(10)).dispatchers(4),
            ),
            Variant::Tokio => (
                SchedulerKind::Delegating(Arc::new(TokioDelayedExecutor::owned(4, "test-tokio"))),
                config,
            ),
            Variant::TokioBorrowed => (
                SchedulerKind::Delegating(Arc::new(TokioDelayedExecutor::with_handle(
                    host_runtime().handle().clone(),
                ))),
                config,
            ),
        };
        build(kind, config).expect("valid test configuration")
    }

    pub fn started(self) -> Arc<dyn Scheduler> {
        init_tracing();
        let scheduler = self.build(SchedulerConfig::default());
        scheduler.start().expect("scheduler starts");
        scheduler
    }
}

fn pool() -> Arc<ThreadPool> {
    Arc::new(ThreadPool::new(32, "test-pool").expect("pool starts"))
}

/// Runtime shared by every borrowed-handle scheduler; outlives them all
fn host_runtime() -> &'static tokio::runtime::Runtime {
    static RUNTIME: OnceLock<tokio::runtime::Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .thread_name("test-host-runtime")
            .enable_time()
            .build()
            .expect("host runtime starts")
    })
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// `later - earlier` in milliseconds, negative if `later` is before `earlier`
pub fn signed_millis(later: Instant, earlier: Instant) -> i64 {
    if later >= earlier {
        (later - earlier).as_millis() as i64
    } else {
        -((earlier - later).as_millis() as i64)
    }
}
