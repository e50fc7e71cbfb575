//! Sundial: delayed-execution schedulers
//!
//! This crate fires a unit of work after a requested delay and lets the
//! caller cancel it beforehand, under heavy concurrent load (e.g. one idle
//! timeout per connection). Three variants share one contract, [`Scheduler`]:
//!
//! - **[`WheelScheduler`]**: fixed array of time buckets with per-bucket locks
//!   and one or more dispatcher threads; built for hundreds of concurrent
//!   producers.
//! - **[`BaselineScheduler`]**: one deadline-ordered map under one mutex and a
//!   single dispatcher thread; the correctness reference.
//! - **[`DelegatingScheduler`]**: pass-through onto an existing
//!   [`DelayedExecutor`] such as [`TokioDelayedExecutor`].
//!
//! # Example
//!
//! ```rust,ignore
//! use sundial::{build, SchedulerConfig, SchedulerExt, SchedulerKind};
//! use std::time::Duration;
//!
//! let scheduler = build(SchedulerKind::Wheel, SchedulerConfig::default())?;
//! scheduler.start()?;
//!
//! let task = scheduler.schedule(|| println!("idle timeout"), Duration::from_secs(30))?;
//! // connection saw traffic
//! assert!(task.cancel());
//!
//! scheduler.stop()?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// ============================================================================
// Core Modules
// ============================================================================

/// Task handles and task state
pub mod task;

/// The capability contract and variant selection
pub mod scheduler;

/// Lifecycle state machine
pub mod lifecycle;

/// Construction-time configuration
pub mod config;

/// Error types
pub mod error;

/// Host fault sink for failing units of work
pub mod fault;

/// Worker pools
pub mod executor;

/// Counters and statistics snapshots
pub mod stats;

// ============================================================================
// Scheduler Variants
// ============================================================================

/// Single-structure baseline scheduler
pub mod baseline;

/// Concurrent time-wheel scheduler
pub mod wheel;

/// Adapter onto an existing delayed-execution facility
pub mod delegate;

mod dispatch;
mod thread;

#[cfg(test)]
mod testing;

// ============================================================================
// Re-exports
// ============================================================================

pub use baseline::BaselineScheduler;
pub use config::{apply_env_overrides, SchedulerConfig};
pub use delegate::{DelayedExecutor, DelegateHandle, DelegatingScheduler, TokioDelayedExecutor};
pub use error::{ConfigError, SchedulerError, SchedulerResult};
pub use executor::{Executor, ThreadPool};
pub use fault::{FaultHandler, LogFaults, WorkFault};
pub use lifecycle::LifecycleState;
pub use scheduler::{build, Scheduler, SchedulerExt, SchedulerKind};
pub use stats::SchedulerStats;
pub use task::{Job, Task, TaskId, TaskState};
pub use wheel::WheelScheduler;
