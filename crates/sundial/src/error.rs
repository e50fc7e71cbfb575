//! Error types shared by every scheduler variant

use crate::lifecycle::LifecycleState;
use std::time::Duration;

/// Errors returned by scheduler lifecycle and scheduling operations.
///
/// Failures of a unit of work are never reported here; they go to the
/// configured [`FaultHandler`](crate::FaultHandler).
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// `schedule` was called while the scheduler was not running
    #[error("scheduler is not running (state: {state:?})")]
    NotRunning {
        /// Lifecycle state observed at the time of the call
        state: LifecycleState,
    },

    /// A dispatcher or worker thread could not be spawned
    #[error("failed to spawn thread {name}: {source}")]
    Spawn {
        /// Name of the thread that failed to spawn
        name: String,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// Dispatcher threads or fired work did not finish within the stop timeout
    #[error("{stuck} dispatcher thread(s) or task(s) still running after {timeout:?}")]
    StopTimeout {
        /// Bound that was exceeded
        timeout: Duration,
        /// Number of threads or tasks that were still running
        stuck: usize,
    },

    /// A previous stop failed; the instance can no longer be used
    #[error("scheduler failed to stop and cannot be restarted")]
    Failed,

    /// A dispatcher thread panicked outside of unit-of-work isolation
    #[error("dispatcher thread {0} panicked")]
    DispatcherPanicked(String),

    /// The delegated execution facility refused the request
    #[error("delegate error: {0}")]
    Delegate(String),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Configuration errors detected by [`SchedulerConfig::validate`](crate::SchedulerConfig::validate)
/// or while reading environment overrides.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable was set to an unparseable value
    #[error("invalid value for {var}: {value:?} ({reason})")]
    InvalidEnv {
        /// Variable name
        var: &'static str,
        /// Raw value found in the environment
        value: String,
        /// Parser message
        reason: String,
    },

    /// The wheel needs at least one bucket
    #[error("wheel size must be greater than zero")]
    InvalidWheelSize,

    /// At least one dispatcher thread is required
    #[error("dispatcher count must be greater than zero")]
    InvalidDispatchers,
}

/// Result alias for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;
