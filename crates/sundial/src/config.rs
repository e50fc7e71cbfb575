//! Construction-time scheduler configuration
//!
//! A [`SchedulerConfig`] is handed to a scheduler constructor and is fixed for
//! the lifetime of that instance. Values come from, highest priority first:
//!
//! 1. builder methods (`.tick(..)`, `.executor(..)`)
//! 2. `SUNDIAL_*` environment variables, when built with [`SchedulerConfig::from_env`]
//! 3. defaults
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `SUNDIAL_TICK_MS` | `u64` | `tick` |
//! | `SUNDIAL_WHEEL_SIZE` | `usize` | `wheel_size` |
//! | `SUNDIAL_DISPATCHERS` | `usize` | `dispatchers` |
//! | `SUNDIAL_THREAD_NAME` | `String` | `thread_name` |
//! | `SUNDIAL_STOP_TIMEOUT_MS` | `u64` | `stop_timeout` |

use crate::error::ConfigError;
use crate::executor::Executor;
use crate::fault::{FaultHandler, LogFaults};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default wheel tick
pub const DEFAULT_TICK: Duration = Duration::from_millis(10);
/// Default number of wheel buckets
pub const DEFAULT_WHEEL_SIZE: usize = 512;
/// Default bound on joining dispatcher threads in `stop`
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Environment variable name for the wheel tick in milliseconds.
pub const ENV_TICK_MS: &str = "SUNDIAL_TICK_MS";
/// Environment variable name for the number of wheel buckets.
pub const ENV_WHEEL_SIZE: &str = "SUNDIAL_WHEEL_SIZE";
/// Environment variable name for the number of wheel dispatcher threads.
pub const ENV_DISPATCHERS: &str = "SUNDIAL_DISPATCHERS";
/// Environment variable name for the dispatcher thread name prefix.
pub const ENV_THREAD_NAME: &str = "SUNDIAL_THREAD_NAME";
/// Environment variable name for the stop timeout in milliseconds.
pub const ENV_STOP_TIMEOUT_MS: &str = "SUNDIAL_STOP_TIMEOUT_MS";

/// Scheduler configuration
#[derive(Clone)]
pub struct SchedulerConfig {
    /// Duration covered by one wheel bucket. Zero means one millisecond.
    pub tick: Duration,

    /// Number of buckets in the wheel
    pub wheel_size: usize,

    /// Number of wheel dispatcher threads
    pub dispatchers: usize,

    /// Worker pool for drained tasks (None = run on the dispatcher thread)
    pub executor: Option<Arc<dyn Executor>>,

    /// Sink for unit-of-work failures
    pub faults: Arc<dyn FaultHandler>,

    /// Prefix for dispatcher thread names
    pub thread_name: String,

    /// How long `stop` waits for dispatcher threads to exit
    pub stop_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            wheel_size: DEFAULT_WHEEL_SIZE,
            dispatchers: 1,
            executor: None,
            faults: Arc::new(LogFaults),
            thread_name: "sundial".to_string(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

impl SchedulerConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with `SUNDIAL_*` environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        apply_env_overrides(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the wheel tick.
    #[must_use]
    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Sets the number of wheel buckets.
    #[must_use]
    pub fn wheel_size(mut self, size: usize) -> Self {
        self.wheel_size = size;
        self
    }

    /// Sets the number of wheel dispatcher threads.
    #[must_use]
    pub fn dispatchers(mut self, count: usize) -> Self {
        self.dispatchers = count;
        self
    }

    /// Runs drained tasks on `executor` instead of the dispatcher thread.
    #[must_use]
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Sets the fault sink.
    #[must_use]
    pub fn faults(mut self, faults: Arc<dyn FaultHandler>) -> Self {
        self.faults = faults;
        self
    }

    /// Sets the dispatcher thread name prefix.
    #[must_use]
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Sets the stop timeout.
    #[must_use]
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Tick actually used by the wheel, in nanoseconds (never zero)
    pub(crate) fn effective_tick_nanos(&self) -> u64 {
        let tick = if self.tick.is_zero() {
            Duration::from_millis(1)
        } else {
            self.tick
        };
        u64::try_from(tick.as_nanos()).unwrap_or(u64::MAX)
    }

    /// Check structural invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wheel_size == 0 {
            return Err(ConfigError::InvalidWheelSize);
        }
        if self.dispatchers == 0 {
            return Err(ConfigError::InvalidDispatchers);
        }
        Ok(())
    }
}

impl fmt::Debug for SchedulerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerConfig")
            .field("tick", &self.tick)
            .field("wheel_size", &self.wheel_size)
            .field("dispatchers", &self.dispatchers)
            .field("executor", &self.executor.is_some())
            .field("thread_name", &self.thread_name)
            .field("stop_timeout", &self.stop_timeout)
            .finish_non_exhaustive()
    }
}

/// Apply environment variable overrides to a [`SchedulerConfig`].
///
/// Only variables that are set are applied. A set variable with an
/// unparseable value is an error.
pub fn apply_env_overrides(config: &mut SchedulerConfig) -> Result<(), ConfigError> {
    apply_overrides(config, |name| std::env::var(name).ok())
}

fn apply_overrides<F>(config: &mut SchedulerConfig, read: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = read(ENV_TICK_MS) {
        config.tick = Duration::from_millis(parse(ENV_TICK_MS, &val)?);
    }
    if let Some(val) = read(ENV_WHEEL_SIZE) {
        config.wheel_size = parse(ENV_WHEEL_SIZE, &val)?;
    }
    if let Some(val) = read(ENV_DISPATCHERS) {
        config.dispatchers = parse(ENV_DISPATCHERS, &val)?;
    }
    if let Some(val) = read(ENV_THREAD_NAME) {
        config.thread_name = val;
    }
    if let Some(val) = read(ENV_STOP_TIMEOUT_MS) {
        config.stop_timeout = Duration::from_millis(parse(ENV_STOP_TIMEOUT_MS, &val)?);
    }
    Ok(())
}

fn parse<T>(var: &'static str, val: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    val.trim().parse::<T>().map_err(|e| ConfigError::InvalidEnv {
        var,
        value: val.to_string(),
        reason: e.to_string(),
    })
}
