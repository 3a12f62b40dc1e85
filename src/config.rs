//! Runtime configuration and per-task option overrides.

use crate::error::{Result, TaskmillError};
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 5;
pub const DEFAULT_MAX_RETRIES: i64 = 3;
pub const DEFAULT_RETRY_INTERVAL_SECS: i64 = 0;
pub const DEFAULT_TIMEOUT_SECS: i64 = 60;

/// Configuration for a [`TaskManager`](crate::TaskManager) instance.
///
/// Per-task [`TaskOptions`] override `max_retries` and `retry_interval`.
#[derive(Debug, Clone)]
pub struct TaskmillConfig {
    /// Connection string; the engine is inferred from the scheme
    /// (`sqlite:`, `mysql:`, `postgres:`).
    pub database_url: String,
    /// Delay between scheduler poll ticks.
    pub poll_interval: Duration,
    /// Upper bound on concurrently executing tasks.
    pub max_concurrent_tasks: usize,
    /// Default retry budget for tasks that don't specify one.
    pub max_retries: i64,
    /// Default base backoff in seconds; 0 selects the exponential curve.
    pub retry_interval: i64,
}

impl Default for TaskmillConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://taskmill.db".to_string(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval: DEFAULT_RETRY_INTERVAL_SECS,
        }
    }
}

impl TaskmillConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Self::default()
        }
    }

    /// Build a configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(db_url) = std::env::var("TASKMILL_DATABASE_URL") {
            config.database_url = db_url;
        }

        if let Ok(poll_ms) = std::env::var("TASKMILL_POLL_INTERVAL_MS") {
            let ms: u64 = poll_ms.parse().map_err(|e| {
                TaskmillError::Configuration(format!("Invalid poll_interval_ms: {e}"))
            })?;
            config.poll_interval = Duration::from_millis(ms);
        }

        if let Ok(max_concurrent) = std::env::var("TASKMILL_MAX_CONCURRENT_TASKS") {
            config.max_concurrent_tasks = max_concurrent.parse().map_err(|e| {
                TaskmillError::Configuration(format!("Invalid max_concurrent_tasks: {e}"))
            })?;
        }

        if let Ok(max_retries) = std::env::var("TASKMILL_MAX_RETRIES") {
            config.max_retries = max_retries
                .parse()
                .map_err(|e| TaskmillError::Configuration(format!("Invalid max_retries: {e}")))?;
        }

        if let Ok(retry_interval) = std::env::var("TASKMILL_RETRY_INTERVAL") {
            config.retry_interval = retry_interval.parse().map_err(|e| {
                TaskmillError::Configuration(format!("Invalid retry_interval: {e}"))
            })?;
        }

        Ok(config)
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    pub fn with_max_retries(mut self, retries: i64) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_interval(mut self, seconds: i64) -> Self {
        self.retry_interval = seconds;
        self
    }
}

/// Per-task overrides for [`enqueue`](crate::TaskManager::enqueue) and
/// [`cron`](crate::TaskManager::cron).
///
/// Unset fields fall back to the manager's [`TaskmillConfig`] defaults
/// (`max_retries`, `retry_interval`) or the built-in defaults
/// (`timeout` = 60 s, `priority` = 0, `delay` = 0).
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    pub priority: i64,
    /// Seconds to postpone the first run.
    pub delay: i64,
    pub timeout: Option<i64>,
    pub max_retries: Option<i64>,
    pub retry_interval: Option<i64>,
}

impl TaskOptions {
    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn delay(mut self, seconds: i64) -> Self {
        self.delay = seconds;
        self
    }

    pub fn timeout(mut self, seconds: i64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn max_retries(mut self, retries: i64) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn retry_interval(mut self, seconds: i64) -> Self {
        self.retry_interval = Some(seconds);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = TaskmillConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(1000));
        assert_eq!(config.max_concurrent_tasks, 5);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_interval, 0);
    }

    #[test]
    fn task_options_builder_chains() {
        let opts = TaskOptions::default()
            .priority(10)
            .delay(5)
            .timeout(30)
            .max_retries(1);
        assert_eq!(opts.priority, 10);
        assert_eq!(opts.delay, 5);
        assert_eq!(opts.timeout, Some(30));
        assert_eq!(opts.max_retries, Some(1));
        assert_eq!(opts.retry_interval, None);
    }
}
