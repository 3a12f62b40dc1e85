//! Error types for the taskmill crate.

use thiserror::Error;

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum TaskmillError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid task state: {0}")]
    InvalidState(String),
    #[error("Registry error: {0}")]
    Registry(String),
}

pub type Result<T> = std::result::Result<T, TaskmillError>;

/// Failure raised by (or on behalf of) a task handler.
///
/// The message is what gets persisted in the task's `error` column and what
/// the retry policy reports, so handlers should keep it human-readable.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Error produced when a handler observes its deadline via
    /// [`check_timeout`](crate::registry::TaskContext::check_timeout).
    pub fn deadline_exceeded(task_id: i64, timeout_secs: i64) -> Self {
        Self::new(format!("task {task_id} timed out after {timeout_secs}s"))
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}
