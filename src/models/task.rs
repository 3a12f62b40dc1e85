//! # Task Model
//!
//! Canonical representation of a row in the `tasks` table.
//!
//! `status` and `type` are kept as strings on the row struct (the storage
//! adapters read and write them verbatim), with typed views available through
//! [`TaskStatus`]/[`TaskType`] parsing. `payload`, `result`, and `error` are
//! opaque text blobs (JSON in practice).

use crate::state_machine::{TaskStatus, TaskType};
use serde_json::Value;
use sqlx::FromRow;

/// A persisted task.
#[derive(Debug, Clone, FromRow)]
pub struct Task {
    /// Store-assigned monotonic id.
    pub id: i64,
    /// Handler registry key.
    pub name: String,
    /// `"async"` or `"cron"`.
    #[sqlx(rename = "type")]
    pub task_type: String,
    /// Current lifecycle status, see [`TaskStatus`].
    pub status: String,
    /// Larger = more urgent. Ties broken by id.
    pub priority: i64,
    /// JSON-encoded handler input.
    pub payload: Option<String>,
    /// Cron expression; set iff `type = "cron"`.
    pub cron_expr: Option<String>,
    /// Epoch seconds; earliest eligible run time.
    pub next_run_time: i64,
    /// Epoch seconds of the most recent claim; abandonment marker.
    pub last_active_time: Option<i64>,
    /// Per-execution budget in seconds.
    pub timeout: i64,
    /// Attempts made, including the in-flight one after a claim.
    pub retry_count: i64,
    /// Retry budget; total attempts = `max_retries + 1`.
    pub max_retries: i64,
    /// Base backoff seconds; 0 selects the exponential curve.
    pub retry_interval: i64,
    /// Epoch seconds at insert.
    pub created_at: i64,
    /// JSON-encoded success value.
    pub result: Option<String>,
    /// Most recent failure message.
    pub error: Option<String>,
}

impl Task {
    pub fn is_cron(&self) -> bool {
        self.task_type == TaskType::Cron.as_str()
    }

    /// Typed view of the `status` column.
    pub fn status(&self) -> Result<TaskStatus, String> {
        self.status.parse()
    }

    /// Typed view of the `type` column.
    pub fn task_type(&self) -> Result<TaskType, String> {
        self.task_type.parse()
    }

    /// Deserialized payload; `Null` when absent.
    pub fn payload_json(&self) -> Value {
        self.payload
            .as_deref()
            .and_then(|p| serde_json::from_str(p).ok())
            .unwrap_or(Value::Null)
    }

    /// Deserialized result; `None` when the task has not completed.
    pub fn result_json(&self) -> Option<Value> {
        self.result
            .as_deref()
            .and_then(|r| serde_json::from_str(r).ok())
    }
}

/// Insert payload for a new task; the store assigns `id` and sets
/// `status = "pending"`.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub task_type: TaskType,
    pub priority: i64,
    pub payload: Option<String>,
    pub cron_expr: Option<String>,
    pub next_run_time: i64,
    pub timeout: i64,
    pub max_retries: i64,
    pub retry_interval: i64,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> Task {
        Task {
            id: 1,
            name: "sample".to_string(),
            task_type: "async".to_string(),
            status: "pending".to_string(),
            priority: 0,
            payload: Some(r#"{"data":"x"}"#.to_string()),
            cron_expr: None,
            next_run_time: 0,
            last_active_time: None,
            timeout: 60,
            retry_count: 0,
            max_retries: 3,
            retry_interval: 0,
            created_at: 0,
            result: None,
            error: None,
        }
    }

    #[test]
    fn payload_round_trips_through_json() {
        let task = sample_task();
        assert_eq!(task.payload_json()["data"], "x");
    }

    #[test]
    fn missing_payload_is_null() {
        let mut task = sample_task();
        task.payload = None;
        assert!(task.payload_json().is_null());
    }

    #[test]
    fn typed_views_parse() {
        let task = sample_task();
        assert_eq!(task.status().unwrap(), TaskStatus::Pending);
        assert_eq!(task.task_type().unwrap(), TaskType::Async);
        assert!(!task.is_cron());
    }
}
