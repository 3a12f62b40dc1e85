//! # Storage Adapters
//!
//! A narrow persistence contract over the `tasks` table, with one adapter per
//! supported engine. The engine is inferred from the connection-string scheme:
//! `sqlite:`, `mysql:`, `postgres:`/`postgresql:`.
//!
//! The claim query is the concurrency-critical operation: it must atomically
//! select ready rows in canonical order (`next_run_time ASC, priority DESC,
//! id ASC`) and mark them running. PostgreSQL and MySQL do this with
//! `FOR UPDATE SKIP LOCKED`; SQLite serializes claims through an
//! adapter-level mutex. The observable behavior is identical.

pub mod mysql;
pub mod postgres;
pub mod sqlite;

pub use mysql::MySqlTaskStore;
pub use postgres::PostgresTaskStore;
pub use sqlite::SqliteTaskStore;

use crate::error::{Result, TaskmillError};
use crate::models::{NewTask, Task};
use crate::state_machine::TaskStatus;
use async_trait::async_trait;
use std::sync::Arc;

/// Column list shared by every `SELECT ... FROM tasks` in the adapters.
pub(crate) const TASK_COLUMNS: &str = "id, name, type, status, priority, payload, cron_expr, \
     next_run_time, last_active_time, timeout, retry_count, max_retries, retry_interval, \
     created_at, result, error";

/// Persistence contract the scheduler and workers depend on.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Idempotent schema bootstrap: the `tasks` table plus the
    /// `(status, priority, next_run_time)` and `(name)` indices.
    async fn setup(&self) -> Result<()>;

    /// Persist a new pending task, returning the store-assigned id.
    async fn insert(&self, task: &NewTask) -> Result<i64>;

    /// Atomically claim up to `limit` ready tasks.
    ///
    /// Selects rows with `status = 'pending'` and `next_run_time <= now` in
    /// canonical order, and in the same transaction marks them running,
    /// stamps `last_active_time = now`, and increments `retry_count`. The
    /// returned tasks reflect the post-claim row state, in claim order.
    async fn claim_ready(&self, now: i64, limit: i64) -> Result<Vec<Task>>;

    /// Record a successful async completion.
    async fn complete(&self, id: i64, result: &str) -> Result<()>;

    /// Record a failure and transition the task.
    ///
    /// `next_run_time = None` keeps the stored value. A cron task moved back
    /// to `pending` has its `retry_count` reset in the same statement.
    async fn fail(
        &self,
        id: i64,
        error: &str,
        next_status: TaskStatus,
        next_run_time: Option<i64>,
    ) -> Result<()>;

    /// Cron success path: back to `pending` at the next occurrence with
    /// `retry_count = 0`; the last result is retained for observability.
    async fn reschedule_cron(&self, id: i64, result: Option<&str>, next_run_time: i64)
        -> Result<()>;

    /// Guarded single-row transition (`WHERE status = from`); returns whether
    /// the row was actually moved. Backs the pause/resume API.
    async fn set_status(
        &self,
        id: i64,
        from: TaskStatus,
        to: TaskStatus,
        next_run_time: Option<i64>,
    ) -> Result<bool>;

    async fn get_by_id(&self, id: i64) -> Result<Option<Task>>;

    async fn get_by_name(&self, name: &str) -> Result<Vec<Task>>;

    async fn get_by_status(&self, status: TaskStatus) -> Result<Vec<Task>>;

    /// Reset rows left `running` by a prior process to `pending` with
    /// `next_run_time = now`. `retry_count` is untouched: the interrupted
    /// attempt counts. Returns the number of recovered rows.
    async fn recover_abandoned(&self, now: i64) -> Result<u64>;

    /// Test helper: remove every row.
    async fn clear_tasks(&self) -> Result<()>;
}

/// Connect to the store named by `database_url`, inferring the engine from
/// the scheme.
pub async fn connect(database_url: &str) -> Result<Arc<dyn TaskStore>> {
    let scheme = database_url.split(':').next().unwrap_or_default();
    match scheme {
        "sqlite" => Ok(Arc::new(SqliteTaskStore::connect(database_url).await?)),
        "mysql" => Ok(Arc::new(MySqlTaskStore::connect(database_url).await?)),
        "postgres" | "postgresql" => {
            Ok(Arc::new(PostgresTaskStore::connect(database_url).await?))
        }
        other => Err(TaskmillError::Configuration(format!(
            "unsupported database scheme '{other}' in connection string"
        ))),
    }
}
