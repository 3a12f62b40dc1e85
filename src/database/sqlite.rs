//! SQLite storage adapter.
//!
//! SQLite has no `FOR UPDATE SKIP LOCKED`, so claims are serialized through
//! an adapter-level `tokio::sync::Mutex` around a single transaction. The
//! pool is capped at one connection: SQLite writes serialize at the file
//! level anyway, and a single connection makes `sqlite::memory:` URLs behave
//! as one database instead of one per connection.

use crate::database::{TaskStore, TASK_COLUMNS};
use crate::error::Result;
use crate::models::{NewTask, Task};
use crate::state_machine::TaskStatus;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::debug;

pub struct SqliteTaskStore {
    pool: SqlitePool,
    claim_lock: Mutex<()>,
}

impl SqliteTaskStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Ok(Self {
            pool,
            claim_lock: Mutex::new(()),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn setup(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                type TEXT NOT NULL,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                payload TEXT,
                cron_expr TEXT,
                next_run_time INTEGER NOT NULL,
                last_active_time INTEGER,
                timeout INTEGER NOT NULL DEFAULT 60,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                retry_interval INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                result TEXT,
                error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks (status, priority, next_run_time)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_name ON tasks (name)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn insert(&self, task: &NewTask) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO tasks
                (name, type, status, priority, payload, cron_expr, next_run_time,
                 timeout, retry_count, max_retries, retry_interval, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
            "#,
        )
        .bind(&task.name)
        .bind(task.task_type.as_str())
        .bind(TaskStatus::Pending.as_str())
        .bind(task.priority)
        .bind(&task.payload)
        .bind(&task.cron_expr)
        .bind(task.next_run_time)
        .bind(task.timeout)
        .bind(task.max_retries)
        .bind(task.retry_interval)
        .bind(task.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn claim_ready(&self, now: i64, limit: i64) -> Result<Vec<Task>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        let _guard = self.claim_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let select = format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE status = ? AND next_run_time <= ? \
             ORDER BY next_run_time ASC, priority DESC, id ASC \
             LIMIT ?"
        );
        let mut tasks: Vec<Task> = sqlx::query_as::<_, Task>(&select)
            .bind(TaskStatus::Pending.as_str())
            .bind(now)
            .bind(limit)
            .fetch_all(&mut *tx)
            .await?;

        for task in &tasks {
            sqlx::query(
                "UPDATE tasks SET status = ?, last_active_time = ?, \
                 retry_count = retry_count + 1 WHERE id = ?",
            )
            .bind(TaskStatus::Running.as_str())
            .bind(now)
            .bind(task.id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        for task in &mut tasks {
            task.status = TaskStatus::Running.as_str().to_string();
            task.last_active_time = Some(now);
            task.retry_count += 1;
        }

        if !tasks.is_empty() {
            debug!(claimed = tasks.len(), "Claimed ready tasks");
        }
        Ok(tasks)
    }

    async fn complete(&self, id: i64, result: &str) -> Result<()> {
        sqlx::query("UPDATE tasks SET status = ?, result = ?, error = NULL WHERE id = ?")
            .bind(TaskStatus::Completed.as_str())
            .bind(result)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fail(
        &self,
        id: i64,
        error: &str,
        next_status: TaskStatus,
        next_run_time: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET status = ?, error = ?, \
             next_run_time = COALESCE(?, next_run_time), \
             retry_count = CASE WHEN type = 'cron' THEN 0 ELSE retry_count END \
             WHERE id = ?",
        )
        .bind(next_status.as_str())
        .bind(error)
        .bind(next_run_time)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reschedule_cron(
        &self,
        id: i64,
        result: Option<&str>,
        next_run_time: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET status = ?, result = ?, error = NULL, \
             retry_count = 0, next_run_time = ? WHERE id = ?",
        )
        .bind(TaskStatus::Pending.as_str())
        .bind(result)
        .bind(next_run_time)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_status(
        &self,
        id: i64,
        from: TaskStatus,
        to: TaskStatus,
        next_run_time: Option<i64>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET status = ?, next_run_time = COALESCE(?, next_run_time) \
             WHERE id = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(next_run_time)
        .bind(id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<Task>> {
        let query = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?");
        let task = sqlx::query_as::<_, Task>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(task)
    }

    async fn get_by_name(&self, name: &str) -> Result<Vec<Task>> {
        let query = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE name = ? ORDER BY id ASC");
        let tasks = sqlx::query_as::<_, Task>(&query)
            .bind(name)
            .fetch_all(&self.pool)
            .await?;
        Ok(tasks)
    }

    async fn get_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let query = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE status = ? ORDER BY id ASC");
        let tasks = sqlx::query_as::<_, Task>(&query)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(tasks)
    }

    async fn recover_abandoned(&self, now: i64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE tasks SET status = ?, next_run_time = ? WHERE status = ?",
        )
        .bind(TaskStatus::Pending.as_str())
        .bind(now)
        .bind(TaskStatus::Running.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn clear_tasks(&self) -> Result<()> {
        sqlx::query("DELETE FROM tasks").execute(&self.pool).await?;
        Ok(())
    }
}
