//! PostgreSQL storage adapter.
//!
//! The claim is a single `UPDATE ... WHERE id IN (SELECT ... FOR UPDATE SKIP
//! LOCKED) RETURNING` statement, so concurrent claimers never hand out the
//! same row. `RETURNING` order is unspecified; claimed rows are re-sorted
//! into canonical order before they are handed to the scheduler.

use crate::database::{TaskStore, TASK_COLUMNS};
use crate::error::Result;
use crate::models::{NewTask, Task};
use crate::state_machine::TaskStatus;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::debug;

pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    async fn setup(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL,
                type TEXT NOT NULL,
                status TEXT NOT NULL,
                priority BIGINT NOT NULL DEFAULT 0,
                payload TEXT,
                cron_expr TEXT,
                next_run_time BIGINT NOT NULL,
                last_active_time BIGINT,
                timeout BIGINT NOT NULL DEFAULT 60,
                retry_count BIGINT NOT NULL DEFAULT 0,
                max_retries BIGINT NOT NULL DEFAULT 3,
                retry_interval BIGINT NOT NULL DEFAULT 0,
                created_at BIGINT NOT NULL,
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
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO tasks
                (name, type, status, priority, payload, cron_expr, next_run_time,
                 timeout, retry_count, max_retries, retry_interval, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, $9, $10, $11)
            RETURNING id
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
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    async fn claim_ready(&self, now: i64, limit: i64) -> Result<Vec<Task>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        let query = format!(
            "UPDATE tasks SET status = $1, last_active_time = $2, \
             retry_count = retry_count + 1 \
             WHERE id IN ( \
                 SELECT id FROM tasks \
                 WHERE status = $3 AND next_run_time <= $2 \
                 ORDER BY next_run_time ASC, priority DESC, id ASC \
                 LIMIT $4 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {TASK_COLUMNS}"
        );

        let mut tasks: Vec<Task> = sqlx::query_as::<_, Task>(&query)
            .bind(TaskStatus::Running.as_str())
            .bind(now)
            .bind(TaskStatus::Pending.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        tasks.sort_by(|a, b| {
            a.next_run_time
                .cmp(&b.next_run_time)
                .then(b.priority.cmp(&a.priority))
                .then(a.id.cmp(&b.id))
        });

        if !tasks.is_empty() {
            debug!(claimed = tasks.len(), "Claimed ready tasks");
        }
        Ok(tasks)
    }

    async fn complete(&self, id: i64, result: &str) -> Result<()> {
        sqlx::query("UPDATE tasks SET status = $1, result = $2, error = NULL WHERE id = $3")
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
            "UPDATE tasks SET status = $1, error = $2, \
             next_run_time = COALESCE($3, next_run_time), \
             retry_count = CASE WHEN type = 'cron' THEN 0 ELSE retry_count END \
             WHERE id = $4",
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
            "UPDATE tasks SET status = $1, result = $2, error = NULL, \
             retry_count = 0, next_run_time = $3 WHERE id = $4",
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
            "UPDATE tasks SET status = $1, next_run_time = COALESCE($2, next_run_time) \
             WHERE id = $3 AND status = $4",
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
        let query = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1");
        let task = sqlx::query_as::<_, Task>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(task)
    }

    async fn get_by_name(&self, name: &str) -> Result<Vec<Task>> {
        let query = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE name = $1 ORDER BY id ASC");
        let tasks = sqlx::query_as::<_, Task>(&query)
            .bind(name)
            .fetch_all(&self.pool)
            .await?;
        Ok(tasks)
    }

    async fn get_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let query = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE status = $1 ORDER BY id ASC");
        let tasks = sqlx::query_as::<_, Task>(&query)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(tasks)
    }

    async fn recover_abandoned(&self, now: i64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE tasks SET status = $1, next_run_time = $2 WHERE status = $3",
        )
        .bind(TaskStatus::Pending.as_str())
        .bind(now)
        .bind(TaskStatus::Running.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn clear_tasks(&self) -> Result<()> {
        sqlx::query("TRUNCATE TABLE tasks RESTART IDENTITY")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
