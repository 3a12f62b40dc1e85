//! MySQL storage adapter.
//!
//! Requires MySQL 8.0+ for `FOR UPDATE SKIP LOCKED`. The claim runs as a
//! select-then-update transaction: the locked select fixes the claim order,
//! the update marks the rows, and the returned tasks are patched in memory
//! to the post-claim state.

use crate::database::{TaskStore, TASK_COLUMNS};
use crate::error::Result;
use crate::models::{NewTask, Task};
use crate::state_machine::TaskStatus;
use async_trait::async_trait;
use sqlx::mysql::{MySqlDatabaseError, MySqlPool, MySqlPoolOptions};
use tracing::debug;

/// MySQL error 1061: duplicate key name. `CREATE INDEX` has no
/// `IF NOT EXISTS` on MySQL, so setup treats this as already-done.
const ER_DUP_KEYNAME: u16 = 1061;

pub struct MySqlTaskStore {
    pool: MySqlPool,
}

impl MySqlTaskStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    async fn create_index(&self, ddl: &str) -> Result<()> {
        if let Err(err) = sqlx::query(ddl).execute(&self.pool).await {
            if !is_duplicate_index(&err) {
                return Err(err.into());
            }
        }
        Ok(())
    }
}

fn is_duplicate_index(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.try_downcast_ref::<MySqlDatabaseError>())
        .is_some_and(|db| db.number() == ER_DUP_KEYNAME)
}

#[async_trait]
impl TaskStore for MySqlTaskStore {
    async fn setup(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                type VARCHAR(16) NOT NULL,
                status VARCHAR(32) NOT NULL,
                priority BIGINT NOT NULL DEFAULT 0,
                payload TEXT,
                cron_expr VARCHAR(255),
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

        self.create_index(
            "CREATE INDEX idx_tasks_claim ON tasks (status, priority, next_run_time)",
        )
        .await?;
        self.create_index("CREATE INDEX idx_tasks_name ON tasks (name)")
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

        Ok(result.last_insert_id() as i64)
    }

    async fn claim_ready(&self, now: i64, limit: i64) -> Result<Vec<Task>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;

        let select = format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE status = ? AND next_run_time <= ? \
             ORDER BY next_run_time ASC, priority DESC, id ASC \
             LIMIT ? \
             FOR UPDATE SKIP LOCKED"
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
        sqlx::query("TRUNCATE TABLE tasks").execute(&self.pool).await?;
        Ok(())
    }
}
