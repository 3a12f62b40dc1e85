//! # Task Manager
//!
//! The public facade: submit tasks, register handlers, run the scheduler.
//!
//! ```rust,ignore
//! use taskmill::{TaskContext, TaskManager, TaskOptions, TaskmillConfig};
//!
//! #[tokio::main]
//! async fn main() -> taskmill::Result<()> {
//!     let manager = TaskManager::connect(TaskmillConfig::new("sqlite://tasks.db")).await?;
//!
//!     manager.register("send_email", |ctx: TaskContext| async move {
//!         // ... deliver ctx.payload ...
//!         Ok(serde_json::json!({ "sent": true }))
//!     })?;
//!
//!     manager
//!         .enqueue("send_email", serde_json::json!({ "to": "a@b.c" }), TaskOptions::default())
//!         .await?;
//!     manager.cron("nightly_report", serde_json::json!({}), "0 2 * * *", TaskOptions::default()).await?;
//!
//!     manager.start().await?;
//!     // ... run until shutdown ...
//!     manager.stop().await;
//!     Ok(())
//! }
//! ```

use crate::config::{TaskOptions, TaskmillConfig, DEFAULT_TIMEOUT_SECS};
use crate::cron::CronSpec;
use crate::database::{self, TaskStore};
use crate::error::{Result, TaskmillError};
use crate::models::{NewTask, Task};
use crate::orchestration::scheduler::{self, SchedulerState};
use crate::registry::{TaskHandler, TaskHandlerRegistry};
use crate::state_machine::{TaskStatus, TaskType};
use chrono::Utc;
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A durable task manager over one database.
///
/// An instance owns one store connection, one handler registry, and one
/// scheduler. Instances are independent; two instances must not share a
/// database.
pub struct TaskManager {
    state: Arc<SchedulerState>,
    poller: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TaskManager {
    /// Connect to the configured database (engine inferred from the URL
    /// scheme) and bootstrap the schema.
    pub async fn connect(config: TaskmillConfig) -> Result<Self> {
        let store = database::connect(&config.database_url).await?;
        store.setup().await?;

        let registry = Arc::new(TaskHandlerRegistry::new());
        Ok(Self {
            state: Arc::new(SchedulerState::new(store, registry, config)),
            poller: tokio::sync::Mutex::new(None),
        })
    }

    /// Register a handler for a task name. Last registration wins.
    ///
    /// Handlers are usually registered before [`start`](Self::start), but
    /// registration is safe at any time.
    pub fn register<H>(&self, name: &str, handler: H) -> Result<()>
    where
        H: TaskHandler + 'static,
    {
        self.state.registry.register(name, Arc::new(handler))
    }

    /// Submit a one-shot task. Returns the store-assigned id.
    ///
    /// The task becomes ready at `now + opts.delay` and is handled by the
    /// handler registered under `name`.
    pub async fn enqueue(&self, name: &str, payload: Value, opts: TaskOptions) -> Result<i64> {
        let now = Utc::now().timestamp();
        let task = NewTask {
            name: name.to_string(),
            task_type: TaskType::Async,
            priority: opts.priority,
            payload: Some(serde_json::to_string(&payload)?),
            cron_expr: None,
            next_run_time: now + opts.delay.max(0),
            timeout: opts.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS),
            max_retries: opts.max_retries.unwrap_or(self.state.config.max_retries),
            retry_interval: opts
                .retry_interval
                .unwrap_or(self.state.config.retry_interval),
            created_at: now,
        };

        let id = self.state.store.insert(&task).await?;
        debug!(task_id = id, task_name = name, "Enqueued async task");
        Ok(id)
    }

    /// Submit a recurring task driven by a cron expression.
    ///
    /// The expression is validated synchronously; an invalid one fails here
    /// and nothing is persisted. A failed run is not retried with backoff
    /// (it fires again at the next occurrence), so `opts.max_retries` is
    /// ignored.
    pub async fn cron(
        &self,
        name: &str,
        payload: Value,
        cron_expr: &str,
        opts: TaskOptions,
    ) -> Result<i64> {
        let spec = CronSpec::parse(cron_expr)?;
        let now = Utc::now().timestamp();
        let next_run_time = spec.next_after(now + opts.delay.max(0))?;

        let task = NewTask {
            name: name.to_string(),
            task_type: TaskType::Cron,
            priority: opts.priority,
            payload: Some(serde_json::to_string(&payload)?),
            cron_expr: Some(spec.expression().to_string()),
            next_run_time,
            timeout: opts.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS),
            max_retries: 0,
            retry_interval: 0,
            created_at: now,
        };

        let id = self.state.store.insert(&task).await?;
        debug!(
            task_id = id,
            task_name = name,
            cron_expr = %spec.expression(),
            next_run_time,
            "Scheduled cron task"
        );
        Ok(id)
    }

    /// Recover abandoned tasks, then start the poller. Idempotent: calling
    /// `start` while running is a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut poller = self.poller.lock().await;
        if poller.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("Scheduler already running");
            return Ok(());
        }

        self.state.shutdown.store(false, Ordering::SeqCst);
        scheduler::recover_abandoned_tasks(&self.state).await?;
        *poller = Some(tokio::spawn(scheduler::run_poll_loop(self.state.clone())));
        info!("Task manager started");
        Ok(())
    }

    /// Stop the poller, then wait for in-flight tasks up to a grace window
    /// equal to the largest in-flight task timeout.
    ///
    /// Tasks still running when the window closes are left `running` in the
    /// store and recovered on the next [`start`](Self::start).
    pub async fn stop(&self) {
        let handle = self.poller.lock().await.take();
        let Some(handle) = handle else {
            return;
        };

        self.state.shutdown.store(true, Ordering::SeqCst);
        let _ = handle.await;

        let grace_secs = self.state.max_in_flight_timeout().await.max(0) as u64;
        let grace_deadline = Instant::now() + Duration::from_secs(grace_secs);
        while self.state.in_flight_count().await > 0 && Instant::now() < grace_deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let remaining = self.state.in_flight_count().await;
        if remaining > 0 {
            warn!(
                remaining,
                "Stopped with in-flight tasks still running; they will be recovered on next start"
            );
        } else {
            info!("Task manager stopped");
        }
    }

    pub async fn get_task(&self, id: i64) -> Result<Option<Task>> {
        self.state.store.get_by_id(id).await
    }

    pub async fn get_tasks_by_name(&self, name: &str) -> Result<Vec<Task>> {
        self.state.store.get_by_name(name).await
    }

    pub async fn get_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        self.state.store.get_by_status(status).await
    }

    /// Park a pending task so the scheduler won't claim it. Returns whether
    /// the task was actually pending.
    pub async fn pause_task(&self, id: i64) -> Result<bool> {
        self.transition(id, TaskStatus::Pending, TaskStatus::Paused, None)
            .await
    }

    /// Make a paused task eligible again, effective immediately. Returns
    /// whether the task was actually paused.
    pub async fn resume_task(&self, id: i64) -> Result<bool> {
        let now = Utc::now().timestamp();
        self.transition(id, TaskStatus::Paused, TaskStatus::Pending, Some(now))
            .await
    }

    /// Number of tasks currently dispatched to workers.
    pub async fn in_flight(&self) -> usize {
        self.state.in_flight_count().await
    }

    /// Test helper: remove every task row.
    pub async fn clear_tasks(&self) -> Result<()> {
        self.state.store.clear_tasks().await
    }

    async fn transition(
        &self,
        id: i64,
        from: TaskStatus,
        to: TaskStatus,
        next_run_time: Option<i64>,
    ) -> Result<bool> {
        if !from.can_transition_to(to) {
            return Err(TaskmillError::InvalidState(format!(
                "illegal transition {from} -> {to}"
            )));
        }
        self.state.store.set_status(id, from, to, next_run_time).await
    }
}
