//! Worker execution of a single claimed task.
//!
//! The handler runs under `tokio::time::timeout` with `catch_unwind`, so a
//! blown deadline cancels it at its next suspension point, and a panic is
//! captured instead of taking the worker down. Whatever the outcome, the
//! task's next persisted state is computed here: completion, cron
//! rescheduling, retry with backoff, or permanent failure.

use crate::cron::CronSpec;
use crate::database::TaskStore;
use crate::error::{Result, TaskmillError};
use crate::models::Task;
use crate::orchestration::retry::{self, RetryDecision};
use crate::orchestration::scheduler::SchedulerState;
use crate::registry::TaskContext;
use crate::state_machine::TaskStatus;
use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

pub(crate) async fn execute_claimed_task(state: &SchedulerState, task: Task) {
    let Some(handler) = state.registry.get(&task.name) else {
        warn!(task_id = task.id, task_name = %task.name, "No handler registered for task");
        let message = format!("no handler for {}", task.name);
        persist(
            state,
            task.id,
            PersistOp::Fail {
                error: &message,
                status: TaskStatus::PermanentlyFailed,
                next_run_time: None,
            },
        )
        .await;
        return;
    };

    let timeout = Duration::from_secs(task.timeout.max(0) as u64);
    let deadline = Instant::now() + timeout;
    let ctx = TaskContext::new(&task, deadline);

    debug!(
        task_id = task.id,
        task_name = %task.name,
        attempt = task.retry_count,
        "Executing task"
    );
    let started = std::time::Instant::now();

    let execution = tokio::time::timeout(
        timeout,
        AssertUnwindSafe(handler.call(ctx)).catch_unwind(),
    )
    .await;

    let execution_time_ms = started.elapsed().as_millis() as i64;
    let now = Utc::now().timestamp();

    match execution {
        // Success within the deadline
        Ok(Ok(Ok(value))) => {
            debug!(task_id = task.id, execution_time_ms, "Handler completed");
            on_success(state, &task, value, now).await;
        }
        // Handler returned a failure
        Ok(Ok(Err(handler_error))) => {
            debug!(
                task_id = task.id,
                error = %handler_error,
                execution_time_ms,
                "Handler returned error"
            );
            on_failure(state, &task, handler_error.to_string(), now).await;
        }
        // Handler panicked
        Ok(Err(panic_error)) => {
            let panic_msg = if let Some(s) = panic_error.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_error.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic".to_string()
            };
            error!(task_id = task.id, panic_msg = %panic_msg, "Handler panicked");
            on_failure(state, &task, format!("handler panicked: {panic_msg}"), now).await;
        }
        // Deadline elapsed; the handler future was dropped at its last
        // suspension point
        Err(_) => {
            warn!(
                task_id = task.id,
                timeout_secs = task.timeout,
                "Handler timed out"
            );
            on_failure(
                state,
                &task,
                format!("task timed out after {}s", task.timeout),
                now,
            )
            .await;
        }
    }
}

async fn on_success(state: &SchedulerState, task: &Task, value: serde_json::Value, now: i64) {
    let serialized = match serde_json::to_string(&value) {
        Ok(s) => s,
        Err(e) => {
            on_failure(state, task, format!("unserializable result: {e}"), now).await;
            return;
        }
    };

    if task.is_cron() {
        match next_cron_run(task, now) {
            Ok(next_run_time) => {
                persist(
                    state,
                    task.id,
                    PersistOp::RescheduleCron {
                        result: Some(&serialized),
                        next_run_time,
                    },
                )
                .await;
            }
            Err(e) => {
                error!(task_id = task.id, error = %e, "Cannot compute next cron occurrence");
                persist(
                    state,
                    task.id,
                    PersistOp::Fail {
                        error: &e.to_string(),
                        status: TaskStatus::PermanentlyFailed,
                        next_run_time: None,
                    },
                )
                .await;
            }
        }
    } else {
        persist(state, task.id, PersistOp::Complete { result: &serialized }).await;
    }
}

async fn on_failure(state: &SchedulerState, task: &Task, error: String, now: i64) {
    if task.is_cron() {
        // Cron tasks don't retry with backoff; they fire again on schedule.
        match next_cron_run(task, now) {
            Ok(next_run_time) => {
                warn!(
                    task_id = task.id,
                    error = %error,
                    next_run_time,
                    "Cron task failed; waiting for next occurrence"
                );
                persist(
                    state,
                    task.id,
                    PersistOp::Fail {
                        error: &error,
                        status: TaskStatus::Pending,
                        next_run_time: Some(next_run_time),
                    },
                )
                .await;
            }
            Err(e) => {
                let combined = format!("{error}; {e}");
                persist(
                    state,
                    task.id,
                    PersistOp::Fail {
                        error: &combined,
                        status: TaskStatus::PermanentlyFailed,
                        next_run_time: None,
                    },
                )
                .await;
            }
        }
        return;
    }

    match retry::evaluate(task.retry_count, task.max_retries, task.retry_interval, now) {
        RetryDecision::Retry { next_run_time } => {
            warn!(
                task_id = task.id,
                attempt = task.retry_count,
                max_retries = task.max_retries,
                next_run_time,
                error = %error,
                "Task failed; scheduling retry"
            );
            persist(
                state,
                task.id,
                PersistOp::Fail {
                    error: &error,
                    status: TaskStatus::Pending,
                    next_run_time: Some(next_run_time),
                },
            )
            .await;
        }
        RetryDecision::GiveUp => {
            error!(
                task_id = task.id,
                attempts = task.retry_count,
                error = %error,
                "Task permanently failed"
            );
            persist(
                state,
                task.id,
                PersistOp::Fail {
                    error: &error,
                    status: TaskStatus::PermanentlyFailed,
                    next_run_time: None,
                },
            )
            .await;
        }
    }
}

fn next_cron_run(task: &Task, now: i64) -> Result<i64> {
    let expr = task
        .cron_expr
        .as_deref()
        .ok_or_else(|| TaskmillError::InvalidCron {
            expression: String::new(),
            reason: "cron task has no expression".to_string(),
        })?;
    CronSpec::parse(expr)?.next_after(now)
}

enum PersistOp<'a> {
    Complete {
        result: &'a str,
    },
    Fail {
        error: &'a str,
        status: TaskStatus,
        next_run_time: Option<i64>,
    },
    RescheduleCron {
        result: Option<&'a str>,
        next_run_time: i64,
    },
}

/// Apply a state write, retrying once in memory on store failure. A second
/// failure leaves the row `running`; recovery on the next `start()` picks
/// it back up.
async fn persist(state: &SchedulerState, task_id: i64, op: PersistOp<'_>) {
    for attempt in 0..2u8 {
        let outcome = match &op {
            PersistOp::Complete { result } => state.store.complete(task_id, result).await,
            PersistOp::Fail {
                error,
                status,
                next_run_time,
            } => {
                state
                    .store
                    .fail(task_id, error, *status, *next_run_time)
                    .await
            }
            PersistOp::RescheduleCron {
                result,
                next_run_time,
            } => {
                state
                    .store
                    .reschedule_cron(task_id, *result, *next_run_time)
                    .await
            }
        };

        match outcome {
            Ok(()) => return,
            Err(e) if attempt == 0 => {
                warn!(task_id, error = %e, "Task state write failed; retrying once");
            }
            Err(e) => {
                error!(
                    task_id,
                    error = %e,
                    "Task state write failed twice; task will be recovered as abandoned"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskmillConfig;
    use crate::database::{SqliteTaskStore, TaskStore};
    use crate::error::HandlerError;
    use crate::models::NewTask;
    use crate::registry::{HandlerResult, TaskHandler, TaskHandlerRegistry};
    use crate::state_machine::TaskType;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    struct PanicHandler;

    #[async_trait]
    impl TaskHandler for PanicHandler {
        async fn call(&self, _ctx: TaskContext) -> HandlerResult {
            panic!("boom")
        }
    }

    async fn test_state() -> Arc<SchedulerState> {
        let store = SqliteTaskStore::connect("sqlite::memory:").await.unwrap();
        store.setup().await.unwrap();
        Arc::new(SchedulerState::new(
            Arc::new(store),
            Arc::new(TaskHandlerRegistry::new()),
            TaskmillConfig::new("sqlite::memory:"),
        ))
    }

    fn new_task(name: &str, task_type: TaskType, cron_expr: Option<&str>) -> NewTask {
        NewTask {
            name: name.to_string(),
            task_type,
            priority: 0,
            payload: Some("{}".to_string()),
            cron_expr: cron_expr.map(str::to_string),
            next_run_time: 0,
            timeout: 60,
            max_retries: if task_type.is_cron() { 0 } else { 2 },
            retry_interval: 0,
            created_at: 0,
        }
    }

    async fn claim_one(state: &SchedulerState) -> Task {
        let now = Utc::now().timestamp();
        let mut claimed = state.store.claim_ready(now, 1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        claimed.pop().unwrap()
    }

    #[tokio::test]
    async fn missing_handler_fails_permanently() {
        let state = test_state().await;
        let id = state
            .store
            .insert(&new_task("ghost", TaskType::Async, None))
            .await
            .unwrap();

        let task = claim_one(&state).await;
        execute_claimed_task(&state, task).await;

        let task = state.store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(task.status, "permanently_failed");
        assert_eq!(task.error.as_deref(), Some("no handler for ghost"));
    }

    #[tokio::test]
    async fn handler_error_schedules_retry() {
        let state = test_state().await;
        state
            .registry
            .register(
                "flaky",
                Arc::new(|_ctx: TaskContext| async move {
                    Err(HandlerError::new("Task failed"))
                }),
            )
            .unwrap();
        let id = state
            .store
            .insert(&new_task("flaky", TaskType::Async, None))
            .await
            .unwrap();

        let task = claim_one(&state).await;
        let claimed_at = Utc::now().timestamp();
        execute_claimed_task(&state, task).await;

        let task = state.store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(task.status, "pending");
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.error.as_deref(), Some("Task failed"));
        assert!(task.next_run_time > claimed_at - 1);
    }

    #[tokio::test]
    async fn panic_is_captured_as_failure() {
        let state = test_state().await;
        state.registry.register("boom", Arc::new(PanicHandler)).unwrap();
        let id = state
            .store
            .insert(&new_task("boom", TaskType::Async, None))
            .await
            .unwrap();

        let task = claim_one(&state).await;
        execute_claimed_task(&state, task).await;

        let task = state.store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(task.status, "pending");
        assert_eq!(task.error.as_deref(), Some("handler panicked: boom"));
    }

    #[tokio::test]
    async fn cron_success_reschedules_pending() {
        let state = test_state().await;
        state
            .registry
            .register(
                "tick",
                Arc::new(|_ctx: TaskContext| async move { Ok(json!({"ok": true})) }),
            )
            .unwrap();
        let id = state
            .store
            .insert(&new_task("tick", TaskType::Cron, Some("* * * * *")))
            .await
            .unwrap();

        let task = claim_one(&state).await;
        let executed_at = Utc::now().timestamp();
        execute_claimed_task(&state, task).await;

        let task = state.store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(task.status, "pending");
        assert_eq!(task.retry_count, 0);
        assert!(task.next_run_time > executed_at);
        assert_eq!(task.result_json().unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn cron_failure_waits_for_next_occurrence() {
        let state = test_state().await;
        state
            .registry
            .register(
                "tick",
                Arc::new(|_ctx: TaskContext| async move {
                    Err(HandlerError::new("cron blew up"))
                }),
            )
            .unwrap();
        let id = state
            .store
            .insert(&new_task("tick", TaskType::Cron, Some("* * * * *")))
            .await
            .unwrap();

        let task = claim_one(&state).await;
        let executed_at = Utc::now().timestamp();
        execute_claimed_task(&state, task).await;

        let task = state.store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(task.status, "pending");
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.error.as_deref(), Some("cron blew up"));
        assert!(task.next_run_time > executed_at);
    }
}
