//! Scheduler: the poll loop that claims ready tasks and dispatches workers.
//!
//! One logical loop per manager. Each tick computes the free worker slots,
//! claims at most that many ready tasks (the store enforces the canonical
//! `next_run_time ASC, priority DESC, id ASC` order), and spawns one worker
//! per claimed task. Claim errors skip the tick; nothing stops the loop
//! except the shutdown flag.

use crate::config::TaskmillConfig;
use crate::database::TaskStore;
use crate::error::Result;
use crate::models::Task;
use crate::orchestration::worker;
use crate::registry::TaskHandlerRegistry;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// State shared by the poller, the workers, and the manager facade.
pub(crate) struct SchedulerState {
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) registry: Arc<TaskHandlerRegistry>,
    pub(crate) config: TaskmillConfig,
    pub(crate) shutdown: AtomicBool,
    /// Dispatched-but-unfinished tasks: id → timeout seconds. The map's size
    /// is the admission count; its max value is the shutdown grace window.
    in_flight: Mutex<HashMap<i64, i64>>,
}

impl SchedulerState {
    pub(crate) fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<TaskHandlerRegistry>,
        config: TaskmillConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            shutdown: AtomicBool::new(false),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Largest timeout among in-flight tasks, in seconds; 0 when idle.
    pub(crate) async fn max_in_flight_timeout(&self) -> i64 {
        self.in_flight
            .lock()
            .await
            .values()
            .copied()
            .max()
            .unwrap_or(0)
    }

    async fn track(&self, task_id: i64, timeout: i64) {
        self.in_flight.lock().await.insert(task_id, timeout);
    }

    async fn untrack(&self, task_id: i64) {
        self.in_flight.lock().await.remove(&task_id);
    }
}

/// Reset tasks left `running` by a prior process. Runs before the poll loop
/// starts; the interrupted attempt keeps its `retry_count`.
pub(crate) async fn recover_abandoned_tasks(state: &SchedulerState) -> Result<u64> {
    let now = Utc::now().timestamp();
    let recovered = state.store.recover_abandoned(now).await?;
    if recovered > 0 {
        info!(recovered, "Recovered abandoned running tasks from a prior process");
    }
    Ok(recovered)
}

/// The poll loop. Exits when the shutdown flag is set; in-flight workers
/// keep running and are awaited by [`TaskManager::stop`](crate::TaskManager::stop).
pub(crate) async fn run_poll_loop(state: Arc<SchedulerState>) {
    info!(
        poll_interval_ms = state.config.poll_interval.as_millis() as u64,
        max_concurrent_tasks = state.config.max_concurrent_tasks,
        "Scheduler started"
    );

    while !state.shutdown.load(Ordering::SeqCst) {
        let in_flight = state.in_flight_count().await;
        let free = state.config.max_concurrent_tasks.saturating_sub(in_flight);

        if free > 0 {
            let now = Utc::now().timestamp();
            match state.store.claim_ready(now, free as i64).await {
                Ok(tasks) => {
                    for task in tasks {
                        dispatch(state.clone(), task).await;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to claim ready tasks; skipping poll tick");
                }
            }
        }

        tokio::time::sleep(state.config.poll_interval).await;
    }

    debug!("Scheduler loop exited");
}

/// Hand one claimed task to a worker. Tasks are dispatched in claim order;
/// completion order is up to the handlers.
async fn dispatch(state: Arc<SchedulerState>, task: Task) {
    state.track(task.id, task.timeout).await;

    tokio::spawn(async move {
        let task_id = task.id;
        worker::execute_claimed_task(&state, task).await;
        state.untrack(task_id).await;
    });
}
