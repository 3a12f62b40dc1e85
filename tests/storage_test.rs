//! Deterministic store-level tests for the claim contract: canonical
//! ordering, atomic marking, recovery, and guarded transitions. These drive
//! the SQLite adapter directly with explicit timestamps so no timers are
//! involved.

use taskmill::database::{SqliteTaskStore, TaskStore};
use taskmill::{NewTask, TaskStatus, TaskType};

const T0: i64 = 1_000_000;

async fn store() -> SqliteTaskStore {
    let store = SqliteTaskStore::connect("sqlite::memory:")
        .await
        .expect("connect");
    store.setup().await.expect("setup");
    store
}

fn task(name: &str, priority: i64, next_run_time: i64) -> NewTask {
    NewTask {
        name: name.to_string(),
        task_type: TaskType::Async,
        priority,
        payload: Some(r#"{"k":"v"}"#.to_string()),
        cron_expr: None,
        next_run_time,
        timeout: 60,
        max_retries: 3,
        retry_interval: 0,
        created_at: T0,
    }
}

#[tokio::test]
async fn setup_is_idempotent() {
    let store = store().await;
    store.setup().await.expect("second setup");
    let id = store.insert(&task("a", 0, T0)).await.unwrap();
    assert!(store.get_by_id(id).await.unwrap().is_some());
}

#[tokio::test]
async fn earlier_deadline_beats_higher_priority() {
    let store = store().await;
    let id1 = store.insert(&task("a", 1, T0 + 2)).await.unwrap();
    let id2 = store.insert(&task("b", 2, T0 + 1)).await.unwrap();
    let id3 = store.insert(&task("c", 1, T0 + 1)).await.unwrap();

    let claimed = store.claim_ready(T0 + 3, 10).await.unwrap();
    let ids: Vec<i64> = claimed.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![id2, id3, id1]);
}

#[tokio::test]
async fn equal_deadline_orders_by_priority_then_id() {
    let store = store().await;
    let id_low = store.insert(&task("low", 0, T0)).await.unwrap();
    let id_high = store.insert(&task("high", 10, T0)).await.unwrap();
    let id_mid = store.insert(&task("mid", 5, T0)).await.unwrap();
    let id_low2 = store.insert(&task("low2", 0, T0)).await.unwrap();

    let claimed = store.claim_ready(T0, 10).await.unwrap();
    let ids: Vec<i64> = claimed.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![id_high, id_mid, id_low, id_low2]);
}

#[tokio::test]
async fn claim_marks_running_and_counts_the_attempt() {
    let store = store().await;
    let id = store.insert(&task("a", 0, T0)).await.unwrap();

    let claimed = store.claim_ready(T0 + 1, 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].status, "running");
    assert_eq!(claimed[0].retry_count, 1);
    assert_eq!(claimed[0].last_active_time, Some(T0 + 1));

    // The returned view matches the persisted row.
    let row = store.get_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.status, "running");
    assert_eq!(row.retry_count, 1);
    assert_eq!(row.last_active_time, Some(T0 + 1));

    // A running row cannot be claimed again.
    assert!(store.claim_ready(T0 + 2, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn claim_respects_limit_and_readiness() {
    let store = store().await;
    for i in 0..3 {
        store.insert(&task(&format!("ready{i}"), 0, T0)).await.unwrap();
    }
    let future_id = store.insert(&task("future", 99, T0 + 100)).await.unwrap();

    let first = store.claim_ready(T0, 2).await.unwrap();
    assert_eq!(first.len(), 2);
    let second = store.claim_ready(T0, 2).await.unwrap();
    assert_eq!(second.len(), 1);

    // Not yet due, regardless of priority.
    assert!(store.claim_ready(T0, 10).await.unwrap().is_empty());
    let future = store.get_by_id(future_id).await.unwrap().unwrap();
    assert_eq!(future.status, "pending");
}

#[tokio::test]
async fn recovery_resets_running_rows_without_refunding_the_attempt() {
    let store = store().await;
    let id = store.insert(&task("a", 0, T0)).await.unwrap();
    store.claim_ready(T0, 1).await.unwrap();

    let recovered = store.recover_abandoned(T0 + 5).await.unwrap();
    assert_eq!(recovered, 1);

    let row = store.get_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.status, "pending");
    assert_eq!(row.next_run_time, T0 + 5);
    assert_eq!(row.retry_count, 1);

    // Nothing left to recover.
    assert_eq!(store.recover_abandoned(T0 + 6).await.unwrap(), 0);
}

#[tokio::test]
async fn paused_rows_are_skipped_by_the_claim() {
    let store = store().await;
    let id = store.insert(&task("a", 0, T0)).await.unwrap();

    assert!(store
        .set_status(id, TaskStatus::Pending, TaskStatus::Paused, None)
        .await
        .unwrap());
    assert!(store.claim_ready(T0 + 10, 10).await.unwrap().is_empty());

    // Guarded transition: already paused, so pausing again misses.
    assert!(!store
        .set_status(id, TaskStatus::Pending, TaskStatus::Paused, None)
        .await
        .unwrap());

    assert!(store
        .set_status(id, TaskStatus::Paused, TaskStatus::Pending, Some(T0 + 10))
        .await
        .unwrap());
    let claimed = store.claim_ready(T0 + 10, 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, id);
}

#[tokio::test]
async fn complete_and_fail_update_rows() {
    let store = store().await;
    let ok_id = store.insert(&task("ok", 0, T0)).await.unwrap();
    let retry_id = store.insert(&task("retry", 0, T0)).await.unwrap();
    store.claim_ready(T0, 10).await.unwrap();

    store.complete(ok_id, r#"{"success":true}"#).await.unwrap();
    let done = store.get_by_id(ok_id).await.unwrap().unwrap();
    assert_eq!(done.status, "completed");
    assert_eq!(done.result_json().unwrap()["success"], true);
    assert!(done.error.is_none());

    store
        .fail(retry_id, "boom", TaskStatus::Pending, Some(T0 + 30))
        .await
        .unwrap();
    let retried = store.get_by_id(retry_id).await.unwrap().unwrap();
    assert_eq!(retried.status, "pending");
    assert_eq!(retried.error.as_deref(), Some("boom"));
    assert_eq!(retried.next_run_time, T0 + 30);
    // Async failures keep their attempt count.
    assert_eq!(retried.retry_count, 1);

    store
        .fail(retry_id, "boom", TaskStatus::PermanentlyFailed, None)
        .await
        .unwrap();
    let dead = store.get_by_id(retry_id).await.unwrap().unwrap();
    assert_eq!(dead.status, "permanently_failed");
    // None keeps the previous next_run_time.
    assert_eq!(dead.next_run_time, T0 + 30);
}

#[tokio::test]
async fn cron_reschedule_resets_the_attempt_counter() {
    let store = store().await;
    let mut cron_task = task("tick", 0, T0);
    cron_task.task_type = TaskType::Cron;
    cron_task.cron_expr = Some("* * * * *".to_string());
    cron_task.max_retries = 0;
    let id = store.insert(&cron_task).await.unwrap();

    store.claim_ready(T0, 1).await.unwrap();
    store
        .reschedule_cron(id, Some(r#"{"ok":true}"#), T0 + 60)
        .await
        .unwrap();

    let row = store.get_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.status, "pending");
    assert_eq!(row.retry_count, 0);
    assert_eq!(row.next_run_time, T0 + 60);
    assert_eq!(row.result_json().unwrap()["ok"], true);

    // Failed cron runs also reset the counter when they go back to pending.
    store.claim_ready(T0 + 60, 1).await.unwrap();
    store
        .fail(id, "cron failure", TaskStatus::Pending, Some(T0 + 120))
        .await
        .unwrap();
    let row = store.get_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.status, "pending");
    assert_eq!(row.retry_count, 0);
    assert_eq!(row.error.as_deref(), Some("cron failure"));
}

#[tokio::test]
async fn reads_filter_by_name_and_status() {
    let store = store().await;
    let a1 = store.insert(&task("alpha", 0, T0)).await.unwrap();
    let a2 = store.insert(&task("alpha", 0, T0 + 100)).await.unwrap();
    store.insert(&task("beta", 0, T0)).await.unwrap();

    let alphas = store.get_by_name("alpha").await.unwrap();
    assert_eq!(alphas.iter().map(|t| t.id).collect::<Vec<_>>(), vec![a1, a2]);

    store.claim_ready(T0, 1).await.unwrap();
    let running = store.get_by_status(TaskStatus::Running).await.unwrap();
    assert_eq!(running.len(), 1);
    let pending = store.get_by_status(TaskStatus::Pending).await.unwrap();
    assert_eq!(pending.len(), 2);

    store.clear_tasks().await.unwrap();
    assert!(store.get_by_name("alpha").await.unwrap().is_empty());
}
