//! # Task Handler Registry
//!
//! Maps task names to handler implementations. Registration normally happens
//! before [`start`](crate::TaskManager::start), but the map is behind an
//! `RwLock` so late registration is safe too. Last registration for a name
//! wins; the replacement is logged.
//!
//! Handlers implement [`TaskHandler`], or are plain async closures via the
//! blanket impl:
//!
//! ```rust,ignore
//! manager.register("send_email", |ctx: TaskContext| async move {
//!     ctx.check_timeout()?;
//!     Ok(serde_json::json!({ "sent": true }))
//! })?;
//! ```

use crate::error::{HandlerError, Result, TaskmillError};
use crate::models::Task;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// What a handler returns: a JSON-serializable success value or a failure
/// carrying an error message.
pub type HandlerResult = std::result::Result<Value, HandlerError>;

/// Execution context handed to a handler.
///
/// Carries the task's identity and payload plus the execution deadline. The
/// worker enforces the deadline regardless; `check_timeout` lets a
/// long-running handler bail out cooperatively between steps of work.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub id: i64,
    pub name: String,
    pub payload: Value,
    pub priority: i64,
    timeout_secs: i64,
    deadline: Instant,
}

impl TaskContext {
    pub(crate) fn new(task: &Task, deadline: Instant) -> Self {
        Self {
            id: task.id,
            name: task.name.clone(),
            payload: task.payload_json(),
            priority: task.priority,
            timeout_secs: task.timeout,
            deadline,
        }
    }

    /// Fail fast if the execution deadline has passed.
    pub fn check_timeout(&self) -> std::result::Result<(), HandlerError> {
        if Instant::now() >= self.deadline {
            Err(HandlerError::deadline_exceeded(self.id, self.timeout_secs))
        } else {
            Ok(())
        }
    }

    /// Time left before the deadline; zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Execution contract for task handlers.
///
/// Implementations must be `Send + Sync`: the worker pool invokes handlers
/// concurrently from multiple spawned tasks.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn call(&self, ctx: TaskContext) -> HandlerResult;
}

/// Plain async closures are handlers.
#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn call(&self, ctx: TaskContext) -> HandlerResult {
        (self)(ctx).await
    }
}

/// Thread-safe name → handler map.
#[derive(Default)]
pub struct TaskHandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl TaskHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`. Last registration wins.
    pub fn register(&self, name: &str, handler: Arc<dyn TaskHandler>) -> Result<()> {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| TaskmillError::Registry("handler registry lock poisoned".to_string()))?;

        if handlers.insert(name.to_string(), handler).is_some() {
            warn!(handler_name = name, "Replacing previously registered handler");
        }

        Ok(())
    }

    /// Resolve the handler for a task name, if any.
    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        match self.handlers.read() {
            Ok(handlers) => handlers.get(name).cloned(),
            Err(_) => None,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers
            .read()
            .map(|handlers| handlers.contains_key(name))
            .unwrap_or(false)
    }

    /// All registered names, for diagnostics.
    pub fn registered_handlers(&self) -> Vec<String> {
        match self.handlers.read() {
            Ok(handlers) => handlers.keys().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn probe_handler(tag: &'static str) -> Arc<dyn TaskHandler> {
        Arc::new(move |_ctx: TaskContext| async move { Ok(json!({ "tag": tag })) })
    }

    #[tokio::test]
    async fn lookup_returns_registered_handler() {
        let registry = TaskHandlerRegistry::new();
        registry.register("greet", probe_handler("one")).unwrap();

        let handler = registry.get("greet").expect("handler registered");
        let ctx = dummy_ctx();
        let value = handler.call(ctx).await.unwrap();
        assert_eq!(value["tag"], "one");
        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn last_registration_wins() {
        let registry = TaskHandlerRegistry::new();
        registry.register("greet", probe_handler("first")).unwrap();
        registry.register("greet", probe_handler("second")).unwrap();

        let handler = registry.get("greet").unwrap();
        let value = handler.call(dummy_ctx()).await.unwrap();
        assert_eq!(value["tag"], "second");
        assert_eq!(registry.registered_handlers(), vec!["greet".to_string()]);
    }

    #[test]
    fn context_deadline_check() {
        let mut ctx = dummy_ctx();
        assert!(ctx.check_timeout().is_ok());
        assert!(ctx.remaining() > Duration::from_secs(0));

        ctx.deadline = Instant::now() - Duration::from_millis(1);
        let err = ctx.check_timeout().unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert_eq!(ctx.remaining(), Duration::from_secs(0));
    }

    fn dummy_ctx() -> TaskContext {
        TaskContext {
            id: 7,
            name: "greet".to_string(),
            payload: json!({"data": "x"}),
            priority: 0,
            timeout_secs: 60,
            deadline: Instant::now() + Duration::from_secs(60),
        }
    }
}
