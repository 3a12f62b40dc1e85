//! # taskmill
//!
//! A durable task manager: persistent async and cron tasks over SQLite,
//! MySQL, or PostgreSQL, executed by in-process polling workers.
//!
//! Every task lives in a `tasks` table and survives process restarts. The
//! scheduler claims ready tasks atomically in deadline-then-priority order,
//! a bounded worker pool runs them under per-task timeouts, failed attempts
//! retry with backoff up to a budget, and cron tasks are rescheduled from
//! their expression after every run. Recovery on startup resets tasks a
//! crashed process left behind, so execution is at-least-once.
//!
//! ```rust,ignore
//! use taskmill::{TaskContext, TaskManager, TaskOptions, TaskmillConfig};
//!
//! let manager = TaskManager::connect(TaskmillConfig::new("sqlite://tasks.db")).await?;
//! manager.register("resize_image", |ctx: TaskContext| async move {
//!     ctx.check_timeout()?;
//!     Ok(serde_json::json!({ "resized": ctx.payload["path"] }))
//! })?;
//! let id = manager
//!     .enqueue("resize_image", serde_json::json!({ "path": "a.png" }), TaskOptions::default())
//!     .await?;
//! manager.start().await?;
//! ```

pub mod config;
pub mod cron;
pub mod database;
pub mod error;
pub mod logging;
pub mod manager;
pub mod models;
pub mod orchestration;
pub mod registry;
pub mod state_machine;

pub use config::{TaskOptions, TaskmillConfig};
pub use cron::CronSpec;
pub use database::TaskStore;
pub use error::{HandlerError, Result, TaskmillError};
pub use manager::TaskManager;
pub use models::{NewTask, Task};
pub use registry::{HandlerResult, TaskContext, TaskHandler, TaskHandlerRegistry};
pub use state_machine::{TaskStatus, TaskType};
