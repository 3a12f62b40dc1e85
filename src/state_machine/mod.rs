//! Task state definitions and legal-transition checks.
//!
//! Raw SQL writes are confined to the storage adapters; the scheduler,
//! worker, and pause/resume paths consult [`TaskStatus::can_transition_to`]
//! before asking the store for a transition.

pub mod states;

pub use states::{TaskStatus, TaskType};
