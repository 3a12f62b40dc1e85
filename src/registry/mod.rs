//! Handler registration and lookup.

pub mod task_handler_registry;

pub use task_handler_registry::{
    HandlerResult, TaskContext, TaskHandler, TaskHandlerRegistry,
};
