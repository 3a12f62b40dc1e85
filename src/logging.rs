//! # Structured Logging
//!
//! Optional tracing setup for binaries embedding the task manager. Console
//! output always; JSON file output when `TASKMILL_LOG_DIR` is set. Library
//! consumers with their own subscriber can skip this entirely, since
//! `try_init` leaves an existing global subscriber in place.

use std::path::PathBuf;
use std::process;
use std::sync::OnceLock;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging once per process.
///
/// The filter comes from `RUST_LOG` when set, else `TASKMILL_LOG` (default
/// `info`).
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = || {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new(
                    std::env::var("TASKMILL_LOG").unwrap_or_else(|_| "info".to_string()),
                )
            })
        };

        let console_layer = fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_filter(filter());

        let file_layer = std::env::var("TASKMILL_LOG_DIR").ok().map(|dir| {
            let log_dir = PathBuf::from(dir);
            let file_appender =
                tracing_appender::rolling::never(&log_dir, format!("taskmill.{}.log", process::id()));
            let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
            // The guard must outlive the process for buffered lines to flush.
            std::mem::forget(guard);

            fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .json()
                .with_filter(filter())
        });

        let subscriber = tracing_subscriber::registry()
            .with(console_layer)
            .with(file_layer);

        if subscriber.try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized; keeping it");
        }
    });
}
