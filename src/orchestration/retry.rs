//! Retry policy and backoff curve.
//!
//! `attempt` is the post-claim `retry_count`: the claim increments the
//! counter, so an attempt that just failed is counted. Total executions of
//! an async task are therefore bounded by `max_retries + 1`.

/// Ceiling for the exponential curve when no fixed interval is configured.
const MAX_BACKOFF_SECS: i64 = 60;

/// What to do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-queue as pending at `next_run_time`.
    Retry { next_run_time: i64 },
    /// Retries exhausted; mark permanently failed.
    GiveUp,
}

/// Seconds to wait before attempt `attempt + 1`.
///
/// A positive `retry_interval` is used verbatim; otherwise the delay is
/// `2^(attempt-1)` seconds capped at 60. Pure and monotonic non-decreasing,
/// which keeps `next_run_time` monotonic across retries of one task.
pub fn backoff_delay(attempt: i64, retry_interval: i64) -> i64 {
    if retry_interval > 0 {
        return retry_interval;
    }
    let exponent = (attempt - 1).clamp(0, 6) as u32;
    (1i64 << exponent).min(MAX_BACKOFF_SECS)
}

/// Apply the retry policy to a failed attempt.
pub fn evaluate(attempt: i64, max_retries: i64, retry_interval: i64, now: i64) -> RetryDecision {
    if attempt > max_retries {
        RetryDecision::GiveUp
    } else {
        RetryDecision::Retry {
            next_run_time: now + backoff_delay(attempt, retry_interval),
        }
    }
}
