//! Cron expression parsing and next-occurrence computation.

use crate::error::{Result, TaskmillError};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;

/// A validated cron schedule for a recurring task.
///
/// Accepts standard 5-field expressions (`minute hour day-of-month month
/// day-of-week`) and 6-field expressions with a leading seconds field.
/// 5-field input is normalized by prepending `0` seconds, so `*/5 * * * *`
/// fires at second zero of every fifth minute.
#[derive(Debug, Clone)]
pub struct CronSpec {
    expression: String,
    schedule: Schedule,
}

impl CronSpec {
    pub fn parse(expression: &str) -> Result<Self> {
        let trimmed = expression.trim();
        let normalized = match trimmed.split_whitespace().count() {
            5 => format!("0 {trimmed}"),
            6 => trimmed.to_string(),
            n => {
                return Err(TaskmillError::InvalidCron {
                    expression: expression.to_string(),
                    reason: format!("expected 5 or 6 fields, got {n}"),
                })
            }
        };

        let schedule = Schedule::from_str(&normalized).map_err(|e| TaskmillError::InvalidCron {
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            expression: trimmed.to_string(),
            schedule,
        })
    }

    /// The expression as supplied (before seconds-field normalization).
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Smallest occurrence strictly greater than `from_epoch`, as epoch
    /// seconds.
    pub fn next_after(&self, from_epoch: i64) -> Result<i64> {
        let from = DateTime::<Utc>::from_timestamp(from_epoch, 0).ok_or_else(|| {
            TaskmillError::InvalidCron {
                expression: self.expression.clone(),
                reason: format!("timestamp {from_epoch} out of range"),
            }
        })?;

        self.schedule
            .after(&from)
            .next()
            .map(|dt| dt.timestamp())
            .ok_or_else(|| TaskmillError::InvalidCron {
                expression: self.expression.clone(),
                reason: "no future occurrence".to_string(),
            })
    }
}
