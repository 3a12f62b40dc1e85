use serde::{Deserialize, Serialize};
use std::fmt;

/// Task status as persisted in the `status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for its `next_run_time`; eligible for claiming.
    Pending,
    /// Claimed by a worker in the active process.
    Running,
    /// Finished successfully (terminal for async tasks).
    Completed,
    /// Retries exhausted (terminal for async tasks).
    PermanentlyFailed,
    /// Manually parked; never claimed until resumed.
    Paused,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::PermanentlyFailed => "permanently_failed",
            Self::Paused => "paused",
        }
    }

    /// Terminal for async tasks; cron tasks only pass through `Completed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::PermanentlyFailed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Whether the claim query may pick this row up.
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Legal transitions of the task lifecycle.
    ///
    /// `Running -> Pending` covers both retry-with-backoff and cron
    /// rescheduling; `Completed -> Pending` is the cron cycle.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Paused)
                | (Running, Completed)
                | (Running, PermanentlyFailed)
                | (Running, Pending)
                | (Completed, Pending)
                | (Paused, Pending)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "permanently_failed" => Ok(Self::PermanentlyFailed),
            "paused" => Ok(Self::Paused),
            _ => Err(format!("Invalid task status: {s}")),
        }
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// Task subtype as persisted in the `type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// One-shot task; terminal on success or once retries are exhausted.
    Async,
    /// Recurring task; next run recomputed from its cron expression.
    Cron,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Async => "async",
            Self::Cron => "cron",
        }
    }

    pub fn is_cron(&self) -> bool {
        matches!(self, Self::Cron)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "async" => Ok(Self::Async),
            "cron" => Ok(Self::Cron),
            _ => Err(format!("Invalid task type: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminal_check() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::PermanentlyFailed.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());
    }

    #[test]
    fn test_only_pending_is_claimable() {
        assert!(TaskStatus::Pending.is_claimable());
        assert!(!TaskStatus::Running.is_claimable());
        assert!(!TaskStatus::Paused.is_claimable());
        assert!(!TaskStatus::Completed.is_claimable());
        assert!(!TaskStatus::PermanentlyFailed.is_claimable());
    }

    #[test]
    fn test_legal_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Paused));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(PermanentlyFailed));
        assert!(Running.can_transition_to(Pending));
        assert!(Completed.can_transition_to(Pending));
        assert!(Paused.can_transition_to(Pending));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!PermanentlyFailed.can_transition_to(Pending));
        assert!(!Paused.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Running));
    }

    #[test]
    fn test_status_string_conversion() {
        assert_eq!(TaskStatus::PermanentlyFailed.to_string(), "permanently_failed");
        assert_eq!(
            "permanently_failed".parse::<TaskStatus>().unwrap(),
            TaskStatus::PermanentlyFailed
        );
        assert_eq!("cron".parse::<TaskType>().unwrap(), TaskType::Cron);
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&TaskStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
        let parsed: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, TaskStatus::Running);
    }
}
