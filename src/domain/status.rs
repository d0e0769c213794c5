//! Task lifecycle status and the state machine that governs it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::TaskId;
use crate::error::TaskError;

/// Lifecycle status of a task record.
///
/// # State Machine
///
/// ```text
/// Pending -> Running, Cancelled
/// Running -> Completed, Failed
/// Completed, Failed, Cancelled -> (terminal, no transitions)
/// ```
///
/// A running task cannot be cancelled: once a worker claims it, it runs to
/// completion or failure.
///
/// # Examples
///
/// ```
/// use taskfuture::TaskStatus;
///
/// assert!(TaskStatus::Pending.can_transition_to(&TaskStatus::Running));
/// assert!(!TaskStatus::Running.can_transition_to(&TaskStatus::Cancelled));
/// assert!(TaskStatus::Failed.is_terminal());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Submitted, not yet claimed by a worker.
    Pending,
    /// Claimed by a worker and executing.
    Running,
    /// Finished successfully (terminal).
    Completed,
    /// Finished with an error (terminal).
    Failed,
    /// Cancelled before a worker claimed it (terminal).
    Cancelled,
}

impl TaskStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [TaskStatus; 5] = [
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Statuses a record can hold at `version`. Every edge adds one to the
    /// version, so the state machine fixes this set.
    ///
    /// ```
    /// use taskfuture::TaskStatus;
    ///
    /// assert_eq!(TaskStatus::at_version(0), &[TaskStatus::Pending]);
    /// assert!(TaskStatus::at_version(3).is_empty());
    /// ```
    pub fn at_version(version: u64) -> &'static [TaskStatus] {
        match version {
            0 => &[Self::Pending],
            1 => &[Self::Running, Self::Cancelled],
            2 => &[Self::Completed, Self::Failed],
            _ => &[],
        }
    }

    /// Returns `true` for `Completed`, `Failed`, and `Cancelled`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns `true` if `self -> next` is a legal edge.
    pub fn can_transition_to(&self, next: &Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Cancelled)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }

    /// Validates `self -> next`, returning [`TaskError::InvalidTransition`]
    /// when the edge is illegal.
    ///
    /// ```
    /// use taskfuture::{TaskId, TaskStatus};
    ///
    /// let id = TaskId::new();
    /// assert!(TaskStatus::Pending.validate_transition(&id, &TaskStatus::Cancelled).is_ok());
    /// assert!(TaskStatus::Completed.validate_transition(&id, &TaskStatus::Running).is_err());
    /// ```
    pub fn validate_transition(&self, task_id: &TaskId, next: &Self) -> Result<(), TaskError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(TaskError::InvalidTransition {
                task_id: task_id.clone(),
                from: *self,
                to: *next,
            })
        }
    }

    /// The storage tag for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a storage tag is not a known status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for TaskStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_tags_round_trip() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>(), Ok(status));
        }
        assert!("working".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn serde_uses_storage_tags() {
        let json = serde_json::to_value(TaskStatus::Cancelled).unwrap();
        assert_eq!(json, serde_json::json!("cancelled"));
    }

    #[test]
    fn exactly_four_legal_edges() {
        let legal = TaskStatus::ALL
            .iter()
            .flat_map(|from| TaskStatus::ALL.iter().map(move |to| (from, to)))
            .filter(|(from, to)| from.can_transition_to(to))
            .count();
        assert_eq!(legal, 4);
    }

    #[test]
    fn invalid_transition_carries_both_ends() {
        let id = TaskId::new();
        let err = TaskStatus::Running
            .validate_transition(&id, &TaskStatus::Cancelled)
            .unwrap_err();
        match err {
            TaskError::InvalidTransition { from, to, .. } => {
                assert_eq!(from, TaskStatus::Running);
                assert_eq!(to, TaskStatus::Cancelled);
            },
            other => panic!("expected InvalidTransition, got: {other}"),
        }
    }
}
