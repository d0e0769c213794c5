//! Task record -- the durable, backend-neutral representation of a task.
//!
//! [`TaskRecord`] is what every store persists. Mutations go through
//! [`TaskRecord::apply`], which validates the state machine edge and produces
//! the successor record; [`TaskRecord::validate`] checks the field invariants
//! on every load.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::ErrorRecord;
use crate::constants::INITIAL_VERSION;
use crate::domain::TaskStatus;
use crate::error::TaskError;

/// Opaque unique identifier of a task (`UUIDv4`, canonical hyphenated form).
///
/// # Examples
///
/// ```
/// use taskfuture::TaskId;
///
/// let id = TaskId::new();
/// let parsed: TaskId = id.to_string().parse().unwrap();
/// assert_eq!(id, parsed);
/// assert_eq!(id.to_string().len(), 36);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generates a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TaskId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A mutation requested of [`TaskStore::transition`](crate::store::TaskStore::transition).
///
/// Each variant carries exactly the data its target state needs, so a
/// completed record always has a result and a failed one always has an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// `pending -> running`: a worker claimed the task.
    Start,
    /// `running -> completed` with the serialized success value.
    Complete {
        /// Opaque serialized result.
        result: Vec<u8>,
    },
    /// `running -> failed` with the encoded failure.
    Fail {
        /// Structured failure description.
        error: ErrorRecord,
    },
    /// `pending -> cancelled`.
    Cancel,
}

impl Transition {
    /// The status this transition moves a record into.
    pub fn target(&self) -> TaskStatus {
        match self {
            Self::Start => TaskStatus::Running,
            Self::Complete { .. } => TaskStatus::Completed,
            Self::Fail { .. } => TaskStatus::Failed,
            Self::Cancel => TaskStatus::Cancelled,
        }
    }
}

/// Durable record of one submitted unit of work.
///
/// All fields are public so that store implementors have full access.
///
/// # Examples
///
/// ```
/// use chrono::Utc;
/// use taskfuture::domain::{TaskRecord, Transition};
/// use taskfuture::{TaskId, TaskStatus};
///
/// let record = TaskRecord::new(TaskId::new(), Some(b"ping".to_vec()), Utc::now());
/// assert_eq!(record.status, TaskStatus::Pending);
/// assert_eq!(record.version, 0);
///
/// let running = record.apply(&Transition::Start, Utc::now()).unwrap();
/// assert_eq!(running.status, TaskStatus::Running);
/// assert_eq!(running.version, 1);
/// assert!(running.started_at.is_some());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    /// Primary key.
    pub task_id: TaskId,

    /// Current lifecycle status.
    pub status: TaskStatus,

    /// Serialized work descriptor. Dropped when the record becomes terminal.
    pub payload: Option<Vec<u8>>,

    /// Serialized success value; present iff `status` is `Completed`.
    pub result: Option<Vec<u8>>,

    /// Failure description; present iff `status` is `Failed`.
    pub error: Option<ErrorRecord>,

    /// When the record was created.
    pub submitted_at: DateTime<Utc>,

    /// When a worker claimed the task.
    pub started_at: Option<DateTime<Utc>>,

    /// When the record entered a terminal state.
    pub completed_at: Option<DateTime<Utc>>,

    /// Optimistic concurrency counter.
    pub version: u64,
}

impl TaskRecord {
    /// Creates a `Pending` record at [`INITIAL_VERSION`].
    pub fn new(task_id: TaskId, payload: Option<Vec<u8>>, now: DateTime<Utc>) -> Self {
        Self {
            task_id,
            status: TaskStatus::Pending,
            payload,
            result: None,
            error: None,
            submitted_at: truncate_to_millis(now),
            started_at: None,
            completed_at: None,
            version: INITIAL_VERSION,
        }
    }

    /// Returns the successor record after `transition`, with `version + 1`.
    ///
    /// Timestamps never run backwards: a skewed `now` is clamped to the
    /// previous timestamp in the lifecycle.
    ///
    /// # Errors
    ///
    /// [`TaskError::InvalidTransition`] if the edge is illegal from the
    /// current status.
    pub fn apply(&self, transition: &Transition, now: DateTime<Utc>) -> Result<Self, TaskError> {
        let target = transition.target();
        self.status.validate_transition(&self.task_id, &target)?;

        let now = truncate_to_millis(now);
        let mut next = self.clone();
        next.status = target;
        next.version = self.version + 1;

        match transition {
            Transition::Start => {
                next.started_at = Some(now.max(self.submitted_at));
            },
            Transition::Complete { result } => {
                next.result = Some(result.clone());
                next.completed_at = Some(now.max(self.last_timestamp()));
            },
            Transition::Fail { error } => {
                next.error = Some(error.clone());
                next.completed_at = Some(now.max(self.last_timestamp()));
            },
            Transition::Cancel => {
                next.completed_at = Some(now.max(self.last_timestamp()));
            },
        }

        if target.is_terminal() {
            next.payload = None;
        }

        Ok(next)
    }

    /// Checks the field invariants for the current status.
    ///
    /// # Errors
    ///
    /// [`TaskError::CorruptRecord`] describing the first violated invariant.
    pub fn validate(&self) -> Result<(), TaskError> {
        let corrupt = |reason: &str| TaskError::CorruptRecord {
            task_id: self.task_id.clone(),
            reason: format!("{reason} (status: {})", self.status),
        };

        if self.result.is_some() != (self.status == TaskStatus::Completed) {
            return Err(corrupt("result must be present exactly when completed"));
        }
        if self.error.is_some() != (self.status == TaskStatus::Failed) {
            return Err(corrupt("error must be present exactly when failed"));
        }

        let needs_start = matches!(
            self.status,
            TaskStatus::Running | TaskStatus::Completed | TaskStatus::Failed
        );
        if self.started_at.is_some() != needs_start {
            return Err(corrupt("started_at does not match status"));
        }
        if self.completed_at.is_some() != self.status.is_terminal() {
            return Err(corrupt("completed_at must be present exactly when terminal"));
        }

        if let Some(started) = self.started_at {
            if started < self.submitted_at {
                return Err(corrupt("started_at precedes submitted_at"));
            }
        }
        if let Some(completed) = self.completed_at {
            if completed < self.last_start() {
                return Err(corrupt("completed_at precedes an earlier timestamp"));
            }
        }

        Ok(())
    }

    /// Returns `true` once the record is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn last_start(&self) -> DateTime<Utc> {
        self.started_at.unwrap_or(self.submitted_at)
    }

    fn last_timestamp(&self) -> DateTime<Utc> {
        self.completed_at.unwrap_or_else(|| self.last_start())
    }
}

/// Drops sub-millisecond precision so timestamps round-trip through every
/// backend unchanged.
pub fn truncate_to_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}

/// Current time at millisecond precision.
pub fn now_millis() -> DateTime<Utc> {
    truncate_to_millis(Utc::now())
}
