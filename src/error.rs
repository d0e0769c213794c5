//! Error types for task futures.
//!
//! [`TaskError`] is the single error surfaced by the store, the future, the
//! submission service, and the executor. It separates *wait-infrastructure*
//! failures (the caller's wait could not finish) from *task-outcome* failures
//! (the task itself ended badly) so callers can branch on
//! [`is_wait_failure`](TaskError::is_wait_failure) and
//! [`is_task_failure`](TaskError::is_task_failure).

use std::time::Duration;

use crate::codec::ErrorRecord;
use crate::domain::{TaskId, TaskStatus};

/// Boxed error used at the handler and codec seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur during task operations.
///
/// # Examples
///
/// ```
/// use taskfuture::{TaskError, TaskId};
///
/// let err = TaskError::NotFound { task_id: TaskId::new() };
/// assert!(!err.is_wait_failure());
/// assert!(!err.is_task_failure());
/// assert!(err.to_string().starts_with("task not found"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The backing store could not be reached or failed mid-operation.
    ///
    /// Never retried inside the crate; the caller decides.
    #[error("storage unavailable: {message}")]
    StorageUnavailable {
        /// Human-readable description of the failure.
        message: String,
        /// The underlying driver or store error, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// A record with this id already exists.
    #[error("task already exists: {task_id}")]
    AlreadyExists {
        /// The colliding task id.
        task_id: TaskId,
    },

    /// Unknown or expired task id.
    #[error("task not found: {task_id}")]
    NotFound {
        /// The task id that was not found.
        task_id: TaskId,
    },

    /// The requested state machine edge is illegal from the stored status.
    #[error("invalid transition from {from} to {to} for task {task_id}")]
    InvalidTransition {
        /// The task that was being transitioned.
        task_id: TaskId,
        /// The stored status.
        from: TaskStatus,
        /// The rejected target status.
        to: TaskStatus,
    },

    /// Optimistic concurrency conflict: the stored version moved on.
    #[error(
        "concurrent modification of task {task_id}: expected version {expected_version}, found {}",
        .actual_version.map_or_else(|| "a locked record".to_string(), |v| v.to_string())
    )]
    ConcurrentModification {
        /// The task id.
        task_id: TaskId,
        /// The version the caller based its write on.
        expected_version: u64,
        /// The stored version, when known. `None` means another writer held
        /// the record's advisory lock.
        actual_version: Option<u64>,
    },

    /// Non-blocking read on a task that has not reached a terminal state.
    #[error("task not in terminal state: {task_id} (status: {status})")]
    NotReady {
        /// The task id.
        task_id: TaskId,
        /// The current, non-terminal status.
        status: TaskStatus,
    },

    /// A wait exceeded its deadline.
    #[error("timed out after {waited:?} waiting for task {task_id}")]
    Timeout {
        /// The task id.
        task_id: TaskId,
        /// How long the caller actually waited.
        waited: Duration,
    },

    /// The caller cancelled its own wait. The task is unaffected.
    #[error("wait for task {task_id} was cancelled by the caller")]
    WaitCancelled {
        /// The task id.
        task_id: TaskId,
    },

    /// The task was observed in the `cancelled` terminal state.
    #[error("task was cancelled: {task_id}")]
    TaskCancelled {
        /// The task id.
        task_id: TaskId,
    },

    /// The task itself failed. `source` is the decoded native error when its
    /// kind is registered with the codec, a
    /// [`GenericFailure`](crate::codec::GenericFailure) otherwise.
    #[error("task {task_id} failed: {}: {}", .failure.kind, .failure.message)]
    Failed {
        /// The task id.
        task_id: TaskId,
        /// The stored failure record.
        failure: ErrorRecord,
        /// The reconstructed error.
        #[source]
        source: BoxError,
    },

    /// A stored record violates the record invariants or cannot be parsed.
    #[error("corrupt record for task {task_id}: {reason}")]
    CorruptRecord {
        /// The task id.
        task_id: TaskId,
        /// What was wrong with it.
        reason: String,
    },

    /// A payload or result could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The work could not be handed to the dispatch collaborator.
    #[error("dispatch failed for task {task_id}: {message} (rolled back: {rolled_back})")]
    DispatchFailed {
        /// The task id.
        task_id: TaskId,
        /// Why dispatch failed.
        message: String,
        /// Whether the record was moved to `cancelled`. When `false` the
        /// record was left at `pending` for expiry to collect.
        rolled_back: bool,
    },
}

impl TaskError {
    /// Builds a [`TaskError::StorageUnavailable`] from a driver error.
    pub fn storage<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::StorageUnavailable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Returns `true` if the caller's wait failed rather than the task.
    ///
    /// ```
    /// use std::time::Duration;
    /// use taskfuture::{TaskError, TaskId};
    ///
    /// let err = TaskError::Timeout { task_id: TaskId::new(), waited: Duration::from_secs(1) };
    /// assert!(err.is_wait_failure());
    /// assert!(!err.is_task_failure());
    /// ```
    pub fn is_wait_failure(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::WaitCancelled { .. } | Self::StorageUnavailable { .. }
        )
    }

    /// Returns `true` if the task reached a failed or cancelled outcome.
    pub fn is_task_failure(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::TaskCancelled { .. })
    }

    /// Returns `true` if this is an optimistic-concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }

    /// The stored failure record, when the task failed.
    pub fn failure(&self) -> Option<&ErrorRecord> {
        match self {
            Self::Failed { failure, .. } => Some(failure),
            _ => None,
        }
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    Io {
        /// The path that failed.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for this schema.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// Parsed values are unusable (e.g. a missing URL for a remote backend).
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// The configured store could not be opened.
    #[error("failed to open task store: {0}")]
    Store(#[from] TaskError),
}
