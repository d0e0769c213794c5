//! Task store trait, backends, and supporting types.
//!
//! # Architecture
//!
//! 1. **[`TaskStore`]** -- the object-safe contract used as
//!    `Arc<dyn TaskStore>` by [`TaskFuture`](crate::future::TaskFuture),
//!    [`SubmissionService`](crate::submission::SubmissionService),
//!    [`Executor`](crate::executor::Executor), and
//!    [`ExpirationSweep`](crate::sweep::ExpirationSweep).
//!
//! 2. **Relational backend** -- [`SqlTaskStore`](sql::SqlTaskStore) over
//!    sqlx/SQLite, one row per record, optimistic concurrency through a
//!    conditional `UPDATE`. Behind the `sqlite` feature (on by default).
//!
//! 3. **Key-value backend** -- [`KvTaskStore<B>`](kv::KvTaskStore) holds the
//!    record layout, versioning, expiry, and sweep logic on top of any
//!    [`KvBackend`]: [`InMemoryBackend`](memory::InMemoryBackend) or, behind
//!    the `redis` feature, [`RedisBackend`](redis::RedisBackend).
//!
//! Every implementation validates records on load, never retries
//! internally, and reports driver failures as
//! [`TaskError::StorageUnavailable`].

pub mod backend;
pub mod kv;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
#[cfg(feature = "sqlite")]
pub mod sql;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use backend::{CasOutcome, KvBackend, KvOp, StorageError};
pub use kv::{InMemoryTaskStore, KvTaskStore};
pub use memory::InMemoryBackend;

use crate::constants::{DEFAULT_SWEEP_BATCH_SIZE, DEFAULT_SWEEP_MAX_PASSES};
use crate::domain::{now_millis, TaskId, TaskRecord, TaskStatus, Transition};
use crate::error::TaskError;

/// Bounds on a single [`TaskStore::delete_expired`] call.
///
/// # Examples
///
/// ```
/// use taskfuture::store::SweepLimits;
///
/// let limits = SweepLimits::default();
/// assert_eq!(limits.batch_size, 1_000);
/// assert_eq!(limits.max_passes, 100);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepLimits {
    /// Records removed per pass.
    pub batch_size: usize,
    /// Passes per call before returning, even if more records are eligible.
    pub max_passes: usize,
}

impl Default for SweepLimits {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_SWEEP_BATCH_SIZE,
            max_passes: DEFAULT_SWEEP_MAX_PASSES,
        }
    }
}

impl SweepLimits {
    /// Clamps zero values to one so a sweep always makes progress.
    pub fn normalized(self) -> Self {
        Self {
            batch_size: self.batch_size.max(1),
            max_passes: self.max_passes.max(1),
        }
    }
}

/// Durable storage for task records.
///
/// # Consistency
///
/// [`transition`](TaskStore::transition) is linearizable per record: of K
/// concurrent calls with the same `expected_version`, exactly one succeeds
/// and the rest fail with [`TaskError::ConcurrentModification`]. Once a
/// terminal `transition` returns, every subsequent `load` observes it.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Inserts a new `pending` record at version 0.
    ///
    /// # Errors
    ///
    /// - [`TaskError::AlreadyExists`] if the id is taken.
    /// - [`TaskError::StorageUnavailable`] on backend failure.
    async fn create(
        &self,
        task_id: &TaskId,
        payload: Option<Vec<u8>>,
    ) -> Result<TaskRecord, TaskError>;

    /// Point read with no side effects.
    ///
    /// # Errors
    ///
    /// - [`TaskError::NotFound`] for unknown or expired ids.
    /// - [`TaskError::CorruptRecord`] if the stored record is invalid.
    /// - [`TaskError::StorageUnavailable`] on backend failure.
    async fn load(&self, task_id: &TaskId) -> Result<TaskRecord, TaskError>;

    /// Applies `transition` if the stored version equals `expected_version`,
    /// returning the new version.
    ///
    /// # Errors
    ///
    /// - [`TaskError::NotFound`] if the record does not exist.
    /// - [`TaskError::InvalidTransition`] if the edge is illegal from the
    ///   stored status and could not have been legal at `expected_version`.
    /// - [`TaskError::ConcurrentModification`] on a version mismatch, or while
    ///   another writer holds the record.
    /// - [`TaskError::StorageUnavailable`] on backend failure.
    async fn transition(
        &self,
        task_id: &TaskId,
        expected_version: u64,
        transition: Transition,
    ) -> Result<u64, TaskError>;

    /// Removes a record. Deleting a missing record succeeds.
    ///
    /// # Errors
    ///
    /// [`TaskError::StorageUnavailable`] on backend failure.
    async fn delete(&self, task_id: &TaskId) -> Result<(), TaskError>;

    /// Removes terminal records whose `completed_at` is strictly before
    /// `older_than` and returns how many this call removed.
    ///
    /// Works in bounded batches; a call may return before every eligible
    /// record is gone once its pass limit is reached.
    ///
    /// # Errors
    ///
    /// [`TaskError::StorageUnavailable`] on backend failure.
    async fn delete_expired(&self, older_than: DateTime<Utc>) -> Result<usize, TaskError>;
}

/// Checks `transition` against `current` and builds the record to write.
///
/// A stale `expected_version` is a conflict when the edge was legal from a
/// status the record could have had at that version, so every loser of a
/// race sees [`TaskError::ConcurrentModification`]. An edge that is legal at
/// neither version is [`TaskError::InvalidTransition`].
pub(crate) fn successor(
    current: &TaskRecord,
    expected_version: u64,
    transition: &Transition,
) -> Result<TaskRecord, TaskError> {
    let target = transition.target();
    if current.version != expected_version {
        let raced = TaskStatus::at_version(expected_version)
            .iter()
            .any(|status| status.can_transition_to(&target));
        if raced || current.status.can_transition_to(&target) {
            return Err(TaskError::ConcurrentModification {
                task_id: current.task_id.clone(),
                expected_version,
                actual_version: Some(current.version),
            });
        }
    }
    current
        .status
        .validate_transition(&current.task_id, &target)?;
    current.apply(transition, now_millis())
}
