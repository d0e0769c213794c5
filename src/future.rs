//! Caller-side handle to a submitted task.
//!
//! A [`TaskFuture`] is bound to one [`TaskId`] and reads the store on demand;
//! it holds no task state of its own beyond an optional status memo. Any
//! number of futures (in any number of processes) may observe the same task.
//!
//! Waiting is a poll loop with capped exponential backoff ([`PollConfig`]).
//! Each sleep is capped at the time left before the deadline, so
//! [`TaskFuture::get`] never times out early and reports a timeout at most
//! one poll interval late.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::codec::{ErrorCodec, ErrorRecord};
use crate::constants::DEFAULT_POLL_INTERVAL_MS;
use crate::domain::{TaskId, TaskRecord, TaskStatus, Transition};
use crate::error::TaskError;
use crate::store::TaskStore;

/// Polling behaviour for [`TaskFuture::get`].
///
/// The first sleep lasts `interval`; each following one is multiplied by
/// `multiplier` and capped at `max_interval`, which is therefore the
/// worst-case delay between a task finishing and a waiter noticing.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use taskfuture::PollConfig;
///
/// let poll = PollConfig::default();
/// assert_eq!(poll.interval, Duration::from_millis(100));
///
/// let backoff = PollConfig::backoff(Duration::from_millis(10), Duration::from_millis(80));
/// assert_eq!(backoff.next_interval(Duration::from_millis(10)), Duration::from_millis(20));
/// assert_eq!(backoff.next_interval(Duration::from_millis(60)), Duration::from_millis(80));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    /// First sleep between polls.
    pub interval: Duration,
    /// Upper bound on any sleep between polls.
    pub max_interval: Duration,
    /// Growth factor applied after each poll.
    pub multiplier: f64,
    /// How long `is_done()` and friends may reuse the last observed status.
    /// Zero always reads fresh.
    pub snapshot_ttl: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        let interval = Duration::from_millis(DEFAULT_POLL_INTERVAL_MS);
        Self {
            interval,
            max_interval: interval,
            multiplier: 2.0,
            snapshot_ttl: Duration::ZERO,
        }
    }
}

impl PollConfig {
    /// Constant-interval polling.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            max_interval: interval,
            ..Self::default()
        }
    }

    /// Doubling backoff from `interval` up to `max_interval`.
    pub fn backoff(interval: Duration, max_interval: Duration) -> Self {
        Self {
            interval,
            max_interval,
            ..Self::default()
        }
    }

    /// Sets the status memo lifetime (builder pattern).
    pub fn with_snapshot_ttl(mut self, snapshot_ttl: Duration) -> Self {
        self.snapshot_ttl = snapshot_ttl;
        self
    }

    /// The sleep to use after one of length `current`.
    pub fn next_interval(&self, current: Duration) -> Duration {
        let ceiling = self.max_interval.max(self.interval);
        if !self.multiplier.is_finite() || self.multiplier <= 1.0 {
            return current.min(ceiling);
        }
        let grown = current.as_nanos() as f64 * self.multiplier;
        if grown >= ceiling.as_nanos() as f64 {
            ceiling
        } else {
            Duration::from_nanos(grown as u64)
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Memo {
    observed_at: Instant,
    status: TaskStatus,
}

/// Handle for polling, waiting on, cancelling, or inspecting one task.
///
/// Cloning is cheap; clones share the store, codec, and status memo.
#[derive(Clone)]
pub struct TaskFuture {
    task_id: TaskId,
    store: Arc<dyn TaskStore>,
    codec: Arc<ErrorCodec>,
    poll: PollConfig,
    memo: Arc<Mutex<Option<Memo>>>,
}

impl std::fmt::Debug for TaskFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFuture")
            .field("task_id", &self.task_id)
            .field("poll", &self.poll)
            .finish_non_exhaustive()
    }
}

impl TaskFuture {
    /// Binds a future to `task_id`.
    pub fn new(task_id: TaskId, store: Arc<dyn TaskStore>, codec: Arc<ErrorCodec>) -> Self {
        Self {
            task_id,
            store,
            codec,
            poll: PollConfig::default(),
            memo: Arc::new(Mutex::new(None)),
        }
    }

    /// Sets the polling behaviour (builder pattern).
    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// The task this future observes.
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// The polling behaviour.
    pub fn poll_config(&self) -> &PollConfig {
        &self.poll
    }

    /// Reads the current status from the store.
    ///
    /// # Errors
    ///
    /// Store errors, including [`TaskError::NotFound`] for unknown or
    /// expired tasks.
    pub async fn status(&self) -> Result<TaskStatus, TaskError> {
        Ok(self.snapshot().await?.status)
    }

    /// Reads the full record from the store.
    ///
    /// # Errors
    ///
    /// Store errors, including [`TaskError::NotFound`].
    pub async fn snapshot(&self) -> Result<TaskRecord, TaskError> {
        let record = self.store.load(&self.task_id).await?;
        self.remember(record.status);
        Ok(record)
    }

    /// Returns `true` once the task reached any terminal state.
    ///
    /// # Errors
    ///
    /// Store errors.
    pub async fn is_done(&self) -> Result<bool, TaskError> {
        Ok(self.observed_status().await?.is_terminal())
    }

    /// Returns `true` if the task completed successfully.
    ///
    /// # Errors
    ///
    /// Store errors.
    pub async fn is_success(&self) -> Result<bool, TaskError> {
        Ok(self.observed_status().await? == TaskStatus::Completed)
    }

    /// Returns `true` if the task failed.
    ///
    /// # Errors
    ///
    /// Store errors.
    pub async fn is_failed(&self) -> Result<bool, TaskError> {
        Ok(self.observed_status().await? == TaskStatus::Failed)
    }

    /// Returns `true` if the task was cancelled.
    ///
    /// # Errors
    ///
    /// Store errors.
    pub async fn is_cancelled(&self) -> Result<bool, TaskError> {
        Ok(self.observed_status().await? == TaskStatus::Cancelled)
    }

    /// One read; returns the result if the task completed.
    ///
    /// # Errors
    ///
    /// - [`TaskError::Failed`] carrying the stored record and the decoded error.
    /// - [`TaskError::TaskCancelled`] if the task was cancelled.
    /// - [`TaskError::NotReady`] if the task has not finished.
    /// - Store errors.
    pub async fn get_non_blocking(&self) -> Result<Vec<u8>, TaskError> {
        let record = self.snapshot().await?;
        self.outcome(record)
    }

    /// Waits for the task to finish and returns its result. `None` waits
    /// indefinitely.
    ///
    /// # Errors
    ///
    /// - [`TaskError::Timeout`] once `timeout` has elapsed.
    /// - [`TaskError::Failed`] / [`TaskError::TaskCancelled`] for task outcomes.
    /// - Store errors, which end the wait immediately.
    pub async fn get(&self, timeout: Option<Duration>) -> Result<Vec<u8>, TaskError> {
        self.get_with_cancel(timeout, &CancellationToken::new()).await
    }

    /// Like [`get`](Self::get), but the caller can abandon the wait through
    /// `cancel`. Abandoning the wait leaves the task untouched.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get), plus [`TaskError::WaitCancelled`].
    pub async fn get_with_cancel(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, TaskError> {
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);
        let mut interval = self.poll.interval;

        loop {
            let record = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(self.wait_cancelled()),
                loaded = self.store.load(&self.task_id) => loaded?,
            };
            self.remember(record.status);
            if record.is_terminal() {
                return self.outcome(record);
            }

            let sleep_for = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        debug!(task_id = %self.task_id, "wait timed out");
                        return Err(TaskError::Timeout {
                            task_id: self.task_id.clone(),
                            waited: now - started,
                        });
                    }
                    interval.min(deadline - now)
                },
                None => interval,
            };

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(self.wait_cancelled()),
                () = tokio::time::sleep(sleep_for) => {},
            }
            interval = self.poll.next_interval(interval);
        }
    }

    /// [`get`](Self::get), then decodes the result as JSON.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get), plus [`TaskError::Serialization`].
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        timeout: Option<Duration>,
    ) -> Result<T, TaskError> {
        let bytes = self.get(timeout).await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            TaskError::Serialization(format!(
                "failed to decode result of task {}: {e}",
                self.task_id
            ))
        })
    }

    /// Cancels the task if it has not been claimed yet.
    ///
    /// Returns `false` when the task is past `pending` or another writer won
    /// the race.
    ///
    /// # Errors
    ///
    /// Store errors other than the lost race.
    pub async fn cancel(&self) -> Result<bool, TaskError> {
        let record = self.snapshot().await?;
        if record.status != TaskStatus::Pending {
            return Ok(false);
        }
        match self
            .store
            .transition(&self.task_id, record.version, Transition::Cancel)
            .await
        {
            Ok(_) => {
                self.remember(TaskStatus::Cancelled);
                info!(task_id = %self.task_id, "cancelled task");
                Ok(true)
            },
            Err(TaskError::ConcurrentModification { .. } | TaskError::InvalidTransition { .. }) => {
                debug!(task_id = %self.task_id, "cancel lost the race");
                Ok(false)
            },
            Err(e) => Err(e),
        }
    }

    /// The stored failure, if the task failed.
    ///
    /// # Errors
    ///
    /// Store errors only; a failed task is reported as `Ok(Some(_))`.
    pub async fn get_exception(&self) -> Result<Option<ErrorRecord>, TaskError> {
        let record = self.snapshot().await?;
        Ok(match record.status {
            TaskStatus::Failed => record.error,
            _ => None,
        })
    }

    fn remember(&self, status: TaskStatus) {
        *self.memo.lock() = Some(Memo {
            observed_at: Instant::now(),
            status,
        });
    }

    /// Status for the `is_*` queries: a terminal memo is final, a recent one
    /// is reused within `snapshot_ttl`, anything else is read fresh.
    async fn observed_status(&self) -> Result<TaskStatus, TaskError> {
        let memo = *self.memo.lock();
        if let Some(memo) = memo {
            if memo.status.is_terminal()
                || (!self.poll.snapshot_ttl.is_zero()
                    && memo.observed_at.elapsed() < self.poll.snapshot_ttl)
            {
                return Ok(memo.status);
            }
        }
        self.status().await
    }

    fn outcome(&self, record: TaskRecord) -> Result<Vec<u8>, TaskError> {
        let corrupt = |reason: &str| TaskError::CorruptRecord {
            task_id: self.task_id.clone(),
            reason: reason.to_string(),
        };
        match record.status {
            TaskStatus::Completed => record
                .result
                .ok_or_else(|| corrupt("completed record has no result")),
            TaskStatus::Failed => {
                let failure = record
                    .error
                    .ok_or_else(|| corrupt("failed record has no error"))?;
                let source = self.codec.decode(&failure);
                Err(TaskError::Failed {
                    task_id: self.task_id.clone(),
                    failure,
                    source,
                })
            },
            TaskStatus::Cancelled => Err(TaskError::TaskCancelled {
                task_id: self.task_id.clone(),
            }),
            status @ (TaskStatus::Pending | TaskStatus::Running) => Err(TaskError::NotReady {
                task_id: self.task_id.clone(),
                status,
            }),
        }
    }

    fn wait_cancelled(&self) -> TaskError {
        TaskError::WaitCancelled {
            task_id: self.task_id.clone(),
        }
    }
}
