//! Submission service: records a task, dispatches it, and returns its future.
//!
//! The record is always created **before** dispatch, so a worker can never
//! receive work whose record does not exist yet. If dispatch fails the record
//! is rolled to `cancelled` so the sweep can collect it. A create that may
//! have committed (it timed out, or the backend failed mid-call) is rolled
//! back the same way before the error is returned.
//!
//! If the rollback itself fails the record stays `pending`. Key-value
//! backends collect it through their record TTL; the relational backend keeps
//! the row until it is cancelled or deleted by hand.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::codec::ErrorCodec;
use crate::constants::{DEFAULT_SUBMIT_BUDGET_MS, INITIAL_VERSION};
use crate::dispatch::{Dispatcher, WorkItem};
use crate::domain::{TaskId, Transition};
use crate::error::TaskError;
use crate::future::{PollConfig, TaskFuture};
use crate::store::TaskStore;

/// Entry point for submitting work.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use taskfuture::dispatch::ChannelDispatcher;
/// use taskfuture::store::InMemoryTaskStore;
/// use taskfuture::{ErrorCodec, SubmissionService, TaskStatus};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let (dispatcher, mut rx) = ChannelDispatcher::new(16);
/// let service = SubmissionService::new(
///     Arc::new(InMemoryTaskStore::in_memory()),
///     Arc::new(dispatcher),
///     Arc::new(ErrorCodec::new()),
/// );
///
/// let future = service.submit(b"ping".to_vec()).await.unwrap();
/// assert_eq!(future.status().await.unwrap(), TaskStatus::Pending);
/// assert_eq!(rx.recv().await.unwrap().task_id, *future.task_id());
/// # }
/// ```
#[derive(Clone)]
pub struct SubmissionService {
    store: Arc<dyn TaskStore>,
    dispatcher: Arc<dyn Dispatcher>,
    codec: Arc<ErrorCodec>,
    poll: PollConfig,
    latency_budget: Duration,
}

impl std::fmt::Debug for SubmissionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionService")
            .field("poll", &self.poll)
            .field("latency_budget", &self.latency_budget)
            .finish_non_exhaustive()
    }
}

impl SubmissionService {
    /// Creates a service with default polling and a 50 ms latency budget.
    pub fn new(
        store: Arc<dyn TaskStore>,
        dispatcher: Arc<dyn Dispatcher>,
        codec: Arc<ErrorCodec>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            codec,
            poll: PollConfig::default(),
            latency_budget: Duration::from_millis(DEFAULT_SUBMIT_BUDGET_MS),
        }
    }

    /// Sets the polling behaviour handed to every future (builder pattern).
    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Sets the time allowed for each of the create and dispatch steps.
    pub fn with_latency_budget(mut self, latency_budget: Duration) -> Self {
        self.latency_budget = latency_budget;
        self
    }

    /// Records and dispatches `payload` under a fresh id.
    ///
    /// # Errors
    ///
    /// - [`TaskError::StorageUnavailable`] if the record could not be created
    ///   within the budget; nothing was dispatched, and a record that did get
    ///   written is cancelled.
    /// - [`TaskError::DispatchFailed`] if dispatch failed; `rolled_back` says
    ///   whether the record was cancelled or left `pending`.
    pub async fn submit(&self, payload: Vec<u8>) -> Result<TaskFuture, TaskError> {
        let task_id = TaskId::new();
        let budget = self.latency_budget;

        match tokio::time::timeout(budget, self.store.create(&task_id, Some(payload.clone())))
            .await
        {
            Ok(Ok(_)) => {},
            Ok(Err(e @ TaskError::StorageUnavailable { .. })) => {
                self.roll_back(&task_id, "create failed").await;
                return Err(e);
            },
            Ok(Err(e)) => {
                return Err(TaskError::StorageUnavailable {
                    message: format!("failed to create task {task_id}: {e}"),
                    source: Some(Box::new(e)),
                });
            },
            Err(elapsed) => {
                self.roll_back(&task_id, "create exceeded budget").await;
                return Err(TaskError::StorageUnavailable {
                    message: format!("creating task {task_id} exceeded {budget:?}"),
                    source: Some(Box::new(elapsed)),
                });
            },
        }

        let item = WorkItem {
            task_id: task_id.clone(),
            payload: Some(payload),
        };
        let dispatched = match tokio::time::timeout(budget, self.dispatcher.dispatch(item)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("dispatch exceeded {budget:?}")),
        };

        if let Err(message) = dispatched {
            let rolled_back = self.roll_back(&task_id, "dispatch failed").await;
            return Err(TaskError::DispatchFailed {
                task_id,
                message,
                rolled_back,
            });
        }

        info!(task_id = %task_id, "submitted task");
        Ok(self.future(task_id))
    }

    /// Serializes `value` as JSON and submits it.
    ///
    /// # Errors
    ///
    /// [`TaskError::Serialization`], or any error of [`submit`](Self::submit).
    pub async fn submit_json<T: Serialize + ?Sized>(
        &self,
        value: &T,
    ) -> Result<TaskFuture, TaskError> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| TaskError::Serialization(format!("failed to encode payload: {e}")))?;
        self.submit(payload).await
    }

    /// A future for an existing task, e.g. one submitted by another process.
    pub fn future(&self, task_id: TaskId) -> TaskFuture {
        TaskFuture::new(task_id, self.store.clone(), self.codec.clone())
            .with_poll_config(self.poll.clone())
    }

    /// Best-effort move of a possibly-committed `pending` record to
    /// `cancelled`. Returns whether the record is now cancelled.
    async fn roll_back(&self, task_id: &TaskId, reason: &'static str) -> bool {
        let rollback = tokio::time::timeout(
            self.latency_budget,
            self.store
                .transition(task_id, INITIAL_VERSION, Transition::Cancel),
        )
        .await;
        match rollback {
            Ok(Ok(_)) => {
                warn!(task_id = %task_id, reason, "submission failed; task cancelled");
                true
            },
            Ok(Err(TaskError::NotFound { .. })) => {
                debug!(task_id = %task_id, reason, "submission failed; no record to roll back");
                false
            },
            Ok(Err(e)) => {
                warn!(
                    task_id = %task_id,
                    reason,
                    error = %e,
                    "submission failed and rollback failed; pending record left behind"
                );
                false
            },
            Err(_) => {
                warn!(
                    task_id = %task_id,
                    reason,
                    "submission failed and rollback exceeded budget; pending record left behind"
                );
                false
            },
        }
    }
}
