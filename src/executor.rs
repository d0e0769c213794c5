//! Worker side: claim a task, run its handler, record the outcome.
//!
//! [`Executor::execute`] drives one [`WorkItem`] through
//! `pending -> running -> completed | failed`. Losing the claim (the task was
//! cancelled, already claimed, or is gone) abandons the item without running
//! it; nothing is retried.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{ErrorCodec, ErrorRecord};
use crate::constants::{INITIAL_VERSION, PANIC_FAILURE_KIND};
use crate::dispatch::WorkItem;
use crate::domain::{TaskId, Transition};
use crate::error::{BoxError, TaskError};
use crate::store::TaskStore;

/// Application code that performs a task.
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use taskfuture::executor::TaskHandler;
/// use taskfuture::{BoxError, TaskId};
///
/// struct Echo;
///
/// #[async_trait]
/// impl TaskHandler for Echo {
///     async fn handle(
///         &self,
///         _id: &TaskId,
///         payload: Option<Vec<u8>>,
///     ) -> Result<Vec<u8>, BoxError> {
///         Ok(payload.unwrap_or_default())
///     }
/// }
/// ```
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Runs the task and returns its serialized result.
    ///
    /// # Errors
    ///
    /// Any error; it is encoded with the executor's [`ErrorCodec`] and stored
    /// as the task's failure.
    async fn handle(&self, task_id: &TaskId, payload: Option<Vec<u8>>) -> Result<Vec<u8>, BoxError>;
}

/// What happened to one work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The handler succeeded and the result was stored.
    Completed {
        /// Final record version.
        version: u64,
    },
    /// The handler failed (or panicked) and the failure was stored.
    Failed {
        /// Final record version.
        version: u64,
        /// Stored failure kind.
        kind: String,
    },
    /// The item was dropped because another writer owns the record.
    Abandoned {
        /// Why the item was dropped.
        reason: String,
    },
}

/// Runs work items against a store.
#[derive(Clone)]
pub struct Executor {
    store: Arc<dyn TaskStore>,
    codec: Arc<ErrorCodec>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Creates an executor.
    pub fn new(store: Arc<dyn TaskStore>, codec: Arc<ErrorCodec>) -> Self {
        Self { store, codec }
    }

    /// Claims, runs, and finishes `item`.
    ///
    /// # Errors
    ///
    /// Store failures other than a lost claim. The handler's own errors are
    /// recorded on the task, not returned here.
    pub async fn execute(
        &self,
        item: WorkItem,
        handler: &dyn TaskHandler,
    ) -> Result<ExecutionOutcome, TaskError> {
        let task_id = item.task_id;

        let claimed = match self
            .store
            .transition(&task_id, INITIAL_VERSION, Transition::Start)
            .await
        {
            Ok(version) => version,
            Err(e) if loses_ownership(&e) => return Ok(abandon(&task_id, &e)),
            Err(e) => return Err(e),
        };
        info!(task_id = %task_id, "claimed task");

        let run = AssertUnwindSafe(handler.handle(&task_id, item.payload))
            .catch_unwind()
            .await;
        let transition = match run {
            Ok(Ok(result)) => Transition::Complete { result },
            Ok(Err(err)) => Transition::Fail {
                error: self.codec.encode(&*err),
            },
            Err(panic) => Transition::Fail {
                error: ErrorRecord::new(PANIC_FAILURE_KIND, panic_message(panic.as_ref()), 0),
            },
        };
        let failed_kind = match &transition {
            Transition::Fail { error } => Some(error.kind.clone()),
            _ => None,
        };

        match self.store.transition(&task_id, claimed, transition).await {
            Ok(version) => Ok(match failed_kind {
                None => {
                    info!(task_id = %task_id, version, "task completed");
                    ExecutionOutcome::Completed { version }
                },
                Some(kind) => {
                    info!(task_id = %task_id, version, kind = %kind, "task failed");
                    ExecutionOutcome::Failed { version, kind }
                },
            }),
            Err(e) if loses_ownership(&e) => Ok(abandon(&task_id, &e)),
            Err(e) => Err(e),
        }
    }
}

fn loses_ownership(err: &TaskError) -> bool {
    matches!(
        err,
        TaskError::ConcurrentModification { .. }
            | TaskError::InvalidTransition { .. }
            | TaskError::NotFound { .. }
    )
}

fn abandon(task_id: &TaskId, err: &TaskError) -> ExecutionOutcome {
    warn!(task_id = %task_id, error = %err, "abandoning work item");
    ExecutionOutcome::Abandoned {
        reason: err.to_string(),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "task handler panicked".to_string()
    }
}

/// Consumes dispatched work and executes it with bounded concurrency.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use async_trait::async_trait;
/// use tokio_util::sync::CancellationToken;
/// use taskfuture::dispatch::ChannelDispatcher;
/// use taskfuture::executor::{Executor, TaskHandler, Worker};
/// use taskfuture::store::InMemoryTaskStore;
/// use taskfuture::{BoxError, ErrorCodec, SubmissionService, TaskId};
///
/// struct Echo;
///
/// #[async_trait]
/// impl TaskHandler for Echo {
///     async fn handle(
///         &self,
///         _id: &TaskId,
///         payload: Option<Vec<u8>>,
///     ) -> Result<Vec<u8>, BoxError> {
///         Ok(payload.unwrap_or_default())
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = Arc::new(InMemoryTaskStore::in_memory());
/// let codec = Arc::new(ErrorCodec::new());
/// let (dispatcher, rx) = ChannelDispatcher::new(16);
/// let service = SubmissionService::new(store.clone(), Arc::new(dispatcher), codec.clone());
///
/// let worker = Worker::new(Arc::new(Executor::new(store, codec)), Arc::new(Echo), 4);
/// let shutdown = CancellationToken::new();
/// let running = tokio::spawn(worker.run(rx, shutdown.clone()));
///
/// let future = service.submit(b"ping".to_vec()).await.unwrap();
/// assert_eq!(future.get(None).await.unwrap(), b"ping");
///
/// shutdown.cancel();
/// assert_eq!(running.await.unwrap(), 1);
/// # }
/// ```
pub struct Worker {
    executor: Arc<Executor>,
    handler: Arc<dyn TaskHandler>,
    max_concurrency: usize,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("max_concurrency", &self.max_concurrency)
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Creates a worker running at most `max_concurrency` items at once.
    pub fn new(
        executor: Arc<Executor>,
        handler: Arc<dyn TaskHandler>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            executor,
            handler,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Runs until the channel closes or `shutdown` fires, then waits for
    /// in-flight items. Returns how many items were started.
    ///
    /// Items still queued at shutdown are left `pending`.
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<WorkItem>,
        shutdown: CancellationToken,
    ) -> usize {
        let permits = u32::try_from(self.max_concurrency).unwrap_or(u32::MAX);
        let semaphore = Arc::new(Semaphore::new(permits as usize));
        let mut started = 0;

        loop {
            let item = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            let permit = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let executor = self.executor.clone();
            let handler = self.handler.clone();
            started += 1;
            tokio::spawn(async move {
                let _permit = permit;
                let task_id = item.task_id.clone();
                match executor.execute(item, handler.as_ref()).await {
                    Ok(outcome) => debug!(task_id = %task_id, ?outcome, "work item finished"),
                    Err(e) => warn!(task_id = %task_id, error = %e, "work item failed in storage"),
                }
            });
        }

        // Every permit back means every spawned item has finished.
        let _drained = semaphore.acquire_many(permits).await;
        debug!(started, "worker stopped");
        started
    }
}
