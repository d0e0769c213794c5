//! Hand-off of submitted work to whatever executes it.
//!
//! [`Dispatcher`] is the seam to the transport (a message queue in most
//! deployments). [`ChannelDispatcher`] is the in-process implementation: a
//! bounded [`tokio::sync::mpsc`] channel whose receiver feeds a
//! [`Worker`](crate::executor::Worker).

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::TaskId;

/// One unit of dispatched work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// The task the work belongs to.
    pub task_id: TaskId,
    /// Serialized work descriptor.
    pub payload: Option<Vec<u8>>,
}

/// Why a [`Dispatcher`] refused work.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// No consumer is listening any more.
    #[error("dispatch channel closed")]
    Closed,

    /// The transport rejected the item.
    #[error("dispatch rejected: {0}")]
    Rejected(String),
}

/// Delivers work items to executors.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Hands `item` to the transport.
    ///
    /// # Errors
    ///
    /// [`DispatchError`] if the item was not accepted.
    async fn dispatch(&self, item: WorkItem) -> Result<(), DispatchError>;
}

/// In-process [`Dispatcher`] over a bounded channel.
///
/// A full channel applies back-pressure: `dispatch` waits for room, bounded
/// by the submission latency budget.
///
/// # Examples
///
/// ```
/// use taskfuture::dispatch::{ChannelDispatcher, Dispatcher, WorkItem};
/// use taskfuture::TaskId;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let (dispatcher, mut rx) = ChannelDispatcher::new(8);
/// let item = WorkItem { task_id: TaskId::new(), payload: None };
/// dispatcher.dispatch(item.clone()).await.unwrap();
/// assert_eq!(rx.recv().await, Some(item));
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::Sender<WorkItem>,
}

impl ChannelDispatcher {
    /// Creates a dispatcher and the receiver its items arrive on.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<WorkItem>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Dispatcher for ChannelDispatcher {
    async fn dispatch(&self, item: WorkItem) -> Result<(), DispatchError> {
        self.tx.send(item).await.map_err(|_| DispatchError::Closed)
    }
}
