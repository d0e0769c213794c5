//! Durable task futures.
//!
//! Work is submitted out-of-band and tracked through a versioned
//! [`TaskRecord`] in a shared store. Callers hold a [`TaskFuture`] to poll,
//! wait on, cancel, or inspect the task; workers claim and finish it with
//! optimistic concurrency, so every record moves through exactly one path of
//! the state machine
//! (`pending` -> `running` -> `completed`/`failed`, or `pending` -> `cancelled`).
//!
//! # Module Organization
//!
//! - [`domain`] - Task ids, records, statuses, and the transition rules
//! - [`codec`] - Serializable failure records and the registry that rebuilds
//!   native errors from them
//! - [`store`] - The [`TaskStore`] contract with relational (SQLite) and
//!   key-value (in-memory, Redis) backends
//! - [`future`] - [`TaskFuture`] and its polling configuration
//! - [`dispatch`] / [`submission`] - Creating a record and handing the work off
//! - [`executor`] - Claiming and running work items
//! - [`sweep`] - Removing expired terminal records
//! - [`config`] - TOML and environment configuration
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use taskfuture::store::InMemoryTaskStore;
//! use taskfuture::{ErrorCodec, TaskFuture, TaskId, TaskStatus, TaskStore, Transition};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = Arc::new(InMemoryTaskStore::in_memory());
//! let task_id = TaskId::new();
//! store.create(&task_id, Some(b"ping".to_vec())).await.unwrap();
//!
//! let future = TaskFuture::new(task_id.clone(), store.clone(), Arc::new(ErrorCodec::new()));
//! assert_eq!(future.status().await.unwrap(), TaskStatus::Pending);
//!
//! let v = store.transition(&task_id, 0, Transition::Start).await.unwrap();
//! store
//!     .transition(&task_id, v, Transition::Complete { result: b"pong".to_vec() })
//!     .await
//!     .unwrap();
//!
//! assert_eq!(future.get(Some(Duration::from_secs(1))).await.unwrap(), b"pong");
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod constants;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod executor;
pub mod future;
pub mod store;
pub mod submission;
pub mod sweep;

// Re-exports for ergonomic access
pub use codec::{ErrorCodec, ErrorRecord, GenericFailure, TaskFailure};
pub use config::FutureConfig;
pub use domain::{TaskId, TaskRecord, TaskStatus, Transition};
pub use error::{BoxError, ConfigError, TaskError};
pub use executor::{ExecutionOutcome, Executor, TaskHandler, Worker};
pub use future::{PollConfig, TaskFuture};
pub use store::TaskStore;
pub use submission::SubmissionService;
pub use sweep::{ExpirationSweep, SweepReport};
