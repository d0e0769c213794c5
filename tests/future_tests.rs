//! Integration tests for `TaskFuture`.
//!
//! A background "worker" drives records through the store while the
//! future polls, waits, cancels, and decodes failures. Timing-sensitive
//! waits run with tokio's paused clock.

use std::sync::Arc;
use std::time::Duration;

use taskfuture::codec::{ErrorCodec, ErrorRecord, GenericFailure, TaskFailure};
use taskfuture::store::InMemoryTaskStore;
use taskfuture::{PollConfig, TaskError, TaskFuture, TaskId, TaskStatus, TaskStore, Transition};

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct UpstreamTimeout(String);

impl TaskFailure for UpstreamTimeout {
    const KIND: &'static str = "Timeout";

    fn code(&self) -> i64 {
        504
    }

    fn from_record(record: &ErrorRecord) -> Self {
        Self(record.message.clone())
    }
}

fn codec() -> Arc<ErrorCodec> {
    let mut codec = ErrorCodec::new();
    codec.register::<UpstreamTimeout>();
    Arc::new(codec)
}

/// Creates a pending task and a fast-polling future for it.
async fn setup() -> (Arc<InMemoryTaskStore>, TaskFuture) {
    let store = Arc::new(InMemoryTaskStore::in_memory());
    let id = TaskId::new();
    store.create(&id, Some(b"ping".to_vec())).await.unwrap();
    let future = TaskFuture::new(id, store.clone(), codec())
        .with_poll_config(PollConfig::fixed(Duration::from_millis(10)));
    (store, future)
}

async fn start(store: &InMemoryTaskStore, id: &TaskId) -> u64 {
    store.transition(id, 0, Transition::Start).await.unwrap()
}

mod waiting {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn ping_pong() {
        let (store, future) = setup().await;
        let id = future.task_id().clone();

        let worker = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let record = store.load(&id).await.unwrap();
            assert_eq!(record.payload.as_deref(), Some(&b"ping"[..]));
            let v = store.transition(&id, 0, Transition::Start).await.unwrap();
            store
                .transition(
                    &id,
                    v,
                    Transition::Complete {
                        result: b"pong".to_vec(),
                    },
                )
                .await
                .unwrap();
        });

        let result = future.get(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(result, b"pong".to_vec());
        worker.await.unwrap();
        assert!(future.is_done().await.unwrap());
        assert!(future.is_success().await.unwrap());
    }

    #[tokio::test]
    async fn get_json_decodes_result() {
        let (store, future) = setup().await;
        let id = future.task_id().clone();
        let v = start(&store, &id).await;
        store
            .transition(
                &id,
                v,
                Transition::Complete {
                    result: serde_json::to_vec(&serde_json::json!({ "answer": 42 })).unwrap(),
                },
            )
            .await
            .unwrap();

        let value: serde_json::Value = future.get_json(None).await.unwrap();
        assert_eq!(value["answer"], 42);

        let err = future.get_json::<Vec<String>>(None).await.unwrap_err();
        assert!(matches!(err, TaskError::Serialization(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_bounded_by_deadline() {
        let (_store, future) = setup().await;
        let future = future.with_poll_config(PollConfig::fixed(Duration::from_millis(300)));

        let started = tokio::time::Instant::now();
        let err = future.get(Some(Duration::from_secs(1))).await.unwrap_err();
        let elapsed = started.elapsed();

        match err {
            TaskError::Timeout { waited, .. } => {
                assert!(waited >= Duration::from_secs(1));
                assert!(waited < Duration::from_millis(1_300));
            },
            other => panic!("expected Timeout, got: {other}"),
        }
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_millis(1_300));
        assert!(err_is_wait_failure_only(future.get(Some(Duration::ZERO)).await));
    }

    fn err_is_wait_failure_only(result: Result<Vec<u8>, TaskError>) -> bool {
        matches!(result, Err(ref e) if e.is_wait_failure() && !e.is_task_failure())
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_wait_sees_late_completion() {
        let (store, future) = setup().await;
        let future = future.with_poll_config(PollConfig::backoff(
            Duration::from_millis(10),
            Duration::from_millis(200),
        ));
        let id = future.task_id().clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let v = store.transition(&id, 0, Transition::Start).await.unwrap();
            store
                .transition(&id, v, Transition::Complete { result: vec![7] })
                .await
                .unwrap();
        });

        assert_eq!(future.get(None).await.unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn caller_cancelled_wait_leaves_task_alone() {
        let (_store, future) = setup().await;
        let token = tokio_util::sync::CancellationToken::new();

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                token.cancel();
            })
        };

        let err = future
            .get_with_cancel(Some(Duration::from_secs(5)), &token)
            .await
            .unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, TaskError::WaitCancelled { .. }));
        assert_eq!(future.status().await.unwrap(), TaskStatus::Pending);
    }

    #[tokio::test]
    async fn unknown_task_ends_wait_immediately() {
        let store = Arc::new(InMemoryTaskStore::in_memory());
        let future = TaskFuture::new(TaskId::new(), store, codec());
        let err = future.get(Some(Duration::from_secs(5))).await.unwrap_err();
        assert!(matches!(err, TaskError::NotFound { .. }));
    }
}

mod outcomes {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn registered_failure_is_rebuilt_natively() {
        let (store, future) = setup().await;
        let id = future.task_id().clone();
        let v = start(&store, &id).await;
        let error = codec().encode(&UpstreamTimeout("upstream timeout".into()));
        store
            .transition(&id, v, Transition::Fail { error })
            .await
            .unwrap();

        let err = future.get(None).await.unwrap_err();
        assert!(err.is_task_failure());
        let failure = err.failure().unwrap();
        assert_eq!(failure.kind, "Timeout");
        assert_eq!(failure.code, 504);
        assert_eq!(failure.message, "upstream timeout");

        let source = std::error::Error::source(&err).unwrap();
        let native = source.downcast_ref::<UpstreamTimeout>().unwrap();
        assert_eq!(native.0, "upstream timeout");

        assert!(future.is_failed().await.unwrap());
        assert_eq!(future.get_exception().await.unwrap(), Some(failure.clone()));
    }

    #[tokio::test]
    async fn unregistered_failure_is_generic() {
        let (store, future) = setup().await;
        let id = future.task_id().clone();
        let v = start(&store, &id).await;
        store
            .transition(
                &id,
                v,
                Transition::Fail {
                    error: ErrorRecord::new("QuotaExceeded", "quota exceeded", 429),
                },
            )
            .await
            .unwrap();

        let err = future.get_non_blocking().await.unwrap_err();
        let source = std::error::Error::source(&err).unwrap();
        let generic = source.downcast_ref::<GenericFailure>().unwrap();
        assert_eq!(generic.kind(), "QuotaExceeded");
        assert_eq!(generic.code(), 429);
    }

    #[tokio::test]
    async fn non_blocking_reports_not_ready() {
        let (store, future) = setup().await;
        assert!(matches!(
            future.get_non_blocking().await,
            Err(TaskError::NotReady {
                status: TaskStatus::Pending,
                ..
            })
        ));
        start(&store, future.task_id()).await;
        assert!(matches!(
            future.get_non_blocking().await,
            Err(TaskError::NotReady {
                status: TaskStatus::Running,
                ..
            })
        ));
        assert_eq!(future.get_exception().await.unwrap(), None);
        assert!(!future.is_done().await.unwrap());
    }
}

mod cancellation {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn pending_task_is_cancelled() {
        let (store, future) = setup().await;
        assert!(future.cancel().await.unwrap());
        assert!(future.is_cancelled().await.unwrap());
        assert!(matches!(
            future.get(None).await,
            Err(TaskError::TaskCancelled { .. })
        ));

        let record = store.load(future.task_id()).await.unwrap();
        assert_eq!(record.status, TaskStatus::Cancelled);
        assert_eq!(record.payload, None);

        // A second cancel is a no-op.
        assert!(!future.cancel().await.unwrap());
    }

    #[tokio::test]
    async fn running_task_cannot_be_cancelled() {
        let (store, future) = setup().await;
        start(&store, future.task_id()).await;
        assert!(!future.cancel().await.unwrap());
        assert_eq!(future.status().await.unwrap(), TaskStatus::Running);
    }

    #[tokio::test]
    async fn worker_loses_claim_after_cancel() {
        let (store, future) = setup().await;
        future.cancel().await.unwrap();
        assert!(matches!(
            store.transition(future.task_id(), 0, Transition::Start).await,
            Err(TaskError::ConcurrentModification { .. })
        ));
    }
}

mod memo {
    use super::*;

    #[tokio::test]
    async fn terminal_memo_is_final() {
        let (store, future) = setup().await;
        future.cancel().await.unwrap();
        store.delete(future.task_id()).await.unwrap();

        // Served from the memo; the record itself is gone.
        assert!(future.is_done().await.unwrap());
        assert!(future.is_cancelled().await.unwrap());
        assert!(matches!(
            future.status().await,
            Err(TaskError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn zero_ttl_reads_fresh() {
        let (store, future) = setup().await;
        assert!(!future.is_done().await.unwrap());
        let v = start(&store, future.task_id()).await;
        store
            .transition(future.task_id(), v, Transition::Complete { result: vec![] })
            .await
            .unwrap();
        assert!(future.is_done().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn live_memo_is_reused_within_ttl() {
        let (store, future) = setup().await;
        let future = future.with_poll_config(
            PollConfig::fixed(Duration::from_millis(10)).with_snapshot_ttl(Duration::from_secs(1)),
        );

        assert!(!future.is_done().await.unwrap());
        let v = start(&store, future.task_id()).await;
        store
            .transition(future.task_id(), v, Transition::Complete { result: vec![] })
            .await
            .unwrap();

        // Still within the memo lifetime.
        assert!(!future.is_done().await.unwrap());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(future.is_done().await.unwrap());
    }
}
