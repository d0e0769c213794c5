//! Key-value task store.
//!
//! [`KvTaskStore`] implements [`TaskStore`] on top of any [`KvBackend`]. All
//! domain logic lives here: record layout, state machine checks, versioning,
//! retention, and the expiry sweep. Backends only move bytes.
//!
//! # Key Layout
//!
//! | Key Pattern | Purpose |
//! |-------------|---------|
//! | `{prefix}:task:{task_id}:{field}` | One key per record field |
//! | `{prefix}:idx:completed` | Terminal records scored by `completed_at` (ms) |
//! | `{prefix}:lock:{task_id}` | Advisory lock for backends without native CAS |
//!
//! Fields are `status`, `payload`, `result`, `error`, `submitted_at`,
//! `started_at`, `completed_at`, and `version`. Absent optional fields are
//! absent keys. Every write rewrites the full field set with the retention
//! expiry, so all fields of a record expire together.
//!
//! # Concurrency
//!
//! When the backend supports native compare-and-swap, `create` and
//! `transition` are a single [`KvBackend::apply_if_version`] call. Otherwise
//! each mutation takes the record's advisory lock (set-if-absent with
//! `lock_ttl`), re-reads, validates, writes, and releases the lock by token.
//! A held lock is reported as [`TaskError::ConcurrentModification`] with no
//! actual version.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::ErrorRecord;
use crate::constants::{DEFAULT_KEY_PREFIX, DEFAULT_LOCK_TTL_MS, DEFAULT_RETENTION_SECS};
use crate::domain::{now_millis, TaskId, TaskRecord, TaskStatus, Transition};
use crate::error::TaskError;
use crate::store::backend::{CasOutcome, KvBackend, KvOp, StorageError};
use crate::store::memory::InMemoryBackend;
use crate::store::{successor, SweepLimits, TaskStore};

const STATUS: &str = "status";
const PAYLOAD: &str = "payload";
const RESULT: &str = "result";
const ERROR: &str = "error";
const SUBMITTED_AT: &str = "submitted_at";
const STARTED_AT: &str = "started_at";
const COMPLETED_AT: &str = "completed_at";
const VERSION: &str = "version";

const FIELDS: [&str; 8] = [
    STATUS,
    PAYLOAD,
    RESULT,
    ERROR,
    SUBMITTED_AT,
    STARTED_AT,
    COMPLETED_AT,
    VERSION,
];

/// Key-value store over the in-process backend.
pub type InMemoryTaskStore = KvTaskStore<InMemoryBackend>;

/// [`TaskStore`] over a [`KvBackend`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use taskfuture::store::{InMemoryTaskStore, TaskStore};
/// use taskfuture::{TaskId, TaskStatus};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = InMemoryTaskStore::in_memory().with_retention(Duration::from_secs(60));
/// let id = TaskId::new();
/// let record = store.create(&id, Some(b"ping".to_vec())).await.unwrap();
/// assert_eq!(record.status, TaskStatus::Pending);
/// assert_eq!(store.load(&id).await.unwrap(), record);
/// # }
/// ```
#[derive(Debug)]
pub struct KvTaskStore<B> {
    backend: B,
    prefix: String,
    retention: Duration,
    lock_ttl: Duration,
    limits: SweepLimits,
}

impl InMemoryTaskStore {
    /// Store over a fresh [`InMemoryBackend`] with default settings.
    pub fn in_memory() -> Self {
        Self::new(InMemoryBackend::new())
    }
}

impl<B: KvBackend> KvTaskStore<B> {
    /// Creates a store with the default prefix, 24 h retention, and 5 s lock
    /// expiry.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            prefix: DEFAULT_KEY_PREFIX.to_string(),
            retention: Duration::from_secs(DEFAULT_RETENTION_SECS),
            lock_ttl: Duration::from_millis(DEFAULT_LOCK_TTL_MS),
            limits: SweepLimits::default(),
        }
    }

    /// Sets the key prefix (builder pattern).
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Sets how long every record key lives after its last write.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Sets the advisory lock expiry.
    pub fn with_lock_ttl(mut self, lock_ttl: Duration) -> Self {
        self.lock_ttl = lock_ttl;
        self
    }

    /// Sets the sweep batching limits.
    pub fn with_sweep_limits(mut self, limits: SweepLimits) -> Self {
        self.limits = limits;
        self
    }

    /// The key prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The record retention window.
    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// The underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn field_key(&self, task_id: impl fmt::Display, field: &str) -> String {
        format!("{}:task:{}:{}", self.prefix, task_id, field)
    }

    fn field_keys(&self, task_id: impl fmt::Display + Copy) -> Vec<String> {
        FIELDS
            .iter()
            .map(|field| self.field_key(task_id, field))
            .collect()
    }

    fn lock_key(&self, task_id: &TaskId) -> String {
        format!("{}:lock:{}", self.prefix, task_id)
    }

    fn index_key(&self) -> String {
        format!("{}:idx:completed", self.prefix)
    }

    /// Full rewrite of `record`: every present field is put, every absent
    /// one deleted, and terminal records are indexed for the sweep.
    fn record_ops(&self, record: &TaskRecord) -> Result<Vec<KvOp>, TaskError> {
        let id = &record.task_id;
        let error = record
            .error
            .as_ref()
            .map(serde_json::to_vec)
            .transpose()
            .map_err(|e| TaskError::Serialization(format!("failed to encode error record: {e}")))?;

        let fields: [(&str, Option<Vec<u8>>); 8] = [
            (STATUS, Some(record.status.as_str().as_bytes().to_vec())),
            (PAYLOAD, record.payload.clone()),
            (RESULT, record.result.clone()),
            (ERROR, error),
            (SUBMITTED_AT, Some(encode_millis(record.submitted_at))),
            (STARTED_AT, record.started_at.map(encode_millis)),
            (COMPLETED_AT, record.completed_at.map(encode_millis)),
            (VERSION, Some(record.version.to_string().into_bytes())),
        ];

        let mut ops: Vec<KvOp> = fields
            .into_iter()
            .map(|(field, value)| {
                let key = self.field_key(id, field);
                match value {
                    Some(value) => KvOp::Put { key, value },
                    None => KvOp::Delete { key },
                }
            })
            .collect();

        if let (true, Some(completed_at)) = (record.is_terminal(), record.completed_at) {
            ops.push(KvOp::IndexAdd {
                index: self.index_key(),
                member: id.to_string(),
                score: completed_at.timestamp_millis(),
            });
        }
        Ok(ops)
    }

    async fn read(&self, task_id: &TaskId) -> Result<Option<TaskRecord>, TaskError> {
        let values = self
            .backend
            .get_many(&self.field_keys(task_id))
            .await
            .map_err(|e| storage_error("load", e))?;
        let record = decode_fields(task_id, values)?;
        if let Some(record) = &record {
            record.validate()?;
        }
        Ok(record)
    }

    async fn read_existing(&self, task_id: &TaskId) -> Result<TaskRecord, TaskError> {
        self.read(task_id).await?.ok_or_else(|| TaskError::NotFound {
            task_id: task_id.clone(),
        })
    }

    /// Takes the advisory lock, returning its token, or `None` if another
    /// writer holds it.
    async fn acquire_lock(&self, task_id: &TaskId) -> Result<Option<String>, TaskError> {
        let token = Uuid::new_v4().to_string();
        let acquired = self
            .backend
            .set_if_absent(&self.lock_key(task_id), token.as_bytes(), self.lock_ttl)
            .await
            .map_err(|e| storage_error("acquire lock", e))?;
        Ok(acquired.then_some(token))
    }

    async fn release_lock(&self, task_id: &TaskId, token: &str) {
        match self
            .backend
            .delete_if_equals(&self.lock_key(task_id), token.as_bytes())
            .await
        {
            Ok(true) => {},
            Ok(false) => warn!(
                task_id = %task_id,
                "advisory lock expired before release; lock_ttl may be too short"
            ),
            Err(e) => warn!(task_id = %task_id, error = %e, "failed to release advisory lock"),
        }
    }

    async fn create_locked(&self, record: &TaskRecord) -> Result<(), TaskError> {
        let version_key = self.field_key(&record.task_id, VERSION);
        let existing = self
            .backend
            .get_many(std::slice::from_ref(&version_key))
            .await
            .map_err(|e| storage_error("create", e))?;
        if existing.into_iter().flatten().next().is_some() {
            return Err(TaskError::AlreadyExists {
                task_id: record.task_id.clone(),
            });
        }
        self.backend
            .apply(&self.record_ops(record)?, self.retention)
            .await
            .map_err(|e| storage_error("create", e))
    }

    async fn transition_locked(
        &self,
        task_id: &TaskId,
        expected_version: u64,
        transition: &Transition,
    ) -> Result<u64, TaskError> {
        let current = self.read_existing(task_id).await?;
        let next = successor(&current, expected_version, transition)?;
        self.backend
            .apply(&self.record_ops(&next)?, self.retention)
            .await
            .map_err(|e| storage_error("transition", e))?;
        Ok(next.version)
    }

    async fn transition_cas(
        &self,
        task_id: &TaskId,
        expected_version: u64,
        transition: &Transition,
    ) -> Result<u64, TaskError> {
        let current = self.read_existing(task_id).await?;
        let next = successor(&current, expected_version, transition)?;
        let outcome = self
            .backend
            .apply_if_version(
                &self.field_key(task_id, VERSION),
                Some(expected_version),
                &self.record_ops(&next)?,
                self.retention,
            )
            .await
            .map_err(|e| storage_error("transition", e))?;
        match outcome {
            CasOutcome::Applied => Ok(next.version),
            CasOutcome::Mismatch { actual: None } => Err(TaskError::NotFound {
                task_id: task_id.clone(),
            }),
            CasOutcome::Mismatch { actual } => Err(TaskError::ConcurrentModification {
                task_id: task_id.clone(),
                expected_version,
                actual_version: actual,
            }),
        }
    }
}

#[async_trait]
impl<B: KvBackend> TaskStore for KvTaskStore<B> {
    async fn create(
        &self,
        task_id: &TaskId,
        payload: Option<Vec<u8>>,
    ) -> Result<TaskRecord, TaskError> {
        let record = TaskRecord::new(task_id.clone(), payload, now_millis());

        if self.backend.supports_cas() {
            let outcome = self
                .backend
                .apply_if_version(
                    &self.field_key(task_id, VERSION),
                    None,
                    &self.record_ops(&record)?,
                    self.retention,
                )
                .await
                .map_err(|e| storage_error("create", e))?;
            if outcome != CasOutcome::Applied {
                return Err(TaskError::AlreadyExists {
                    task_id: task_id.clone(),
                });
            }
        } else {
            let Some(token) = self.acquire_lock(task_id).await? else {
                return Err(TaskError::AlreadyExists {
                    task_id: task_id.clone(),
                });
            };
            let created = self.create_locked(&record).await;
            self.release_lock(task_id, &token).await;
            created?;
        }

        debug!(task_id = %task_id, "created task record");
        Ok(record)
    }

    async fn load(&self, task_id: &TaskId) -> Result<TaskRecord, TaskError> {
        self.read_existing(task_id).await
    }

    async fn transition(
        &self,
        task_id: &TaskId,
        expected_version: u64,
        transition: Transition,
    ) -> Result<u64, TaskError> {
        let version = if self.backend.supports_cas() {
            self.transition_cas(task_id, expected_version, &transition)
                .await?
        } else {
            let Some(token) = self.acquire_lock(task_id).await? else {
                return Err(TaskError::ConcurrentModification {
                    task_id: task_id.clone(),
                    expected_version,
                    actual_version: None,
                });
            };
            let outcome = self
                .transition_locked(task_id, expected_version, &transition)
                .await;
            self.release_lock(task_id, &token).await;
            outcome?
        };

        debug!(
            task_id = %task_id,
            version,
            status = %transition.target(),
            "transitioned task record"
        );
        Ok(version)
    }

    async fn delete(&self, task_id: &TaskId) -> Result<(), TaskError> {
        let mut ops: Vec<KvOp> = self
            .field_keys(task_id)
            .into_iter()
            .map(|key| KvOp::Delete { key })
            .collect();
        ops.push(KvOp::IndexRemove {
            index: self.index_key(),
            member: task_id.to_string(),
        });
        self.backend
            .apply(&ops, self.retention)
            .await
            .map_err(|e| storage_error("delete", e))?;
        debug!(task_id = %task_id, "deleted task record");
        Ok(())
    }

    async fn delete_expired(&self, older_than: DateTime<Utc>) -> Result<usize, TaskError> {
        let limits = self.limits.normalized();
        let index = self.index_key();
        let cutoff = older_than.timestamp_millis();
        let mut removed = 0;

        // Records that expired by TTL while still live never reach the index.
        let purged = self
            .backend
            .purge_expired()
            .await
            .map_err(|e| storage_error("sweep", e))?;
        if purged > 0 {
            debug!(purged, "dropped expired keys");
        }

        for _ in 0..limits.max_passes {
            let members = self
                .backend
                .index_range(&index, cutoff, limits.batch_size)
                .await
                .map_err(|e| storage_error("sweep", e))?;
            if members.is_empty() {
                break;
            }

            // Removing the index entry is the claim: only the caller that
            // removed it deletes the record.
            let claimed = self
                .backend
                .index_remove(&index, &members)
                .await
                .map_err(|e| storage_error("sweep", e))?;

            if !claimed.is_empty() {
                let status_keys: Vec<String> = claimed
                    .iter()
                    .map(|id| self.field_key(id, STATUS))
                    .collect();
                let live = self
                    .backend
                    .get_many(&status_keys)
                    .await
                    .map_err(|e| storage_error("sweep", e))?
                    .into_iter()
                    .filter(Option::is_some)
                    .count();

                let ops: Vec<KvOp> = claimed
                    .iter()
                    .flat_map(|id| self.field_keys(id.as_str()))
                    .map(|key| KvOp::Delete { key })
                    .collect();
                self.backend
                    .apply(&ops, self.retention)
                    .await
                    .map_err(|e| storage_error("sweep", e))?;
                removed += live;
            }

            if members.len() < limits.batch_size {
                break;
            }
        }

        if removed > 0 {
            info!(removed, cutoff = %older_than, "removed expired task records");
        }
        Ok(removed)
    }
}

fn storage_error(operation: &str, err: StorageError) -> TaskError {
    TaskError::storage(format!("{operation} failed: {err}"), err)
}

fn encode_millis(at: DateTime<Utc>) -> Vec<u8> {
    at.timestamp_millis().to_string().into_bytes()
}

/// Rebuilds a record from its field values, in [`FIELDS`] order. A missing
/// status key means the record does not exist.
fn decode_fields(
    task_id: &TaskId,
    values: Vec<Option<Vec<u8>>>,
) -> Result<Option<TaskRecord>, TaskError> {
    let corrupt = |reason: String| TaskError::CorruptRecord {
        task_id: task_id.clone(),
        reason,
    };
    let text = |field: &str, bytes: Vec<u8>| {
        String::from_utf8(bytes).map_err(|_| corrupt(format!("{field} is not valid UTF-8")))
    };
    let millis = |field: &str, bytes: Vec<u8>| -> Result<DateTime<Utc>, TaskError> {
        text(field, bytes)?
            .parse::<i64>()
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| corrupt(format!("{field} is not an epoch-millisecond timestamp")))
    };

    let mut values = values.into_iter();
    let mut next = || values.next().flatten();

    let Some(status) = next() else {
        return Ok(None);
    };
    let status: TaskStatus = text(STATUS, status)?
        .parse()
        .map_err(|e| corrupt(format!("{e}")))?;
    let payload = next();
    let result = next();
    let error = next()
        .map(|bytes| serde_json::from_slice::<ErrorRecord>(&bytes))
        .transpose()
        .map_err(|e| corrupt(format!("error is not a valid error record: {e}")))?;
    let submitted_at = next()
        .map(|bytes| millis(SUBMITTED_AT, bytes))
        .transpose()?
        .ok_or_else(|| corrupt("submitted_at is missing".to_string()))?;
    let started_at = next().map(|bytes| millis(STARTED_AT, bytes)).transpose()?;
    let completed_at = next().map(|bytes| millis(COMPLETED_AT, bytes)).transpose()?;
    let version = next()
        .map(|bytes| text(VERSION, bytes))
        .transpose()?
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| corrupt("version is missing or not a number".to_string()))?;

    Ok(Some(TaskRecord {
        task_id: task_id.clone(),
        status,
        payload,
        result,
        error,
        submitted_at,
        started_at,
        completed_at,
        version,
    }))
}
