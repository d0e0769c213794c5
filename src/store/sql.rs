//! Relational task store over sqlx/SQLite.
//!
//! One row per record in `task_futures`. Timestamps are epoch milliseconds,
//! `error` is the JSON form of [`ErrorRecord`], and payload/result are blobs.
//! Optimistic concurrency is a conditional update:
//!
//! ```sql
//! UPDATE task_futures SET ... WHERE task_id = ? AND version = ?
//! ```
//!
//! A zero row count means another writer got there first (or the row is
//! gone); the row is re-read to tell the two apart.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use crate::codec::ErrorRecord;
use crate::domain::{TaskId, TaskRecord, TaskStatus, Transition};
use crate::error::TaskError;
use crate::store::{successor, SweepLimits, TaskStore};

type Row = (
    String,
    Option<Vec<u8>>,
    Option<Vec<u8>>,
    Option<String>,
    i64,
    Option<i64>,
    Option<i64>,
    i64,
);

const SELECT_RECORD: &str = r#"
    SELECT status, payload, result, error, submitted_at, started_at, completed_at, version
    FROM task_futures
    WHERE task_id = ?
"#;

/// SQLite-backed [`TaskStore`].
///
/// # Examples
///
/// ```
/// use taskfuture::store::sql::SqlTaskStore;
/// use taskfuture::store::TaskStore;
/// use taskfuture::TaskId;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = SqlTaskStore::in_memory().await.unwrap();
/// let id = TaskId::new();
/// store.create(&id, None).await.unwrap();
/// assert_eq!(store.load(&id).await.unwrap().version, 0);
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SqlTaskStore {
    pool: SqlitePool,
    limits: SweepLimits,
}

impl SqlTaskStore {
    /// Wraps an existing pool. Call [`run_migrations`](Self::run_migrations)
    /// before use.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            limits: SweepLimits::default(),
        }
    }

    /// Opens (creating if missing) the database at `url` and runs the
    /// migrations.
    ///
    /// # Errors
    ///
    /// [`TaskError::StorageUnavailable`] if the URL is invalid, the database
    /// cannot be opened, or the schema cannot be created.
    pub async fn connect(url: &str) -> Result<Self, TaskError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| db_error("parse database url", e))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(|e| db_error("connect", e))?;
        let store = Self::new(pool);
        store.run_migrations().await?;
        Ok(store)
    }

    /// Private in-memory database on a single long-lived connection.
    ///
    /// # Errors
    ///
    /// [`TaskError::StorageUnavailable`] if SQLite cannot be opened.
    pub async fn in_memory() -> Result<Self, TaskError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| db_error("connect", e))?;
        let store = Self::new(pool);
        store.run_migrations().await?;
        Ok(store)
    }

    /// Sets the sweep batching limits.
    pub fn with_sweep_limits(mut self, limits: SweepLimits) -> Self {
        self.limits = limits;
        self
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates the table and indexes if they do not exist.
    ///
    /// # Errors
    ///
    /// [`TaskError::StorageUnavailable`] on driver failure.
    pub async fn run_migrations(&self) -> Result<(), TaskError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_futures (
                task_id TEXT PRIMARY KEY NOT NULL,
                status TEXT NOT NULL,
                payload BLOB,
                result BLOB,
                error TEXT,
                submitted_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER,
                version INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("migrate", e))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_task_futures_status
            ON task_futures(status)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("migrate", e))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_task_futures_completed_at
            ON task_futures(completed_at)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("migrate", e))?;

        Ok(())
    }

    async fn read(&self, task_id: &TaskId) -> Result<Option<TaskRecord>, TaskError> {
        let row: Option<Row> = sqlx::query_as(SELECT_RECORD)
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("load", e))?;
        row.map(|row| decode_row(task_id, row)).transpose()
    }
}

#[async_trait]
impl TaskStore for SqlTaskStore {
    async fn create(
        &self,
        task_id: &TaskId,
        payload: Option<Vec<u8>>,
    ) -> Result<TaskRecord, TaskError> {
        let record = TaskRecord::new(task_id.clone(), payload, crate::domain::now_millis());

        let inserted = sqlx::query(
            r#"
            INSERT INTO task_futures (task_id, status, payload, submitted_at, version)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(task_id.to_string())
        .bind(record.status.as_str())
        .bind(record.payload.as_deref())
        .bind(record.submitted_at.timestamp_millis())
        .bind(to_db_version(record.version))
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {},
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(TaskError::AlreadyExists {
                    task_id: task_id.clone(),
                });
            },
            Err(e) => return Err(db_error("create", e)),
        }

        debug!(task_id = %task_id, "created task record");
        Ok(record)
    }

    async fn load(&self, task_id: &TaskId) -> Result<TaskRecord, TaskError> {
        self.read(task_id).await?.ok_or_else(|| TaskError::NotFound {
            task_id: task_id.clone(),
        })
    }

    async fn transition(
        &self,
        task_id: &TaskId,
        expected_version: u64,
        transition: Transition,
    ) -> Result<u64, TaskError> {
        let current = self.load(task_id).await?;
        let next = successor(&current, expected_version, &transition)?;
        let error = next
            .error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| TaskError::Serialization(format!("failed to encode error record: {e}")))?;

        let updated = sqlx::query(
            r#"
            UPDATE task_futures
            SET status = ?, payload = ?, result = ?, error = ?,
                started_at = ?, completed_at = ?, version = ?
            WHERE task_id = ? AND version = ?
            "#,
        )
        .bind(next.status.as_str())
        .bind(next.payload.as_deref())
        .bind(next.result.as_deref())
        .bind(error)
        .bind(next.started_at.map(|t| t.timestamp_millis()))
        .bind(next.completed_at.map(|t| t.timestamp_millis()))
        .bind(to_db_version(next.version))
        .bind(task_id.to_string())
        .bind(to_db_version(expected_version))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("transition", e))?;

        if updated.rows_affected() == 0 {
            let actual = self.read(task_id).await?;
            return Err(match actual {
                None => TaskError::NotFound {
                    task_id: task_id.clone(),
                },
                Some(actual) => TaskError::ConcurrentModification {
                    task_id: task_id.clone(),
                    expected_version,
                    actual_version: Some(actual.version),
                },
            });
        }

        debug!(
            task_id = %task_id,
            version = next.version,
            status = %next.status,
            "transitioned task record"
        );
        Ok(next.version)
    }

    async fn delete(&self, task_id: &TaskId) -> Result<(), TaskError> {
        sqlx::query("DELETE FROM task_futures WHERE task_id = ?")
            .bind(task_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("delete", e))?;
        debug!(task_id = %task_id, "deleted task record");
        Ok(())
    }

    async fn delete_expired(&self, older_than: DateTime<Utc>) -> Result<usize, TaskError> {
        let limits = self.limits.normalized();
        let cutoff = older_than.timestamp_millis();
        let batch = i64::try_from(limits.batch_size).unwrap_or(i64::MAX);
        let mut removed = 0;

        for _ in 0..limits.max_passes {
            let result = sqlx::query(
                r#"
                DELETE FROM task_futures
                WHERE task_id IN (
                    SELECT task_id FROM task_futures
                    WHERE status IN ('completed', 'failed', 'cancelled')
                      AND completed_at < ?
                    LIMIT ?
                )
                "#,
            )
            .bind(cutoff)
            .bind(batch)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("sweep", e))?;

            let deleted = result.rows_affected() as usize;
            removed += deleted;
            if deleted < limits.batch_size {
                break;
            }
        }

        if removed > 0 {
            info!(removed, cutoff = %older_than, "removed expired task records");
        }
        Ok(removed)
    }
}

fn db_error(operation: &str, err: sqlx::Error) -> TaskError {
    TaskError::storage(format!("{operation} failed: {err}"), err)
}

fn to_db_version(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

fn decode_row(task_id: &TaskId, row: Row) -> Result<TaskRecord, TaskError> {
    let (status, payload, result, error, submitted_at, started_at, completed_at, version) = row;
    let corrupt = |reason: String| TaskError::CorruptRecord {
        task_id: task_id.clone(),
        reason,
    };
    let millis = |column: &str, ms: i64| {
        DateTime::from_timestamp_millis(ms)
            .ok_or_else(|| corrupt(format!("{column} is out of range: {ms}")))
    };

    let record = TaskRecord {
        task_id: task_id.clone(),
        status: TaskStatus::from_str(&status).map_err(|e| corrupt(e.to_string()))?,
        payload,
        result,
        error: error
            .map(|json| serde_json::from_str::<ErrorRecord>(&json))
            .transpose()
            .map_err(|e| corrupt(format!("error is not a valid error record: {e}")))?,
        submitted_at: millis("submitted_at", submitted_at)?,
        started_at: started_at
            .map(|ms| millis("started_at", ms))
            .transpose()?,
        completed_at: completed_at
            .map(|ms| millis("completed_at", ms))
            .transpose()?,
        version: u64::try_from(version)
            .map_err(|_| corrupt(format!("version is negative: {version}")))?,
    };
    record.validate()?;
    Ok(record)
}
