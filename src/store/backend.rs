//! Low-level key-value backend trait and supporting types.
//!
//! The [`KvBackend`] trait is the contract every key-value engine implements.
//! Backends are dumb: they store opaque bytes under string keys, maintain
//! scored indexes, and apply batches atomically. State machine validation,
//! record layout, versioning, and expiry policy live in
//! [`KvTaskStore`](crate::store::kv::KvTaskStore).
//!
//! # Atomic batches
//!
//! A logical task record spans several keys, so every write goes through
//! [`KvBackend::apply`], which must make the whole batch visible at once.
//! Backends with server-side scripting can additionally offer a native
//! compare-and-swap over a batch ([`KvBackend::apply_if_version`]); the store
//! falls back to an advisory lock for backends that cannot.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

/// One write inside an atomic [`KvBackend::apply`] batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    /// Store `value` under `key` with the batch's expiry.
    Put {
        /// Target key.
        key: String,
        /// Raw bytes.
        value: Vec<u8>,
    },
    /// Remove `key` if present.
    Delete {
        /// Target key.
        key: String,
    },
    /// Add or re-score `member` in the sorted index `index`. Indexes do not
    /// expire.
    IndexAdd {
        /// Index name.
        index: String,
        /// Member to add.
        member: String,
        /// Sort score.
        score: i64,
    },
    /// Remove `member` from the sorted index `index` if present.
    IndexRemove {
        /// Index name.
        index: String,
        /// Member to remove.
        member: String,
    },
}

/// Result of a native compare-and-swap batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The version matched and the batch was applied.
    Applied,
    /// The version did not match; nothing was written.
    Mismatch {
        /// The version found, or `None` if the version key was absent.
        actual: Option<u64>,
    },
}

/// Errors that can occur during raw storage operations.
///
/// [`KvTaskStore`](crate::store::kv::KvTaskStore) maps these to
/// [`TaskError::StorageUnavailable`](crate::error::TaskError::StorageUnavailable)
/// before surfacing them to callers.
///
/// # Examples
///
/// ```
/// use taskfuture::store::backend::StorageError;
///
/// let err = StorageError::Unsupported { operation: "apply_if_version" };
/// assert!(err.to_string().contains("apply_if_version"));
/// ```
#[derive(Debug)]
pub enum StorageError {
    /// An I/O or backend-specific error occurred (network failure, script
    /// error, malformed reply).
    Backend {
        /// Human-readable description of the error.
        message: String,
        /// The underlying error, if available.
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The backend does not implement an optional primitive.
    Unsupported {
        /// Name of the primitive.
        operation: &'static str,
    },
}

impl StorageError {
    /// Builds a [`StorageError::Backend`] without an underlying error.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            source: None,
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend { message, .. } => write!(f, "backend error: {message}"),
            Self::Unsupported { operation } => {
                write!(f, "operation not supported by backend: {operation}")
            },
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Backend {
                source: Some(src), ..
            } => Some(src.as_ref()),
            _ => None,
        }
    }
}

/// Key-value storage backend for task persistence.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; one backend is shared by every
/// caller of the store.
///
/// # Expiry
///
/// Keys written by [`apply`](KvBackend::apply) carry the batch `ttl`. Expired
/// keys must read as absent. Index entries never expire on their own.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Reads several keys in one round-trip. The result has one slot per
    /// requested key, `None` for absent or expired keys.
    ///
    /// # Errors
    ///
    /// [`StorageError::Backend`] on I/O or backend-specific failures.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, StorageError>;

    /// Applies `ops` atomically. `Put`s expire after `ttl`.
    ///
    /// # Errors
    ///
    /// [`StorageError::Backend`] on I/O or backend-specific failures; no op
    /// of the batch may be visible in that case.
    async fn apply(&self, ops: &[KvOp], ttl: Duration) -> Result<(), StorageError>;

    /// Stores `value` under `key` only if the key is absent. Returns `true`
    /// when the key was set.
    ///
    /// # Errors
    ///
    /// [`StorageError::Backend`] on I/O or backend-specific failures.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, StorageError>;

    /// Deletes `key` only if it currently holds `value`. Returns `true` when
    /// the key was deleted.
    ///
    /// # Errors
    ///
    /// [`StorageError::Backend`] on I/O or backend-specific failures.
    async fn delete_if_equals(&self, key: &str, value: &[u8]) -> Result<bool, StorageError>;

    /// Returns up to `limit` members of `index` with a score strictly below
    /// `max_score_exclusive`, lowest score first.
    ///
    /// # Errors
    ///
    /// [`StorageError::Backend`] on I/O or backend-specific failures.
    async fn index_range(
        &self,
        index: &str,
        max_score_exclusive: i64,
        limit: usize,
    ) -> Result<Vec<String>, StorageError>;

    /// Removes `members` from `index` and returns exactly those this call
    /// removed. A member removed concurrently by another caller is not
    /// returned here.
    ///
    /// # Errors
    ///
    /// [`StorageError::Backend`] on I/O or backend-specific failures.
    async fn index_remove(
        &self,
        index: &str,
        members: &[String],
    ) -> Result<Vec<String>, StorageError>;

    /// Drops keys whose TTL has passed and returns how many were dropped.
    ///
    /// Only backends that expire lazily need this; the default does nothing.
    ///
    /// # Errors
    ///
    /// [`StorageError::Backend`] on I/O or backend-specific failures.
    async fn purge_expired(&self) -> Result<usize, StorageError> {
        Ok(0)
    }

    /// Whether [`apply_if_version`](KvBackend::apply_if_version) is
    /// implemented natively.
    fn supports_cas(&self) -> bool {
        false
    }

    /// Applies `ops` atomically only if `version_key` holds `expected`
    /// (decimal text), or is absent when `expected` is `None`.
    ///
    /// # Errors
    ///
    /// [`StorageError::Unsupported`] unless [`supports_cas`](KvBackend::supports_cas)
    /// returns `true`; [`StorageError::Backend`] on I/O failures.
    async fn apply_if_version(
        &self,
        version_key: &str,
        expected: Option<u64>,
        ops: &[KvOp],
        ttl: Duration,
    ) -> Result<CasOutcome, StorageError> {
        let _ = (version_key, expected, ops, ttl);
        Err(StorageError::Unsupported {
            operation: "apply_if_version",
        })
    }
}
