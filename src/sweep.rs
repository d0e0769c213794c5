//! Expiration sweep for terminal records.
//!
//! Records have no inline expiry on the relational backend, so something has
//! to remove old terminal rows. [`ExpirationSweep`] is that something: run it
//! on a timer, or once per invocation of the `taskfuture-sweep` binary.
//! Concurrent sweeps are safe; every record is removed at most once.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::constants::DEFAULT_RETENTION_SECS;
use crate::error::TaskError;
use crate::store::TaskStore;

/// Result of one sweep call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Terminal records completed strictly before this instant were eligible.
    pub cutoff: DateTime<Utc>,
    /// Records this call removed.
    pub removed: usize,
}

/// Removes terminal records older than a retention window.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use taskfuture::store::InMemoryTaskStore;
/// use taskfuture::sweep::ExpirationSweep;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let sweep = ExpirationSweep::new(Arc::new(InMemoryTaskStore::in_memory()))
///     .with_retention(Duration::from_secs(3600));
/// let report = sweep.run(chrono::Utc::now()).await.unwrap();
/// assert_eq!(report.removed, 0);
/// # }
/// ```
#[derive(Clone)]
pub struct ExpirationSweep {
    store: Arc<dyn TaskStore>,
    retention: Duration,
}

impl std::fmt::Debug for ExpirationSweep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpirationSweep")
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl ExpirationSweep {
    /// Creates a sweep with the default 24 hour retention.
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            retention: Duration::from_secs(DEFAULT_RETENTION_SECS),
        }
    }

    /// Sets how long terminal records are kept.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// The configured retention.
    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Removes terminal records completed before `now - retention`.
    ///
    /// # Errors
    ///
    /// [`TaskError::StorageUnavailable`] on backend failure.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<SweepReport, TaskError> {
        self.run_with_cutoff(cutoff_for(now, self.retention)).await
    }

    /// Removes terminal records completed strictly before `cutoff`.
    ///
    /// # Errors
    ///
    /// [`TaskError::StorageUnavailable`] on backend failure.
    pub async fn run_with_cutoff(&self, cutoff: DateTime<Utc>) -> Result<SweepReport, TaskError> {
        let removed = self.store.delete_expired(cutoff).await?;
        info!(%cutoff, removed, "expiration sweep finished");
        Ok(SweepReport { cutoff, removed })
    }
}

/// `now - retention`, saturating at the earliest representable instant.
fn cutoff_for(now: DateTime<Utc>, retention: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(retention)
        .ok()
        .and_then(|retention| now.checked_sub_signed(retention))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
