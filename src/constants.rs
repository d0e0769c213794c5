//! Defaults and fixed names shared across the store, future, and sweep.

/// Version assigned to a freshly created record. Every successful mutation
/// increments it by one.
pub const INITIAL_VERSION: u64 = 0;

/// Default interval between polls in [`TaskFuture::get`](crate::future::TaskFuture::get).
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Default retention for terminal records (24 hours).
pub const DEFAULT_RETENTION_SECS: u64 = 86_400;

/// Maximum records removed per sweep pass.
pub const DEFAULT_SWEEP_BATCH_SIZE: usize = 1_000;

/// Maximum passes a single sweep call makes before returning.
pub const DEFAULT_SWEEP_MAX_PASSES: usize = 100;

/// Expiry of the advisory lock used when a key-value backend has no native
/// compare-and-swap.
pub const DEFAULT_LOCK_TTL_MS: u64 = 5_000;

/// Latency budget for each store/dispatch step of a submission.
pub const DEFAULT_SUBMIT_BUDGET_MS: u64 = 50;

/// Default key prefix for key-value backends.
pub const DEFAULT_KEY_PREFIX: &str = "taskfuture";

/// Error kind used when a failure has no registered type.
pub const GENERIC_FAILURE_KIND: &str = "Error";

/// Error kind recorded when a task handler panics.
pub const PANIC_FAILURE_KIND: &str = "Panic";

/// Deepest cause chain the codec will encode.
pub const MAX_CAUSE_DEPTH: usize = 16;
