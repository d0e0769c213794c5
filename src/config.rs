//! Runtime configuration.
//!
//! Configuration can be loaded from:
//! 1. TOML file (`taskfuture.toml` in the working directory, or an explicit path)
//! 2. Environment variables (with `TASKFUTURE_` prefix)
//!
//! Environment variables override TOML configuration.
//!
//! # Example TOML Configuration
//!
//! ```toml
//! [taskfuture]
//! retention_secs = 3600
//!
//! [taskfuture.store]
//! backend = "sqlite"
//! url = "sqlite://tasks.db"
//!
//! [taskfuture.polling]
//! interval_ms = 50
//! max_interval_ms = 800
//! multiplier = 2.0
//!
//! [taskfuture.submission]
//! latency_budget_ms = 50
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_KEY_PREFIX, DEFAULT_LOCK_TTL_MS, DEFAULT_POLL_INTERVAL_MS, DEFAULT_RETENTION_SECS,
    DEFAULT_SUBMIT_BUDGET_MS, DEFAULT_SWEEP_BATCH_SIZE, DEFAULT_SWEEP_MAX_PASSES,
};
use crate::error::ConfigError;
use crate::future::PollConfig;
use crate::store::{KvTaskStore, SweepLimits, TaskStore};

/// Default configuration file looked up by [`FutureConfig::load`].
pub const DEFAULT_CONFIG_FILE: &str = "taskfuture.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FutureConfig {
    /// Store selection and tuning.
    pub store: StoreConfig,

    /// How long terminal records are kept before the sweep removes them.
    pub retention_secs: u64,

    /// Polling behaviour of [`TaskFuture`](crate::future::TaskFuture).
    pub polling: PollingConfig,

    /// Submission tuning.
    pub submission: SubmissionConfig,
}

impl Default for FutureConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            retention_secs: DEFAULT_RETENTION_SECS,
            polling: PollingConfig::default(),
            submission: SubmissionConfig::default(),
        }
    }
}

/// Which store implementation to open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local key-value store. Nothing survives a restart.
    #[default]
    Memory,
    /// Relational store on SQLite.
    Sqlite,
    /// Key-value store on Redis.
    Redis,
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Memory => "memory",
            Self::Sqlite => "sqlite",
            Self::Redis => "redis",
        })
    }
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            "redis" => Ok(Self::Redis),
            other => Err(ConfigError::Invalid(format!("unknown store backend '{other}'"))),
        }
    }
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend selector.
    pub backend: StoreBackend,

    /// Connection URL. Required for `sqlite` and `redis`.
    pub url: Option<String>,

    /// Key prefix for key-value backends.
    pub key_prefix: String,

    /// Advisory lock expiry for key-value backends without compare-and-swap.
    pub lock_ttl_ms: u64,

    /// Records removed per sweep pass.
    pub sweep_batch_size: usize,

    /// Sweep passes per call.
    pub sweep_max_passes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: None,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            lock_ttl_ms: DEFAULT_LOCK_TTL_MS,
            sweep_batch_size: DEFAULT_SWEEP_BATCH_SIZE,
            sweep_max_passes: DEFAULT_SWEEP_MAX_PASSES,
        }
    }
}

/// Polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollingConfig {
    /// First poll interval.
    pub interval_ms: u64,

    /// Upper bound for the interval under backoff.
    pub max_interval_ms: u64,

    /// Interval growth factor per poll.
    pub multiplier: f64,

    /// How long `is_*` queries may reuse an observed status. 0 disables reuse.
    pub snapshot_ttl_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            multiplier: 2.0,
            snapshot_ttl_ms: 0,
        }
    }
}

/// Submission configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SubmissionConfig {
    /// Time allowed for each of the create and dispatch steps.
    pub latency_budget_ms: u64,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            latency_budget_ms: DEFAULT_SUBMIT_BUDGET_MS,
        }
    }
}

impl FutureConfig {
    /// Load configuration from file and environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. `taskfuture.toml` in the working directory
    /// 3. Default values
    ///
    /// # Errors
    ///
    /// [`ConfigError`] if the file exists but cannot be parsed, or an
    /// override is malformed.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::fs::read_to_string(DEFAULT_CONFIG_FILE) {
            Ok(contents) => Self::from_toml(&contents)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load configuration from a specific file path, then apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source,
        })?;
        let mut config = Self::from_toml(&contents)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Parse the `[taskfuture]` table of a TOML document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] on malformed TOML or mistyped values.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        #[derive(Deserialize)]
        struct FullConfig {
            #[serde(default)]
            taskfuture: FutureConfig,
        }

        let full: FullConfig = toml::from_str(content)?;
        Ok(full.taskfuture)
    }

    /// Applies `TASKFUTURE_*` environment variables.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] if a variable is set but unparsable.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Applies overrides from `lookup`, which maps a variable name such as
    /// `TASKFUTURE_STORE_BACKEND` to its value.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] if a value is set but unparsable.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(backend) = lookup("TASKFUTURE_STORE_BACKEND") {
            self.store.backend = backend.parse()?;
        }
        if let Some(url) = lookup("TASKFUTURE_STORE_URL") {
            self.store.url = Some(url);
        }
        if let Some(prefix) = lookup("TASKFUTURE_STORE_KEY_PREFIX") {
            self.store.key_prefix = prefix;
        }
        override_parsed(&lookup, "TASKFUTURE_STORE_LOCK_TTL_MS", &mut self.store.lock_ttl_ms)?;
        override_parsed(
            &lookup,
            "TASKFUTURE_STORE_SWEEP_BATCH_SIZE",
            &mut self.store.sweep_batch_size,
        )?;
        override_parsed(
            &lookup,
            "TASKFUTURE_STORE_SWEEP_MAX_PASSES",
            &mut self.store.sweep_max_passes,
        )?;

        override_parsed(&lookup, "TASKFUTURE_RETENTION_SECS", &mut self.retention_secs)?;

        override_parsed(
            &lookup,
            "TASKFUTURE_POLLING_INTERVAL_MS",
            &mut self.polling.interval_ms,
        )?;
        override_parsed(
            &lookup,
            "TASKFUTURE_POLLING_MAX_INTERVAL_MS",
            &mut self.polling.max_interval_ms,
        )?;
        override_parsed(
            &lookup,
            "TASKFUTURE_POLLING_MULTIPLIER",
            &mut self.polling.multiplier,
        )?;
        override_parsed(
            &lookup,
            "TASKFUTURE_POLLING_SNAPSHOT_TTL_MS",
            &mut self.polling.snapshot_ttl_ms,
        )?;

        override_parsed(
            &lookup,
            "TASKFUTURE_SUBMISSION_LATENCY_BUDGET_MS",
            &mut self.submission.latency_budget_ms,
        )?;
        Ok(())
    }

    /// Polling settings as a [`PollConfig`].
    ///
    /// The interval is at least 1 ms so a wait never spins on the store.
    pub fn poll_config(&self) -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(self.polling.interval_ms.max(1)),
            max_interval: Duration::from_millis(self.polling.max_interval_ms),
            multiplier: self.polling.multiplier,
            snapshot_ttl: Duration::from_millis(self.polling.snapshot_ttl_ms),
        }
    }

    /// Sweep batching as [`SweepLimits`].
    pub fn sweep_limits(&self) -> SweepLimits {
        SweepLimits {
            batch_size: self.store.sweep_batch_size,
            max_passes: self.store.sweep_max_passes,
        }
        .normalized()
    }

    /// Retention window for terminal records.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// Submission latency budget.
    pub fn latency_budget(&self) -> Duration {
        Duration::from_millis(self.submission.latency_budget_ms)
    }

    /// Opens the configured store.
    ///
    /// Call this once and share the returned handle between the submission
    /// service, futures, executors, and the sweep.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Invalid`] for a missing URL or a backend that was
    ///   not compiled in.
    /// - [`ConfigError::Store`] if the store cannot be opened.
    pub async fn connect_store(&self) -> Result<Arc<dyn TaskStore>, ConfigError> {
        let store: Arc<dyn TaskStore> = match self.store.backend {
            StoreBackend::Memory => Arc::new(
                KvTaskStore::in_memory()
                    .with_prefix(self.store.key_prefix.clone())
                    .with_retention(self.retention())
                    .with_lock_ttl(Duration::from_millis(self.store.lock_ttl_ms))
                    .with_sweep_limits(self.sweep_limits()),
            ),
            StoreBackend::Sqlite => self.connect_sqlite().await?,
            StoreBackend::Redis => self.connect_redis().await?,
        };
        tracing::info!(backend = %self.store.backend, "task store opened");
        Ok(store)
    }

    /// Rejects the in-process backend for tools that only make sense against
    /// records shared with other processes, such as the sweep binary.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] when `store.backend` is `memory`.
    pub fn require_shared_store(&self) -> Result<(), ConfigError> {
        if self.store.backend == StoreBackend::Memory {
            return Err(ConfigError::Invalid(
                "store.backend = \"memory\" is private to one process; configure sqlite or redis"
                    .to_string(),
            ));
        }
        Ok(())
    }

    fn require_url(&self) -> Result<&str, ConfigError> {
        self.store.url.as_deref().ok_or_else(|| {
            ConfigError::Invalid(format!(
                "store.url is required for the {} backend",
                self.store.backend
            ))
        })
    }

    #[cfg(feature = "sqlite")]
    async fn connect_sqlite(&self) -> Result<Arc<dyn TaskStore>, ConfigError> {
        let url = self.require_url()?;
        let store = crate::store::sql::SqlTaskStore::connect(url)
            .await?
            .with_sweep_limits(self.sweep_limits());
        Ok(Arc::new(store))
    }

    #[cfg(not(feature = "sqlite"))]
    async fn connect_sqlite(&self) -> Result<Arc<dyn TaskStore>, ConfigError> {
        Err(ConfigError::Invalid(
            "the sqlite backend requires the `sqlite` feature".to_string(),
        ))
    }

    #[cfg(feature = "redis")]
    async fn connect_redis(&self) -> Result<Arc<dyn TaskStore>, ConfigError> {
        let url = self.require_url()?;
        let backend = crate::store::redis::RedisBackend::new(url)
            .await
            .map_err(|e| crate::error::TaskError::storage("failed to connect to redis", e))?;
        let store = KvTaskStore::new(backend)
            .with_prefix(self.store.key_prefix.clone())
            .with_retention(self.retention())
            .with_lock_ttl(Duration::from_millis(self.store.lock_ttl_ms))
            .with_sweep_limits(self.sweep_limits());
        Ok(Arc::new(store))
    }

    #[cfg(not(feature = "redis"))]
    async fn connect_redis(&self) -> Result<Arc<dyn TaskStore>, ConfigError> {
        Err(ConfigError::Invalid(
            "the redis backend requires the `redis` feature".to_string(),
        ))
    }
}

fn override_parsed<F, T>(lookup: &F, name: &str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(name) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("{name}={raw} is not a valid value")))?;
    }
    Ok(())
}
