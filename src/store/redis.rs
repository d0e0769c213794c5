//! Redis key-value backend.
//!
//! [`RedisBackend`] implements [`KvBackend`] over a multiplexed async
//! connection:
//!
//! | Primitive | Redis |
//! |-----------|-------|
//! | `get_many` | `MGET` |
//! | `apply` | `MULTI`/`EXEC` pipeline of `SET … PX`, `DEL`, `ZADD`, `ZREM` |
//! | `set_if_absent` | `SET … NX PX` |
//! | `delete_if_equals` | Lua compare-and-delete |
//! | `index_range` | `ZRANGEBYSCORE … -inf (max LIMIT 0 n` |
//! | `index_remove` | one `ZREM` per member, so each removal is attributable |
//! | `apply_if_version` | Lua: check the version key, then run the batch |
//!
//! The backend is a thin adapter; it never interprets the bytes it stores.
//! Key naming belongs to [`KvTaskStore`](crate::store::kv::KvTaskStore).
//!
//! # Usage
//!
//! ```rust,no_run
//! use taskfuture::store::kv::KvTaskStore;
//! use taskfuture::store::redis::RedisBackend;
//!
//! # async fn example() {
//! let backend = RedisBackend::new("redis://127.0.0.1:6379").await.unwrap();
//! let store = KvTaskStore::new(backend).with_prefix("my-app");
//! # }
//! ```

use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::Script;
use async_trait::async_trait;

use crate::store::backend::{CasOutcome, KvBackend, KvOp, StorageError};

/// Compare-and-delete for advisory lock release.
///
/// KEYS[1] = lock key. ARGV[1] = holder token.
/// Returns: 1 if deleted, 0 otherwise.
const LUA_DELETE_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Versioned batch: check the version key, then apply every op.
///
/// KEYS[1] = version key, KEYS[2..] = one target key per op.
/// ARGV[1] = expected version ("" means the key must be absent),
/// ARGV[2] = expiry in ms for puts ("0" = none), then three args per op:
/// opcode (P, D, ZA, ZR), value or member, score (or "").
/// Returns: {status, actual} where status 1=applied, 0=mismatch, -1=missing.
const LUA_APPLY_IF_VERSION: &str = r#"
local current = redis.call('GET', KEYS[1])
local expected = ARGV[1]
if expected == '' then
    if current then
        return {0, tonumber(current)}
    end
else
    if not current then
        return {-1, 0}
    end
    if current ~= expected then
        return {0, tonumber(current)}
    end
end

local ttl = tonumber(ARGV[2])
for i = 2, #KEYS do
    local base = 3 + (i - 2) * 3
    local op = ARGV[base]
    if op == 'P' then
        if ttl > 0 then
            redis.call('SET', KEYS[i], ARGV[base + 1], 'PX', ttl)
        else
            redis.call('SET', KEYS[i], ARGV[base + 1])
        end
    elseif op == 'D' then
        redis.call('DEL', KEYS[i])
    elseif op == 'ZA' then
        redis.call('ZADD', KEYS[i], tonumber(ARGV[base + 2]), ARGV[base + 1])
    elseif op == 'ZR' then
        redis.call('ZREM', KEYS[i], ARGV[base + 1])
    end
end

return {1, 0}
"#;

/// Redis [`KvBackend`] with native compare-and-swap.
///
/// # Connection Model
///
/// Holds a [`MultiplexedConnection`], which is cheap to clone; every call
/// clones it so concurrent callers share one TCP connection.
#[derive(Clone)]
pub struct RedisBackend {
    conn: MultiplexedConnection,
    release_script: Script,
    cas_script: Script,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend").finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Connects to Redis at `url` (`redis://[:<password>@]<host>:<port>[/<db>]`).
    /// Fails fast if the connection cannot be established.
    ///
    /// # Errors
    ///
    /// [`StorageError::Backend`] if the client cannot be created or the
    /// connection cannot be established.
    pub async fn new(url: &str) -> Result<Self, StorageError> {
        let client = ::redis::Client::open(url).map_err(|e| StorageError::Backend {
            message: format!("failed to create Redis client: {e}"),
            source: Some(Box::new(e)),
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StorageError::Backend {
                message: format!("failed to connect to Redis: {e}"),
                source: Some(Box::new(e)),
            })?;
        Ok(Self::with_connection(conn))
    }

    /// Wraps a pre-built multiplexed connection.
    pub fn with_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            release_script: Script::new(LUA_DELETE_IF_EQUALS),
            cas_script: Script::new(LUA_APPLY_IF_VERSION),
        }
    }
}

fn map_redis_error(err: ::redis::RedisError, operation: &str) -> StorageError {
    StorageError::Backend {
        message: format!("Redis {operation} failed: {err}"),
        source: Some(Box::new(err)),
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, StorageError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        ::redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, "MGET"))
    }

    async fn apply(&self, ops: &[KvOp], ttl: Duration) -> Result<(), StorageError> {
        if ops.is_empty() {
            return Ok(());
        }
        let ttl_ms = ttl_millis(ttl);
        let mut pipe = ::redis::pipe();
        pipe.atomic();
        for op in ops {
            match op {
                KvOp::Put { key, value } => {
                    let cmd = pipe.cmd("SET").arg(key).arg(value.as_slice());
                    if ttl_ms > 0 {
                        cmd.arg("PX").arg(ttl_ms);
                    }
                    cmd.ignore();
                },
                KvOp::Delete { key } => {
                    pipe.cmd("DEL").arg(key).ignore();
                },
                KvOp::IndexAdd {
                    index,
                    member,
                    score,
                } => {
                    pipe.cmd("ZADD").arg(index).arg(*score).arg(member).ignore();
                },
                KvOp::IndexRemove { index, member } => {
                    pipe.cmd("ZREM").arg(index).arg(member).ignore();
                },
            }
        }
        let () = pipe
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, "MULTI"))?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl).max(1))
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, "SET NX"))?;
        Ok(reply.is_some())
    }

    async fn delete_if_equals(&self, key: &str, value: &[u8]) -> Result<bool, StorageError> {
        let deleted: i64 = self
            .release_script
            .key(key)
            .arg(value)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, "compare-and-delete"))?;
        Ok(deleted == 1)
    }

    async fn index_range(
        &self,
        index: &str,
        max_score_exclusive: i64,
        limit: usize,
    ) -> Result<Vec<String>, StorageError> {
        ::redis::cmd("ZRANGEBYSCORE")
            .arg(index)
            .arg("-inf")
            .arg(format!("({max_score_exclusive}"))
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, "ZRANGEBYSCORE"))
    }

    async fn index_remove(
        &self,
        index: &str,
        members: &[String],
    ) -> Result<Vec<String>, StorageError> {
        if members.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = ::redis::pipe();
        for member in members {
            pipe.cmd("ZREM").arg(index).arg(member);
        }
        let removed: Vec<i64> = pipe
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, "ZREM"))?;
        Ok(members
            .iter()
            .zip(removed)
            .filter(|(_, n)| *n == 1)
            .map(|(member, _)| member.clone())
            .collect())
    }

    fn supports_cas(&self) -> bool {
        true
    }

    async fn apply_if_version(
        &self,
        version_key: &str,
        expected: Option<u64>,
        ops: &[KvOp],
        ttl: Duration,
    ) -> Result<CasOutcome, StorageError> {
        let mut invocation = self.cas_script.prepare_invoke();
        invocation
            .key(version_key)
            .arg(expected.map(|v| v.to_string()).unwrap_or_default())
            .arg(ttl_millis(ttl));
        for op in ops {
            match op {
                KvOp::Put { key, value } => {
                    invocation.key(key).arg("P").arg(value.as_slice()).arg("");
                },
                KvOp::Delete { key } => {
                    invocation.key(key).arg("D").arg("").arg("");
                },
                KvOp::IndexAdd {
                    index,
                    member,
                    score,
                } => {
                    invocation.key(index).arg("ZA").arg(member).arg(*score);
                },
                KvOp::IndexRemove { index, member } => {
                    invocation.key(index).arg("ZR").arg(member).arg("");
                },
            }
        }

        let (status, actual): (i64, i64) = invocation
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, "versioned batch"))?;

        Ok(match status {
            1 => CasOutcome::Applied,
            0 => CasOutcome::Mismatch {
                actual: u64::try_from(actual).ok(),
            },
            _ => CasOutcome::Mismatch { actual: None },
        })
    }
}

/// Integration tests against a real Redis instance.
///
/// Require a running Redis (default `redis://127.0.0.1:6379`, override with
/// `REDIS_URL`). Run with:
///
/// ```bash
/// cargo test --features redis-tests -- redis_
/// ```
///
/// Each test uses a UUID key prefix, so tests do not interfere.
#[cfg(all(test, feature = "redis-tests"))]
mod integration_tests {
    use super::*;
    use crate::domain::{TaskId, TaskStatus, Transition};
    use crate::error::TaskError;
    use crate::store::kv::KvTaskStore;
    use crate::store::TaskStore;

    async fn test_backend() -> RedisBackend {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        RedisBackend::new(&url)
            .await
            .expect("Redis connection failed -- is Redis running?")
    }

    async fn test_store() -> KvTaskStore<RedisBackend> {
        KvTaskStore::new(test_backend().await)
            .with_prefix(format!("test-{}", uuid::Uuid::new_v4()))
    }

    fn key(name: &str) -> String {
        format!("test-{}:{name}", uuid::Uuid::new_v4())
    }

    #[tokio::test]
    async fn redis_get_many_reads_puts() {
        let backend = test_backend().await;
        let (a, b) = (key("a"), key("b"));
        backend
            .apply(
                &[KvOp::Put {
                    key: a.clone(),
                    value: b"1".to_vec(),
                }],
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        let values = backend.get_many(&[a, b]).await.unwrap();
        assert_eq!(values, vec![Some(b"1".to_vec()), None]);
    }

    #[tokio::test]
    async fn redis_lock_primitives() {
        let backend = test_backend().await;
        let lock = key("lock");
        let ttl = Duration::from_secs(5);
        assert!(backend.set_if_absent(&lock, b"me", ttl).await.unwrap());
        assert!(!backend.set_if_absent(&lock, b"you", ttl).await.unwrap());
        assert!(!backend.delete_if_equals(&lock, b"you").await.unwrap());
        assert!(backend.delete_if_equals(&lock, b"me").await.unwrap());
    }

    #[tokio::test]
    async fn redis_apply_if_version_checks_version() {
        let backend = test_backend().await;
        let version = key("version");
        let put = |v: &str| KvOp::Put {
            key: version.clone(),
            value: v.as_bytes().to_vec(),
        };
        let ttl = Duration::from_secs(60);

        let created = backend
            .apply_if_version(&version, None, &[put("0")], ttl)
            .await
            .unwrap();
        assert_eq!(created, CasOutcome::Applied);

        let again = backend
            .apply_if_version(&version, None, &[put("0")], ttl)
            .await
            .unwrap();
        assert_eq!(again, CasOutcome::Mismatch { actual: Some(0) });

        let stale = backend
            .apply_if_version(&version, Some(5), &[put("6")], ttl)
            .await
            .unwrap();
        assert_eq!(stale, CasOutcome::Mismatch { actual: Some(0) });

        let missing = backend
            .apply_if_version(&key("other"), Some(0), &[], ttl)
            .await
            .unwrap();
        assert_eq!(missing, CasOutcome::Mismatch { actual: None });
    }

    #[tokio::test]
    async fn redis_index_claims_are_exclusive() {
        let backend = test_backend().await;
        let index = key("idx");
        backend
            .apply(
                &[
                    KvOp::IndexAdd {
                        index: index.clone(),
                        member: "a".to_string(),
                        score: 10,
                    },
                    KvOp::IndexAdd {
                        index: index.clone(),
                        member: "b".to_string(),
                        score: 20,
                    },
                ],
                Duration::ZERO,
            )
            .await
            .unwrap();

        let below = backend.index_range(&index, 20, 10).await.unwrap();
        assert_eq!(below, vec!["a".to_string()]);
        let members = vec!["a".to_string(), "b".to_string()];
        assert_eq!(backend.index_remove(&index, &members).await.unwrap(), members);
        assert!(backend.index_remove(&index, &members).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn redis_store_lifecycle() {
        let store = test_store().await;
        let id = TaskId::new();
        store.create(&id, Some(b"ping".to_vec())).await.unwrap();
        assert!(matches!(
            store.create(&id, None).await,
            Err(TaskError::AlreadyExists { .. })
        ));

        assert_eq!(store.transition(&id, 0, Transition::Start).await.unwrap(), 1);
        assert!(matches!(
            store.transition(&id, 0, Transition::Start).await,
            Err(TaskError::ConcurrentModification {
                actual_version: Some(1),
                ..
            })
        ));
        assert!(matches!(
            store.transition(&id, 1, Transition::Cancel).await,
            Err(TaskError::InvalidTransition { .. })
        ));
        let version = store
            .transition(
                &id,
                1,
                Transition::Complete {
                    result: b"pong".to_vec(),
                },
            )
            .await
            .unwrap();
        assert_eq!(version, 2);

        let record = store.load(&id).await.unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.result.as_deref(), Some(&b"pong"[..]));

        let later = chrono::Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(store.delete_expired(later).await.unwrap(), 1);
        assert!(matches!(
            store.load(&id).await,
            Err(TaskError::NotFound { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn redis_store_race_has_one_winner() {
        let store = std::sync::Arc::new(test_store().await);
        let id = TaskId::new();
        store.create(&id, None).await.unwrap();

        let racers = (0..8).map(|_| {
            let store = store.clone();
            let id = id.clone();
            tokio::spawn(async move { store.transition(&id, 0, Transition::Start).await })
        });
        let results = futures::future::join_all(racers).await;
        let wins = results
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(_))))
            .count();
        assert_eq!(wins, 1);
    }
}
