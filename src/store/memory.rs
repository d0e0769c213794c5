//! In-memory key-value backend.
//!
//! [`InMemoryBackend`] keeps the key space behind a single
//! [`parking_lot::RwLock`] so that a [`KvBackend::apply`] batch is visible
//! all at once, and keeps sorted indexes in a [`DashMap`]. Per-key expiry is
//! enforced lazily: expired keys read as absent and are dropped on the next
//! write that touches them, or by [`KvBackend::purge_expired`], which the
//! store's expiry sweep calls on every run.
//!
//! The backend has no native compare-and-swap, so stores built on it take the
//! advisory-lock path.
//!
//! # Examples
//!
//! ```
//! use taskfuture::store::kv::KvTaskStore;
//! use taskfuture::store::memory::InMemoryBackend;
//!
//! let store = KvTaskStore::new(InMemoryBackend::new()).with_prefix("tests");
//! assert_eq!(store.prefix(), "tests");
//! ```

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::store::backend::{KvBackend, KvOp, StorageError};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Vec<u8>, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: (!ttl.is_zero()).then(|| Instant::now() + ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Default)]
struct SortedIndex {
    by_score: BTreeSet<(i64, String)>,
    scores: HashMap<String, i64>,
}

impl SortedIndex {
    fn insert(&mut self, member: &str, score: i64) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.by_score.remove(&(old, member.to_string()));
        }
        self.by_score.insert((score, member.to_string()));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => self.by_score.remove(&(score, member.to_string())),
            None => false,
        }
    }
}

/// Thread-safe in-process [`KvBackend`].
///
/// A zero `ttl` stores keys without expiry.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: RwLock<HashMap<String, Entry>>,
    indexes: DashMap<String, SortedIndex>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys (index entries excluded).
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data.read().values().filter(|e| e.is_live(now)).count()
    }

    /// Returns `true` if no live keys are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of members in `index`.
    pub fn index_len(&self, index: &str) -> usize {
        self.indexes.get(index).map_or(0, |idx| idx.scores.len())
    }
}

#[async_trait]
impl KvBackend for InMemoryBackend {
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, StorageError> {
        let now = Instant::now();
        let data = self.data.read();
        Ok(keys
            .iter()
            .map(|key| {
                data.get(key)
                    .filter(|entry| entry.is_live(now))
                    .map(|entry| entry.value.clone())
            })
            .collect())
    }

    async fn purge_expired(&self) -> Result<usize, StorageError> {
        let now = Instant::now();
        let mut data = self.data.write();
        let before = data.len();
        data.retain(|_, entry| entry.is_live(now));
        Ok(before - data.len())
    }

    async fn apply(&self, ops: &[KvOp], ttl: Duration) -> Result<(), StorageError> {
        let mut data = self.data.write();
        for op in ops {
            match op {
                KvOp::Put { key, value } => {
                    data.insert(key.clone(), Entry::new(value.clone(), ttl));
                },
                KvOp::Delete { key } => {
                    data.remove(key);
                },
                KvOp::IndexAdd {
                    index,
                    member,
                    score,
                } => {
                    self.indexes
                        .entry(index.clone())
                        .or_default()
                        .insert(member, *score);
                },
                KvOp::IndexRemove { index, member } => {
                    if let Some(mut idx) = self.indexes.get_mut(index) {
                        idx.remove(member);
                    }
                },
            }
        }
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        let now = Instant::now();
        let mut data = self.data.write();
        if data.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }
        data.insert(key.to_string(), Entry::new(value.to_vec(), ttl));
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, value: &[u8]) -> Result<bool, StorageError> {
        let now = Instant::now();
        let mut data = self.data.write();
        let matches = data
            .get(key)
            .is_some_and(|entry| entry.is_live(now) && entry.value == value);
        if matches {
            data.remove(key);
        }
        Ok(matches)
    }

    async fn index_range(
        &self,
        index: &str,
        max_score_exclusive: i64,
        limit: usize,
    ) -> Result<Vec<String>, StorageError> {
        Ok(self
            .indexes
            .get(index)
            .map(|idx| {
                idx.by_score
                    .iter()
                    .take_while(|(score, _)| *score < max_score_exclusive)
                    .take(limit)
                    .map(|(_, member)| member.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn index_remove(
        &self,
        index: &str,
        members: &[String],
    ) -> Result<Vec<String>, StorageError> {
        let Some(mut idx) = self.indexes.get_mut(index) else {
            return Ok(Vec::new());
        };
        Ok(members
            .iter()
            .filter(|member| idx.remove(member))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(key: &str, value: &[u8]) -> KvOp {
        KvOp::Put {
            key: key.to_string(),
            value: value.to_vec(),
        }
    }

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn get_many_returns_one_slot_per_key() {
        let backend = InMemoryBackend::new();
        backend
            .apply(&[put("a", b"1"), put("b", b"2")], Duration::ZERO)
            .await
            .unwrap();
        let values = backend.get_many(&keys(&["a", "missing", "b"])).await.unwrap();
        assert_eq!(values, vec![Some(b"1".to_vec()), None, Some(b"2".to_vec())]);
    }

    #[tokio::test]
    async fn apply_deletes_and_overwrites() {
        let backend = InMemoryBackend::new();
        backend.apply(&[put("a", b"1")], Duration::ZERO).await.unwrap();
        backend
            .apply(
                &[
                    put("a", b"2"),
                    put("b", b"3"),
                    KvOp::Delete {
                        key: "b".to_string(),
                    },
                ],
                Duration::ZERO,
            )
            .await
            .unwrap();
        let values = backend.get_many(&keys(&["a", "b"])).await.unwrap();
        assert_eq!(values, vec![Some(b"2".to_vec()), None]);
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn expired_keys_read_as_absent() {
        let backend = InMemoryBackend::new();
        backend
            .apply(&[put("short", b"x")], Duration::from_millis(20))
            .await
            .unwrap();
        backend.apply(&[put("long", b"y")], Duration::ZERO).await.unwrap();
        std::thread::sleep(Duration::from_millis(40));

        let values = backend.get_many(&keys(&["short", "long"])).await.unwrap();
        assert_eq!(values, vec![None, Some(b"y".to_vec())]);
        assert_eq!(backend.purge_expired().await.unwrap(), 1);
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn set_if_absent_and_delete_if_equals() {
        let backend = InMemoryBackend::new();
        let ttl = Duration::from_secs(5);
        assert!(backend.set_if_absent("lock", b"me", ttl).await.unwrap());
        assert!(!backend.set_if_absent("lock", b"you", ttl).await.unwrap());
        assert!(!backend.delete_if_equals("lock", b"you").await.unwrap());
        assert!(backend.delete_if_equals("lock", b"me").await.unwrap());
        assert!(backend.set_if_absent("lock", b"you", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lock_can_be_retaken() {
        let backend = InMemoryBackend::new();
        assert!(backend
            .set_if_absent("lock", b"crashed", Duration::from_millis(10))
            .await
            .unwrap());
        std::thread::sleep(Duration::from_millis(30));
        assert!(backend
            .set_if_absent("lock", b"next", Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn index_range_is_ordered_and_exclusive() {
        let backend = InMemoryBackend::new();
        let ops: Vec<KvOp> = [("c", 30), ("a", 10), ("b", 20)]
            .into_iter()
            .map(|(member, score)| KvOp::IndexAdd {
                index: "idx".to_string(),
                member: member.to_string(),
                score,
            })
            .collect();
        backend.apply(&ops, Duration::ZERO).await.unwrap();

        assert_eq!(backend.index_range("idx", 30, 10).await.unwrap(), keys(&["a", "b"]));
        assert_eq!(backend.index_range("idx", 100, 1).await.unwrap(), keys(&["a"]));
        assert!(backend.index_range("other", 100, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn index_add_rescores_existing_member() {
        let backend = InMemoryBackend::new();
        for score in [50, 5] {
            backend
                .apply(
                    &[KvOp::IndexAdd {
                        index: "idx".to_string(),
                        member: "m".to_string(),
                        score,
                    }],
                    Duration::ZERO,
                )
                .await
                .unwrap();
        }
        assert_eq!(backend.index_len("idx"), 1);
        assert_eq!(backend.index_range("idx", 10, 10).await.unwrap(), keys(&["m"]));
    }

    #[tokio::test]
    async fn index_remove_reports_only_what_it_removed() {
        let backend = InMemoryBackend::new();
        backend
            .apply(
                &[KvOp::IndexAdd {
                    index: "idx".to_string(),
                    member: "a".to_string(),
                    score: 1,
                }],
                Duration::ZERO,
            )
            .await
            .unwrap();
        let first = backend.index_remove("idx", &keys(&["a", "b"])).await.unwrap();
        let second = backend.index_remove("idx", &keys(&["a"])).await.unwrap();
        assert_eq!(first, keys(&["a"]));
        assert!(second.is_empty());
    }
}
