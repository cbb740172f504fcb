//! In-memory key-value backend.
//!
//! [`InMemoryKvBackend`] provides a thread-safe [`KeyValueBackend`] and
//! [`Publisher`] using [`DashMap`]s for hashes, plain keys, ordered
//! collections and counters. It is a dumb store with no path logic.
//!
//! Besides local runs it is the backend the test-suite drives: it records
//! every published message and counts accepted writes, and it can be told to
//! fail writes to exercise error reporting.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use task_logger::store::memory::InMemoryKvBackend;
//!
//! let backend = Arc::new(InMemoryKvBackend::new());
//! assert_eq!(backend.write_count(), 0);
//! assert!(backend.published().is_empty());
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::store::backend::{KeyValueBackend, OrderedEntry, Publisher, Shadowed, StorageError};

/// Thread-safe in-memory backend using [`DashMap`].
#[derive(Debug, Default)]
pub struct InMemoryKvBackend {
    hashes: DashMap<String, HashMap<String, String>>,
    scalars: DashMap<String, String>,
    ordered: DashMap<String, BTreeMap<u64, String>>,
    counters: DashMap<String, u64>,
    published: Mutex<Vec<(String, String)>>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl InMemoryKvBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of write operations accepted so far (publishes excluded).
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Every `(channel, message)` published so far, in order.
    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().clone()
    }

    /// Removes and returns the published messages.
    pub fn drain_published(&self) -> Vec<(String, String)> {
        std::mem::take(&mut *self.published.lock())
    }

    /// Makes every subsequent write and publish fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of the hash at `key`.
    pub fn hash(&self, key: &str) -> HashMap<String, String> {
        self.hashes
            .get(key)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Snapshot of the plain value at `key`.
    pub fn scalar(&self, key: &str) -> Option<String> {
        self.scalars.get(key).map(|entry| entry.value().clone())
    }

    fn accept_write(&self, key: &str) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend {
                message: format!("write rejected for key {key}"),
                source: None,
            });
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn clear_shadowed(&self, shadowed: &[Shadowed]) {
        for entry in shadowed {
            match entry {
                Shadowed::Key(key) => {
                    self.hashes.remove(key);
                    self.scalars.remove(key);
                },
                Shadowed::Field { key, field } => {
                    let emptied = self.hashes.get_mut(key).is_some_and(|mut hash| {
                        hash.remove(field);
                        hash.is_empty()
                    });
                    if emptied {
                        self.hashes.remove(key);
                    }
                },
            }
        }
    }
}

#[async_trait]
impl KeyValueBackend for InMemoryKvBackend {
    async fn append_ordered(
        &self,
        collection_key: &str,
        counter_key: &str,
        member: &str,
    ) -> Result<u64, StorageError> {
        self.accept_write(collection_key)?;
        let sequence = {
            let mut counter = self.counters.entry(counter_key.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };
        self.ordered
            .entry(collection_key.to_string())
            .or_default()
            .insert(sequence, member.to_string());
        Ok(sequence)
    }

    async fn write_hash(
        &self,
        key: &str,
        fields: &[(String, String)],
        replace: bool,
        shadowed: &[Shadowed],
    ) -> Result<(), StorageError> {
        self.accept_write(key)?;
        self.clear_shadowed(shadowed);
        let mut entry = self.hashes.entry(key.to_string()).or_default();
        if replace {
            entry.clear();
        }
        for (field, value) in fields {
            entry.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn write_scalar(
        &self,
        key: &str,
        value: &str,
        shadowed: &[Shadowed],
    ) -> Result<(), StorageError> {
        self.accept_write(key)?;
        self.clear_shadowed(shadowed);
        self.scalars.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn read_hash(&self, key: &str) -> Result<HashMap<String, String>, StorageError> {
        Ok(self.hash(key))
    }

    async fn read_hash_field(
        &self,
        key: &str,
        field: &str,
    ) -> Result<Option<String>, StorageError> {
        Ok(self
            .hashes
            .get(key)
            .and_then(|entry| entry.value().get(field).cloned()))
    }

    async fn read_scalar(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.scalar(key))
    }

    async fn read_ordered(
        &self,
        collection_key: &str,
        after: u64,
    ) -> Result<Vec<OrderedEntry>, StorageError> {
        Ok(self
            .ordered
            .get(collection_key)
            .map(|entry| {
                entry
                    .value()
                    .range(after.saturating_add(1)..)
                    .map(|(sequence, member)| OrderedEntry {
                        sequence: *sequence,
                        member: member.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self
            .hashes
            .iter()
            .map(|e| e.key().clone())
            .chain(self.scalars.iter().map(|e| e.key().clone()))
            .chain(self.ordered.iter().map(|e| e.key().clone()))
            .chain(self.counters.iter().map(|e| e.key().clone()))
            .filter(|key| key.starts_with(prefix))
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn delete_tree(&self, key: &str) -> Result<usize, StorageError> {
        self.accept_write(key)?;
        let nested = format!("{key}:");
        let matches = |k: &String| k == key || k.starts_with(&nested);
        let mut removed = 0;
        for doomed in self.list_keys(key).await? {
            if !matches(&doomed) {
                continue;
            }
            let hit = self.hashes.remove(&doomed).is_some()
                | self.scalars.remove(&doomed).is_some()
                | self.ordered.remove(&doomed).is_some()
                | self.counters.remove(&doomed).is_some();
            if hit {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl Publisher for InMemoryKvBackend {
    async fn publish(&self, channel: &str, message: &str) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend {
                message: format!("publish rejected on channel {channel}"),
                source: None,
            });
        }
        self.published
            .lock()
            .push((channel.to_string(), message.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn append_ordered_keeps_duplicates_in_sequence() {
        let backend = InMemoryKvBackend::new();
        let a = backend.append_ordered("c", "c:seq", "same").await.unwrap();
        let b = backend.append_ordered("c", "c:seq", "same").await.unwrap();
        assert_eq!((a, b), (1, 2));

        let entries = backend.read_ordered("c", 0).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(backend.read_ordered("c", 1).await.unwrap()[0].sequence, 2);
    }

    #[tokio::test]
    async fn write_hash_replace_drops_old_fields() {
        let backend = InMemoryKvBackend::new();
        let a = vec![("a".to_string(), "1".to_string())];
        let b = vec![("b".to_string(), "2".to_string())];
        backend.write_hash("k", &a, false, &[]).await.unwrap();
        backend.write_hash("k", &b, false, &[]).await.unwrap();
        assert_eq!(backend.hash("k").len(), 2);

        backend.write_hash("k", &b, true, &[]).await.unwrap();
        assert_eq!(backend.hash("k").len(), 1);
        assert_eq!(backend.write_count(), 3);
    }

    #[tokio::test]
    async fn shadowed_entries_go_with_the_write() {
        let backend = InMemoryKvBackend::new();
        let object = vec![("a".to_string(), "1".to_string())];
        backend.write_hash("r:data", &object, true, &[]).await.unwrap();
        let scalar = vec![("data".to_string(), "x".to_string())];
        let shadowed = [Shadowed::Key("r:data".to_string())];
        backend.write_hash("r", &scalar, false, &shadowed).await.unwrap();
        assert!(backend.hash("r:data").is_empty());
        assert_eq!(backend.hash("r").get("data").map(String::as_str), Some("x"));

        let shadowed = [Shadowed::Field {
            key: "r".to_string(),
            field: "data".to_string(),
        }];
        backend.write_hash("r:data", &object, true, &shadowed).await.unwrap();
        assert!(backend.hash("r").is_empty());
        assert_eq!(backend.write_count(), 3);
    }

    #[tokio::test]
    async fn delete_tree_respects_segment_boundaries() {
        let backend = InMemoryKvBackend::new();
        backend.write_scalar("r:steps:a", "1", &[]).await.unwrap();
        backend.write_scalar("r:steps:a:logs", "1", &[]).await.unwrap();
        backend.write_scalar("r:steps:ab", "1", &[]).await.unwrap();

        let removed = backend.delete_tree("r:steps:a").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(backend.scalar("r:steps:ab").as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn failing_backend_rejects_writes() {
        let backend = InMemoryKvBackend::new();
        backend.set_fail_writes(true);
        assert!(backend.write_scalar("k", "v", &[]).await.is_err());
        assert!(backend.publish("ch", "m").await.is_err());
        assert_eq!(backend.write_count(), 0);
    }
}
