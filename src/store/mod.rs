//! Backend-agnostic hierarchical storage references.
//!
//! Lifecycle code never talks to a store directly. It holds a
//! [`StorageRef`] bound to one logical path and navigates with
//! [`child`](StorageRef::child). Every implementation behaves the same way
//! from the caller's point of view:
//!
//! | Implementation | Store |
//! |----------------|-------|
//! | [`kv::KeyValueRef`] | flat key-value store via the [`strategy`] chain |
//! | [`document::DocumentRef`] | hierarchical realtime document store |
//! | [`pubsub::PubSubRef`] | decorator mirroring writes to a [`Publisher`] |
//! | [`NullRef`] | discards everything |
//!
//! References do not gate writes: checking the task's fatal and finished
//! flags is the caller's job.
//!
//! # Watchers
//!
//! [`watch`](StorageRef::watch) registers a callback for *local* writes on
//! one exact path. Watchers are kept in a [`WatchRegistry`] shared by every
//! reference derived from the same root, so a watcher registered through one
//! reference object fires when another object for the same path writes.

pub mod backend;
pub mod document;
pub mod kv;
pub mod memory;
pub mod pubsub;
#[cfg(feature = "redis")]
pub mod redis;
pub mod strategy;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;

pub use backend::{KeyValueBackend, Publisher, StorageError};

/// Callback invoked with the new value after a local write to a watched path.
///
/// The returned future is awaited by the writing call before it returns, so
/// mirroring writes performed by a watcher are ordered after the write that
/// triggered them.
pub type WatchCallback = Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wraps an async closure into a [`WatchCallback`].
///
/// # Examples
///
/// ```
/// use task_logger::store::watcher;
///
/// let callback = watcher(|value| async move {
///     tracing::debug!(%value, "status changed");
/// });
/// # let _ = callback;
/// ```
pub fn watcher<F, Fut>(f: F) -> WatchCallback
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |value| f(value).boxed())
}

/// Which write operation produced a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Append as a new ordered entry.
    Push,
    /// Replace the value at the path.
    Set,
    /// Merge into the value at the path.
    Update,
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Push => write!(f, "push"),
            Self::Set => write!(f, "set"),
            Self::Update => write!(f, "update"),
        }
    }
}

/// Identifies an accepted write for later correlation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    /// Dot-separated logical path of the written value, relative to the task
    /// root.
    pub slot: String,
    /// Sequence id in the task's ordered feed, when the write joined it.
    pub sequence: Option<u64>,
}

impl WriteReceipt {
    /// Receipt for a write outside the ordered feed.
    pub fn unsequenced(slot: impl Into<String>) -> Self {
        Self {
            slot: slot.into(),
            sequence: None,
        }
    }
}

/// A capability bound to one logical path inside a store.
#[async_trait]
pub trait StorageRef: Send + Sync + fmt::Debug {
    /// Returns a reference one level deeper. Pure, no I/O.
    fn child(&self, name: &str) -> Arc<dyn StorageRef>;

    /// Path segments below the task root.
    fn path(&self) -> &[String];

    /// Appends `value` as a new ordered entry at this path.
    async fn push(&self, value: Value) -> Result<WriteReceipt, StorageError>;

    /// Replaces the value at this path.
    async fn set(&self, value: Value) -> Result<WriteReceipt, StorageError>;

    /// Merges `value` into the value at this path.
    async fn update(&self, value: Value) -> Result<WriteReceipt, StorageError>;

    /// Registers `callback` for local writes landing on this exact path.
    fn watch(&self, callback: WatchCallback);

    /// Drops every callback registered on this exact path.
    fn unwatch(&self);

    /// Fully qualified reference string clients can resolve against the
    /// backend.
    fn reference(&self) -> String;

    /// Flat field map stored at this path.
    async fn get_hash(&self) -> Result<HashMap<String, String>, StorageError>;

    /// Known child references. Best-effort.
    async fn children(&self) -> Result<Vec<Arc<dyn StorageRef>>, StorageError>;

    /// Reads the value at this path.
    async fn get(&self) -> Result<Option<Value>, StorageError>;

    /// Deletes this path and everything below it.
    async fn remove(&self) -> Result<(), StorageError>;

    /// Dot-separated logical path below the task root.
    fn slot(&self) -> String {
        slot_of(self.path())
    }
}

/// Joins path segments into a slot string.
///
/// # Examples
///
/// ```
/// use task_logger::store::slot_of;
///
/// let path = vec!["steps".to_string(), "build".to_string(), "logs".to_string()];
/// assert_eq!(slot_of(&path), "steps.build.logs");
/// ```
pub fn slot_of(path: &[String]) -> String {
    path.join(".")
}

/// Returns `path` extended by one segment.
pub(crate) fn extend_path(path: &[String], name: &str) -> Vec<String> {
    let mut next = Vec::with_capacity(path.len() + 1);
    next.extend_from_slice(path);
    next.push(name.to_string());
    next
}

/// Watchers keyed by slot, shared by every reference derived from one root.
#[derive(Default)]
pub struct WatchRegistry {
    watchers: Mutex<HashMap<String, Vec<WatchCallback>>>,
}

impl fmt::Debug for WatchRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let watchers = self.watchers.lock();
        f.debug_struct("WatchRegistry")
            .field("slots", &watchers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl WatchRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for `slot`.
    pub fn register(&self, slot: String, callback: WatchCallback) {
        self.watchers.lock().entry(slot).or_default().push(callback);
    }

    /// Drops every watcher of `slot`.
    pub fn clear(&self, slot: &str) {
        self.watchers.lock().remove(slot);
    }

    /// Number of watchers registered on `slot`.
    pub fn count(&self, slot: &str) -> usize {
        self.watchers.lock().get(slot).map_or(0, Vec::len)
    }

    /// Runs every watcher of `slot` with `value`, in registration order.
    pub async fn notify(&self, slot: &str, value: &Value) {
        let callbacks: Vec<WatchCallback> = match self.watchers.lock().get(slot) {
            Some(callbacks) => callbacks.clone(),
            None => return,
        };
        for callback in callbacks {
            callback(value.clone()).await;
        }
    }
}

/// A reference that accepts every call and stores nothing.
///
/// Inert step handles are bound to one so that nothing they do can reach a
/// backend.
#[derive(Debug, Clone, Default)]
pub struct NullRef {
    path: Vec<String>,
}

impl NullRef {
    /// Creates a null reference at the root.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageRef for NullRef {
    fn child(&self, name: &str) -> Arc<dyn StorageRef> {
        Arc::new(Self {
            path: extend_path(&self.path, name),
        })
    }

    fn path(&self) -> &[String] {
        &self.path
    }

    async fn push(&self, _value: Value) -> Result<WriteReceipt, StorageError> {
        Ok(WriteReceipt::unsequenced(self.slot()))
    }

    async fn set(&self, _value: Value) -> Result<WriteReceipt, StorageError> {
        Ok(WriteReceipt::unsequenced(self.slot()))
    }

    async fn update(&self, _value: Value) -> Result<WriteReceipt, StorageError> {
        Ok(WriteReceipt::unsequenced(self.slot()))
    }

    fn watch(&self, _callback: WatchCallback) {}

    fn unwatch(&self) {}

    fn reference(&self) -> String {
        String::new()
    }

    async fn get_hash(&self) -> Result<HashMap<String, String>, StorageError> {
        Ok(HashMap::new())
    }

    async fn children(&self) -> Result<Vec<Arc<dyn StorageRef>>, StorageError> {
        Ok(Vec::new())
    }

    async fn get(&self) -> Result<Option<Value>, StorageError> {
        Ok(None)
    }

    async fn remove(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
