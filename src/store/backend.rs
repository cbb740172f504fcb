//! Low-level key-value backend trait and supporting types.
//!
//! The [`KeyValueBackend`] trait is the contract every flat store implements.
//! It exposes the primitive operations the key-mapping chain plans for:
//! an atomic ordered append, hash writes, scalar writes, reads, key scans,
//! and prefix deletes. [`Publisher`] is the notification side used by the
//! fan-out decorator.
//!
//! Path interpretation (which segment is a stream, how scalars fold into
//! hashes) does **not** belong here. Backends are dumb stores; the mapping
//! lives in [`strategy`](crate::store::strategy) and
//! [`KeyValueRef`](crate::store::kv::KeyValueRef).
//!
//! # Ordered collections
//!
//! [`append_ordered`](KeyValueBackend::append_ordered) increments a counter
//! and inserts the member scored by the new counter value in one atomic
//! step, so sequence ids are strictly increasing across every writer of the
//! same collection.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;

/// Errors that can occur during raw storage operations.
///
/// # Examples
///
/// ```
/// use task_logger::store::backend::StorageError;
///
/// let err = StorageError::NotFound { key: "build-logs:a:j".to_string() };
/// assert!(err.to_string().contains("build-logs:a:j"));
/// ```
#[derive(Debug)]
pub enum StorageError {
    /// The requested key or path does not exist.
    NotFound {
        /// The key that was not found.
        key: String,
    },

    /// The backend refused the credentials.
    Auth {
        /// Human-readable description of the failure.
        message: String,
    },

    /// A value could not be encoded or decoded.
    Serialization {
        /// Human-readable description of the failure.
        message: String,
    },

    /// An I/O or backend-specific error occurred (network failure, timeout,
    /// unexpected response).
    Backend {
        /// Human-readable description of the error.
        message: String,
        /// The underlying error, if available. Accessible via
        /// [`std::error::Error::source()`].
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { key } => write!(f, "key not found: {key}"),
            Self::Auth { message } => write!(f, "authentication failed: {message}"),
            Self::Serialization { message } => write!(f, "serialization error: {message}"),
            Self::Backend { message, .. } => write!(f, "backend error: {message}"),
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

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

/// One entry of an ordered collection, with its sequence id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedEntry {
    /// Sequence id assigned at append time.
    pub sequence: u64,
    /// The stored member.
    pub member: String,
}

/// A stored value that a `set` replaces without writing to it.
///
/// Setting an object at `a:b` stores a hash at `a:b`, while setting a scalar
/// there stores field `b` of the hash at `a`. Whichever shape is written, the
/// other one must go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shadowed {
    /// Whatever is stored at this key.
    Key(String),
    /// One field of a hash.
    Field {
        /// Hash key.
        key: String,
        /// Field name.
        field: String,
    },
}

/// Flat key-value store with list, hash, scalar and sorted-set primitives.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; one backend is shared by every
/// reference of every task opened against it.
#[async_trait]
pub trait KeyValueBackend: Send + Sync + fmt::Debug {
    /// Atomically increments `counter_key` and inserts `member` into the
    /// ordered collection at `collection_key`, scored by the new counter
    /// value. Returns that value.
    ///
    /// Identical members appended twice must both be kept.
    async fn append_ordered(
        &self,
        collection_key: &str,
        counter_key: &str,
        member: &str,
    ) -> Result<u64, StorageError>;

    /// Writes `fields` into the hash at `key`. With `replace`, existing
    /// fields not present in `fields` are dropped first. Every `shadowed`
    /// entry is removed in the same operation, before the write.
    async fn write_hash(
        &self,
        key: &str,
        fields: &[(String, String)],
        replace: bool,
        shadowed: &[Shadowed],
    ) -> Result<(), StorageError>;

    /// Writes a plain string value at `key`, removing `shadowed` first.
    async fn write_scalar(
        &self,
        key: &str,
        value: &str,
        shadowed: &[Shadowed],
    ) -> Result<(), StorageError>;

    /// Reads every field of the hash at `key`. Missing keys read as empty.
    async fn read_hash(&self, key: &str) -> Result<HashMap<String, String>, StorageError>;

    /// Reads one field of the hash at `key`.
    async fn read_hash_field(&self, key: &str, field: &str)
        -> Result<Option<String>, StorageError>;

    /// Reads the plain value at `key`.
    async fn read_scalar(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Reads the entries of an ordered collection whose sequence is greater
    /// than `after`, in sequence order.
    async fn read_ordered(
        &self,
        collection_key: &str,
        after: u64,
    ) -> Result<Vec<OrderedEntry>, StorageError>;

    /// Lists every key that starts with `prefix`.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Deletes `key` and every key starting with `key:`. Returns how many
    /// keys were removed.
    async fn delete_tree(&self, key: &str) -> Result<usize, StorageError>;
}

/// Notification channel used by the fan-out decorator.
#[async_trait]
pub trait Publisher: Send + Sync + fmt::Debug {
    /// Publishes `message` on `channel`. Delivery is best-effort.
    async fn publish(&self, channel: &str, message: &str) -> Result<(), StorageError>;
}

/// Joins key segments with the `:` separator used by flat stores.
///
/// # Examples
///
/// ```
/// use task_logger::store::backend::join_key;
///
/// assert_eq!(join_key("build-logs:a:j", &["steps", "build"]), "build-logs:a:j:steps:build");
/// assert_eq!(join_key("build-logs:a:j", &[] as &[&str]), "build-logs:a:j");
/// ```
pub fn join_key<S: AsRef<str>>(root: &str, segments: &[S]) -> String {
    let mut key = root.to_string();
    for segment in segments {
        key.push(':');
        key.push_str(segment.as_ref());
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_error_display() {
        let err = StorageError::Auth {
            message: "bad secret".to_string(),
        };
        assert_eq!(err.to_string(), "authentication failed: bad secret");

        let err = StorageError::Backend {
            message: "connection timeout".to_string(),
            source: None,
        };
        assert_eq!(err.to_string(), "backend error: connection timeout");
    }

    #[test]
    fn storage_error_source_backend_with_source() {
        let inner = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let err = StorageError::Backend {
            message: "db failed".to_string(),
            source: Some(Box::new(inner)),
        };
        let source = std::error::Error::source(&err);
        assert!(source.unwrap().to_string().contains("timed out"));
    }

    #[test]
    fn serde_errors_map_to_serialization() {
        let err: StorageError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, StorageError::Serialization { .. }));
    }
}
