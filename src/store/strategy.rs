//! Key-mapping strategy chain for flat key-value stores.
//!
//! A write at `root + [seg1, .., segN]` is planned into one concrete
//! [`KvOp`] by the first strategy of the chain that accepts it:
//!
//! 1. [`OrderedAppendStrategy`] accepts paths whose final segment is a
//!    stream field (`logs`, `memory`, `cpu` by default). The value is wrapped
//!    as `{"slot": "seg1.….segN", "payload": value}` and appended to the
//!    task's single consolidated collection, so every step's logs and
//!    metrics share one globally ordered feed.
//! 2. [`HashSetStrategy`] accepts everything else. Objects become hash
//!    writes at `root:seg1:…:segN`; a scalar is folded into the parent hash
//!    as `{segN: value}`; a scalar at the root itself becomes a plain key.
//!    A `set` also clears the other shape, so the value it replaced cannot
//!    be read back.
//!
//! # Key Schema
//!
//! | Key Pattern | Type | Purpose |
//! |-------------|------|---------|
//! | `{root}:consolidated` | Sorted Set | Ordered log and metric feed |
//! | `{root}:consolidated:seq` | String (u64) | Feed sequence counter |
//! | `{root}:steps:{name}` | Hash | Step fields (`status`, timestamps, …) |
//! | `{root}:stepsReferences` | Hash | `name -> status` restore index |
//! | `{root}` | String | Scalar written at the task root |
//!
//! where `{root}` is `{key_root}:{accountId}:{jobId}`.
//!
//! Planning is pure; [`KeyValueRef`](crate::store::kv::KeyValueRef)
//! executes the returned operation.

use std::collections::HashSet;
use std::fmt;

use serde_json::{json, Value};

use crate::constants::{CONSOLIDATED_KEY, DEFAULT_STREAM_FIELDS};
use crate::store::backend::{join_key, Shadowed, StorageError};
use crate::store::{slot_of, WriteMode};

/// Set of path segments treated as append-only streams.
///
/// # Examples
///
/// ```
/// use task_logger::store::strategy::StreamFields;
///
/// let fields = StreamFields::default();
/// let logs: Vec<String> = vec!["steps".to_string(), "build".to_string(), "logs".to_string()];
/// let status: Vec<String> = vec!["steps".to_string(), "build".to_string(), "status".to_string()];
/// assert!(fields.is_stream_path(&logs));
/// assert!(!fields.is_stream_path(&status));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFields(HashSet<String>);

impl StreamFields {
    /// Builds a set from the given segment names.
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(fields.into_iter().map(Into::into).collect())
    }

    /// Returns `true` if `segment` is a stream field.
    pub fn contains(&self, segment: &str) -> bool {
        self.0.contains(segment)
    }

    /// Returns `true` if the final segment of `path` is a stream field.
    pub fn is_stream_path(&self, path: &[String]) -> bool {
        path.last().is_some_and(|segment| self.contains(segment))
    }
}

impl Default for StreamFields {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_FIELDS.iter().copied())
    }
}

/// A concrete operation on a flat store.
#[derive(Debug, Clone, PartialEq)]
pub enum KvOp {
    /// Append `record` to the ordered collection, scored by the next value
    /// of `counter_key`.
    AppendOrdered {
        /// Sorted-set key of the consolidated feed.
        collection_key: String,
        /// Counter key driving the sequence.
        counter_key: String,
        /// `{slot, payload}` record.
        record: Value,
    },
    /// Write fields into the hash at `key`.
    WriteHash {
        /// Hash key.
        key: String,
        /// Field/value pairs, values already encoded.
        fields: Vec<(String, String)>,
        /// Drop fields not listed in `fields`.
        replace: bool,
        /// Entries removed along with the write.
        shadowed: Vec<Shadowed>,
    },
    /// Write a plain value at `key`.
    WriteScalar {
        /// Key.
        key: String,
        /// Encoded value.
        value: String,
        /// Entries removed along with the write.
        shadowed: Vec<Shadowed>,
    },
}

/// One link of the chain.
pub trait KeyStrategy: Send + Sync + fmt::Debug {
    /// Plans the write, or returns `None` when this strategy does not apply.
    fn plan(&self, root: &str, path: &[String], value: &Value, mode: WriteMode) -> Option<KvOp>;
}

/// Appends stream writes to the per-task consolidated feed.
#[derive(Debug, Clone, Default)]
pub struct OrderedAppendStrategy {
    fields: StreamFields,
}

impl OrderedAppendStrategy {
    /// Creates the strategy for the given stream fields.
    pub fn new(fields: StreamFields) -> Self {
        Self { fields }
    }
}

impl KeyStrategy for OrderedAppendStrategy {
    fn plan(&self, root: &str, path: &[String], value: &Value, _mode: WriteMode) -> Option<KvOp> {
        if !self.fields.is_stream_path(path) {
            return None;
        }
        Some(KvOp::AppendOrdered {
            collection_key: consolidated_key(root),
            counter_key: counter_key(root),
            record: json!({ "slot": slot_of(path), "payload": value }),
        })
    }
}

/// Fallback: hash fields for records, plain keys for scalars.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashSetStrategy;

impl KeyStrategy for HashSetStrategy {
    fn plan(&self, root: &str, path: &[String], value: &Value, mode: WriteMode) -> Option<KvOp> {
        let set = mode == WriteMode::Set;
        let key = join_key(root, path);
        match value {
            Value::Object(map) => {
                let shadowed = match path.split_last() {
                    Some((field, parent)) if set => vec![Shadowed::Field {
                        key: join_key(root, parent),
                        field: field.clone(),
                    }],
                    None if set => vec![Shadowed::Key(key.clone())],
                    _ => Vec::new(),
                };
                Some(KvOp::WriteHash {
                    key,
                    fields: map
                        .iter()
                        .map(|(field, v)| (field.clone(), encode_value(v)))
                        .collect(),
                    replace: set,
                    shadowed,
                })
            },
            scalar => {
                let shadowed = if set {
                    vec![Shadowed::Key(key.clone())]
                } else {
                    Vec::new()
                };
                match path.split_last() {
                    Some((field, parent)) => Some(KvOp::WriteHash {
                        key: join_key(root, parent),
                        fields: vec![(field.clone(), encode_value(scalar))],
                        replace: false,
                        shadowed,
                    }),
                    None => Some(KvOp::WriteScalar {
                        key,
                        value: encode_value(scalar),
                        shadowed,
                    }),
                }
            },
        }
    }
}

/// Ordered list of strategies; the first applicable one wins.
#[derive(Debug)]
pub struct StrategyChain {
    strategies: Vec<Box<dyn KeyStrategy>>,
}

impl StrategyChain {
    /// Builds a chain from explicit strategies.
    pub fn new(strategies: Vec<Box<dyn KeyStrategy>>) -> Self {
        Self { strategies }
    }

    /// The standard chain: ordered-append for `fields`, then hash-set.
    pub fn standard(fields: StreamFields) -> Self {
        Self::new(vec![
            Box::new(OrderedAppendStrategy::new(fields)),
            Box::new(HashSetStrategy),
        ])
    }

    /// Plans a write.
    ///
    /// # Errors
    ///
    /// [`StorageError::Backend`] if no strategy applies, which only happens
    /// for a chain built without a fallback.
    pub fn plan(
        &self,
        root: &str,
        path: &[String],
        value: &Value,
        mode: WriteMode,
    ) -> Result<KvOp, StorageError> {
        self.strategies
            .iter()
            .find_map(|strategy| strategy.plan(root, path, value, mode))
            .ok_or_else(|| StorageError::Backend {
                message: format!("no key strategy accepts {mode} at {}", join_key(root, path)),
                source: None,
            })
    }
}

impl Default for StrategyChain {
    fn default() -> Self {
        Self::standard(StreamFields::default())
    }
}

/// Key of the task's consolidated feed.
pub fn consolidated_key(root: &str) -> String {
    format!("{root}:{CONSOLIDATED_KEY}")
}

/// Key of the consolidated feed's sequence counter.
pub fn counter_key(root: &str) -> String {
    format!("{root}:{CONSOLIDATED_KEY}:seq")
}

/// Encodes a value for storage in a flat field.
///
/// Strings are stored verbatim unless their text would itself parse as
/// JSON (`"true"`, `"42"`, `"{}"`); those, and every non-string value, are
/// stored as JSON so [`decode_value`] gets the original back.
///
/// ```
/// use serde_json::json;
/// use task_logger::store::strategy::{decode_value, encode_value};
///
/// assert_eq!(encode_value(&json!("running")), "running");
/// assert_eq!(encode_value(&json!("42")), r#""42""#);
/// assert_eq!(decode_value(&encode_value(&json!("42"))), json!("42"));
/// assert_eq!(decode_value(&encode_value(&json!(42))), json!(42));
/// ```
pub fn encode_value(value: &Value) -> String {
    match value {
        Value::String(s) if serde_json::from_str::<Value>(s).is_err() => s.clone(),
        other => other.to_string(),
    }
}

/// Reverses [`encode_value`]: JSON text is parsed, anything else is the
/// string itself.
pub fn decode_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Text form of an encoded field, as [`StorageRef::get_hash`] reports it:
/// strings bare, everything else as JSON.
///
/// [`StorageRef::get_hash`]: crate::store::StorageRef::get_hash
pub fn field_text(raw: &str) -> String {
    match decode_value(raw) {
        Value::String(s) => s,
        other => other.to_string(),
    }
}
