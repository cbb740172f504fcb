//! [`StorageRef`] over a flat [`KeyValueBackend`].
//!
//! Every write is planned by the [`StrategyChain`] and executed as one
//! backend operation. Writes that join the consolidated feed come back with
//! their sequence id; hash and scalar writes do not.
//!
//! ```
//! use std::sync::Arc;
//! use serde_json::json;
//! use task_logger::store::kv::KeyValueRef;
//! use task_logger::store::memory::InMemoryKvBackend;
//! use task_logger::store::StorageRef;
//! use task_logger::TaskInfo;
//!
//! # async fn example() -> Result<(), task_logger::store::StorageError> {
//! let backend = Arc::new(InMemoryKvBackend::new());
//! let root = KeyValueRef::for_task(backend, &TaskInfo::new("A", "J"), "build-logs", Default::default());
//! let logs = root.child("steps").child("build").child("logs");
//! let receipt = logs.push(json!("hello")).await?;
//! assert_eq!(receipt.slot, "steps.build.logs");
//! assert_eq!(receipt.sequence, Some(1));
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::store::backend::{join_key, KeyValueBackend, StorageError};
use crate::store::strategy::{
    consolidated_key, decode_value, field_text, KvOp, StrategyChain, StreamFields,
};
use crate::store::{extend_path, StorageRef, WatchCallback, WatchRegistry, WriteMode, WriteReceipt};
use crate::types::task::TaskInfo;

/// One entry of the consolidated feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedRecord {
    /// Sequence id, strictly increasing within the task.
    #[serde(skip)]
    pub sequence: u64,
    /// Dot-separated path the payload was written to.
    pub slot: String,
    /// The written value.
    pub payload: Value,
}

#[derive(Debug)]
struct KvContext {
    backend: Arc<dyn KeyValueBackend>,
    chain: StrategyChain,
    stream_fields: StreamFields,
    root_key: String,
    watchers: WatchRegistry,
}

/// A path-scoped reference into a key-value store.
#[derive(Debug, Clone)]
pub struct KeyValueRef {
    ctx: Arc<KvContext>,
    path: Vec<String>,
}

impl KeyValueRef {
    /// Creates the root reference of one task: `{key_root}:{accountId}:{jobId}`.
    pub fn for_task(
        backend: Arc<dyn KeyValueBackend>,
        task: &TaskInfo,
        key_root: &str,
        stream_fields: StreamFields,
    ) -> Self {
        let root_key = format!("{key_root}:{}:{}", task.account_id, task.job_id);
        Self::with_chain(
            backend,
            root_key,
            StrategyChain::standard(stream_fields.clone()),
            stream_fields,
        )
    }

    /// Creates a root reference with an explicit strategy chain.
    pub fn with_chain(
        backend: Arc<dyn KeyValueBackend>,
        root_key: impl Into<String>,
        chain: StrategyChain,
        stream_fields: StreamFields,
    ) -> Self {
        Self {
            ctx: Arc::new(KvContext {
                backend,
                chain,
                stream_fields,
                root_key: root_key.into(),
                watchers: WatchRegistry::new(),
            }),
            path: Vec::new(),
        }
    }

    /// Task root key shared by every reference derived from this one.
    pub fn root_key(&self) -> &str {
        &self.ctx.root_key
    }

    /// Full key of this path.
    pub fn key(&self) -> String {
        join_key(&self.ctx.root_key, &self.path)
    }

    /// Replays the task's consolidated feed after sequence `after`, in order.
    ///
    /// # Errors
    ///
    /// Backend read failures, or [`StorageError::Serialization`] for a
    /// member that is not a `{slot, payload}` record.
    pub async fn consolidated_since(
        &self,
        after: u64,
    ) -> Result<Vec<ConsolidatedRecord>, StorageError> {
        let entries = self
            .ctx
            .backend
            .read_ordered(&consolidated_key(&self.ctx.root_key), after)
            .await?;
        entries
            .into_iter()
            .map(|entry| {
                let mut record: ConsolidatedRecord = serde_json::from_str(&entry.member)?;
                record.sequence = entry.sequence;
                Ok(record)
            })
            .collect()
    }

    async fn write(&self, value: Value, mode: WriteMode) -> Result<WriteReceipt, StorageError> {
        let slot = self.slot();
        let op = self.ctx.chain.plan(&self.ctx.root_key, &self.path, &value, mode)?;
        let backend = &self.ctx.backend;
        let sequence = match op {
            KvOp::AppendOrdered {
                collection_key,
                counter_key,
                record,
            } => {
                let member = serde_json::to_string(&record)?;
                Some(
                    backend
                        .append_ordered(&collection_key, &counter_key, &member)
                        .await?,
                )
            },
            KvOp::WriteHash {
                key,
                fields,
                replace,
                shadowed,
            } => {
                backend.write_hash(&key, &fields, replace, &shadowed).await?;
                None
            },
            KvOp::WriteScalar {
                key,
                value,
                shadowed,
            } => {
                backend.write_scalar(&key, &value, &shadowed).await?;
                None
            },
        };
        tracing::debug!(slot = %slot, mode = %mode, sequence = ?sequence, "key-value write");

        self.ctx.watchers.notify(&slot, &value).await;
        Ok(WriteReceipt { slot, sequence })
    }
}

fn decode_hash(fields: HashMap<String, String>) -> Value {
    let mut sorted: Vec<(String, String)> = fields.into_iter().collect();
    sorted.sort();
    Value::Object(
        sorted
            .into_iter()
            .map(|(field, raw)| (field, decode_value(&raw)))
            .collect::<Map<String, Value>>(),
    )
}

#[async_trait]
impl StorageRef for KeyValueRef {
    fn child(&self, name: &str) -> Arc<dyn StorageRef> {
        Arc::new(Self {
            ctx: Arc::clone(&self.ctx),
            path: extend_path(&self.path, name),
        })
    }

    fn path(&self) -> &[String] {
        &self.path
    }

    async fn push(&self, value: Value) -> Result<WriteReceipt, StorageError> {
        self.write(value, WriteMode::Push).await
    }

    async fn set(&self, value: Value) -> Result<WriteReceipt, StorageError> {
        self.write(value, WriteMode::Set).await
    }

    async fn update(&self, value: Value) -> Result<WriteReceipt, StorageError> {
        self.write(value, WriteMode::Update).await
    }

    fn watch(&self, callback: WatchCallback) {
        self.ctx.watchers.register(self.slot(), callback);
    }

    fn unwatch(&self) {
        self.ctx.watchers.clear(&self.slot());
    }

    fn reference(&self) -> String {
        self.key()
    }

    async fn get_hash(&self) -> Result<HashMap<String, String>, StorageError> {
        let fields = self.ctx.backend.read_hash(&self.key()).await?;
        Ok(fields
            .into_iter()
            .map(|(field, raw)| (field, field_text(&raw)))
            .collect())
    }

    async fn children(&self) -> Result<Vec<Arc<dyn StorageRef>>, StorageError> {
        let key = self.key();
        let nested = format!("{key}:");
        let feed = consolidated_key(&self.ctx.root_key);

        let mut names: BTreeSet<String> = self.get_hash().await?.into_keys().collect();
        for found in self.ctx.backend.list_keys(&nested).await? {
            if found.starts_with(&feed) {
                continue;
            }
            if let Some(name) = found[nested.len()..].split(':').next() {
                if !name.is_empty() {
                    names.insert(name.to_string());
                }
            }
        }
        Ok(names.iter().map(|name| self.child(name)).collect())
    }

    async fn get(&self) -> Result<Option<Value>, StorageError> {
        let backend = &self.ctx.backend;
        let Some((field, parent)) = self.path.split_last() else {
            let fields = backend.read_hash(&self.ctx.root_key).await?;
            if !fields.is_empty() {
                return Ok(Some(decode_hash(fields)));
            }
            return Ok(backend
                .read_scalar(&self.ctx.root_key)
                .await?
                .map(|raw| decode_value(&raw)));
        };

        if self.ctx.stream_fields.is_stream_path(&self.path) {
            let slot = self.slot();
            let payloads: Vec<Value> = self
                .consolidated_since(0)
                .await?
                .into_iter()
                .filter(|record| record.slot == slot)
                .map(|record| record.payload)
                .collect();
            return Ok((!payloads.is_empty()).then_some(Value::Array(payloads)));
        }

        let key = self.key();
        let fields = backend.read_hash(&key).await?;
        if !fields.is_empty() {
            return Ok(Some(decode_hash(fields)));
        }
        let parent_key = join_key(&self.ctx.root_key, parent);
        if let Some(raw) = backend.read_hash_field(&parent_key, field).await? {
            return Ok(Some(decode_value(&raw)));
        }
        Ok(backend.read_scalar(&key).await?.map(|raw| decode_value(&raw)))
    }

    async fn remove(&self) -> Result<(), StorageError> {
        // Stream entries live in the append-only feed; nothing is stored at
        // the path itself.
        if self.ctx.stream_fields.is_stream_path(&self.path) {
            return Ok(());
        }
        let removed = self.ctx.backend.delete_tree(&self.key()).await?;
        tracing::debug!(key = %self.key(), removed, "removed key tree");
        Ok(())
    }
}
