//! Fan-out decorator mirroring accepted writes onto a notification channel.
//!
//! [`PubSubRef`] wraps any [`StorageRef`]. After the wrapped write returns
//! its [`WriteReceipt`], it publishes one [`FanOutMessage`] on the task
//! channel `<scope>:<jobId>`:
//!
//! ```json
//! {"slot": "steps.build.logs", "payload": "hello\r\n", "action": "e", "id": 7}
//! ```
//!
//! `action` is `"e"` (event) when the final path segment is a stream field
//! and `"r"` (replace) otherwise, so subscribers can tell appends from
//! point-in-time field updates without looking at the payload. `id` carries
//! the sequence id when the write joined the ordered feed.
//!
//! [`child`](StorageRef::child) returns a decorator around the wrapped
//! reference's child, so mirroring holds at every depth.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::backend::{Publisher, StorageError};
use crate::store::strategy::StreamFields;
use crate::store::{StorageRef, WatchCallback, WriteReceipt};

/// How subscribers should apply a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FanOutAction {
    /// Append-only event (log line, metric sample).
    #[serde(rename = "e")]
    Event,
    /// Replacement of a point-in-time value.
    #[serde(rename = "r")]
    Replace,
}

/// Message published for every accepted write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanOutMessage {
    /// Dot-normalized path of the write.
    pub slot: String,
    /// The written value.
    pub payload: Value,
    /// Event or replace classification.
    pub action: FanOutAction,
    /// Sequence id in the ordered feed, when there is one.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<u64>,
}

#[derive(Debug)]
struct Channel {
    publisher: Arc<dyn Publisher>,
    name: String,
    stream_fields: StreamFields,
}

/// Decorator publishing every accepted write of the wrapped reference.
#[derive(Debug, Clone)]
pub struct PubSubRef {
    inner: Arc<dyn StorageRef>,
    channel: Arc<Channel>,
}

impl PubSubRef {
    /// Wraps `inner`, publishing on `channel` through `publisher`.
    pub fn new(
        inner: Arc<dyn StorageRef>,
        publisher: Arc<dyn Publisher>,
        channel: impl Into<String>,
        stream_fields: StreamFields,
    ) -> Self {
        Self {
            inner,
            channel: Arc::new(Channel {
                publisher,
                name: channel.into(),
                stream_fields,
            }),
        }
    }

    /// Channel name for a job: `<scope>:<jobId>`.
    pub fn channel_for(scope: &str, job_id: &str) -> String {
        format!("{scope}:{job_id}")
    }

    /// Channel this decorator publishes on.
    pub fn channel(&self) -> &str {
        &self.channel.name
    }

    fn classify(&self) -> FanOutAction {
        if self.channel.stream_fields.is_stream_path(self.inner.path()) {
            FanOutAction::Event
        } else {
            FanOutAction::Replace
        }
    }

    async fn mirror(&self, receipt: WriteReceipt, payload: Value) -> Result<WriteReceipt, StorageError> {
        let message = FanOutMessage {
            slot: normalize_slot(&receipt.slot),
            payload,
            action: self.classify(),
            id: receipt.sequence,
        };
        let encoded = serde_json::to_string(&message)?;
        self.channel
            .publisher
            .publish(&self.channel.name, &encoded)
            .await?;
        tracing::debug!(channel = %self.channel.name, slot = %message.slot, action = ?message.action, "published write");
        Ok(receipt)
    }
}

/// Normalizes `:` and `/` separators to `.`.
///
/// # Examples
///
/// ```
/// use task_logger::store::pubsub::normalize_slot;
///
/// assert_eq!(normalize_slot("steps:build/logs"), "steps.build.logs");
/// ```
pub fn normalize_slot(slot: &str) -> String {
    slot.replace([':', '/'], ".")
}

#[async_trait]
impl StorageRef for PubSubRef {
    fn child(&self, name: &str) -> Arc<dyn StorageRef> {
        Arc::new(Self {
            inner: self.inner.child(name),
            channel: Arc::clone(&self.channel),
        })
    }

    fn path(&self) -> &[String] {
        self.inner.path()
    }

    async fn push(&self, value: Value) -> Result<WriteReceipt, StorageError> {
        let receipt = self.inner.push(value.clone()).await?;
        self.mirror(receipt, value).await
    }

    async fn set(&self, value: Value) -> Result<WriteReceipt, StorageError> {
        let receipt = self.inner.set(value.clone()).await?;
        self.mirror(receipt, value).await
    }

    async fn update(&self, value: Value) -> Result<WriteReceipt, StorageError> {
        let receipt = self.inner.update(value.clone()).await?;
        self.mirror(receipt, value).await
    }

    fn watch(&self, callback: WatchCallback) {
        self.inner.watch(callback);
    }

    fn unwatch(&self) {
        self.inner.unwatch();
    }

    fn reference(&self) -> String {
        self.inner.reference()
    }

    async fn get_hash(&self) -> Result<HashMap<String, String>, StorageError> {
        self.inner.get_hash().await
    }

    async fn children(&self) -> Result<Vec<Arc<dyn StorageRef>>, StorageError> {
        let children = self.inner.children().await?;
        Ok(children
            .into_iter()
            .map(|inner| {
                Arc::new(Self {
                    inner,
                    channel: Arc::clone(&self.channel),
                }) as Arc<dyn StorageRef>
            })
            .collect())
    }

    async fn get(&self) -> Result<Option<Value>, StorageError> {
        self.inner.get().await
    }

    async fn remove(&self) -> Result<(), StorageError> {
        self.inner.remove().await
    }
}
