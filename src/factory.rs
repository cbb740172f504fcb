//! Builds the root [`StorageRef`] of a task from a [`LoggerConfig`].
//!
//! Exactly one backend is selected per task:
//!
//! | [`BackendType`] | Root |
//! |-----------------|------|
//! | `memory` | [`KeyValueRef`] over a fresh [`InMemoryKvBackend`] |
//! | `redis` | [`KeyValueRef`] over [`RedisKvBackend`](crate::store::redis::RedisKvBackend), wrapped in [`PubSubRef`] when `pubsub` is on |
//! | `firebase` | [`DocumentRef`] over an authenticated [`FirebaseClient`] |
//!
//! Key-value roots share the `[task_logger.redis]` key layout settings
//! (`key_root`, `pubsub`, `pubsub_scope`) whichever store backs them.

use std::sync::Arc;

pub use crate::config::BackendType;
use crate::config::{LoggerConfig, RedisSettings};
use crate::error::TaskLoggerError;
use crate::store::document::{DocumentRef, FirebaseClient};
use crate::store::kv::KeyValueRef;
use crate::store::memory::InMemoryKvBackend;
use crate::store::pubsub::PubSubRef;
use crate::store::strategy::StreamFields;
use crate::store::{KeyValueBackend, Publisher, StorageRef};
use crate::types::task::TaskInfo;

/// Connects the backend selected by `config` and returns the task root.
///
/// # Errors
///
/// - [`TaskLoggerError::Config`] for an invalid configuration or a backend
///   that is not compiled in
/// - [`TaskLoggerError::Storage`] when the backend cannot be reached or
///   rejects the credentials
pub async fn connect(
    task: &TaskInfo,
    config: &LoggerConfig,
) -> Result<Arc<dyn StorageRef>, TaskLoggerError> {
    task.validate()?;
    config.validate()?;
    let stream_fields = StreamFields::new(config.stream_fields.iter().cloned());

    match config.backend {
        BackendType::Memory => Ok(key_value_root(
            Arc::new(InMemoryKvBackend::new()),
            task,
            &config.redis,
            stream_fields,
        )),
        BackendType::Redis => connect_redis(task, &config.redis, stream_fields).await,
        BackendType::Firebase => {
            let client = FirebaseClient::new(&config.firebase.base_url, config.firebase.secret.clone())?;
            client.authenticate().await?;
            Ok(Arc::new(DocumentRef::root(client, task.job_id.clone())))
        },
    }
}

#[cfg(feature = "redis")]
async fn connect_redis(
    task: &TaskInfo,
    settings: &RedisSettings,
    stream_fields: StreamFields,
) -> Result<Arc<dyn StorageRef>, TaskLoggerError> {
    use crate::store::redis::RedisKvBackend;

    let backend = RedisKvBackend::connect(&settings.connection_url()?).await?;
    Ok(key_value_root(Arc::new(backend), task, settings, stream_fields))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(
    _task: &TaskInfo,
    _settings: &RedisSettings,
    _stream_fields: StreamFields,
) -> Result<Arc<dyn StorageRef>, TaskLoggerError> {
    Err(crate::config::ConfigError::Unsupported(BackendType::Redis.to_string()).into())
}

/// Task root over a key-value `backend`, decorated with pub/sub fan-out when
/// `settings.pubsub` is set.
pub fn key_value_root<B>(
    backend: Arc<B>,
    task: &TaskInfo,
    settings: &RedisSettings,
    stream_fields: StreamFields,
) -> Arc<dyn StorageRef>
where
    B: KeyValueBackend + Publisher + 'static,
{
    let root = KeyValueRef::for_task(
        Arc::clone(&backend) as Arc<dyn KeyValueBackend>,
        task,
        &settings.key_root,
        stream_fields.clone(),
    );
    if !settings.pubsub {
        return Arc::new(root);
    }
    let channel = PubSubRef::channel_for(&settings.pubsub_scope, &task.job_id);
    tracing::debug!(channel = %channel, "pub/sub fan-out enabled");
    Arc::new(PubSubRef::new(
        Arc::new(root),
        backend as Arc<dyn Publisher>,
        channel,
        stream_fields,
    ))
}
