//! Redis key-value backend.
//!
//! [`RedisKvBackend`] implements [`KeyValueBackend`] and [`Publisher`] on a
//! Redis server. It maps each trait method to Redis commands:
//!
//! | Method | Redis |
//! |--------|-------|
//! | `append_ordered` | Lua: `INCR` counter + `ZADD` member scored by it |
//! | `write_hash` | `HSET` (replace or shadowed: `MULTI DEL/HDEL + HSET EXEC`) |
//! | `write_scalar` | `SET` (shadowed: `MULTI DEL/HDEL + SET EXEC`) |
//! | `read_hash` / `read_hash_field` / `read_scalar` | `HGETALL` / `HGET` / `GET` |
//! | `read_ordered` | `ZRANGEBYSCORE (after +inf` |
//! | `list_keys` / `delete_tree` | `SCAN MATCH` / `DEL` |
//! | `publish` | `PUBLISH` |
//!
//! Sorted-set members are stored as `<seq>:<record>` so that identical
//! records appended twice stay distinct; reads strip the prefix.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use task_logger::store::redis::RedisKvBackend;
//!
//! # async fn example() -> Result<(), task_logger::store::StorageError> {
//! let backend = Arc::new(RedisKvBackend::connect("redis://127.0.0.1:6379/1").await?);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;

use crate::store::backend::{KeyValueBackend, OrderedEntry, Publisher, Shadowed, StorageError};

/// Atomic ordered append.
///
/// KEYS[1] = sorted set key, KEYS[2] = counter key.
/// ARGV[1] = record.
/// Returns: the new sequence id.
const LUA_APPEND_ORDERED: &str = r#"
local seq = redis.call('INCR', KEYS[2])
redis.call('ZADD', KEYS[1], seq, seq .. ':' .. ARGV[1])
return seq
"#;

const SCAN_BATCH: usize = 500;

/// Redis backend for progress storage and fan-out.
///
/// # Connection Model
///
/// Holds a [`MultiplexedConnection`], which is cheap to clone; all clones
/// share one TCP connection. Each method clones it.
#[derive(Clone)]
pub struct RedisKvBackend {
    conn: MultiplexedConnection,
    append: Script,
}

impl std::fmt::Debug for RedisKvBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKvBackend").finish_non_exhaustive()
    }
}

impl RedisKvBackend {
    /// Connects to Redis at `url` (`redis://[:<password>@]<host>:<port>[/<db>]`).
    ///
    /// # Errors
    ///
    /// [`StorageError::Backend`] if the client cannot be created or the
    /// connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
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
        tracing::info!("redis client ready");
        Ok(Self::with_connection(conn))
    }

    /// Creates a backend with a pre-built multiplexed connection.
    pub fn with_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            append: Script::new(LUA_APPEND_ORDERED),
        }
    }
}

/// Maps a Redis error to a [`StorageError::Backend`].
fn map_redis_error(err: ::redis::RedisError, key: &str) -> StorageError {
    StorageError::Backend {
        message: format!("Redis error for key {key}: {err}"),
        source: Some(Box::new(err)),
    }
}

/// Escapes glob metacharacters so a key prefix matches literally in `SCAN MATCH`.
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Starts an atomic pipeline that removes `shadowed` entries.
fn shadowed_pipe(shadowed: &[Shadowed]) -> ::redis::Pipeline {
    let mut pipe = ::redis::pipe();
    pipe.atomic();
    for entry in shadowed {
        match entry {
            Shadowed::Key(key) => pipe.del(key).ignore(),
            Shadowed::Field { key, field } => pipe.hdel(key, field).ignore(),
        };
    }
    pipe
}

/// Splits a stored `<seq>:<record>` member.
fn split_member(member: &str) -> Result<OrderedEntry, StorageError> {
    member
        .split_once(':')
        .and_then(|(seq, record)| {
            seq.parse().ok().map(|sequence| OrderedEntry {
                sequence,
                member: record.to_string(),
            })
        })
        .ok_or_else(|| StorageError::Serialization {
            message: format!("malformed ordered member: {member}"),
        })
}

#[async_trait]
impl KeyValueBackend for RedisKvBackend {
    async fn append_ordered(
        &self,
        collection_key: &str,
        counter_key: &str,
        member: &str,
    ) -> Result<u64, StorageError> {
        self.append
            .key(collection_key)
            .key(counter_key)
            .arg(member)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, collection_key))
    }

    async fn write_hash(
        &self,
        key: &str,
        fields: &[(String, String)],
        replace: bool,
        shadowed: &[Shadowed],
    ) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        if replace || !shadowed.is_empty() {
            let mut pipe = shadowed_pipe(shadowed);
            if replace {
                pipe.del(key).ignore();
            }
            if !fields.is_empty() {
                pipe.hset_multiple(key, fields).ignore();
            }
            pipe.query_async::<()>(&mut conn)
                .await
                .map_err(|e| map_redis_error(e, key))
        } else if fields.is_empty() {
            Ok(())
        } else {
            conn.hset_multiple::<_, _, _, ()>(key, fields)
                .await
                .map_err(|e| map_redis_error(e, key))
        }
    }

    async fn write_scalar(
        &self,
        key: &str,
        value: &str,
        shadowed: &[Shadowed],
    ) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        if shadowed.is_empty() {
            return conn
                .set::<_, _, ()>(key, value)
                .await
                .map_err(|e| map_redis_error(e, key));
        }
        let mut pipe = shadowed_pipe(shadowed);
        pipe.set(key, value).ignore();
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, key))
    }

    async fn read_hash(&self, key: &str) -> Result<HashMap<String, String>, StorageError> {
        self.conn
            .clone()
            .hgetall(key)
            .await
            .map_err(|e| map_redis_error(e, key))
    }

    async fn read_hash_field(
        &self,
        key: &str,
        field: &str,
    ) -> Result<Option<String>, StorageError> {
        self.conn
            .clone()
            .hget(key, field)
            .await
            .map_err(|e| map_redis_error(e, key))
    }

    async fn read_scalar(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.conn
            .clone()
            .get(key)
            .await
            .map_err(|e| map_redis_error(e, key))
    }

    async fn read_ordered(
        &self,
        collection_key: &str,
        after: u64,
    ) -> Result<Vec<OrderedEntry>, StorageError> {
        let members: Vec<String> = self
            .conn
            .clone()
            .zrangebyscore(collection_key, format!("({after}"), "+inf")
            .await
            .map_err(|e| map_redis_error(e, collection_key))?;
        members.iter().map(|m| split_member(m)).collect()
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let pattern = format!("{}*", escape_glob(prefix));
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = ::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| map_redis_error(e, prefix))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn delete_tree(&self, key: &str) -> Result<usize, StorageError> {
        let mut doomed = self.list_keys(&format!("{key}:")).await?;
        doomed.push(key.to_string());
        let removed: usize = self
            .conn
            .clone()
            .del(&doomed)
            .await
            .map_err(|e| map_redis_error(e, key))?;
        Ok(removed)
    }
}

#[async_trait]
impl Publisher for RedisKvBackend {
    async fn publish(&self, channel: &str, message: &str) -> Result<(), StorageError> {
        let _receivers: i64 = self
            .conn
            .clone()
            .publish(channel, message)
            .await
            .map_err(|e| map_redis_error(e, channel))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_member_strips_sequence_prefix() {
        let entry = split_member(r#"12:{"slot":"a:b","payload":1}"#).unwrap();
        assert_eq!(entry.sequence, 12);
        assert_eq!(entry.member, r#"{"slot":"a:b","payload":1}"#);
        assert!(split_member("nope").is_err());
    }

    #[test]
    fn escape_glob_quotes_metacharacters() {
        assert_eq!(escape_glob("build-logs:a*:j?"), r"build-logs:a\*:j\?");
        assert_eq!(escape_glob("plain:key:"), "plain:key:");
    }
}
