//! Message groups as a hash of messages plus a sorted set of arrival order.

use crate::{DEFAULT_PREFIX, redis_error};
use chrono::{DateTime, Utc};
use correlator_core::correlation::CorrelationKey;
use correlator_core::group::MessageGroup;
use correlator_core::message::{Message, MessageId};
use correlator_core::store::{MessageGroupStore, StoreError, StoreFuture};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::collections::HashMap;

const ADD_SCRIPT: &str = r"
    local added = redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2])
    if added == 1 then
        local seq = redis.call('INCR', KEYS[4])
        redis.call('ZADD', KEYS[2], seq, ARGV[1])
    end
    redis.call('HSETNX', KEYS[3], 'created_at', ARGV[3])
    redis.call('HSET', KEYS[3], 'last_modified', ARGV[3])
    return added
";

const REMOVE_SCRIPT: &str = r"
    local removed = {}
    for i, id in ipairs(ARGV) do
        if i > 1 then
            local json = redis.call('HGET', KEYS[1], id)
            if json then
                local seq = redis.call('ZSCORE', KEYS[2], id)
                redis.call('HDEL', KEYS[1], id)
                redis.call('ZREM', KEYS[2], id)
                table.insert(removed, seq or '0')
                table.insert(removed, json)
            end
        end
    end
    if #removed > 0 then
        redis.call('HSET', KEYS[3], 'last_modified', ARGV[1])
    end
    return removed
";

/// Redis-backed [`MessageGroupStore`].
///
/// Adds and removals run as Lua scripts so a group's hash, order and state
/// never disagree. Reads use an atomic pipeline.
#[derive(Clone)]
pub struct RedisMessageGroupStore {
    conn: ConnectionManager,
    prefix: String,
}

struct GroupKeys {
    messages: String,
    order: String,
    meta: String,
}

impl RedisMessageGroupStore {
    /// Store on `conn` with the default prefix.
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }

    /// Use `prefix` for every key.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn keys(&self, key: &CorrelationKey) -> GroupKeys {
        let base = format!("{}:group:{key}", self.prefix);
        GroupKeys {
            messages: format!("{base}:messages"),
            order: format!("{base}:order"),
            meta: format!("{base}:meta"),
        }
    }

    fn sequence_key(&self) -> String {
        format!("{}:seq", self.prefix)
    }

    async fn load(&self, key: &CorrelationKey) -> Result<MessageGroup, StoreError> {
        let keys = self.keys(key);
        let mut conn = self.conn.clone();

        let (order, mut bodies, meta): (Vec<String>, HashMap<String, String>, HashMap<String, String>) =
            redis::pipe()
                .atomic()
                .zrange(&keys.order, 0, -1)
                .hgetall(&keys.messages)
                .hgetall(&keys.meta)
                .query_async(&mut conn)
                .await
                .map_err(|e| redis_error(&e))?;

        let now = Utc::now();
        let created_at = parse_time(meta.get("created_at")).unwrap_or(now);
        let last_modified = parse_time(meta.get("last_modified")).unwrap_or(created_at);
        let complete = meta.get("complete").is_some_and(|v| v == "1");

        let messages = order
            .iter()
            .filter_map(|id| bodies.remove(id))
            .map(|json| decode(&json))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(MessageGroup::from_parts(
            key.clone(),
            messages,
            complete,
            created_at,
            last_modified,
        ))
    }
}

fn parse_time(value: Option<&String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn decode(json: &str) -> Result<Message, StoreError> {
    serde_json::from_str(json).map_err(|e| StoreError::Serialization(e.to_string()))
}

impl MessageGroupStore for RedisMessageGroupStore {
    fn add_message(&self, key: &CorrelationKey, message: Message) -> StoreFuture<'_, MessageGroup> {
        let key = key.clone();
        Box::pin(async move {
            let keys = self.keys(&key);
            let body = serde_json::to_string(&message).map_err(|e| StoreError::Serialization(e.to_string()))?;
            let mut conn = self.conn.clone();

            let added: i64 = redis::Script::new(ADD_SCRIPT)
                .key(&keys.messages)
                .key(&keys.order)
                .key(&keys.meta)
                .key(self.sequence_key())
                .arg(message.id().to_string())
                .arg(body)
                .arg(Utc::now().to_rfc3339())
                .invoke_async(&mut conn)
                .await
                .map_err(|e| redis_error(&e))?;

            if added == 0 {
                tracing::trace!(correlation_key = %key, message_id = %message.id(), "Message already buffered");
            }
            self.load(&key).await
        })
    }

    fn remove_messages(&self, key: &CorrelationKey, ids: &[MessageId]) -> StoreFuture<'_, Vec<Message>> {
        let key = key.clone();
        let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
        Box::pin(async move {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let keys = self.keys(&key);
            let mut conn = self.conn.clone();

            let reply: Vec<String> = redis::Script::new(REMOVE_SCRIPT)
                .key(&keys.messages)
                .key(&keys.order)
                .key(&keys.meta)
                .arg(Utc::now().to_rfc3339())
                .arg(ids)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| redis_error(&e))?;

            let mut removed = reply
                .chunks_exact(2)
                .map(|pair| Ok((pair[0].parse::<f64>().unwrap_or_default(), decode(&pair[1])?)))
                .collect::<Result<Vec<_>, StoreError>>()?;
            removed.sort_by(|a, b| a.0.total_cmp(&b.0));
            Ok(removed.into_iter().map(|(_, message)| message).collect())
        })
    }

    fn get_group(&self, key: &CorrelationKey) -> StoreFuture<'_, MessageGroup> {
        let key = key.clone();
        Box::pin(async move { self.load(&key).await })
    }

    fn group_size(&self, key: &CorrelationKey) -> StoreFuture<'_, usize> {
        let keys = self.keys(key);
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let size: usize = conn.hlen(&keys.messages).await.map_err(|e| redis_error(&e))?;
            Ok(size)
        })
    }

    fn complete_group(&self, key: &CorrelationKey) -> StoreFuture<'_, ()> {
        let keys = self.keys(key);
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let now = Utc::now().to_rfc3339();
            let _: () = redis::pipe()
                .atomic()
                .hset_nx(&keys.meta, "created_at", &now)
                .ignore()
                .hset(&keys.meta, "complete", "1")
                .ignore()
                .hset(&keys.meta, "last_modified", &now)
                .ignore()
                .query_async(&mut conn)
                .await
                .map_err(|e| redis_error(&e))?;
            Ok(())
        })
    }

    fn remove_group(&self, key: &CorrelationKey) -> StoreFuture<'_, ()> {
        let keys = self.keys(key);
        let key = key.clone();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let _: () = conn
                .del(vec![keys.messages, keys.order, keys.meta])
                .await
                .map_err(|e| redis_error(&e))?;
            tracing::debug!(correlation_key = %key, "Removed message group");
            Ok(())
        })
    }
}
