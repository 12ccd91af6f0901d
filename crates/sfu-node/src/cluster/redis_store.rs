//! Redis-backed coordination store.
//!
//! # Key Patterns
//!
//! - `nodes` - Registered node ids (SET)
//! - `node:{id}:info` - Registration record (JSON)
//! - `node:{id}:heartbeat` - Liveness marker (TTL)
//! - `node:{id}:stats` - Latest load report (JSON)
//! - `node:{id}:contexts` - Active routing contexts (counter)
//! - `room:{id}:placement` - `{nodeId, contextId}` (JSON)
//! - `room:{id}:roster` - Participant id to participant info (HASH)
//! - `room:{id}:events` - Room event channel (PUB/SUB)
//!
//! # Connection Pattern
//!
//! The redis-rs `MultiplexedConnection` is cheap to clone and safe to use
//! concurrently, so every operation clones it instead of locking. Pattern
//! subscriptions use a dedicated pub/sub connection each.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use tokio::sync::mpsc;
use tracing::{debug, error, instrument, warn};

use super::lua_scripts;
use super::store::{CoordinationStore, StoreError, StoreMessage};

const SUBSCRIBER_BUFFER: usize = 256;

/// Coordination store backed by a shared Redis instance.
#[derive(Clone)]
pub struct RedisStore {
    /// Kept for opening pub/sub connections.
    client: Client,
    connection: MultiplexedConnection,
    set_nx_and_count_script: Script,
    compare_delete_and_count_script: Script,
}

fn command_error(operation: &'static str, key: &str, e: &redis::RedisError) -> StoreError {
    warn!(
        target: "sfu.cluster.redis",
        error = %e,
        operation = operation,
        key = %key,
        "Redis command failed"
    );
    StoreError::Command(format!("{operation} failed: {e}"))
}

/// Map a counted script's reply: 1 written, 0 untouched, -1 bad counter.
fn counted_reply(reply: i64, counter: &str) -> Result<bool, StoreError> {
    if reply < 0 {
        return Err(StoreError::Command(format!("{counter} is not an integer")));
    }
    Ok(reply == 1)
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Connection` if the URL is invalid or the server is unreachable.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Do NOT log redis_url, it may contain credentials
            error!(
                target: "sfu.cluster.redis",
                error = %e,
                "Failed to open Redis client"
            );
            StoreError::Connection(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(
                    target: "sfu.cluster.redis",
                    error = %e,
                    "Failed to connect to Redis"
                );
                StoreError::Connection(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self {
            client,
            connection,
            set_nx_and_count_script: Script::new(lua_scripts::SET_NX_AND_COUNT),
            compare_delete_and_count_script: Script::new(lua_scripts::COMPARE_DELETE_AND_COUNT),
        })
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| command_error("GET", key, &e))?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .set(key, value)
            .await
            .map_err(|e| command_error("SET", key, &e))?;
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("SET PX", key, &e))?;
        Ok(())
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn set_if_absent_counted(
        &self,
        key: &str,
        value: &str,
        counter: &str,
        delta: i64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let reply: i64 = self
            .set_nx_and_count_script
            .key(key)
            .key(counter)
            .arg(value)
            .arg(delta)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| command_error("SET_NX_AND_COUNT", key, &e))?;

        let written = counted_reply(reply, counter)?;
        debug!(target: "sfu.cluster.redis", written = written, "SET_NX_AND_COUNT completed");
        Ok(written)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .del(key)
            .await
            .map_err(|e| command_error("DEL", key, &e))?;
        Ok(())
    }

    async fn delete_if_equals_counted(
        &self,
        key: &str,
        expected: &str,
        counter: &str,
        delta: i64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let reply: i64 = self
            .compare_delete_and_count_script
            .key(key)
            .key(counter)
            .arg(expected)
            .arg(delta)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| command_error("COMPARE_DELETE_AND_COUNT", key, &e))?;
        counted_reply(reply, counter)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .sadd(key, member)
            .await
            .map_err(|e| command_error("SADD", key, &e))?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .srem(key, member)
            .await
            .map_err(|e| command_error("SREM", key, &e))?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection.clone();
        let mut members: Vec<String> = conn
            .smembers(key)
            .await
            .map_err(|e| command_error("SMEMBERS", key, &e))?;
        // SMEMBERS order is unspecified; scan order must be stable across callers.
        members.sort();
        Ok(members)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .hset(key, field, value)
            .await
            .map_err(|e| command_error("HSET", key, &e))?;
        Ok(())
    }

    async fn hash_remove(&self, key: &str, field: &str) -> Result<usize, StoreError> {
        let mut conn = self.connection.clone();
        let (remaining,): (usize,) = redis::pipe()
            .atomic()
            .hdel(key, field)
            .ignore()
            .hlen(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("HDEL", key, &e))?;
        Ok(remaining)
    }

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
        let mut conn = self.connection.clone();
        let map: HashMap<String, String> = conn
            .hgetall(key)
            .await
            .map_err(|e| command_error("HGETALL", key, &e))?;
        let mut entries: Vec<(String, String)> = map.into_iter().collect();
        entries.sort();
        Ok(entries)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: i64 = conn
            .publish(channel, payload)
            .await
            .map_err(|e| command_error("PUBLISH", channel, &e))?;
        Ok(())
    }

    async fn subscribe_pattern(
        &self,
        pattern: &str,
    ) -> Result<mpsc::Receiver<StoreMessage>, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(|e| {
            error!(target: "sfu.cluster.redis", error = %e, "Failed to open pub/sub connection");
            StoreError::Connection(format!("Failed to open pub/sub connection: {e}"))
        })?;

        pubsub
            .psubscribe(pattern)
            .await
            .map_err(|e| command_error("PSUBSCRIBE", pattern, &e))?;

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let pattern = pattern.to_string();

        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(message) = messages.next().await {
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(target: "sfu.cluster.redis", error = %e, "Dropping non-text pub/sub payload");
                        continue;
                    }
                };
                let forwarded = StoreMessage {
                    channel: message.get_channel_name().to_string(),
                    payload,
                };
                if tx.send(forwarded).await.is_err() {
                    break;
                }
            }
            warn!(target: "sfu.cluster.redis", pattern = %pattern, "Pattern subscription ended");
        });

        Ok(rx)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("PING", "", &e))?;
        Ok(())
    }
}
