//! Coordination store abstraction.
//!
//! The primitives every cluster-wide decision is built from. All cross-node
//! state (node registry, placements, rosters, room events) goes through an
//! implementation of [`CoordinationStore`]; nothing is shared in-process
//! between nodes.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Coordination store errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Could not reach the store.
    #[error("Store connection failed: {0}")]
    Connection(String),

    /// The store rejected or failed a command.
    #[error("Store command failed: {0}")]
    Command(String),

    /// A stored record could not be decoded.
    #[error("Store record invalid: {0}")]
    Serialization(String),
}

/// A message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMessage {
    pub channel: String,
    pub payload: String,
}

/// Shared key-value coordination store.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Set `key` with an expiry. The key disappears once `ttl` elapses unless refreshed.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Set `key` only if it does not exist, and in the same atomic step add
    /// `delta` to the integer `counter` (floored at zero).
    ///
    /// Returns `true` if this call wrote `key`. A non-integer `counter` is an
    /// error and leaves both keys untouched.
    async fn set_if_absent_counted(
        &self,
        key: &str,
        value: &str,
        counter: &str,
        delta: i64,
    ) -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Delete `key` only if it currently holds `expected`, and in the same
    /// atomic step add `delta` to `counter` (floored at zero).
    ///
    /// Returns `true` if deleted.
    async fn delete_if_equals_counted(
        &self,
        key: &str,
        expected: &str,
        counter: &str,
        delta: i64,
    ) -> Result<bool, StoreError>;

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;

    /// Remove `field` and return the number of fields left in the hash.
    async fn hash_remove(&self, key: &str, field: &str) -> Result<usize, StoreError>;

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, String)>, StoreError>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError>;

    /// Subscribe to every channel matching a glob `pattern` (single `*` wildcard).
    ///
    /// The returned receiver closes when the subscription is lost.
    async fn subscribe_pattern(
        &self,
        pattern: &str,
    ) -> Result<mpsc::Receiver<StoreMessage>, StoreError>;

    /// Cheap round trip used by readiness checks.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Match a channel name against a glob with at most one `*`.
#[must_use]
pub fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == channel,
        Some((prefix, suffix)) => {
            channel.len() >= prefix.len() + suffix.len()
                && channel.starts_with(prefix)
                && channel.ends_with(suffix)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matches() {
        assert!(pattern_matches("room:*:events", "room:r1:events"));
        assert!(pattern_matches("room:*:events", "room::events"));
        assert!(!pattern_matches("room:*:events", "room:r1:roster"));
        assert!(!pattern_matches("room:*:events", "room:events"));
        assert!(pattern_matches("exact", "exact"));
        assert!(!pattern_matches("exact", "exactly"));
    }
}
