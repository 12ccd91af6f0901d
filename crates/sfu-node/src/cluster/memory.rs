//! In-process coordination store.
//!
//! Backs single-node development deployments (`COORDINATION_BACKEND=memory`)
//! and every unit test that needs a store. Several nodes in one process can
//! share one `MemoryStore` by cloning it, which is how multi-node scenarios
//! are exercised without Redis.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use super::store::{pattern_matches, CoordinationStore, StoreError, StoreMessage};

const PUBSUB_CAPACITY: usize = 1024;
const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Debug, Default)]
struct MemoryInner {
    strings: HashMap<String, (String, Option<Instant>)>,
    sets: HashMap<String, BTreeSet<String>>,
    hashes: HashMap<String, BTreeMap<String, String>>,
}

impl MemoryInner {
    fn live_string(&mut self, key: &str, now: Instant) -> Option<&String> {
        let expired = self
            .strings
            .get(key)
            .is_some_and(|(_, expires)| expires.is_some_and(|at| at <= now));
        if expired {
            self.strings.remove(key);
        }
        self.strings.get(key).map(|(value, _)| value)
    }

    fn counter(&mut self, key: &str, now: Instant) -> Result<i64, StoreError> {
        match self.live_string(key, now) {
            Some(value) => value
                .parse::<i64>()
                .map_err(|e| StoreError::Command(format!("{key} is not an integer: {e}"))),
            None => Ok(0),
        }
    }

    fn add_to_counter(&mut self, key: &str, current: i64, delta: i64) {
        let next = current.saturating_add(delta).max(0);
        self.strings
            .insert(key.to_string(), (next.to_string(), None));
    }
}

/// Coordination store held entirely in memory.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
    bus: broadcast::Sender<StoreMessage>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(PUBSUB_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(MemoryInner::default())),
            bus,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `key` currently holds a live string value.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.lock().live_string(key, Instant::now()).is_some()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock().live_string(key, Instant::now()).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.lock()
            .strings
            .insert(key.to_string(), (value.to_string(), None));
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let expires = Instant::now() + ttl;
        self.lock()
            .strings
            .insert(key.to_string(), (value.to_string(), Some(expires)));
        Ok(())
    }

    async fn set_if_absent_counted(
        &self,
        key: &str,
        value: &str,
        counter: &str,
        delta: i64,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut inner = self.lock();
        let current = inner.counter(counter, now)?;
        if inner.live_string(key, now).is_some() {
            return Ok(false);
        }
        inner
            .strings
            .insert(key.to_string(), (value.to_string(), None));
        inner.add_to_counter(counter, current, delta);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.strings.remove(key);
        inner.sets.remove(key);
        inner.hashes.remove(key);
        Ok(())
    }

    async fn delete_if_equals_counted(
        &self,
        key: &str,
        expected: &str,
        counter: &str,
        delta: i64,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut inner = self.lock();
        let current = inner.counter(counter, now)?;
        if inner.live_string(key, now).map(String::as_str) != Some(expected) {
            return Ok(false);
        }
        inner.strings.remove(key);
        inner.add_to_counter(counter, current, delta);
        Ok(true)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.lock()
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(set) = inner.sets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                inner.sets.remove(key);
            }
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .lock()
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_remove(&self, key: &str, field: &str) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        let remaining = match inner.hashes.get_mut(key) {
            Some(hash) => {
                hash.remove(field);
                hash.len()
            }
            None => 0,
        };
        if remaining == 0 {
            inner.hashes.remove(key);
        }
        Ok(remaining)
    }

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
        Ok(self
            .lock()
            .hashes
            .get(key)
            .map(|hash| hash.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        // No subscribers is not an error, same as Redis PUBLISH returning 0.
        let _ = self.bus.send(StoreMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn subscribe_pattern(
        &self,
        pattern: &str,
    ) -> Result<mpsc::Receiver<StoreMessage>, StoreError> {
        let mut bus_rx = self.bus.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let pattern = pattern.to_string();

        tokio::spawn(async move {
            loop {
                match bus_rx.recv().await {
                    Ok(message) => {
                        if pattern_matches(&pattern, &message.channel)
                            && tx.send(message).await.is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            target: "sfu.cluster.memory",
                            skipped = skipped,
                            "Subscriber lagged, messages dropped"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_if_absent_first_writer_wins_and_counts_once() {
        let store = MemoryStore::new();

        assert!(store.set_if_absent_counted("k", "first", "n", 1).await.unwrap());
        assert!(!store.set_if_absent_counted("k", "second", "n", 1).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("first"));
        assert_eq!(store.get("n").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_corrupt_counter_writes_nothing() {
        let store = MemoryStore::new();
        store.set("n", "junk").await.unwrap();

        let result = store.set_if_absent_counted("k", "v", "n", 1).await;
        assert!(matches!(result, Err(StoreError::Command(_))));
        assert!(!store.contains_key("k"));
        assert_eq!(store.get("n").await.unwrap().as_deref(), Some("junk"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("hb", "1", Duration::from_secs(15))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(14)).await;
        assert!(store.contains_key("hb"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!store.contains_key("hb"));
        assert_eq!(store.get("hb").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_if_equals_counted() {
        let store = MemoryStore::new();
        store.set("placement", "a").await.unwrap();
        store.set("n", "2").await.unwrap();

        assert!(!store.delete_if_equals_counted("placement", "b", "n", -1).await.unwrap());
        assert_eq!(store.get("n").await.unwrap().as_deref(), Some("2"));
        assert!(store.delete_if_equals_counted("placement", "a", "n", -1).await.unwrap());
        assert_eq!(store.get("n").await.unwrap().as_deref(), Some("1"));
        assert!(!store.delete_if_equals_counted("placement", "a", "n", -1).await.unwrap());
    }

    #[tokio::test]
    async fn test_counter_floors_at_zero() {
        let store = MemoryStore::new();

        assert!(store.set_if_absent_counted("a", "1", "n", 2).await.unwrap());
        assert!(store.delete_if_equals_counted("a", "1", "n", -5).await.unwrap());
        assert_eq!(store.get("n").await.unwrap().as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn test_sets_and_hashes() {
        let store = MemoryStore::new();
        store.set_add("nodes", "b").await.unwrap();
        store.set_add("nodes", "a").await.unwrap();
        store.set_add("nodes", "a").await.unwrap();
        assert_eq!(store.set_members("nodes").await.unwrap(), vec!["a", "b"]);

        store.set_remove("nodes", "a").await.unwrap();
        assert_eq!(store.set_members("nodes").await.unwrap(), vec!["b"]);

        store.hash_set("roster", "p1", "{}").await.unwrap();
        store.hash_set("roster", "p2", "{}").await.unwrap();
        assert_eq!(store.hash_remove("roster", "p1").await.unwrap(), 1);
        assert_eq!(store.hash_remove("roster", "p1").await.unwrap(), 1);
        assert_eq!(store.hash_remove("roster", "p2").await.unwrap(), 0);
        assert!(store.hash_get_all("roster").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pattern_subscription_filters_channels() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe_pattern("room:*:events").await.unwrap();

        store.publish("node:a:events", "ignored").await.unwrap();
        store.publish("room:r1:events", "hello").await.unwrap();

        let message = rx.recv().await.unwrap();
        assert_eq!(message.channel, "room:r1:events");
        assert_eq!(message.payload, "hello");
    }
}
