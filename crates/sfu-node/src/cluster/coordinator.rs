//! Cluster coordinator: node registry, health, and room placement.
//!
//! # Allocation
//!
//! `allocate(room_id)` is idempotent across every gateway and node:
//!
//! 1. An existing placement is returned as-is.
//! 2. Otherwise the healthy node with the lowest load score is chosen, where
//!    load score = active contexts + normalized CPU (0.0..=1.0). Ties go to
//!    the first node in id order.
//! 3. The placement is written with set-if-absent. A caller that loses the
//!    race reads and returns the winner's placement instead of its own.
//!
//! # Health
//!
//! A node is healthy while its heartbeat key exists. Heartbeats carry a TTL;
//! a node that stops refreshing drops out of selection but keeps its
//! registration and its existing placements. Rooms are never migrated off a
//! node because of heartbeat loss.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use signaling_protocol::ParticipantSummary;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::store::{CoordinationStore, StoreError, StoreMessage};
use crate::errors::SfuError;
use crate::observability::metrics;

/// Maximum set-if-absent attempts before giving up on one allocation.
const MAX_ALLOCATION_ATTEMPTS: usize = 3;

const NODES_KEY: &str = "nodes";

pub(crate) fn node_info_key(node_id: &str) -> String {
    format!("node:{node_id}:info")
}

pub(crate) fn node_heartbeat_key(node_id: &str) -> String {
    format!("node:{node_id}:heartbeat")
}

pub(crate) fn node_stats_key(node_id: &str) -> String {
    format!("node:{node_id}:stats")
}

pub(crate) fn node_contexts_key(node_id: &str) -> String {
    format!("node:{node_id}:contexts")
}

pub(crate) fn placement_key(room_id: &str) -> String {
    format!("room:{room_id}:placement")
}

pub(crate) fn roster_key(room_id: &str) -> String {
    format!("room:{room_id}:roster")
}

pub(crate) fn room_events_channel(room_id: &str) -> String {
    format!("room:{room_id}:events")
}

const ROOM_EVENTS_PATTERN: &str = "room:*:events";

/// Extract the room id from a `room:{id}:events` channel name.
#[must_use]
pub fn room_id_from_channel(channel: &str) -> Option<&str> {
    channel
        .strip_prefix("room:")
        .and_then(|rest| rest.strip_suffix(":events"))
}

/// Registration record for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRegistration {
    pub node_id: String,
    /// Base URL of the node's internal routing endpoint.
    pub address: String,
    /// Maximum routing contexts the node accepts.
    pub capacity: u32,
    pub registered_at: i64,
}

/// Load report published with every heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    pub contexts: u32,
    pub workers_live: u32,
    pub workers_total: u32,
    /// Recent CPU usage normalized to 0.0..=1.0.
    pub cpu_load: f64,
    pub memory_percent: u32,
    pub connections: u32,
    pub reported_at: i64,
}

/// Where a room's routing context lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    pub node_id: String,
    pub context_id: String,
    pub allocated_at: i64,
}

/// Point-in-time view of one node, as used by selection and `/status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub node_id: String,
    pub address: String,
    pub capacity: u32,
    pub healthy: bool,
    pub contexts: i64,
    pub cpu_load: f64,
    pub load_score: f64,
}

impl NodeStatus {
    fn accepts_new_rooms(&self) -> bool {
        self.healthy && self.contexts < i64::from(self.capacity)
    }
}

/// Cluster-wide source of truth for node health and room placement.
#[derive(Clone)]
pub struct ClusterCoordinator {
    store: Arc<dyn CoordinationStore>,
    heartbeat_ttl: Duration,
    allocation_timeout: Duration,
}

impl ClusterCoordinator {
    #[must_use]
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        heartbeat_ttl: Duration,
        allocation_timeout: Duration,
    ) -> Self {
        Self {
            store,
            heartbeat_ttl,
            allocation_timeout,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    /// Register a node and mark it healthy.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the store is unreachable.
    #[instrument(skip_all, fields(node_id = %node_id))]
    pub async fn register(&self, node_id: &str, address: &str, capacity: u32) -> Result<(), StoreError> {
        let registration = NodeRegistration {
            node_id: node_id.to_string(),
            address: address.to_string(),
            capacity,
            registered_at: chrono::Utc::now().timestamp(),
        };
        let json = to_json(&registration)?;

        let result = async {
            self.store.set(&node_info_key(node_id), &json).await?;
            self.store.set_add(NODES_KEY, node_id).await?;
            self.refresh_heartbeat(node_id).await
        }
        .await;
        metrics::record_coordination_operation("register", result.is_ok());
        result?;

        info!(
            target: "sfu.cluster",
            node_id = %node_id,
            address = %address,
            capacity = capacity,
            "Node registered"
        );
        Ok(())
    }

    /// Refresh a node's heartbeat TTL and publish its load.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the store is unreachable.
    pub async fn heartbeat(&self, node_id: &str, stats: &NodeStats) -> Result<(), StoreError> {
        let json = to_json(stats)?;

        let result = async {
            self.refresh_heartbeat(node_id).await?;
            self.store.set(&node_stats_key(node_id), &json).await?;
            // Re-adding is idempotent and heals a registry wiped by a store restart.
            self.store.set_add(NODES_KEY, node_id).await
        }
        .await;
        metrics::record_coordination_operation("heartbeat", result.is_ok());
        result
    }

    async fn refresh_heartbeat(&self, node_id: &str) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp().to_string();
        self.store
            .set_with_ttl(&node_heartbeat_key(node_id), &now, self.heartbeat_ttl)
            .await
    }

    /// Remove a node from the registry on graceful shutdown.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the store is unreachable.
    #[instrument(skip_all, fields(node_id = %node_id))]
    pub async fn deregister(&self, node_id: &str) -> Result<(), StoreError> {
        let result = async {
            self.store.set_remove(NODES_KEY, node_id).await?;
            self.store.delete(&node_heartbeat_key(node_id)).await?;
            self.store.delete(&node_stats_key(node_id)).await?;
            self.store.delete(&node_info_key(node_id)).await
        }
        .await;
        metrics::record_coordination_operation("deregister", result.is_ok());
        result?;

        info!(target: "sfu.cluster", node_id = %node_id, "Node deregistered");
        Ok(())
    }

    /// Registration record for a node, if registered.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the store is unreachable or the record is corrupt.
    pub async fn node(&self, node_id: &str) -> Result<Option<NodeRegistration>, StoreError> {
        match self.store.get(&node_info_key(node_id)).await? {
            Some(json) => from_json(&json).map(Some),
            None => Ok(None),
        }
    }

    /// Status of every registered node, in id order.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the store is unreachable.
    pub async fn node_statuses(&self) -> Result<Vec<NodeStatus>, StoreError> {
        let mut node_ids = self.store.set_members(NODES_KEY).await?;
        node_ids.sort();

        let mut statuses = Vec::with_capacity(node_ids.len());
        for node_id in node_ids {
            let Some(registration) = self.node(&node_id).await? else {
                // Registry entry without a record: half-finished registration.
                continue;
            };

            let healthy = self.store.get(&node_heartbeat_key(&node_id)).await?.is_some();

            let contexts = match self.store.get(&node_contexts_key(&node_id)).await? {
                Some(raw) => raw.parse::<i64>().unwrap_or(0),
                None => 0,
            };

            let cpu_load = match self.store.get(&node_stats_key(&node_id)).await? {
                Some(json) => from_json::<NodeStats>(&json)
                    .map(|stats| stats.cpu_load.clamp(0.0, 1.0))
                    .unwrap_or(0.0),
                None => 0.0,
            };

            // Context counts stay far below 2^52
            #[allow(clippy::cast_precision_loss)]
            let load_score = contexts as f64 + cpu_load;

            statuses.push(NodeStatus {
                node_id,
                address: registration.address,
                capacity: registration.capacity,
                healthy,
                contexts,
                cpu_load,
                load_score,
            });
        }

        Ok(statuses)
    }

    /// Current placement of a room, if any.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the store is unreachable or the record is corrupt.
    pub async fn placement(&self, room_id: &str) -> Result<Option<Placement>, StoreError> {
        match self.store.get(&placement_key(room_id)).await? {
            Some(json) => from_json(&json).map(Some),
            None => Ok(None),
        }
    }

    /// Return the room's placement, allocating one if none exists.
    ///
    /// Bounded by the configured allocation timeout; the caller owns retries.
    ///
    /// # Errors
    ///
    /// - `SfuError::Allocation` if no healthy node has room, or on timeout
    /// - `SfuError::Coordination` if the store fails
    #[instrument(skip_all, fields(room_id = %room_id))]
    pub async fn allocate(&self, room_id: &str) -> Result<Placement, SfuError> {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.allocation_timeout, self.allocate_inner(room_id)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    target: "sfu.cluster",
                    room_id = %room_id,
                    timeout_ms = self.allocation_timeout.as_millis(),
                    "Allocation timed out"
                );
                Err(SfuError::Allocation("allocation timed out".to_string()))
            }
        };

        metrics::record_allocation(started.elapsed(), result.is_ok());
        result
    }

    async fn allocate_inner(&self, room_id: &str) -> Result<Placement, SfuError> {
        let key = placement_key(room_id);

        for attempt in 1..=MAX_ALLOCATION_ATTEMPTS {
            if let Some(existing) = self.placement(room_id).await? {
                debug!(
                    target: "sfu.cluster",
                    room_id = %room_id,
                    node_id = %existing.node_id,
                    "Reusing existing placement"
                );
                return Ok(existing);
            }

            let statuses = self.node_statuses().await?;
            let Some(chosen) = select_node(&statuses) else {
                warn!(
                    target: "sfu.cluster",
                    room_id = %room_id,
                    registered = statuses.len(),
                    "No healthy node available for allocation"
                );
                return Err(SfuError::Allocation("no healthy node available".to_string()));
            };

            let placement = Placement {
                node_id: chosen.node_id.clone(),
                context_id: uuid::Uuid::new_v4().to_string(),
                allocated_at: chrono::Utc::now().timestamp(),
            };
            let json = to_json(&placement)?;

            let claimed = self
                .store
                .set_if_absent_counted(&key, &json, &node_contexts_key(&placement.node_id), 1)
                .await?;
            if claimed {
                metrics::record_coordination_operation("allocate", true);
                info!(
                    target: "sfu.cluster",
                    room_id = %room_id,
                    node_id = %placement.node_id,
                    context_id = %placement.context_id,
                    load_score = chosen.load_score,
                    "Room allocated"
                );
                return Ok(placement);
            }

            // Lost the race. The winner's placement is read on the next pass;
            // it can only be missing if the room was released in between.
            debug!(
                target: "sfu.cluster",
                room_id = %room_id,
                attempt = attempt,
                "Concurrent allocation won by another caller"
            );
        }

        Err(SfuError::Allocation(
            "placement kept changing during allocation".to_string(),
        ))
    }

    /// Remove a room's placement and decrement its node's context count.
    ///
    /// Returns the placement that was removed, if any.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the store is unreachable.
    #[instrument(skip_all, fields(room_id = %room_id))]
    pub async fn release(&self, room_id: &str) -> Result<Option<Placement>, StoreError> {
        let key = placement_key(room_id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let placement: Placement = from_json(&raw)?;
        self.release_exact(room_id, &raw, placement).await
    }

    /// Release only if the room is still placed on `context_id`.
    ///
    /// Prevents a stale caller from removing a newer placement for the same room.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the store is unreachable.
    pub async fn release_context(
        &self,
        room_id: &str,
        context_id: &str,
    ) -> Result<Option<Placement>, StoreError> {
        let key = placement_key(room_id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let placement: Placement = from_json(&raw)?;
        if placement.context_id != context_id {
            return Ok(None);
        }
        self.release_exact(room_id, &raw, placement).await
    }

    async fn release_exact(
        &self,
        room_id: &str,
        raw: &str,
        placement: Placement,
    ) -> Result<Option<Placement>, StoreError> {
        let deleted = self
            .store
            .delete_if_equals_counted(
                &placement_key(room_id),
                raw,
                &node_contexts_key(&placement.node_id),
                -1,
            )
            .await?;
        metrics::record_coordination_operation("release", true);
        if !deleted {
            return Ok(None);
        }

        info!(
            target: "sfu.cluster",
            room_id = %room_id,
            node_id = %placement.node_id,
            context_id = %placement.context_id,
            "Room placement released"
        );
        Ok(Some(placement))
    }

    /// Insert or update a participant in the cluster-wide roster.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the store is unreachable.
    pub async fn roster_upsert(
        &self,
        room_id: &str,
        participant: &ParticipantSummary,
    ) -> Result<(), StoreError> {
        let json = to_json(participant)?;
        self.store
            .hash_set(&roster_key(room_id), &participant.participant_id, &json)
            .await
    }

    /// Remove a participant; returns how many remain cluster-wide.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the store is unreachable.
    pub async fn roster_remove(&self, room_id: &str, participant_id: &str) -> Result<usize, StoreError> {
        self.store.hash_remove(&roster_key(room_id), participant_id).await
    }

    /// Cluster-wide roster. Corrupt entries are skipped.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the store is unreachable.
    pub async fn roster(&self, room_id: &str) -> Result<Vec<ParticipantSummary>, StoreError> {
        let entries = self.store.hash_get_all(&roster_key(room_id)).await?;
        Ok(entries
            .into_iter()
            .filter_map(|(participant_id, json)| match from_json(&json) {
                Ok(summary) => Some(summary),
                Err(e) => {
                    warn!(
                        target: "sfu.cluster",
                        room_id = %room_id,
                        participant_id = %participant_id,
                        error = %e,
                        "Skipping corrupt roster entry"
                    );
                    None
                }
            })
            .collect())
    }

    /// Drop the whole roster for a room.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the store is unreachable.
    pub async fn clear_roster(&self, room_id: &str) -> Result<(), StoreError> {
        self.store.delete(&roster_key(room_id)).await
    }

    /// Publish a serialized room event to every replica.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the store is unreachable.
    pub async fn publish_room_event(&self, room_id: &str, payload: &str) -> Result<(), StoreError> {
        self.store.publish(&room_events_channel(room_id), payload).await
    }

    /// Subscribe to the events of every room.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the subscription cannot be opened.
    pub async fn subscribe_room_events(&self) -> Result<mpsc::Receiver<StoreMessage>, StoreError> {
        self.store.subscribe_pattern(ROOM_EVENTS_PATTERN).await
    }
}

/// Pick the node with the lowest load score; ties go to the first scanned.
fn select_node(statuses: &[NodeStatus]) -> Option<&NodeStatus> {
    let mut best: Option<&NodeStatus> = None;
    for status in statuses.iter().filter(|s| s.accepts_new_rooms()) {
        match best {
            Some(current) if status.load_score >= current.load_score => {}
            _ => best = Some(status),
        }
    }
    best
}

fn to_json<T: Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_json<T: for<'de> Deserialize<'de>>(json: &str) -> Result<T, StoreError> {
    serde_json::from_str(json).map_err(|e| StoreError::Serialization(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::cluster::MemoryStore;
    use common::types::Role;

    const TTL: Duration = Duration::from_secs(15);

    fn coordinator(store: &MemoryStore) -> ClusterCoordinator {
        ClusterCoordinator::new(Arc::new(store.clone()), TTL, Duration::from_secs(3))
    }

    fn stats(cpu_load: f64) -> NodeStats {
        NodeStats {
            cpu_load,
            ..NodeStats::default()
        }
    }

    #[test]
    fn test_key_formats() {
        assert_eq!(node_heartbeat_key("n1"), "node:n1:heartbeat");
        assert_eq!(node_stats_key("n1"), "node:n1:stats");
        assert_eq!(placement_key("r1"), "room:r1:placement");
        assert_eq!(roster_key("r1"), "room:r1:roster");
        assert_eq!(room_events_channel("r1"), "room:r1:events");
        assert_eq!(room_id_from_channel("room:r1:events"), Some("r1"));
        assert_eq!(room_id_from_channel("room:r1:roster"), None);
    }

    #[tokio::test]
    async fn test_allocate_is_idempotent() {
        let store = MemoryStore::new();
        let cluster = coordinator(&store);
        cluster.register("n1", "http://n1", 10).await.unwrap();

        let first = cluster.allocate("r1").await.unwrap();
        let second = cluster.allocate("r1").await.unwrap();

        assert_eq!(first, second);
        let statuses = cluster.node_statuses().await.unwrap();
        assert_eq!(statuses.first().map(|s| s.contexts), Some(1));
    }

    #[tokio::test]
    async fn test_concurrent_allocations_converge() {
        let store = MemoryStore::new();
        let cluster = coordinator(&store);
        cluster.register("n1", "http://n1", 100).await.unwrap();
        cluster.register("n2", "http://n2", 100).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cluster = cluster.clone();
            tasks.push(tokio::spawn(async move { cluster.allocate("shared").await }));
        }

        let mut placements = Vec::new();
        for task in tasks {
            placements.push(task.await.unwrap().unwrap());
        }

        let first = placements.first().unwrap();
        assert!(placements.iter().all(|p| p == first));

        let total: i64 = cluster
            .node_statuses()
            .await
            .unwrap()
            .iter()
            .map(|s| s.contexts)
            .sum();
        assert_eq!(total, 1, "exactly one context counted cluster-wide");
    }

    #[tokio::test]
    async fn test_allocate_picks_lowest_load_score() {
        let store = MemoryStore::new();
        let cluster = coordinator(&store);
        cluster.register("a", "http://a", 10).await.unwrap();
        cluster.register("b", "http://b", 10).await.unwrap();
        cluster.heartbeat("a", &stats(0.9)).await.unwrap();
        cluster.heartbeat("b", &stats(0.2)).await.unwrap();

        assert_eq!(cluster.allocate("r1").await.unwrap().node_id, "b");
        // b now has 1 context + 0.2 cpu = 1.2, a has 0.9
        assert_eq!(cluster.allocate("r2").await.unwrap().node_id, "a");
    }

    #[tokio::test]
    async fn test_ties_go_to_first_node_scanned() {
        let store = MemoryStore::new();
        let cluster = coordinator(&store);
        cluster.register("n2", "http://n2", 10).await.unwrap();
        cluster.register("n1", "http://n1", 10).await.unwrap();

        assert_eq!(cluster.allocate("r1").await.unwrap().node_id, "n1");
    }

    #[tokio::test]
    async fn test_full_nodes_are_skipped() {
        let store = MemoryStore::new();
        let cluster = coordinator(&store);
        cluster.register("n1", "http://n1", 1).await.unwrap();

        cluster.allocate("r1").await.unwrap();
        let err = cluster.allocate("r2").await.unwrap_err();
        assert!(matches!(err, SfuError::Allocation(_)));
    }

    #[tokio::test]
    async fn test_no_nodes_is_allocation_error() {
        let store = MemoryStore::new();
        let cluster = coordinator(&store);

        let err = cluster.allocate("r1").await.unwrap_err();
        assert!(matches!(err, SfuError::Allocation(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_node_excluded_but_placements_kept() {
        let store = MemoryStore::new();
        let cluster = coordinator(&store);
        cluster.register("a", "http://a", 10).await.unwrap();
        let placement = cluster.allocate("r1").await.unwrap();
        assert_eq!(placement.node_id, "a");

        cluster.register("b", "http://b", 10).await.unwrap();
        tokio::time::advance(TTL - Duration::from_secs(1)).await;
        cluster.heartbeat("b", &stats(0.0)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        let statuses = cluster.node_statuses().await.unwrap();
        assert!(!statuses.iter().find(|s| s.node_id == "a").unwrap().healthy);
        assert!(statuses.iter().find(|s| s.node_id == "b").unwrap().healthy);

        // Existing room stays on the stale node, new rooms avoid it.
        assert_eq!(cluster.allocate("r1").await.unwrap(), placement);
        assert_eq!(cluster.allocate("r2").await.unwrap().node_id, "b");

        // Heartbeats resuming makes the node selectable again.
        cluster.heartbeat("a", &stats(0.0)).await.unwrap();
        let statuses = cluster.node_statuses().await.unwrap();
        assert!(statuses.iter().all(|s| s.healthy));
    }

    #[tokio::test]
    async fn test_release_clears_placement_and_load() {
        let store = MemoryStore::new();
        let cluster = coordinator(&store);
        cluster.register("n1", "http://n1", 10).await.unwrap();

        let first = cluster.allocate("r1").await.unwrap();
        let released = cluster.release("r1").await.unwrap();
        assert_eq!(released, Some(first.clone()));
        assert!(cluster.placement("r1").await.unwrap().is_none());
        assert_eq!(cluster.node_statuses().await.unwrap().first().map(|s| s.contexts), Some(0));

        assert_eq!(cluster.release("r1").await.unwrap(), None);

        let second = cluster.allocate("r1").await.unwrap();
        assert_ne!(first.context_id, second.context_id);
    }

    #[tokio::test]
    async fn test_failed_context_count_update_leaves_room_unplaced() {
        let store = MemoryStore::new();
        let cluster = coordinator(&store);
        cluster.register("n1", "http://n1", 10).await.unwrap();
        store.set(&node_contexts_key("n1"), "junk").await.unwrap();

        let err = cluster.allocate("r1").await.unwrap_err();
        assert!(matches!(err, SfuError::Coordination(_)));
        assert!(cluster.placement("r1").await.unwrap().is_none());

        store.set(&node_contexts_key("n1"), "0").await.unwrap();
        cluster.allocate("r1").await.unwrap();
        assert_eq!(cluster.node_statuses().await.unwrap().first().map(|s| s.contexts), Some(1));
    }

    #[tokio::test]
    async fn test_release_context_ignores_newer_placement() {
        let store = MemoryStore::new();
        let cluster = coordinator(&store);
        cluster.register("n1", "http://n1", 10).await.unwrap();

        let old = cluster.allocate("r1").await.unwrap();
        cluster.release("r1").await.unwrap();
        let new = cluster.allocate("r1").await.unwrap();

        assert_eq!(cluster.release_context("r1", &old.context_id).await.unwrap(), None);
        assert_eq!(cluster.placement("r1").await.unwrap(), Some(new.clone()));
        assert_eq!(
            cluster.release_context("r1", &new.context_id).await.unwrap(),
            Some(new)
        );
    }

    #[tokio::test]
    async fn test_deregister_removes_node() {
        let store = MemoryStore::new();
        let cluster = coordinator(&store);
        cluster.register("n1", "http://n1", 10).await.unwrap();
        cluster.deregister("n1").await.unwrap();

        assert!(cluster.node_statuses().await.unwrap().is_empty());
        assert!(cluster.node("n1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_roster_operations() {
        let store = MemoryStore::new();
        let cluster = coordinator(&store);
        let summary = |id: &str| ParticipantSummary {
            participant_id: id.to_string(),
            user_id: format!("user-{id}"),
            display_name: id.to_uppercase(),
            role: Role::Viewer,
            producers: Vec::new(),
        };

        cluster.roster_upsert("r1", &summary("a")).await.unwrap();
        cluster.roster_upsert("r1", &summary("b")).await.unwrap();
        store.hash_set(&roster_key("r1"), "junk", "not json").await.unwrap();

        let roster = cluster.roster("r1").await.unwrap();
        assert_eq!(roster.len(), 2);

        assert_eq!(cluster.roster_remove("r1", "a").await.unwrap(), 2);
        cluster.clear_roster("r1").await.unwrap();
        assert!(cluster.roster("r1").await.unwrap().is_empty());
    }
}
