//! Worker loss handling.
//!
//! When a media worker dies, every routing context it hosted is gone. For
//! each affected room the placement is released, the roster cleared, and
//! participants on every replica are told their session ended. Rooms are
//! never migrated to another worker.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::actors::{RelayEnvelope, RoomEvent, SessionDirectoryHandle, REASON_WORKER_LOST};
use crate::cluster::ClusterCoordinator;
use crate::engine::WorkerEvent;
use crate::routing::{LostContext, RoutingContextManager};

/// Everything the watcher touches when a worker dies.
#[derive(Clone)]
pub struct WorkerLossServices {
    pub node_id: String,
    pub manager: Arc<RoutingContextManager>,
    pub coordinator: ClusterCoordinator,
    pub directory: SessionDirectoryHandle,
}

/// Watch pool events until `cancel_token` fires or the pool goes away.
#[instrument(skip_all, name = "sfu.task.worker_loss")]
pub async fn start_worker_loss_watcher(
    mut events: broadcast::Receiver<WorkerEvent>,
    services: WorkerLossServices,
    cancel_token: CancellationToken,
) {
    info!(target: "sfu.task.worker_loss", "Starting worker loss watcher");

    loop {
        let event = tokio::select! {
            () = cancel_token.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(WorkerEvent::Lost { slot, generation }) => {
                let lost = services.manager.handle_worker_lost(slot, generation).await;
                for context in lost {
                    end_room(&services, &context).await;
                }
            }
            Ok(WorkerEvent::Restarted { slot, generation }) => {
                info!(
                    target: "sfu.task.worker_loss",
                    slot,
                    generation,
                    "Worker slot refilled"
                );
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                error!(
                    target: "sfu.task.worker_loss",
                    skipped,
                    "Worker events dropped, sweeping for stale contexts"
                );
                for context in services.manager.reap_stale_contexts().await {
                    end_room(&services, &context).await;
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    info!(target: "sfu.task.worker_loss", "Worker loss watcher stopped");
}

async fn end_room(services: &WorkerLossServices, context: &LostContext) {
    let room_id = context.room_id.as_str();

    if let Err(e) = services
        .coordinator
        .release_context(room_id, &context.context_id)
        .await
    {
        warn!(target: "sfu.task.worker_loss", room_id = %room_id, error = %e, "Failed to release placement");
    }
    if let Err(e) = services.coordinator.clear_roster(room_id).await {
        warn!(target: "sfu.task.worker_loss", room_id = %room_id, error = %e, "Failed to clear roster");
    }

    if let Err(e) = services.directory.end_session(room_id, REASON_WORKER_LOST).await {
        warn!(target: "sfu.task.worker_loss", room_id = %room_id, error = %e, "Failed to end local session");
    }

    let envelope = RelayEnvelope {
        origin: services.node_id.clone(),
        event: RoomEvent::SessionEnded {
            reason: REASON_WORKER_LOST.to_string(),
        },
    };
    match serde_json::to_string(&envelope) {
        Ok(payload) => {
            if let Err(e) = services.coordinator.publish_room_event(room_id, &payload).await {
                warn!(target: "sfu.task.worker_loss", room_id = %room_id, error = %e, "Failed to publish session end");
            }
        }
        Err(e) => {
            error!(target: "sfu.task.worker_loss", room_id = %room_id, error = %e, "Failed to encode session end");
        }
    }

    warn!(
        target: "sfu.task.worker_loss",
        room_id = %room_id,
        context_id = %context.context_id,
        "Room session ended after worker loss"
    );
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::{
        ActorMetrics, ClientSink, ConnectionMessage, RoomServices, SessionDirectory,
    };
    use crate::actors::messages::JoinRequest;
    use crate::cluster::{CoordinationStore, MemoryStore};
    use crate::engine::{LoopbackEngine, MediaEngine, MediaEnginePool, PoolConfig};
    use crate::routing::remote::DEFAULT_CALL_TIMEOUT;
    use crate::routing::RouterRegistry;
    use common::secret::SecretString;
    use common::types::{EngineBlob, Role};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_worker_loss_ends_sessions_and_releases_placement() {
        let engine_token = CancellationToken::new();
        let engine = Arc::new(LoopbackEngine::new());
        let (pool, _) = MediaEnginePool::start(
            Arc::clone(&engine) as Arc<dyn MediaEngine>,
            PoolConfig {
                worker_count: 1,
                restart_delay: Duration::from_millis(10),
            },
            engine_token.clone(),
        )
        .await
        .unwrap();

        let store = Arc::new(MemoryStore::new());
        let coordinator = ClusterCoordinator::new(
            Arc::clone(&store) as Arc<dyn CoordinationStore>,
            Duration::from_secs(15),
            Duration::from_secs(3),
        );
        coordinator
            .register("node-a", "http://127.0.0.1:1", 100)
            .await
            .unwrap();
        let manager = Arc::new(RoutingContextManager::new(Arc::clone(&pool)));
        let services = RoomServices {
            node_id: "node-a".to_string(),
            coordinator: coordinator.clone(),
            registry: Arc::new(RouterRegistry::new(
                "node-a",
                Arc::clone(&manager),
                coordinator.clone(),
                SecretString::from("secret".to_string()),
                DEFAULT_CALL_TIMEOUT,
            )),
            metrics: ActorMetrics::new(),
            reconcile_interval: Duration::from_secs(60),
        };
        let (directory, _directory_task) =
            SessionDirectory::spawn(services, CancellationToken::new());

        let (outbound, _outbound_rx) = mpsc::channel(16);
        let (control, mut control_rx) = mpsc::channel(8);
        let room = directory.room("r1").await.unwrap();
        room.join(JoinRequest {
            user_id: "alice".to_string(),
            display_name: "Alice".to_string(),
            role: Role::Host,
            capabilities: EngineBlob::empty(),
            sink: ClientSink::new("conn-1", outbound, control, CancellationToken::new()),
        })
        .await
        .unwrap();
        assert!(coordinator.placement("r1").await.unwrap().is_some());
        let mut relay = coordinator.subscribe_room_events().await.unwrap();

        let token = CancellationToken::new();
        let watcher = tokio::spawn(start_worker_loss_watcher(
            pool.subscribe(),
            WorkerLossServices {
                node_id: "node-a".to_string(),
                manager: Arc::clone(&manager),
                coordinator: coordinator.clone(),
                directory: directory.clone(),
            },
            token.clone(),
        ));
        tokio::task::yield_now().await;

        assert!(engine.kill(0));

        let message = tokio::time::timeout(Duration::from_secs(5), control_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match message {
            ConnectionMessage::SessionEnded { room_id, reason } => {
                assert_eq!(room_id, "r1");
                assert_eq!(reason, REASON_WORKER_LOST);
            }
            other => unreachable!("unexpected message: {other:?}"),
        }

        let published = tokio::time::timeout(Duration::from_secs(5), relay.recv())
            .await
            .unwrap()
            .unwrap();
        let envelope: RelayEnvelope = serde_json::from_str(&published.payload).unwrap();
        assert_eq!(envelope.origin, "node-a");
        assert_eq!(
            envelope.event,
            RoomEvent::SessionEnded {
                reason: REASON_WORKER_LOST.to_string()
            }
        );

        assert!(coordinator.placement("r1").await.unwrap().is_none());
        assert!(coordinator.roster("r1").await.unwrap().is_empty());
        assert!(!manager.has_context("r1").await);

        token.cancel();
        watcher.await.unwrap();
        engine_token.cancel();
    }

    #[tokio::test]
    async fn test_lagged_watcher_reaps_contexts_of_dead_worker() {
        let engine_token = CancellationToken::new();
        let engine = Arc::new(LoopbackEngine::new());
        let (pool, _) = MediaEnginePool::start(
            Arc::clone(&engine) as Arc<dyn MediaEngine>,
            PoolConfig {
                worker_count: 1,
                restart_delay: Duration::from_millis(10),
            },
            engine_token.clone(),
        )
        .await
        .unwrap();
        let coordinator = ClusterCoordinator::new(
            Arc::new(MemoryStore::new()),
            Duration::from_secs(15),
            Duration::from_secs(3),
        );
        coordinator
            .register("node-a", "http://127.0.0.1:1", 100)
            .await
            .unwrap();
        let manager = Arc::new(RoutingContextManager::new(Arc::clone(&pool)));
        let (directory, _directory_task) = SessionDirectory::spawn(
            RoomServices {
                node_id: "node-a".to_string(),
                coordinator: coordinator.clone(),
                registry: Arc::new(RouterRegistry::new(
                    "node-a",
                    Arc::clone(&manager),
                    coordinator.clone(),
                    SecretString::from("secret".to_string()),
                    DEFAULT_CALL_TIMEOUT,
                )),
                metrics: ActorMetrics::new(),
                reconcile_interval: Duration::from_secs(60),
            },
            CancellationToken::new(),
        );

        let (outbound, _outbound_rx) = mpsc::channel(16);
        let (control, mut control_rx) = mpsc::channel(8);
        let room = directory.room("r1").await.unwrap();
        room.join(JoinRequest {
            user_id: "alice".to_string(),
            display_name: "Alice".to_string(),
            role: Role::Host,
            capabilities: EngineBlob::empty(),
            sink: ClientSink::new("conn-1", outbound, control, CancellationToken::new()),
        })
        .await
        .unwrap();

        // The worker dies while nobody is listening to the pool's events.
        assert!(engine.kill(0));
        tokio::time::timeout(Duration::from_secs(5), async {
            while pool.stats().first().map(|s| s.generation) == Some(0) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // A receiver that has fallen behind sees `Lagged` first.
        let (tx, rx) = broadcast::channel::<WorkerEvent>(1);
        tx.send(WorkerEvent::Restarted { slot: 0, generation: 1 }).unwrap();
        tx.send(WorkerEvent::Restarted { slot: 0, generation: 1 }).unwrap();

        let token = CancellationToken::new();
        let watcher = tokio::spawn(start_worker_loss_watcher(
            rx,
            WorkerLossServices {
                node_id: "node-a".to_string(),
                manager: Arc::clone(&manager),
                coordinator: coordinator.clone(),
                directory: directory.clone(),
            },
            token.clone(),
        ));

        let message = tokio::time::timeout(Duration::from_secs(5), control_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            message,
            ConnectionMessage::SessionEnded { ref reason, .. } if reason == REASON_WORKER_LOST
        ));
        assert!(coordinator.placement("r1").await.unwrap().is_none());
        assert!(!manager.has_context("r1").await);

        token.cancel();
        watcher.await.unwrap();
        drop(tx);
        engine_token.cancel();
    }

    #[tokio::test]
    async fn test_watcher_stops_when_pool_is_dropped() {
        let (tx, rx) = broadcast::channel::<WorkerEvent>(4);
        let engine_token = CancellationToken::new();
        let (pool, _) = MediaEnginePool::start(
            Arc::new(LoopbackEngine::new()) as Arc<dyn MediaEngine>,
            PoolConfig {
                worker_count: 1,
                restart_delay: Duration::from_millis(10),
            },
            engine_token.clone(),
        )
        .await
        .unwrap();
        let coordinator = ClusterCoordinator::new(
            Arc::new(MemoryStore::new()),
            Duration::from_secs(15),
            Duration::from_secs(3),
        );
        let manager = Arc::new(RoutingContextManager::new(pool));
        let (directory, _task) = SessionDirectory::spawn(
            RoomServices {
                node_id: "node-a".to_string(),
                coordinator: coordinator.clone(),
                registry: Arc::new(RouterRegistry::new(
                    "node-a",
                    Arc::clone(&manager),
                    coordinator.clone(),
                    SecretString::from("secret".to_string()),
                    DEFAULT_CALL_TIMEOUT,
                )),
                metrics: ActorMetrics::new(),
                reconcile_interval: Duration::from_secs(60),
            },
            CancellationToken::new(),
        );

        let watcher = tokio::spawn(start_worker_loss_watcher(
            rx,
            WorkerLossServices {
                node_id: "node-a".to_string(),
                manager,
                coordinator,
                directory,
            },
            CancellationToken::new(),
        ));

        tx.send(WorkerEvent::Restarted { slot: 0, generation: 1 }).unwrap();
        drop(tx);
        tokio::time::timeout(Duration::from_secs(5), watcher)
            .await
            .unwrap()
            .unwrap();
        engine_token.cancel();
    }
}
