//! Cross-replica room event relay.
//!
//! Subscribes to `room:*:events` and hands each event published by another
//! node to the local room actor. Events this node published are skipped.
//! A dropped subscription is reopened with backoff.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::actors::{RelayEnvelope, SessionDirectoryHandle};
use crate::cluster::{room_id_from_channel, ClusterCoordinator, StoreMessage};

const RESUBSCRIBE_BASE: Duration = Duration::from_secs(1);
const RESUBSCRIBE_MAX: Duration = Duration::from_secs(30);

/// Relay room events until `cancel_token` fires.
#[instrument(skip_all, name = "sfu.task.room_relay", fields(node_id = %node_id))]
pub async fn start_room_relay(
    coordinator: ClusterCoordinator,
    directory: SessionDirectoryHandle,
    node_id: String,
    cancel_token: CancellationToken,
) {
    info!(target: "sfu.task.room_relay", "Starting room relay task");

    let mut delay = RESUBSCRIBE_BASE;
    loop {
        match coordinator.subscribe_room_events().await {
            Ok(mut messages) => {
                delay = RESUBSCRIBE_BASE;
                loop {
                    tokio::select! {
                        () = cancel_token.cancelled() => {
                            info!(target: "sfu.task.room_relay", "Room relay task stopped");
                            return;
                        }
                        message = messages.recv() => {
                            let Some(message) = message else {
                                warn!(target: "sfu.task.room_relay", "Room event subscription closed");
                                break;
                            };
                            relay(&directory, &node_id, message).await;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(
                    target: "sfu.task.room_relay",
                    error = %e,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Room event subscription failed, retrying"
                );
            }
        }

        tokio::select! {
            () = cancel_token.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(RESUBSCRIBE_MAX);
    }

    info!(target: "sfu.task.room_relay", "Room relay task stopped");
}

async fn relay(directory: &SessionDirectoryHandle, node_id: &str, message: StoreMessage) {
    let Some(room_id) = room_id_from_channel(&message.channel) else {
        debug!(target: "sfu.task.room_relay", channel = %message.channel, "Ignoring unknown channel");
        return;
    };

    let envelope: RelayEnvelope = match serde_json::from_str(&message.payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(target: "sfu.task.room_relay", room_id = %room_id, error = %e, "Dropping malformed room event");
            return;
        }
    };
    if envelope.origin == node_id {
        return;
    }

    if let Err(e) = directory.relay(room_id, envelope.event).await {
        warn!(target: "sfu.task.room_relay", room_id = %room_id, error = %e, "Failed to relay room event");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::messages::JoinRequest;
    use crate::actors::{
        ActorMetrics, ClientSink, Outbound, RoomEvent, RoomServices, SessionDirectory,
    };
    use crate::cluster::{CoordinationStore, MemoryStore};
    use crate::engine::{LoopbackEngine, MediaEngine, MediaEnginePool, PoolConfig};
    use crate::routing::remote::DEFAULT_CALL_TIMEOUT;
    use crate::routing::{RouterRegistry, RoutingContextManager};
    use common::secret::SecretString;
    use common::types::{EngineBlob, Role};
    use signaling_protocol::ServerEvent;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct Fixture {
        coordinator: ClusterCoordinator,
        directory: SessionDirectoryHandle,
        outbound: mpsc::Receiver<Outbound>,
        engine_token: CancellationToken,
    }

    async fn fixture() -> Fixture {
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
            Arc::new(MemoryStore::new()) as Arc<dyn CoordinationStore>,
            Duration::from_secs(15),
            Duration::from_secs(3),
        );
        coordinator
            .register("node-a", "http://127.0.0.1:1", 100)
            .await
            .unwrap();
        let (directory, _task) = SessionDirectory::spawn(
            RoomServices {
                node_id: "node-a".to_string(),
                coordinator: coordinator.clone(),
                registry: Arc::new(RouterRegistry::new(
                    "node-a",
                    Arc::new(RoutingContextManager::new(pool)),
                    coordinator.clone(),
                    SecretString::from("secret".to_string()),
                    DEFAULT_CALL_TIMEOUT,
                )),
                metrics: ActorMetrics::new(),
                reconcile_interval: Duration::from_secs(60),
            },
            CancellationToken::new(),
        );

        let (outbound, outbound_rx) = mpsc::channel(16);
        let (control, _control_rx) = mpsc::channel(8);
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

        Fixture {
            coordinator,
            directory,
            outbound: outbound_rx,
            engine_token,
        }
    }

    async fn publish(coordinator: &ClusterCoordinator, origin: &str, event: RoomEvent) {
        let payload = serde_json::to_string(&RelayEnvelope {
            origin: origin.to_string(),
            event,
        })
        .unwrap();
        coordinator.publish_room_event("r1", &payload).await.unwrap();
    }

    fn left(participant_id: &str) -> RoomEvent {
        RoomEvent::ParticipantLeft {
            participant_id: participant_id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_relays_foreign_events_and_skips_own() {
        let mut fx = fixture().await;
        let token = CancellationToken::new();
        let task = tokio::spawn(start_room_relay(
            fx.coordinator.clone(),
            fx.directory.clone(),
            "node-a".to_string(),
            token.clone(),
        ));
        // Let the task open its subscription.
        tokio::time::sleep(Duration::from_millis(20)).await;

        publish(&fx.coordinator, "node-a", left("own")).await;
        fx.coordinator
            .publish_room_event("r1", "not json")
            .await
            .unwrap();
        publish(&fx.coordinator, "node-b", left("remote")).await;

        let frame = tokio::time::timeout(Duration::from_secs(5), fx.outbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            frame,
            Outbound::Event {
                id: None,
                event: ServerEvent::ParticipantLeft {
                    participant_id: "remote".to_string()
                }
            }
        );
        assert!(fx.outbound.try_recv().is_err());

        token.cancel();
        task.await.unwrap();
        fx.engine_token.cancel();
    }

    #[test]
    fn test_resubscribe_backoff_bounds() {
        assert!(RESUBSCRIBE_BASE < RESUBSCRIBE_MAX);
        assert_eq!(RESUBSCRIBE_MAX, Duration::from_secs(30));
    }
}
