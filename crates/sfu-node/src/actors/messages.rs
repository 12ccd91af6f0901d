//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via
//! `tokio::sync::mpsc`. Request-reply uses `tokio::sync::oneshot`.

use common::types::{EngineBlob, MediaKind, MediaSource, Role, TransportDirection};
use serde::{Deserialize, Serialize};
use signaling_protocol::{ClientRequest, CorrelationId, ParticipantSummary, ProducerSummary, ServerEvent};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::errors::SfuError;
use crate::observability::metrics;
use crate::routing::ClosedConsumer;

use super::room::RoomActorHandle;

/// Frames queued for a client socket's writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// A direct response (`id` set) or a pushed event (`id` absent).
    Event {
        id: Option<CorrelationId>,
        event: ServerEvent,
    },
    /// Liveness probe; the socket glue sends a ping.
    Probe,
    /// Close the socket. Always the last frame.
    Close { reason: String },
}

/// Messages sent to a `ConnectionActor`.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// A text frame read from the socket.
    Frame(String),
    /// Any sign of life that is not a frame (pong).
    Activity,
    /// The socket closed or errored.
    Disconnected,
    /// The room this connection is in ended its session.
    SessionEnded { room_id: String, reason: String },
}

/// What a room actor holds to reach one connection.
///
/// Pushes never wait. A connection whose outbound queue is full is a slow
/// consumer and is terminated instead of losing events mid-stream.
#[derive(Debug, Clone)]
pub struct ClientSink {
    connection_id: String,
    outbound: mpsc::Sender<Outbound>,
    control: mpsc::Sender<ConnectionMessage>,
    cancel: CancellationToken,
}

impl ClientSink {
    #[must_use]
    pub fn new(
        connection_id: impl Into<String>,
        outbound: mpsc::Sender<Outbound>,
        control: mpsc::Sender<ConnectionMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            outbound,
            control,
            cancel,
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Push an event with no correlation id. Returns `false` if the
    /// connection is gone or was terminated for falling behind.
    pub fn push(&self, event: ServerEvent) -> bool {
        match self.outbound.try_send(Outbound::Event { id: None, event }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.terminate_slow_consumer();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Tell the connection actor its room session is over.
    pub fn end_session(&self, room_id: &str, reason: &str) -> bool {
        let message = ConnectionMessage::SessionEnded {
            room_id: room_id.to_string(),
            reason: reason.to_string(),
        };
        match self.control.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.terminate_slow_consumer();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn terminate_slow_consumer(&self) {
        metrics::record_message_dropped("connection");
        warn!(
            target: "sfu.gateway.connection",
            connection_id = %self.connection_id,
            "Outbound queue full, terminating slow consumer"
        );
        self.cancel.cancel();
    }
}

/// Messages sent to the `SessionDirectory`.
#[derive(Debug)]
pub enum DirectoryMessage {
    /// Get the room actor for `room_id`, starting one if needed.
    Room {
        room_id: String,
        respond_to: oneshot::Sender<Result<RoomActorHandle, SfuError>>,
    },

    /// Forward a relayed event to the local room actor, if any.
    Relay { room_id: String, event: RoomEvent },

    /// End the session of a local room (worker loss).
    EndSession { room_id: String, reason: String },

    GetStatus {
        respond_to: oneshot::Sender<DirectoryStatus>,
    },
}

/// Directory status for `/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryStatus {
    pub room_count: usize,
    pub participant_count: usize,
    pub connection_count: usize,
    pub is_draining: bool,
    pub mailbox_depth: usize,
}

/// Messages sent to a `RoomActor`.
#[derive(Debug)]
pub enum RoomMessage {
    Join {
        request: JoinRequest,
        respond_to: oneshot::Sender<Result<JoinOutcome, SfuError>>,
    },

    Leave {
        participant_id: String,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    /// A transport, producer, or consumer operation.
    Media {
        participant_id: String,
        request: MediaRequest,
        respond_to: oneshot::Sender<Result<ServerEvent, SfuError>>,
    },

    /// Event published by another replica.
    Relay { event: RoomEvent },

    EndSession { reason: String },

    GetState {
        respond_to: oneshot::Sender<RoomState>,
    },
}

/// Everything the room needs to admit a connection.
#[derive(Debug)]
pub struct JoinRequest {
    pub user_id: String,
    pub display_name: String,
    pub role: Role,
    pub capabilities: EngineBlob,
    pub sink: ClientSink,
}

/// Result of a successful join.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub participant_id: String,
    /// The `room-joined` response.
    pub joined: ServerEvent,
}

/// Local view of a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomState {
    pub room_id: String,
    pub participants: Vec<String>,
    pub node_id: Option<String>,
    pub context_id: Option<String>,
}

/// Room-scoped media operations, one per client request that needs a room.
#[derive(Debug, Clone)]
pub enum MediaRequest {
    CreateTransport {
        direction: TransportDirection,
        extra_capabilities: EngineBlob,
    },
    ConnectTransport {
        transport_id: String,
        security_params: EngineBlob,
    },
    Produce {
        transport_id: String,
        kind: MediaKind,
        media_params: EngineBlob,
        source: Option<MediaSource>,
        app_data: EngineBlob,
    },
    Consume {
        producer_id: String,
        consumer_capabilities: EngineBlob,
        transport_id: Option<String>,
    },
    ResumeConsumer { consumer_id: String },
    PauseConsumer { consumer_id: String },
    PauseProducer { producer_id: String },
    ResumeProducer { producer_id: String },
    CloseProducer { producer_id: String },
    SetPreferredLayers {
        consumer_id: String,
        spatial_layer: u8,
        temporal_layer: Option<u8>,
    },
}

impl MediaRequest {
    #[must_use]
    pub fn op(&self) -> &'static str {
        match self {
            MediaRequest::CreateTransport { .. } => "create-transport",
            MediaRequest::ConnectTransport { .. } => "connect-transport",
            MediaRequest::Produce { .. } => "produce",
            MediaRequest::Consume { .. } => "consume",
            MediaRequest::ResumeConsumer { .. } => "resume-consumer",
            MediaRequest::PauseConsumer { .. } => "pause-consumer",
            MediaRequest::PauseProducer { .. } => "pause-producer",
            MediaRequest::ResumeProducer { .. } => "resume-producer",
            MediaRequest::CloseProducer { .. } => "close-producer",
            MediaRequest::SetPreferredLayers { .. } => "set-preferred-layers",
        }
    }
}

impl TryFrom<ClientRequest> for MediaRequest {
    type Error = ClientRequest;

    fn try_from(request: ClientRequest) -> Result<Self, Self::Error> {
        Ok(match request {
            ClientRequest::CreateTransport {
                direction,
                extra_capabilities,
            } => MediaRequest::CreateTransport {
                direction,
                extra_capabilities,
            },
            ClientRequest::ConnectTransport {
                transport_id,
                security_params,
            } => MediaRequest::ConnectTransport {
                transport_id,
                security_params,
            },
            ClientRequest::Produce {
                transport_id,
                kind,
                media_params,
                source,
                app_data,
            } => MediaRequest::Produce {
                transport_id,
                kind,
                media_params,
                source,
                app_data,
            },
            ClientRequest::Consume {
                producer_id,
                consumer_capabilities,
                transport_id,
            } => MediaRequest::Consume {
                producer_id,
                consumer_capabilities,
                transport_id,
            },
            ClientRequest::ResumeConsumer { consumer_id } => {
                MediaRequest::ResumeConsumer { consumer_id }
            }
            ClientRequest::PauseConsumer { consumer_id } => MediaRequest::PauseConsumer { consumer_id },
            ClientRequest::PauseProducer { producer_id } => MediaRequest::PauseProducer { producer_id },
            ClientRequest::ResumeProducer { producer_id } => {
                MediaRequest::ResumeProducer { producer_id }
            }
            ClientRequest::CloseProducer { producer_id } => MediaRequest::CloseProducer { producer_id },
            ClientRequest::SetPreferredLayers {
                consumer_id,
                spatial_layer,
                temporal_layer,
            } => MediaRequest::SetPreferredLayers {
                consumer_id,
                spatial_layer,
                temporal_layer,
            },
            other @ (ClientRequest::Authenticate { .. }
            | ClientRequest::JoinRoom { .. }
            | ClientRequest::LeaveRoom {}
            | ClientRequest::Heartbeat {}) => return Err(other),
        })
    }
}

/// Room activity shared between replicas over `room:{id}:events`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RoomEvent {
    #[serde(rename_all = "camelCase")]
    ParticipantJoined { participant: ParticipantSummary },

    #[serde(rename_all = "camelCase")]
    ParticipantLeft { participant_id: String },

    #[serde(rename_all = "camelCase")]
    NewProducer {
        participant_id: String,
        producer: ProducerSummary,
    },

    #[serde(rename_all = "camelCase")]
    ProducerPaused {
        participant_id: String,
        producer_id: String,
    },

    #[serde(rename_all = "camelCase")]
    ProducerResumed {
        participant_id: String,
        producer_id: String,
    },

    #[serde(rename_all = "camelCase")]
    ProducerClosed {
        participant_id: String,
        producer_id: String,
    },

    /// Consumers closed because their producer went away. Each replica
    /// notifies the owners it holds.
    #[serde(rename_all = "camelCase")]
    ConsumersClosed { closed: Vec<ClosedConsumer> },

    #[serde(rename_all = "camelCase")]
    SessionEnded { reason: String },
}

/// Wire form of a relayed [`RoomEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayEnvelope {
    /// Node that published the event; it skips its own events.
    pub origin: String,
    pub event: RoomEvent,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sink(capacity: usize) -> (ClientSink, mpsc::Receiver<Outbound>, CancellationToken) {
        let (outbound, outbound_rx) = mpsc::channel(capacity);
        let (control, _control_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        (
            ClientSink::new("conn-1", outbound, control, cancel.clone()),
            outbound_rx,
            cancel,
        )
    }

    #[test]
    fn test_push_delivers_without_id() {
        let (sink, mut rx, _cancel) = sink(4);
        assert!(sink.push(ServerEvent::ParticipantLeft {
            participant_id: "a".to_string()
        }));

        let frame = rx.try_recv().unwrap();
        assert!(matches!(frame, Outbound::Event { id: None, .. }));
    }

    #[test]
    fn test_full_queue_terminates_connection() {
        let (sink, _rx, cancel) = sink(1);
        assert!(sink.push(ServerEvent::HeartbeatAck { server_time: 1 }));
        assert!(!sink.push(ServerEvent::HeartbeatAck { server_time: 2 }));
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_closed_queue_is_not_a_slow_consumer() {
        let (sink, rx, cancel) = sink(1);
        drop(rx);
        assert!(!sink.push(ServerEvent::HeartbeatAck { server_time: 1 }));
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn test_media_request_from_client_request() {
        let request: ClientRequest = serde_json::from_value(json!({
            "event": "pause-producer",
            "data": {"producerId": "p1"}
        }))
        .unwrap();
        let media = MediaRequest::try_from(request).unwrap();
        assert_eq!(media.op(), "pause-producer");

        let heartbeat: ClientRequest =
            serde_json::from_value(json!({"event": "heartbeat", "data": {}})).unwrap();
        assert!(MediaRequest::try_from(heartbeat).is_err());
    }

    #[test]
    fn test_relay_envelope_wire_shape() {
        let envelope = RelayEnvelope {
            origin: "node-a".to_string(),
            event: RoomEvent::ParticipantLeft {
                participant_id: "u-1".to_string(),
            },
        };

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({"origin": "node-a", "event": {"type": "participant-left", "participantId": "u-1"}})
        );
    }
}
