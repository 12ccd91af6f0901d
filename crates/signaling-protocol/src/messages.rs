//! Typed client requests and server events.
//!
//! Both enums are adjacently tagged so they serialize to exactly
//! `{"event": "...", "data": {...}}`. Field names are camelCase on the wire.

use common::secret::SecretString;
use common::types::{EngineBlob, MediaKind, MediaSource, Role, TransportDirection};
use serde::{Deserialize, Serialize};

/// Event names a client may send.
pub const CLIENT_EVENTS: &[&str] = &[
    "authenticate",
    "join-room",
    "create-transport",
    "connect-transport",
    "produce",
    "consume",
    "resume-consumer",
    "pause-consumer",
    "pause-producer",
    "resume-producer",
    "close-producer",
    "set-preferred-layers",
    "leave-room",
    "heartbeat",
];

/// Request sent by a client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientRequest {
    #[serde(rename_all = "camelCase")]
    Authenticate {
        token: SecretString,
        organization_id: String,
    },

    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: String,
        role: Role,
        display_name: String,
        #[serde(default)]
        capabilities: EngineBlob,
    },

    #[serde(rename_all = "camelCase")]
    CreateTransport {
        direction: TransportDirection,
        #[serde(default)]
        extra_capabilities: EngineBlob,
    },

    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        transport_id: String,
        security_params: EngineBlob,
    },

    #[serde(rename_all = "camelCase")]
    Produce {
        transport_id: String,
        kind: MediaKind,
        media_params: EngineBlob,
        #[serde(default)]
        source: Option<MediaSource>,
        #[serde(default)]
        app_data: EngineBlob,
    },

    /// `transportId` defaults to the caller's receive transport.
    #[serde(rename_all = "camelCase")]
    Consume {
        producer_id: String,
        consumer_capabilities: EngineBlob,
        #[serde(default)]
        transport_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    ResumeConsumer { consumer_id: String },

    #[serde(rename_all = "camelCase")]
    PauseConsumer { consumer_id: String },

    #[serde(rename_all = "camelCase")]
    PauseProducer { producer_id: String },

    #[serde(rename_all = "camelCase")]
    ResumeProducer { producer_id: String },

    #[serde(rename_all = "camelCase")]
    CloseProducer { producer_id: String },

    #[serde(rename_all = "camelCase")]
    SetPreferredLayers {
        consumer_id: String,
        spatial_layer: u8,
        #[serde(default)]
        temporal_layer: Option<u8>,
    },

    LeaveRoom {},

    Heartbeat {},
}

impl ClientRequest {
    /// Wire name of this request.
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientRequest::Authenticate { .. } => "authenticate",
            ClientRequest::JoinRoom { .. } => "join-room",
            ClientRequest::CreateTransport { .. } => "create-transport",
            ClientRequest::ConnectTransport { .. } => "connect-transport",
            ClientRequest::Produce { .. } => "produce",
            ClientRequest::Consume { .. } => "consume",
            ClientRequest::ResumeConsumer { .. } => "resume-consumer",
            ClientRequest::PauseConsumer { .. } => "pause-consumer",
            ClientRequest::PauseProducer { .. } => "pause-producer",
            ClientRequest::ResumeProducer { .. } => "resume-producer",
            ClientRequest::CloseProducer { .. } => "close-producer",
            ClientRequest::SetPreferredLayers { .. } => "set-preferred-layers",
            ClientRequest::LeaveRoom {} => "leave-room",
            ClientRequest::Heartbeat {} => "heartbeat",
        }
    }
}

/// Placement of the room the client joined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRef {
    pub node_id: String,
    pub context_id: String,
}

/// A published track as seen by other participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSummary {
    pub producer_id: String,
    pub kind: MediaKind,
    pub source: MediaSource,
    pub paused: bool,
    #[serde(default)]
    pub app_data: EngineBlob,
}

/// A roster entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSummary {
    pub participant_id: String,
    pub user_id: String,
    pub display_name: String,
    pub role: Role,
    #[serde(default)]
    pub producers: Vec<ProducerSummary>,
}

/// Event sent by the server, either as a direct response or as a push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Authenticated {
        user_id: String,
        organization_id: String,
    },

    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room_id: String,
        participant_id: String,
        engine_capabilities: EngineBlob,
        participants: Vec<ParticipantSummary>,
        node_ref: NodeRef,
    },

    #[serde(rename_all = "camelCase")]
    ParticipantJoined { participant: ParticipantSummary },

    #[serde(rename_all = "camelCase")]
    ParticipantLeft { participant_id: String },

    #[serde(rename_all = "camelCase")]
    TransportCreated {
        transport_id: String,
        direction: TransportDirection,
        security_params: EngineBlob,
    },

    #[serde(rename_all = "camelCase")]
    TransportConnected { transport_id: String },

    #[serde(rename_all = "camelCase")]
    Produced { producer_id: String },

    #[serde(rename_all = "camelCase")]
    NewProducer {
        producer_id: String,
        participant_id: String,
        kind: MediaKind,
        source: MediaSource,
        #[serde(default)]
        app_data: EngineBlob,
    },

    #[serde(rename_all = "camelCase")]
    ConsumerCreated {
        consumer_id: String,
        producer_id: String,
        kind: MediaKind,
        media_params: EngineBlob,
        paused: bool,
    },

    #[serde(rename_all = "camelCase")]
    CannotConsume { producer_id: String, reason: String },

    #[serde(rename_all = "camelCase")]
    ConsumerResumed { consumer_id: String },

    #[serde(rename_all = "camelCase")]
    ConsumerPaused { consumer_id: String },

    #[serde(rename_all = "camelCase")]
    ConsumerClosed {
        consumer_id: String,
        producer_id: String,
    },

    #[serde(rename_all = "camelCase")]
    ProducerPaused {
        producer_id: String,
        participant_id: String,
    },

    #[serde(rename_all = "camelCase")]
    ProducerResumed {
        producer_id: String,
        participant_id: String,
    },

    #[serde(rename_all = "camelCase")]
    ProducerClosed {
        producer_id: String,
        participant_id: String,
    },

    #[serde(rename_all = "camelCase")]
    PreferredLayersSet { consumer_id: String },

    #[serde(rename_all = "camelCase")]
    RoomLeft { room_id: String },

    #[serde(rename_all = "camelCase")]
    SessionEnded { room_id: String, reason: String },

    #[serde(rename_all = "camelCase")]
    HeartbeatAck { server_time: i64 },

    #[serde(rename_all = "camelCase")]
    Error {
        message: String,
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
    },
}

impl ServerEvent {
    /// Wire name of this event.
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerEvent::Authenticated { .. } => "authenticated",
            ServerEvent::RoomJoined { .. } => "room-joined",
            ServerEvent::ParticipantJoined { .. } => "participant-joined",
            ServerEvent::ParticipantLeft { .. } => "participant-left",
            ServerEvent::TransportCreated { .. } => "transport-created",
            ServerEvent::TransportConnected { .. } => "transport-connected",
            ServerEvent::Produced { .. } => "produced",
            ServerEvent::NewProducer { .. } => "new-producer",
            ServerEvent::ConsumerCreated { .. } => "consumer-created",
            ServerEvent::CannotConsume { .. } => "cannot-consume",
            ServerEvent::ConsumerResumed { .. } => "consumer-resumed",
            ServerEvent::ConsumerPaused { .. } => "consumer-paused",
            ServerEvent::ConsumerClosed { .. } => "consumer-closed",
            ServerEvent::ProducerPaused { .. } => "producer-paused",
            ServerEvent::ProducerResumed { .. } => "producer-resumed",
            ServerEvent::ProducerClosed { .. } => "producer-closed",
            ServerEvent::PreferredLayersSet { .. } => "preferred-layers-set",
            ServerEvent::RoomLeft { .. } => "room-left",
            ServerEvent::SessionEnded { .. } => "session-ended",
            ServerEvent::HeartbeatAck { .. } => "heartbeat-ack",
            ServerEvent::Error { .. } => "error",
        }
    }

    /// Build an `error` event.
    #[must_use]
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
            code: code.into(),
            retry_after_ms: None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use common::secret::ExposeSecret;
    use serde_json::json;

    #[test]
    fn test_join_room_parses_camel_case_fields() {
        let req: ClientRequest = serde_json::from_value(json!({
            "event": "join-room",
            "data": {"roomId": "r1", "role": "co-host", "displayName": "Ada"}
        }))
        .unwrap();

        match req {
            ClientRequest::JoinRoom {
                room_id,
                role,
                display_name,
                capabilities,
            } => {
                assert_eq!(room_id, "r1");
                assert_eq!(role, Role::CoHost);
                assert_eq!(display_name, "Ada");
                assert!(capabilities.is_empty());
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_authenticate_token_is_redacted() {
        let req: ClientRequest = serde_json::from_value(json!({
            "event": "authenticate",
            "data": {"token": "eyJ.secret.sig", "organizationId": "org-1"}
        }))
        .unwrap();

        assert!(!format!("{req:?}").contains("eyJ.secret.sig"));
        match req {
            ClientRequest::Authenticate { token, .. } => {
                assert_eq!(token.expose_secret(), "eyJ.secret.sig");
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_every_request_name_is_listed() {
        let samples = [
            json!({"event": "leave-room", "data": {}}),
            json!({"event": "heartbeat", "data": {}}),
            json!({"event": "close-producer", "data": {"producerId": "p"}}),
            json!({"event": "set-preferred-layers", "data": {"consumerId": "c", "spatialLayer": 1}}),
        ];
        for sample in samples {
            let req: ClientRequest = serde_json::from_value(sample).unwrap();
            assert!(CLIENT_EVENTS.contains(&req.event_name()));
        }
    }

    #[test]
    fn test_server_event_shape() {
        let event = ServerEvent::NewProducer {
            producer_id: "p1".to_string(),
            participant_id: "a".to_string(),
            kind: MediaKind::Video,
            source: MediaSource::Camera,
            app_data: EngineBlob::empty(),
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "new-producer");
        assert_eq!(value["data"]["producerId"], "p1");
        assert_eq!(value["data"]["kind"], "video");
        assert_eq!(event.event_name(), "new-producer");
    }

    #[test]
    fn test_error_event_helper() {
        let value = serde_json::to_value(ServerEvent::error("NOT_IN_ROOM", "Join a room first")).unwrap();
        assert_eq!(
            value,
            json!({"event": "error", "data": {"message": "Join a room first", "code": "NOT_IN_ROOM"}})
        );
    }
}
