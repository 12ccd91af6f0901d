//! Routing contexts and the calls that reach them.
//!
//! A room's routing context lives on the node named by its placement. The
//! [`RoutingService`] seam hides where that is:
//!
//! - [`RoutingContextManager`] executes calls against this node's pool
//! - [`remote::RemoteRoutingService`] forwards them to a peer's
//!   `/internal/routing` endpoint
//!
//! [`RouterRegistry`] picks one from a node id and [`RoomRouter`] gives the
//! session directory typed methods on top of either.

pub mod api;
pub mod manager;
pub mod remote;

use std::sync::Arc;

use async_trait::async_trait;
use common::types::{EngineBlob, MediaKind, TransportDirection};
use serde::{Deserialize, Serialize};

use crate::errors::SfuError;

pub use manager::{LostContext, RoutingContextManager};
pub use remote::{RemoteRoutingService, RouterRegistry};

/// Context handed back to a joining room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextInfo {
    pub context_id: String,
    pub capabilities: EngineBlob,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub transport_id: String,
    pub direction: TransportDirection,
    pub security_params: EngineBlob,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub consumer_id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub media_params: EngineBlob,
    pub paused: bool,
}

/// Result of a consume request. Incompatibility is an outcome, not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum ConsumeOutcome {
    Created(ConsumerInfo),
    #[serde(rename_all = "camelCase")]
    Incompatible { reason: String },
}

/// A consumer closed because its producer went away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosedConsumer {
    pub consumer_id: String,
    pub producer_id: String,
    /// Participant that owned the consumer.
    pub participant_id: String,
}

/// Everything closed on behalf of one departing participant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantCleanup {
    pub closed_producers: Vec<String>,
    /// Consumers of other participants that fed on the closed producers.
    pub orphaned_consumers: Vec<ClosedConsumer>,
}

/// One call against a room's routing context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum RoutingCall {
    #[serde(rename_all = "camelCase")]
    CreateContext { room_id: String, context_id: String },

    #[serde(rename_all = "camelCase")]
    CloseContext { room_id: String },

    #[serde(rename_all = "camelCase")]
    CreateTransport {
        room_id: String,
        participant_id: String,
        direction: TransportDirection,
        extra_capabilities: EngineBlob,
    },

    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        room_id: String,
        participant_id: String,
        transport_id: String,
        security_params: EngineBlob,
    },

    #[serde(rename_all = "camelCase")]
    Produce {
        room_id: String,
        participant_id: String,
        transport_id: String,
        kind: MediaKind,
        media_params: EngineBlob,
    },

    #[serde(rename_all = "camelCase")]
    Consume {
        room_id: String,
        participant_id: String,
        transport_id: Option<String>,
        producer_id: String,
        consumer_capabilities: EngineBlob,
    },

    #[serde(rename_all = "camelCase")]
    PauseConsumer {
        room_id: String,
        participant_id: String,
        consumer_id: String,
    },

    #[serde(rename_all = "camelCase")]
    ResumeConsumer {
        room_id: String,
        participant_id: String,
        consumer_id: String,
    },

    #[serde(rename_all = "camelCase")]
    PauseProducer {
        room_id: String,
        participant_id: String,
        producer_id: String,
    },

    #[serde(rename_all = "camelCase")]
    ResumeProducer {
        room_id: String,
        participant_id: String,
        producer_id: String,
    },

    #[serde(rename_all = "camelCase")]
    CloseProducer {
        room_id: String,
        participant_id: String,
        producer_id: String,
    },

    #[serde(rename_all = "camelCase")]
    SetPreferredLayers {
        room_id: String,
        participant_id: String,
        consumer_id: String,
        spatial_layer: u8,
        temporal_layer: Option<u8>,
    },

    #[serde(rename_all = "camelCase")]
    CloseParticipant {
        room_id: String,
        participant_id: String,
    },
}

impl RoutingCall {
    /// Operation name for logs.
    #[must_use]
    pub fn op(&self) -> &'static str {
        match self {
            RoutingCall::CreateContext { .. } => "create-context",
            RoutingCall::CloseContext { .. } => "close-context",
            RoutingCall::CreateTransport { .. } => "create-transport",
            RoutingCall::ConnectTransport { .. } => "connect-transport",
            RoutingCall::Produce { .. } => "produce",
            RoutingCall::Consume { .. } => "consume",
            RoutingCall::PauseConsumer { .. } => "pause-consumer",
            RoutingCall::ResumeConsumer { .. } => "resume-consumer",
            RoutingCall::PauseProducer { .. } => "pause-producer",
            RoutingCall::ResumeProducer { .. } => "resume-producer",
            RoutingCall::CloseProducer { .. } => "close-producer",
            RoutingCall::SetPreferredLayers { .. } => "set-preferred-layers",
            RoutingCall::CloseParticipant { .. } => "close-participant",
        }
    }
}

/// Reply to a [`RoutingCall`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "kebab-case")]
pub enum RoutingReply {
    Context(ContextInfo),
    ContextClosed(bool),
    Transport(TransportInfo),
    Producer(String),
    Consume(ConsumeOutcome),
    ProducerClosed(Vec<ClosedConsumer>),
    ParticipantClosed(ParticipantCleanup),
    Done,
}

/// Executes routing calls, locally or on a peer node.
#[async_trait]
pub trait RoutingService: Send + Sync {
    async fn execute(&self, call: RoutingCall) -> Result<RoutingReply, SfuError>;
}

fn unexpected(op: &str, reply: &RoutingReply) -> SfuError {
    SfuError::Internal(format!("unexpected reply to {op}: {reply:?}"))
}

/// Typed routing calls for one room.
#[derive(Clone)]
pub struct RoomRouter {
    service: Arc<dyn RoutingService>,
    room_id: String,
}

impl RoomRouter {
    #[must_use]
    pub fn new(service: Arc<dyn RoutingService>, room_id: impl Into<String>) -> Self {
        Self {
            service,
            room_id: room_id.into(),
        }
    }

    fn room(&self) -> String {
        self.room_id.clone()
    }

    /// # Errors
    ///
    /// Propagates the routing failure.
    pub async fn create_context(&self, context_id: &str) -> Result<ContextInfo, SfuError> {
        let call = RoutingCall::CreateContext {
            room_id: self.room(),
            context_id: context_id.to_string(),
        };
        match self.service.execute(call).await? {
            RoutingReply::Context(info) => Ok(info),
            other => Err(unexpected("create-context", &other)),
        }
    }

    /// Returns whether a context existed.
    ///
    /// # Errors
    ///
    /// Propagates the routing failure.
    pub async fn close_context(&self) -> Result<bool, SfuError> {
        let call = RoutingCall::CloseContext { room_id: self.room() };
        match self.service.execute(call).await? {
            RoutingReply::ContextClosed(existed) => Ok(existed),
            other => Err(unexpected("close-context", &other)),
        }
    }

    /// # Errors
    ///
    /// Propagates the routing failure.
    pub async fn create_transport(
        &self,
        participant_id: &str,
        direction: TransportDirection,
        extra_capabilities: EngineBlob,
    ) -> Result<TransportInfo, SfuError> {
        let call = RoutingCall::CreateTransport {
            room_id: self.room(),
            participant_id: participant_id.to_string(),
            direction,
            extra_capabilities,
        };
        match self.service.execute(call).await? {
            RoutingReply::Transport(info) => Ok(info),
            other => Err(unexpected("create-transport", &other)),
        }
    }

    /// # Errors
    ///
    /// Propagates the routing failure.
    pub async fn connect_transport(
        &self,
        participant_id: &str,
        transport_id: String,
        security_params: EngineBlob,
    ) -> Result<(), SfuError> {
        let call = RoutingCall::ConnectTransport {
            room_id: self.room(),
            participant_id: participant_id.to_string(),
            transport_id,
            security_params,
        };
        self.expect_done("connect-transport", call).await
    }

    /// Returns the new producer id.
    ///
    /// # Errors
    ///
    /// Propagates the routing failure.
    pub async fn produce(
        &self,
        participant_id: &str,
        transport_id: String,
        kind: MediaKind,
        media_params: EngineBlob,
    ) -> Result<String, SfuError> {
        let call = RoutingCall::Produce {
            room_id: self.room(),
            participant_id: participant_id.to_string(),
            transport_id,
            kind,
            media_params,
        };
        match self.service.execute(call).await? {
            RoutingReply::Producer(producer_id) => Ok(producer_id),
            other => Err(unexpected("produce", &other)),
        }
    }

    /// # Errors
    ///
    /// Propagates the routing failure. Incompatible capabilities are `Ok`.
    pub async fn consume(
        &self,
        participant_id: &str,
        transport_id: Option<String>,
        producer_id: String,
        consumer_capabilities: EngineBlob,
    ) -> Result<ConsumeOutcome, SfuError> {
        let call = RoutingCall::Consume {
            room_id: self.room(),
            participant_id: participant_id.to_string(),
            transport_id,
            producer_id,
            consumer_capabilities,
        };
        match self.service.execute(call).await? {
            RoutingReply::Consume(outcome) => Ok(outcome),
            other => Err(unexpected("consume", &other)),
        }
    }

    /// # Errors
    ///
    /// Propagates the routing failure.
    pub async fn pause_consumer(&self, participant_id: &str, consumer_id: String) -> Result<(), SfuError> {
        let call = RoutingCall::PauseConsumer {
            room_id: self.room(),
            participant_id: participant_id.to_string(),
            consumer_id,
        };
        self.expect_done("pause-consumer", call).await
    }

    /// # Errors
    ///
    /// Propagates the routing failure.
    pub async fn resume_consumer(&self, participant_id: &str, consumer_id: String) -> Result<(), SfuError> {
        let call = RoutingCall::ResumeConsumer {
            room_id: self.room(),
            participant_id: participant_id.to_string(),
            consumer_id,
        };
        self.expect_done("resume-consumer", call).await
    }

    /// # Errors
    ///
    /// Propagates the routing failure.
    pub async fn pause_producer(&self, participant_id: &str, producer_id: String) -> Result<(), SfuError> {
        let call = RoutingCall::PauseProducer {
            room_id: self.room(),
            participant_id: participant_id.to_string(),
            producer_id,
        };
        self.expect_done("pause-producer", call).await
    }

    /// # Errors
    ///
    /// Propagates the routing failure.
    pub async fn resume_producer(&self, participant_id: &str, producer_id: String) -> Result<(), SfuError> {
        let call = RoutingCall::ResumeProducer {
            room_id: self.room(),
            participant_id: participant_id.to_string(),
            producer_id,
        };
        self.expect_done("resume-producer", call).await
    }

    /// Returns the consumers that closed with the producer.
    ///
    /// # Errors
    ///
    /// Propagates the routing failure.
    pub async fn close_producer(
        &self,
        participant_id: &str,
        producer_id: String,
    ) -> Result<Vec<ClosedConsumer>, SfuError> {
        let call = RoutingCall::CloseProducer {
            room_id: self.room(),
            participant_id: participant_id.to_string(),
            producer_id,
        };
        match self.service.execute(call).await? {
            RoutingReply::ProducerClosed(closed) => Ok(closed),
            other => Err(unexpected("close-producer", &other)),
        }
    }

    /// # Errors
    ///
    /// Propagates the routing failure.
    pub async fn set_preferred_layers(
        &self,
        participant_id: &str,
        consumer_id: String,
        spatial_layer: u8,
        temporal_layer: Option<u8>,
    ) -> Result<(), SfuError> {
        let call = RoutingCall::SetPreferredLayers {
            room_id: self.room(),
            participant_id: participant_id.to_string(),
            consumer_id,
            spatial_layer,
            temporal_layer,
        };
        self.expect_done("set-preferred-layers", call).await
    }

    /// Close everything the participant owns in the room.
    ///
    /// # Errors
    ///
    /// Propagates the routing failure.
    pub async fn close_participant(&self, participant_id: &str) -> Result<ParticipantCleanup, SfuError> {
        let call = RoutingCall::CloseParticipant {
            room_id: self.room(),
            participant_id: participant_id.to_string(),
        };
        match self.service.execute(call).await? {
            RoutingReply::ParticipantClosed(cleanup) => Ok(cleanup),
            other => Err(unexpected("close-participant", &other)),
        }
    }

    async fn expect_done(&self, op: &str, call: RoutingCall) -> Result<(), SfuError> {
        match self.service.execute(call).await? {
            RoutingReply::Done => Ok(()),
            other => Err(unexpected(op, &other)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_wire_shape() {
        let call = RoutingCall::Consume {
            room_id: "r1".to_string(),
            participant_id: "b".to_string(),
            transport_id: None,
            producer_id: "p1".to_string(),
            consumer_capabilities: EngineBlob::from(json!({"codecs": []})),
        };

        let value = serde_json::to_value(&call).unwrap();
        assert_eq!(value["op"], "consume");
        assert_eq!(value["roomId"], "r1");
        assert_eq!(value["producerId"], "p1");
        assert_eq!(call.op(), "consume");

        let back: RoutingCall = serde_json::from_value(value).unwrap();
        assert_eq!(back, call);
    }

    #[test]
    fn test_reply_wire_shape() {
        let reply = RoutingReply::Consume(ConsumeOutcome::Incompatible {
            reason: "no common codec".to_string(),
        });
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["kind"], "consume");
        assert_eq!(value["data"]["outcome"], "incompatible");

        let done = serde_json::to_value(RoutingReply::Done).unwrap();
        assert_eq!(done, json!({"kind": "done"}));
    }
}
