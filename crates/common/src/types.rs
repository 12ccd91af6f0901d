//! Shared vocabulary for rooms, participants, and media.
//!
//! These enums cross every boundary in the system (client wire protocol,
//! coordination store records, internal routing RPC), so their serialized
//! spelling is part of the contract.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Role a participant holds inside a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Host,
    CoHost,
    Moderator,
    Viewer,
}

impl Role {
    /// Token permission required to join with this role, if any.
    #[must_use]
    pub fn required_permission(self) -> Option<&'static str> {
        match self {
            Role::Host | Role::CoHost => Some("rooms:host"),
            Role::Moderator => Some("rooms:moderate"),
            Role::Viewer => None,
        }
    }

    /// Whether participants with this role may publish media.
    #[must_use]
    pub fn can_produce(self) -> bool {
        !matches!(self, Role::Viewer)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Host => "host",
            Role::CoHost => "co-host",
            Role::Moderator => "moderator",
            Role::Viewer => "viewer",
        };
        f.write_str(s)
    }
}

/// Media track kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Source assumed when a producer does not declare one.
    #[must_use]
    pub fn default_source(self) -> MediaSource {
        match self {
            MediaKind::Audio => MediaSource::Microphone,
            MediaKind::Video => MediaSource::Camera,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a producer's media originates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MediaSource {
    Camera,
    Microphone,
    Screen,
    ScreenAudio,
}

/// Direction of a transport relative to the participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    /// Participant sends media to the engine.
    Send,
    /// Participant receives media from the engine.
    Recv,
}

impl fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportDirection::Send => f.write_str("send"),
            TransportDirection::Recv => f.write_str("recv"),
        }
    }
}

/// Engine-native parameters carried through the core untouched.
///
/// Security/ICE parameters, RTP capabilities, and codec parameters are
/// produced and consumed by the media engine and the client. Everything
/// between them forwards the value as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngineBlob(pub serde_json::Value);

impl EngineBlob {
    /// An empty blob (`null`).
    #[must_use]
    pub fn empty() -> Self {
        Self(serde_json::Value::Null)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_null()
    }

    #[must_use]
    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

impl From<serde_json::Value> for EngineBlob {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}
