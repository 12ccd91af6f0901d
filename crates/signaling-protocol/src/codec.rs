//! Codec for the JSON signaling envelope.
//!
//! Inbound frames are validated in this order: size, JSON shape, event name,
//! payload. A frame that fails after its `id` was readable keeps that `id`, so
//! the error response can still be correlated.

use crate::messages::{ClientRequest, ServerEvent, CLIENT_EVENTS};
use serde_json::{Map, Value};

/// Correlation id attached to a request and echoed by its response.
pub type CorrelationId = u64;

/// Error type for codec operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Frame exceeds the configured size limit
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Frame is not a JSON object with a string `event`
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Event name is not part of the client protocol
    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    /// Event is known but `data` does not match its schema
    #[error("Invalid payload for {event}: {reason}")]
    InvalidPayload { event: String, reason: String },

    /// Outbound serialization failed
    #[error("Encoding failed: {0}")]
    Encode(String),
}

/// A decoded client request.
#[derive(Debug, Clone)]
pub struct InboundEnvelope {
    /// Client-supplied correlation id, if any.
    pub id: Option<CorrelationId>,
    pub request: ClientRequest,
}

/// A frame that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{error}")]
pub struct RejectedFrame {
    /// Correlation id recovered from the frame, if it got that far.
    pub id: Option<CorrelationId>,
    pub error: ProtocolError,
}

impl RejectedFrame {
    fn new(id: Option<CorrelationId>, error: ProtocolError) -> Self {
        Self { id, error }
    }
}

/// Decode one inbound text frame.
///
/// # Errors
///
/// Returns a [`RejectedFrame`] describing the first validation step that failed.
pub fn decode_request(text: &str, max_bytes: usize) -> Result<InboundEnvelope, RejectedFrame> {
    if text.len() > max_bytes {
        return Err(RejectedFrame::new(
            None,
            ProtocolError::MessageTooLarge {
                size: text.len(),
                max: max_bytes,
            },
        ));
    }

    let value: Value = serde_json::from_str(text).map_err(|e| {
        RejectedFrame::new(None, ProtocolError::MalformedEnvelope(e.to_string()))
    })?;

    let Value::Object(mut object) = value else {
        return Err(RejectedFrame::new(
            None,
            ProtocolError::MalformedEnvelope("expected a JSON object".to_string()),
        ));
    };

    let id = object.get("id").and_then(Value::as_u64);

    let event = match object.remove("event") {
        Some(Value::String(event)) => event,
        _ => {
            return Err(RejectedFrame::new(
                id,
                ProtocolError::MalformedEnvelope("missing string field `event`".to_string()),
            ))
        }
    };

    if !CLIENT_EVENTS.contains(&event.as_str()) {
        tracing::debug!(target: "sfu.protocol", event = %event, "Unknown client event");
        return Err(RejectedFrame::new(id, ProtocolError::UnknownEvent(event)));
    }

    // Field-less events may omit `data` entirely.
    let data = match object.remove("data") {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(data) => data,
    };

    let mut tagged = Map::with_capacity(2);
    tagged.insert("event".to_string(), Value::String(event.clone()));
    tagged.insert("data".to_string(), data);

    let request: ClientRequest = serde_json::from_value(Value::Object(tagged)).map_err(|e| {
        RejectedFrame::new(
            id,
            ProtocolError::InvalidPayload {
                event,
                reason: e.to_string(),
            },
        )
    })?;

    Ok(InboundEnvelope { id, request })
}

/// Encode a server event, attaching the correlation id of the request it answers.
///
/// # Errors
///
/// Returns `ProtocolError::Encode` if serialization fails.
pub fn encode_event(id: Option<CorrelationId>, event: &ServerEvent) -> Result<String, ProtocolError> {
    let mut value = serde_json::to_value(event).map_err(|e| ProtocolError::Encode(e.to_string()))?;

    if let (Some(id), Value::Object(object)) = (id, &mut value) {
        object.insert("id".to_string(), Value::from(id));
    }

    serde_json::to_string(&value).map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Decode a server frame. Used by clients and test harnesses.
///
/// # Errors
///
/// Returns `ProtocolError::MalformedEnvelope` if the frame is not a server event.
pub fn decode_event(text: &str) -> Result<(Option<CorrelationId>, ServerEvent), ProtocolError> {
    let mut value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()))?;

    let id = value
        .as_object_mut()
        .and_then(|object| object.remove("id"))
        .and_then(|id| id.as_u64());

    let event =
        serde_json::from_value(value).map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()))?;

    Ok((id, event))
}

/// Build a client frame. Used by clients and test harnesses.
#[must_use]
pub fn encode_request(id: Option<CorrelationId>, event: &str, data: Value) -> String {
    let mut object = Map::with_capacity(3);
    object.insert("event".to_string(), Value::String(event.to_string()));
    object.insert("data".to_string(), data);
    if let Some(id) = id {
        object.insert("id".to_string(), Value::from(id));
    }
    Value::Object(object).to_string()
}
