//! SFU node error types.
//!
//! Every error that can reach a client maps to a stable string code carried
//! in the `error` event. Internal details are logged server-side but not
//! exposed to clients.

use std::time::Duration;

use signaling_protocol::{ProtocolError, ServerEvent};
use thiserror::Error;

use crate::cluster::StoreError;
use crate::engine::EngineError;

/// SFU node error type.
///
/// Per-request errors (authentication, state, rate limit) are reported to the
/// originating connection only. `WorkerLost` additionally ends the session of
/// every participant in the affected room.
#[derive(Debug, Error)]
pub enum SfuError {
    /// Token missing, malformed, expired, or not verifiable.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Request requires a successful `authenticate` first.
    #[error("Not authenticated")]
    AuthenticationRequired,

    /// Authenticated, but not a member or not allowed in the requested role.
    #[error("Authorization failed: {0}")]
    Authorization(String),

    /// Request requires a prior `join-room`.
    #[error("Not in a room")]
    NotInRoom,

    /// Request is not valid in the connection's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// No healthy node could take the room, or allocation timed out.
    #[error("Allocation failed: {0}")]
    Allocation(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Produce error: {0}")]
    Produce(String),

    #[error("Consume error: {0}")]
    Consume(String),

    /// Transport, producer, or consumer unknown or not owned by the caller.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// The worker holding the room's routing context died.
    #[error("Media worker lost: {0}")]
    WorkerLost(String),

    /// The room actor shut down while the request was in flight.
    #[error("Room closed: {0}")]
    RoomClosed(String),

    /// Coordination store unreachable or returned an error.
    #[error("Coordination error: {0}")]
    Coordination(String),

    /// Peer node unreachable over the routing RPC.
    #[error("Peer node error: {0}")]
    Peer(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Node is shutting down.
    #[error("Node is draining")]
    Draining,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SfuError {
    /// Stable code carried in the `error` event.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            SfuError::Authentication(_) => "AUTH_FAILED",
            SfuError::AuthenticationRequired => "AUTH_REQUIRED",
            SfuError::Authorization(_) => "FORBIDDEN",
            SfuError::NotInRoom => "NOT_IN_ROOM",
            SfuError::InvalidState(_) => "INVALID_STATE",
            SfuError::Allocation(_) => "ALLOCATION_FAILED",
            SfuError::Transport(_) => "TRANSPORT_FAILED",
            SfuError::Produce(_) => "PRODUCE_FAILED",
            SfuError::Consume(_) => "CONSUME_FAILED",
            SfuError::NotFound(_) => "NOT_FOUND",
            SfuError::RateLimited { .. } => "RATE_LIMITED",
            SfuError::WorkerLost(_) => "WORKER_LOST",
            SfuError::RoomClosed(_) => "ROOM_CLOSED",
            SfuError::Coordination(_) | SfuError::Peer(_) => "UNAVAILABLE",
            SfuError::Protocol(ProtocolError::UnknownEvent(_)) => "UNKNOWN_EVENT",
            SfuError::Protocol(ProtocolError::MessageTooLarge { .. }) => "MESSAGE_TOO_LARGE",
            SfuError::Protocol(_) => "BAD_REQUEST",
            SfuError::Draining => "DRAINING",
            SfuError::Config(_) | SfuError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Client-safe message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            SfuError::Authentication(_) => "Invalid or expired token".to_string(),
            SfuError::AuthenticationRequired => "Authenticate before sending this request".to_string(),
            SfuError::Authorization(msg) | SfuError::InvalidState(msg) | SfuError::NotFound(msg) => {
                msg.clone()
            }
            SfuError::NotInRoom => "Join a room before sending this request".to_string(),
            SfuError::Allocation(_) => "No media server is available, please retry".to_string(),
            SfuError::Transport(_) => "Transport negotiation failed".to_string(),
            SfuError::Produce(_) => "Could not publish track".to_string(),
            SfuError::Consume(_) => "Could not subscribe to track".to_string(),
            SfuError::RateLimited { retry_after } => {
                format!("Too many requests, retry after {} ms", retry_after.as_millis())
            }
            SfuError::WorkerLost(_) => "Media session was lost, please rejoin".to_string(),
            SfuError::RoomClosed(_) => "Room was closed, please rejoin".to_string(),
            SfuError::Coordination(_) | SfuError::Peer(_) => {
                "Service temporarily unavailable, please retry".to_string()
            }
            SfuError::Protocol(e) => e.to_string(),
            SfuError::Draining => "Server is shutting down, please reconnect".to_string(),
            SfuError::Config(_) | SfuError::Internal(_) => "An internal error occurred".to_string(),
        }
    }

    /// Whether the client may retry the same request (possibly after rejoining).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SfuError::Allocation(_)
                | SfuError::Transport(_)
                | SfuError::Produce(_)
                | SfuError::Consume(_)
                | SfuError::RateLimited { .. }
                | SfuError::WorkerLost(_)
                | SfuError::RoomClosed(_)
                | SfuError::Coordination(_)
                | SfuError::Peer(_)
                | SfuError::Draining
        )
    }

    /// Inner detail of the error, as forwarded to peer nodes.
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            SfuError::Authentication(d)
            | SfuError::Authorization(d)
            | SfuError::InvalidState(d)
            | SfuError::Allocation(d)
            | SfuError::Transport(d)
            | SfuError::Produce(d)
            | SfuError::Consume(d)
            | SfuError::NotFound(d)
            | SfuError::WorkerLost(d)
            | SfuError::RoomClosed(d)
            | SfuError::Coordination(d)
            | SfuError::Peer(d)
            | SfuError::Config(d)
            | SfuError::Internal(d) => d.clone(),
            other => other.to_string(),
        }
    }

    /// Rebuild an error received from a peer node by its code.
    #[must_use]
    pub fn from_remote(code: &str, message: String) -> Self {
        match code {
            "AUTH_FAILED" => SfuError::Authentication(message),
            "FORBIDDEN" => SfuError::Authorization(message),
            "NOT_IN_ROOM" => SfuError::NotInRoom,
            "INVALID_STATE" => SfuError::InvalidState(message),
            "ALLOCATION_FAILED" => SfuError::Allocation(message),
            "TRANSPORT_FAILED" => SfuError::Transport(message),
            "PRODUCE_FAILED" => SfuError::Produce(message),
            "CONSUME_FAILED" => SfuError::Consume(message),
            "NOT_FOUND" => SfuError::NotFound(message),
            "WORKER_LOST" => SfuError::WorkerLost(message),
            "ROOM_CLOSED" => SfuError::RoomClosed(message),
            "UNAVAILABLE" => SfuError::Peer(message),
            "DRAINING" => SfuError::Draining,
            _ => SfuError::Internal(message),
        }
    }

    /// The `error` event sent to the client for this error.
    #[must_use]
    pub fn to_event(&self) -> ServerEvent {
        let retry_after_ms = match self {
            SfuError::RateLimited { retry_after } => {
                Some(u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX))
            }
            _ => None,
        };

        ServerEvent::Error {
            message: self.client_message(),
            code: self.error_code().to_string(),
            retry_after_ms,
        }
    }
}

impl From<StoreError> for SfuError {
    fn from(err: StoreError) -> Self {
        SfuError::Coordination(err.to_string())
    }
}

impl From<EngineError> for SfuError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::WorkerUnavailable(slot) => {
                SfuError::WorkerLost(format!("worker slot {slot} is not running"))
            }
            EngineError::NoLiveWorkers => SfuError::WorkerLost("no live media worker".to_string()),
            EngineError::Terminated => SfuError::WorkerLost("worker terminated".to_string()),
            EngineError::NotFound(what) => SfuError::NotFound(what),
            EngineError::Rejected(reason) => SfuError::Internal(reason),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(SfuError::Authentication("expired".into()).error_code(), "AUTH_FAILED");
        assert_eq!(SfuError::AuthenticationRequired.error_code(), "AUTH_REQUIRED");
        assert_eq!(SfuError::Authorization("role".into()).error_code(), "FORBIDDEN");
        assert_eq!(SfuError::NotInRoom.error_code(), "NOT_IN_ROOM");
        assert_eq!(SfuError::Allocation("none".into()).error_code(), "ALLOCATION_FAILED");
        assert_eq!(
            SfuError::RateLimited {
                retry_after: Duration::from_secs(1)
            }
            .error_code(),
            "RATE_LIMITED"
        );
        assert_eq!(SfuError::WorkerLost("slot 0".into()).error_code(), "WORKER_LOST");
        assert_eq!(
            SfuError::Protocol(ProtocolError::UnknownEvent("x".into())).error_code(),
            "UNKNOWN_EVENT"
        );
        assert_eq!(
            SfuError::Protocol(ProtocolError::MalformedEnvelope("x".into())).error_code(),
            "BAD_REQUEST"
        );
        assert_eq!(SfuError::Internal("boom".into()).error_code(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_client_message_hides_internal_details() {
        let err = SfuError::Coordination("redis://:password@10.0.0.1 refused".into());
        assert!(!err.client_message().contains("password"));

        let err = SfuError::Internal("mutex poisoned at room.rs:42".into());
        assert_eq!(err.client_message(), "An internal error occurred");

        let err = SfuError::Authentication("signature mismatch for kid k1".into());
        assert_eq!(err.client_message(), "Invalid or expired token");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(SfuError::Allocation("timeout".into()).is_retryable());
        assert!(SfuError::WorkerLost("slot".into()).is_retryable());
        assert!(SfuError::Transport("dtls".into()).is_retryable());
        assert!(!SfuError::Authentication("bad".into()).is_retryable());
        assert!(!SfuError::NotInRoom.is_retryable());
        assert!(!SfuError::NotFound("producer".into()).is_retryable());
    }

    #[test]
    fn test_rate_limited_event_carries_retry_after() {
        let err = SfuError::RateLimited {
            retry_after: Duration::from_millis(1500),
        };

        match err.to_event() {
            ServerEvent::Error {
                code,
                retry_after_ms,
                ..
            } => {
                assert_eq!(code, "RATE_LIMITED");
                assert_eq!(retry_after_ms, Some(1500));
            }
            other => unreachable!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_remote_codes_round_trip_to_variants() {
        for err in [
            SfuError::Transport("x".into()),
            SfuError::NotFound("x".into()),
            SfuError::WorkerLost("x".into()),
            SfuError::Allocation("x".into()),
        ] {
            let rebuilt = SfuError::from_remote(err.error_code(), "x".into());
            assert_eq!(rebuilt.error_code(), err.error_code());
        }
        assert_eq!(
            SfuError::from_remote("SOMETHING_NEW", "x".into()).error_code(),
            "INTERNAL_ERROR"
        );
    }

    #[test]
    fn test_engine_error_conversion() {
        let err: SfuError = EngineError::WorkerUnavailable(2).into();
        assert_eq!(err.error_code(), "WORKER_LOST");

        let err: SfuError = EngineError::NotFound("producer p1".into()).into();
        assert_eq!(err.error_code(), "NOT_FOUND");
    }
}
