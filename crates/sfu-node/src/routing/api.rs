//! `POST /internal/routing`: the routing RPC served to peer nodes.
//!
//! Callers authenticate with `Authorization: Bearer <CLUSTER_SECRET>`. The
//! secret is compared through an HMAC so the check runs in constant time.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use common::secret::{ExposeSecret, SecretString};
use ring::hmac;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::{RoutingCall, RoutingContextManager, RoutingService};
use crate::errors::SfuError;

pub const ROUTING_PATH: &str = "/internal/routing";

/// Error body returned to the calling node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&SfuError> for RemoteError {
    fn from(err: &SfuError) -> Self {
        Self {
            code: err.error_code().to_string(),
            message: err.detail(),
            retryable: err.is_retryable(),
        }
    }
}

fn status_for(err: &SfuError) -> StatusCode {
    match err {
        SfuError::NotFound(_) => StatusCode::NOT_FOUND,
        SfuError::Authorization(_) => StatusCode::FORBIDDEN,
        SfuError::Protocol(_) | SfuError::InvalidState(_) | SfuError::NotInRoom => {
            StatusCode::BAD_REQUEST
        }
        SfuError::WorkerLost(_)
        | SfuError::Allocation(_)
        | SfuError::Coordination(_)
        | SfuError::Peer(_)
        | SfuError::Draining => StatusCode::SERVICE_UNAVAILABLE,
        SfuError::Transport(_) | SfuError::Produce(_) | SfuError::Consume(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Clone)]
struct RoutingApiState {
    manager: Arc<RoutingContextManager>,
    key: Arc<hmac::Key>,
    expected_tag: Arc<hmac::Tag>,
}

impl RoutingApiState {
    fn new(manager: Arc<RoutingContextManager>, cluster_secret: &SecretString) -> Self {
        let key = hmac::Key::new(hmac::HMAC_SHA256, b"sfu-internal-routing");
        let expected_tag = hmac::sign(&key, cluster_secret.expose_secret().as_bytes());
        Self {
            manager,
            key: Arc::new(key),
            expected_tag: Arc::new(expected_tag),
        }
    }

    fn authorized(&self, provided: &str) -> bool {
        hmac::verify(&self.key, provided.as_bytes(), (*self.expected_tag).as_ref()).is_ok()
    }
}

/// Router serving the routing RPC for `manager`.
pub fn routes(manager: Arc<RoutingContextManager>, cluster_secret: SecretString) -> Router {
    let state = RoutingApiState::new(manager, &cluster_secret);
    Router::new()
        .route(ROUTING_PATH, post(handle_routing_call))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_cluster_secret))
        .with_state(state)
}

async fn require_cluster_secret(
    State(state): State<RoutingApiState>,
    req: Request,
    next: Next,
) -> Response {
    let provided = req
        .headers()
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    match provided {
        Some(secret) if state.authorized(secret) => next.run(req).await,
        _ => {
            warn!(target: "sfu.routing.api", "Rejected routing call with bad cluster secret");
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}

#[instrument(skip_all, fields(op = call.op()))]
async fn handle_routing_call(
    State(state): State<RoutingApiState>,
    Json(call): Json<RoutingCall>,
) -> Response {
    match state.manager.execute(call).await {
        Ok(reply) => Json(reply).into_response(),
        Err(err) => {
            debug!(target: "sfu.routing.api", error = %err, "Routing call failed");
            (status_for(&err), Json(RemoteError::from(&err))).into_response()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::{LoopbackEngine, MediaEngine, MediaEnginePool, PoolConfig};
    use crate::routing::RoutingReply;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tower::util::ServiceExt;

    async fn app(token: &CancellationToken) -> Router {
        let (pool, _) = MediaEnginePool::start(
            Arc::new(LoopbackEngine::new()) as Arc<dyn MediaEngine>,
            PoolConfig {
                worker_count: 1,
                restart_delay: Duration::from_millis(10),
            },
            token.clone(),
        )
        .await
        .unwrap();
        routes(
            Arc::new(RoutingContextManager::new(pool)),
            SecretString::from("cluster-secret".to_string()),
        )
    }

    fn call_request(auth: Option<&str>, call: &RoutingCall) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(ROUTING_PATH)
            .header("content-type", "application/json");
        if let Some(auth) = auth {
            builder = builder.header("authorization", auth);
        }
        builder
            .body(Body::from(serde_json::to_vec(call).unwrap()))
            .unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        response.into_body().collect().await.unwrap().to_bytes().to_vec()
    }

    #[tokio::test]
    async fn test_missing_or_wrong_secret_is_unauthorized() {
        let token = CancellationToken::new();
        let app = app(&token).await;
        let call = RoutingCall::CloseContext {
            room_id: "r1".to_string(),
        };

        let response = app.clone().oneshot(call_request(None, &call)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(call_request(Some("Bearer nope"), &call))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        token.cancel();
    }

    #[tokio::test]
    async fn test_successful_call_returns_reply() {
        let token = CancellationToken::new();
        let app = app(&token).await;
        let call = RoutingCall::CreateContext {
            room_id: "r1".to_string(),
            context_id: "ctx-1".to_string(),
        };

        let response = app
            .oneshot(call_request(Some("Bearer cluster-secret"), &call))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let reply: RoutingReply = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert!(matches!(reply, RoutingReply::Context(_)));
        token.cancel();
    }

    #[tokio::test]
    async fn test_errors_carry_code_and_status() {
        let token = CancellationToken::new();
        let app = app(&token).await;

        // No context for the room: the worker that held it is gone.
        let call = RoutingCall::PauseProducer {
            room_id: "r1".to_string(),
            participant_id: "a".to_string(),
            producer_id: "p1".to_string(),
        };
        let response = app
            .oneshot(call_request(Some("Bearer cluster-secret"), &call))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let error: RemoteError = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(error.code, "WORKER_LOST");
        assert!(error.retryable);
        token.cancel();
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&SfuError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&SfuError::Consume("x".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&SfuError::Internal("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
