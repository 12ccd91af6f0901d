//! Protocol Gateway HTTP surface.
//!
//! Serves the client WebSocket at `/ws` and the internal routing RPC on the
//! same listener. The per-connection protocol state machine lives in
//! [`crate::actors::ConnectionActor`]; this module only moves frames between
//! the socket and the actor.

pub mod websocket;

use std::sync::Arc;

use axum::{routing::get, Router};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::actors::ConnectionContext;
use crate::observability::HealthState;

/// Client socket endpoint.
pub const WEBSOCKET_PATH: &str = "/ws";

/// State shared by every WebSocket upgrade.
#[derive(Clone)]
pub struct GatewayState {
    /// Collaborators handed to each connection actor.
    pub connections: ConnectionContext,
    pub health: Arc<HealthState>,
    /// Parent of every connection token; cancelled at shutdown.
    pub shutdown: CancellationToken,
}

/// Build the gateway router. `internal` carries the routing RPC routes.
pub fn build_routes(state: GatewayState, internal: Router) -> Router {
    Router::new()
        .route(WEBSOCKET_PATH, get(websocket::ws_handler))
        .with_state(state)
        .merge(internal)
        .layer(TraceLayer::new_for_http())
}
