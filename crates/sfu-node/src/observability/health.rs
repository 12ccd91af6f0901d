//! Health endpoints for the SFU node.
//!
//! Served on the health listener:
//! - `GET /health` - Liveness probe (is the process running?)
//! - `GET /ready` - Readiness probe (can we take new connections and rooms?)
//! - `GET /status` - JSON snapshot of connections, rooms, workers, and cluster
//! - `GET /metrics` - Prometheus text format, when a recorder handle is supplied
//!
//! # Health State
//!
//! The `HealthState` tracks:
//! - `live`: Always true after startup (process is running)
//! - `registered`: Set by the heartbeat task once the node is in the registry
//! - `draining`: Set at the start of shutdown; readiness never recovers from it
//!
//! Readiness additionally requires at least one live media worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tracing::warn;

use crate::actors::ActorMetrics;
use crate::cluster::{ClusterCoordinator, NodeStatus};
use crate::engine::{MediaEnginePool, WorkerStatus};

/// Health state for the SFU node.
#[derive(Debug)]
pub struct HealthState {
    live: AtomicBool,
    registered: AtomicBool,
    draining: AtomicBool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (live, not registered, not draining).
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            registered: AtomicBool::new(false),
            draining: AtomicBool::new(false),
        }
    }

    /// Record whether the node is currently in the cluster registry.
    pub fn set_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::SeqCst);
    }

    /// Mark the node as shutting down.
    pub fn set_draining(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }
}

/// Everything the health endpoints report on.
#[derive(Clone)]
pub struct HealthContext {
    pub node_id: String,
    pub state: Arc<HealthState>,
    pub pool: Arc<MediaEnginePool>,
    pub actor_metrics: Arc<ActorMetrics>,
    pub coordinator: ClusterCoordinator,
    pub prometheus: Option<PrometheusHandle>,
}

impl HealthContext {
    fn is_ready(&self) -> bool {
        self.state.is_registered() && !self.state.is_draining() && self.pool.live_count() > 0
    }
}

/// Response body of `/status`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatusReport {
    pub node_id: String,
    pub ready: bool,
    pub draining: bool,
    pub connections: usize,
    pub rooms: usize,
    pub participants: usize,
    pub workers: Vec<WorkerStatus>,
    /// Absent when the coordination store cannot be reached.
    pub cluster: Option<Vec<NodeStatus>>,
}

/// Create the health router.
pub fn health_router(context: HealthContext) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(context)
}

/// Liveness probe handler.
async fn liveness_handler(State(context): State<HealthContext>) -> StatusCode {
    if context.state.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Readiness probe handler.
async fn readiness_handler(State(context): State<HealthContext>) -> StatusCode {
    if context.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn status_handler(State(context): State<HealthContext>) -> Json<NodeStatusReport> {
    let cluster = match context.coordinator.node_statuses().await {
        Ok(statuses) => Some(statuses),
        Err(e) => {
            warn!(target: "sfu.health", error = %e, "Cluster status unavailable");
            None
        }
    };

    Json(NodeStatusReport {
        node_id: context.node_id.clone(),
        ready: context.is_ready(),
        draining: context.state.is_draining(),
        connections: context.actor_metrics.connection_count(),
        rooms: context.actor_metrics.room_count(),
        participants: context.actor_metrics.participant_count(),
        workers: context.pool.stats(),
        cluster,
    })
}

async fn metrics_handler(State(context): State<HealthContext>) -> Response {
    match &context.prometheus {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
