//! SFU Node
//!
//! Cluster-aware signaling gateway and media engine orchestration.
//!
//! # Servers
//!
//! - Gateway listener: client WebSocket at `/ws` and the internal routing RPC
//!   (default: 0.0.0.0:8080)
//! - Health listener: liveness, readiness, status, metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Connect the coordination store
//! 4. Start the media engine pool
//! 5. Spawn the session directory and background tasks
//! 6. Start health and gateway listeners
//! 7. Wait for shutdown signal
//!
//! # Shutdown Flow
//!
//! 1. Mark not-ready and cancel the root token
//! 2. Connections leave their rooms; the directory drains what remains
//! 3. The heartbeat task deregisters the node
//! 4. Worker supervisors stop their workers
//! 5. Listeners shut down

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use common::secret::ExposeSecret;
use sfu_node::actors::{
    ActorMetrics, ConnectionContext, ConnectionSettings, RoomServices, SessionDirectory,
};
use sfu_node::admission::AdmissionController;
use sfu_node::auth::{Authenticator, JwtAuthenticator};
use sfu_node::cluster::{ClusterCoordinator, CoordinationStore, MemoryStore, RedisStore};
use sfu_node::config::{Config, CoordinationBackend};
use sfu_node::engine::{LoopbackEngine, MediaEngine, MediaEnginePool, PoolConfig};
use sfu_node::gateway::{self, GatewayState};
use sfu_node::observability::{health_router, init_metrics_recorder, HealthContext, HealthState};
use sfu_node::routing::remote::DEFAULT_CALL_TIMEOUT;
use sfu_node::routing::{api as routing_api, RouterRegistry, RoutingContextManager};
use sfu_node::tasks::maintenance::ADMISSION_PRUNE_INTERVAL;
use sfu_node::tasks::{
    start_admission_pruner, start_heartbeat, start_resource_sampler, start_room_relay,
    start_worker_loss_watcher, HeartbeatConfig, WorkerLossServices,
};
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long worker supervisors get to stop their workers.
const ENGINE_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sfu_node=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting SFU node");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        node_id = %config.node_id,
        bind_address = %config.bind_address,
        health_bind_address = %config.health_bind_address,
        advertised_address = %config.advertised_address,
        coordination_backend = ?config.coordination_backend,
        worker_count = config.worker_count,
        node_capacity = config.node_capacity,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| anyhow!(e))?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());

    let store: Arc<dyn CoordinationStore> = match config.coordination_backend {
        CoordinationBackend::Redis => {
            let redis_url = config
                .redis_url
                .as_ref()
                .ok_or_else(|| anyhow!("REDIS_URL is required for the redis backend"))?;
            info!("Connecting to Redis...");
            let store = RedisStore::connect(redis_url.expose_secret()).await?;
            info!("Redis connection established");
            Arc::new(store)
        }
        CoordinationBackend::Memory => {
            warn!("Using in-memory coordination store; rooms are not shared with other nodes");
            Arc::new(MemoryStore::new())
        }
    };
    let coordinator =
        ClusterCoordinator::new(store, config.heartbeat_ttl, config.allocation_timeout);

    let authenticator: Arc<dyn Authenticator> = Arc::new(JwtAuthenticator::from_public_key_pem(
        &config.auth_public_key_pem,
        config.clock_skew,
    )?);

    // The pool outlives the root token so rooms can close their contexts while draining.
    let engine_token = CancellationToken::new();
    let (pool, supervisors) = MediaEnginePool::start(
        Arc::new(LoopbackEngine::new()) as Arc<dyn MediaEngine>,
        PoolConfig {
            worker_count: config.worker_count,
            restart_delay: config.worker_restart_delay,
        },
        engine_token.clone(),
    )
    .await
    .context("Failed to start media engine pool")?;

    let manager = Arc::new(RoutingContextManager::new(Arc::clone(&pool)));
    let registry = Arc::new(RouterRegistry::new(
        config.node_id.clone(),
        Arc::clone(&manager),
        coordinator.clone(),
        config.cluster_secret.clone(),
        DEFAULT_CALL_TIMEOUT,
    ));
    let actor_metrics = ActorMetrics::new();

    let shutdown_token = CancellationToken::new();

    info!("Initializing actor system...");
    let (directory, directory_task) = SessionDirectory::spawn(
        RoomServices {
            node_id: config.node_id.clone(),
            coordinator: coordinator.clone(),
            registry,
            metrics: Arc::clone(&actor_metrics),
            reconcile_interval: config.remote_room_reconcile_interval,
        },
        shutdown_token.child_token(),
    );
    let admission = Arc::new(AdmissionController::new(config.admission));
    info!("Actor system initialized");

    // Background tasks
    let heartbeat_task = tokio::spawn(start_heartbeat(
        HeartbeatConfig {
            node_id: config.node_id.clone(),
            advertised_address: config.advertised_address.clone(),
            capacity: config.node_capacity,
            interval: config.heartbeat_interval,
        },
        coordinator.clone(),
        Arc::clone(&pool),
        Arc::clone(&actor_metrics),
        Arc::clone(&health_state),
        shutdown_token.child_token(),
    ));
    tokio::spawn(start_resource_sampler(
        Arc::clone(&pool),
        config.resource_sample_interval,
        shutdown_token.child_token(),
    ));
    tokio::spawn(start_admission_pruner(
        Arc::clone(&admission),
        ADMISSION_PRUNE_INTERVAL,
        shutdown_token.child_token(),
    ));
    tokio::spawn(start_worker_loss_watcher(
        pool.subscribe(),
        WorkerLossServices {
            node_id: config.node_id.clone(),
            manager: Arc::clone(&manager),
            coordinator: coordinator.clone(),
            directory: directory.clone(),
        },
        engine_token.child_token(),
    ));
    tokio::spawn(start_room_relay(
        coordinator.clone(),
        directory.clone(),
        config.node_id.clone(),
        shutdown_token.child_token(),
    ));
    info!("Background tasks started");

    // Listeners stop last: peers keep calling the routing RPC while rooms drain.
    let listener_token = CancellationToken::new();

    let health_addr: SocketAddr = config
        .health_bind_address
        .parse()
        .with_context(|| format!("Invalid health bind address: {}", config.health_bind_address))?;
    let health_app = health_router(HealthContext {
        node_id: config.node_id.clone(),
        state: Arc::clone(&health_state),
        pool: Arc::clone(&pool),
        actor_metrics: Arc::clone(&actor_metrics),
        coordinator: coordinator.clone(),
        prometheus: Some(prometheus_handle),
    });
    // Bind listener BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .with_context(|| format!("Failed to bind health server to {health_addr}"))?;
    let health_server = spawn_server("health", health_listener, health_app, listener_token.clone());
    info!(addr = %health_addr, "Health server started");

    let gateway_addr: SocketAddr = config
        .bind_address
        .parse()
        .with_context(|| format!("Invalid bind address: {}", config.bind_address))?;
    let gateway_app = gateway::build_routes(
        GatewayState {
            connections: ConnectionContext {
                directory: directory.clone(),
                authenticator,
                admission,
                metrics: Arc::clone(&actor_metrics),
                settings: ConnectionSettings {
                    max_message_bytes: config.max_message_bytes,
                    probe_interval: config.probe_interval,
                    idle_timeout: config.idle_timeout,
                },
            },
            health: Arc::clone(&health_state),
            shutdown: shutdown_token.clone(),
        },
        routing_api::routes(manager, config.cluster_secret.clone()),
    );
    let gateway_listener = tokio::net::TcpListener::bind(gateway_addr)
        .await
        .with_context(|| format!("Failed to bind gateway to {gateway_addr}"))?;
    let gateway_server =
        spawn_server("gateway", gateway_listener, gateway_app, listener_token.clone());
    info!(addr = %gateway_addr, "Gateway started");

    info!(node_id = %config.node_id, "SFU node running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so load balancers stop sending traffic
    health_state.set_draining();
    shutdown_token.cancel();

    if let Err(e) = directory_task.await {
        warn!(error = %e, "Session directory task failed");
    }
    if let Err(e) = heartbeat_task.await {
        warn!(error = %e, "Heartbeat task failed");
    }

    info!("Stopping media workers...");
    engine_token.cancel();
    let engine_stopped = async {
        for supervisor in supervisors {
            let _ = supervisor.await;
        }
    };
    if tokio::time::timeout(ENGINE_SHUTDOWN_TIMEOUT, engine_stopped)
        .await
        .is_err()
    {
        warn!("Media workers did not stop in time");
    }

    listener_token.cancel();
    let _ = gateway_server.await;
    let _ = health_server.await;

    info!("SFU node shutdown complete");
    Ok(())
}

/// Serve `app` on `listener` until `shutdown` fires. Peer addresses are
/// exposed to handlers for admission.
fn spawn_server(
    name: &'static str,
    listener: tokio::net::TcpListener,
    app: axum::Router,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let server = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!(server = name, "Server shutting down");
        });
        if let Err(e) = server.await {
            error!(server = name, error = %e, "Server failed");
        }
    })
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
