//! Node registration and heartbeat task.
//!
//! Registers the node with exponential backoff, then publishes a heartbeat
//! with pool and host load every interval. The task never gives up on the
//! coordination store: active rooms keep running through a store outage.
//!
//! # Graceful Shutdown
//!
//! On cancellation the node is deregistered before the task returns, so
//! other replicas stop placing rooms here.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::actors::ActorMetrics;
use crate::cluster::{ClusterCoordinator, NodeStats};
use crate::engine::MediaEnginePool;
use crate::observability::HealthState;
use crate::system_info::SystemSampler;

/// Base delay for registration backoff.
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Maximum registration backoff delay.
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Registration and heartbeat settings.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub node_id: String,
    pub advertised_address: String,
    pub capacity: u32,
    pub interval: Duration,
}

/// Run the heartbeat task until `cancel_token` fires.
#[instrument(skip_all, name = "sfu.task.heartbeat", fields(node_id = %config.node_id))]
pub async fn start_heartbeat(
    config: HeartbeatConfig,
    coordinator: ClusterCoordinator,
    pool: Arc<MediaEnginePool>,
    actor_metrics: Arc<ActorMetrics>,
    health: Arc<HealthState>,
    cancel_token: CancellationToken,
) {
    info!(
        target: "sfu.task.heartbeat",
        node_id = %config.node_id,
        interval_secs = config.interval.as_secs(),
        "Starting heartbeat task"
    );

    if register_with_backoff(&config, &coordinator, &cancel_token).await {
        health.set_registered(true);

        let mut sampler = SystemSampler::new();
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel_token.cancelled() => {
                    info!(
                        target: "sfu.task.heartbeat",
                        "Heartbeat task received shutdown signal"
                    );
                    break;
                }
                _ = ticker.tick() => {
                    let stats = node_stats(&pool, &actor_metrics, &mut sampler);
                    let healthy = beat(&config, &coordinator, &stats).await;
                    health.set_registered(healthy);
                }
            }
        }
    }

    health.set_registered(false);
    if let Err(e) = coordinator.deregister(&config.node_id).await {
        error!(
            target: "sfu.task.heartbeat",
            node_id = %config.node_id,
            error = %e,
            "Failed to deregister node"
        );
    }

    info!(target: "sfu.task.heartbeat", "Heartbeat task stopped");
}

/// Returns `false` if cancelled before registration succeeded.
async fn register_with_backoff(
    config: &HeartbeatConfig,
    coordinator: &ClusterCoordinator,
    cancel_token: &CancellationToken,
) -> bool {
    let mut delay = BACKOFF_BASE;
    let mut retry_count = 0u32;

    loop {
        match coordinator
            .register(&config.node_id, &config.advertised_address, config.capacity)
            .await
        {
            Ok(()) => return true,
            Err(e) => {
                retry_count += 1;
                warn!(
                    target: "sfu.task.heartbeat",
                    error = %e,
                    retry_count,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Registration failed, retrying"
                );
            }
        }

        tokio::select! {
            () = cancel_token.cancelled() => return false,
            () = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(BACKOFF_MAX);
    }
}

/// One heartbeat. Re-registers if the registry lost this node.
async fn beat(config: &HeartbeatConfig, coordinator: &ClusterCoordinator, stats: &NodeStats) -> bool {
    if let Err(e) = coordinator.heartbeat(&config.node_id, stats).await {
        warn!(target: "sfu.task.heartbeat", error = %e, "Heartbeat failed");
        return false;
    }

    match coordinator.node(&config.node_id).await {
        Ok(Some(_)) => true,
        Ok(None) => {
            warn!(
                target: "sfu.task.heartbeat",
                node_id = %config.node_id,
                "Node missing from registry, re-registering"
            );
            coordinator
                .register(&config.node_id, &config.advertised_address, config.capacity)
                .await
                .is_ok()
        }
        Err(e) => {
            warn!(target: "sfu.task.heartbeat", error = %e, "Registry lookup failed");
            false
        }
    }
}

/// Current load of this node. CPU is the higher of worker load and host load.
fn node_stats(
    pool: &MediaEnginePool,
    actor_metrics: &ActorMetrics,
    sampler: &mut SystemSampler,
) -> NodeStats {
    let host = sampler.sample();
    let host_cpu = f64::from(host.cpu_percent) / 100.0;

    NodeStats {
        contexts: u32::try_from(pool.total_contexts()).unwrap_or(u32::MAX),
        workers_live: u32::try_from(pool.live_count()).unwrap_or(u32::MAX),
        workers_total: u32::try_from(pool.worker_count()).unwrap_or(u32::MAX),
        cpu_load: pool.average_cpu_load().max(host_cpu).clamp(0.0, 1.0),
        memory_percent: host.memory_percent,
        connections: u32::try_from(actor_metrics.connection_count()).unwrap_or(u32::MAX),
        reported_at: chrono::Utc::now().timestamp(),
    }
}
