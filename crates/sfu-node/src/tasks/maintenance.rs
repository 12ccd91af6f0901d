//! Periodic housekeeping: worker CPU sampling and admission table pruning.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::admission::AdmissionController;
use crate::engine::MediaEnginePool;

/// How often idle admission entries are evicted.
pub const ADMISSION_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Sample worker CPU usage every `interval` so allocation sees current load.
#[instrument(skip_all, name = "sfu.task.resource_sampler")]
pub async fn start_resource_sampler(
    pool: Arc<MediaEnginePool>,
    interval: Duration,
    cancel_token: CancellationToken,
) {
    info!(
        target: "sfu.task.resource_sampler",
        interval_secs = interval.as_secs(),
        "Starting resource sampler task"
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                pool.sample_resources().await;
            }
            () = cancel_token.cancelled() => {
                break;
            }
        }
    }

    info!(target: "sfu.task.resource_sampler", "Resource sampler task stopped");
}

/// Evict admission entries with no recent hits and no active block.
#[instrument(skip_all, name = "sfu.task.admission_pruner")]
pub async fn start_admission_pruner(
    admission: Arc<AdmissionController>,
    interval: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = admission.prune();
                if removed > 0 {
                    debug!(
                        target: "sfu.task.admission_pruner",
                        removed,
                        remaining = admission.tracked_keys(),
                        "Pruned idle admission entries"
                    );
                }
            }
            () = cancel_token.cancelled() => {
                break;
            }
        }
    }

    info!(target: "sfu.task.admission_pruner", "Admission pruner task stopped");
}
