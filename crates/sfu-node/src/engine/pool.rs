//! Media engine pool: fixed worker slots with supervised restarts.
//!
//! Each slot is owned by one supervisor task that waits on the worker's
//! termination signal. When a worker dies:
//!
//! 1. The slot's generation is bumped, so handles to the dead worker fail
//!    with `WorkerUnavailable` instead of reaching a replacement that never
//!    held their contexts.
//! 2. Tracked load resets to zero.
//! 3. `WorkerEvent::Lost` is broadcast. Every context on the dead worker is
//!    gone; subscribers end the affected sessions.
//! 4. After the restart delay a new worker is spawned into the same slot.
//!
//! Callers never keep a worker. They keep a [`SlotHandle`] and borrow the
//! worker per call through [`MediaEnginePool::worker`].

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::{EngineError, MediaEngine, MediaWorker};
use crate::observability::metrics;

const EVENT_CAPACITY: usize = 64;

/// Pool sizing and restart policy.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub worker_count: usize,
    pub restart_delay: Duration,
}

/// Stable reference to one generation of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SlotHandle {
    pub index: usize,
    pub generation: u64,
}

/// Slot lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The worker of `generation` died; its contexts are destroyed.
    Lost { slot: usize, generation: u64 },
    /// A replacement worker of `generation` is running.
    Restarted { slot: usize, generation: u64 },
}

/// Point-in-time view of one slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub slot: usize,
    pub generation: u64,
    pub live: bool,
    pub worker_id: Option<String>,
    pub contexts: usize,
    pub cpu_load: f64,
}

#[derive(Default)]
struct Slot {
    worker: RwLock<Option<Arc<dyn MediaWorker>>>,
    generation: AtomicU64,
    contexts: AtomicUsize,
    /// `f64` bits of the normalized CPU load.
    cpu_load: AtomicU64,
    last_sample: Mutex<Option<(Duration, Instant)>>,
}

impl Slot {
    fn current(&self) -> Option<Arc<dyn MediaWorker>> {
        self.worker
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn cpu_load(&self) -> f64 {
        f64::from_bits(self.cpu_load.load(Ordering::Relaxed))
    }

    fn set_cpu_load(&self, load: f64) {
        self.cpu_load.store(load.to_bits(), Ordering::Relaxed);
    }

    fn reset_load(&self) {
        self.contexts.store(0, Ordering::SeqCst);
        self.set_cpu_load(0.0);
        *self
            .last_sample
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Fixed-size pool of supervised media workers.
pub struct MediaEnginePool {
    engine: Arc<dyn MediaEngine>,
    config: PoolConfig,
    slots: Vec<Slot>,
    events: broadcast::Sender<WorkerEvent>,
}

impl MediaEnginePool {
    /// Spawn every worker and one supervisor per slot.
    ///
    /// Supervisors stop their workers when `cancel_token` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns the engine error if any initial worker fails to start.
    #[instrument(skip_all, fields(worker_count = config.worker_count))]
    pub async fn start(
        engine: Arc<dyn MediaEngine>,
        config: PoolConfig,
        cancel_token: CancellationToken,
    ) -> Result<(Arc<Self>, Vec<JoinHandle<()>>), EngineError> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let slots = (0..config.worker_count).map(|_| Slot::default()).collect();
        let pool = Arc::new(Self {
            engine,
            config,
            slots,
            events,
        });

        for (index, slot) in pool.slots.iter().enumerate() {
            let worker = pool.engine.spawn_worker(index).await?;
            debug!(target: "sfu.engine.pool", slot = index, worker_id = %worker.worker_id(), "Worker started");
            *slot.worker.write().unwrap_or_else(PoisonError::into_inner) = Some(worker);
        }
        metrics::set_workers_live(pool.live_count());

        let supervisors = (0..pool.slots.len())
            .map(|index| {
                let pool = Arc::clone(&pool);
                let token = cancel_token.clone();
                tokio::spawn(async move { pool.supervise(index, token).await })
            })
            .collect();

        info!(
            target: "sfu.engine.pool",
            worker_count = config.worker_count,
            restart_delay_ms = config.restart_delay.as_millis(),
            "Media engine pool started"
        );
        Ok((pool, supervisors))
    }

    fn slot(&self, index: usize) -> Result<&Slot, EngineError> {
        self.slots
            .get(index)
            .ok_or(EngineError::WorkerUnavailable(index))
    }

    async fn supervise(self: Arc<Self>, index: usize, cancel_token: CancellationToken) {
        let Ok(slot) = self.slot(index) else {
            return;
        };

        loop {
            let Some(worker) = slot.current() else {
                error!(target: "sfu.engine.pool", slot = index, "Supervisor found empty slot");
                return;
            };

            tokio::select! {
                () = cancel_token.cancelled() => {
                    worker.shutdown().await;
                    *slot.worker.write().unwrap_or_else(PoisonError::into_inner) = None;
                    slot.reset_load();
                    metrics::set_workers_live(self.live_count());
                    info!(target: "sfu.engine.pool", slot = index, "Worker stopped");
                    return;
                }
                () = worker.terminated() => {}
            }

            let lost_generation = {
                let mut current = slot.worker.write().unwrap_or_else(PoisonError::into_inner);
                *current = None;
                slot.generation.fetch_add(1, Ordering::SeqCst)
            };
            let lost_contexts = slot.contexts.load(Ordering::SeqCst);
            slot.reset_load();
            metrics::record_worker_restart();
            metrics::set_workers_live(self.live_count());

            error!(
                target: "sfu.engine.pool",
                slot = index,
                generation = lost_generation,
                worker_id = %worker.worker_id(),
                lost_contexts = lost_contexts,
                "Media worker died, contexts on it are destroyed"
            );
            drop(worker);

            // No receivers is fine: nothing was placed on the worker yet.
            let _ = self.events.send(WorkerEvent::Lost {
                slot: index,
                generation: lost_generation,
            });

            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => return,
                    () = tokio::time::sleep(self.config.restart_delay) => {}
                }

                match self.engine.spawn_worker(index).await {
                    Ok(replacement) => {
                        let generation = {
                            let mut current =
                                slot.worker.write().unwrap_or_else(PoisonError::into_inner);
                            *current = Some(replacement);
                            slot.generation.load(Ordering::SeqCst)
                        };
                        metrics::set_workers_live(self.live_count());
                        info!(
                            target: "sfu.engine.pool",
                            slot = index,
                            generation = generation,
                            "Media worker restarted"
                        );
                        let _ = self.events.send(WorkerEvent::Restarted {
                            slot: index,
                            generation,
                        });
                        break;
                    }
                    Err(e) => {
                        error!(
                            target: "sfu.engine.pool",
                            slot = index,
                            error = %e,
                            "Failed to restart media worker, retrying"
                        );
                    }
                }
            }
        }
    }

    /// Worker behind `handle`, if that generation is still running.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::WorkerUnavailable` if the slot was replaced or is empty.
    pub fn worker(&self, handle: SlotHandle) -> Result<Arc<dyn MediaWorker>, EngineError> {
        let slot = self.slot(handle.index)?;
        let current = slot.worker.read().unwrap_or_else(PoisonError::into_inner);
        // Generation is bumped under the write lock, so this check is stable.
        if slot.generation.load(Ordering::SeqCst) != handle.generation {
            return Err(EngineError::WorkerUnavailable(handle.index));
        }
        current
            .clone()
            .ok_or(EngineError::WorkerUnavailable(handle.index))
    }

    /// Whether `handle` still names its slot's current generation.
    #[must_use]
    pub fn is_current(&self, handle: SlotHandle) -> bool {
        self.slot(handle.index)
            .is_ok_and(|slot| slot.generation.load(Ordering::SeqCst) == handle.generation)
    }

    /// The live slot with the lowest `contexts + cpu_load`. Ties go to the lowest index.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NoLiveWorkers` if every slot is empty.
    pub fn least_loaded_worker(&self) -> Result<SlotHandle, EngineError> {
        let mut best: Option<(f64, SlotHandle)> = None;

        for (index, slot) in self.slots.iter().enumerate() {
            let current = slot.worker.read().unwrap_or_else(PoisonError::into_inner);
            if current.is_none() {
                continue;
            }
            #[allow(clippy::cast_precision_loss)]
            let score = slot.contexts.load(Ordering::SeqCst) as f64 + slot.cpu_load();
            let handle = SlotHandle {
                index,
                generation: slot.generation.load(Ordering::SeqCst),
            };
            match best {
                Some((best_score, _)) if score >= best_score => {}
                _ => best = Some((score, handle)),
            }
        }

        best.map(|(_, handle)| handle)
            .ok_or(EngineError::NoLiveWorkers)
    }

    /// Count a new context against `handle`'s slot.
    pub fn context_opened(&self, handle: SlotHandle) {
        if let Ok(slot) = self.slot(handle.index) {
            if slot.generation.load(Ordering::SeqCst) == handle.generation {
                slot.contexts.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Release a context counted against `handle`'s slot.
    pub fn context_closed(&self, handle: SlotHandle) {
        if let Ok(slot) = self.slot(handle.index) {
            if slot.generation.load(Ordering::SeqCst) == handle.generation {
                let _ = slot
                    .contexts
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            }
        }
    }

    /// Sample every live worker's CPU time and update its normalized load.
    pub async fn sample_resources(&self) {
        for (index, slot) in self.slots.iter().enumerate() {
            let Some(worker) = slot.current() else {
                continue;
            };

            let usage = match worker.resource_usage().await {
                Ok(usage) => usage,
                Err(e) => {
                    warn!(target: "sfu.engine.pool", slot = index, error = %e, "Resource sample failed");
                    continue;
                }
            };

            let now = Instant::now();
            let mut last = slot.last_sample.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some((previous_cpu, previous_at)) = *last {
                let wall = now.saturating_duration_since(previous_at).as_secs_f64();
                if wall > 0.0 {
                    let busy = usage.cpu_time.saturating_sub(previous_cpu).as_secs_f64();
                    slot.set_cpu_load((busy / wall).clamp(0.0, 1.0));
                }
            }
            *last = Some((usage.cpu_time, now));
        }
    }

    /// Mean normalized CPU load across live workers.
    #[must_use]
    pub fn average_cpu_load(&self) -> f64 {
        let loads: Vec<f64> = self
            .slots
            .iter()
            .filter(|slot| slot.current().is_some())
            .map(Slot::cpu_load)
            .collect();
        if loads.is_empty() {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let count = loads.len() as f64;
        loads.iter().sum::<f64>() / count
    }

    #[must_use]
    pub fn stats(&self) -> Vec<WorkerStatus> {
        self.slots
            .iter()
            .enumerate()
            .map(|(index, slot)| {
                let worker = slot.current();
                WorkerStatus {
                    slot: index,
                    generation: slot.generation.load(Ordering::SeqCst),
                    live: worker.is_some(),
                    worker_id: worker.map(|w| w.worker_id()),
                    contexts: slot.contexts.load(Ordering::SeqCst),
                    cpu_load: slot.cpu_load(),
                }
            })
            .collect()
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.current().is_some())
            .count()
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn total_contexts(&self) -> usize {
        self.slots
            .iter()
            .map(|slot| slot.contexts.load(Ordering::SeqCst))
            .sum()
    }

    /// Subscribe to slot lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }
}
