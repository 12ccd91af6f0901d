//! Routing context manager: one context per room on this node.
//!
//! Contexts are created lazily on a pool slot chosen by load and hold the
//! room's transports, producers and consumers. Every object records the
//! participant that owns it; calls naming an object the caller does not own
//! fail with `NotFound`, exactly as if the object did not exist.
//!
//! Calls on one room are serialized by the context's lock. Teardown always
//! closes consumers, then producers, then transports, then the context.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::types::{EngineBlob, MediaKind, TransportDirection};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use super::{
    ClosedConsumer, ConsumeOutcome, ConsumerInfo, ContextInfo, ParticipantCleanup, RoutingCall,
    RoutingReply, RoutingService, TransportInfo,
};
use crate::engine::{EngineError, MediaEnginePool, MediaWorker, SlotHandle};
use crate::errors::SfuError;

#[derive(Debug)]
struct TransportEntry {
    participant_id: String,
    direction: TransportDirection,
}

#[derive(Debug)]
struct ProducerEntry {
    participant_id: String,
    kind: MediaKind,
}

#[derive(Debug)]
struct ConsumerEntry {
    participant_id: String,
    producer_id: String,
}

struct RoutingContext {
    room_id: String,
    context_id: String,
    engine_context_id: String,
    slot: SlotHandle,
    capabilities: EngineBlob,
    transports: HashMap<String, TransportEntry>,
    producers: HashMap<String, ProducerEntry>,
    consumers: HashMap<String, ConsumerEntry>,
}

impl RoutingContext {
    fn info(&self) -> ContextInfo {
        ContextInfo {
            context_id: self.context_id.clone(),
            capabilities: self.capabilities.clone(),
        }
    }

    fn owned_transport(&self, participant_id: &str, transport_id: &str) -> Result<&TransportEntry, SfuError> {
        self.transports
            .get(transport_id)
            .filter(|t| t.participant_id == participant_id)
            .ok_or_else(|| SfuError::NotFound(format!("transport {transport_id}")))
    }

    fn check_producer_owner(&self, participant_id: &str, producer_id: &str) -> Result<(), SfuError> {
        self.producers
            .get(producer_id)
            .filter(|p| p.participant_id == participant_id)
            .map(|_| ())
            .ok_or_else(|| SfuError::NotFound(format!("producer {producer_id}")))
    }

    fn check_consumer_owner(&self, participant_id: &str, consumer_id: &str) -> Result<(), SfuError> {
        self.consumers
            .get(consumer_id)
            .filter(|c| c.participant_id == participant_id)
            .map(|_| ())
            .ok_or_else(|| SfuError::NotFound(format!("consumer {consumer_id}")))
    }

    /// Ids matching `pred`, sorted so teardown order is deterministic.
    fn ids_where<T>(map: &HashMap<String, T>, pred: impl Fn(&T) -> bool) -> Vec<String> {
        let mut ids: Vec<String> = map
            .iter()
            .filter(|(_, entry)| pred(entry))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

/// A context destroyed with its worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LostContext {
    pub room_id: String,
    pub context_id: String,
}

/// Engine refusals become the operation's negotiation error; worker loss stays worker loss.
fn negotiation_error(err: EngineError, wrap: fn(String) -> SfuError) -> SfuError {
    match err {
        EngineError::Rejected(reason) => wrap(reason),
        other => SfuError::from(other),
    }
}

/// Owns every routing context hosted by this node.
pub struct RoutingContextManager {
    pool: Arc<MediaEnginePool>,
    contexts: RwLock<HashMap<String, Arc<Mutex<RoutingContext>>>>,
}

impl RoutingContextManager {
    #[must_use]
    pub fn new(pool: Arc<MediaEnginePool>) -> Self {
        Self {
            pool,
            contexts: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<MediaEnginePool> {
        &self.pool
    }

    async fn context(&self, room_id: &str) -> Result<Arc<Mutex<RoutingContext>>, SfuError> {
        self.contexts
            .read()
            .await
            .get(room_id)
            .cloned()
            .ok_or_else(|| SfuError::WorkerLost(format!("no routing context for room {room_id}")))
    }

    fn worker(&self, ctx: &RoutingContext) -> Result<Arc<dyn MediaWorker>, SfuError> {
        Ok(self.pool.worker(ctx.slot)?)
    }

    /// Number of contexts hosted here.
    pub async fn context_count(&self) -> usize {
        self.contexts.read().await.len()
    }

    pub async fn has_context(&self, room_id: &str) -> bool {
        self.contexts.read().await.contains_key(room_id)
    }

    /// Return the room's context, creating it on the least loaded worker if needed.
    ///
    /// A context left over from an older placement of the room, or from a
    /// replaced worker, is torn down and recreated.
    ///
    /// # Errors
    ///
    /// `WorkerLost` if no worker is live; engine failures otherwise.
    #[instrument(skip_all, fields(room_id = %room_id, context_id = %context_id))]
    pub async fn create_context(&self, room_id: &str, context_id: &str) -> Result<ContextInfo, SfuError> {
        let mut contexts = self.contexts.write().await;

        if let Some(existing) = contexts.get(room_id).cloned() {
            let ctx = existing.lock().await;
            if ctx.context_id == context_id && self.pool.worker(ctx.slot).is_ok() {
                return Ok(ctx.info());
            }
            drop(ctx);
            contexts.remove(room_id);
            warn!(target: "sfu.routing", room_id = %room_id, "Replacing stale routing context");
            let mut stale = existing.lock().await;
            self.teardown(&mut stale).await;
        }

        let slot = self.pool.least_loaded_worker()?;
        let worker = self.pool.worker(slot)?;
        let created = worker
            .create_routing_context()
            .await
            .map_err(|e| negotiation_error(e, SfuError::Internal))?;
        self.pool.context_opened(slot);

        let ctx = RoutingContext {
            room_id: room_id.to_string(),
            context_id: context_id.to_string(),
            engine_context_id: created.engine_context_id,
            slot,
            capabilities: created.capabilities,
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
        };
        let info = ctx.info();
        contexts.insert(room_id.to_string(), Arc::new(Mutex::new(ctx)));

        info!(
            target: "sfu.routing",
            room_id = %room_id,
            context_id = %context_id,
            slot = slot.index,
            "Routing context created"
        );
        Ok(info)
    }

    /// # Errors
    ///
    /// `Transport` on engine refusal, `WorkerLost` if the context is gone.
    pub async fn create_transport(
        &self,
        room_id: &str,
        participant_id: &str,
        direction: TransportDirection,
        extra_capabilities: &EngineBlob,
    ) -> Result<TransportInfo, SfuError> {
        let handle = self.context(room_id).await?;
        let mut ctx = handle.lock().await;
        let worker = self.worker(&ctx)?;

        let created = worker
            .create_transport(&ctx.engine_context_id, direction, extra_capabilities)
            .await
            .map_err(|e| negotiation_error(e, SfuError::Transport))?;

        ctx.transports.insert(
            created.transport_id.clone(),
            TransportEntry {
                participant_id: participant_id.to_string(),
                direction,
            },
        );
        debug!(
            target: "sfu.routing",
            room_id = %room_id,
            participant_id = %participant_id,
            transport_id = %created.transport_id,
            direction = %direction,
            "Transport created"
        );

        Ok(TransportInfo {
            transport_id: created.transport_id,
            direction,
            security_params: created.security_params,
        })
    }

    /// # Errors
    ///
    /// `NotFound` for a transport the participant does not own.
    pub async fn connect_transport(
        &self,
        room_id: &str,
        participant_id: &str,
        transport_id: &str,
        security_params: &EngineBlob,
    ) -> Result<(), SfuError> {
        let handle = self.context(room_id).await?;
        let ctx = handle.lock().await;
        ctx.owned_transport(participant_id, transport_id)?;
        let worker = self.worker(&ctx)?;

        worker
            .connect_transport(&ctx.engine_context_id, transport_id, security_params)
            .await
            .map_err(|e| negotiation_error(e, SfuError::Transport))
    }

    /// Returns the new producer id.
    ///
    /// # Errors
    ///
    /// `NotFound` for a foreign transport, `Produce` on engine refusal.
    pub async fn produce(
        &self,
        room_id: &str,
        participant_id: &str,
        transport_id: &str,
        kind: MediaKind,
        media_params: &EngineBlob,
    ) -> Result<String, SfuError> {
        let handle = self.context(room_id).await?;
        let mut ctx = handle.lock().await;
        ctx.owned_transport(participant_id, transport_id)?;
        let worker = self.worker(&ctx)?;

        let producer_id = worker
            .produce(&ctx.engine_context_id, transport_id, kind, media_params)
            .await
            .map_err(|e| negotiation_error(e, SfuError::Produce))?;

        ctx.producers.insert(
            producer_id.clone(),
            ProducerEntry {
                participant_id: participant_id.to_string(),
                kind,
            },
        );
        debug!(
            target: "sfu.routing",
            room_id = %room_id,
            participant_id = %participant_id,
            producer_id = %producer_id,
            kind = %kind,
            "Producer created"
        );
        Ok(producer_id)
    }

    /// Subscribe `participant_id` to `producer_id`. Consumers start paused.
    ///
    /// Without a `transport_id` the participant's receive transport is used.
    /// Incompatible capabilities return `ConsumeOutcome::Incompatible` and
    /// change nothing.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown producers or foreign transports, `Consume` when
    /// the participant has no receive transport or the engine refuses.
    pub async fn consume(
        &self,
        room_id: &str,
        participant_id: &str,
        transport_id: Option<&str>,
        producer_id: &str,
        consumer_capabilities: &EngineBlob,
    ) -> Result<ConsumeOutcome, SfuError> {
        let handle = self.context(room_id).await?;
        let mut ctx = handle.lock().await;

        let transport_id = match transport_id {
            Some(id) => {
                ctx.owned_transport(participant_id, id)?;
                id.to_string()
            }
            None => RoutingContext::ids_where(&ctx.transports, |t| {
                t.participant_id == participant_id && t.direction == TransportDirection::Recv
            })
            .into_iter()
            .next()
            .ok_or_else(|| SfuError::Consume("no receive transport".to_string()))?,
        };

        let kind = ctx
            .producers
            .get(producer_id)
            .map(|p| p.kind)
            .ok_or_else(|| SfuError::NotFound(format!("producer {producer_id}")))?;

        let worker = self.worker(&ctx)?;
        let compatible = worker
            .can_consume(&ctx.engine_context_id, producer_id, consumer_capabilities)
            .await
            .map_err(|e| negotiation_error(e, SfuError::Consume))?;
        if !compatible {
            debug!(
                target: "sfu.routing",
                room_id = %room_id,
                participant_id = %participant_id,
                producer_id = %producer_id,
                "Consumer capabilities incompatible with producer"
            );
            return Ok(ConsumeOutcome::Incompatible {
                reason: "consumer capabilities cannot receive this producer".to_string(),
            });
        }

        let created = worker
            .consume(
                &ctx.engine_context_id,
                &transport_id,
                producer_id,
                consumer_capabilities,
                true,
            )
            .await
            .map_err(|e| negotiation_error(e, SfuError::Consume))?;

        ctx.consumers.insert(
            created.consumer_id.clone(),
            ConsumerEntry {
                participant_id: participant_id.to_string(),
                producer_id: producer_id.to_string(),
            },
        );

        Ok(ConsumeOutcome::Created(ConsumerInfo {
            consumer_id: created.consumer_id,
            producer_id: producer_id.to_string(),
            kind,
            media_params: created.media_params,
            paused: true,
        }))
    }

    /// # Errors
    ///
    /// `NotFound` for a consumer the participant does not own.
    pub async fn set_consumer_paused(
        &self,
        room_id: &str,
        participant_id: &str,
        consumer_id: &str,
        paused: bool,
    ) -> Result<(), SfuError> {
        let handle = self.context(room_id).await?;
        let ctx = handle.lock().await;
        ctx.check_consumer_owner(participant_id, consumer_id)?;
        let worker = self.worker(&ctx)?;

        let result = if paused {
            worker.pause_consumer(&ctx.engine_context_id, consumer_id).await
        } else {
            worker.resume_consumer(&ctx.engine_context_id, consumer_id).await
        };
        result.map_err(|e| negotiation_error(e, SfuError::Consume))
    }

    /// # Errors
    ///
    /// `NotFound` for a producer the participant does not own.
    pub async fn set_producer_paused(
        &self,
        room_id: &str,
        participant_id: &str,
        producer_id: &str,
        paused: bool,
    ) -> Result<(), SfuError> {
        let handle = self.context(room_id).await?;
        let ctx = handle.lock().await;
        ctx.check_producer_owner(participant_id, producer_id)?;
        let worker = self.worker(&ctx)?;

        let result = if paused {
            worker.pause_producer(&ctx.engine_context_id, producer_id).await
        } else {
            worker.resume_producer(&ctx.engine_context_id, producer_id).await
        };
        result.map_err(|e| negotiation_error(e, SfuError::Produce))
    }

    /// Close a producer and every consumer fed by it.
    ///
    /// # Errors
    ///
    /// `NotFound` for a producer the participant does not own.
    pub async fn close_producer(
        &self,
        room_id: &str,
        participant_id: &str,
        producer_id: &str,
    ) -> Result<Vec<ClosedConsumer>, SfuError> {
        let handle = self.context(room_id).await?;
        let mut ctx = handle.lock().await;
        ctx.check_producer_owner(participant_id, producer_id)?;
        let worker = self.worker(&ctx)?;

        let closed = self.close_producer_inner(&worker, &mut ctx, producer_id).await;
        worker
            .close_producer(&ctx.engine_context_id, producer_id)
            .await
            .map_err(|e| negotiation_error(e, SfuError::Produce))?;
        Ok(closed)
    }

    /// Remove a producer's consumers and the producer from bookkeeping.
    async fn close_producer_inner(
        &self,
        worker: &Arc<dyn MediaWorker>,
        ctx: &mut RoutingContext,
        producer_id: &str,
    ) -> Vec<ClosedConsumer> {
        let consumer_ids = RoutingContext::ids_where(&ctx.consumers, |c| c.producer_id == producer_id);
        let mut closed = Vec::with_capacity(consumer_ids.len());

        for consumer_id in consumer_ids {
            if let Err(e) = worker.close_consumer(&ctx.engine_context_id, &consumer_id).await {
                debug!(target: "sfu.routing", consumer_id = %consumer_id, error = %e, "Consumer close failed");
            }
            if let Some(entry) = ctx.consumers.remove(&consumer_id) {
                closed.push(ClosedConsumer {
                    consumer_id,
                    producer_id: producer_id.to_string(),
                    participant_id: entry.participant_id,
                });
            }
        }
        ctx.producers.remove(producer_id);
        closed
    }

    /// Best effort; engines without simulcast support ignore it.
    ///
    /// # Errors
    ///
    /// `NotFound` for a consumer the participant does not own.
    pub async fn set_preferred_layers(
        &self,
        room_id: &str,
        participant_id: &str,
        consumer_id: &str,
        spatial_layer: u8,
        temporal_layer: Option<u8>,
    ) -> Result<(), SfuError> {
        let handle = self.context(room_id).await?;
        let ctx = handle.lock().await;
        ctx.check_consumer_owner(participant_id, consumer_id)?;
        let worker = self.worker(&ctx)?;

        match worker
            .set_preferred_layers(&ctx.engine_context_id, consumer_id, spatial_layer, temporal_layer)
            .await
        {
            Ok(()) => Ok(()),
            Err(EngineError::Rejected(reason)) => {
                debug!(target: "sfu.routing", consumer_id = %consumer_id, reason = %reason, "Preferred layers ignored");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Close everything a participant owns: consumers, then producers
    /// (with the peer consumers they fed), then transports.
    ///
    /// Idempotent. A room without a context yields an empty cleanup.
    ///
    /// # Errors
    ///
    /// Never fails today; engine errors during cleanup are logged.
    #[instrument(skip_all, fields(room_id = %room_id, participant_id = %participant_id))]
    pub async fn close_participant(
        &self,
        room_id: &str,
        participant_id: &str,
    ) -> Result<ParticipantCleanup, SfuError> {
        let Ok(handle) = self.context(room_id).await else {
            return Ok(ParticipantCleanup::default());
        };
        let mut ctx = handle.lock().await;
        let mut cleanup = ParticipantCleanup::default();

        let worker = self.worker(&ctx).ok();

        for consumer_id in RoutingContext::ids_where(&ctx.consumers, |c| c.participant_id == participant_id) {
            if let Some(worker) = &worker {
                if let Err(e) = worker.close_consumer(&ctx.engine_context_id, &consumer_id).await {
                    debug!(target: "sfu.routing", consumer_id = %consumer_id, error = %e, "Consumer close failed");
                }
            }
            ctx.consumers.remove(&consumer_id);
        }

        for producer_id in RoutingContext::ids_where(&ctx.producers, |p| p.participant_id == participant_id) {
            match &worker {
                Some(worker) => {
                    let orphaned = self.close_producer_inner(worker, &mut ctx, &producer_id).await;
                    cleanup.orphaned_consumers.extend(orphaned);
                    if let Err(e) = worker.close_producer(&ctx.engine_context_id, &producer_id).await {
                        debug!(target: "sfu.routing", producer_id = %producer_id, error = %e, "Producer close failed");
                    }
                }
                None => {
                    ctx.producers.remove(&producer_id);
                }
            }
            cleanup.closed_producers.push(producer_id);
        }

        for transport_id in RoutingContext::ids_where(&ctx.transports, |t| t.participant_id == participant_id) {
            if let Some(worker) = &worker {
                if let Err(e) = worker.close_transport(&ctx.engine_context_id, &transport_id).await {
                    debug!(target: "sfu.routing", transport_id = %transport_id, error = %e, "Transport close failed");
                }
            }
            ctx.transports.remove(&transport_id);
        }

        debug!(
            target: "sfu.routing",
            room_id = %room_id,
            participant_id = %participant_id,
            closed_producers = cleanup.closed_producers.len(),
            orphaned_consumers = cleanup.orphaned_consumers.len(),
            "Participant media closed"
        );
        Ok(cleanup)
    }

    /// Close a room's context. Returns whether one existed.
    #[instrument(skip_all, fields(room_id = %room_id))]
    pub async fn close_context(&self, room_id: &str) -> bool {
        let Some(handle) = self.contexts.write().await.remove(room_id) else {
            return false;
        };
        let mut ctx = handle.lock().await;
        self.teardown(&mut ctx).await;
        info!(
            target: "sfu.routing",
            room_id = %room_id,
            context_id = %ctx.context_id,
            "Routing context closed"
        );
        true
    }

    /// Consumers, producers, transports, then the context itself.
    async fn teardown(&self, ctx: &mut RoutingContext) {
        let Ok(worker) = self.worker(ctx) else {
            // Worker already gone; its contexts died with it.
            ctx.consumers.clear();
            ctx.producers.clear();
            ctx.transports.clear();
            return;
        };
        let engine_context_id = ctx.engine_context_id.clone();

        for (consumer_id, _) in ctx.consumers.drain() {
            let _ = worker.close_consumer(&engine_context_id, &consumer_id).await;
        }
        for (producer_id, _) in ctx.producers.drain() {
            let _ = worker.close_producer(&engine_context_id, &producer_id).await;
        }
        for (transport_id, _) in ctx.transports.drain() {
            let _ = worker.close_transport(&engine_context_id, &transport_id).await;
        }
        if let Err(e) = worker.close_routing_context(&engine_context_id).await {
            warn!(
                target: "sfu.routing",
                room_id = %ctx.room_id,
                error = %e,
                "Engine failed to close routing context"
            );
        }
        self.pool.context_closed(ctx.slot);
    }

    /// Forget every context that lived on a dead worker.
    ///
    /// No engine calls are made; the worker and its state are already gone.
    pub async fn handle_worker_lost(&self, slot: usize, generation: u64) -> Vec<LostContext> {
        let lost = self
            .remove_contexts(|handle| handle.index == slot && handle.generation == generation)
            .await;

        if !lost.is_empty() {
            warn!(
                target: "sfu.routing",
                slot = slot,
                generation = generation,
                rooms = lost.len(),
                "Routing contexts lost with worker"
            );
        }
        lost
    }

    /// Forget every context whose worker generation is no longer current.
    ///
    /// Catches up after worker loss events were missed.
    pub async fn reap_stale_contexts(&self) -> Vec<LostContext> {
        let lost = self
            .remove_contexts(|handle| !self.pool.is_current(handle))
            .await;
        if !lost.is_empty() {
            warn!(
                target: "sfu.routing",
                rooms = lost.len(),
                "Stale routing contexts reaped"
            );
        }
        lost
    }

    async fn remove_contexts(&self, doomed: impl Fn(SlotHandle) -> bool) -> Vec<LostContext> {
        let mut contexts = self.contexts.write().await;
        let mut lost = Vec::new();
        for (room_id, handle) in contexts.iter() {
            let ctx = handle.lock().await;
            if doomed(ctx.slot) {
                lost.push(LostContext {
                    room_id: room_id.clone(),
                    context_id: ctx.context_id.clone(),
                });
            }
        }
        for context in &lost {
            contexts.remove(&context.room_id);
        }
        lost.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        lost
    }
}

#[async_trait]
impl RoutingService for RoutingContextManager {
    async fn execute(&self, call: RoutingCall) -> Result<RoutingReply, SfuError> {
        match call {
            RoutingCall::CreateContext { room_id, context_id } => self
                .create_context(&room_id, &context_id)
                .await
                .map(RoutingReply::Context),
            RoutingCall::CloseContext { room_id } => {
                Ok(RoutingReply::ContextClosed(self.close_context(&room_id).await))
            }
            RoutingCall::CreateTransport {
                room_id,
                participant_id,
                direction,
                extra_capabilities,
            } => self
                .create_transport(&room_id, &participant_id, direction, &extra_capabilities)
                .await
                .map(RoutingReply::Transport),
            RoutingCall::ConnectTransport {
                room_id,
                participant_id,
                transport_id,
                security_params,
            } => self
                .connect_transport(&room_id, &participant_id, &transport_id, &security_params)
                .await
                .map(|()| RoutingReply::Done),
            RoutingCall::Produce {
                room_id,
                participant_id,
                transport_id,
                kind,
                media_params,
            } => self
                .produce(&room_id, &participant_id, &transport_id, kind, &media_params)
                .await
                .map(RoutingReply::Producer),
            RoutingCall::Consume {
                room_id,
                participant_id,
                transport_id,
                producer_id,
                consumer_capabilities,
            } => self
                .consume(
                    &room_id,
                    &participant_id,
                    transport_id.as_deref(),
                    &producer_id,
                    &consumer_capabilities,
                )
                .await
                .map(RoutingReply::Consume),
            RoutingCall::PauseConsumer {
                room_id,
                participant_id,
                consumer_id,
            } => self
                .set_consumer_paused(&room_id, &participant_id, &consumer_id, true)
                .await
                .map(|()| RoutingReply::Done),
            RoutingCall::ResumeConsumer {
                room_id,
                participant_id,
                consumer_id,
            } => self
                .set_consumer_paused(&room_id, &participant_id, &consumer_id, false)
                .await
                .map(|()| RoutingReply::Done),
            RoutingCall::PauseProducer {
                room_id,
                participant_id,
                producer_id,
            } => self
                .set_producer_paused(&room_id, &participant_id, &producer_id, true)
                .await
                .map(|()| RoutingReply::Done),
            RoutingCall::ResumeProducer {
                room_id,
                participant_id,
                producer_id,
            } => self
                .set_producer_paused(&room_id, &participant_id, &producer_id, false)
                .await
                .map(|()| RoutingReply::Done),
            RoutingCall::CloseProducer {
                room_id,
                participant_id,
                producer_id,
            } => self
                .close_producer(&room_id, &participant_id, &producer_id)
                .await
                .map(RoutingReply::ProducerClosed),
            RoutingCall::SetPreferredLayers {
                room_id,
                participant_id,
                consumer_id,
                spatial_layer,
                temporal_layer,
            } => self
                .set_preferred_layers(&room_id, &participant_id, &consumer_id, spatial_layer, temporal_layer)
                .await
                .map(|()| RoutingReply::Done),
            RoutingCall::CloseParticipant {
                room_id,
                participant_id,
            } => self
                .close_participant(&room_id, &participant_id)
                .await
                .map(RoutingReply::ParticipantClosed),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::{LoopbackEngine, MediaEngine, PoolConfig};
    use serde_json::json;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        engine: Arc<LoopbackEngine>,
        manager: RoutingContextManager,
        token: CancellationToken,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.token.cancel();
        }
    }

    async fn fixture(workers: usize) -> Fixture {
        let engine = Arc::new(LoopbackEngine::new());
        let token = CancellationToken::new();
        let (pool, _supervisors) = MediaEnginePool::start(
            Arc::clone(&engine) as Arc<dyn MediaEngine>,
            PoolConfig {
                worker_count: workers,
                restart_delay: Duration::from_millis(50),
            },
            token.clone(),
        )
        .await
        .unwrap();
        Fixture {
            engine,
            manager: RoutingContextManager::new(pool),
            token,
        }
    }

    fn vp8() -> EngineBlob {
        EngineBlob::from(json!({"codecs": [{"mimeType": "video/VP8"}]}))
    }

    async fn transport(f: &Fixture, participant: &str, direction: TransportDirection) -> String {
        f.manager
            .create_transport("r1", participant, direction, &EngineBlob::empty())
            .await
            .unwrap()
            .transport_id
    }

    #[tokio::test]
    async fn test_create_context_is_idempotent() {
        let f = fixture(2).await;

        let first = f.manager.create_context("r1", "ctx-1").await.unwrap();
        let second = f.manager.create_context("r1", "ctx-1").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(f.manager.context_count().await, 1);
        assert_eq!(f.manager.pool().total_contexts(), 1);
    }

    #[tokio::test]
    async fn test_new_placement_replaces_stale_context() {
        let f = fixture(1).await;
        f.manager.create_context("r1", "ctx-1").await.unwrap();
        let replaced = f.manager.create_context("r1", "ctx-2").await.unwrap();

        assert_eq!(replaced.context_id, "ctx-2");
        assert_eq!(f.manager.pool().total_contexts(), 1);
        assert_eq!(f.engine.context_count(0), 1);
    }

    #[tokio::test]
    async fn test_produce_consume_flow() {
        let f = fixture(1).await;
        f.manager.create_context("r1", "ctx-1").await.unwrap();

        let send = transport(&f, "a", TransportDirection::Send).await;
        let _recv = transport(&f, "b", TransportDirection::Recv).await;

        let producer_id = f
            .manager
            .produce("r1", "a", &send, MediaKind::Video, &vp8())
            .await
            .unwrap();

        let outcome = f
            .manager
            .consume("r1", "b", None, &producer_id, &vp8())
            .await
            .unwrap();
        let ConsumeOutcome::Created(consumer) = outcome else {
            unreachable!("expected a consumer");
        };
        assert!(consumer.paused);
        assert_eq!(consumer.kind, MediaKind::Video);

        f.manager
            .set_consumer_paused("r1", "b", &consumer.consumer_id, false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_incompatible_consume_changes_nothing() {
        let f = fixture(1).await;
        f.manager.create_context("r1", "ctx-1").await.unwrap();
        let send = transport(&f, "a", TransportDirection::Send).await;
        transport(&f, "b", TransportDirection::Recv).await;
        let producer_id = f
            .manager
            .produce("r1", "a", &send, MediaKind::Video, &vp8())
            .await
            .unwrap();

        let h264 = EngineBlob::from(json!({"codecs": [{"mimeType": "video/H264"}]}));
        let outcome = f
            .manager
            .consume("r1", "b", None, &producer_id, &h264)
            .await
            .unwrap();
        assert!(matches!(outcome, ConsumeOutcome::Incompatible { .. }));

        // Closing the producer finds no consumers to close.
        let closed = f.manager.close_producer("r1", "a", &producer_id).await.unwrap();
        assert!(closed.is_empty());
    }

    #[tokio::test]
    async fn test_objects_are_scoped_to_their_owner() {
        let f = fixture(1).await;
        f.manager.create_context("r1", "ctx-1").await.unwrap();
        let send = transport(&f, "a", TransportDirection::Send).await;

        let err = f
            .manager
            .produce("r1", "b", &send, MediaKind::Audio, &vp8())
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::NotFound(_)));

        let producer_id = f
            .manager
            .produce("r1", "a", &send, MediaKind::Video, &vp8())
            .await
            .unwrap();
        let err = f
            .manager
            .close_producer("r1", "b", &producer_id)
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_consume_without_receive_transport() {
        let f = fixture(1).await;
        f.manager.create_context("r1", "ctx-1").await.unwrap();
        let send = transport(&f, "a", TransportDirection::Send).await;
        let producer_id = f
            .manager
            .produce("r1", "a", &send, MediaKind::Video, &vp8())
            .await
            .unwrap();

        let err = f
            .manager
            .consume("r1", "b", None, &producer_id, &vp8())
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::Consume(_)));
    }

    #[tokio::test]
    async fn test_close_participant_reports_orphaned_consumers() {
        let f = fixture(1).await;
        f.manager.create_context("r1", "ctx-1").await.unwrap();
        let send = transport(&f, "a", TransportDirection::Send).await;
        transport(&f, "b", TransportDirection::Recv).await;
        let producer_id = f
            .manager
            .produce("r1", "a", &send, MediaKind::Video, &vp8())
            .await
            .unwrap();
        let ConsumeOutcome::Created(consumer) = f
            .manager
            .consume("r1", "b", None, &producer_id, &vp8())
            .await
            .unwrap()
        else {
            unreachable!("expected a consumer");
        };

        let cleanup = f.manager.close_participant("r1", "a").await.unwrap();
        assert_eq!(cleanup.closed_producers, vec![producer_id.clone()]);
        assert_eq!(
            cleanup.orphaned_consumers,
            vec![ClosedConsumer {
                consumer_id: consumer.consumer_id.clone(),
                producer_id,
                participant_id: "b".to_string(),
            }]
        );

        // b's consumer is gone; b's own transport survives.
        let err = f
            .manager
            .set_consumer_paused("r1", "b", &consumer.consumer_id, true)
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::NotFound(_)));

        // Second close is a no-op.
        let again = f.manager.close_participant("r1", "a").await.unwrap();
        assert_eq!(again, ParticipantCleanup::default());
    }

    #[tokio::test]
    async fn test_close_context_releases_worker_load() {
        let f = fixture(1).await;
        f.manager.create_context("r1", "ctx-1").await.unwrap();
        let send = transport(&f, "a", TransportDirection::Send).await;
        f.manager
            .produce("r1", "a", &send, MediaKind::Audio, &EngineBlob::from(json!({"codecs": [{"mimeType": "audio/opus"}]})))
            .await
            .unwrap();

        assert!(f.manager.close_context("r1").await);
        assert!(!f.manager.close_context("r1").await);
        assert_eq!(f.manager.pool().total_contexts(), 0);
        assert_eq!(f.engine.context_count(0), 0);

        let err = f
            .manager
            .create_transport("r1", "a", TransportDirection::Send, &EngineBlob::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::WorkerLost(_)));
    }

    #[tokio::test]
    async fn test_worker_loss_drops_contexts_on_that_slot() {
        let f = fixture(2).await;
        f.manager.create_context("r1", "ctx-1").await.unwrap();
        f.manager.create_context("r2", "ctx-2").await.unwrap();

        let slot_of_r1 = f
            .manager
            .pool()
            .stats()
            .into_iter()
            .position(|s| s.contexts == 1)
            .unwrap();

        let lost = f.manager.handle_worker_lost(slot_of_r1, 0).await;
        assert_eq!(lost.len(), 1);
        assert_eq!(f.manager.context_count().await, 1);

        // Unknown generation matches nothing.
        assert!(f.manager.handle_worker_lost(slot_of_r1, 7).await.is_empty());
    }

    #[tokio::test]
    async fn test_reap_stale_contexts_after_missed_loss() {
        let f = fixture(1).await;
        f.manager.create_context("r1", "ctx-1").await.unwrap();
        assert!(f.manager.reap_stale_contexts().await.is_empty());

        assert!(f.engine.kill(0));
        tokio::time::timeout(Duration::from_secs(5), async {
            while f.manager.pool().stats().first().map(|s| s.generation) == Some(0) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let lost = f.manager.reap_stale_contexts().await;
        assert_eq!(
            lost,
            vec![LostContext {
                room_id: "r1".to_string(),
                context_id: "ctx-1".to_string(),
            }]
        );
        assert!(!f.manager.has_context("r1").await);
        assert!(f.manager.reap_stale_contexts().await.is_empty());
    }

    #[tokio::test]
    async fn test_execute_dispatches_calls() {
        let f = fixture(1).await;
        let reply = f
            .manager
            .execute(RoutingCall::CreateContext {
                room_id: "r1".to_string(),
                context_id: "ctx-1".to_string(),
            })
            .await
            .unwrap();
        assert!(matches!(reply, RoutingReply::Context(ContextInfo { ref context_id, .. }) if context_id == "ctx-1"));

        let reply = f
            .manager
            .execute(RoutingCall::CloseParticipant {
                room_id: "r1".to_string(),
                participant_id: "nobody".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(reply, RoutingReply::ParticipantClosed(ParticipantCleanup::default()));
    }
}
