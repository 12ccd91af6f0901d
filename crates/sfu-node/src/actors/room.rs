//! `RoomActor` - one per room with participants on this node.
//!
//! The room actor owns the local roster for its room:
//!
//! - Ensures the room has a cluster placement and a routing context
//! - Routes media operations to the owning node's Routing Context Manager
//! - Fans room events out to local connections and to other replicas
//! - Releases the placement when the cluster-wide roster empties
//!
//! The actor exits once it holds no participants and has no roster cleanup
//! left to retry. Messages that reach it after that point are answered with
//! `SfuError::RoomClosed`, so callers can ask the directory for a fresh actor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::types::EngineBlob;
use signaling_protocol::{NodeRef, ParticipantSummary, ProducerSummary, ServerEvent};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::messages::{
    ClientSink, JoinOutcome, JoinRequest, MediaRequest, RelayEnvelope, RoomEvent, RoomMessage,
    RoomState,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use crate::cluster::{ClusterCoordinator, Placement};
use crate::errors::SfuError;
use crate::observability::metrics;
use crate::routing::{ClosedConsumer, ConsumeOutcome, RoomRouter, RouterRegistry};

/// Default channel buffer size for room mailboxes.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// Session-ended reasons, also used as metric labels.
pub const REASON_WORKER_LOST: &str = "worker-lost";
pub const REASON_PLACEMENT_LOST: &str = "placement-lost";

/// Shared dependencies of every room actor on a node.
#[derive(Clone)]
pub struct RoomServices {
    pub node_id: String,
    pub coordinator: ClusterCoordinator,
    pub registry: Arc<RouterRegistry>,
    pub metrics: Arc<ActorMetrics>,
    /// How often the actor re-reads its placement.
    pub reconcile_interval: Duration,
}

/// Handle to a `RoomActor`.
#[derive(Debug, Clone)]
pub struct RoomActorHandle {
    room_id: String,
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
}

impl RoomActorHandle {
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Add a connection to the room.
    ///
    /// # Errors
    ///
    /// `RoomClosed` if the actor already exited, otherwise the join failure.
    pub async fn join(&self, request: JoinRequest) -> Result<JoinOutcome, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomMessage::Join {
            request,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| self.closed())?
    }

    /// Remove a participant. Unknown participants are ignored.
    ///
    /// # Errors
    ///
    /// `RoomClosed` if the actor already exited.
    pub async fn leave(&self, participant_id: &str) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomMessage::Leave {
            participant_id: participant_id.to_string(),
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| self.closed())?
    }

    /// Run a media operation and return the caller's response event.
    ///
    /// # Errors
    ///
    /// The routing failure, or `NotInRoom` if the participant is gone.
    pub async fn media(
        &self,
        participant_id: &str,
        request: MediaRequest,
    ) -> Result<ServerEvent, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomMessage::Media {
            participant_id: participant_id.to_string(),
            request,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| self.closed())?
    }

    /// Deliver an event relayed from another replica.
    ///
    /// # Errors
    ///
    /// `RoomClosed` if the actor already exited.
    pub async fn relay(&self, event: RoomEvent) -> Result<(), SfuError> {
        self.send(RoomMessage::Relay { event }).await
    }

    /// End the session for every local participant.
    ///
    /// # Errors
    ///
    /// `RoomClosed` if the actor already exited.
    pub async fn end_session(&self, reason: &str) -> Result<(), SfuError> {
        self.send(RoomMessage::EndSession {
            reason: reason.to_string(),
        })
        .await
    }

    /// # Errors
    ///
    /// `RoomClosed` if the actor already exited.
    pub async fn get_state(&self) -> Result<RoomState, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomMessage::GetState { respond_to: tx }).await?;
        rx.await.map_err(|_| self.closed())
    }

    /// Whether the actor stopped accepting messages.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Cancel the actor. Its local participants are cleaned up first.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    async fn send(&self, message: RoomMessage) -> Result<(), SfuError> {
        self.sender.send(message).await.map_err(|_| self.closed())
    }

    fn closed(&self) -> SfuError {
        SfuError::RoomClosed(self.room_id.clone())
    }
}

/// A local connection's membership in the room.
struct LocalParticipant {
    summary: ParticipantSummary,
    sink: ClientSink,
    /// Consumer id to producer id.
    consumers: HashMap<String, String>,
}

/// The room's placement as seen by this actor.
struct ActivePlacement {
    placement: Placement,
    router: RoomRouter,
    capabilities: EngineBlob,
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_id: String,
    services: RoomServices,
    receiver: mpsc::Receiver<RoomMessage>,
    cancel_token: CancellationToken,
    participants: HashMap<String, LocalParticipant>,
    placement: Option<ActivePlacement>,
    /// Departed participants whose roster entry could not be removed yet.
    stale_roster: Vec<String>,
    /// The idle check could not read the roster; retried on the next tick.
    release_pending: bool,
    mailbox: MailboxMonitor,
}

impl RoomActor {
    /// Spawn a new room actor.
    #[must_use]
    pub fn spawn(
        room_id: String,
        services: RoomServices,
        cancel_token: CancellationToken,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);

        let handle = RoomActorHandle {
            room_id: room_id.clone(),
            sender,
            cancel_token: cancel_token.clone(),
        };

        let actor = Self {
            mailbox: MailboxMonitor::new(ActorType::Room, &room_id),
            room_id,
            services,
            receiver,
            cancel_token,
            participants: HashMap::new(),
            placement: None,
            stale_roster: Vec::new(),
            release_pending: false,
        };

        let task_handle = tokio::spawn(actor.run());

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "sfu.directory.room", fields(room_id = %self.room_id))]
    async fn run(mut self) {
        info!(
            target: "sfu.directory.room",
            room_id = %self.room_id,
            "RoomActor started"
        );

        let period = self.services.reconcile_interval;
        let mut reconcile = interval_at(Instant::now() + period, period);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sfu.directory.room",
                        room_id = %self.room_id,
                        participants = self.participants.len(),
                        "RoomActor received cancellation signal"
                    );
                    self.leave_all().await;
                    break;
                }

                _ = reconcile.tick() => {
                    self.retry_cleanup().await;
                    self.reconcile().await;
                    if self.is_idle() {
                        break;
                    }
                }

                msg = self.receiver.recv() => {
                    let Some(message) = msg else {
                        break;
                    };
                    let may_empty = self.handle_message(message).await;
                    self.mailbox.record_processed(self.receiver.len());
                    self.services.metrics.record_message_processed();

                    if may_empty && self.is_idle() {
                        break;
                    }
                }
            }
        }

        self.close_mailbox();

        info!(
            target: "sfu.directory.room",
            room_id = %self.room_id,
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );
    }

    /// Handle one message. Returns whether it could have emptied the room.
    async fn handle_message(&mut self, message: RoomMessage) -> bool {
        match message {
            RoomMessage::Join {
                request,
                respond_to,
            } => {
                let result = self.join(request).await;
                let _ = respond_to.send(result);
                true
            }

            RoomMessage::Leave {
                participant_id,
                respond_to,
            } => {
                self.leave(&participant_id).await;
                let _ = respond_to.send(Ok(()));
                true
            }

            RoomMessage::Media {
                participant_id,
                request,
                respond_to,
            } => {
                let op = request.op();
                let result = self.media(&participant_id, request).await;
                if let Err(e) = &result {
                    debug!(
                        target: "sfu.directory.room",
                        room_id = %self.room_id,
                        participant_id = %participant_id,
                        op,
                        error = %e,
                        "Media operation failed"
                    );
                }
                let _ = respond_to.send(result);
                false
            }

            RoomMessage::Relay { event } => self.apply_relayed(event).await,

            RoomMessage::EndSession { reason } => {
                self.end_session(&reason).await;
                true
            }

            RoomMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.state());
                false
            }
        }
    }

    /// No local participants and no cluster cleanup left to retry.
    fn is_idle(&self) -> bool {
        self.participants.is_empty() && self.stale_roster.is_empty() && !self.release_pending
    }

    fn state(&self) -> RoomState {
        let mut participants: Vec<String> = self.participants.keys().cloned().collect();
        participants.sort();
        RoomState {
            room_id: self.room_id.clone(),
            participants,
            node_id: self.placement.as_ref().map(|p| p.placement.node_id.clone()),
            context_id: self.placement.as_ref().map(|p| p.placement.context_id.clone()),
        }
    }

    // ------------------------------------------------------------------
    // Join / leave
    // ------------------------------------------------------------------

    async fn join(&mut self, request: JoinRequest) -> Result<JoinOutcome, SfuError> {
        let result = self.admit(request).await;
        if let Err(e) = &result {
            if self.participants.is_empty() {
                debug!(target: "sfu.directory.room", room_id = %self.room_id, error = %e, "Join failed on an empty room");
                self.release_if_idle().await;
            }
        }
        result
    }

    async fn admit(&mut self, request: JoinRequest) -> Result<JoinOutcome, SfuError> {
        let (node_ref, engine_capabilities) = self.ensure_placement().await?;

        let participant_id = new_participant_id(&request.user_id);
        let summary = ParticipantSummary {
            participant_id: participant_id.clone(),
            user_id: request.user_id,
            display_name: request.display_name,
            role: request.role,
            producers: Vec::new(),
        };

        // Read before our own entry lands so the roster excludes the caller.
        let roster = self.services.coordinator.roster(&self.room_id).await?;
        self.services
            .coordinator
            .roster_upsert(&self.room_id, &summary)
            .await?;

        self.broadcast(
            None,
            &ServerEvent::ParticipantJoined {
                participant: summary.clone(),
            },
        );
        self.publish(RoomEvent::ParticipantJoined {
            participant: summary.clone(),
        })
        .await;

        self.participants.insert(
            participant_id.clone(),
            LocalParticipant {
                summary,
                sink: request.sink,
                consumers: HashMap::new(),
            },
        );
        self.services.metrics.participant_joined();

        info!(
            target: "sfu.directory.room",
            room_id = %self.room_id,
            participant_id = %participant_id,
            role = %request.role,
            node_id = %node_ref.node_id,
            local_participants = self.participants.len(),
            "Participant joined"
        );

        let participants = roster
            .into_iter()
            .filter(|p| p.participant_id != participant_id && !self.stale_roster.contains(&p.participant_id))
            .collect();

        Ok(JoinOutcome {
            joined: ServerEvent::RoomJoined {
                room_id: self.room_id.clone(),
                participant_id: participant_id.clone(),
                engine_capabilities,
                participants,
                node_ref,
            },
            participant_id,
        })
    }

    /// Allocate (or reuse) the room's placement and make sure its routing
    /// context exists on the owning node.
    async fn ensure_placement(&mut self) -> Result<(NodeRef, EngineBlob), SfuError> {
        if let Some(active) = &self.placement {
            return Ok((node_ref(&active.placement), active.capabilities.clone()));
        }

        let placement = self.services.coordinator.allocate(&self.room_id).await?;
        let router = match self
            .services
            .registry
            .router(&self.room_id, &placement.node_id)
            .await
        {
            Ok(router) => router,
            Err(e) => {
                warn!(
                    target: "sfu.directory.room",
                    room_id = %self.room_id,
                    node_id = %placement.node_id,
                    error = %e,
                    "Owning node could not be reached"
                );
                self.release_if_unused(&placement).await;
                return Err(e);
            }
        };

        let context = match router.create_context(&placement.context_id).await {
            Ok(context) => context,
            Err(e) => {
                warn!(
                    target: "sfu.directory.room",
                    room_id = %self.room_id,
                    node_id = %placement.node_id,
                    error = %e,
                    "Routing context could not be created"
                );
                self.release_if_unused(&placement).await;
                return Err(e);
            }
        };

        let result = (node_ref(&placement), context.capabilities.clone());
        self.placement = Some(ActivePlacement {
            placement,
            router,
            capabilities: context.capabilities,
        });
        Ok(result)
    }

    /// Drop a placement nobody is using so the next join re-allocates.
    async fn release_if_unused(&self, placement: &Placement) {
        match self.services.coordinator.roster(&self.room_id).await {
            Ok(roster) if roster.is_empty() => {
                if let Err(e) = self
                    .services
                    .coordinator
                    .release_context(&self.room_id, &placement.context_id)
                    .await
                {
                    warn!(target: "sfu.directory.room", room_id = %self.room_id, error = %e, "Failed to release unused placement");
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(target: "sfu.directory.room", room_id = %self.room_id, error = %e, "Failed to read roster");
            }
        }
    }

    async fn leave(&mut self, participant_id: &str) {
        let Some(participant) = self.participants.remove(participant_id) else {
            debug!(
                target: "sfu.directory.room",
                room_id = %self.room_id,
                participant_id = %participant_id,
                "Leave for unknown participant ignored"
            );
            return;
        };
        self.services.metrics.participants_left(1);
        self.cleanup_participant(participant.summary.participant_id).await;
    }

    /// Cascade one departed participant: media, peers, roster, and the
    /// room itself once the cluster-wide roster is empty.
    async fn cleanup_participant(&mut self, participant_id: String) {
        let cleanup = match &self.placement {
            Some(active) => Some(active.router.close_participant(&participant_id).await),
            None => None,
        };
        if let Some(cleanup) = cleanup {
            match cleanup {
                Ok(cleanup) => {
                    for producer_id in cleanup.closed_producers {
                        self.broadcast(
                            None,
                            &ServerEvent::ProducerClosed {
                                producer_id: producer_id.clone(),
                                participant_id: participant_id.clone(),
                            },
                        );
                        self.publish(RoomEvent::ProducerClosed {
                            participant_id: participant_id.clone(),
                            producer_id,
                        })
                        .await;
                    }
                    self.notify_closed_consumers(cleanup.orphaned_consumers).await;
                }
                Err(e) => {
                    warn!(
                        target: "sfu.directory.room",
                        room_id = %self.room_id,
                        participant_id = %participant_id,
                        error = %e,
                        "Routing cleanup failed"
                    );
                }
            }
        }

        self.broadcast(
            None,
            &ServerEvent::ParticipantLeft {
                participant_id: participant_id.clone(),
            },
        );
        self.publish(RoomEvent::ParticipantLeft {
            participant_id: participant_id.clone(),
        })
        .await;

        match self
            .services
            .coordinator
            .roster_remove(&self.room_id, &participant_id)
            .await
        {
            Ok(remaining) => {
                info!(
                    target: "sfu.directory.room",
                    room_id = %self.room_id,
                    participant_id = %participant_id,
                    remaining,
                    "Participant left"
                );
                if !self.participants.is_empty() {
                    return;
                }
                if remaining == 0 {
                    self.teardown().await;
                } else if !self.stale_roster.is_empty() {
                    self.release_if_idle().await;
                }
            }
            Err(e) => {
                warn!(
                    target: "sfu.directory.room",
                    room_id = %self.room_id,
                    participant_id = %participant_id,
                    error = %e,
                    "Failed to update roster, removal will be retried"
                );
                self.stale_roster.push(participant_id);
                self.release_if_idle().await;
            }
        }
    }

    /// Tear the room down when no member anywhere in the cluster still
    /// needs it. Roster entries awaiting removal do not count.
    async fn release_if_idle(&mut self) {
        if !self.participants.is_empty() || self.placement.is_none() {
            self.release_pending = false;
            return;
        }
        match self.services.coordinator.roster(&self.room_id).await {
            Ok(roster) => {
                self.release_pending = false;
                if roster
                    .iter()
                    .all(|p| self.stale_roster.contains(&p.participant_id))
                {
                    self.teardown().await;
                }
            }
            Err(e) => {
                warn!(target: "sfu.directory.room", room_id = %self.room_id, error = %e, "Failed to read roster, release will be retried");
                self.release_pending = true;
            }
        }
    }

    /// Retry roster removals and idle checks that failed earlier.
    async fn retry_cleanup(&mut self) {
        if self.stale_roster.is_empty() && !self.release_pending {
            return;
        }
        for participant_id in std::mem::take(&mut self.stale_roster) {
            if let Err(e) = self
                .services
                .coordinator
                .roster_remove(&self.room_id, &participant_id)
                .await
            {
                debug!(target: "sfu.directory.room", room_id = %self.room_id, participant_id = %participant_id, error = %e, "Roster removal still failing");
                self.stale_roster.push(participant_id);
            }
        }
        self.release_if_idle().await;
    }

    /// Release the placement and close the routing context.
    async fn teardown(&mut self) {
        let Some(active) = self.placement.take() else {
            return;
        };

        if let Err(e) = self
            .services
            .coordinator
            .release_context(&self.room_id, &active.placement.context_id)
            .await
        {
            warn!(target: "sfu.directory.room", room_id = %self.room_id, error = %e, "Failed to release placement");
        }
        if let Err(e) = active.router.close_context().await {
            warn!(target: "sfu.directory.room", room_id = %self.room_id, error = %e, "Failed to close routing context");
        }
        self.release_pending = false;
        match self.services.coordinator.clear_roster(&self.room_id).await {
            Ok(()) => self.stale_roster.clear(),
            Err(e) => {
                warn!(target: "sfu.directory.room", room_id = %self.room_id, error = %e, "Failed to clear roster");
            }
        }

        info!(
            target: "sfu.directory.room",
            room_id = %self.room_id,
            node_id = %active.placement.node_id,
            context_id = %active.placement.context_id,
            "Room torn down"
        );
    }

    /// Shutdown path: every local participant leaves as if disconnected.
    async fn leave_all(&mut self) {
        let ids: Vec<String> = self.participants.keys().cloned().collect();
        for participant_id in ids {
            self.leave(&participant_id).await;
        }
    }

    /// End the session for every local participant. The routing context is
    /// gone, so nothing is closed on the engine side.
    async fn end_session(&mut self, reason: &str) {
        if self.participants.is_empty() {
            self.placement = None;
            return;
        }

        metrics::record_session_ended(reason);
        warn!(
            target: "sfu.directory.room",
            room_id = %self.room_id,
            reason,
            participants = self.participants.len(),
            "Room session ended"
        );

        let departed: Vec<(String, LocalParticipant)> = self.participants.drain().collect();
        self.services.metrics.participants_left(departed.len());
        for (participant_id, participant) in departed {
            participant.sink.end_session(&self.room_id, reason);
            if let Err(e) = self
                .services
                .coordinator
                .roster_remove(&self.room_id, &participant_id)
                .await
            {
                debug!(target: "sfu.directory.room", room_id = %self.room_id, error = %e, "Roster removal failed");
                self.stale_roster.push(participant_id);
            }
        }
        self.placement = None;
    }

    /// Compare the cached placement with the cluster's record.
    async fn reconcile(&mut self) {
        let Some(active) = &self.placement else {
            return;
        };
        let context_id = active.placement.context_id.clone();

        match self.services.coordinator.placement(&self.room_id).await {
            Ok(Some(current)) if current.context_id == context_id => {}
            Ok(_) => {
                info!(
                    target: "sfu.directory.room",
                    room_id = %self.room_id,
                    context_id = %context_id,
                    "Placement no longer current"
                );
                self.end_session(REASON_PLACEMENT_LOST).await;
            }
            Err(e) => {
                debug!(target: "sfu.directory.room", room_id = %self.room_id, error = %e, "Placement check failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Media operations
    // ------------------------------------------------------------------

    fn router(&self) -> Result<&RoomRouter, SfuError> {
        self.placement
            .as_ref()
            .map(|p| &p.router)
            .ok_or_else(|| SfuError::RoomClosed(self.room_id.clone()))
    }

    #[instrument(skip_all, fields(room_id = %self.room_id, op = request.op()))]
    async fn media(
        &mut self,
        participant_id: &str,
        request: MediaRequest,
    ) -> Result<ServerEvent, SfuError> {
        let Some(participant) = self.participants.get(participant_id) else {
            return Err(SfuError::NotInRoom);
        };
        let role = participant.summary.role;
        let router = self.router()?;

        match request {
            MediaRequest::CreateTransport {
                direction,
                extra_capabilities,
            } => {
                let info = router
                    .create_transport(participant_id, direction, extra_capabilities)
                    .await?;
                Ok(ServerEvent::TransportCreated {
                    transport_id: info.transport_id,
                    direction: info.direction,
                    security_params: info.security_params,
                })
            }

            MediaRequest::ConnectTransport {
                transport_id,
                security_params,
            } => {
                router
                    .connect_transport(participant_id, transport_id.clone(), security_params)
                    .await?;
                Ok(ServerEvent::TransportConnected { transport_id })
            }

            MediaRequest::Produce {
                transport_id,
                kind,
                media_params,
                source,
                app_data,
            } => {
                if !role.can_produce() {
                    return Err(SfuError::Authorization(format!(
                        "Role {role} cannot publish media"
                    )));
                }
                let producer_id = router
                    .produce(participant_id, transport_id, kind, media_params)
                    .await?;
                let producer = ProducerSummary {
                    producer_id: producer_id.clone(),
                    kind,
                    source: source.unwrap_or_else(|| kind.default_source()),
                    paused: false,
                    app_data,
                };
                self.producer_added(participant_id, producer).await;
                Ok(ServerEvent::Produced { producer_id })
            }

            MediaRequest::Consume {
                producer_id,
                consumer_capabilities,
                transport_id,
            } => {
                let outcome = router
                    .consume(
                        participant_id,
                        transport_id,
                        producer_id.clone(),
                        consumer_capabilities,
                    )
                    .await?;
                match outcome {
                    ConsumeOutcome::Created(info) => {
                        if let Some(participant) = self.participants.get_mut(participant_id) {
                            participant
                                .consumers
                                .insert(info.consumer_id.clone(), info.producer_id.clone());
                        }
                        Ok(ServerEvent::ConsumerCreated {
                            consumer_id: info.consumer_id,
                            producer_id: info.producer_id,
                            kind: info.kind,
                            media_params: info.media_params,
                            paused: info.paused,
                        })
                    }
                    ConsumeOutcome::Incompatible { reason } => {
                        Ok(ServerEvent::CannotConsume { producer_id, reason })
                    }
                }
            }

            MediaRequest::ResumeConsumer { consumer_id } => {
                router
                    .resume_consumer(participant_id, consumer_id.clone())
                    .await?;
                Ok(ServerEvent::ConsumerResumed { consumer_id })
            }

            MediaRequest::PauseConsumer { consumer_id } => {
                router
                    .pause_consumer(participant_id, consumer_id.clone())
                    .await?;
                Ok(ServerEvent::ConsumerPaused { consumer_id })
            }

            MediaRequest::PauseProducer { producer_id } => {
                router
                    .pause_producer(participant_id, producer_id.clone())
                    .await?;
                self.producer_paused(participant_id, &producer_id, true).await;
                Ok(ServerEvent::ProducerPaused {
                    producer_id,
                    participant_id: participant_id.to_string(),
                })
            }

            MediaRequest::ResumeProducer { producer_id } => {
                router
                    .resume_producer(participant_id, producer_id.clone())
                    .await?;
                self.producer_paused(participant_id, &producer_id, false).await;
                Ok(ServerEvent::ProducerResumed {
                    producer_id,
                    participant_id: participant_id.to_string(),
                })
            }

            MediaRequest::CloseProducer { producer_id } => {
                let closed = router
                    .close_producer(participant_id, producer_id.clone())
                    .await?;
                self.producer_removed(participant_id, &producer_id).await;
                self.notify_closed_consumers(closed).await;
                Ok(ServerEvent::ProducerClosed {
                    producer_id,
                    participant_id: participant_id.to_string(),
                })
            }

            MediaRequest::SetPreferredLayers {
                consumer_id,
                spatial_layer,
                temporal_layer,
            } => {
                router
                    .set_preferred_layers(
                        participant_id,
                        consumer_id.clone(),
                        spatial_layer,
                        temporal_layer,
                    )
                    .await?;
                Ok(ServerEvent::PreferredLayersSet { consumer_id })
            }
        }
    }

    async fn producer_added(&mut self, participant_id: &str, producer: ProducerSummary) {
        if let Some(participant) = self.participants.get_mut(participant_id) {
            participant.summary.producers.push(producer.clone());
        }
        self.sync_roster_entry(participant_id).await;

        self.broadcast(
            Some(participant_id),
            &ServerEvent::NewProducer {
                producer_id: producer.producer_id.clone(),
                participant_id: participant_id.to_string(),
                kind: producer.kind,
                source: producer.source,
                app_data: producer.app_data.clone(),
            },
        );
        self.publish(RoomEvent::NewProducer {
            participant_id: participant_id.to_string(),
            producer,
        })
        .await;
    }

    async fn producer_paused(&mut self, participant_id: &str, producer_id: &str, paused: bool) {
        if let Some(producer) = self
            .participants
            .get_mut(participant_id)
            .and_then(|p| p.summary.producers.iter_mut().find(|p| p.producer_id == producer_id))
        {
            producer.paused = paused;
        }
        self.sync_roster_entry(participant_id).await;

        let participant_id = participant_id.to_string();
        let producer_id = producer_id.to_string();
        let (event, relayed) = if paused {
            (
                ServerEvent::ProducerPaused {
                    producer_id: producer_id.clone(),
                    participant_id: participant_id.clone(),
                },
                RoomEvent::ProducerPaused {
                    participant_id: participant_id.clone(),
                    producer_id,
                },
            )
        } else {
            (
                ServerEvent::ProducerResumed {
                    producer_id: producer_id.clone(),
                    participant_id: participant_id.clone(),
                },
                RoomEvent::ProducerResumed {
                    participant_id: participant_id.clone(),
                    producer_id,
                },
            )
        };
        self.broadcast(Some(&participant_id), &event);
        self.publish(relayed).await;
    }

    async fn producer_removed(&mut self, participant_id: &str, producer_id: &str) {
        if let Some(participant) = self.participants.get_mut(participant_id) {
            participant
                .summary
                .producers
                .retain(|p| p.producer_id != producer_id);
        }
        self.sync_roster_entry(participant_id).await;

        self.broadcast(
            Some(participant_id),
            &ServerEvent::ProducerClosed {
                producer_id: producer_id.to_string(),
                participant_id: participant_id.to_string(),
            },
        );
        self.publish(RoomEvent::ProducerClosed {
            participant_id: participant_id.to_string(),
            producer_id: producer_id.to_string(),
        })
        .await;
    }

    /// Tell each consumer owner that its consumer closed. Owners on other
    /// replicas hear about it through the event channel.
    async fn notify_closed_consumers(&mut self, closed: Vec<ClosedConsumer>) {
        if closed.is_empty() {
            return;
        }

        let mut remote = Vec::new();
        for consumer in closed {
            if !self.deliver_consumer_closed(&consumer) {
                remote.push(consumer);
            }
        }

        if !remote.is_empty() {
            self.publish(RoomEvent::ConsumersClosed { closed: remote }).await;
        }
    }

    /// Returns `false` if the owner is not a local participant.
    fn deliver_consumer_closed(&mut self, consumer: &ClosedConsumer) -> bool {
        let Some(owner) = self.participants.get_mut(&consumer.participant_id) else {
            return false;
        };
        owner.consumers.remove(&consumer.consumer_id);
        owner.sink.push(ServerEvent::ConsumerClosed {
            consumer_id: consumer.consumer_id.clone(),
            producer_id: consumer.producer_id.clone(),
        });
        true
    }

    async fn sync_roster_entry(&self, participant_id: &str) {
        let Some(participant) = self.participants.get(participant_id) else {
            return;
        };
        if let Err(e) = self
            .services
            .coordinator
            .roster_upsert(&self.room_id, &participant.summary)
            .await
        {
            warn!(
                target: "sfu.directory.room",
                room_id = %self.room_id,
                participant_id = %participant_id,
                error = %e,
                "Failed to update roster entry"
            );
        }
    }

    // ------------------------------------------------------------------
    // Fan-out
    // ------------------------------------------------------------------

    /// Push `event` to every local participant except `except`.
    fn broadcast(&self, except: Option<&str>, event: &ServerEvent) {
        for (participant_id, participant) in &self.participants {
            if Some(participant_id.as_str()) == except {
                continue;
            }
            participant.sink.push(event.clone());
        }
    }

    /// Publish `event` to the other replicas holding this room.
    async fn publish(&self, event: RoomEvent) {
        let envelope = RelayEnvelope {
            origin: self.services.node_id.clone(),
            event,
        };
        let payload = match serde_json::to_string(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(target: "sfu.directory.room", room_id = %self.room_id, error = %e, "Failed to encode room event");
                return;
            }
        };
        if let Err(e) = self
            .services
            .coordinator
            .publish_room_event(&self.room_id, &payload)
            .await
        {
            warn!(target: "sfu.directory.room", room_id = %self.room_id, error = %e, "Failed to publish room event");
        }
    }

    /// Apply an event published by another replica. Returns whether it could
    /// have emptied the room.
    async fn apply_relayed(&mut self, event: RoomEvent) -> bool {
        match event {
            RoomEvent::ParticipantJoined { participant } => {
                self.broadcast(None, &ServerEvent::ParticipantJoined { participant });
            }
            RoomEvent::ParticipantLeft { participant_id } => {
                self.broadcast(None, &ServerEvent::ParticipantLeft { participant_id });
            }
            RoomEvent::NewProducer {
                participant_id,
                producer,
            } => {
                self.broadcast(
                    None,
                    &ServerEvent::NewProducer {
                        producer_id: producer.producer_id,
                        participant_id,
                        kind: producer.kind,
                        source: producer.source,
                        app_data: producer.app_data,
                    },
                );
            }
            RoomEvent::ProducerPaused {
                participant_id,
                producer_id,
            } => {
                self.broadcast(
                    None,
                    &ServerEvent::ProducerPaused {
                        producer_id,
                        participant_id,
                    },
                );
            }
            RoomEvent::ProducerResumed {
                participant_id,
                producer_id,
            } => {
                self.broadcast(
                    None,
                    &ServerEvent::ProducerResumed {
                        producer_id,
                        participant_id,
                    },
                );
            }
            RoomEvent::ProducerClosed {
                participant_id,
                producer_id,
            } => {
                self.broadcast(
                    None,
                    &ServerEvent::ProducerClosed {
                        producer_id,
                        participant_id,
                    },
                );
            }
            RoomEvent::ConsumersClosed { closed } => {
                for consumer in &closed {
                    self.deliver_consumer_closed(consumer);
                }
            }
            RoomEvent::SessionEnded { reason } => {
                self.end_session(&reason).await;
                return true;
            }
        }
        false
    }

    /// Stop accepting messages and answer whatever is still queued.
    fn close_mailbox(&mut self) {
        self.receiver.close();
        while let Ok(message) = self.receiver.try_recv() {
            let closed = SfuError::RoomClosed(self.room_id.clone());
            match message {
                RoomMessage::Join { respond_to, .. } => {
                    let _ = respond_to.send(Err(closed));
                }
                RoomMessage::Leave { respond_to, .. } => {
                    let _ = respond_to.send(Ok(()));
                }
                RoomMessage::Media { respond_to, .. } => {
                    let _ = respond_to.send(Err(SfuError::NotInRoom));
                }
                RoomMessage::GetState { respond_to } => {
                    let _ = respond_to.send(self.state());
                }
                RoomMessage::Relay { .. } | RoomMessage::EndSession { .. } => {}
            }
        }
    }
}

fn node_ref(placement: &Placement) -> NodeRef {
    NodeRef {
        node_id: placement.node_id.clone(),
        context_id: placement.context_id.clone(),
    }
}

/// `{userId}-{unixMillis}-{suffix}`; one per connection joining a room.
fn new_participant_id(user_id: &str) -> String {
    let (suffix, ..) = uuid::Uuid::new_v4().as_fields();
    format!(
        "{user_id}-{}-{suffix:08x}",
        chrono::Utc::now().timestamp_millis()
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::messages::{ConnectionMessage, Outbound};
    use crate::cluster::{CoordinationStore, MemoryStore, StoreError, StoreMessage};
    use crate::engine::{LoopbackEngine, MediaEngine, MediaEnginePool, PoolConfig};
    use crate::routing::remote::DEFAULT_CALL_TIMEOUT;
    use crate::routing::RoutingContextManager;
    use common::secret::SecretString;
    use common::types::{MediaKind, Role, TransportDirection};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Memory store whose roster writes and reads can be switched to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_roster_writes: AtomicBool,
        fail_roster_reads: AtomicBool,
    }

    impl FlakyStore {
        fn check(flag: &AtomicBool) -> Result<(), StoreError> {
            if flag.load(Ordering::SeqCst) {
                return Err(StoreError::Connection("store unavailable".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl CoordinationStore for FlakyStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
            self.inner.set(key, value).await
        }

        async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
            self.inner.set_with_ttl(key, value, ttl).await
        }

        async fn set_if_absent_counted(
            &self,
            key: &str,
            value: &str,
            counter: &str,
            delta: i64,
        ) -> Result<bool, StoreError> {
            self.inner.set_if_absent_counted(key, value, counter, delta).await
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.inner.delete(key).await
        }

        async fn delete_if_equals_counted(
            &self,
            key: &str,
            expected: &str,
            counter: &str,
            delta: i64,
        ) -> Result<bool, StoreError> {
            self.inner
                .delete_if_equals_counted(key, expected, counter, delta)
                .await
        }

        async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
            self.inner.set_add(key, member).await
        }

        async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
            self.inner.set_remove(key, member).await
        }

        async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
            self.inner.set_members(key).await
        }

        async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
            Self::check(&self.fail_roster_writes)?;
            self.inner.hash_set(key, field, value).await
        }

        async fn hash_remove(&self, key: &str, field: &str) -> Result<usize, StoreError> {
            Self::check(&self.fail_roster_writes)?;
            self.inner.hash_remove(key, field).await
        }

        async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
            Self::check(&self.fail_roster_reads)?;
            self.inner.hash_get_all(key).await
        }

        async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
            self.inner.publish(channel, payload).await
        }

        async fn subscribe_pattern(
            &self,
            pattern: &str,
        ) -> Result<mpsc::Receiver<StoreMessage>, StoreError> {
            self.inner.subscribe_pattern(pattern).await
        }

        async fn ping(&self) -> Result<(), StoreError> {
            self.inner.ping().await
        }
    }

    struct Fixture {
        services: RoomServices,
        manager: Arc<RoutingContextManager>,
        token: CancellationToken,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.token.cancel();
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(Arc::new(MemoryStore::new())).await
    }

    async fn fixture_with(store: Arc<dyn CoordinationStore>) -> Fixture {
        let token = CancellationToken::new();
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
        let manager = Arc::new(RoutingContextManager::new(pool));
        let coordinator = ClusterCoordinator::new(
            store,
            Duration::from_secs(15),
            Duration::from_secs(3),
        );
        coordinator
            .register("node-a", "http://127.0.0.1:1", 100)
            .await
            .unwrap();
        let registry = Arc::new(RouterRegistry::new(
            "node-a",
            Arc::clone(&manager),
            coordinator.clone(),
            SecretString::from("secret".to_string()),
            DEFAULT_CALL_TIMEOUT,
        ));

        Fixture {
            services: RoomServices {
                node_id: "node-a".to_string(),
                coordinator,
                registry,
                metrics: ActorMetrics::new(),
                reconcile_interval: Duration::from_secs(60),
            },
            manager,
            token,
        }
    }

    struct Client {
        outbound: mpsc::Receiver<Outbound>,
        control: mpsc::Receiver<ConnectionMessage>,
    }

    impl Client {
        fn events(&mut self) -> Vec<ServerEvent> {
            let mut events = Vec::new();
            while let Ok(frame) = self.outbound.try_recv() {
                if let Outbound::Event { event, .. } = frame {
                    events.push(event);
                }
            }
            events
        }
    }

    fn join_request(user_id: &str, role: Role) -> (JoinRequest, Client) {
        let (outbound, outbound_rx) = mpsc::channel(64);
        let (control, control_rx) = mpsc::channel(8);
        let sink = ClientSink::new(
            format!("conn-{user_id}"),
            outbound,
            control,
            CancellationToken::new(),
        );
        (
            JoinRequest {
                user_id: user_id.to_string(),
                display_name: user_id.to_uppercase(),
                role,
                capabilities: EngineBlob::empty(),
                sink,
            },
            Client {
                outbound: outbound_rx,
                control: control_rx,
            },
        )
    }

    fn vp8() -> EngineBlob {
        EngineBlob(json!({"codecs": [{"mimeType": "video/VP8"}]}))
    }

    #[tokio::test]
    async fn test_join_allocates_and_returns_roster_without_self() {
        let fx = fixture().await;
        let (room, _task) =
            RoomActor::spawn("r1".to_string(), fx.services.clone(), CancellationToken::new());

        let (req_a, mut a) = join_request("alice", Role::Host);
        let joined_a = room.join(req_a).await.unwrap();
        let (req_b, _b) = join_request("bob", Role::Viewer);
        let joined_b = room.join(req_b).await.unwrap();

        match joined_b.joined {
            ServerEvent::RoomJoined {
                participants,
                node_ref,
                ..
            } => {
                assert_eq!(participants.len(), 1);
                assert_eq!(participants.first().unwrap().participant_id, joined_a.participant_id);
                assert_eq!(node_ref.node_id, "node-a");
            }
            other => unreachable!("unexpected event: {other:?}"),
        }
        assert!(joined_b.participant_id.starts_with("bob-"));
        assert!(fx.manager.has_context("r1").await);

        let events = a.events();
        assert!(matches!(
            events.first(),
            Some(ServerEvent::ParticipantJoined { participant }) if participant.user_id == "bob"
        ));
    }

    #[tokio::test]
    async fn test_viewer_cannot_produce() {
        let fx = fixture().await;
        let (room, _task) =
            RoomActor::spawn("r1".to_string(), fx.services.clone(), CancellationToken::new());
        let (req, _client) = join_request("vic", Role::Viewer);
        let joined = room.join(req).await.unwrap();

        let err = room
            .media(
                &joined.participant_id,
                MediaRequest::Produce {
                    transport_id: "t".to_string(),
                    kind: MediaKind::Video,
                    media_params: vp8(),
                    source: None,
                    app_data: EngineBlob::empty(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::Authorization(_)));
    }

    #[tokio::test]
    async fn test_produce_notifies_peers_and_close_cascades_to_consumers() {
        let fx = fixture().await;
        let (room, _task) =
            RoomActor::spawn("r1".to_string(), fx.services.clone(), CancellationToken::new());

        let (req_a, mut a) = join_request("alice", Role::Host);
        let host = room.join(req_a).await.unwrap().participant_id;
        let (req_b, mut b) = join_request("bob", Role::Viewer);
        let viewer = room.join(req_b).await.unwrap().participant_id;

        let send = room
            .media(
                &host,
                MediaRequest::CreateTransport {
                    direction: TransportDirection::Send,
                    extra_capabilities: EngineBlob::empty(),
                },
            )
            .await
            .unwrap();
        let ServerEvent::TransportCreated { transport_id, .. } = send else {
            unreachable!("expected transport-created");
        };
        let produced = room
            .media(
                &host,
                MediaRequest::Produce {
                    transport_id,
                    kind: MediaKind::Video,
                    media_params: vp8(),
                    source: None,
                    app_data: EngineBlob(json!({"label": "cam"})),
                },
            )
            .await
            .unwrap();
        let ServerEvent::Produced { producer_id } = produced else {
            unreachable!("expected produced");
        };

        let new_producer = b.events().into_iter().find_map(|e| match e {
            ServerEvent::NewProducer {
                producer_id, source, ..
            } => Some((producer_id, source)),
            _ => None,
        });
        assert_eq!(
            new_producer,
            Some((producer_id.clone(), common::types::MediaSource::Camera))
        );

        room.media(
            &viewer,
            MediaRequest::CreateTransport {
                direction: TransportDirection::Recv,
                extra_capabilities: EngineBlob::empty(),
            },
        )
        .await
        .unwrap();
        let consumed = room
            .media(
                &viewer,
                MediaRequest::Consume {
                    producer_id: producer_id.clone(),
                    consumer_capabilities: vp8(),
                    transport_id: None,
                },
            )
            .await
            .unwrap();
        let ServerEvent::ConsumerCreated {
            consumer_id,
            paused,
            ..
        } = consumed
        else {
            unreachable!("expected consumer-created");
        };
        assert!(paused);

        room.media(&host, MediaRequest::CloseProducer { producer_id: producer_id.clone() })
            .await
            .unwrap();

        let events = b.events();
        assert!(events.contains(&ServerEvent::ProducerClosed {
            producer_id: producer_id.clone(),
            participant_id: host.clone(),
        }));
        assert!(events.contains(&ServerEvent::ConsumerClosed {
            consumer_id,
            producer_id,
        }));
        // The producer's owner gets its answer directly, not as a push.
        assert!(!a
            .events()
            .iter()
            .any(|e| matches!(e, ServerEvent::ProducerClosed { .. })));
    }

    #[tokio::test]
    async fn test_last_leave_releases_placement_and_stops_actor() {
        let fx = fixture().await;
        let (room, task) =
            RoomActor::spawn("r1".to_string(), fx.services.clone(), CancellationToken::new());

        let (req, _client) = join_request("alice", Role::Host);
        let joined = room.join(req).await.unwrap();
        assert!(fx.services.coordinator.placement("r1").await.unwrap().is_some());

        room.leave(&joined.participant_id).await.unwrap();
        task.await.unwrap();

        assert!(room.is_closed());
        assert!(fx.services.coordinator.placement("r1").await.unwrap().is_none());
        assert!(fx.services.coordinator.roster("r1").await.unwrap().is_empty());
        assert!(!fx.manager.has_context("r1").await);

        let err = room.get_state().await.unwrap_err();
        assert!(matches!(err, SfuError::RoomClosed(_)));
    }

    #[tokio::test]
    async fn test_failed_roster_removal_still_releases_placement() {
        let store = Arc::new(FlakyStore::default());
        let fx = fixture_with(Arc::clone(&store) as Arc<dyn CoordinationStore>).await;
        let (room, task) =
            RoomActor::spawn("r1".to_string(), fx.services.clone(), CancellationToken::new());

        let (req, _client) = join_request("alice", Role::Host);
        let joined = room.join(req).await.unwrap();

        store.fail_roster_writes.store(true, Ordering::SeqCst);
        room.leave(&joined.participant_id).await.unwrap();
        task.await.unwrap();

        assert!(fx.services.coordinator.placement("r1").await.unwrap().is_none());
        assert!(fx.services.coordinator.roster("r1").await.unwrap().is_empty());
        assert!(!fx.manager.has_context("r1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_roster_keeps_room_until_cleanup_succeeds() {
        let store = Arc::new(FlakyStore::default());
        let fx = fixture_with(Arc::clone(&store) as Arc<dyn CoordinationStore>).await;
        let mut services = fx.services.clone();
        services.reconcile_interval = Duration::from_secs(5);
        let (room, task) = RoomActor::spawn("r1".to_string(), services, CancellationToken::new());

        let (req, _client) = join_request("alice", Role::Host);
        let joined = room.join(req).await.unwrap();

        store.fail_roster_writes.store(true, Ordering::SeqCst);
        store.fail_roster_reads.store(true, Ordering::SeqCst);
        room.leave(&joined.participant_id).await.unwrap();

        let state = room.get_state().await.unwrap();
        assert!(state.participants.is_empty());
        assert!(state.context_id.is_some());
        assert!(fx.services.coordinator.placement("r1").await.unwrap().is_some());

        store.fail_roster_writes.store(false, Ordering::SeqCst);
        store.fail_roster_reads.store(false, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(6)).await;
        task.await.unwrap();

        assert!(fx.services.coordinator.placement("r1").await.unwrap().is_none());
        assert!(fx.services.coordinator.roster("r1").await.unwrap().is_empty());
        assert!(!fx.manager.has_context("r1").await);
    }

    #[tokio::test]
    async fn test_failed_join_releases_placement() {
        let store = Arc::new(FlakyStore::default());
        let fx = fixture_with(Arc::clone(&store) as Arc<dyn CoordinationStore>).await;
        let (room, task) =
            RoomActor::spawn("r1".to_string(), fx.services.clone(), CancellationToken::new());

        store.fail_roster_writes.store(true, Ordering::SeqCst);
        let (req, _client) = join_request("alice", Role::Host);
        let err = room.join(req).await.unwrap_err();
        assert!(matches!(err, SfuError::Coordination(_)));
        task.await.unwrap();

        assert!(fx.services.coordinator.placement("r1").await.unwrap().is_none());
        assert!(!fx.manager.has_context("r1").await);
        assert_eq!(
            fx.services
                .coordinator
                .node_statuses()
                .await
                .unwrap()
                .first()
                .map(|s| s.contexts),
            Some(0)
        );
    }

    #[tokio::test]
    async fn test_failed_join_keeps_room_with_other_members() {
        let store = Arc::new(FlakyStore::default());
        let fx = fixture_with(Arc::clone(&store) as Arc<dyn CoordinationStore>).await;
        let (room, _task) =
            RoomActor::spawn("r1".to_string(), fx.services.clone(), CancellationToken::new());

        let (req_a, _a) = join_request("alice", Role::Host);
        room.join(req_a).await.unwrap();

        store.fail_roster_writes.store(true, Ordering::SeqCst);
        let (req_b, _b) = join_request("bob", Role::Viewer);
        room.join(req_b).await.unwrap_err();

        assert_eq!(room.get_state().await.unwrap().participants.len(), 1);
        assert!(fx.services.coordinator.placement("r1").await.unwrap().is_some());
        assert!(fx.manager.has_context("r1").await);
    }

    #[tokio::test]
    async fn test_leave_is_idempotent_and_decrements_by_one() {
        let fx = fixture().await;
        let (room, _task) =
            RoomActor::spawn("r1".to_string(), fx.services.clone(), CancellationToken::new());

        let (req_a, _a) = join_request("alice", Role::Host);
        let alice = room.join(req_a).await.unwrap().participant_id;
        let (req_b, mut b) = join_request("bob", Role::Viewer);
        room.join(req_b).await.unwrap();

        room.leave(&alice).await.unwrap();
        room.leave(&alice).await.unwrap();

        assert_eq!(fx.services.coordinator.roster("r1").await.unwrap().len(), 1);
        assert_eq!(room.get_state().await.unwrap().participants.len(), 1);
        assert!(b.events().contains(&ServerEvent::ParticipantLeft {
            participant_id: alice
        }));
    }

    #[tokio::test]
    async fn test_end_session_notifies_connections() {
        let fx = fixture().await;
        let (room, task) =
            RoomActor::spawn("r1".to_string(), fx.services.clone(), CancellationToken::new());

        let (req, mut client) = join_request("alice", Role::Host);
        room.join(req).await.unwrap();
        room.end_session(REASON_WORKER_LOST).await.unwrap();
        task.await.unwrap();

        match client.control.try_recv().unwrap() {
            ConnectionMessage::SessionEnded { room_id, reason } => {
                assert_eq!(room_id, "r1");
                assert_eq!(reason, REASON_WORKER_LOST);
            }
            other => unreachable!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_ends_session_when_placement_disappears() {
        let fx = fixture().await;
        let mut services = fx.services.clone();
        services.reconcile_interval = Duration::from_secs(5);
        let (room, task) = RoomActor::spawn("r1".to_string(), services, CancellationToken::new());

        let (req, mut client) = join_request("alice", Role::Host);
        room.join(req).await.unwrap();
        fx.services.coordinator.release("r1").await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        task.await.unwrap();

        assert!(matches!(
            client.control.try_recv().unwrap(),
            ConnectionMessage::SessionEnded { .. }
        ));
    }

    #[tokio::test]
    async fn test_relayed_consumer_close_reaches_local_owner() {
        let fx = fixture().await;
        let (room, _task) =
            RoomActor::spawn("r1".to_string(), fx.services.clone(), CancellationToken::new());
        let (req, mut client) = join_request("bob", Role::Viewer);
        let bob = room.join(req).await.unwrap().participant_id;

        room.relay(RoomEvent::ConsumersClosed {
            closed: vec![ClosedConsumer {
                consumer_id: "c1".to_string(),
                producer_id: "p1".to_string(),
                participant_id: bob,
            }],
        })
        .await
        .unwrap();
        room.get_state().await.unwrap();

        assert!(client.events().contains(&ServerEvent::ConsumerClosed {
            consumer_id: "c1".to_string(),
            producer_id: "p1".to_string(),
        }));
    }

    #[tokio::test]
    async fn test_cancellation_cleans_up_local_participants() {
        let fx = fixture().await;
        let token = CancellationToken::new();
        let (room, task) = RoomActor::spawn("r1".to_string(), fx.services.clone(), token.clone());
        let (req, _client) = join_request("alice", Role::Host);
        room.join(req).await.unwrap();

        token.cancel();
        task.await.unwrap();

        assert!(fx.services.coordinator.placement("r1").await.unwrap().is_none());
        assert!(!fx.manager.has_context("r1").await);
    }

    #[test]
    fn test_participant_id_shape() {
        let id = new_participant_id("user-1");
        let parts: Vec<&str> = id.rsplitn(3, '-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts.first().unwrap().len(), 8);
        assert_eq!(parts.get(2), Some(&"user-1"));
        assert_ne!(new_participant_id("user-1"), id);
    }
}
