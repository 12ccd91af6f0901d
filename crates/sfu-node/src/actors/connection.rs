//! `ConnectionActor` - one per client socket.
//!
//! Each `ConnectionActor`:
//! - Owns the protocol state machine for exactly one connection
//!   (`Unauthenticated` -> `Authenticated` -> `InRoom`)
//! - Processes inbound frames strictly in arrival order
//! - Answers every request with a response carrying the request's `id`
//! - Probes the client and terminates it once it goes silent
//!
//! The socket itself lives in the gateway. Frames arrive through the
//! actor's mailbox and responses leave through the `Outbound` queue, so the
//! actor is driven the same way by a WebSocket and by tests.
//!
//! # Lifecycle
//!
//! 1. Spawned by the gateway once the connection passed admission
//! 2. Runs until the socket closes, the client goes idle, or the token is
//!    cancelled (shutdown or slow consumer)
//! 3. Cleanup runs exactly once on exit: leave the room, then close the socket

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::secret::{ExposeSecret, SecretString};
use common::types::{EngineBlob, Role};
use signaling_protocol::{decode_request, ClientRequest, CorrelationId, ServerEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::directory::SessionDirectoryHandle;
use super::messages::{ClientSink, ConnectionMessage, JoinRequest, MediaRequest, Outbound};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::room::RoomActorHandle;
use crate::admission::{Admission, AdmissionController};
use crate::auth::{AuthenticatedUser, Authenticator};
use crate::errors::SfuError;
use crate::observability::metrics;

/// Default channel buffer size for the connection mailbox.
const CONNECTION_CHANNEL_BUFFER: usize = 200;

/// How long cleanup waits to queue the final close frame.
const CLOSE_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-connection protocol limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub max_message_bytes: usize,
    pub probe_interval: Duration,
    pub idle_timeout: Duration,
}

/// Node-wide collaborators shared by every connection actor.
#[derive(Clone)]
pub struct ConnectionContext {
    pub directory: SessionDirectoryHandle,
    pub authenticator: Arc<dyn Authenticator>,
    pub admission: Arc<AdmissionController>,
    pub metrics: Arc<ActorMetrics>,
    pub settings: ConnectionSettings,
}

/// Handle to a `ConnectionActor`, held by the socket reader.
#[derive(Clone, Debug)]
pub struct ConnectionActorHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    connection_id: String,
}

impl ConnectionActorHandle {
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Queue an inbound text frame.
    ///
    /// # Errors
    ///
    /// Returns `SfuError::Internal` if the actor has exited.
    pub async fn frame(&self, text: String) -> Result<(), SfuError> {
        self.sender
            .send(ConnectionMessage::Frame(text))
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))
    }

    /// Record a sign of life (pong). Dropped when the mailbox is busy, since
    /// queued frames already count as activity.
    pub fn activity(&self) {
        let _ = self.sender.try_send(ConnectionMessage::Activity);
    }

    /// Report that the socket closed.
    pub async fn disconnected(&self) {
        if self.sender.send(ConnectionMessage::Disconnected).await.is_err() {
            debug!(
                target: "sfu.gateway.connection",
                connection_id = %self.connection_id,
                "Connection actor already stopped"
            );
        }
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The room this connection joined.
struct Membership {
    room: RoomActorHandle,
    participant_id: String,
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    connection_id: String,
    receiver: mpsc::Receiver<ConnectionMessage>,
    /// Own mailbox, handed to rooms as the control channel of the sink.
    control: mpsc::WeakSender<ConnectionMessage>,
    outbound: mpsc::Sender<Outbound>,
    cancel_token: CancellationToken,
    context: ConnectionContext,
    mailbox: MailboxMonitor,
    user: Option<AuthenticatedUser>,
    organization_id: Option<String>,
    membership: Option<Membership>,
    last_room_id: Option<String>,
    next_id: CorrelationId,
    last_activity: Instant,
}

impl ConnectionActor {
    /// Spawn a new connection actor writing to `outbound`.
    ///
    /// Returns a handle and the task join handle.
    #[must_use]
    pub fn spawn(
        connection_id: String,
        context: ConnectionContext,
        outbound: mpsc::Sender<Outbound>,
        cancel_token: CancellationToken,
    ) -> (ConnectionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_CHANNEL_BUFFER);

        context.metrics.connection_created();

        let actor = Self {
            connection_id: connection_id.clone(),
            receiver,
            control: sender.downgrade(),
            outbound,
            cancel_token: cancel_token.clone(),
            mailbox: MailboxMonitor::new(ActorType::Connection, &connection_id),
            context,
            user: None,
            organization_id: None,
            membership: None,
            last_room_id: None,
            next_id: 1,
            last_activity: Instant::now(),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionActorHandle {
            sender,
            cancel_token,
            connection_id,
        };

        (handle, task_handle)
    }

    #[instrument(
        skip_all,
        name = "sfu.gateway.connection",
        fields(connection_id = %self.connection_id)
    )]
    async fn run(mut self) {
        debug!(
            target: "sfu.gateway.connection",
            connection_id = %self.connection_id,
            "ConnectionActor started"
        );

        let period = self.context.settings.probe_interval;
        let mut probe = interval_at(Instant::now() + period, period);
        probe.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let reason = loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "sfu.gateway.connection",
                        connection_id = %self.connection_id,
                        "ConnectionActor received cancellation signal"
                    );
                    break "cancelled";
                }

                _ = probe.tick() => {
                    if self.last_activity.elapsed() > self.context.settings.idle_timeout {
                        info!(
                            target: "sfu.gateway.connection",
                            connection_id = %self.connection_id,
                            idle_ms = u64::try_from(self.last_activity.elapsed().as_millis()).unwrap_or(u64::MAX),
                            "Connection idle, terminating"
                        );
                        break "idle timeout";
                    }
                    if self.outbound.try_send(Outbound::Probe).is_err() {
                        self.mailbox.record_drop();
                    }
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(ConnectionMessage::Disconnected) | None => {
                            break "disconnected";
                        }
                        Some(message) => {
                            self.handle_message(message).await;
                            self.mailbox.record_processed(self.receiver.len());
                            self.context.metrics.record_message_processed();
                        }
                    }
                }
            }
        };

        self.cleanup(reason).await;

        info!(
            target: "sfu.gateway.connection",
            connection_id = %self.connection_id,
            reason,
            messages_processed = self.mailbox.messages_processed(),
            "ConnectionActor stopped"
        );
    }

    async fn handle_message(&mut self, message: ConnectionMessage) {
        match message {
            ConnectionMessage::Frame(text) => {
                self.last_activity = Instant::now();
                self.handle_frame(&text).await;
            }
            ConnectionMessage::Activity => {
                self.last_activity = Instant::now();
            }
            ConnectionMessage::SessionEnded { room_id, reason } => {
                self.handle_session_ended(room_id, reason).await;
            }
            // Handled by the run loop.
            ConnectionMessage::Disconnected => {}
        }
    }

    async fn handle_frame(&mut self, text: &str) {
        let started = Instant::now();

        let envelope = match decode_request(text, self.context.settings.max_message_bytes) {
            Ok(envelope) => envelope,
            Err(rejected) => {
                debug!(
                    target: "sfu.gateway.connection",
                    connection_id = %self.connection_id,
                    error = %rejected.error,
                    "Rejected inbound frame"
                );
                let id = rejected.id.unwrap_or_else(|| self.assign_id());
                let error = SfuError::Protocol(rejected.error);
                self.respond(id, error.to_event()).await;
                metrics::record_message_processed("invalid", false, started.elapsed());
                return;
            }
        };

        let id = envelope.id.unwrap_or_else(|| self.assign_id());
        let event_name = envelope.request.event_name();

        let user_key = self.user.as_ref().map(|u| u.user_id.clone());
        if let Admission::Deny { retry_after } = self
            .context
            .admission
            .check_message(&self.connection_id, user_key.as_deref())
        {
            self.respond(id, SfuError::RateLimited { retry_after }.to_event())
                .await;
            metrics::record_message_processed(event_name, false, started.elapsed());
            return;
        }

        let result = self.dispatch(envelope.request).await;
        let success = result.is_ok();
        let event = match result {
            Ok(event) => event,
            Err(e) => {
                debug!(
                    target: "sfu.gateway.connection",
                    connection_id = %self.connection_id,
                    event = event_name,
                    error = %e,
                    "Request failed"
                );
                e.to_event()
            }
        };

        self.respond(id, event).await;
        metrics::record_message_processed(event_name, success, started.elapsed());
    }

    async fn dispatch(&mut self, request: ClientRequest) -> Result<ServerEvent, SfuError> {
        match request {
            ClientRequest::Heartbeat {} => Ok(ServerEvent::HeartbeatAck {
                server_time: Utc::now().timestamp_millis(),
            }),

            ClientRequest::Authenticate {
                token,
                organization_id,
            } => self.authenticate(&token, organization_id).await,

            _ if self.user.is_none() => Err(SfuError::AuthenticationRequired),

            ClientRequest::JoinRoom {
                room_id,
                role,
                display_name,
                capabilities,
            } => self.join_room(room_id, role, display_name, capabilities).await,

            ClientRequest::LeaveRoom {} => Ok(self.leave_room().await),

            request => {
                let media = MediaRequest::try_from(request).map_err(|other| {
                    SfuError::InvalidState(format!("{} is not a room operation", other.event_name()))
                })?;
                self.media(media).await
            }
        }
    }

    #[instrument(skip_all, fields(connection_id = %self.connection_id, organization_id = %organization_id))]
    async fn authenticate(
        &mut self,
        token: &SecretString,
        organization_id: String,
    ) -> Result<ServerEvent, SfuError> {
        if self.user.is_some() {
            return Err(SfuError::InvalidState(
                "Connection is already authenticated".to_string(),
            ));
        }

        let user = self
            .context
            .authenticator
            .verify_token(token.expose_secret())
            .await?;

        if !self
            .context
            .authenticator
            .verify_membership(&user, &organization_id)
            .await?
        {
            return Err(SfuError::Authorization(
                "Not a member of this organization".to_string(),
            ));
        }

        info!(
            target: "sfu.gateway.connection",
            connection_id = %self.connection_id,
            user_id = %user.user_id,
            "Connection authenticated"
        );

        let event = ServerEvent::Authenticated {
            user_id: user.user_id.clone(),
            organization_id: organization_id.clone(),
        };
        self.user = Some(user);
        self.organization_id = Some(organization_id);
        Ok(event)
    }

    #[instrument(skip_all, fields(connection_id = %self.connection_id, room_id = %room_id, role = %role))]
    async fn join_room(
        &mut self,
        room_id: String,
        role: Role,
        display_name: String,
        capabilities: EngineBlob,
    ) -> Result<ServerEvent, SfuError> {
        if let Some(membership) = &self.membership {
            return Err(SfuError::InvalidState(format!(
                "Already in room {}",
                membership.room.room_id()
            )));
        }
        let user = self.user.clone().ok_or(SfuError::AuthenticationRequired)?;

        if let Some(permission) = role.required_permission() {
            if !user.has_permission(permission) {
                return Err(SfuError::Authorization(format!(
                    "Joining as {role} requires {permission}"
                )));
            }
        }

        let display_name = if display_name.trim().is_empty() {
            user.display_name.clone().unwrap_or_else(|| user.user_id.clone())
        } else {
            display_name
        };

        // A room actor may exit between lookup and join; one retry picks up
        // its replacement.
        let mut attempts = 0;
        let (room, outcome) = loop {
            attempts += 1;
            let room = self.context.directory.room(&room_id).await?;
            let request = JoinRequest {
                user_id: user.user_id.clone(),
                display_name: display_name.clone(),
                role,
                capabilities: capabilities.clone(),
                sink: self.sink()?,
            };
            match room.join(request).await {
                Ok(outcome) => break (room, outcome),
                Err(SfuError::RoomClosed(_)) if attempts < 2 => continue,
                Err(e) => return Err(e),
            }
        };

        info!(
            target: "sfu.gateway.connection",
            connection_id = %self.connection_id,
            room_id = %room_id,
            participant_id = %outcome.participant_id,
            "Joined room"
        );

        self.membership = Some(Membership {
            room,
            participant_id: outcome.participant_id,
        });
        self.last_room_id = Some(room_id);
        Ok(outcome.joined)
    }

    /// Leave the current room. Leaving when not in a room succeeds.
    async fn leave_room(&mut self) -> ServerEvent {
        if let Some(membership) = self.membership.take() {
            self.leave(membership).await;
        }
        ServerEvent::RoomLeft {
            room_id: self.last_room_id.clone().unwrap_or_default(),
        }
    }

    async fn media(&mut self, request: MediaRequest) -> Result<ServerEvent, SfuError> {
        let membership = self.membership.as_ref().ok_or(SfuError::NotInRoom)?;
        let result = membership
            .room
            .media(&membership.participant_id, request)
            .await;

        // The room dropped us without a session-ended notice reaching us yet.
        if matches!(result, Err(SfuError::NotInRoom | SfuError::RoomClosed(_))) {
            self.membership = None;
        }
        result
    }

    async fn handle_session_ended(&mut self, room_id: String, reason: String) {
        let in_room = self
            .membership
            .as_ref()
            .is_some_and(|m| m.room.room_id() == room_id);
        if !in_room {
            return;
        }

        info!(
            target: "sfu.gateway.connection",
            connection_id = %self.connection_id,
            room_id = %room_id,
            reason = %reason,
            "Room session ended"
        );
        self.membership = None;
        self.push(ServerEvent::SessionEnded { room_id, reason }).await;
    }

    async fn leave(&self, membership: Membership) {
        if let Err(e) = membership.room.leave(&membership.participant_id).await {
            // A closed room already removed every participant.
            debug!(
                target: "sfu.gateway.connection",
                connection_id = %self.connection_id,
                room_id = %membership.room.room_id(),
                error = %e,
                "Leave skipped"
            );
        }
    }

    async fn cleanup(&mut self, reason: &str) {
        if let Some(membership) = self.membership.take() {
            self.leave(membership).await;
        }
        self.context.admission.reset(&self.connection_id);
        self.context.metrics.connection_closed();

        let close = Outbound::Close {
            reason: reason.to_string(),
        };
        if tokio::time::timeout(CLOSE_SEND_TIMEOUT, self.outbound.send(close))
            .await
            .is_err()
        {
            warn!(
                target: "sfu.gateway.connection",
                connection_id = %self.connection_id,
                "Timed out queueing close frame"
            );
        }
    }

    fn sink(&self) -> Result<ClientSink, SfuError> {
        let control = self
            .control
            .upgrade()
            .ok_or_else(|| SfuError::Internal("connection mailbox closed".to_string()))?;
        Ok(ClientSink::new(
            self.connection_id.clone(),
            self.outbound.clone(),
            control,
            self.cancel_token.clone(),
        ))
    }

    fn assign_id(&mut self) -> CorrelationId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    async fn respond(&self, id: CorrelationId, event: ServerEvent) {
        self.send(Outbound::Event {
            id: Some(id),
            event,
        })
        .await;
    }

    async fn push(&self, event: ServerEvent) {
        self.send(Outbound::Event { id: None, event }).await;
    }

    async fn send(&self, frame: Outbound) {
        if self.outbound.send(frame).await.is_err() {
            debug!(
                target: "sfu.gateway.connection",
                connection_id = %self.connection_id,
                "Outbound queue closed"
            );
        }
    }
}
