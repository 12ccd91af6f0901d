//! `SessionDirectory` - singleton supervisor for room actors.
//!
//! The directory is this replica's view of the rooms its connections are in:
//!
//! - One `RoomActor` per room with local participants, started on demand
//! - Relayed room events and session ends are forwarded to the room actor
//! - Monitors room actor health (panic detection via `JoinHandle`)
//!
//! # Graceful Shutdown
//!
//! On cancellation the directory stops starting rooms, gives connections
//! time to leave on their own, then cancels the rooms that remain.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::messages::{DirectoryMessage, DirectoryStatus, RoomEvent};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::room::{RoomActor, RoomActorHandle, RoomServices};
use crate::errors::SfuError;

/// Default channel buffer size for the directory mailbox.
const DIRECTORY_CHANNEL_BUFFER: usize = 1000;

/// How long shutdown waits for rooms to empty before cancelling them.
const ROOM_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// How often finished room actors are swept.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Handle to the `SessionDirectory`.
#[derive(Clone)]
pub struct SessionDirectoryHandle {
    sender: mpsc::Sender<DirectoryMessage>,
    cancel_token: CancellationToken,
}

impl SessionDirectoryHandle {
    /// Get the room actor for `room_id`, starting one if needed.
    ///
    /// # Errors
    ///
    /// `Draining` once shutdown has begun.
    pub async fn room(&self, room_id: &str) -> Result<RoomActorHandle, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(DirectoryMessage::Room {
                room_id: room_id.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Forward an event from another replica to the local room, if any.
    ///
    /// # Errors
    ///
    /// Returns `SfuError::Internal` if the directory is gone.
    pub async fn relay(&self, room_id: &str, event: RoomEvent) -> Result<(), SfuError> {
        self.sender
            .send(DirectoryMessage::Relay {
                room_id: room_id.to_string(),
                event,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))
    }

    /// End the session of a local room.
    ///
    /// # Errors
    ///
    /// Returns `SfuError::Internal` if the directory is gone.
    pub async fn end_session(&self, room_id: &str, reason: &str) -> Result<(), SfuError> {
        self.sender
            .send(DirectoryMessage::EndSession {
                room_id: room_id.to_string(),
                reason: reason.to_string(),
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))
    }

    /// # Errors
    ///
    /// Returns `SfuError::Internal` if the directory is gone.
    pub async fn get_status(&self) -> Result<DirectoryStatus, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(DirectoryMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Internal state for a managed room.
struct ManagedRoom {
    handle: RoomActorHandle,
    task_handle: JoinHandle<()>,
}

/// The `SessionDirectory` implementation.
pub struct SessionDirectory {
    node_id: String,
    receiver: mpsc::Receiver<DirectoryMessage>,
    cancel_token: CancellationToken,
    rooms: HashMap<String, ManagedRoom>,
    accepting_new: bool,
    services: RoomServices,
    mailbox: MailboxMonitor,
}

impl SessionDirectory {
    /// Spawn the directory.
    ///
    /// Room actors get their own tokens rather than children of
    /// `cancel_token`, so connections can still leave their rooms while the
    /// node shuts down.
    #[must_use]
    pub fn spawn(
        services: RoomServices,
        cancel_token: CancellationToken,
    ) -> (SessionDirectoryHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(DIRECTORY_CHANNEL_BUFFER);

        let actor = Self {
            node_id: services.node_id.clone(),
            receiver,
            cancel_token: cancel_token.clone(),
            rooms: HashMap::new(),
            accepting_new: true,
            mailbox: MailboxMonitor::new(ActorType::Directory, &services.node_id),
            services,
        };

        let task_handle = tokio::spawn(actor.run());

        (
            SessionDirectoryHandle {
                sender,
                cancel_token,
            },
            task_handle,
        )
    }

    fn metrics(&self) -> &Arc<ActorMetrics> {
        &self.services.metrics
    }

    #[instrument(skip_all, name = "sfu.directory", fields(node_id = %self.node_id))]
    async fn run(mut self) {
        info!(
            target: "sfu.directory",
            node_id = %self.node_id,
            "SessionDirectory started"
        );

        let mut health = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        health.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sfu.directory",
                        node_id = %self.node_id,
                        "SessionDirectory received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                _ = health.tick() => {
                    self.check_room_health().await;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.handle_message(message).await;
                            self.mailbox.record_processed(self.receiver.len());
                            self.metrics().record_message_processed();
                        }
                        None => {
                            info!(
                                target: "sfu.directory",
                                node_id = %self.node_id,
                                "SessionDirectory channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "sfu.directory",
            node_id = %self.node_id,
            rooms_remaining = self.rooms.len(),
            messages_processed = self.mailbox.messages_processed(),
            "SessionDirectory stopped"
        );
    }

    async fn handle_message(&mut self, message: DirectoryMessage) {
        match message {
            DirectoryMessage::Room {
                room_id,
                respond_to,
            } => {
                let result = self.room(room_id).await;
                let _ = respond_to.send(result);
            }

            DirectoryMessage::Relay { room_id, event } => {
                if let Some(managed) = self.live_room(&room_id) {
                    let handle = managed.handle.clone();
                    if let Err(e) = handle.relay(event).await {
                        debug!(target: "sfu.directory", room_id = %room_id, error = %e, "Relay target closed");
                    }
                }
            }

            DirectoryMessage::EndSession { room_id, reason } => {
                if let Some(managed) = self.live_room(&room_id) {
                    let handle = managed.handle.clone();
                    if let Err(e) = handle.end_session(&reason).await {
                        debug!(target: "sfu.directory", room_id = %room_id, error = %e, "Room already closed");
                    }
                }
            }

            DirectoryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }
        }
    }

    fn live_room(&self, room_id: &str) -> Option<&ManagedRoom> {
        self.rooms.get(room_id).filter(|m| !m.handle.is_closed())
    }

    async fn room(&mut self, room_id: String) -> Result<RoomActorHandle, SfuError> {
        if let Some(managed) = self.live_room(&room_id) {
            return Ok(managed.handle.clone());
        }
        if !self.accepting_new {
            return Err(SfuError::Draining);
        }

        // A closed actor may still be finishing; reap it before replacing it.
        if let Some(stale) = self.rooms.remove(&room_id) {
            self.reap(&room_id, stale).await;
        }

        let (handle, task_handle) =
            RoomActor::spawn(room_id.clone(), self.services.clone(), CancellationToken::new());
        self.rooms.insert(
            room_id.clone(),
            ManagedRoom {
                handle: handle.clone(),
                task_handle,
            },
        );
        self.metrics().room_created();

        debug!(
            target: "sfu.directory",
            node_id = %self.node_id,
            room_id = %room_id,
            total_rooms = self.rooms.len(),
            "Room actor created"
        );

        Ok(handle)
    }

    fn get_status(&self) -> DirectoryStatus {
        DirectoryStatus {
            room_count: self.rooms.len(),
            participant_count: self.metrics().participant_count(),
            connection_count: self.metrics().connection_count(),
            is_draining: !self.accepting_new,
            mailbox_depth: self.receiver.len(),
        }
    }

    async fn graceful_shutdown(&mut self) {
        info!(
            target: "sfu.directory",
            node_id = %self.node_id,
            room_count = self.rooms.len(),
            "Performing graceful shutdown"
        );

        self.accepting_new = false;

        // Connections are cancelled alongside us and leave their rooms; rooms
        // exit once empty.
        let deadline = tokio::time::Instant::now() + ROOM_DRAIN_TIMEOUT;
        for (room_id, managed) in self.rooms.drain() {
            let ManagedRoom {
                handle,
                mut task_handle,
            } = managed;

            let finished = tokio::time::timeout_at(deadline, &mut task_handle).await;
            if finished.is_ok() {
                self.services.metrics.room_removed();
                continue;
            }

            debug!(
                target: "sfu.directory",
                node_id = %self.node_id,
                room_id = %room_id,
                "Cancelling room actor"
            );
            handle.cancel();
            match tokio::time::timeout(Duration::from_secs(5), task_handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        target: "sfu.directory",
                        room_id = %room_id,
                        error = ?e,
                        "Room actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sfu.directory",
                        room_id = %room_id,
                        "Room actor shutdown timed out"
                    );
                }
            }
            self.services.metrics.room_removed();
        }

        info!(
            target: "sfu.directory",
            node_id = %self.node_id,
            "Graceful shutdown complete"
        );
    }

    /// Remove room actors whose task has finished.
    async fn check_room_health(&mut self) {
        let finished: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(room_id, _)| room_id.clone())
            .collect();

        for room_id in finished {
            if let Some(managed) = self.rooms.remove(&room_id) {
                self.reap(&room_id, managed).await;
            }
        }
    }

    /// Await a room actor that has stopped accepting messages.
    async fn reap(&self, room_id: &str, managed: ManagedRoom) {
        match tokio::time::timeout(Duration::from_secs(5), managed.task_handle).await {
            Ok(Ok(())) => {
                debug!(
                    target: "sfu.directory",
                    node_id = %self.node_id,
                    room_id = %room_id,
                    "Room actor exited cleanly"
                );
            }
            Ok(Err(join_error)) => {
                if join_error.is_panic() {
                    error!(
                        target: "sfu.directory",
                        node_id = %self.node_id,
                        room_id = %room_id,
                        error = ?join_error,
                        "Room actor panicked - triggering investigation"
                    );
                    self.metrics().record_panic(ActorType::Room);
                }
            }
            Err(_) => {
                warn!(
                    target: "sfu.directory",
                    room_id = %room_id,
                    "Room actor cleanup timed out"
                );
            }
        }
        self.metrics().room_removed();
    }
}
