//! Actor metrics and mailbox monitoring.
//!
//! Mailbox backlog thresholds (messages queued behind the one being handled):
//!
//! | Actor Type | Normal | Warning | Critical |
//! |------------|--------|---------|----------|
//! | Directory  | < 100  | 100-500 | > 500    |
//! | Room       | < 100  | 100-500 | > 500    |
//! | Connection | < 50   | 50-200  | > 200    |
//!
//! Prometheus gauges are updated alongside the in-process counters so
//! `/status` and `/metrics` never disagree.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::observability::metrics;

/// Mailbox depth thresholds for directory and room actors.
pub const ROOM_MAILBOX_NORMAL: usize = 100;
pub const ROOM_MAILBOX_WARNING: usize = 500;

/// Mailbox depth thresholds for connection actors.
pub const CONNECTION_MAILBOX_NORMAL: usize = 50;
pub const CONNECTION_MAILBOX_WARNING: usize = 200;

/// Actor type for metrics labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    /// `SessionDirectory` (singleton).
    Directory,
    /// `RoomActor` (one per room with local participants).
    Room,
    /// `ConnectionActor` (one per client socket).
    Connection,
}

impl ActorType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Directory => "directory",
            ActorType::Room => "room",
            ActorType::Connection => "connection",
        }
    }

    #[must_use]
    pub const fn warning_threshold(&self) -> usize {
        match self {
            ActorType::Directory | ActorType::Room => ROOM_MAILBOX_WARNING,
            ActorType::Connection => CONNECTION_MAILBOX_WARNING,
        }
    }

    #[must_use]
    pub const fn normal_threshold(&self) -> usize {
        match self {
            ActorType::Directory | ActorType::Room => ROOM_MAILBOX_NORMAL,
            ActorType::Connection => CONNECTION_MAILBOX_NORMAL,
        }
    }
}

/// Mailbox depth level for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxLevel {
    Normal,
    Warning,
    Critical,
}

/// Tracks one actor's channel backlog.
///
/// The backlog is sampled from the channel after each message, so it counts
/// what senders have queued while the actor was busy.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    /// Room id, connection id, or node id.
    actor_id: String,
    level: MailboxLevel,
    peak_backlog: usize,
    messages_processed: u64,
    messages_dropped: u64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            level: MailboxLevel::Normal,
            peak_backlog: 0,
            messages_processed: 0,
            messages_dropped: 0,
        }
    }

    /// Record a processed message and the backlog left behind it.
    ///
    /// Logs once per level change rather than once per message.
    pub fn record_processed(&mut self, queued: usize) -> MailboxLevel {
        self.messages_processed += 1;
        self.peak_backlog = self.peak_backlog.max(queued);
        metrics::set_mailbox_depth(self.actor_type.as_str(), queued);

        let level = self.level_for_depth(queued);
        if level != self.level {
            match level {
                MailboxLevel::Critical => warn!(
                    target: "sfu.actor.mailbox",
                    actor_type = self.actor_type.as_str(),
                    actor_id = %self.actor_id,
                    queued,
                    threshold = self.actor_type.warning_threshold(),
                    "Mailbox backlog critical"
                ),
                MailboxLevel::Warning => debug!(
                    target: "sfu.actor.mailbox",
                    actor_type = self.actor_type.as_str(),
                    actor_id = %self.actor_id,
                    queued,
                    "Mailbox backlog elevated"
                ),
                MailboxLevel::Normal => debug!(
                    target: "sfu.actor.mailbox",
                    actor_type = self.actor_type.as_str(),
                    actor_id = %self.actor_id,
                    peak = self.peak_backlog,
                    "Mailbox backlog recovered"
                ),
            }
            self.level = level;
        }
        level
    }

    /// Record a message that could not be delivered to this actor's peer.
    pub fn record_drop(&mut self) {
        self.messages_dropped += 1;
        metrics::record_message_dropped(self.actor_type.as_str());
        warn!(
            target: "sfu.actor.mailbox",
            actor_type = self.actor_type.as_str(),
            actor_id = %self.actor_id,
            dropped = self.messages_dropped,
            "Message dropped due to backpressure"
        );
    }

    #[must_use]
    pub fn peak_backlog(&self) -> usize {
        self.peak_backlog
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed
    }

    #[must_use]
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped
    }

    #[must_use]
    pub fn current_level(&self) -> MailboxLevel {
        self.level
    }

    fn level_for_depth(&self, depth: usize) -> MailboxLevel {
        if depth > self.actor_type.warning_threshold() {
            MailboxLevel::Critical
        } else if depth > self.actor_type.normal_threshold() {
            MailboxLevel::Warning
        } else {
            MailboxLevel::Normal
        }
    }
}

/// Node-wide actor counters shared by the directory, the rooms, the
/// connections, and the heartbeat task.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    pub active_rooms: AtomicUsize,
    pub active_connections: AtomicUsize,
    /// Participants held by this node's room actors.
    pub active_participants: AtomicUsize,
    /// Total actor panics (indicates bugs).
    pub actor_panics: AtomicU64,
    pub total_messages_processed: AtomicU64,
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn room_created(&self) {
        let count = self.active_rooms.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_rooms_active(count);
    }

    pub fn room_removed(&self) {
        let count = decrement(&self.active_rooms);
        metrics::set_rooms_active(count);
    }

    pub fn connection_created(&self) {
        let count = self.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_connections_active(count);
    }

    pub fn connection_closed(&self) {
        let count = decrement(&self.active_connections);
        metrics::set_connections_active(count);
    }

    pub fn participant_joined(&self) {
        self.active_participants.fetch_add(1, Ordering::Relaxed);
    }

    pub fn participants_left(&self, count: usize) {
        let mut current = self.active_participants.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(count);
            match self.active_participants.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Record an actor panic.
    pub fn record_panic(&self, actor_type: ActorType) {
        self.actor_panics.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            target: "sfu.actor.panic",
            actor_type = actor_type.as_str(),
            total_panics = self.actor_panics.load(Ordering::Relaxed),
            "Actor panic detected - indicates bug, investigation required"
        );
    }

    pub fn record_message_processed(&self) {
        self.total_messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.active_rooms.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn participant_count(&self) -> usize {
        self.active_participants.load(Ordering::Relaxed)
    }
}

/// Saturating decrement; returns the new value.
fn decrement(counter: &AtomicUsize) -> usize {
    let mut current = counter.load(Ordering::Relaxed);
    loop {
        let next = current.saturating_sub(1);
        match counter.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => current = actual,
        }
    }
}
