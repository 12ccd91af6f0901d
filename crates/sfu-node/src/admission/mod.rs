//! Admission control for the protocol gateway.
//!
//! Three independent sliding-window limiters:
//!
//! - connections per source address
//! - messages per connection
//! - messages per authenticated user, across all of that user's connections
//!
//! A key that trips its limit is blocked for the configured block duration.
//! Tripping clears the key's window, so the first attempt after the block
//! expires starts from an empty window.
//!
//! Keys live in a sharded map, so checks for different keys rarely contend.

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Deny { retry_after: Duration },
}

impl Admission {
    #[must_use]
    pub fn is_allowed(self) -> bool {
        matches!(self, Admission::Allow)
    }
}

/// Limit settings for one limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Maximum hits allowed inside `window`.
    pub limit: u32,
    pub window: Duration,
    /// How long a key stays blocked after exceeding `limit`.
    pub block: Duration,
}

#[derive(Debug, Default)]
struct WindowState {
    hits: VecDeque<Instant>,
    blocked_until: Option<Instant>,
}

impl WindowState {
    fn evict_expired(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.hits.front() {
            if now.saturating_duration_since(*oldest) >= window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    fn is_idle(&self, now: Instant, window: Duration) -> bool {
        let blocked = self.blocked_until.is_some_and(|until| until > now);
        let recent = self
            .hits
            .back()
            .is_some_and(|last| now.saturating_duration_since(*last) < window);
        !blocked && !recent
    }
}

/// Keyed sliding-window counter.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    name: &'static str,
    config: RateLimit,
    entries: DashMap<String, WindowState>,
}

impl SlidingWindowLimiter {
    #[must_use]
    pub fn new(name: &'static str, config: RateLimit) -> Self {
        Self {
            name,
            config,
            entries: DashMap::new(),
        }
    }

    /// Record one attempt for `key` at the current instant.
    pub fn check(&self, key: &str) -> Admission {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> Admission {
        let mut state = self.entries.entry(key.to_string()).or_default();

        if let Some(until) = state.blocked_until {
            if until > now {
                return Admission::Deny {
                    retry_after: until - now,
                };
            }
            state.blocked_until = None;
        }

        state.evict_expired(now, self.config.window);

        if state.hits.len() < self.config.limit as usize {
            state.hits.push_back(now);
            return Admission::Allow;
        }

        if self.config.block.is_zero() {
            // No block configured: wait for the oldest hit to leave the window.
            let retry_after = state
                .hits
                .front()
                .map_or(self.config.window, |oldest| {
                    (*oldest + self.config.window).saturating_duration_since(now)
                });
            return Admission::Deny { retry_after };
        }

        debug!(
            target: "sfu.admission",
            limiter = self.name,
            block_ms = self.config.block.as_millis(),
            "Rate limit exceeded, blocking key"
        );
        state.hits.clear();
        state.blocked_until = Some(now + self.config.block);
        Admission::Deny {
            retry_after: self.config.block,
        }
    }

    /// Drop all state for `key`.
    pub fn reset(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Remove keys that are neither blocked nor have hits inside the window.
    ///
    /// Returns the number of keys removed.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, state| !state.is_idle(now, self.config.window));
        before.saturating_sub(self.entries.len())
    }

    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.entries.len()
    }
}

/// Limits applied by the [`AdmissionController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionConfig {
    pub connection: RateLimit,
    pub connection_messages: RateLimit,
    pub user_messages: RateLimit,
}

/// Which limiter rejected a request. Used as a metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionScope {
    Connection,
    ConnectionMessages,
    UserMessages,
}

impl AdmissionScope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AdmissionScope::Connection => "connection",
            AdmissionScope::ConnectionMessages => "connection_messages",
            AdmissionScope::UserMessages => "user_messages",
        }
    }
}

/// Protects the gateway from connection floods and message floods.
#[derive(Debug)]
pub struct AdmissionController {
    connections: SlidingWindowLimiter,
    connection_messages: SlidingWindowLimiter,
    user_messages: SlidingWindowLimiter,
}

impl AdmissionController {
    #[must_use]
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            connections: SlidingWindowLimiter::new("connection", config.connection),
            connection_messages: SlidingWindowLimiter::new(
                "connection_messages",
                config.connection_messages,
            ),
            user_messages: SlidingWindowLimiter::new("user_messages", config.user_messages),
        }
    }

    /// Check a new connection from `source_key` (normally the peer IP).
    pub fn check_connection(&self, source_key: &str) -> Admission {
        let decision = self.connections.check(source_key);
        record_denial(AdmissionScope::Connection, decision);
        decision
    }

    /// Check one inbound message.
    ///
    /// The per-connection counter is consulted first; the per-user counter
    /// only once the connection is authenticated.
    pub fn check_message(&self, connection_key: &str, user_key: Option<&str>) -> Admission {
        let decision = self.connection_messages.check(connection_key);
        if !decision.is_allowed() {
            record_denial(AdmissionScope::ConnectionMessages, decision);
            return decision;
        }

        match user_key {
            Some(user) => {
                let decision = self.user_messages.check(user);
                record_denial(AdmissionScope::UserMessages, decision);
                decision
            }
            None => Admission::Allow,
        }
    }

    /// Drop per-connection counters. User counters persist across reconnects.
    pub fn reset(&self, connection_key: &str) {
        self.connection_messages.reset(connection_key);
    }

    /// Evict idle entries from every limiter. Returns the number removed.
    pub fn prune(&self) -> usize {
        self.connections.prune() + self.connection_messages.prune() + self.user_messages.prune()
    }

    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.connections.tracked_keys()
            + self.connection_messages.tracked_keys()
            + self.user_messages.tracked_keys()
    }
}

fn record_denial(scope: AdmissionScope, decision: Admission) {
    if !decision.is_allowed() {
        crate::observability::metrics::record_admission_denied(scope.as_str());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn limit(limit: u32, window_secs: u64, block_secs: u64) -> RateLimit {
        RateLimit {
            limit,
            window: Duration::from_secs(window_secs),
            block: Duration::from_secs(block_secs),
        }
    }

    fn controller() -> AdmissionController {
        AdmissionController::new(AdmissionConfig {
            connection: limit(3, 60, 300),
            connection_messages: limit(5, 1, 10),
            user_messages: limit(8, 1, 10),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_limit_denies_n_plus_one_then_recovers() {
        let admission = controller();

        for _ in 0..3 {
            assert_eq!(admission.check_connection("10.0.0.1"), Admission::Allow);
        }

        match admission.check_connection("10.0.0.1") {
            Admission::Deny { retry_after } => assert!(retry_after > Duration::ZERO),
            Admission::Allow => unreachable!("fourth connection must be denied"),
        }

        // Other sources are unaffected.
        assert!(admission.check_connection("10.0.0.2").is_allowed());

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(!admission.check_connection("10.0.0.1").is_allowed());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(admission.check_connection("10.0.0.1").is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_counts_down_during_block() {
        let admission = controller();
        for _ in 0..4 {
            admission.check_connection("src");
        }

        tokio::time::advance(Duration::from_secs(100)).await;
        assert_eq!(
            admission.check_connection("src"),
            Admission::Deny {
                retry_after: Duration::from_secs(200)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides_without_block() {
        let limiter = SlidingWindowLimiter::new("test", limit(2, 10, 0));

        assert!(limiter.check("k").is_allowed());
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(limiter.check("k").is_allowed());

        assert_eq!(
            limiter.check("k"),
            Admission::Deny {
                retry_after: Duration::from_secs(6)
            }
        );

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(limiter.check("k").is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_limit_spans_connections() {
        let admission = controller();

        // Two connections of the same user each stay under the per-connection
        // limit but together exceed the per-user limit.
        for _ in 0..4 {
            assert!(admission.check_message("conn-a", Some("alice")).is_allowed());
            assert!(admission.check_message("conn-b", Some("alice")).is_allowed());
        }
        assert!(!admission.check_message("conn-c", Some("alice")).is_allowed());
        assert!(admission.check_message("conn-d", Some("bob")).is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthenticated_messages_only_hit_connection_counter() {
        let admission = controller();

        for _ in 0..5 {
            assert!(admission.check_message("conn", None).is_allowed());
        }
        assert!(!admission.check_message("conn", None).is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_drops_connection_counter_but_keeps_user_counter() {
        let admission = controller();

        for _ in 0..5 {
            assert!(admission.check_message("conn", Some("alice")).is_allowed());
        }
        assert!(!admission.check_message("conn", Some("alice")).is_allowed());

        admission.reset("conn");
        assert!(admission.check_message("conn", Some("alice")).is_allowed());

        // alice has used 6 of 8 user slots
        assert!(admission.check_message("conn2", Some("alice")).is_allowed());
        assert!(admission.check_message("conn2", Some("alice")).is_allowed());
        assert!(!admission.check_message("conn2", Some("alice")).is_allowed());
    }

    #[test]
    fn test_concurrent_checks_admit_exactly_the_limit() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let limiter = SlidingWindowLimiter::new("test", limit(50, 60, 300));
        let allowed = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for thread in 0..8 {
                let limiter = &limiter;
                let allowed = &allowed;
                scope.spawn(move || {
                    for _ in 0..20 {
                        if limiter.check("shared").is_allowed() {
                            allowed.fetch_add(1, Ordering::SeqCst);
                        }
                        assert!(limiter.check(&format!("own-{thread}")).is_allowed());
                    }
                });
            }
        });

        assert_eq!(allowed.load(Ordering::SeqCst), 50);
        assert!(!limiter.check("shared").is_allowed());
        assert_eq!(limiter.tracked_keys(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_removes_idle_keys_only() {
        let admission = controller();
        admission.check_connection("idle");
        for _ in 0..4 {
            admission.check_connection("blocked");
        }
        assert_eq!(admission.tracked_keys(), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(admission.prune(), 1);
        assert_eq!(admission.tracked_keys(), 1);

        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(admission.prune(), 1);
        assert_eq!(admission.tracked_keys(), 0);
    }
}
