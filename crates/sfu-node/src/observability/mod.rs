//! Observability module for the SFU node.
//!
//! # Privacy by Default
//!
//! All instrumentation uses `#[instrument(skip_all)]` and explicit safe field allow-listing.
//! Tokens and the cluster secret never appear in spans or labels.
//! Metric labels are bounded to prevent cardinality explosion:
//! - `actor_type`: 3 values (directory, room, connection)
//! - `event`: client protocol event names
//! - `scope`: admission limiter names
//! - `reason`: session-ended reasons
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `sfu_connections_active` | Gauge | none | Current client connections |
//! | `sfu_rooms_active` | Gauge | none | Rooms with local participants |
//! | `sfu_workers_live` | Gauge | none | Live media workers |
//! | `sfu_message_processing_duration_seconds` | Histogram | `event`, `status` | Request latency |
//! | `sfu_admission_denied_total` | Counter | `scope` | Rejected connections and messages |
//! | `sfu_allocation_duration_seconds` | Histogram | `status` | Room placement latency |
//! | `sfu_worker_restarts_total` | Counter | none | Worker crashes refilled |
//! | `sfu_sessions_ended_total` | Counter | `reason` | Room sessions ended by the server |
//! | `sfu_coordination_operations_total` | Counter | `operation`, `status` | Coordination store calls |
//! | `sfu_mailbox_depth` | Gauge | `actor_type` | Backpressure indicator per actor type |
//! | `sfu_messages_dropped_total` | Counter | `actor_type` | Slow-consumer drops |

pub mod health;
pub mod metrics;

// Re-exports for convenience
pub use health::{health_router, HealthContext, HealthState, NodeStatusReport};
pub use metrics::init_metrics_recorder;
