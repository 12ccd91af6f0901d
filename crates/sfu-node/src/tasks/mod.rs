//! Background tasks for the SFU node.
//!
//! Every task runs until its cancellation token fires.
//!
//! # Tasks
//!
//! - `heartbeat` - Registers the node, then refreshes its heartbeat and load
//! - `maintenance` - Samples worker CPU and prunes idle admission entries
//! - `worker_loss` - Ends the sessions of rooms whose worker died
//! - `room_relay` - Relays room events published by other replicas

pub mod heartbeat;
pub mod maintenance;
pub mod room_relay;
pub mod worker_loss;

pub use heartbeat::{start_heartbeat, HeartbeatConfig};
pub use maintenance::{start_admission_pruner, start_resource_sampler};
pub use room_relay::start_room_relay;
pub use worker_loss::{start_worker_loss_watcher, WorkerLossServices};
