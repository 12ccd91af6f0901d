//! SFU Node Library
//!
//! Core of a cluster-aware selective forwarding unit. Every node is both a
//! signaling gateway for its client connections and a media node whose
//! worker pool hosts routing contexts for the rooms placed on it.
//!
//! # Architecture
//!
//! ```text
//! Protocol Gateway (WebSocket glue)
//! └── ConnectionActor (one per client socket)
//!     └── SessionDirectory (singleton per node)
//!         └── RoomActor (one per room with local participants)
//!             └── RoomRouter ──► RoutingContextManager (local or remote RPC)
//!                                └── MediaEnginePool (supervised worker slots)
//! ```
//!
//! Cluster-wide state (node registry, room placements, rosters, room event
//! fan-out) lives behind the [`cluster::CoordinationStore`] trait.
//!
//! # Key Design Decisions
//!
//! - **Single owner per room**: room state is owned by one actor; peers reach it by message
//! - **Idempotent placement**: concurrent joins converge on one node and context per room
//! - **Worker loss is fatal for its rooms**: sessions end and clients rejoin into a fresh placement
//! - **Heartbeat loss never migrates rooms**: stale nodes only stop receiving new rooms
//!
//! # Modules
//!
//! - [`actors`] - Connection, room, and directory actors
//! - [`admission`] - Connection and message rate limiting
//! - [`cluster`] - Node registry and room placement
//! - [`engine`] - Media engine capability and worker pool
//! - [`gateway`] - WebSocket endpoint
//! - [`routing`] - Per-room routing contexts and the internal routing RPC
//! - [`tasks`] - Heartbeat, sampling, worker loss, and relay tasks

pub mod actors;
pub mod admission;
pub mod auth;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod errors;
pub mod gateway;
pub mod observability;
pub mod routing;
pub mod system_info;
pub mod tasks;
