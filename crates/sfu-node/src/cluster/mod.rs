//! Cluster coordination.
//!
//! Every replica shares one coordination store. The [`ClusterCoordinator`]
//! layers node registration, health, and room placement on top of the
//! [`CoordinationStore`] seam, which is backed by Redis in deployments and by
//! [`MemoryStore`] in single-node mode and tests.

pub mod coordinator;
pub mod lua_scripts;
pub mod memory;
pub mod redis_store;
pub mod store;

pub use coordinator::{
    room_id_from_channel, ClusterCoordinator, NodeRegistration, NodeStats, NodeStatus, Placement,
};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use store::{CoordinationStore, StoreError, StoreMessage};
