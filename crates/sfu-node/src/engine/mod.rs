//! Media engine capability and worker pool.
//!
//! The node drives an external media engine through two traits:
//!
//! - [`MediaEngine`] spawns one isolated worker per pool slot
//! - [`MediaWorker`] performs routing-context, transport, producer and
//!   consumer operations inside one worker
//!
//! Parameters produced or consumed by the engine (security, codec, RTP
//! capabilities) travel as [`EngineBlob`]s and are never interpreted here.
//! The [`pool::MediaEnginePool`] owns the workers; callers only ever hold a
//! [`pool::SlotHandle`].

pub mod loopback;
pub mod pool;

use std::time::Duration;

use async_trait::async_trait;
use common::types::{EngineBlob, MediaKind, TransportDirection};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

pub use loopback::LoopbackEngine;
pub use pool::{MediaEnginePool, PoolConfig, SlotHandle, WorkerEvent, WorkerStatus};

/// Errors reported by the media engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The slot has no running worker, or the handle names a replaced generation.
    #[error("Worker slot {0} is unavailable")]
    WorkerUnavailable(usize),

    /// No slot in the pool has a running worker.
    #[error("No live media worker")]
    NoLiveWorkers,

    /// The worker died while handling the call.
    #[error("Worker terminated")]
    Terminated,

    /// The engine does not know the referenced object.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The engine refused the operation (bad parameters, wrong direction, ...).
    #[error("Rejected: {0}")]
    Rejected(String),
}

/// A freshly created routing context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineContext {
    pub engine_context_id: String,
    /// Router capabilities handed to clients as-is.
    pub capabilities: EngineBlob,
}

/// A freshly created transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineTransport {
    pub transport_id: String,
    pub security_params: EngineBlob,
}

/// A freshly created consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConsumer {
    pub consumer_id: String,
    pub media_params: EngineBlob,
}

/// Worker resource snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    /// Cumulative CPU time consumed since the worker started.
    pub cpu_time: Duration,
    /// Resident memory in bytes.
    pub memory_bytes: u64,
}

/// Spawns media workers.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Start a worker for `slot`.
    async fn spawn_worker(&self, slot: usize) -> Result<Arc<dyn MediaWorker>, EngineError>;
}

/// One isolated media-processing worker.
///
/// Every object id is generated by the worker. Ids are only meaningful
/// within the routing context that created them.
#[async_trait]
pub trait MediaWorker: Send + Sync {
    /// Engine-side identifier of this worker (process id, handle name).
    fn worker_id(&self) -> String;

    async fn create_routing_context(&self) -> Result<EngineContext, EngineError>;

    async fn close_routing_context(&self, context_id: &str) -> Result<(), EngineError>;

    async fn create_transport(
        &self,
        context_id: &str,
        direction: TransportDirection,
        extra_capabilities: &EngineBlob,
    ) -> Result<EngineTransport, EngineError>;

    async fn connect_transport(
        &self,
        context_id: &str,
        transport_id: &str,
        security_params: &EngineBlob,
    ) -> Result<(), EngineError>;

    async fn close_transport(&self, context_id: &str, transport_id: &str) -> Result<(), EngineError>;

    /// Returns the new producer id.
    async fn produce(
        &self,
        context_id: &str,
        transport_id: &str,
        kind: MediaKind,
        media_params: &EngineBlob,
    ) -> Result<String, EngineError>;

    /// Whether a consumer with `consumer_capabilities` can receive `producer_id`.
    async fn can_consume(
        &self,
        context_id: &str,
        producer_id: &str,
        consumer_capabilities: &EngineBlob,
    ) -> Result<bool, EngineError>;

    async fn consume(
        &self,
        context_id: &str,
        transport_id: &str,
        producer_id: &str,
        consumer_capabilities: &EngineBlob,
        paused: bool,
    ) -> Result<EngineConsumer, EngineError>;

    async fn pause_producer(&self, context_id: &str, producer_id: &str) -> Result<(), EngineError>;

    async fn resume_producer(&self, context_id: &str, producer_id: &str) -> Result<(), EngineError>;

    async fn close_producer(&self, context_id: &str, producer_id: &str) -> Result<(), EngineError>;

    async fn pause_consumer(&self, context_id: &str, consumer_id: &str) -> Result<(), EngineError>;

    async fn resume_consumer(&self, context_id: &str, consumer_id: &str) -> Result<(), EngineError>;

    async fn close_consumer(&self, context_id: &str, consumer_id: &str) -> Result<(), EngineError>;

    /// Best effort; engines without simulcast ignore it.
    async fn set_preferred_layers(
        &self,
        context_id: &str,
        consumer_id: &str,
        spatial_layer: u8,
        temporal_layer: Option<u8>,
    ) -> Result<(), EngineError>;

    async fn resource_usage(&self) -> Result<ResourceUsage, EngineError>;

    /// Resolves once the worker has died. Never resolves for a healthy worker.
    async fn terminated(&self);

    /// Stop the worker. `terminated()` resolves afterwards.
    async fn shutdown(&self);
}
