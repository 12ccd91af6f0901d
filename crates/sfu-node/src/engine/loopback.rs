//! In-process media engine that keeps bookkeeping only.
//!
//! Packet processing lives in an external engine; the loopback engine gives
//! the node a fully working control plane without one. It generates ids,
//! echoes parameter blobs, decides consume compatibility by comparing codec
//! MIME types, and reports synthetic CPU usage. Workers can be killed on
//! demand to exercise crash handling.
//!
//! Codec lists are read from `{"codecs": [{"mimeType": "video/VP8", ...}]}`
//! in produce parameters and consumer capabilities. MIME types compare
//! case-insensitively.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use common::types::{EngineBlob, MediaKind, TransportDirection};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    EngineConsumer, EngineContext, EngineError, EngineTransport, MediaEngine, MediaWorker,
    ResourceUsage,
};

/// Synthetic CPU time charged per engine call.
const CPU_PER_OPERATION: Duration = Duration::from_micros(500);

/// Engine whose workers live in this process.
#[derive(Default)]
pub struct LoopbackEngine {
    workers: Mutex<HashMap<usize, Arc<LoopbackWorker>>>,
    spawned: AtomicU64,
}

impl LoopbackEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<usize, Arc<LoopbackWorker>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Kill the worker currently occupying `slot`. Returns false if none is running.
    pub fn kill(&self, slot: usize) -> bool {
        match self.workers().get(&slot) {
            Some(worker) if !worker.is_dead() => {
                warn!(target: "sfu.engine.loopback", slot = slot, worker_id = %worker.id, "Killing worker");
                worker.dead.cancel();
                true
            }
            _ => false,
        }
    }

    /// Total workers spawned, restarts included.
    #[must_use]
    pub fn spawned_count(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    /// Routing contexts currently held by the worker in `slot`.
    #[must_use]
    pub fn context_count(&self, slot: usize) -> usize {
        self.workers()
            .get(&slot)
            .map_or(0, |worker| worker.lock().contexts.len())
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn spawn_worker(&self, slot: usize) -> Result<Arc<dyn MediaWorker>, EngineError> {
        let worker = Arc::new(LoopbackWorker::new(slot));
        self.spawned.fetch_add(1, Ordering::Relaxed);
        self.workers().insert(slot, Arc::clone(&worker));
        debug!(target: "sfu.engine.loopback", slot = slot, worker_id = %worker.id, "Worker spawned");
        Ok(worker)
    }
}

#[derive(Debug)]
struct LoopbackTransport {
    direction: TransportDirection,
    connected: bool,
}

#[derive(Debug)]
struct LoopbackProducer {
    kind: MediaKind,
    codecs: Vec<Value>,
    paused: bool,
}

#[derive(Debug)]
struct LoopbackConsumer {
    producer_id: String,
    paused: bool,
    preferred_layers: Option<(u8, Option<u8>)>,
}

#[derive(Debug, Default)]
struct LoopbackContext {
    transports: HashMap<String, LoopbackTransport>,
    producers: HashMap<String, LoopbackProducer>,
    consumers: HashMap<String, LoopbackConsumer>,
}

#[derive(Debug, Default)]
struct WorkerState {
    contexts: HashMap<String, LoopbackContext>,
}

impl WorkerState {
    fn context(&mut self, context_id: &str) -> Result<&mut LoopbackContext, EngineError> {
        self.contexts
            .get_mut(context_id)
            .ok_or_else(|| EngineError::NotFound(format!("routing context {context_id}")))
    }
}

/// One loopback worker.
pub struct LoopbackWorker {
    id: String,
    slot: usize,
    state: Mutex<WorkerState>,
    operations: AtomicU64,
    dead: CancellationToken,
}

impl LoopbackWorker {
    fn new(slot: usize) -> Self {
        Self {
            id: format!("loopback-{slot}-{}", uuid::Uuid::new_v4().simple()),
            slot,
            state: Mutex::new(WorkerState::default()),
            operations: AtomicU64::new(0),
            dead: CancellationToken::new(),
        }
    }

    fn is_dead(&self) -> bool {
        self.dead.is_cancelled()
    }

    fn lock(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Entry check for every call.
    fn begin(&self) -> Result<MutexGuard<'_, WorkerState>, EngineError> {
        if self.is_dead() {
            return Err(EngineError::Terminated);
        }
        self.operations.fetch_add(1, Ordering::Relaxed);
        Ok(self.lock())
    }
}

fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}

/// Codec entries declared in a blob's `codecs` array.
fn codecs(blob: &EngineBlob) -> Vec<Value> {
    blob.as_value()
        .get("codecs")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn mime_type(codec: &Value) -> Option<String> {
    codec
        .get("mimeType")
        .and_then(Value::as_str)
        .map(str::to_ascii_lowercase)
}

/// Producer codecs the consumer can receive, in producer order.
fn matching_codecs(producer_codecs: &[Value], consumer_capabilities: &EngineBlob) -> Vec<Value> {
    let accepted: Vec<String> = codecs(consumer_capabilities).iter().filter_map(mime_type).collect();
    producer_codecs
        .iter()
        .filter(|codec| mime_type(codec).is_some_and(|mime| accepted.contains(&mime)))
        .cloned()
        .collect()
}

fn router_capabilities() -> EngineBlob {
    EngineBlob::from(json!({
        "codecs": [
            {"kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2},
            {"kind": "video", "mimeType": "video/VP8", "clockRate": 90000},
            {"kind": "video", "mimeType": "video/H264", "clockRate": 90000,
             "parameters": {"packetization-mode": 1, "profile-level-id": "42e01f"}}
        ],
        "headerExtensions": []
    }))
}

#[async_trait]
impl MediaWorker for LoopbackWorker {
    fn worker_id(&self) -> String {
        self.id.clone()
    }

    async fn create_routing_context(&self) -> Result<EngineContext, EngineError> {
        let mut state = self.begin()?;
        let engine_context_id = new_id("router");
        state
            .contexts
            .insert(engine_context_id.clone(), LoopbackContext::default());
        Ok(EngineContext {
            engine_context_id,
            capabilities: router_capabilities(),
        })
    }

    async fn close_routing_context(&self, context_id: &str) -> Result<(), EngineError> {
        let mut state = self.begin()?;
        state
            .contexts
            .remove(context_id)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(format!("routing context {context_id}")))
    }

    async fn create_transport(
        &self,
        context_id: &str,
        direction: TransportDirection,
        _extra_capabilities: &EngineBlob,
    ) -> Result<EngineTransport, EngineError> {
        let mut state = self.begin()?;
        let context = state.context(context_id)?;
        let transport_id = new_id("transport");
        context.transports.insert(
            transport_id.clone(),
            LoopbackTransport {
                direction,
                connected: false,
            },
        );

        let security_params = EngineBlob::from(json!({
            "id": transport_id,
            "iceParameters": {
                "usernameFragment": uuid::Uuid::new_v4().simple().to_string(),
                "password": uuid::Uuid::new_v4().simple().to_string(),
                "iceLite": true
            },
            "iceCandidates": [],
            "dtlsParameters": {"role": "auto", "fingerprints": []}
        }));

        Ok(EngineTransport {
            transport_id,
            security_params,
        })
    }

    async fn connect_transport(
        &self,
        context_id: &str,
        transport_id: &str,
        security_params: &EngineBlob,
    ) -> Result<(), EngineError> {
        let mut state = self.begin()?;
        let transport = state
            .context(context_id)?
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| EngineError::NotFound(format!("transport {transport_id}")))?;

        if transport.connected {
            return Err(EngineError::Rejected("transport already connected".to_string()));
        }
        if security_params.is_empty() {
            return Err(EngineError::Rejected("missing security parameters".to_string()));
        }
        transport.connected = true;
        Ok(())
    }

    async fn close_transport(&self, context_id: &str, transport_id: &str) -> Result<(), EngineError> {
        let mut state = self.begin()?;
        state
            .context(context_id)?
            .transports
            .remove(transport_id)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(format!("transport {transport_id}")))
    }

    async fn produce(
        &self,
        context_id: &str,
        transport_id: &str,
        kind: MediaKind,
        media_params: &EngineBlob,
    ) -> Result<String, EngineError> {
        let mut state = self.begin()?;
        let context = state.context(context_id)?;
        let transport = context
            .transports
            .get(transport_id)
            .ok_or_else(|| EngineError::NotFound(format!("transport {transport_id}")))?;

        if transport.direction != TransportDirection::Send {
            return Err(EngineError::Rejected("cannot produce on a receive transport".to_string()));
        }

        let producer_codecs = codecs(media_params);
        if producer_codecs.is_empty() {
            return Err(EngineError::Rejected("media parameters declare no codecs".to_string()));
        }

        let producer_id = new_id("producer");
        context.producers.insert(
            producer_id.clone(),
            LoopbackProducer {
                kind,
                codecs: producer_codecs,
                paused: false,
            },
        );
        Ok(producer_id)
    }

    async fn can_consume(
        &self,
        context_id: &str,
        producer_id: &str,
        consumer_capabilities: &EngineBlob,
    ) -> Result<bool, EngineError> {
        let mut state = self.begin()?;
        let producer = state
            .context(context_id)?
            .producers
            .get(producer_id)
            .ok_or_else(|| EngineError::NotFound(format!("producer {producer_id}")))?;
        Ok(!matching_codecs(&producer.codecs, consumer_capabilities).is_empty())
    }

    async fn consume(
        &self,
        context_id: &str,
        transport_id: &str,
        producer_id: &str,
        consumer_capabilities: &EngineBlob,
        paused: bool,
    ) -> Result<EngineConsumer, EngineError> {
        let mut state = self.begin()?;
        let context = state.context(context_id)?;

        let transport = context
            .transports
            .get(transport_id)
            .ok_or_else(|| EngineError::NotFound(format!("transport {transport_id}")))?;
        if transport.direction != TransportDirection::Recv {
            return Err(EngineError::Rejected("cannot consume on a send transport".to_string()));
        }

        let producer = context
            .producers
            .get(producer_id)
            .ok_or_else(|| EngineError::NotFound(format!("producer {producer_id}")))?;
        let matched = matching_codecs(&producer.codecs, consumer_capabilities);
        if matched.is_empty() {
            return Err(EngineError::Rejected("no common codec".to_string()));
        }

        let consumer_id = new_id("consumer");
        let media_params = EngineBlob::from(json!({
            "kind": producer.kind.as_str(),
            "codecs": matched,
            "producerPaused": producer.paused
        }));

        context.consumers.insert(
            consumer_id.clone(),
            LoopbackConsumer {
                producer_id: producer_id.to_string(),
                paused,
                preferred_layers: None,
            },
        );

        Ok(EngineConsumer {
            consumer_id,
            media_params,
        })
    }

    async fn pause_producer(&self, context_id: &str, producer_id: &str) -> Result<(), EngineError> {
        set_producer_paused(&mut *self.begin()?, context_id, producer_id, true)
    }

    async fn resume_producer(&self, context_id: &str, producer_id: &str) -> Result<(), EngineError> {
        set_producer_paused(&mut *self.begin()?, context_id, producer_id, false)
    }

    async fn close_producer(&self, context_id: &str, producer_id: &str) -> Result<(), EngineError> {
        let mut state = self.begin()?;
        let context = state.context(context_id)?;
        context
            .producers
            .remove(producer_id)
            .ok_or_else(|| EngineError::NotFound(format!("producer {producer_id}")))?;
        // Consumers of a closed producer close with it.
        context
            .consumers
            .retain(|_, consumer| consumer.producer_id != producer_id);
        Ok(())
    }

    async fn pause_consumer(&self, context_id: &str, consumer_id: &str) -> Result<(), EngineError> {
        set_consumer_paused(&mut *self.begin()?, context_id, consumer_id, true)
    }

    async fn resume_consumer(&self, context_id: &str, consumer_id: &str) -> Result<(), EngineError> {
        set_consumer_paused(&mut *self.begin()?, context_id, consumer_id, false)
    }

    async fn close_consumer(&self, context_id: &str, consumer_id: &str) -> Result<(), EngineError> {
        let mut state = self.begin()?;
        state
            .context(context_id)?
            .consumers
            .remove(consumer_id)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(format!("consumer {consumer_id}")))
    }

    async fn set_preferred_layers(
        &self,
        context_id: &str,
        consumer_id: &str,
        spatial_layer: u8,
        temporal_layer: Option<u8>,
    ) -> Result<(), EngineError> {
        let mut state = self.begin()?;
        let consumer = state
            .context(context_id)?
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| EngineError::NotFound(format!("consumer {consumer_id}")))?;
        consumer.preferred_layers = Some((spatial_layer, temporal_layer));
        Ok(())
    }

    async fn resource_usage(&self) -> Result<ResourceUsage, EngineError> {
        let state = self.begin()?;
        let objects: usize = state
            .contexts
            .values()
            .map(|c| c.transports.len() + c.producers.len() + c.consumers.len())
            .sum();
        let operations = self.operations.load(Ordering::Relaxed);
        let ops = u32::try_from(operations).unwrap_or(u32::MAX);

        Ok(ResourceUsage {
            cpu_time: CPU_PER_OPERATION.saturating_mul(ops),
            memory_bytes: 8 * 1024 * 1024 + 64 * 1024 * objects as u64,
        })
    }

    async fn terminated(&self) {
        self.dead.cancelled().await;
    }

    async fn shutdown(&self) {
        debug!(target: "sfu.engine.loopback", slot = self.slot, worker_id = %self.id, "Worker shutting down");
        self.lock().contexts.clear();
        self.dead.cancel();
    }
}

fn set_producer_paused(
    state: &mut WorkerState,
    context_id: &str,
    producer_id: &str,
    paused: bool,
) -> Result<(), EngineError> {
    let producer = state
        .context(context_id)?
        .producers
        .get_mut(producer_id)
        .ok_or_else(|| EngineError::NotFound(format!("producer {producer_id}")))?;
    producer.paused = paused;
    Ok(())
}

fn set_consumer_paused(
    state: &mut WorkerState,
    context_id: &str,
    consumer_id: &str,
    paused: bool,
) -> Result<(), EngineError> {
    let consumer = state
        .context(context_id)?
        .consumers
        .get_mut(consumer_id)
        .ok_or_else(|| EngineError::NotFound(format!("consumer {consumer_id}")))?;
    consumer.paused = paused;
    Ok(())
}
