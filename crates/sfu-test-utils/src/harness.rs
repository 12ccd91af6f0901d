//! In-process cluster harness for end-to-end tests.
//!
//! Provides `TestCluster`, a shared in-memory coordination store plus a
//! signing key, and `TestSfuNode`, a complete node (engine pool, directory,
//! background tasks, gateway and routing RPC on a real listener) joined to
//! that cluster. `TestClient` drives a connection actor over channels, the
//! same way the WebSocket glue does.
//!
//! # Example
//! ```rust,ignore
//! #[tokio::test]
//! async fn test_join() {
//!     let cluster = TestCluster::new();
//!     let node = cluster.spawn_node("node-a").await;
//!
//!     let mut alice = node.connect();
//!     alice.authenticate(&cluster.token("alice", "rooms:host")).await;
//!     let joined = alice.join("r1", "host").await;
//! }
//! ```

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use sfu_node::actors::{
    ActorMetrics, ConnectionActor, ConnectionActorHandle, ConnectionContext, ConnectionSettings,
    Outbound, RoomServices, SessionDirectory, SessionDirectoryHandle,
};
use sfu_node::admission::AdmissionController;
use sfu_node::auth::JwtAuthenticator;
use sfu_node::cluster::{ClusterCoordinator, CoordinationStore, MemoryStore};
use sfu_node::config::Config;
use sfu_node::engine::{LoopbackEngine, MediaEngine, MediaEnginePool, PoolConfig};
use sfu_node::gateway::{self, GatewayState};
use sfu_node::observability::HealthState;
use sfu_node::routing::remote::DEFAULT_CALL_TIMEOUT;
use sfu_node::routing::{api as routing_api, RouterRegistry, RoutingContextManager};
use sfu_node::tasks::{
    start_heartbeat, start_room_relay, start_worker_loss_watcher, HeartbeatConfig,
    WorkerLossServices,
};
use signaling_protocol::{encode_request, CorrelationId, ServerEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::crypto::{TestKeypair, TokenBuilder};

/// Organization every harness token belongs to.
pub const TEST_ORG: &str = "org-test";

/// How long a client waits for any expected frame.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

const CLUSTER_SECRET: &str = "test-cluster-secret";

/// Shared coordination store and token signer for a set of test nodes.
pub struct TestCluster {
    store: Arc<MemoryStore>,
    keypair: TestKeypair,
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl TestCluster {
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            keypair: TestKeypair::new(42),
        }
    }

    /// A coordinator over the shared store, for assertions.
    #[must_use]
    pub fn coordinator(&self) -> ClusterCoordinator {
        ClusterCoordinator::new(
            Arc::clone(&self.store) as Arc<dyn CoordinationStore>,
            Duration::from_secs(3),
            Duration::from_secs(3),
        )
    }

    #[must_use]
    pub fn keypair(&self) -> &TestKeypair {
        &self.keypair
    }

    /// Signed token for `user_id` in [`TEST_ORG`] with space-separated `scope`.
    #[must_use]
    pub fn token(&self, user_id: &str, scope: &str) -> String {
        TokenBuilder::new(user_id)
            .scope(scope)
            .org(TEST_ORG)
            .sign(&self.keypair)
    }

    /// Start a node with harness defaults.
    ///
    /// # Panics
    ///
    /// If the node cannot start or register within [`RESPONSE_TIMEOUT`].
    pub async fn spawn_node(&self, node_id: &str) -> TestSfuNode {
        self.spawn_node_with(node_id, &[]).await
    }

    /// Start a node, overriding configuration variables.
    ///
    /// # Panics
    ///
    /// If the node cannot start or register within [`RESPONSE_TIMEOUT`].
    pub async fn spawn_node_with(&self, node_id: &str, overrides: &[(&str, &str)]) -> TestSfuNode {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("listener address");

        let mut vars = HashMap::from([
            ("SFU_NODE_ID".to_string(), node_id.to_string()),
            ("SFU_ADVERTISED_ADDRESS".to_string(), format!("http://{addr}")),
            ("COORDINATION_BACKEND".to_string(), "memory".to_string()),
            ("AUTH_PUBLIC_KEY_PEM".to_string(), self.keypair.public_key_pem()),
            ("CLUSTER_SECRET".to_string(), CLUSTER_SECRET.to_string()),
            ("SFU_WORKER_COUNT".to_string(), "2".to_string()),
            ("WORKER_RESTART_DELAY_MS".to_string(), "50".to_string()),
            ("NODE_HEARTBEAT_INTERVAL_SECONDS".to_string(), "1".to_string()),
            ("NODE_HEARTBEAT_TTL_SECONDS".to_string(), "3".to_string()),
            ("REMOTE_ROOM_RECONCILE_SECONDS".to_string(), "1".to_string()),
        ]);
        for (name, value) in overrides {
            vars.insert((*name).to_string(), (*value).to_string());
        }
        let config = Config::from_vars(&vars).expect("valid test config");

        let coordinator = ClusterCoordinator::new(
            Arc::clone(&self.store) as Arc<dyn CoordinationStore>,
            config.heartbeat_ttl,
            config.allocation_timeout,
        );

        let engine = Arc::new(LoopbackEngine::new());
        let engine_token = CancellationToken::new();
        let (pool, _supervisors) = MediaEnginePool::start(
            Arc::clone(&engine) as Arc<dyn MediaEngine>,
            PoolConfig {
                worker_count: config.worker_count,
                restart_delay: config.worker_restart_delay,
            },
            engine_token.clone(),
        )
        .await
        .expect("engine pool starts");

        let manager = Arc::new(RoutingContextManager::new(Arc::clone(&pool)));
        let registry = Arc::new(RouterRegistry::new(
            config.node_id.clone(),
            Arc::clone(&manager),
            coordinator.clone(),
            config.cluster_secret.clone(),
            DEFAULT_CALL_TIMEOUT,
        ));
        let metrics = ActorMetrics::new();
        let shutdown = CancellationToken::new();

        let (directory, directory_task) = SessionDirectory::spawn(
            RoomServices {
                node_id: config.node_id.clone(),
                coordinator: coordinator.clone(),
                registry,
                metrics: Arc::clone(&metrics),
                reconcile_interval: config.remote_room_reconcile_interval,
            },
            shutdown.child_token(),
        );

        let health = Arc::new(HealthState::new());
        let heartbeat_task = tokio::spawn(start_heartbeat(
            HeartbeatConfig {
                node_id: config.node_id.clone(),
                advertised_address: config.advertised_address.clone(),
                capacity: config.node_capacity,
                interval: config.heartbeat_interval,
            },
            coordinator.clone(),
            Arc::clone(&pool),
            Arc::clone(&metrics),
            Arc::clone(&health),
            shutdown.child_token(),
        ));
        tokio::spawn(start_worker_loss_watcher(
            pool.subscribe(),
            WorkerLossServices {
                node_id: config.node_id.clone(),
                manager: Arc::clone(&manager),
                coordinator: coordinator.clone(),
                directory: directory.clone(),
            },
            engine_token.child_token(),
        ));
        tokio::spawn(start_room_relay(
            coordinator.clone(),
            directory.clone(),
            config.node_id.clone(),
            shutdown.child_token(),
        ));

        let authenticator = JwtAuthenticator::from_public_key_pem(
            &config.auth_public_key_pem,
            config.clock_skew,
        )
        .expect("test public key decodes");
        let context = ConnectionContext {
            directory: directory.clone(),
            authenticator: Arc::new(authenticator),
            admission: Arc::new(AdmissionController::new(config.admission)),
            metrics: Arc::clone(&metrics),
            settings: ConnectionSettings {
                max_message_bytes: config.max_message_bytes,
                probe_interval: config.probe_interval,
                idle_timeout: config.idle_timeout,
            },
        };

        let app = gateway::build_routes(
            GatewayState {
                connections: context.clone(),
                health: Arc::clone(&health),
                shutdown: shutdown.clone(),
            },
            routing_api::routes(Arc::clone(&manager), config.cluster_secret.clone()),
        );
        let server = tokio::spawn(async move {
            let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(listener, make_service).await {
                eprintln!("Test server error: {e}");
            }
        });

        tokio::time::timeout(RESPONSE_TIMEOUT, async {
            while !health.is_registered() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("node registers");

        TestSfuNode {
            addr,
            config,
            engine,
            pool,
            manager,
            coordinator,
            directory,
            context,
            metrics,
            health,
            shutdown,
            engine_token,
            directory_task: Some(directory_task),
            heartbeat_task: Some(heartbeat_task),
            server,
        }
    }
}

/// One running node. Dropping it stops everything.
pub struct TestSfuNode {
    addr: SocketAddr,
    config: Config,
    engine: Arc<LoopbackEngine>,
    pool: Arc<MediaEnginePool>,
    manager: Arc<RoutingContextManager>,
    coordinator: ClusterCoordinator,
    directory: SessionDirectoryHandle,
    context: ConnectionContext,
    metrics: Arc<ActorMetrics>,
    health: Arc<HealthState>,
    shutdown: CancellationToken,
    engine_token: CancellationToken,
    directory_task: Option<JoinHandle<()>>,
    heartbeat_task: Option<JoinHandle<()>>,
    server: JoinHandle<()>,
}

impl TestSfuNode {
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// WebSocket endpoint of the gateway.
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}{}", self.addr, gateway::WEBSOCKET_PATH)
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The in-process engine, for killing workers.
    #[must_use]
    pub fn engine(&self) -> &LoopbackEngine {
        &self.engine
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<MediaEnginePool> {
        &self.pool
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<RoutingContextManager> {
        &self.manager
    }

    #[must_use]
    pub fn coordinator(&self) -> &ClusterCoordinator {
        &self.coordinator
    }

    #[must_use]
    pub fn directory(&self) -> &SessionDirectoryHandle {
        &self.directory
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<ActorMetrics> {
        &self.metrics
    }

    #[must_use]
    pub fn health(&self) -> &Arc<HealthState> {
        &self.health
    }

    /// Open a channel-driven client connection.
    #[must_use]
    pub fn connect(&self) -> TestClient {
        let (outbound_tx, outbound) = mpsc::channel(256);
        let (actor, task) = ConnectionActor::spawn(
            uuid::Uuid::new_v4().to_string(),
            self.context.clone(),
            outbound_tx,
            self.shutdown.child_token(),
        );
        TestClient {
            actor,
            task: Some(task),
            outbound,
            pushed: VecDeque::new(),
            next_id: 1,
        }
    }

    /// Run the node's graceful shutdown: connections leave, the directory
    /// drains, and the node deregisters.
    ///
    /// # Panics
    ///
    /// If the directory or heartbeat task panicked.
    pub async fn shutdown(&mut self) {
        self.health.set_draining();
        self.shutdown.cancel();
        if let Some(task) = self.directory_task.take() {
            task.await.expect("directory task");
        }
        if let Some(task) = self.heartbeat_task.take() {
            task.await.expect("heartbeat task");
        }
    }
}

impl Drop for TestSfuNode {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.engine_token.cancel();
        self.server.abort();
    }
}

/// A client connection driven through its actor's mailbox.
pub struct TestClient {
    actor: ConnectionActorHandle,
    task: Option<JoinHandle<()>>,
    outbound: mpsc::Receiver<Outbound>,
    pushed: VecDeque<ServerEvent>,
    next_id: CorrelationId,
}

impl TestClient {
    #[must_use]
    pub fn connection_id(&self) -> &str {
        self.actor.connection_id()
    }

    /// Send a raw text frame.
    ///
    /// # Panics
    ///
    /// If the connection actor has stopped.
    pub async fn send_raw(&mut self, frame: impl Into<String>) {
        self.actor.frame(frame.into()).await.expect("connection is open");
    }

    /// Send `event` with a fresh id and wait for its response.
    /// Pushed events seen meanwhile are buffered.
    ///
    /// # Panics
    ///
    /// If no response arrives within [`RESPONSE_TIMEOUT`].
    pub async fn request(&mut self, event: &str, data: Value) -> ServerEvent {
        let id = self.next_id;
        self.next_id += 1;
        self.send_raw(encode_request(Some(id), event, data)).await;
        self.response(id).await
    }

    /// Wait for the response carrying `id`.
    ///
    /// # Panics
    ///
    /// If the connection closes first or nothing arrives in time.
    pub async fn response(&mut self, id: CorrelationId) -> ServerEvent {
        loop {
            match self.next_frame().await {
                Outbound::Event { id: Some(got), event } if got == id => return event,
                Outbound::Event { id: None, event } => self.pushed.push_back(event),
                Outbound::Event { id: Some(other), event } => {
                    panic!("response for {other} while waiting for {id}: {event:?}")
                }
                Outbound::Probe => {}
                Outbound::Close { reason } => panic!("connection closed: {reason}"),
            }
        }
    }

    /// Wait for the next response whatever its id, e.g. for frames the
    /// server could not read an id from.
    ///
    /// # Panics
    ///
    /// If the connection closes first or nothing arrives in time.
    pub async fn next_response(&mut self) -> (CorrelationId, ServerEvent) {
        loop {
            match self.next_frame().await {
                Outbound::Event { id: Some(id), event } => return (id, event),
                Outbound::Event { id: None, event } => self.pushed.push_back(event),
                Outbound::Probe => {}
                Outbound::Close { reason } => panic!("connection closed: {reason}"),
            }
        }
    }

    /// Wait for a pushed event named `event_name`, keeping others buffered.
    ///
    /// # Panics
    ///
    /// If it does not arrive within [`RESPONSE_TIMEOUT`].
    pub async fn expect_push(&mut self, event_name: &str) -> ServerEvent {
        if let Some(pos) = self.pushed.iter().position(|e| e.event_name() == event_name) {
            if let Some(event) = self.pushed.remove(pos) {
                return event;
            }
        }
        loop {
            match self.next_frame().await {
                Outbound::Event { id: None, event } if event.event_name() == event_name => {
                    return event
                }
                Outbound::Event { id: None, event } => self.pushed.push_back(event),
                Outbound::Event { id: Some(id), event } => {
                    panic!("unexpected response {id} while waiting for {event_name}: {event:?}")
                }
                Outbound::Probe => {}
                Outbound::Close { reason } => {
                    panic!("connection closed while waiting for {event_name}: {reason}")
                }
            }
        }
    }

    /// Pushed events received so far, oldest first.
    pub fn drain_pushes(&mut self) -> Vec<ServerEvent> {
        while let Ok(frame) = self.outbound.try_recv() {
            if let Outbound::Event { id: None, event } = frame {
                self.pushed.push_back(event);
            }
        }
        self.pushed.drain(..).collect()
    }

    /// Wait until the server closes the connection; returns the reason.
    ///
    /// # Panics
    ///
    /// If the connection stays open past [`RESPONSE_TIMEOUT`].
    pub async fn expect_closed(&mut self) -> String {
        loop {
            match self.next_frame().await {
                Outbound::Close { reason } => return reason,
                Outbound::Event { id: None, event } => self.pushed.push_back(event),
                _ => {}
            }
        }
    }

    /// Authenticate in [`TEST_ORG`].
    ///
    /// # Panics
    ///
    /// If the server does not answer `authenticated`.
    pub async fn authenticate(&mut self, token: &str) -> ServerEvent {
        let event = self
            .request(
                "authenticate",
                json!({"token": token, "organizationId": TEST_ORG}),
            )
            .await;
        assert_eq!(event.event_name(), "authenticated", "{event:?}");
        event
    }

    /// Join `room_id`; returns the raw response.
    pub async fn join(&mut self, room_id: &str, role: &str) -> ServerEvent {
        self.request(
            "join-room",
            json!({"roomId": room_id, "role": role, "displayName": ""}),
        )
        .await
    }

    /// Create a transport; returns its id.
    ///
    /// # Panics
    ///
    /// If the server does not answer `transport-created`.
    pub async fn create_transport(&mut self, direction: &str) -> String {
        match self
            .request("create-transport", json!({"direction": direction}))
            .await
        {
            ServerEvent::TransportCreated { transport_id, .. } => transport_id,
            other => panic!("expected transport-created, got {other:?}"),
        }
    }

    /// Close the socket from the client side and wait for cleanup.
    ///
    /// # Panics
    ///
    /// If the actor does not stop within [`RESPONSE_TIMEOUT`].
    pub async fn disconnect(mut self) {
        self.actor.disconnected().await;
        if let Some(task) = self.task.take() {
            tokio::time::timeout(RESPONSE_TIMEOUT, task)
                .await
                .expect("connection actor stops")
                .expect("connection actor task");
        }
    }

    async fn next_frame(&mut self) -> Outbound {
        tokio::time::timeout(RESPONSE_TIMEOUT, self.outbound.recv())
            .await
            .expect("frame within timeout")
            .expect("outbound queue open")
    }
}

/// Opaque capabilities that can receive VP8 and Opus.
#[must_use]
pub fn receive_capabilities() -> Value {
    json!({"codecs": [{"mimeType": "video/VP8"}, {"mimeType": "audio/opus"}]})
}

/// VP8 produce parameters.
#[must_use]
pub fn vp8_params() -> Value {
    json!({"codecs": [{"mimeType": "video/VP8", "clockRate": 90000}]})
}
