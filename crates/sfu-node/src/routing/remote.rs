//! Routing calls against peer nodes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::secret::{ExposeSecret, SecretString};
use reqwest::Client;
use tokio::sync::RwLock;
use tracing::{debug, error, instrument, warn};

use super::api::{RemoteError, ROUTING_PATH};
use super::{RoomRouter, RoutingCall, RoutingContextManager, RoutingReply, RoutingService};
use crate::cluster::ClusterCoordinator;
use crate::errors::SfuError;

/// Default timeout for one routing call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP client for one peer's `/internal/routing` endpoint.
#[derive(Clone)]
pub struct RemoteRoutingService {
    client: Client,
    node_id: String,
    url: String,
    cluster_secret: SecretString,
}

impl RemoteRoutingService {
    /// # Errors
    ///
    /// Returns `SfuError::Internal` if the HTTP client cannot be built.
    pub fn new(
        node_id: impl Into<String>,
        base_url: &str,
        cluster_secret: SecretString,
        timeout: Duration,
    ) -> Result<Self, SfuError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(2)))
            .build()
            .map_err(|e| {
                error!(target: "sfu.routing.remote", error = %e, "Failed to build HTTP client");
                SfuError::Internal("http client".to_string())
            })?;

        Ok(Self {
            client,
            node_id: node_id.into(),
            url: format!("{}{}", base_url.trim_end_matches('/'), ROUTING_PATH),
            cluster_secret,
        })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RoutingService for RemoteRoutingService {
    #[instrument(skip_all, fields(node_id = %self.node_id, op = call.op()))]
    async fn execute(&self, call: RoutingCall) -> Result<RoutingReply, SfuError> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(self.cluster_secret.expose_secret())
            .json(&call)
            .send()
            .await
            .map_err(|e| {
                warn!(target: "sfu.routing.remote", node_id = %self.node_id, error = %e, "Routing call failed");
                SfuError::Peer(format!("node {} unreachable", self.node_id))
            })?;

        let status = response.status();
        if status.is_success() {
            return response.json::<RoutingReply>().await.map_err(|e| {
                error!(target: "sfu.routing.remote", error = %e, "Failed to parse routing reply");
                SfuError::Peer("malformed routing reply".to_string())
            });
        }

        if status.as_u16() == 401 {
            error!(target: "sfu.routing.remote", node_id = %self.node_id, "Cluster secret rejected by peer");
            return Err(SfuError::Internal("cluster secret rejected".to_string()));
        }

        match response.json::<RemoteError>().await {
            Ok(remote) => {
                debug!(
                    target: "sfu.routing.remote",
                    node_id = %self.node_id,
                    status = %status,
                    code = %remote.code,
                    "Peer returned error"
                );
                Err(SfuError::from_remote(&remote.code, remote.message))
            }
            Err(_) => {
                warn!(target: "sfu.routing.remote", status = %status, "Unexpected peer response");
                Err(SfuError::Peer(format!("node {} returned {status}", self.node_id)))
            }
        }
    }
}

/// Resolves a placement's node id to a routing service.
///
/// The local node resolves to its own manager. Peers are looked up in the
/// coordinator's registry and their clients cached by address.
pub struct RouterRegistry {
    local_node_id: String,
    local: Arc<RoutingContextManager>,
    coordinator: ClusterCoordinator,
    cluster_secret: SecretString,
    call_timeout: Duration,
    remotes: RwLock<HashMap<String, Arc<RemoteRoutingService>>>,
}

impl RouterRegistry {
    #[must_use]
    pub fn new(
        local_node_id: impl Into<String>,
        local: Arc<RoutingContextManager>,
        coordinator: ClusterCoordinator,
        cluster_secret: SecretString,
        call_timeout: Duration,
    ) -> Self {
        Self {
            local_node_id: local_node_id.into(),
            local,
            coordinator,
            cluster_secret,
            call_timeout,
            remotes: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn local_node_id(&self) -> &str {
        &self.local_node_id
    }

    #[must_use]
    pub fn local(&self) -> &Arc<RoutingContextManager> {
        &self.local
    }

    /// # Errors
    ///
    /// `Peer` if the node is not registered, `Coordination` if the store fails.
    pub async fn resolve(&self, node_id: &str) -> Result<Arc<dyn RoutingService>, SfuError> {
        if node_id == self.local_node_id {
            return Ok(Arc::clone(&self.local) as Arc<dyn RoutingService>);
        }

        let registration = self
            .coordinator
            .node(node_id)
            .await?
            .ok_or_else(|| SfuError::Peer(format!("node {node_id} is not registered")))?;

        if let Some(cached) = self.remotes.read().await.get(node_id) {
            if cached.url().starts_with(registration.address.trim_end_matches('/')) {
                return Ok(Arc::clone(cached) as Arc<dyn RoutingService>);
            }
        }

        let remote = Arc::new(RemoteRoutingService::new(
            node_id,
            &registration.address,
            self.cluster_secret.clone(),
            self.call_timeout,
        )?);
        self.remotes
            .write()
            .await
            .insert(node_id.to_string(), Arc::clone(&remote));
        debug!(
            target: "sfu.routing.remote",
            node_id = %node_id,
            address = %registration.address,
            "Peer routing client created"
        );
        Ok(remote as Arc<dyn RoutingService>)
    }

    /// Typed router for `room_id` on the node that owns it.
    ///
    /// # Errors
    ///
    /// See [`RouterRegistry::resolve`].
    pub async fn router(&self, room_id: &str, node_id: &str) -> Result<RoomRouter, SfuError> {
        Ok(RoomRouter::new(self.resolve(node_id).await?, room_id))
    }
}
