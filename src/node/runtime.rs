//! Node Runtime
//!
//! Everything one edge node shares between its routes: this node's identity, the
//! topology, the connection cache and the session services built on top of it.

use crate::config::NodeConfig;
use crate::connection::{Connection, ConnectionManager, ExecutionContext};
use crate::error::ErmesError;
use crate::migration::client::PeerClient;
use crate::offload::coordinator::OffloadCoordinator;
use crate::offload::retry::RetryPolicy;
use crate::store::driver::StoreBackend;
use crate::store::session::SessionStore;
use crate::topology::resolver::Topology;
use crate::topology::types::Node;

use std::future::Future;
use std::sync::Arc;

pub struct NodeRuntime {
    pub config: NodeConfig,
    /// This node, with the gateway it is reachable at.
    pub local: Node,
    pub topology: Arc<Topology>,
    pub connections: ConnectionManager,
    pub store: Arc<SessionStore>,
    pub coordinator: Arc<OffloadCoordinator>,
    pub peers: PeerClient,
    pub retry: RetryPolicy,
}

impl NodeRuntime {
    pub fn new(
        config: NodeConfig,
        topology: Topology,
        backend: Arc<dyn StoreBackend>,
    ) -> Result<Self, ErmesError> {
        let local = match (topology.resolve_node(&config.location_id), &config.gateway) {
            (Ok(node), Some(gateway)) => Node {
                gateway: gateway.clone(),
                ..node.clone()
            },
            (Ok(node), None) => node.clone(),
            (Err(_), Some(gateway)) => {
                tracing::warn!(
                    "Location {} is not part of the infrastructure, it will have no parent",
                    config.location_id
                );
                Node {
                    location_id: config.location_id.clone(),
                    gateway: gateway.clone(),
                    gateway_password: None,
                    store_host: None,
                    store_port: None,
                    store_password: None,
                }
            }
            (Err(e), None) => return Err(e),
        };

        let store = Arc::new(SessionStore::new());
        let coordinator = Arc::new(OffloadCoordinator::new(
            config.location_id.clone(),
            config.session_ttl,
            store.clone(),
        ));
        let peers = PeerClient::new().map_err(|e| ErmesError::Peer(format!("{:#}", e)))?;
        let retry = RetryPolicy::with_attempts(config.migration_attempts);

        Ok(Self {
            config,
            local,
            topology: Arc::new(topology),
            connections: ConnectionManager::new(backend),
            store,
            coordinator,
            peers,
            retry,
        })
    }

    pub fn location_id(&self) -> &str {
        &self.local.location_id
    }

    /// Default offload target and onload source.
    pub fn parent(&self) -> Option<&Node> {
        self.topology.parent_of(&self.local.location_id)
    }

    /// Runs `op` on the connection of a fresh execution context, ending the context
    /// afterwards whatever the outcome.
    pub async fn with_connection<T, F, Fut>(&self, op: F) -> Result<T, ErmesError>
    where
        F: FnOnce(Connection) -> Fut,
        Fut: Future<Output = Result<T, ErmesError>>,
    {
        let context = ExecutionContext::new();
        let result = match self.connections.acquire(&context).await {
            Ok(connection) => op(connection).await,
            Err(e) => Err(e.into()),
        };
        self.connections.end_context(&context);
        result
    }

    /// Writes the node's startup state to its store.
    pub async fn initialize(&self) -> Result<(), ErmesError> {
        let accept = self.config.accept_offloading;
        self.with_connection(|conn| async move {
            self.store.set_offloading_status(&*conn, accept).await
        })
        .await?;

        tracing::info!(
            "Node {} ready at {} (offloading {})",
            self.local.location_id,
            self.local.gateway,
            if accept { "accepted" } else { "rejected" }
        );
        Ok(())
    }
}
