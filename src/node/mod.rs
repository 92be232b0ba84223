//! Node Module
//!
//! Assembles one edge node: the shared runtime, the migration service, the request
//! orchestrator and the HTTP router serving both the function routes and the peer routes.

pub mod runtime;

#[cfg(test)]
mod tests;

use crate::config::NodeConfig;
use crate::error::ErmesError;
use crate::migration::handlers::*;
use crate::migration::protocol::*;
use crate::migration::service::MigrationService;
use crate::orchestrator::handlers::handle_function;
use crate::orchestrator::orchestrator::RequestOrchestrator;
use crate::orchestrator::registry::FunctionRegistry;
use crate::store::driver::StoreBackend;
use crate::topology::resolver::Topology;
use runtime::NodeRuntime;

use axum::{
    Router,
    extract::Extension,
    routing::{any, get, post},
};
use std::sync::Arc;
use std::time::Duration;

pub struct EdgeNode {
    pub runtime: Arc<NodeRuntime>,
    pub migration: Arc<MigrationService>,
    pub orchestrator: Arc<RequestOrchestrator>,
}

impl EdgeNode {
    pub fn new(
        config: NodeConfig,
        topology: Topology,
        backend: Arc<dyn StoreBackend>,
        registry: Arc<FunctionRegistry>,
    ) -> Result<Self, ErmesError> {
        let runtime = Arc::new(NodeRuntime::new(config, topology, backend)?);
        let migration = Arc::new(MigrationService::new(runtime.clone()));
        let orchestrator = Arc::new(RequestOrchestrator::new(runtime.clone(), registry));

        Ok(Self {
            runtime,
            migration,
            orchestrator,
        })
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/function/:name", any(handle_function))
            .route(ENDPOINT_OFFLOAD_SESSION, post(handle_offload_session))
            .route(ENDPOINT_MIGRATE_SESSION, get(handle_migrate_session))
            .route(ENDPOINT_FORCE_OFFLOAD, post(handle_force_offload))
            .route(ENDPOINT_UPDATE_SESSION, get(handle_update_session))
            .route(ENDPOINT_ONLOAD_SESSION, get(handle_onload_session))
            .route(ENDPOINT_REQUEST_ONLOAD, post(handle_request_onload))
            .route(ENDPOINT_GARBAGE_COLLECTOR, get(handle_garbage_collector))
            .route(ENDPOINT_OFFLOAD_STATUS, post(handle_offload_status))
            .route(ENDPOINT_STATUS, get(handle_status))
            .layer(Extension(self.orchestrator.clone()))
            .layer(Extension(self.migration.clone()))
    }
}

/// Logs the node's counters every `period`.
pub fn spawn_stats_reporter(
    runtime: Arc<NodeRuntime>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);

        loop {
            interval.tick().await;
            let rt = runtime.as_ref();
            let stats = rt
                .with_connection(|conn| async move {
                    let accepts = rt.store.accepts_offloading(&*conn).await?;
                    let indicators = rt.store.indicators(&*conn).await?;
                    Ok((accepts, indicators))
                })
                .await;

            match stats {
                Ok((accepts, indicators)) => tracing::info!(
                    "Node {} stats: offloading={} created={} offloaded={} onloaded={} served={} \
                     connections={}",
                    rt.location_id(),
                    if accepts { "accept" } else { "reject" },
                    indicators.sessions_created,
                    indicators.sessions_offloaded,
                    indicators.sessions_onloaded,
                    indicators.requests_served,
                    rt.connections.open_connections()
                ),
                Err(e) => tracing::warn!("Could not read node stats: {}", e),
            }
        }
    })
}
