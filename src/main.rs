use clap::Parser;
use ermes::config::{NodeArgs, NodeConfig};
use ermes::node::{EdgeNode, spawn_stats_reporter};
use ermes::orchestrator::registry::FunctionRegistry;
use ermes::orchestrator::types::{ErmesResponse, HandlerOptions};
use ermes::store::driver::StoreBackend;
use ermes::store::memory::MemoryBackend;
use ermes::store::redis::RedisBackend;
use ermes::topology::resolver::Topology;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = NodeArgs::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_level)?)
        .init();

    tracing::info!("Starting node {} on {}", args.location_id, args.bind);

    // 1. Store backend:
    let backend = open_backend(&args.store_uri).await?;

    // 2. Topology, from file (and published) or from the store:
    let topology = load_topology(&args, backend.as_ref()).await?;
    tracing::info!("Infrastructure loaded: {} nodes", topology.nodes().count());

    // 3. Functions:
    let registry = FunctionRegistry::new();

    registry.register("counter", HandlerOptions::default(), |_request, session| async move {
        let count = session
            .get("count")
            .await
            .and_then(|value| value.as_i64())
            .unwrap_or(0)
            + 1;
        session.set("count", Value::from(count)).await?;
        Ok(ErmesResponse::json(200, &json!({ "count": count }))?)
    });

    registry.register("peek", HandlerOptions::read_only(), |_request, session| async move {
        let payload = session.snapshot().await;
        Ok(ErmesResponse::json(
            200,
            &json!({ "sessionId": session.session_id().to_string(), "payload": payload }),
        )?)
    });

    // 4. Edge node:
    let node = EdgeNode::new(NodeConfig::from(&args), topology, backend, registry)?;
    node.runtime.initialize().await?;

    // 5. Spawn stats reporter:
    spawn_stats_reporter(node.runtime.clone(), Duration::from_secs(5));

    // 6. Start HTTP server:
    let app = node.router();

    tracing::info!("HTTP server listening on {}", args.bind);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    node.runtime.connections.shutdown_all();
    tracing::info!("Node {} stopped", args.location_id);

    Ok(())
}

async fn open_backend(uri: &str) -> anyhow::Result<Arc<dyn StoreBackend>> {
    if uri.starts_with("memory://") {
        tracing::warn!("Using the in-process store, sessions will not survive a restart");
        return Ok(Arc::new(MemoryBackend::new()));
    }

    let backend = RedisBackend::open(uri)?;
    backend.load_functions().await?;
    Ok(Arc::new(backend))
}

async fn load_topology(args: &NodeArgs, backend: &dyn StoreBackend) -> anyhow::Result<Topology> {
    let conn = backend.connect().await?;

    let topology = match &args.infrastructure {
        Some(path) => {
            let bytes = tokio::fs::read(path).await?;
            let topology = Topology::from_json(&bytes)?;
            topology.publish(&*conn).await?;
            topology
        }
        None => Topology::load(&*conn)
            .await?
            .ok_or_else(|| {
                anyhow::anyhow!("No infrastructure file given and none published in the store")
            })?,
    };

    conn.close();
    Ok(topology)
}
