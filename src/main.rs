use std::sync::Arc;

use convoy::clusters::{ClusterRegistry, KubeWorkloadCluster};
use convoy::controller::{strategy, traffic};
use convoy::shutdown;
use kube::Client;
use tracing::{error, info};

/// Worker count per controller loop, from CONVOY_THREADINESS (default: 2)
fn threadiness() -> u16 {
    std::env::var("CONVOY_THREADINESS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(2)
}

/// Name under which the local cluster registers its workload client
/// (default: local)
fn local_cluster_name() -> String {
    std::env::var("CONVOY_CLUSTER_NAME").unwrap_or_else(|_| "local".to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting convoy rollout controller");

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    info!("Connected to Kubernetes cluster");

    // Workload clusters are registered here by whatever wires cluster
    // credentials; out of the box only the local cluster is reachable.
    let mut registry = ClusterRegistry::new();
    registry.insert(
        local_cluster_name(),
        Arc::new(KubeWorkloadCluster::new(client.clone())),
    );
    info!(clusters = ?registry.names(), "Workload cluster registry initialised");

    let shutdown = shutdown::on_termination();
    let threadiness = threadiness();
    info!(threadiness = threadiness, "Starting controller loops");

    let strategy_ctx = Arc::new(strategy::Context::new(client.clone()));
    let traffic_ctx = Arc::new(traffic::Context::new(client, Arc::new(registry)));

    tokio::join!(
        strategy::run(strategy_ctx, threadiness, shutdown.clone()),
        traffic::run(traffic_ctx, threadiness, shutdown),
    );

    info!("Convoy controller shut down gracefully");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
