//! Clients for workload clusters
//!
//! The traffic shifter runs against many clusters at once. Each cluster is
//! reached through the [`WorkloadCluster`] trait so tests can substitute an
//! in-memory fake; production wires one [`KubeWorkloadCluster`] per remote
//! cluster into a [`ClusterRegistry`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("invalid JSON patch: {0}")]
    InvalidPatch(#[from] serde_json::Error),
}

/// One workload cluster, scoped to whatever namespace the caller names
#[async_trait]
pub trait WorkloadCluster: Send + Sync {
    async fn list_services(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Service>, ClusterError>;

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, ClusterError>;

    /// Apply a JSON Patch (RFC 6902 array) to a pod
    async fn patch_pod(
        &self,
        namespace: &str,
        name: &str,
        patch: &[u8],
    ) -> Result<(), ClusterError>;
}

/// `WorkloadCluster` backed by a kube client
pub struct KubeWorkloadCluster {
    client: Client,
}

impl KubeWorkloadCluster {
    pub fn new(client: Client) -> Self {
        KubeWorkloadCluster { client }
    }
}

#[async_trait]
impl WorkloadCluster for KubeWorkloadCluster {
    async fn list_services(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Service>, ClusterError> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let list = services
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(list.items)
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, ClusterError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods.list(&ListParams::default().labels(selector)).await?;
        Ok(list.items)
    }

    async fn patch_pod(
        &self,
        namespace: &str,
        name: &str,
        patch: &[u8],
    ) -> Result<(), ClusterError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let patch: json_patch::Patch = serde_json::from_slice(patch)?;
        pods.patch(name, &PatchParams::default(), &Patch::Json::<()>(patch))
            .await?;
        Ok(())
    }
}

/// Cluster name to client lookup
///
/// Populated at startup by whatever wires cluster credentials; the traffic
/// loop only ever reads it.
#[derive(Default)]
pub struct ClusterRegistry {
    clusters: BTreeMap<String, Arc<dyn WorkloadCluster>>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        ClusterRegistry::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, cluster: Arc<dyn WorkloadCluster>) {
        self.clusters.insert(name.into(), cluster);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn WorkloadCluster>> {
        self.clusters.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.clusters.keys().cloned().collect()
    }
}
