use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::Condition;

/// Condition types carried per cluster on every target object
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, JsonSchema,
)]
pub enum TargetConditionType {
    /// The cluster is reachable and the target controller can act on it
    Operational,
    /// The cluster has converged on the declared spec
    Ready,
}

pub type TargetCondition = Condition<TargetConditionType>;

/// InstallationTarget declares the clusters into which a release's manifests
/// must be present
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "convoy.io",
    version = "v1alpha1",
    kind = "InstallationTarget",
    namespaced,
    status = "InstallationTargetStatus",
    printcolumn = r#"{"name":"Clusters", "type":"string", "jsonPath":".spec.clusters"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct InstallationTargetSpec {
    #[serde(default)]
    pub clusters: Vec<String>,

    /// Whether objects already present in the cluster may be overwritten
    #[serde(rename = "canOverride", default)]
    pub can_override: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct InstallationTargetStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clusters: Vec<ClusterInstallationStatus>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct ClusterInstallationStatus {
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<TargetCondition>,
}

impl InstallationTargetStatus {
    pub fn cluster(&self, name: &str) -> Option<&ClusterInstallationStatus> {
        self.clusters.iter().find(|c| c.name == name)
    }
}

/// CapacityTarget declares per-cluster desired replica counts as a
/// percentage of the application's total
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "convoy.io",
    version = "v1alpha1",
    kind = "CapacityTarget",
    namespaced,
    status = "CapacityTargetStatus",
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct CapacityTargetSpec {
    #[serde(default)]
    pub clusters: Vec<ClusterCapacityTarget>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct ClusterCapacityTarget {
    pub name: String,

    /// Desired capacity, 0-100
    pub percent: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct CapacityTargetStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clusters: Vec<ClusterCapacityStatus>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ClusterCapacityStatus {
    pub name: String,

    #[serde(rename = "achievedPercent", default)]
    pub achieved_percent: u32,

    /// Replica count observed by the upstream capacity controller; surfaced
    /// in condition messages, never re-derived here
    #[serde(rename = "availableReplicas", default)]
    pub available_replicas: u32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<TargetCondition>,
}

impl CapacityTargetStatus {
    pub fn cluster(&self, name: &str) -> Option<&ClusterCapacityStatus> {
        self.clusters.iter().find(|c| c.name == name)
    }
}

/// TrafficTarget declares per-cluster desired traffic weights
///
/// Weights are unsigned integers in arbitrary units; a release's share of
/// traffic in a cluster is its weight over the sum of all weights there. At
/// most one TrafficTarget may reference a given release.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "convoy.io",
    version = "v1alpha1",
    kind = "TrafficTarget",
    namespaced,
    status = "TrafficTargetStatus",
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct TrafficTargetSpec {
    #[serde(default)]
    pub clusters: Vec<ClusterTrafficTarget>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct ClusterTrafficTarget {
    pub name: String,

    pub weight: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct TrafficTargetStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clusters: Vec<ClusterTrafficStatus>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ClusterTrafficStatus {
    pub name: String,

    #[serde(rename = "achievedTraffic", default)]
    pub achieved_traffic: u32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<TargetCondition>,
}

impl TrafficTargetStatus {
    pub fn cluster(&self, name: &str) -> Option<&ClusterTrafficStatus> {
        self.clusters.iter().find(|c| c.name == name)
    }
}

#[cfg(test)]
#[path = "targets_test.rs"]
mod tests;
