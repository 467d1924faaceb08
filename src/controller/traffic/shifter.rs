//! Pod label shifter
//!
//! Realises a per-cluster traffic split by flipping the `traffic-status`
//! label on individual pods. The production service selects pods by label,
//! so moving a pod in or out of its selector moves real traffic.
//!
//! The algorithm is level-triggered and idempotent: re-running against an
//! already-correct fleet issues zero patches, and only pods crossing the
//! enabled/disabled boundary are ever touched.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use kube::{Resource, ResourceExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::clusters::{ClusterError, WorkloadCluster};
use crate::controller::replicas::calculate_desired_replica_count;
use crate::crd::targets::TrafficTarget;
use crate::crd::{
    APP_LABEL, LB_LABEL, LB_PRODUCTION, POD_TRAFFIC_STATUS_LABEL, RELEASE_LABEL, TRAFFIC_DISABLED,
    TRAFFIC_ENABLED,
};

/// cluster name -> release name -> traffic weight
pub type ClusterReleaseWeights = BTreeMap<String, BTreeMap<String, u32>>;

#[derive(Debug, Error)]
pub enum TrafficError {
    #[error("TrafficTarget '{namespace}/{name}' needs a '{RELEASE_LABEL}' label in order to select resources in the target clusters")]
    MissingReleaseLabel { namespace: String, name: String },

    #[error("TrafficTargets {first:?} and {second:?} in namespace {namespace:?} both operate on release {release:?}; at most one may")]
    DuplicateTrafficTargets {
        first: String,
        second: String,
        namespace: String,
        release: String,
    },

    #[error("no traffic weights declared for cluster {cluster:?}")]
    UnknownCluster { cluster: String },

    #[error("failed to list services in {namespace:?} on cluster {cluster:?} with selector {selector:?}: {source}")]
    FetchServiceFailed {
        cluster: String,
        namespace: String,
        selector: String,
        #[source]
        source: ClusterError,
    },

    #[error("expected exactly one production service in {namespace:?} on cluster {cluster:?} with selector {selector:?}, got {count}")]
    WrongServiceCount {
        cluster: String,
        namespace: String,
        selector: String,
        count: usize,
    },

    #[error("production service {service:?} in {namespace:?} on cluster {cluster:?} has no selector")]
    ServiceMissingSelector {
        cluster: String,
        namespace: String,
        service: String,
    },

    #[error("failed to list pods in {namespace:?} on cluster {cluster:?}: {source}")]
    PodListing {
        cluster: String,
        namespace: String,
        #[source]
        source: ClusterError,
    },

    #[error("failed to list pods of release {release:?} in {namespace:?} on cluster {cluster:?}: {source}")]
    ReleasePodListing {
        release: String,
        cluster: String,
        namespace: String,
        #[source]
        source: ClusterError,
    },

    #[error("failed to patch traffic-status label on pod {pod:?} in {namespace:?} on cluster {cluster:?}: {source}")]
    ModifyingLabel {
        cluster: String,
        namespace: String,
        pod: String,
        #[source]
        source: ClusterError,
    },

    #[error("release {release:?} needs {missing} more pods serving traffic but only {idle} idle pods exist")]
    ShortOfPods {
        release: String,
        idle: usize,
        missing: usize,
    },

    #[error("failed to encode pod label patch: {0}")]
    PatchEncoding(#[from] serde_json::Error),
}

/// Turns a set of TrafficTargets into per-pod label patches, one cluster at
/// a time
pub struct PodLabelShifter {
    app_name: String,
    namespace: String,
    service_selector: String,
    cluster_release_weights: ClusterReleaseWeights,
}

impl PodLabelShifter {
    pub fn new(
        app_name: &str,
        namespace: &str,
        traffic_targets: &[TrafficTarget],
    ) -> Result<Self, TrafficError> {
        let cluster_release_weights = build_cluster_release_weights(traffic_targets)?;

        Ok(PodLabelShifter {
            app_name: app_name.to_string(),
            namespace: namespace.to_string(),
            service_selector: format!("{APP_LABEL}={app_name},{LB_LABEL}={LB_PRODUCTION}"),
            cluster_release_weights,
        })
    }

    /// Clusters with declared weights, in sorted order
    pub fn clusters(&self) -> Vec<String> {
        self.cluster_release_weights.keys().cloned().collect()
    }

    /// Drive one cluster's pods toward the declared weight split
    ///
    /// Returns the achieved weight per release plus any per-pod errors. A
    /// per-pod patch failure degrades the result but does not abort the
    /// cluster; the returned error carries enough context to surface on the
    /// TrafficTarget status.
    pub async fn sync_cluster(
        &self,
        cluster: &str,
        workload: &dyn WorkloadCluster,
    ) -> Result<(BTreeMap<String, u32>, Vec<TrafficError>), TrafficError> {
        let release_weights = self
            .cluster_release_weights
            .get(cluster)
            .ok_or_else(|| TrafficError::UnknownCluster {
                cluster: cluster.to_string(),
            })?;

        let services = workload
            .list_services(&self.namespace, &self.service_selector)
            .await
            .map_err(|source| TrafficError::FetchServiceFailed {
                cluster: cluster.to_string(),
                namespace: self.namespace.clone(),
                selector: self.service_selector.clone(),
                source,
            })?;
        if services.len() != 1 {
            return Err(TrafficError::WrongServiceCount {
                cluster: cluster.to_string(),
                namespace: self.namespace.clone(),
                selector: self.service_selector.clone(),
                count: services.len(),
            });
        }

        let production_service = &services[0];
        let traffic_selector = production_service
            .spec
            .as_ref()
            .and_then(|s| s.selector.clone())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| TrafficError::ServiceMissingSelector {
                cluster: cluster.to_string(),
                namespace: self.namespace.clone(),
                service: production_service.name_any(),
            })?;

        let app_selector = format!("{APP_LABEL}={}", self.app_name);
        let fleet = workload
            .list_pods(&self.namespace, &app_selector)
            .await
            .map_err(|source| TrafficError::PodListing {
                cluster: cluster.to_string(),
                namespace: self.namespace.clone(),
                source,
            })?;

        let total_pods = fleet.len();
        let total_weight: u32 = release_weights.values().sum();

        // With every weight at zero the intended split for a running fleet is
        // undefined; leave the pods alone and report zero everywhere.
        if total_weight == 0 {
            let achieved = release_weights.keys().map(|r| (r.clone(), 0)).collect();
            return Ok((achieved, Vec::new()));
        }

        let mut achieved_weights = BTreeMap::new();
        let mut errors = Vec::new();

        for (release, &weight) in release_weights {
            let release_selector = format!("{RELEASE_LABEL}={release}");
            let mut release_pods = workload
                .list_pods(&self.namespace, &release_selector)
                .await
                .map_err(|source| TrafficError::ReleasePodListing {
                    release: release.clone(),
                    cluster: cluster.to_string(),
                    namespace: self.namespace.clone(),
                    source,
                })?;
            // sorted so shrink/grow picks the same pods on every pass
            release_pods.sort_by(|a, b| a.name_any().cmp(&b.name_any()));

            let target_pods =
                calculate_release_pod_target(release_pods.len(), weight, total_pods, total_weight);

            let (traffic_pods, idle_pods): (Vec<&Pod>, Vec<&Pod>) = release_pods
                .iter()
                .partition(|pod| gets_traffic(pod, &traffic_selector));

            if traffic_pods.len() == target_pods {
                achieved_weights.insert(release.clone(), weight);
                continue;
            }

            if traffic_pods.len() > target_pods {
                let excess = traffic_pods.len() - target_pods;
                let mut removed = 0usize;
                for pod in traffic_pods.iter().take(excess) {
                    if let Err(e) = self
                        .shift_pod(cluster, workload, pod, TRAFFIC_DISABLED)
                        .await
                    {
                        match e {
                            TrafficError::ModifyingLabel { .. } => {
                                errors.push(e);
                                continue;
                            }
                            fatal => return Err(fatal),
                        }
                    }
                    removed += 1;
                }
                let final_traffic_pods = traffic_pods.len() - removed;
                achieved_weights.insert(
                    release.clone(),
                    achieved_weight(final_traffic_pods, total_pods, total_weight),
                );
                continue;
            }

            let missing = target_pods - traffic_pods.len();
            if missing > idle_pods.len() {
                errors.push(TrafficError::ShortOfPods {
                    release: release.clone(),
                    idle: idle_pods.len(),
                    missing,
                });
                continue;
            }

            let mut added = 0usize;
            for pod in idle_pods.iter().take(missing) {
                if let Err(e) = self
                    .shift_pod(cluster, workload, pod, TRAFFIC_ENABLED)
                    .await
                {
                    match e {
                        TrafficError::ModifyingLabel { .. } => {
                            errors.push(e);
                            continue;
                        }
                        fatal => return Err(fatal),
                    }
                }
                added += 1;
            }
            let final_traffic_pods = traffic_pods.len() + added;
            achieved_weights.insert(
                release.clone(),
                achieved_weight(final_traffic_pods, total_pods, total_weight),
            );
        }

        debug!(
            cluster = cluster,
            app = %self.app_name,
            achieved = ?achieved_weights,
            pod_errors = errors.len(),
            "Traffic split synchronised"
        );

        Ok((achieved_weights, errors))
    }

    /// Patch one pod's traffic-status label unless it already holds `value`
    async fn shift_pod(
        &self,
        cluster: &str,
        workload: &dyn WorkloadCluster,
        pod: &Pod,
        value: &str,
    ) -> Result<(), TrafficError> {
        let current = pod
            .meta()
            .labels
            .as_ref()
            .and_then(|l| l.get(POD_TRAFFIC_STATUS_LABEL));
        if current.map(String::as_str) == Some(value) {
            return Ok(());
        }

        let patch = patch_pod_traffic_status(pod, value)?;
        workload
            .patch_pod(&self.namespace, &pod.name_any(), &patch)
            .await
            .map_err(|source| TrafficError::ModifyingLabel {
                cluster: cluster.to_string(),
                namespace: self.namespace.clone(),
                pod: pod.name_any(),
                source,
            })
    }
}

/// A pod gets traffic iff its labels are a superset of the production
/// service's selector
fn gets_traffic(pod: &Pod, traffic_selector: &BTreeMap<String, String>) -> bool {
    let labels = pod.meta().labels.clone().unwrap_or_default();
    traffic_selector
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
struct PatchOperation {
    op: String,
    path: String,
    value: String,
}

/// JSON Patch flipping a pod's traffic-status label
///
/// `add` iff the label key is absent on the live object, `replace` otherwise.
fn patch_pod_traffic_status(pod: &Pod, value: &str) -> Result<Vec<u8>, serde_json::Error> {
    let has_label = pod
        .meta()
        .labels
        .as_ref()
        .map(|l| l.contains_key(POD_TRAFFIC_STATUS_LABEL))
        .unwrap_or(false);

    let operation = PatchOperation {
        op: if has_label { "replace" } else { "add" }.to_string(),
        path: format!("/metadata/labels/{POD_TRAFFIC_STATUS_LABEL}"),
        value: value.to_string(),
    };

    serde_json::to_vec(&[operation])
}

/// How many of a release's pods should serve traffic
///
/// Rounds the release's share of the fleet up to the next pod, clamped to
/// the pods the release actually owns: a release cannot lend pods it does
/// not have.
fn calculate_release_pod_target(
    release_pods: usize,
    weight: u32,
    total_pods: usize,
    total_weight: u32,
) -> usize {
    let target_percent = if total_weight == 0 {
        0.0
    } else {
        f64::from(weight) / f64::from(total_weight) * 100.0
    };

    let target = calculate_desired_replica_count(total_pods as u32, target_percent) as usize;
    target.min(release_pods)
}

fn achieved_weight(traffic_pods: usize, total_pods: usize, total_weight: u32) -> u32 {
    if total_pods == 0 {
        return 0;
    }
    let proportion = traffic_pods as f64 / total_pods as f64;
    round_half_away_from_zero(proportion * f64::from(total_weight)) as u32
}

fn round_half_away_from_zero(value: f64) -> i64 {
    if value < 0.0 {
        (value - 0.5) as i64
    } else {
        (value + 0.5) as i64
    }
}

/// Fold a list of TrafficTargets into a cluster -> release -> weight table
///
/// Every target must carry a `release` label, each release may be named by
/// at most one target, and several entries for the same cluster within one
/// target accumulate. The table is invariant under input reordering.
pub fn build_cluster_release_weights(
    traffic_targets: &[TrafficTarget],
) -> Result<ClusterReleaseWeights, TrafficError> {
    let mut cluster_releases: ClusterReleaseWeights = BTreeMap::new();
    let mut seen_releases: BTreeMap<String, String> = BTreeMap::new();

    for tt in traffic_targets {
        let namespace = tt.meta().namespace.clone().unwrap_or_default();
        let name = tt.name_any();

        let release = tt
            .meta()
            .labels
            .as_ref()
            .and_then(|l| l.get(RELEASE_LABEL))
            .cloned()
            .ok_or_else(|| TrafficError::MissingReleaseLabel {
                namespace: namespace.clone(),
                name: name.clone(),
            })?;

        if let Some(existing) = seen_releases.get(&release) {
            // deterministic ordering in the error, whatever the input order
            let (first, second) = if existing <= &name {
                (existing.clone(), name)
            } else {
                (name, existing.clone())
            };
            return Err(TrafficError::DuplicateTrafficTargets {
                first,
                second,
                namespace,
                release,
            });
        }
        seen_releases.insert(release.clone(), name);

        for cluster in &tt.spec.clusters {
            *cluster_releases
                .entry(cluster.name.clone())
                .or_default()
                .entry(release.clone())
                .or_insert(0) += cluster.weight;
        }
    }

    Ok(cluster_releases)
}

#[cfg(test)]
#[path = "shifter_test.rs"]
mod tests;
