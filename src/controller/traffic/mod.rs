//! Traffic reconciliation loop
//!
//! Runs on the same queue design as the strategy loop, keyed by
//! TrafficTarget. Each reconcile gathers every TrafficTarget of the same
//! application, drives the pod label shifter across the declared clusters
//! and writes the achieved weights back onto this target's status.

pub mod shifter;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Config};
use kube::runtime::{watcher, Controller};
use kube::{Client, ResourceExt};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use self::shifter::PodLabelShifter;
use crate::clusters::ClusterRegistry;
use crate::controller::backoff::Backoff;
use crate::controller::conditions::{new_condition, set_condition};
use crate::crd::targets::{
    ClusterTrafficStatus, TargetConditionType, TrafficTarget, TrafficTargetStatus,
};
use crate::crd::{ConditionStatus, APP_LABEL, RELEASE_LABEL};

/// Pods drift in target clusters without producing events here, so a
/// successful reconcile re-levels on a timer instead of waiting for changes
const RESYNC_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum TrafficReconcileError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("TrafficTarget missing namespace")]
    MissingNamespace,
}

pub struct Context {
    pub client: Client,
    pub clusters: Arc<ClusterRegistry>,
    pub backoff: Backoff,
}

impl Context {
    pub fn new(client: Client, clusters: Arc<ClusterRegistry>) -> Self {
        Context {
            client,
            clusters,
            backoff: Backoff::workqueue_default(),
        }
    }
}

/// Outcome of synchronising one cluster
enum ClusterReport {
    Synced {
        achieved: BTreeMap<String, u32>,
        pod_errors: Vec<String>,
    },
    NotOperational(String),
}

pub async fn reconcile(
    target: Arc<TrafficTarget>,
    ctx: Arc<Context>,
) -> Result<Action, TrafficReconcileError> {
    let namespace = target
        .namespace()
        .ok_or(TrafficReconcileError::MissingNamespace)?;
    let name = target.name_any();
    let key = format!("{namespace}/{name}");

    let Some(app) = target.labels().get(APP_LABEL).cloned() else {
        warn!(traffic_target = %key, "Missing app label, cannot select resources");
        surface_config_error(
            &ctx.client,
            &namespace,
            &target,
            format!("TrafficTarget {key:?} has no {APP_LABEL:?} label"),
        )
        .await?;
        ctx.backoff.forget(&key);
        return Ok(Action::await_change());
    };

    debug!(traffic_target = %key, app = %app, "Synchronising traffic");

    let targets: Api<TrafficTarget> = Api::namespaced(ctx.client.clone(), &namespace);
    let app_selector = format!("{APP_LABEL}={app}");
    let all_targets = targets
        .list(&ListParams::default().labels(&app_selector))
        .await?
        .items;

    let shifter = match PodLabelShifter::new(&app, &namespace, &all_targets) {
        Ok(shifter) => shifter,
        Err(e) => {
            // missing release labels and duplicate targets are configuration
            // errors; retrying cannot fix them, only a spec change can
            warn!(traffic_target = %key, error = %e, "Traffic configuration rejected");
            surface_config_error(&ctx.client, &namespace, &target, e.to_string()).await?;
            ctx.backoff.forget(&key);
            return Ok(Action::await_change());
        }
    };

    let mut reports = BTreeMap::new();
    for cluster in shifter.clusters() {
        let report = match ctx.clusters.get(&cluster) {
            None => {
                ClusterReport::NotOperational(format!("no client registered for cluster {cluster:?}"))
            }
            Some(workload) => match shifter.sync_cluster(&cluster, workload.as_ref()).await {
                Ok((achieved, pod_errors)) => ClusterReport::Synced {
                    achieved,
                    pod_errors: pod_errors.iter().map(ToString::to_string).collect(),
                },
                Err(e) => {
                    warn!(traffic_target = %key, cluster = %cluster, error = %e, "Cluster sync failed");
                    ClusterReport::NotOperational(e.to_string())
                }
            },
        };
        reports.insert(cluster, report);
    }

    // present, or the shifter constructor would have rejected the target
    let release = target
        .labels()
        .get(RELEASE_LABEL)
        .cloned()
        .unwrap_or_default();

    let new_status = compute_status(&target, &release, &reports);
    if target.status.as_ref() != Some(&new_status) {
        info!(traffic_target = %key, "Updating traffic target status");
        targets
            .patch_status(
                &name,
                &PatchParams::default(),
                &Patch::Merge(serde_json::json!({ "status": new_status })),
            )
            .await?;
    }

    ctx.backoff.forget(&key);
    Ok(Action::requeue(RESYNC_INTERVAL))
}

pub fn error_policy(
    target: Arc<TrafficTarget>,
    error: &TrafficReconcileError,
    ctx: Arc<Context>,
) -> Action {
    let key = format!(
        "{}/{}",
        target.namespace().unwrap_or_default(),
        target.name_any()
    );
    let delay = ctx.backoff.next(&key);
    warn!(
        traffic_target = %key,
        error = %error,
        delay_ms = delay.as_millis() as u64,
        "Traffic reconcile failed, backing off"
    );
    Action::requeue(delay)
}

/// Run the traffic controller until the shutdown signal fires
pub async fn run(ctx: Arc<Context>, threadiness: u16, shutdown: crate::shutdown::ShutdownSignal) {
    let targets: Api<TrafficTarget> = Api::all(ctx.client.clone());

    Controller::new(targets, watcher::Config::default())
        .with_config(Config::default().concurrency(threadiness))
        .graceful_shutdown_on(shutdown.wait())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((target, _)) => debug!(traffic_target = %target, "Reconciled"),
                Err(e) => error!(error = %e, "Controller runtime error"),
            }
        })
        .await;

    info!("Traffic controller stopped");
}

/// Compute this target's status from the per-cluster sync reports
///
/// Existing conditions are carried in so unchanged transitions keep their
/// timestamps.
fn compute_status(
    target: &TrafficTarget,
    release: &str,
    reports: &BTreeMap<String, ClusterReport>,
) -> TrafficTargetStatus {
    let mut clusters = Vec::with_capacity(target.spec.clusters.len());

    for declared in &target.spec.clusters {
        let existing = target
            .status
            .as_ref()
            .and_then(|s| s.cluster(&declared.name));
        let mut conditions = existing.map(|c| c.conditions.clone()).unwrap_or_default();
        let mut achieved_traffic = existing.map(|c| c.achieved_traffic).unwrap_or(0);

        match reports.get(&declared.name) {
            Some(ClusterReport::Synced { achieved, pod_errors }) => {
                set_condition(
                    &mut conditions,
                    new_condition(
                        TargetConditionType::Operational,
                        ConditionStatus::True,
                        String::new(),
                        String::new(),
                    ),
                );
                achieved_traffic = achieved.get(release).copied().unwrap_or(0);

                if !pod_errors.is_empty() {
                    set_condition(
                        &mut conditions,
                        new_condition(
                            TargetConditionType::Ready,
                            ConditionStatus::False,
                            "PodsNotReady",
                            pod_errors.join("; "),
                        ),
                    );
                } else if achieved_traffic != declared.weight {
                    set_condition(
                        &mut conditions,
                        new_condition(
                            TargetConditionType::Ready,
                            ConditionStatus::False,
                            "TrafficNotAchieved",
                            format!(
                                "achieved weight {achieved_traffic}, want {}",
                                declared.weight
                            ),
                        ),
                    );
                } else {
                    set_condition(
                        &mut conditions,
                        new_condition(
                            TargetConditionType::Ready,
                            ConditionStatus::True,
                            String::new(),
                            String::new(),
                        ),
                    );
                }
            }
            Some(ClusterReport::NotOperational(message)) => {
                set_condition(
                    &mut conditions,
                    new_condition(
                        TargetConditionType::Operational,
                        ConditionStatus::False,
                        "SyncFailed",
                        message.clone(),
                    ),
                );
                set_condition(
                    &mut conditions,
                    new_condition(
                        TargetConditionType::Ready,
                        ConditionStatus::False,
                        "ClusterNotOperational",
                        String::new(),
                    ),
                );
            }
            None => {
                set_condition(
                    &mut conditions,
                    new_condition(
                        TargetConditionType::Operational,
                        ConditionStatus::Unknown,
                        "NotSynchronised",
                        String::new(),
                    ),
                );
            }
        }

        clusters.push(ClusterTrafficStatus {
            name: declared.name.clone(),
            achieved_traffic,
            conditions,
        });
    }

    TrafficTargetStatus { clusters }
}

/// Mark every declared cluster Ready=False with a configuration error
async fn surface_config_error(
    client: &Client,
    namespace: &str,
    target: &TrafficTarget,
    message: String,
) -> Result<(), kube::Error> {
    let mut status = target.status.clone().unwrap_or_default();
    let mut changed = false;

    for declared in &target.spec.clusters {
        let position = status.clusters.iter().position(|c| c.name == declared.name);
        let cluster = match position {
            Some(i) => &mut status.clusters[i],
            None => {
                status.clusters.push(ClusterTrafficStatus {
                    name: declared.name.clone(),
                    achieved_traffic: 0,
                    conditions: Vec::new(),
                });
                changed = true;
                let last = status.clusters.len() - 1;
                &mut status.clusters[last]
            }
        };
        changed |= set_condition(
            &mut cluster.conditions,
            new_condition(
                TargetConditionType::Ready,
                ConditionStatus::False,
                "InvalidConfiguration",
                message.clone(),
            ),
        )
        .is_some();
    }

    if !changed {
        return Ok(());
    }

    let targets: Api<TrafficTarget> = Api::namespaced(client.clone(), namespace);
    targets
        .patch_status(
            &target.name_any(),
            &PatchParams::default(),
            &Patch::Merge(serde_json::json!({ "status": status })),
        )
        .await?;
    Ok(())
}
