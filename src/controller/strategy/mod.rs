//! Strategy reconciliation loop
//!
//! A level-triggered controller over Release objects. Events from the three
//! sibling target kinds map onto the release of the same name, so the work
//! key for anything rollout-related is always `namespace/releaseName`. Each
//! reconcile rebuilds fresh snapshots of the contender (and incumbent, when
//! one exists), hands them to the executor and applies whatever patches come
//! back through the dynamic dispatcher.

pub mod executor;

use std::sync::Arc;

use futures::StreamExt;
use kube::api::{Api, ListParams};
use kube::runtime::controller::{Action, Config};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{watcher, Controller};
use kube::{Client, Resource, ResourceExt};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use self::executor::{ExecutorError, ReleaseInfo};
use crate::controller::backoff::Backoff;
use crate::controller::conditions::{new_condition, set_condition};
use crate::controller::dispatch::{self, DispatchError};
use crate::crd::release::{
    contender_of, incumbent_of, is_installed, is_working_on_strategy, Release,
    ReleaseConditionType, ReleaseStatus,
};
use crate::crd::targets::{CapacityTarget, InstallationTarget, TrafficTarget};
use crate::crd::{ConditionStatus, RELEASE_LABEL};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("release missing namespace")]
    MissingNamespace,

    #[error("expected exactly {expected} {kind} matching {selector:?}, got {got}")]
    UnexpectedObjectCount {
        kind: &'static str,
        selector: String,
        expected: usize,
        got: usize,
    },

    #[error("failed to encode patch: {0}")]
    PatchEncoding(#[from] serde_json::Error),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

pub struct Context {
    pub client: Client,
    pub backoff: Backoff,
}

impl Context {
    pub fn new(client: Client) -> Self {
        Context {
            client,
            backoff: Backoff::workqueue_default(),
        }
    }
}

/// Reconcile one release key
///
/// Mutations on an `Installed` release mean its successor is mid-rollout, so
/// those redirect to the contender pointer first. Releases that are not
/// between scheduling and installation have nothing for the executor to do.
pub async fn reconcile(release: Arc<Release>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let namespace = release.namespace().ok_or(ReconcileError::MissingNamespace)?;
    // failures are keyed by the triggering object, which may not be the
    // release we end up working on
    let trigger_key = format!("{namespace}/{}", release.name_any());

    let release = if is_installed(&release) {
        match contender_of(&release) {
            Some(contender_name) => {
                let releases: Api<Release> = Api::namespaced(ctx.client.clone(), &namespace);
                match releases.get_opt(contender_name).await? {
                    Some(contender) => Arc::new(contender),
                    None => {
                        debug!(
                            release = %release.name_any(),
                            contender = contender_name,
                            "Contender pointer is dangling, nothing to do"
                        );
                        return Ok(Action::await_change());
                    }
                }
            }
            None => return Ok(Action::await_change()),
        }
    } else {
        release
    };

    let name = release.name_any();
    let key = format!("{namespace}/{name}");

    if !is_working_on_strategy(&release) {
        debug!(release = %key, "Release is not working on its strategy");
        ctx.backoff.forget(&key);
        return Ok(Action::await_change());
    }

    info!(release = %key, "Executing rollout strategy");

    let contender =
        match build_release_info(&ctx.client, &namespace, release.as_ref().clone()).await {
            Ok(info) => info,
            Err(e) => {
                let ReconcileError::UnexpectedObjectCount { got, .. } = &e else {
                    return Err(e);
                };
                let got = *got;
                surface_release_condition(
                    &ctx.client,
                    &namespace,
                    &release,
                    ReleaseConditionType::Scheduled,
                    "MissingTargetObjects",
                    e.to_string(),
                )
                .await?;
                if got == 0 {
                    // the scheduler may simply not have caught up yet
                    return Err(e);
                }
                // more than one sibling is a configuration error; a retry
                // cannot fix it, only a spec change can
                ctx.backoff.forget(&key);
                return Ok(Action::await_change());
            }
        };

    let incumbent = match incumbent_of(&contender.release) {
        Some(incumbent_name) => {
            build_incumbent_info(&ctx.client, &namespace, incumbent_name).await?
        }
        None => None,
    };

    let results = match executor::execute(&contender, incumbent.as_ref()) {
        Ok(results) => results,
        Err(e @ ExecutorError::NoStrategySteps(_)) => {
            surface_release_condition(
                &ctx.client,
                &namespace,
                &release,
                ReleaseConditionType::StrategyExecuted,
                "InvalidStrategy",
                e.to_string(),
            )
            .await?;
            ctx.backoff.forget(&key);
            return Ok(Action::await_change());
        }
    };

    if results.is_empty() {
        debug!(release = %key, "Strategy executed, nothing to patch");
    }
    for result in &results {
        let request = result.patch()?;
        dispatch::apply(&ctx.client, &namespace, &request).await?;
        info!(
            release = %key,
            target = %request.name,
            kind = %request.gvk.kind,
            "Applied rollout patch"
        );
    }

    ctx.backoff.forget(&key);
    ctx.backoff.forget(&trigger_key);
    Ok(Action::await_change())
}

/// Retry policy for failed reconciles: exponential backoff per release key
pub fn error_policy(release: Arc<Release>, error: &ReconcileError, ctx: Arc<Context>) -> Action {
    let key = format!(
        "{}/{}",
        release.namespace().unwrap_or_default(),
        release.name_any()
    );
    let delay = ctx.backoff.next(&key);
    warn!(
        release = %key,
        error = %error,
        delay_ms = delay.as_millis() as u64,
        "Reconcile failed, backing off"
    );
    Action::requeue(delay)
}

/// Run the strategy controller until the shutdown signal fires
///
/// `threadiness` workers share one deduplicated queue; the runtime keeps at
/// most one reconcile in flight per release key.
pub async fn run(ctx: Arc<Context>, threadiness: u16, shutdown: crate::shutdown::ShutdownSignal) {
    let releases: Api<Release> = Api::all(ctx.client.clone());
    let installations: Api<InstallationTarget> = Api::all(ctx.client.clone());
    let capacities: Api<CapacityTarget> = Api::all(ctx.client.clone());
    let traffics: Api<TrafficTarget> = Api::all(ctx.client.clone());

    Controller::new(releases, watcher::Config::default())
        .with_config(Config::default().concurrency(threadiness))
        .watches(installations, watcher::Config::default(), sibling_release)
        .watches(capacities, watcher::Config::default(), sibling_release)
        .watches(traffics, watcher::Config::default(), sibling_release)
        .graceful_shutdown_on(shutdown.wait())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((release, _)) => debug!(release = %release, "Reconciled"),
                Err(e) => error!(error = %e, "Controller runtime error"),
            }
        })
        .await;

    info!("Strategy controller stopped");
}

/// A target object's release shares its name and namespace
fn sibling_release<K: Resource>(obj: K) -> Option<ObjectRef<Release>> {
    let name = obj.meta().name.as_deref()?;
    let namespace = obj.meta().namespace.as_deref()?;
    Some(ObjectRef::new(name).within(namespace))
}

/// Fetch the installation/capacity/traffic triplet for a release name
///
/// Each sibling is selected by the `release` label and must match exactly
/// once; anything else is an unexpected-count error.
pub async fn target_objects_for_release(
    client: &Client,
    namespace: &str,
    release_name: &str,
) -> Result<(InstallationTarget, TrafficTarget, CapacityTarget), ReconcileError> {
    let selector = format!("{RELEASE_LABEL}={release_name}");
    let params = ListParams::default().labels(&selector);

    let installations: Api<InstallationTarget> = Api::namespaced(client.clone(), namespace);
    let installation = exactly_one(
        installations.list(&params).await?.items,
        "InstallationTarget",
        &selector,
    )?;

    let traffics: Api<TrafficTarget> = Api::namespaced(client.clone(), namespace);
    let traffic = exactly_one(traffics.list(&params).await?.items, "TrafficTarget", &selector)?;

    let capacities: Api<CapacityTarget> = Api::namespaced(client.clone(), namespace);
    let capacity = exactly_one(
        capacities.list(&params).await?.items,
        "CapacityTarget",
        &selector,
    )?;

    Ok((installation, traffic, capacity))
}

fn exactly_one<T>(
    mut items: Vec<T>,
    kind: &'static str,
    selector: &str,
) -> Result<T, ReconcileError> {
    if items.len() == 1 {
        Ok(items.remove(0))
    } else {
        Err(ReconcileError::UnexpectedObjectCount {
            kind,
            selector: selector.to_string(),
            expected: 1,
            got: items.len(),
        })
    }
}

/// Group a release with its target triplet into an executor snapshot
async fn build_release_info(
    client: &Client,
    namespace: &str,
    release: Release,
) -> Result<ReleaseInfo, ReconcileError> {
    let (installation_target, traffic_target, capacity_target) =
        target_objects_for_release(client, namespace, &release.name_any()).await?;

    Ok(ReleaseInfo {
        release,
        installation_target,
        capacity_target,
        traffic_target,
    })
}

/// Snapshot the incumbent, treating a dangling pointer as "no incumbent"
async fn build_incumbent_info(
    client: &Client,
    namespace: &str,
    incumbent_name: &str,
) -> Result<Option<ReleaseInfo>, ReconcileError> {
    let releases: Api<Release> = Api::namespaced(client.clone(), namespace);
    match releases.get_opt(incumbent_name).await? {
        Some(incumbent) => Ok(Some(
            build_release_info(client, namespace, incumbent).await?,
        )),
        None => {
            debug!(incumbent = incumbent_name, "Incumbent pointer is dangling");
            Ok(None)
        }
    }
}

/// Write a single condition onto a release status, skipping no-op diffs
async fn surface_release_condition(
    client: &Client,
    namespace: &str,
    release: &Release,
    condition_type: ReleaseConditionType,
    reason: &str,
    message: String,
) -> Result<(), kube::Error> {
    let mut status: ReleaseStatus = release.status.clone().unwrap_or_default();
    let diff = set_condition(
        &mut status.conditions,
        new_condition(condition_type, ConditionStatus::False, reason, message),
    );
    let Some(diff) = diff else {
        return Ok(());
    };

    info!(release = %release.name_any(), transition = %diff, "Updating release condition");

    let releases: Api<Release> = Api::namespaced(client.clone(), namespace);
    releases
        .patch_status(
            &release.name_any(),
            &kube::api::PatchParams::default(),
            &kube::api::Patch::Merge(serde_json::json!({ "status": status })),
        )
        .await?;
    Ok(())
}
