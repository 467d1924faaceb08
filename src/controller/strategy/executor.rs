//! Strategy executor
//!
//! Pure decision core of the rollout: given snapshots of the contender and
//! (optionally) the incumbent, compute the minimal set of patches that moves
//! the rollout one step closer to the declared target step. The executor
//! performs no I/O and never panics; a missing incumbent is a valid state,
//! not an error.

use kube::core::GroupVersionKind;
use kube::ResourceExt;
use serde::Serialize;
use thiserror::Error;

use crate::controller::conditions::{condition_true, new_condition, set_condition};
use crate::crd::release::{
    Release, ReleaseConditionType, ReleasePhase, ReleaseStatus, RolloutStrategyStep,
};
use crate::crd::targets::{
    CapacityTarget, CapacityTargetSpec, ClusterCapacityTarget, ClusterTrafficTarget,
    InstallationTarget, TargetConditionType, TrafficTarget, TrafficTargetSpec,
};
use crate::crd::{ConditionStatus, GROUP, VERSION};

/// Immutable view of one release and its target triplet
///
/// Built fresh for every reconcile and discarded afterwards; the executor
/// only ever sees the world through one of these.
pub struct ReleaseInfo {
    pub release: Release,
    pub installation_target: InstallationTarget,
    pub capacity_target: CapacityTarget,
    pub traffic_target: TrafficTarget,
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("release {0:?} declares a strategy with no steps")]
    NoStrategySteps(String),
}

/// One patch the executor wants applied
///
/// Tagged by target kind so the dispatcher can pick the right endpoint per
/// variant (spec patches go to the resource, release patches to the status
/// subresource).
#[derive(Debug)]
pub enum ExecutorResult {
    CapacitySpec(CapacitySpecPatch),
    TrafficSpec(TrafficSpecPatch),
    ReleaseStatus(ReleaseStatusPatch),
}

#[derive(Debug)]
pub struct CapacitySpecPatch {
    pub name: String,
    pub spec: CapacityTargetSpec,
}

#[derive(Debug)]
pub struct TrafficSpecPatch {
    pub name: String,
    pub spec: TrafficTargetSpec,
}

#[derive(Debug)]
pub struct ReleaseStatusPatch {
    pub name: String,
    pub status: ReleaseStatus,
}

/// A patch ready for the dynamic dispatcher
pub struct PatchRequest {
    pub name: String,
    pub gvk: GroupVersionKind,
    /// JSON merge-patch body
    pub bytes: Vec<u8>,
    /// Route through the status subresource instead of the resource itself
    pub status_subresource: bool,
}

#[derive(Serialize)]
struct SpecPatchBody<'a, T: Serialize> {
    spec: &'a T,
}

#[derive(Serialize)]
struct StatusPatchBody<'a, T: Serialize> {
    status: &'a T,
}

impl ExecutorResult {
    pub fn patch(&self) -> Result<PatchRequest, serde_json::Error> {
        match self {
            ExecutorResult::CapacitySpec(p) => Ok(PatchRequest {
                name: p.name.clone(),
                gvk: GroupVersionKind::gvk(GROUP, VERSION, "CapacityTarget"),
                bytes: serde_json::to_vec(&SpecPatchBody { spec: &p.spec })?,
                status_subresource: false,
            }),
            ExecutorResult::TrafficSpec(p) => Ok(PatchRequest {
                name: p.name.clone(),
                gvk: GroupVersionKind::gvk(GROUP, VERSION, "TrafficTarget"),
                bytes: serde_json::to_vec(&SpecPatchBody { spec: &p.spec })?,
                status_subresource: false,
            }),
            ExecutorResult::ReleaseStatus(p) => Ok(PatchRequest {
                name: p.name.clone(),
                gvk: GroupVersionKind::gvk(GROUP, VERSION, "Release"),
                bytes: serde_json::to_vec(&StatusPatchBody { status: &p.status })?,
                status_subresource: true,
            }),
        }
    }
}

/// Where one side of the rollout stands relative to a step declaration
enum SideState<S> {
    /// The target's spec disagrees with the declaration; patch it
    NeedsPatch(S),
    /// The spec is right but observation has not caught up; wait
    Waiting(String),
    Converged,
}

/// Compute the patches that advance the rollout one reconcile
///
/// Decision order: installation gate, capacity phase, traffic phase, step
/// completion. Each phase either emits spec patches, reports a waiting
/// reason through the `Strategy` condition, or passes the decision on. At a
/// converged target step the release status advances and, on the final
/// step, the incumbent is retired.
pub fn execute(
    contender: &ReleaseInfo,
    incumbent: Option<&ReleaseInfo>,
) -> Result<Vec<ExecutorResult>, ExecutorError> {
    let steps = &contender.release.spec.strategy.steps;
    if steps.is_empty() {
        return Err(ExecutorError::NoStrategySteps(contender.release.name_any()));
    }

    // 1. installation gate
    if let Some(cluster) = pending_installation_cluster(&contender.installation_target) {
        let mut status = release_status(&contender.release);
        let mut changed = false;
        changed |= set_condition(
            &mut status.conditions,
            new_condition(
                ReleaseConditionType::StrategyExecuted,
                ConditionStatus::False,
                "StrategyExecutionFailed",
                format!("cluster {cluster:?} is not ready for installation"),
            ),
        )
        .is_some();
        changed |= set_condition(
            &mut status.conditions,
            new_condition(
                ReleaseConditionType::Strategy,
                ConditionStatus::False,
                "WaitingForInstallation",
                format!("waiting for installation to complete in cluster {cluster:?}"),
            ),
        )
        .is_some();

        return Ok(status_patch_if(changed, &contender.release, status));
    }

    // 2. active step, clamped to the strategy bounds
    let last_step = steps.len() - 1;
    let target_step = (contender.release.spec.target_step as usize).min(last_step);
    let step = &steps[target_step];

    // 3. capacity phase
    let mut results = Vec::new();
    let mut waiting_on = None;

    check_capacity(contender, step.capacity.contender, &mut results, &mut waiting_on);
    if let Some(incumbent) = incumbent {
        check_capacity(incumbent, step.capacity.incumbent, &mut results, &mut waiting_on);
    }
    if !results.is_empty() || waiting_on.is_some() {
        let message = waiting_on
            .unwrap_or_else(|| "adjusting capacity target specs".to_string());
        append_strategy_condition(
            &mut results,
            &contender.release,
            "WaitingForCapacity",
            message,
        );
        return Ok(results);
    }

    // 4. traffic phase, only once capacity has converged
    check_traffic(contender, step.traffic.contender, &mut results, &mut waiting_on);
    if let Some(incumbent) = incumbent {
        check_traffic(incumbent, step.traffic.incumbent, &mut results, &mut waiting_on);
    }
    if !results.is_empty() || waiting_on.is_some() {
        let message = waiting_on
            .unwrap_or_else(|| "adjusting traffic target specs".to_string());
        append_strategy_condition(
            &mut results,
            &contender.release,
            "WaitingForTraffic",
            message,
        );
        return Ok(results);
    }

    // 5. step completion
    let mut status = release_status(&contender.release);
    let mut changed = false;

    let achieved = status.achieved_step.unwrap_or(0).max(target_step as u32);
    if status.achieved_step != Some(achieved) {
        status.achieved_step = Some(achieved);
        changed = true;
    }

    changed |= set_condition(
        &mut status.conditions,
        new_condition(
            ReleaseConditionType::StrategyExecuted,
            ConditionStatus::True,
            "StepComplete",
            step_label(step, target_step),
        ),
    )
    .is_some();
    changed |= set_condition(
        &mut status.conditions,
        new_condition(
            ReleaseConditionType::Strategy,
            ConditionStatus::True,
            "Complete",
            String::new(),
        ),
    )
    .is_some();

    let phase = if target_step < last_step {
        ReleasePhase::WaitingForCommand
    } else {
        ReleasePhase::Installed
    };
    if status.phase != Some(phase) {
        status.phase = Some(phase);
        changed = true;
    }
    if phase == ReleasePhase::Installed {
        changed |= set_condition(
            &mut status.conditions,
            new_condition(
                ReleaseConditionType::Complete,
                ConditionStatus::True,
                String::new(),
                String::new(),
            ),
        )
        .is_some();
    }

    let mut results = status_patch_if(changed, &contender.release, status);

    // 6. final step installed: the incumbent is fully drained, retire it
    if phase == ReleasePhase::Installed {
        if let Some(incumbent) = incumbent {
            let mut incumbent_status = release_status(&incumbent.release);
            if incumbent_status.phase != Some(ReleasePhase::Aborted) {
                incumbent_status.phase = Some(ReleasePhase::Aborted);
                results.push(ExecutorResult::ReleaseStatus(ReleaseStatusPatch {
                    name: incumbent.release.name_any(),
                    status: incumbent_status,
                }));
            }
        }
    }

    Ok(results)
}

/// First declared cluster whose installation is not Operational and Ready
fn pending_installation_cluster(target: &InstallationTarget) -> Option<String> {
    target.spec.clusters.iter().find_map(|cluster| {
        let ready = target
            .status
            .as_ref()
            .and_then(|s| s.cluster(cluster))
            .map(|cs| {
                condition_true(&cs.conditions, &TargetConditionType::Operational)
                    && condition_true(&cs.conditions, &TargetConditionType::Ready)
            })
            .unwrap_or(false);
        (!ready).then(|| cluster.clone())
    })
}

fn check_capacity(
    info: &ReleaseInfo,
    percent: u32,
    results: &mut Vec<ExecutorResult>,
    waiting_on: &mut Option<String>,
) {
    match capacity_state(&info.capacity_target, percent) {
        SideState::NeedsPatch(spec) => {
            results.push(ExecutorResult::CapacitySpec(CapacitySpecPatch {
                name: info.capacity_target.name_any(),
                spec,
            }));
        }
        SideState::Waiting(detail) => {
            waiting_on.get_or_insert_with(|| {
                format!("release {:?}: {detail}", info.release.name_any())
            });
        }
        SideState::Converged => {}
    }
}

fn check_traffic(
    info: &ReleaseInfo,
    weight: u32,
    results: &mut Vec<ExecutorResult>,
    waiting_on: &mut Option<String>,
) {
    match traffic_state(&info.traffic_target, weight) {
        SideState::NeedsPatch(spec) => {
            results.push(ExecutorResult::TrafficSpec(TrafficSpecPatch {
                name: info.traffic_target.name_any(),
                spec,
            }));
        }
        SideState::Waiting(detail) => {
            waiting_on.get_or_insert_with(|| {
                format!("release {:?}: {detail}", info.release.name_any())
            });
        }
        SideState::Converged => {}
    }
}

fn capacity_state(target: &CapacityTarget, percent: u32) -> SideState<CapacityTargetSpec> {
    // Patching a spec that already matches would churn every resync.
    if target.spec.clusters.iter().any(|c| c.percent != percent) {
        let spec = CapacityTargetSpec {
            clusters: target
                .spec
                .clusters
                .iter()
                .map(|c| ClusterCapacityTarget {
                    name: c.name.clone(),
                    percent,
                })
                .collect(),
        };
        return SideState::NeedsPatch(spec);
    }

    for cluster in &target.spec.clusters {
        match target.status.as_ref().and_then(|s| s.cluster(&cluster.name)) {
            Some(observed) if observed.achieved_percent == percent => {}
            Some(observed) => {
                return SideState::Waiting(format!(
                    "cluster {:?} achieved {}% capacity ({} replicas available), want {}%",
                    cluster.name, observed.achieved_percent, observed.available_replicas, percent,
                ));
            }
            None => {
                return SideState::Waiting(format!(
                    "cluster {:?} has not reported capacity yet",
                    cluster.name,
                ));
            }
        }
    }

    SideState::Converged
}

fn traffic_state(target: &TrafficTarget, weight: u32) -> SideState<TrafficTargetSpec> {
    if target.spec.clusters.iter().any(|c| c.weight != weight) {
        let spec = TrafficTargetSpec {
            clusters: target
                .spec
                .clusters
                .iter()
                .map(|c| ClusterTrafficTarget {
                    name: c.name.clone(),
                    weight,
                })
                .collect(),
        };
        return SideState::NeedsPatch(spec);
    }

    for cluster in &target.spec.clusters {
        match target.status.as_ref().and_then(|s| s.cluster(&cluster.name)) {
            Some(observed) if observed.achieved_traffic == weight => {}
            Some(observed) => {
                return SideState::Waiting(format!(
                    "cluster {:?} achieved traffic weight {}, want {}",
                    cluster.name, observed.achieved_traffic, weight,
                ));
            }
            None => {
                return SideState::Waiting(format!(
                    "cluster {:?} has not reported traffic yet",
                    cluster.name,
                ));
            }
        }
    }

    SideState::Converged
}

/// Update the contender's `Strategy` condition alongside whatever spec
/// patches this pass produced; a no-op condition write emits nothing
fn append_strategy_condition(
    results: &mut Vec<ExecutorResult>,
    release: &Release,
    reason: &str,
    message: String,
) {
    let mut status = release_status(release);
    let diff = set_condition(
        &mut status.conditions,
        new_condition(
            ReleaseConditionType::Strategy,
            ConditionStatus::False,
            reason,
            message,
        ),
    );
    if diff.is_some() {
        results.push(ExecutorResult::ReleaseStatus(ReleaseStatusPatch {
            name: release.name_any(),
            status,
        }));
    }
}

fn release_status(release: &Release) -> ReleaseStatus {
    release.status.clone().unwrap_or_default()
}

fn status_patch_if(changed: bool, release: &Release, status: ReleaseStatus) -> Vec<ExecutorResult> {
    if changed {
        vec![ExecutorResult::ReleaseStatus(ReleaseStatusPatch {
            name: release.name_any(),
            status,
        })]
    } else {
        Vec::new()
    }
}

fn step_label(step: &RolloutStrategyStep, index: usize) -> String {
    match &step.name {
        Some(name) => format!("step {index} ({name}) complete"),
        None => format!("step {index} complete"),
    }
}

#[cfg(test)]
#[path = "executor_test.rs"]
mod tests;
