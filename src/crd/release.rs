use kube::CustomResource;
use kube::Resource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{Condition, ConditionStatus, CONTENDER_ANNOTATION, GENERATION_ANNOTATION, INCUMBENT_ANNOTATION};

/// Release is one revision of an application under rollout
///
/// A release named N implies three sibling objects named N in the same
/// namespace: an InstallationTarget, a CapacityTarget and a TrafficTarget.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "convoy.io",
    version = "v1alpha1",
    kind = "Release",
    namespaced,
    status = "ReleaseStatus",
    printcolumn = r#"{"name":"Target", "type":"integer", "jsonPath":".spec.targetStep"}"#,
    printcolumn = r#"{"name":"Achieved", "type":"integer", "jsonPath":".status.achievedStep"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ReleaseSpec {
    /// Ordered rollout curve for this release
    pub strategy: RolloutStrategy,

    /// Index of the step the rollout should converge on, bumped by a human
    /// or automation; clamped by the executor to the strategy bounds
    #[serde(rename = "targetStep", default)]
    pub target_step: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct RolloutStrategy {
    #[serde(default)]
    pub steps: Vec<RolloutStrategyStep>,
}

/// One point on the rollout curve
///
/// Declares desired capacity percent and traffic weight for the contender,
/// and mirror values for the incumbent being drained.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct RolloutStrategyStep {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Capacity percentages, 0-100
    pub capacity: RolloutStepValues,

    /// Traffic weights, arbitrary units
    pub traffic: RolloutStepValues,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct RolloutStepValues {
    pub contender: u32,
    pub incumbent: u32,
}

/// Lifecycle phase of a Release
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ReleasePhase {
    /// Born; waiting for an upstream scheduler to create the target triplet
    #[default]
    WaitingForScheduling,
    /// Converged on the current step; waiting for targetStep to be bumped
    WaitingForCommand,
    /// Mid-strategy; the executor is driving capacity and traffic
    WaitingForStrategy,
    /// Final step converged and the incumbent fully drained
    Installed,
    /// Superseded by a newer release
    Aborted,
}

/// Condition types carried on a Release status, kept sorted in this order
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, JsonSchema,
)]
pub enum ReleaseConditionType {
    /// The target triplet exists and is owned by this release
    Scheduled,
    /// Why the executor is (or is not) waiting: WaitingForInstallation,
    /// WaitingForCapacity, WaitingForTraffic or Complete
    Strategy,
    /// Outcome of the last executor pass over this release
    StrategyExecuted,
    /// The release reached its final step and was installed
    Complete,
}

pub type ReleaseCondition = Condition<ReleaseConditionType>;

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ReleaseStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<ReleasePhase>,

    /// Highest step the rollout has converged on; never decreases
    #[serde(rename = "achievedStep", skip_serializing_if = "Option::is_none")]
    pub achieved_step: Option<u32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ReleaseCondition>,
}

/// Name of the newer release supplanting this one, if any
pub fn contender_of(release: &Release) -> Option<&str> {
    annotation(release, CONTENDER_ANNOTATION)
}

/// Name of the older release this one supplants, if any
///
/// A dangling or absent pointer means "no incumbent": the first release of an
/// application legitimately has none.
pub fn incumbent_of(release: &Release) -> Option<&str> {
    annotation(release, INCUMBENT_ANNOTATION)
}

/// Monotonic generation of this release within its application
pub fn generation_of(release: &Release) -> Option<u64> {
    annotation(release, GENERATION_ANNOTATION).and_then(|v| v.parse().ok())
}

fn annotation<'a>(release: &'a Release, key: &str) -> Option<&'a str> {
    release
        .meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}

/// True while the release is between "scheduled" and "installed", i.e. the
/// strategy executor has work to do for it
pub fn is_working_on_strategy(release: &Release) -> bool {
    matches!(
        release.status.as_ref().and_then(|s| s.phase),
        Some(ReleasePhase::WaitingForCommand) | Some(ReleasePhase::WaitingForStrategy)
    )
}

pub fn is_installed(release: &Release) -> bool {
    matches!(
        release.status.as_ref().and_then(|s| s.phase),
        Some(ReleasePhase::Installed)
    )
}

pub fn release_scheduled(release: &Release) -> bool {
    has_true_condition(release, ReleaseConditionType::Scheduled)
}

pub fn release_complete(release: &Release) -> bool {
    has_true_condition(release, ReleaseConditionType::Complete)
}

fn has_true_condition(release: &Release, condition_type: ReleaseConditionType) -> bool {
    release
        .status
        .as_ref()
        .map(|s| {
            s.conditions
                .iter()
                .any(|c| c.condition_type == condition_type && c.status == ConditionStatus::True)
        })
        .unwrap_or(false)
}

#[cfg(test)]
#[path = "release_test.rs"]
mod tests;
