//! API types for the convoy.io group
//!
//! Four custom resources make up a rollout: a `Release` and its three
//! same-named target objects (`InstallationTarget`, `CapacityTarget`,
//! `TrafficTarget`). Everything else the controller touches is core
//! Kubernetes (pods, services).

pub mod release;
pub mod targets;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group for all convoy resources
pub const GROUP: &str = "convoy.io";

/// API version for all convoy resources
pub const VERSION: &str = "v1alpha1";

/// Label carrying the application name, present on every rollout object and
/// on workload pods/services
pub const APP_LABEL: &str = "app";

/// Label carrying the release name, present on pods and on target objects
pub const RELEASE_LABEL: &str = "release";

/// Label carrying the load-balancer role on services
pub const LB_LABEL: &str = "lb";

/// `lb` label value that selects the production service
pub const LB_PRODUCTION: &str = "production";

/// Pod label flipped by the traffic shifter
pub const POD_TRAFFIC_STATUS_LABEL: &str = "traffic-status";

/// `traffic-status` value for pods included in the production selector
pub const TRAFFIC_ENABLED: &str = "enabled";

/// `traffic-status` value for pods excluded from the production selector
pub const TRAFFIC_DISABLED: &str = "disabled";

/// Annotation on a release naming the newer release supplanting it
pub const CONTENDER_ANNOTATION: &str = "convoy.io/contender";

/// Annotation on a release naming the older release it supplants
pub const INCUMBENT_ANNOTATION: &str = "convoy.io/incumbent";

/// Annotation carrying the monotonic release generation within an application
pub const GENERATION_ANNOTATION: &str = "convoy.io/generation";

/// Status of a typed condition
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// One typed condition in an object's status
///
/// Condition sets are keyed by `type`: each status carries at most one
/// condition per type, and the list stays sorted by type. The merge rules
/// live in [`crate::controller::conditions`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct Condition<T> {
    #[serde(rename = "type")]
    pub condition_type: T,

    pub status: ConditionStatus,

    /// RFC 3339 timestamp of the last `status` change; preserved when only
    /// `reason` or `message` change
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}
