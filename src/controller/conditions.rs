//! Condition algebra shared by every convoy status
//!
//! Conditions merge by type: setting a condition replaces the stored one of
//! the same type, preserves `lastTransitionTime` when only reason or message
//! changed, and keeps the list sorted by type so status diffs stay stable.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;

use crate::crd::{Condition, ConditionStatus};

static DISCARD_TIMESTAMPS: AtomicBool = AtomicBool::new(false);

/// Suppress timestamps on newly built conditions
///
/// Tests flip this on so condition sets compare deterministically.
pub fn set_discard_timestamps(discard: bool) {
    DISCARD_TIMESTAMPS.store(discard, Ordering::SeqCst);
}

/// Build a condition stamped with the current time
pub fn new_condition<T>(
    condition_type: T,
    status: ConditionStatus,
    reason: impl Into<String>,
    message: impl Into<String>,
) -> Condition<T> {
    let last_transition_time = if DISCARD_TIMESTAMPS.load(Ordering::SeqCst) {
        None
    } else {
        Some(Utc::now().to_rfc3339())
    };

    Condition {
        condition_type,
        status,
        last_transition_time,
        reason: reason.into(),
        message: message.into(),
    }
}

/// Human-readable transition produced by [`set_condition`]
///
/// Renders as `[old] -> [new]`, with an empty `[]` side when the condition
/// was absent before.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionDiff {
    old: String,
    new: String,
}

impl fmt::Display for ConditionDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] -> [{}]", self.old, self.new)
    }
}

/// Merge one condition into a condition set
///
/// Returns `None` when the stored condition already agrees on type, status,
/// reason and message; otherwise replaces it and returns the transition. The
/// transition time carries over whenever `status` is unchanged.
pub fn set_condition<T>(
    conditions: &mut Vec<Condition<T>>,
    mut condition: Condition<T>,
) -> Option<ConditionDiff>
where
    T: Clone + Ord + fmt::Debug,
{
    let current = get_condition(conditions, &condition.condition_type).cloned();

    if let Some(ref current) = current {
        if current.status == condition.status
            && current.reason == condition.reason
            && current.message == condition.message
        {
            return None;
        }
        if current.status == condition.status {
            condition.last_transition_time = current.last_transition_time.clone();
        }
    }

    let diff = ConditionDiff {
        old: current.as_ref().map(render).unwrap_or_default(),
        new: render(&condition),
    };

    conditions.retain(|c| c.condition_type != condition.condition_type);
    conditions.push(condition);
    conditions.sort_by(|a, b| a.condition_type.cmp(&b.condition_type));

    Some(diff)
}

pub fn get_condition<'a, T: PartialEq>(
    conditions: &'a [Condition<T>],
    condition_type: &T,
) -> Option<&'a Condition<T>> {
    conditions.iter().find(|c| &c.condition_type == condition_type)
}

pub fn remove_condition<T: PartialEq>(conditions: &mut Vec<Condition<T>>, condition_type: &T) {
    conditions.retain(|c| &c.condition_type != condition_type);
}

/// True iff the set holds the given condition with status True
pub fn condition_true<T: PartialEq>(conditions: &[Condition<T>], condition_type: &T) -> bool {
    get_condition(conditions, condition_type)
        .map(|c| c.status == ConditionStatus::True)
        .unwrap_or(false)
}

fn render<T: fmt::Debug>(condition: &Condition<T>) -> String {
    let chunks = [
        format!("{:?}", condition.condition_type),
        format!("{:?}", condition.status),
        condition.reason.clone(),
        condition.message.clone(),
    ];
    chunks
        .into_iter()
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
#[path = "conditions_test.rs"]
mod tests;
