//! Trial status conditions
//!
//! Conditions are the external, list-shaped view of a trial's progress. A condition's
//! status only moves forward (`Unknown` → `False` → `True`); attempts to move it back
//! are ignored.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of trial condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ConditionType {
    /// The trial finished and every metric was observed
    Complete,
    /// The trial can never complete
    Failed,
    /// The setup create job finished
    SetupCreated,
    /// The setup delete job finished
    SetupDeleted,
    /// Every patch operation was applied
    Patched,
    /// Every patched target rolled out
    Stable,
    /// Every metric value was captured
    Observed,
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Three-valued condition status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    /// Work for the condition has not been observed yet
    Unknown,
    /// Work is in progress
    False,
    /// Work is done
    True,
}

impl ConditionStatus {
    fn rank(self) -> u8 {
        match self {
            ConditionStatus::Unknown => 0,
            ConditionStatus::False => 1,
            ConditionStatus::True => 2,
        }
    }

    /// Whether moving from `self` to `next` keeps the status non-decreasing
    #[inline]
    #[must_use]
    pub fn can_move_to(self, next: ConditionStatus) -> bool {
        next.rank() >= self.rank()
    }
}

/// One entry of `status.conditions`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrialCondition {
    /// Condition kind
    #[serde(rename = "type")]
    pub type_: ConditionType,
    /// Current status
    pub status: ConditionStatus,
    /// Last time the condition was evaluated
    pub last_probe_time: DateTime<Utc>,
    /// Last time the status changed
    pub last_transition_time: DateTime<Utc>,
    /// Machine readable reason for the last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human readable message for the last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Result of applying a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The condition did not exist and was appended
    Added,
    /// The status changed
    Transitioned,
    /// Same status; only the check time, reason or message were refreshed
    Refreshed,
    /// The change would have moved the status backwards
    Rejected,
}

impl Applied {
    /// Whether the condition list changed in a way worth persisting
    #[inline]
    #[must_use]
    pub fn is_changed(self) -> bool {
        matches!(self, Applied::Added | Applied::Transitioned)
    }
}

/// Apply a condition to a list, following the transition rules
pub(crate) fn apply(
    conditions: &mut Vec<TrialCondition>,
    type_: ConditionType,
    status: ConditionStatus,
    reason: Option<&str>,
    message: Option<&str>,
    now: DateTime<Utc>,
) -> Applied {
    let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) else {
        conditions.push(TrialCondition {
            type_,
            status,
            last_probe_time: now,
            last_transition_time: now,
            reason: reason.map(str::to_owned),
            message: message.map(str::to_owned),
        });
        return Applied::Added;
    };

    if !existing.status.can_move_to(status) {
        return Applied::Rejected;
    }

    existing.last_probe_time = now;
    if existing.status != status {
        existing.status = status;
        existing.reason = reason.map(str::to_owned);
        existing.message = message.map(str::to_owned);
        existing.last_transition_time = now;
        return Applied::Transitioned;
    }

    if existing.reason.as_deref() != reason {
        existing.reason = reason.map(str::to_owned);
        existing.message = message.map(str::to_owned);
    }
    Applied::Refreshed
}
