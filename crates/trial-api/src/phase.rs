//! Trial lifecycle state machine
//!
//! The condition list is what clients see; internally a trial is always in exactly one
//! `TrialPhase`, derived from its conditions and bookkeeping. Reconciliation only ever
//! moves a trial forward through the phases, or to `Failed`.

use std::fmt;
use thiserror::Error;

use crate::condition::{ConditionStatus, ConditionType};
use crate::trial::Trial;

/// Lifecycle phase of a trial
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TrialPhase {
    /// Patch operations have not been derived yet
    Created,
    /// Patch operations are being applied
    Patching,
    /// Waiting for patched targets to roll out
    Stabilizing,
    /// The trial job is running
    Running,
    /// Collecting metric values
    Observing,
    /// Every metric was observed
    Complete,
    /// The trial can never complete
    Failed,
}

/// Illegal phase change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal trial phase transition: {from} -> {to}")]
pub struct PhaseError {
    /// Phase before the change
    pub from: TrialPhase,
    /// Phase after the change
    pub to: TrialPhase,
}

impl TrialPhase {
    /// Derive the phase of a trial
    #[must_use]
    pub fn of(trial: &Trial) -> Self {
        let status = |t| trial.condition_status(t);
        let is_true = |t| status(t) == Some(ConditionStatus::True);
        let open = |t| status(t).is_some_and(|s| s != ConditionStatus::True);

        if is_true(ConditionType::Failed) {
            return TrialPhase::Failed;
        }
        if is_true(ConditionType::Complete) {
            return TrialPhase::Complete;
        }

        let ops = &trial.spec.patch_operations;
        if ops.is_empty() && status(ConditionType::Patched).is_none() {
            return TrialPhase::Created;
        }
        if ops.iter().any(|op| op.budget.is_pending()) || open(ConditionType::Patched) {
            return TrialPhase::Patching;
        }
        if ops.iter().any(|op| op.wait) || open(ConditionType::Stable) {
            return TrialPhase::Stabilizing;
        }

        let completed = trial
            .status
            .as_ref()
            .is_some_and(|s| s.completion_time.is_some());
        if completed {
            TrialPhase::Observing
        } else {
            TrialPhase::Running
        }
    }

    /// Whether the phase is terminal
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, TrialPhase::Complete | TrialPhase::Failed)
    }
}

impl fmt::Display for TrialPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Phases reachable from `from` within a single reconciliation pass
#[must_use]
pub fn allowed_transitions(from: TrialPhase) -> Vec<TrialPhase> {
    use TrialPhase::*;
    match from {
        Created => vec![Created, Patching, Stabilizing, Running, Observing, Complete, Failed],
        Patching => vec![Patching, Stabilizing, Running, Observing, Complete, Failed],
        Stabilizing => vec![Stabilizing, Running, Observing, Complete, Failed],
        Running => vec![Running, Observing, Complete, Failed],
        Observing => vec![Observing, Complete, Failed],
        Complete => vec![Complete],
        Failed => vec![Failed],
    }
}

/// Validate a phase change
///
/// # Errors
///
/// Returns [`PhaseError`] when `to` is not reachable from `from`.
pub fn validate_transition(from: TrialPhase, to: TrialPhase) -> Result<(), PhaseError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(PhaseError { from, to })
    }
}
