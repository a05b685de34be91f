//! Reconciliation driver
//!
//! A pass runs setup first, then the stage belonging to the trial's phase. A stage
//! either finishes the pass (it wrote something, or asked for a delay) or has nothing
//! to do, in which case the next stage gets a look. At most one write happens per pass.

use kube::ResourceExt;
use tracing::debug;
use trial_api::{Trial, TrialPhase};

use crate::context::{Context, Outcome, Pass};
use crate::error::ReconcileError;
use crate::{job, metric, patch, setup, stability};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stage {
    Evaluate,
    Apply,
    Wait,
    RunJob,
    Observe,
}

impl Stage {
    const ALL: [Stage; 5] = [
        Stage::Evaluate,
        Stage::Apply,
        Stage::Wait,
        Stage::RunJob,
        Stage::Observe,
    ];

    fn first(phase: TrialPhase) -> Option<Self> {
        match phase {
            TrialPhase::Created => Some(Stage::Evaluate),
            TrialPhase::Patching => Some(Stage::Apply),
            TrialPhase::Stabilizing => Some(Stage::Wait),
            TrialPhase::Running => Some(Stage::RunJob),
            TrialPhase::Observing => Some(Stage::Observe),
            TrialPhase::Complete | TrialPhase::Failed => None,
        }
    }

    async fn run(self, pass: &Pass<'_>, trial: &mut Trial) -> Result<Option<Outcome>, ReconcileError> {
        match self {
            Stage::Evaluate => patch::evaluate(pass, trial).await,
            Stage::Apply => patch::apply(pass, trial).await,
            Stage::Wait => stability::wait(pass, trial).await,
            Stage::RunJob => job::manage(pass, trial).await,
            Stage::Observe => metric::observe(pass, trial).await,
        }
    }
}

/// Run one reconciliation pass for a trial
///
/// The trial is not modified in place; the written copy is sent to the cluster.
///
/// # Errors
///
/// Returns an error when a cluster call fails or the experiment is missing. No
/// write has happened in that case.
pub async fn reconcile(trial: &Trial, ctx: &Context) -> Result<Outcome, ReconcileError> {
    let mut trial = trial.clone();
    let pass = Pass::new(ctx, &trial);
    debug!(trial = %trial.name_any(), phase = %pass.phase, "Reconciling trial");

    if let Some(outcome) = setup::manage(&pass, &mut trial).await? {
        return Ok(outcome);
    }
    if trial.is_finished() || trial.is_deleting() {
        return Ok(Outcome::Idle);
    }

    let Some(first) = Stage::first(pass.phase) else {
        return Ok(Outcome::Idle);
    };
    for stage in Stage::ALL.into_iter().filter(|s| *s >= first) {
        if let Some(outcome) = stage.run(&pass, &mut trial).await? {
            return Ok(outcome);
        }
        debug!(trial = %trial.name_any(), ?stage, "Nothing to do");
    }

    Ok(Outcome::RequeueAfter(ctx.config().generic_retry()))
}
