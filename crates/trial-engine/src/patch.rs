//! Patch evaluation and application
//!
//! Patch templates are rendered once per trial into `PatchOperation`s stored on the
//! trial spec. Operations are then applied one per pass, in order, each with its own
//! retry budget.

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use serde::Deserialize;
use tracing::{debug, info, warn};
use trial_api::{
    BudgetState, ConditionStatus, ConditionType, Experiment, PatchOperation, PatchTemplate,
    PatchType, RetryBudget, Trial,
};

use crate::context::{Outcome, Pass};
use crate::error::ReconcileError;

/// Patch template that can never produce an operation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    /// The template did not render
    #[error("{0}")]
    Render(String),

    /// Neither the template nor the patch names a target
    #[error("invalid patch reference")]
    NoTarget,
}

/// Object identity carried by a strategic merge patch
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SelfReference {
    #[serde(default)]
    api_version: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    metadata: SelfMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct SelfMetadata {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    namespace: Option<String>,
}

/// Target named by a template, before any selector lookup
///
/// An explicit reference wins. A strategic patch without one may identify its own
/// target through `apiVersion`, `kind` and `metadata`. A target without a name must
/// come with a non-empty selector.
///
/// # Errors
///
/// Returns [`PatchError::NoTarget`] when no kind can be determined, or when neither a
/// name nor a selector narrows the target down.
pub fn template_target(
    template: &PatchTemplate,
    data: &str,
    namespace: &str,
) -> Result<ObjectReference, PatchError> {
    let mut target = match &template.target_ref {
        Some(r) => r.clone(),
        None if template.patch_type == PatchType::Strategic && !data.is_empty() => {
            let own: SelfReference = serde_json::from_str(data).unwrap_or_default();
            ObjectReference {
                api_version: own.api_version,
                kind: own.kind,
                name: own.metadata.name,
                namespace: own.metadata.namespace,
                ..Default::default()
            }
        }
        None => return Err(PatchError::NoTarget),
    };

    if target.kind.as_deref().unwrap_or_default().is_empty() {
        return Err(PatchError::NoTarget);
    }
    let named = target.name.as_deref().is_some_and(|n| !n.is_empty());
    if !named && !template.selector.as_ref().is_some_and(selects_something) {
        return Err(PatchError::NoTarget);
    }
    if target.namespace.as_deref().unwrap_or_default().is_empty() {
        target.namespace = Some(namespace.to_owned());
    }
    Ok(target)
}

fn selects_something(selector: &LabelSelector) -> bool {
    selector.match_labels.as_ref().is_some_and(|l| !l.is_empty())
        || selector.match_expressions.as_ref().is_some_and(|e| !e.is_empty())
}

/// Operation for one target
#[must_use]
pub fn operation(target: ObjectReference, patch_type: PatchType, data: String, attempts: u32) -> PatchOperation {
    // An empty patch only waits for the target to settle
    let budget = if data.is_empty() {
        RetryBudget::spent()
    } else {
        RetryBudget::new(attempts)
    };
    PatchOperation {
        target_ref: target,
        patch_type,
        data,
        budget,
        wait: true,
    }
}

/// Names of experiment parameters the trial has no assignment for
#[must_use]
pub fn missing_assignments(trial: &Trial, experiment: &Experiment) -> Vec<String> {
    let mut missing = Vec::new();
    for p in &experiment.spec.parameters {
        match trial.assignment(&p.name) {
            Some(value) if !p.contains(value) => {
                info!(trial = %trial.name_any(), parameter = %p.name, value, min = p.min, max = p.max, "Assignment out of bounds");
            }
            Some(_) => {}
            None => missing.push(p.name.clone()),
        }
    }
    missing
}

/// Derive the trial's patch operations, once
pub(crate) async fn evaluate(pass: &Pass<'_>, trial: &mut Trial) -> Result<Option<Outcome>, ReconcileError> {
    if !trial.spec.patch_operations.is_empty() || trial.condition_status(ConditionType::Patched).is_some() {
        return Ok(None);
    }
    let experiment = pass.experiment(trial).await?;
    let now = pass.now;

    let missing = missing_assignments(trial, experiment);
    if !missing.is_empty() {
        let message = format!(
            "trial {} is missing assignments for {}",
            trial.name_any(),
            missing.join(", ")
        );
        warn!(trial = %trial.name_any(), %message, "Invalid assignments");
        trial.fail("InvalidAssignments", &message, now);
        return pass.commit(trial).await.map(Some);
    }

    let mut operations = Vec::new();
    for template in &experiment.spec.patches {
        match derive(pass, trial, experiment, template).await? {
            Ok(mut ops) => operations.append(&mut ops),
            Err(e) => {
                warn!(trial = %trial.name_any(), error = %e, "Invalid patch");
                trial.fail("InvalidPatch", &e.to_string(), now);
                return pass.commit(trial).await.map(Some);
            }
        }
    }

    // Patched records that derivation ran, even for experiments without patches
    let status = if operations.is_empty() {
        ConditionStatus::True
    } else {
        ConditionStatus::Unknown
    };
    info!(trial = %trial.name_any(), count = operations.len(), "Evaluated patches");
    trial.spec.patch_operations = operations;
    trial.apply_condition(ConditionType::Patched, status, None, None, now);
    pass.commit(trial).await.map(Some)
}

async fn derive(
    pass: &Pass<'_>,
    trial: &Trial,
    experiment: &Experiment,
    template: &PatchTemplate,
) -> Result<Result<Vec<PatchOperation>, PatchError>, ReconcileError> {
    let data = match pass.ctx.templates.render_patch(&template.patch, trial, experiment) {
        Ok(data) => data,
        Err(e) => return Ok(Err(PatchError::Render(e.to_string()))),
    };
    let target = match template_target(template, &data, &trial.target_namespace()) {
        Ok(target) => target,
        Err(e) => return Ok(Err(e)),
    };
    let attempts = pass.config().patch_attempts;

    if target.name.as_deref().is_some_and(|n| !n.is_empty()) {
        return Ok(Ok(vec![operation(target, template.patch_type, data, attempts)]));
    }

    let namespace = target.namespace.clone().unwrap_or_default();
    let api_version = target.api_version.clone().unwrap_or_else(|| "v1".to_owned());
    let kind = target.kind.clone().unwrap_or_default();
    let selector = template.selector.clone().unwrap_or_default();
    let targets = pass
        .cluster()
        .list_references(&namespace, &api_version, &kind, &selector)
        .await?;
    debug!(%kind, %namespace, count = targets.len(), "Resolved patch targets by selector");

    Ok(Ok(targets
        .into_iter()
        .map(|t| operation(t, template.patch_type, data.clone(), attempts))
        .collect()))
}

/// Apply the first pending operation, or settle `Patched` once none remain
pub(crate) async fn apply(pass: &Pass<'_>, trial: &mut Trial) -> Result<Option<Outcome>, ReconcileError> {
    let now = pass.now;
    let Some(index) = trial
        .spec
        .patch_operations
        .iter()
        .position(|op| op.budget.is_pending())
    else {
        return settle(pass, trial).await;
    };

    let result = {
        let op = &trial.spec.patch_operations[index];
        pass.cluster().patch(&op.target_ref, op.patch_type, &op.data).await
    };

    let op = &mut trial.spec.patch_operations[index];
    let target = format!(
        "{}/{}",
        op.target_ref.kind.as_deref().unwrap_or_default(),
        op.target_ref.name.as_deref().unwrap_or_default()
    );
    let mut failure = None;
    let mut waits = false;
    match result {
        Ok(()) => {
            op.budget.succeed();
            waits = op.wait;
            info!(%target, patch_type = %op.patch_type, "Applied patch");
        }
        Err(e) => {
            let message = e.to_string();
            match op.budget.fail(message.clone()) {
                BudgetState::Retry => {
                    warn!(%target, error = %message, remaining = op.budget.attempts_remaining, "Patch failed");
                }
                BudgetState::Exhausted => {
                    warn!(%target, error = %message, "Patch attempts exhausted");
                    failure = Some(message);
                }
            }
        }
    }

    if let Some(message) = failure {
        trial.fail("PatchFailed", &message, now);
    }
    if waits {
        trial.apply_condition(ConditionType::Stable, ConditionStatus::Unknown, None, None, now);
    }
    trial.apply_condition(ConditionType::Patched, ConditionStatus::False, None, None, now);
    pass.commit(trial).await.map(Some)
}

async fn settle(pass: &Pass<'_>, trial: &mut Trial) -> Result<Option<Outcome>, ReconcileError> {
    match trial.condition_status(ConditionType::Patched) {
        Some(status) if status != ConditionStatus::True => {
            trial.apply_condition(ConditionType::Patched, ConditionStatus::True, None, None, pass.now);
            pass.commit(trial).await.map(Some)
        }
        _ => Ok(None),
    }
}
