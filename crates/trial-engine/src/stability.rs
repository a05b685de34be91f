//! Stability checks
//!
//! These mirror the tests `kubectl rollout status` performs. A check that does not
//! pass either asks for another look after a delay (the object is still rolling out)
//! or reports a terminal problem the rollout cannot recover from.

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ContainerStatus, ObjectReference, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use std::time::Duration;
use tracing::{debug, error, info};
use trial_api::{ConditionStatus, ConditionType, Trial};

use crate::cluster::Workload;
use crate::context::{Outcome, Pass};
use crate::error::{ReconcileError, StabilityError};

const ROLLING_UPDATE: &str = "RollingUpdate";

/// A failed check, before it is attributed to a target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unstable {
    /// Failed check
    pub reason: String,
    /// Delay until the object may converge, `None` if it never will
    pub retry_after: Option<Duration>,
}

impl Unstable {
    fn converging(reason: impl Into<String>, delay: Duration) -> Self {
        Self {
            reason: reason.into(),
            retry_after: Some(delay),
        }
    }

    fn terminal(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retry_after: None,
        }
    }

    /// Attribute the failure to a target
    #[must_use]
    pub fn into_error(self, target: &ObjectReference) -> StabilityError {
        let kind = target.kind.clone().unwrap_or_default();
        let name = target.name.clone().unwrap_or_default();
        match self.retry_after {
            Some(delay) => StabilityError::RetryAfter {
                kind,
                name,
                reason: self.reason,
                delay,
            },
            None => StabilityError::Terminal {
                kind,
                name,
                reason: self.reason,
            },
        }
    }
}

/// Check a deployment rollout
///
/// # Errors
///
/// Returns the first check that does not pass.
pub fn check_deployment(deployment: &Deployment, poll: Duration) -> Result<(), Unstable> {
    let status = deployment.status.clone().unwrap_or_default();
    let generation = deployment.metadata.generation.unwrap_or_default();
    if generation > status.observed_generation.unwrap_or_default() {
        return Err(Unstable::converging("ObservedGeneration", poll));
    }

    let deadline_exceeded = status.conditions.iter().flatten().any(|c| {
        c.type_ == "Progressing" && c.reason.as_deref() == Some("ProgressDeadlineExceeded")
    });
    if deadline_exceeded {
        return Err(Unstable::terminal("ProgressDeadlineExceeded"));
    }

    let updated = status.updated_replicas.unwrap_or_default();
    let desired = deployment.spec.as_ref().and_then(|s| s.replicas);
    if desired.is_some_and(|desired| updated < desired) {
        return Err(Unstable::converging("UpdatedReplicas", poll));
    }
    if status.replicas.unwrap_or_default() > updated {
        return Err(Unstable::converging("Replicas", poll));
    }
    if status.available_replicas.unwrap_or_default() < updated {
        return Err(Unstable::converging("AvailableReplicas", poll));
    }
    Ok(())
}

/// Check a daemon set rollout
///
/// # Errors
///
/// Returns the first check that does not pass; only rolling updates can be checked.
pub fn check_daemon_set(daemon: &DaemonSet, poll: Duration) -> Result<(), Unstable> {
    let strategy = daemon
        .spec
        .as_ref()
        .and_then(|s| s.update_strategy.as_ref())
        .and_then(|s| s.type_.as_deref())
        .unwrap_or(ROLLING_UPDATE);
    if strategy != ROLLING_UPDATE {
        return Err(Unstable::terminal("UpdateStrategy"));
    }

    let status = daemon.status.clone().unwrap_or_default();
    if daemon.metadata.generation.unwrap_or_default() > status.observed_generation.unwrap_or_default() {
        return Err(Unstable::converging("ObservedGeneration", poll));
    }
    if status.updated_number_scheduled.unwrap_or_default() < status.desired_number_scheduled {
        return Err(Unstable::converging("NumberScheduled", poll));
    }
    if status.number_available.unwrap_or_default() < status.desired_number_scheduled {
        return Err(Unstable::converging("NumberAvailable", poll));
    }
    Ok(())
}

/// Check a stateful set rollout
///
/// With a partition only the replicas above it must be updated; without a rolling
/// update configuration the revisions must have converged.
///
/// # Errors
///
/// Returns the first check that does not pass; only rolling updates can be checked.
pub fn check_stateful_set(sts: &StatefulSet, poll: Duration) -> Result<(), Unstable> {
    let spec = sts.spec.clone().unwrap_or_default();
    let strategy = spec.update_strategy.clone().unwrap_or_default();
    if strategy.type_.as_deref().unwrap_or(ROLLING_UPDATE) != ROLLING_UPDATE {
        return Err(Unstable::terminal("UpdateStrategy"));
    }

    let status = sts.status.clone().unwrap_or_default();
    let observed = status.observed_generation.unwrap_or_default();
    if observed == 0 || sts.metadata.generation.unwrap_or_default() > observed {
        return Err(Unstable::converging("ObservedGeneration", poll));
    }
    if spec
        .replicas
        .is_some_and(|desired| status.ready_replicas.unwrap_or_default() < desired)
    {
        return Err(Unstable::converging("ReadyReplicas", poll));
    }

    if let Some(rolling) = strategy.rolling_update {
        if let (Some(desired), Some(partition)) = (spec.replicas, rolling.partition) {
            if status.updated_replicas.unwrap_or_default() < desired - partition {
                return Err(Unstable::converging("UpdatedReplicas", poll));
            }
        }
        return Ok(());
    }

    if status.update_revision != status.current_revision {
        return Err(Unstable::converging("CurrentRevision", poll));
    }
    Ok(())
}

/// Check the pods behind a workload
///
/// Hard failures are looked for across every pod first so a pod that only needs
/// more time does not mask them.
///
/// # Errors
///
/// Returns the first hard failure, else the first pod that is not ready.
pub fn check_pods(pods: &[Pod], poll: Duration) -> Result<(), Unstable> {
    for pod in pods {
        let Some(status) = &pod.status else { continue };
        let unschedulable = status.conditions.iter().flatten().any(|c| {
            c.type_ == "PodScheduled" && c.status == "False" && c.reason.as_deref() == Some("Unschedulable")
        });
        if unschedulable {
            return Err(Unstable::terminal("Unschedulable"));
        }

        let restart_policy = pod.spec.as_ref().and_then(|s| s.restart_policy.as_deref());
        let containers = status
            .init_container_statuses
            .iter()
            .flatten()
            .chain(status.container_statuses.iter().flatten());
        for c in containers {
            if let Some(reason) = container_failure(c, restart_policy) {
                return Err(Unstable::terminal(reason));
            }
        }
    }

    for pod in pods {
        let not_ready = pod
            .status
            .iter()
            .flat_map(|s| s.conditions.iter().flatten())
            .find(|c| c.type_ == "Ready" && c.status == "False");
        if let Some(c) = not_ready {
            let reason = c.reason.clone().unwrap_or_else(|| "PodNotReady".to_owned());
            return Err(Unstable::converging(reason, poll));
        }
    }
    Ok(())
}

fn container_failure(c: &ContainerStatus, restart_policy: Option<&str>) -> Option<String> {
    if c.ready {
        return None;
    }
    let state = c.state.as_ref()?;
    let waiting = state.waiting.as_ref().and_then(|w| w.reason.as_deref());
    if c.restart_count > 0 && waiting == Some("CrashLoopBackOff") {
        return Some("CrashLoopBackOff".to_owned());
    }
    let terminated = state.terminated.as_ref().and_then(|t| t.reason.as_deref());
    if restart_policy == Some("Never") && c.restart_count == 0 && terminated == Some("Error") {
        return Some("Error".to_owned());
    }
    None
}

/// Rollout check and pod selector for a fetched workload
fn check_workload(workload: &Workload, poll: Duration) -> (Result<(), Unstable>, Option<LabelSelector>) {
    match workload {
        Workload::Deployment(d) => (
            check_deployment(d, poll),
            d.spec.as_ref().map(|s| s.selector.clone()),
        ),
        Workload::DaemonSet(d) => (
            check_daemon_set(d, poll),
            d.spec.as_ref().map(|s| s.selector.clone()),
        ),
        Workload::StatefulSet(s) => (
            check_stateful_set(s, poll),
            s.spec.as_ref().map(|s| s.selector.clone()),
        ),
        Workload::Other { kind } => {
            if kind != "ConfigMap" {
                debug!(%kind, "Stability check skipped due to unsupported object kind");
            }
            (Ok(()), None)
        }
    }
}

/// Check one patch target
///
/// A target that no longer exists counts as stable. While a rollout is still
/// converging, its pods are inspected for failures that will never clear.
async fn check_target(pass: &Pass<'_>, target: &ObjectReference) -> Result<Result<(), StabilityError>, ReconcileError> {
    let Some(workload) = pass.cluster().get_workload(target).await? else {
        return Ok(Ok(()));
    };
    let poll = pass.config().stability_poll();
    let (mut result, selector) = check_workload(&workload, poll);

    if let (Err(unstable), Some(selector)) = (&result, selector) {
        if unstable.retry_after.is_some() {
            let namespace = target.namespace.clone().unwrap_or_default();
            let pods = pass.cluster().list_pods(&namespace, &selector).await?;
            if let Err(pod_failure) = check_pods(&pods, poll) {
                result = Err(pod_failure);
            }
        }
    }
    Ok(result.map_err(|u| u.into_error(target)))
}

/// Wait for patched targets to settle
///
/// One target is cleared per pass. Targets that are still converging only set the
/// requeue delay; the trial is not written until one clears or one fails.
pub(crate) async fn wait(pass: &Pass<'_>, trial: &mut Trial) -> Result<Option<Outcome>, ReconcileError> {
    let now = pass.now;
    let mut delay = Duration::ZERO;

    for index in 0..trial.spec.patch_operations.len() {
        let op = &trial.spec.patch_operations[index];
        if !op.wait || op.budget.is_pending() {
            continue;
        }
        let target = op.target_ref.clone();

        match check_target(pass, &target).await? {
            Ok(()) => {
                info!(trial = %trial.name_any(), kind = ?target.kind, name = ?target.name, "Patch target is stable");
                trial.spec.patch_operations[index].wait = false;
                trial.apply_condition(ConditionType::Stable, ConditionStatus::False, None, None, now);
                return pass.commit(trial).await.map(Some);
            }
            Err(StabilityError::RetryAfter { kind, name, reason, delay: d }) => {
                debug!(%kind, %name, %reason, delay = ?d, "Patch target is not ready");
                delay = delay.max(d);
            }
            Err(e @ StabilityError::Terminal { .. }) => {
                error!(trial = %trial.name_any(), error = %e, "Patch target cannot stabilize");
                trial.fail("WaitFailed", &e.to_string(), now);
                return pass.commit(trial).await.map(Some);
            }
        }
    }

    if delay > Duration::ZERO {
        return Ok(Some(Outcome::RequeueAfter(delay)));
    }
    settle(pass, trial).await
}

async fn settle(pass: &Pass<'_>, trial: &mut Trial) -> Result<Option<Outcome>, ReconcileError> {
    match trial.condition_status(ConditionType::Stable) {
        Some(status) if status != ConditionStatus::True => {
            trial.apply_condition(ConditionType::Stable, ConditionStatus::True, None, None, pass.now);
            pass.commit(trial).await.map(Some)
        }
        _ => Ok(None),
    }
}
