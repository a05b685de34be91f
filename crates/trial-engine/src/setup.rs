//! Setup and teardown jobs
//!
//! A trial with setup tasks runs one `create` job before anything is patched and one
//! `delete` job once the trial finishes or is deleted. The create job is tracked by the
//! `SetupCreated` condition, the delete job by `SetupDeleted`; each moves
//! Unknown (nothing dispatched) to False (job running) to True (job done).
//!
//! A finalizer holds deletion of the trial until the delete job has run.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, EnvVar, Pod, PodSecurityContext, PodSpec, PodTemplateSpec,
    SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::{Resource, ResourceExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};
use trial_api::{labels, ConditionStatus, ConditionType, SetupTask, Trial};

use crate::config::EngineConfig;
use crate::context::{Outcome, Pass};
use crate::error::{ClusterError, ReconcileError, SetupError};
use crate::template::TemplateEngine;

const HELM_VALUES_DIR: &str = "/workspace/helm-values";
const SETUP_UID: i64 = 1000;

/// Which half of the setup a job runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupMode {
    /// Provision before the trial runs
    Create,
    /// Clean up after the trial
    Delete,
}

impl SetupMode {
    /// Mode name, as passed to the task container
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Delete => "delete",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    fn condition(self) -> ConditionType {
        match self {
            Self::Create => ConditionType::SetupCreated,
            Self::Delete => ConditionType::SetupDeleted,
        }
    }

    fn skips(self, task: &SetupTask) -> bool {
        match self {
            Self::Create => task.skip_create,
            Self::Delete => task.skip_delete,
        }
    }
}

impl fmt::Display for SetupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed state of one setup job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupJobState {
    /// Dispatched and not finished
    Pending,
    /// Finished successfully
    Complete,
    /// Finished unsuccessfully
    Failed(String),
}

/// Create or delete jobs the trial's tasks call for
fn required_modes(trial: &Trial) -> (bool, bool) {
    let tasks = &trial.spec.setup_tasks;
    (
        tasks.iter().any(|t| !t.skip_create),
        tasks.iter().any(|t| !t.skip_delete),
    )
}

/// Selector of the trial's setup jobs
fn setup_selector(trial: &Trial) -> LabelSelector {
    LabelSelector {
        match_labels: Some(BTreeMap::from([
            (labels::TRIAL.to_owned(), trial.name_any()),
            (labels::TRIAL_ROLE.to_owned(), labels::ROLE_TRIAL_SETUP.to_owned()),
        ])),
        ..Default::default()
    }
}

/// Run the setup stage; `None` means the trial may proceed
pub(crate) async fn manage(pass: &Pass<'_>, trial: &mut Trial) -> Result<Option<Outcome>, ReconcileError> {
    let (needs_create, needs_delete) = required_modes(trial);
    if !needs_create && !needs_delete {
        return Ok(None);
    }
    let now = pass.now;
    let mut changed = false;

    if needs_create {
        changed |= trial
            .apply_condition(ConditionType::SetupCreated, ConditionStatus::Unknown, None, None, now)
            .is_changed();
    }
    if needs_delete {
        changed |= trial
            .apply_condition(ConditionType::SetupDeleted, ConditionStatus::Unknown, None, None, now)
            .is_changed();
    }

    let namespace = trial.namespace_or_default();
    let jobs = pass.cluster().list_jobs(&namespace, &setup_selector(trial)).await?;
    for job in &jobs {
        let Some(mode) = job_mode(job) else {
            warn!(job = %job.name_any(), "Unable to determine setup job mode");
            continue;
        };
        let state = inspect_job(pass, job).await?;
        let status = match state {
            SetupJobState::Pending => ConditionStatus::False,
            SetupJobState::Complete | SetupJobState::Failed(_) => ConditionStatus::True,
        };
        changed |= trial.apply_condition(mode.condition(), status, None, None, now).is_changed();

        if let SetupJobState::Failed(message) = state {
            if !trial.is_finished() {
                warn!(trial = %trial.name_any(), job = %job.name_any(), %message, "Setup job failed");
                trial.fail("SetupJobFailed", &message, now);
                changed = true;
            }
            changed |= trial.remove_finalizer(labels::SETUP_FINALIZER);
        }
    }
    if changed {
        return pass.commit(trial).await.map(Some);
    }

    let done = trial.is_finished() || trial.is_deleting();
    let mode = if done {
        trial
            .has_condition(ConditionType::SetupDeleted, ConditionStatus::Unknown)
            .then_some(SetupMode::Delete)
    } else if trial.has_condition(ConditionType::SetupCreated, ConditionStatus::Unknown) {
        if needs_delete && trial.add_finalizer(labels::SETUP_FINALIZER) {
            debug!(trial = %trial.name_any(), "Adding setup finalizer");
            return pass.commit(trial).await.map(Some);
        }
        Some(SetupMode::Create)
    } else {
        None
    };

    if let Some(mode) = mode {
        return dispatch(pass, trial, mode).await.map(Some);
    }

    if trial.has_condition(ConditionType::SetupCreated, ConditionStatus::False) && !done {
        return Ok(Some(Outcome::RequeueAfter(pass.config().generic_retry())));
    }

    if trial.has_condition(ConditionType::SetupDeleted, ConditionStatus::True)
        && trial.remove_finalizer(labels::SETUP_FINALIZER)
    {
        info!(trial = %trial.name_any(), "Teardown complete, releasing trial");
        return pass.commit(trial).await.map(Some);
    }

    // The delete job may never emit another event if it cannot start
    if done && trial.has_condition(ConditionType::SetupDeleted, ConditionStatus::False) {
        return Ok(Some(Outcome::RequeueAfter(pass.config().generic_retry())));
    }

    Ok(None)
}

async fn dispatch(pass: &Pass<'_>, trial: &mut Trial, mode: SetupMode) -> Result<Outcome, ReconcileError> {
    let job = match build_setup_job(trial, mode, pass.config(), &pass.ctx.templates) {
        Ok(job) => job,
        Err(e) => {
            warn!(trial = %trial.name_any(), %mode, error = %e, "Invalid setup task");
            if !trial.is_finished() {
                trial.fail("SetupJobFailed", &e.to_string(), pass.now);
            }
            trial.remove_finalizer(labels::SETUP_FINALIZER);
            return pass.commit(trial).await;
        }
    };

    match pass.cluster().create_job(&job).await {
        Ok(()) => {
            info!(trial = %trial.name_any(), job = %job.name_any(), %mode, "Created setup job");
            Ok(Outcome::Changed)
        }
        Err(ClusterError::AlreadyExists(_)) => {
            debug!(job = %job.name_any(), "Setup job already exists");
            Ok(Outcome::RequeueAfter(pass.config().generic_retry()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Mode label, falling back to the `MODE` environment variable
fn job_mode(job: &Job) -> Option<SetupMode> {
    if let Some(mode) = job.labels().get(labels::SETUP_MODE) {
        return SetupMode::parse(mode);
    }
    job.spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .iter()
        .flat_map(|c| c.env.iter().flatten())
        .find(|e| e.name == "MODE")
        .and_then(|e| e.value.as_deref())
        .and_then(SetupMode::parse)
}

async fn inspect_job(pass: &Pass<'_>, job: &Job) -> Result<SetupJobState, ReconcileError> {
    let state = job_state(job);
    if state != SetupJobState::Pending {
        return Ok(state);
    }
    let pods = pass
        .cluster()
        .list_pods(&job.namespace().unwrap_or_default(), &pod_selector(job))
        .await?;
    Ok(pending_state(job, &pods, pass.now, pass.config().setup_start_timeout()))
}

/// State from the job's own status
pub fn job_state(job: &Job) -> SetupJobState {
    let Some(status) = &job.status else {
        return SetupJobState::Pending;
    };

    for c in status.conditions.iter().flatten().filter(|c| c.status == "True") {
        match c.type_.as_str() {
            "Complete" => return SetupJobState::Complete,
            "Failed" => {
                let message = match (c.reason.as_deref(), c.message.as_deref()) {
                    (Some("BackoffLimitExceeded"), _) => "Setup job did not complete successfully".to_owned(),
                    (_, Some(m)) if !m.is_empty() => m.to_owned(),
                    (Some(r), _) if !r.is_empty() => format!("Setup job failed with reason '{r}'"),
                    _ => "Setup job failed without reporting a reason".to_owned(),
                };
                return SetupJobState::Failed(message);
            }
            _ => {}
        }
    }

    match status.failed {
        Some(n) if n > 0 => SetupJobState::Failed(format!("Setup job has {n} failed pod(s)")),
        _ => SetupJobState::Pending,
    }
}

/// Failure signs of a job without a terminal condition
pub fn pending_state(job: &Job, pods: &[Pod], now: DateTime<Utc>, timeout: Duration) -> SetupJobState {
    let statuses = pods.iter().filter_map(|p| p.status.as_ref());

    let failed_container = statuses
        .clone()
        .flat_map(|s| s.container_statuses.iter().flatten())
        .any(|cs| {
            !cs.ready
                && cs
                    .state
                    .as_ref()
                    .and_then(|s| s.terminated.as_ref())
                    .is_some_and(|t| t.exit_code != 0)
        });
    if failed_container {
        return SetupJobState::Failed("Setup job has a failed container".to_owned());
    }

    let counted = job
        .status
        .as_ref()
        .is_some_and(|s| s.succeeded.unwrap_or(0) > 0 || s.failed.unwrap_or(0) > 0);
    let running = statuses
        .filter_map(|s| s.phase.as_deref())
        .any(|phase| matches!(phase, "Running" | "Succeeded" | "Failed"));
    if counted || running {
        return SetupJobState::Pending;
    }

    let Some(created) = job.creation_timestamp() else {
        return SetupJobState::Pending;
    };
    let waited = (now - created.0).to_std().unwrap_or_default();
    if waited > timeout {
        return SetupJobState::Failed(format!(
            "Setup job did not start within {}s",
            timeout.as_secs()
        ));
    }
    SetupJobState::Pending
}

/// Pods owned by a job
pub(crate) fn pod_selector(job: &Job) -> LabelSelector {
    let spec = job.spec.as_ref();
    if let Some(selector) = spec.and_then(|s| s.selector.clone()) {
        return selector;
    }
    LabelSelector {
        match_labels: spec
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.labels.clone()),
        ..Default::default()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HelmGeneratorConfig<'a> {
    api_version: &'static str,
    kind: &'static str,
    metadata: HelmGeneratorMeta<'a>,
    release_name: &'a str,
    chart: &'a str,
    version: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    repo: &'a str,
    values: Vec<HelmGeneratorValue>,
}

#[derive(Debug, Serialize)]
struct HelmGeneratorMeta<'a> {
    name: &'a str,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct HelmGeneratorValue {
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    force_string: bool,
}

/// Build the setup job for `mode`
///
/// # Errors
///
/// Fails when a Helm value cannot be resolved or the Helm configuration cannot be
/// encoded.
pub fn build_setup_job(
    trial: &Trial,
    mode: SetupMode,
    config: &EngineConfig,
    templates: &TemplateEngine,
) -> Result<Job, SetupError> {
    let trial_name = trial.name_any();
    let job_name = format!("{trial_name}-{mode}");
    let (_, experiment) = trial.experiment_key();
    let job_labels = BTreeMap::from([
        (labels::EXPERIMENT.to_owned(), experiment),
        (labels::TRIAL.to_owned(), trial_name.clone()),
        (labels::TRIAL_ROLE.to_owned(), labels::ROLE_TRIAL_SETUP.to_owned()),
        (labels::SETUP_MODE.to_owned(), mode.as_str().to_owned()),
    ]);

    let mut volumes: Vec<Volume> = trial.spec.setup_volumes.clone();
    let mut containers = Vec::new();
    for task in trial.spec.setup_tasks.iter().filter(|t| !mode.skips(t)) {
        let (container, config_maps) = task_container(trial, task, &job_name, mode, config, templates)?;
        for name in config_maps {
            if !volumes.iter().any(|v| v.name == name) {
                volumes.push(Volume {
                    name: name.clone(),
                    config_map: Some(ConfigMapVolumeSource {
                        name: name.clone(),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
            }
        }
        containers.push(container);
    }

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(job_name),
            namespace: Some(trial.namespace_or_default()),
            labels: Some(job_labels.clone()),
            owner_references: trial.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(job_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_owned()),
                    service_account_name: trial.spec.setup_service_account_name.clone(),
                    security_context: Some(PodSecurityContext {
                        run_as_non_root: Some(true),
                        ..Default::default()
                    }),
                    containers,
                    volumes: (!volumes.is_empty()).then_some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Container for one task, plus the config maps it mounts
fn task_container(
    trial: &Trial,
    task: &SetupTask,
    job_name: &str,
    mode: SetupMode,
    config: &EngineConfig,
    templates: &TemplateEngine,
) -> Result<(Container, Vec<String>), SetupError> {
    let mut env = vec![
        env_var("NAMESPACE", trial.target_namespace()),
        env_var("NAME", task.name.clone()),
        env_var("TRIAL", trial.name_any()),
        env_var("MODE", mode.as_str().to_owned()),
    ];
    env.extend(
        trial
            .spec
            .assignments
            .iter()
            .map(|a| env_var(&a.name.to_uppercase().replace('.', "_"), a.value.to_string())),
    );

    let mut mounts = task.volume_mounts.clone();
    let mut config_maps = Vec::new();
    if let Some(chart) = task.helm_chart.as_deref().filter(|c| !c.is_empty()) {
        let mut values = Vec::with_capacity(task.helm_values.len() + task.helm_values_from.len());
        for hv in &task.helm_values {
            let value = match &hv.parameter {
                Some(parameter) => serde_json::Value::from(trial.assignment(parameter).ok_or_else(|| {
                    SetupError::UnknownParameter {
                        parameter: parameter.clone(),
                        value: hv.name.clone(),
                    }
                })?),
                None => serde_json::Value::from(templates.render_value(
                    hv.value.as_deref().unwrap_or_default(),
                    trial,
                    None,
                )?),
            };
            values.push(HelmGeneratorValue {
                name: Some(hv.name.clone()),
                value: Some(value),
                force_string: hv.force_string,
                ..Default::default()
            });
        }
        for name in &task.helm_values_from {
            let dir = format!("{HELM_VALUES_DIR}/{name}");
            values.push(HelmGeneratorValue {
                file: Some(format!("{dir}/*values.yaml")),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name: name.clone(),
                mount_path: dir,
                read_only: Some(true),
                ..Default::default()
            });
            config_maps.push(name.clone());
        }

        let helm = HelmGeneratorConfig {
            api_version: "konjure.carbonrelay.com/v1beta1",
            kind: "HelmGenerator",
            metadata: HelmGeneratorMeta { name: &task.name },
            release_name: &task.name,
            chart,
            version: task.helm_chart_version.as_deref().unwrap_or_default(),
            repo: task.helm_repository.as_deref().unwrap_or_default(),
            values,
        };
        let encoded = STANDARD.encode(serde_yaml::to_string(&helm)?);
        env.push(env_var("HELM_CONFIG", encoded));
    }

    let (image, pull_policy, command) = match task.image.as_deref().filter(|i| !i.is_empty()) {
        Some(image) => (image.to_owned(), None, task.command.clone()),
        None => (
            config.setup_image.clone(),
            Some(config.setup_image_pull_policy.clone()),
            Vec::new(),
        ),
    };
    let args = if task.args.is_empty() {
        vec![mode.as_str().to_owned()]
    } else {
        task.args.clone()
    };

    let container = Container {
        name: format!("{job_name}-{}", task.name),
        image: Some(image),
        image_pull_policy: pull_policy,
        command: (!command.is_empty()).then_some(command),
        args: Some(args),
        env: Some(env),
        volume_mounts: (!mounts.is_empty()).then_some(mounts),
        security_context: Some(SecurityContext {
            run_as_user: Some(SETUP_UID),
            run_as_group: Some(SETUP_UID),
            allow_privilege_escalation: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    };
    Ok((container, config_maps))
}

fn env_var(name: &str, value: String) -> EnvVar {
    EnvVar {
        name: name.to_owned(),
        value: Some(value),
        ..Default::default()
    }
}
