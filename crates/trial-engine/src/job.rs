//! Trial job management
//!
//! The trial job is the workload being measured. It is created from the trial's job
//! template once every patch target is stable; its start and completion times become
//! the measurement window for metric queries.

use chrono::{DateTime, Duration as TimeDelta, Utc};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use trial_api::{labels, Trial};

use crate::config::EngineConfig;
use crate::context::{Outcome, Pass};
use crate::error::{ClusterError, ReconcileError};
use crate::setup::pod_selector;

/// Reason of a job stopped by its active deadline
const DEADLINE_EXCEEDED: &str = "DeadlineExceeded";

/// What one trial job says about the trial
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobObservation {
    /// When the job started
    pub start: Option<DateTime<Utc>>,
    /// When the job finished, including being stopped at its deadline
    pub completion: Option<DateTime<Utc>>,
    /// `(reason, message)` of a failure that fails the trial
    pub failure: Option<(String, String)>,
}

/// Build the trial job
///
/// The trial's job template is used as given, with the trial labels added and a
/// few defaults filled in. A template without containers runs a sleep for the
/// approximate runtime of the trial.
#[must_use]
pub fn build_trial_job(trial: &Trial, config: &EngineConfig) -> Job {
    let template = trial.spec.template.clone().unwrap_or_default();
    let mut metadata = template.metadata.unwrap_or_default();
    let mut spec = template.spec.unwrap_or_default();

    let (_, experiment) = trial.experiment_key();
    let trial_labels = [
        (labels::EXPERIMENT, experiment),
        (labels::TRIAL, trial.name_any()),
        (labels::TRIAL_ROLE, labels::ROLE_TRIAL_RUN.to_owned()),
    ];
    add_labels(&mut metadata, &trial_labels);
    add_labels(
        spec.template.metadata.get_or_insert_with(ObjectMeta::default),
        &trial_labels,
    );

    metadata.namespace = Some(trial.namespace_or_default());
    if metadata.name.as_deref().unwrap_or_default().is_empty() {
        metadata.name = Some(trial.name_any());
    }
    metadata.owner_references = trial.controller_owner_ref(&()).map(|r| vec![r]);

    let pod = spec.template.spec.get_or_insert_with(PodSpec::default);
    if pod.restart_policy.as_deref().unwrap_or_default().is_empty() {
        pod.restart_policy = Some("Never".to_owned());
    }
    if pod.containers.is_empty() {
        pod.containers = vec![sleep_container(trial, config)];
    }
    if spec.backoff_limit.is_none() {
        spec.backoff_limit = Some(0);
    }

    Job {
        metadata,
        spec: Some(spec),
        ..Default::default()
    }
}

fn add_labels(metadata: &mut ObjectMeta, values: &[(&str, String)]) {
    let labels = metadata.labels.get_or_insert_with(BTreeMap::new);
    for (key, value) in values {
        labels.insert((*key).to_owned(), value.clone());
    }
}

fn sleep_container(trial: &Trial, config: &EngineConfig) -> Container {
    let runtime = trial
        .spec
        .approximate_runtime_seconds
        .filter(|s| *s > 0)
        .unwrap_or(i64::try_from(config.default_runtime_secs).unwrap_or(i64::MAX));
    let seconds = runtime + trial.spec.start_time_offset_seconds.unwrap_or_default();
    Container {
        name: "default-trial-run".to_owned(),
        image: Some("busybox".to_owned()),
        command: Some(vec!["/bin/sh".to_owned()]),
        args: Some(vec![
            "-c".to_owned(),
            format!("echo 'Sleeping for {seconds}s...' && sleep {seconds} && echo 'Done.'"),
        ]),
        ..Default::default()
    }
}

/// Whether a job's pods are needed to understand it
fn needs_pods(job: &Job) -> bool {
    job.status.as_ref().map_or(true, |s| s.completion_time.is_none())
}

/// Read a trial job's timing and failure
///
/// A job stopped by its active deadline is not a failure; it completes at the time
/// its last container finished, or when the deadline was recorded.
#[must_use]
pub fn observe_job(job: &Job, pods: &[Pod]) -> JobObservation {
    let status = job.status.clone().unwrap_or_default();
    let mut observation = JobObservation {
        start: status.start_time.map(|t| t.0),
        completion: status.completion_time.map(|t| t.0),
        failure: None,
    };

    for c in status.conditions.iter().flatten().filter(|c| c.status == "True") {
        match c.type_.as_str() {
            "Failed" if c.reason.as_deref() == Some(DEADLINE_EXCEEDED) => {
                if observation.completion.is_none() {
                    observation.completion = last_finished(pods)
                        .or_else(|| c.last_transition_time.as_ref().map(|t| t.0));
                }
            }
            "Failed" => {
                let reason = c
                    .reason
                    .clone()
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "JobFailed".to_owned());
                let message = c
                    .message
                    .clone()
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| "Trial job failed".to_owned());
                observation.failure = Some((reason, message));
            }
            _ => {}
        }
    }

    if observation.failure.is_none() {
        observation.failure = unschedulable(pods);
    }
    observation
}

fn last_finished(pods: &[Pod]) -> Option<DateTime<Utc>> {
    pods.iter()
        .filter_map(|p| p.status.as_ref())
        .flat_map(|s| s.container_statuses.iter().flatten())
        .filter_map(|cs| cs.state.as_ref()?.terminated.as_ref()?.finished_at.as_ref())
        .map(|t| t.0)
        .max()
}

fn unschedulable(pods: &[Pod]) -> Option<(String, String)> {
    pods.iter()
        .filter_map(|p| p.status.as_ref())
        .flat_map(|s| s.conditions.iter().flatten())
        .find(|c| {
            c.type_ == "PodScheduled" && c.status == "False" && c.reason.as_deref() == Some("Unschedulable")
        })
        .map(|c| {
            (
                "Unschedulable".to_owned(),
                format!("trial pod: {}", c.message.as_deref().unwrap_or_default()),
            )
        })
}

/// Fold job observations into the trial status, returning `true` on change
///
/// The trial starts with its earliest job, shifted by the start time offset, and
/// completes with its latest job once every job has completed.
pub fn merge_job_status(trial: &mut Trial, observations: &[JobObservation], now: DateTime<Utc>) -> bool {
    let offset = TimeDelta::seconds(trial.spec.start_time_offset_seconds.unwrap_or_default());
    let start = observations.iter().filter_map(|o| o.start).min().map(|t| t + offset);
    let completion = if observations.iter().all(|o| o.completion.is_some()) {
        observations.iter().filter_map(|o| o.completion).max()
    } else {
        None
    };

    let mut changed = false;
    let status = trial.status_mut();
    if start.is_some() && status.start_time != start {
        status.start_time = start;
        changed = true;
    }
    if completion.is_some() && status.completion_time != completion {
        status.completion_time = completion;
        changed = true;
    }

    if let Some((reason, message)) = observations.iter().find_map(|o| o.failure.as_ref()) {
        changed |= trial.fail(reason, message, now).is_changed();
    }
    changed
}

/// Create the trial job, or fold its status into the trial
pub(crate) async fn manage(pass: &Pass<'_>, trial: &mut Trial) -> Result<Option<Outcome>, ReconcileError> {
    let namespace = trial.namespace_or_default();
    let jobs: Vec<Job> = pass
        .cluster()
        .list_jobs(&namespace, &trial.job_selector())
        .await?
        .into_iter()
        .filter(|j| j.labels().get(labels::TRIAL_ROLE).map(String::as_str) != Some(labels::ROLE_TRIAL_SETUP))
        .collect();

    if jobs.is_empty() {
        if trial.status.as_ref().is_some_and(|s| s.completion_time.is_some()) {
            return Ok(None);
        }
        let job = build_trial_job(trial, pass.config());
        return match pass.cluster().create_job(&job).await {
            Ok(()) => {
                info!(trial = %trial.name_any(), job = %job.name_any(), "Created trial job");
                Ok(Some(Outcome::Changed))
            }
            Err(ClusterError::AlreadyExists(_)) => {
                debug!(job = %job.name_any(), "Trial job already exists");
                Ok(Some(Outcome::RequeueAfter(pass.config().generic_retry())))
            }
            Err(e) => Err(e.into()),
        };
    }

    let mut observations = Vec::with_capacity(jobs.len());
    for job in &jobs {
        let pods = if needs_pods(job) {
            pass.cluster()
                .list_pods(&job.namespace().unwrap_or_else(|| namespace.clone()), &pod_selector(job))
                .await?
        } else {
            Vec::new()
        };
        observations.push(observe_job(job, &pods));
    }

    if !merge_job_status(trial, &observations, pass.now) {
        return Ok(None);
    }
    if let Some((reason, message)) = observations.iter().find_map(|o| o.failure.as_ref()) {
        warn!(trial = %trial.name_any(), %reason, %message, "Trial job failed");
    } else {
        let status = trial.status.as_ref();
        debug!(
            trial = %trial.name_any(),
            start = ?status.and_then(|s| s.start_time),
            completion = ?status.and_then(|s| s.completion_time),
            "Trial job status changed"
        );
    }
    pass.commit(trial).await.map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use k8s_openapi::api::batch::v1::{JobCondition, JobSpec, JobStatus, JobTemplateSpec};
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStatus, PodStatus, PodTemplateSpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use trial_api::{ConditionStatus, ConditionType, TrialSpec};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn trial() -> Trial {
        let mut t = Trial::new("t1", TrialSpec::default());
        t.metadata.namespace = Some("perf".into());
        t.metadata.uid = Some("uid-1".into());
        t
    }

    fn job(start: Option<i64>, completion: Option<i64>, failed: Option<(&str, &str)>) -> Job {
        Job {
            status: Some(JobStatus {
                start_time: start.map(|s| Time(at(s))),
                completion_time: completion.map(|s| Time(at(s))),
                conditions: failed.map(|(reason, message)| {
                    vec![JobCondition {
                        type_: "Failed".into(),
                        status: "True".into(),
                        reason: Some(reason.into()),
                        message: Some(message.into()),
                        last_transition_time: Some(Time(at(90))),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn default_job_sleeps() {
        let mut t = trial();
        t.spec.approximate_runtime_seconds = Some(60);
        t.spec.start_time_offset_seconds = Some(10);
        let job = build_trial_job(&t, &EngineConfig::default());

        assert_eq!(job.metadata.name.as_deref(), Some("t1"));
        assert_eq!(job.metadata.namespace.as_deref(), Some("perf"));
        assert_eq!(job.metadata.owner_references.as_ref().map(Vec::len), Some(1));
        assert_eq!(
            job.labels().get(labels::TRIAL_ROLE).map(String::as_str),
            Some(labels::ROLE_TRIAL_RUN)
        );

        let spec = job.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod.containers[0].name, "default-trial-run");
        assert_eq!(
            pod.containers[0].args.as_ref().unwrap()[1],
            "echo 'Sleeping for 70s...' && sleep 70 && echo 'Done.'"
        );
    }

    #[test]
    fn template_job_is_kept() {
        let mut t = trial();
        t.spec.template = Some(JobTemplateSpec {
            metadata: Some(ObjectMeta {
                name: Some("load".into()),
                ..Default::default()
            }),
            spec: Some(JobSpec {
                backoff_limit: Some(2),
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        restart_policy: Some("OnFailure".into()),
                        containers: vec![Container {
                            name: "locust".into(),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
        });
        let job = build_trial_job(&t, &EngineConfig::default());
        assert_eq!(job.metadata.name.as_deref(), Some("load"));
        let spec = job.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(2));
        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("OnFailure"));
        assert_eq!(pod.containers.len(), 1);
        assert_eq!(pod.containers[0].name, "locust");
    }

    #[test]
    fn window_spans_all_jobs() {
        let mut t = trial();
        t.spec.start_time_offset_seconds = Some(5);
        let observations = [
            observe_job(&job(Some(10), Some(100), None), &[]),
            observe_job(&job(Some(20), Some(120), None), &[]),
        ];
        assert!(merge_job_status(&mut t, &observations, at(200)));
        let status = t.status.as_ref().unwrap();
        assert_eq!(status.start_time, Some(at(15)));
        assert_eq!(status.completion_time, Some(at(120)));

        // Nothing new the second time around
        assert!(!merge_job_status(&mut t, &observations, at(201)));
    }

    #[test]
    fn completion_waits_for_every_job() {
        let mut t = trial();
        let observations = [
            observe_job(&job(Some(10), Some(100), None), &[]),
            observe_job(&job(Some(20), None, None), &[]),
        ];
        assert!(merge_job_status(&mut t, &observations, at(200)));
        assert_eq!(t.status.as_ref().unwrap().completion_time, None);
    }

    #[test]
    fn deadline_exceeded_completes() {
        let pod = Pod {
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    name: "run".into(),
                    state: Some(ContainerState {
                        terminated: Some(ContainerStateTerminated {
                            exit_code: 137,
                            finished_at: Some(Time(at(80))),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let deadline = job(Some(10), None, Some((DEADLINE_EXCEEDED, "Job was active longer than specified deadline")));

        let observation = observe_job(&deadline, &[pod]);
        assert_eq!(observation.failure, None);
        assert_eq!(observation.completion, Some(at(80)));

        // Without pods the condition time is used
        assert_eq!(observe_job(&deadline, &[]).completion, Some(at(90)));

        let mut t = trial();
        merge_job_status(&mut t, &[observation], at(200));
        assert!(!t.has_condition(ConditionType::Failed, ConditionStatus::True));
    }

    #[test]
    fn other_failures_fail_the_trial() {
        let mut t = trial();
        let observation = observe_job(&job(Some(10), None, Some(("BackoffLimitExceeded", "Job has reached the specified backoff limit"))), &[]);
        assert!(merge_job_status(&mut t, &[observation], at(200)));

        let failed = t.status.as_ref().unwrap().condition(ConditionType::Failed).unwrap();
        assert_eq!(failed.status, ConditionStatus::True);
        assert_eq!(failed.reason.as_deref(), Some("BackoffLimitExceeded"));
        assert_eq!(failed.message.as_deref(), Some("Job has reached the specified backoff limit"));
    }

    proptest! {
        #[test]
        fn prop_window_covers_every_job(
            jobs in proptest::collection::vec((0i64..1000, proptest::option::of(0i64..1000)), 1..6),
            offset in 0i64..60,
        ) {
            let mut t = trial();
            t.spec.start_time_offset_seconds = Some(offset);
            let observations: Vec<JobObservation> = jobs
                .iter()
                .map(|(start, run)| JobObservation {
                    start: Some(at(*start)),
                    completion: run.map(|r| at(start + r)),
                    failure: None,
                })
                .collect();
            merge_job_status(&mut t, &observations, at(5000));
            let status = t.status.as_ref().unwrap();

            let earliest = jobs.iter().map(|(s, _)| *s).min().unwrap();
            prop_assert_eq!(status.start_time, Some(at(earliest + offset)));
            if jobs.iter().all(|(_, run)| run.is_some()) {
                let completion = status.completion_time.unwrap();
                prop_assert!(observations.iter().all(|o| o.completion.unwrap() <= completion));
            } else {
                prop_assert_eq!(status.completion_time, None);
            }
        }
    }
}
