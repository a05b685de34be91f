//! Resource fixtures

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{
    DaemonSet, DaemonSetSpec, DaemonSetStatus, DaemonSetUpdateStrategy, Deployment, DeploymentSpec,
    DeploymentStatus,
};
use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
use k8s_openapi::api::core::v1::{ObjectReference, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, Time};
use std::collections::BTreeMap;
use trial_api::{
    labels, Assignment, Experiment, ExperimentSpec, Metric, MetricType, Parameter, PatchTemplate,
    PatchType, Trial, TrialSpec,
};

/// Namespace of every fixture
pub const NAMESPACE: &str = "perf";

/// Integer parameter bounded by `min..=max`
pub fn parameter(name: &str, min: i64, max: i64) -> Parameter {
    Parameter {
        name: name.to_owned(),
        min,
        max,
        values: Vec::new(),
    }
}

/// Merge patch against a named deployment
pub fn deployment_patch(target: &str, patch: &str) -> PatchTemplate {
    workload_patch("Deployment", target, patch)
}

/// Merge patch against a named `apps/v1` object
pub fn workload_patch(kind: &str, target: &str, patch: &str) -> PatchTemplate {
    PatchTemplate {
        patch_type: PatchType::Merge,
        patch: patch.to_owned(),
        target_ref: Some(ObjectReference {
            api_version: Some("apps/v1".to_owned()),
            kind: Some(kind.to_owned()),
            name: Some(target.to_owned()),
            ..Default::default()
        }),
        selector: None,
    }
}

/// Metric computed from its query alone
pub fn local_metric(name: &str, query: &str) -> Metric {
    Metric {
        name: name.to_owned(),
        metric_type: MetricType::Local,
        query: query.to_owned(),
        ..Default::default()
    }
}

/// Experiment in [`NAMESPACE`]
pub fn experiment(name: &str, parameters: Vec<Parameter>, patches: Vec<PatchTemplate>, metrics: Vec<Metric>) -> Experiment {
    let mut experiment = Experiment::new(
        name,
        ExperimentSpec {
            parameters,
            patches,
            metrics,
            ..Default::default()
        },
    );
    experiment.metadata.namespace = Some(NAMESPACE.to_owned());
    experiment
}

/// Trial of `experiment` with the given assignments
pub fn trial(name: &str, experiment: &str, assignments: &[(&str, i64)]) -> Trial {
    let mut trial = Trial::new(
        name,
        TrialSpec {
            assignments: assignments
                .iter()
                .map(|(n, v)| Assignment {
                    name: (*n).to_owned(),
                    value: *v,
                })
                .collect(),
            ..Default::default()
        },
    );
    trial.metadata.namespace = Some(NAMESPACE.to_owned());
    trial.metadata.uid = Some(format!("{name}-uid"));
    trial.metadata.labels = Some(BTreeMap::from([(labels::EXPERIMENT.to_owned(), experiment.to_owned())]));
    trial
}

/// A deployment that has finished rolling out `replicas` replicas
pub fn deployment(name: &str, replicas: i32) -> Deployment {
    let app = BTreeMap::from([("app".to_owned(), name.to_owned())]);
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(NAMESPACE.to_owned()),
            labels: Some(app.clone()),
            generation: Some(1),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(app),
                ..Default::default()
            },
            ..Default::default()
        }),
        status: Some(rolled_out(replicas)),
    }
}

/// Status of a deployment whose rollout of `replicas` finished
pub fn rolled_out(replicas: i32) -> DeploymentStatus {
    DeploymentStatus {
        observed_generation: Some(1),
        replicas: Some(replicas),
        updated_replicas: Some(replicas),
        available_replicas: Some(replicas),
        ready_replicas: Some(replicas),
        ..Default::default()
    }
}

/// Service exposing one port named `http`
pub fn service(name: &str, cluster_ip: &str, port: i32, labels: BTreeMap<String, String>) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(NAMESPACE.to_owned()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some(cluster_ip.to_owned()),
            ports: Some(vec![ServicePort {
                name: Some("http".to_owned()),
                port,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A rolling-update daemon set that has finished rolling out to `nodes` nodes
pub fn daemon_set(name: &str, nodes: i32) -> DaemonSet {
    let app = BTreeMap::from([("app".to_owned(), name.to_owned())]);
    DaemonSet {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(NAMESPACE.to_owned()),
            labels: Some(app.clone()),
            generation: Some(1),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(app),
                ..Default::default()
            },
            update_strategy: Some(DaemonSetUpdateStrategy {
                type_: Some("RollingUpdate".to_owned()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: Some(DaemonSetStatus {
            observed_generation: Some(1),
            desired_number_scheduled: nodes,
            current_number_scheduled: nodes,
            updated_number_scheduled: Some(nodes),
            number_ready: nodes,
            number_available: Some(nodes),
            ..Default::default()
        }),
    }
}

/// Mark a job finished between two instants
pub fn complete_job(job: &mut Job, start: DateTime<Utc>, completion: DateTime<Utc>) {
    job.status = Some(JobStatus {
        start_time: Some(Time(start)),
        completion_time: Some(Time(completion)),
        succeeded: Some(1),
        conditions: Some(vec![condition("Complete", None, None, completion)]),
        ..Default::default()
    });
}

/// Mark a job failed
pub fn fail_job(job: &mut Job, start: DateTime<Utc>, at: DateTime<Utc>, reason: &str, message: &str) {
    job.status = Some(JobStatus {
        start_time: Some(Time(start)),
        failed: Some(1),
        conditions: Some(vec![condition("Failed", Some(reason), Some(message), at)]),
        ..Default::default()
    });
}

fn condition(type_: &str, reason: Option<&str>, message: Option<&str>, at: DateTime<Utc>) -> JobCondition {
    JobCondition {
        type_: type_.to_owned(),
        status: "True".to_owned(),
        reason: reason.map(str::to_owned),
        message: message.map(str::to_owned),
        last_transition_time: Some(Time(at)),
        ..Default::default()
    }
}
