//! Multi-pass reconciliation scenarios against the in-memory cluster

use chrono::{DateTime, Duration as TimeDelta, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use pretty_assertions::assert_eq;
use std::time::Duration;
use trial_api::{labels, ConditionStatus, ConditionType, SetupTask, Trial, TrialPhase};
use trial_engine::{reconcile, Clock, Outcome};
use trial_test_utils::fixtures::{self, NAMESPACE};
use trial_test_utils::{FixedClock, Harness, StaticMetrics};

const TRIAL: &str = "t1";

fn latest(h: &Harness) -> Trial {
    h.cluster.trial(NAMESPACE, TRIAL).expect("trial is stored")
}

async fn pass(h: &Harness) -> Outcome {
    reconcile(&latest(h), &h.ctx).await.expect("pass succeeds")
}

/// Run passes while they keep writing, returning the first outcome that does not
async fn drive(h: &Harness) -> Outcome {
    for _ in 0..50 {
        match pass(h).await {
            Outcome::Changed | Outcome::RetryNow => continue,
            other => return other,
        }
    }
    panic!("trial did not settle");
}

fn later(h: &Harness, secs: i64) -> DateTime<Utc> {
    h.clock.now() + TimeDelta::seconds(secs)
}

fn failure(trial: &Trial) -> Option<(String, String)> {
    let c = trial.status.as_ref()?.condition(ConditionType::Failed)?;
    (c.status == ConditionStatus::True).then(|| {
        (
            c.reason.clone().unwrap_or_default(),
            c.message.clone().unwrap_or_default(),
        )
    })
}

/// Experiment with one replica patch against `web` and one local metric
fn standard(h: &Harness) {
    h.cluster.add_experiment(fixtures::experiment(
        "exp",
        vec![fixtures::parameter("replicas", 1, 5)],
        vec![fixtures::deployment_patch("web", "spec:\n  replicas: {{ values.replicas }}\n")],
        vec![fixtures::local_metric("duration", "{{ duration(start_time, completion_time) }}")],
    ));
    h.cluster.add_deployment(fixtures::deployment("web", 3));
    h.cluster.add_trial(fixtures::trial(TRIAL, "exp", &[("replicas", 3)]));
}

/// A trial whose job already finished, with nothing left but metrics
fn observing(h: &Harness, metrics: Vec<trial_api::Metric>) {
    h.cluster.add_experiment(fixtures::experiment("exp", vec![], vec![], metrics));
    let mut trial = fixtures::trial(TRIAL, "exp", &[]);
    let now = h.clock.now();
    trial.apply_condition(ConditionType::Patched, ConditionStatus::True, None, None, now);
    trial.apply_condition(ConditionType::Stable, ConditionStatus::True, None, None, now);
    let status = trial.status_mut();
    status.start_time = Some(now - TimeDelta::seconds(120));
    status.completion_time = Some(now - TimeDelta::seconds(10));
    assert_eq!(TrialPhase::of(&trial), TrialPhase::Observing);
    h.cluster.add_trial(trial);
}

#[tokio::test]
async fn full_lifecycle() {
    let h = Harness::new(StaticMetrics::new());
    standard(&h);

    // Patch, stabilize, then start the job and wait for it
    assert_eq!(drive(&h).await, Outcome::RequeueAfter(Duration::from_secs(1)));
    let patches = h.cluster.patches();
    assert_eq!(patches.len(), 1);
    assert_eq!(patches[0].data, r#"{"spec":{"replicas":3}}"#);
    assert_eq!(patches[0].target.namespace.as_deref(), Some(NAMESPACE));
    assert_eq!(TrialPhase::of(&latest(&h)), TrialPhase::Running);
    assert_eq!(h.cluster.jobs_created(), 1);

    let (start, end) = (later(&h, 5), later(&h, 65));
    h.cluster.update_job(TRIAL, |job| fixtures::complete_job(job, start, end));

    assert_eq!(drive(&h).await, Outcome::Idle);
    let trial = latest(&h);
    assert_eq!(TrialPhase::of(&trial), TrialPhase::Complete);
    let status = trial.status.as_ref().unwrap();
    assert_eq!(status.start_time, Some(start));
    assert_eq!(status.completion_time, Some(end));
    assert_eq!(status.assignments, "replicas=3");
    assert_eq!(status.values, "duration=60");
    assert!(trial.has_condition(ConditionType::Observed, ConditionStatus::True));
}

#[tokio::test]
async fn finished_trials_are_not_written() {
    let h = Harness::new(StaticMetrics::new());
    standard(&h);
    drive(&h).await;
    let (start, end) = (later(&h, 5), later(&h, 65));
    h.cluster.update_job(TRIAL, |job| fixtures::complete_job(job, start, end));
    drive(&h).await;

    let writes = h.cluster.trial_writes();
    for _ in 0..3 {
        assert_eq!(pass(&h).await, Outcome::Idle);
    }
    assert_eq!(h.cluster.trial_writes(), writes);
    assert_eq!(h.cluster.jobs_created(), 1);
}

#[tokio::test]
async fn converging_rollout_only_requeues() {
    let h = Harness::new(StaticMetrics::new());
    standard(&h);
    h.cluster.update_deployment(NAMESPACE, "web", |d| {
        let status = d.status.as_mut().unwrap();
        status.updated_replicas = Some(0);
        status.available_replicas = Some(0);
    });

    assert_eq!(drive(&h).await, Outcome::RequeueAfter(Duration::from_secs(5)));
    let writes = h.cluster.trial_writes();
    let before = latest(&h);
    assert_eq!(pass(&h).await, Outcome::RequeueAfter(Duration::from_secs(5)));
    assert_eq!(h.cluster.trial_writes(), writes);
    assert_eq!(latest(&h).status, before.status);

    h.cluster.update_deployment(NAMESPACE, "web", |d| d.status = Some(fixtures::rolled_out(3)));
    assert_eq!(drive(&h).await, Outcome::RequeueAfter(Duration::from_secs(1)));
    assert!(latest(&h).has_condition(ConditionType::Stable, ConditionStatus::True));
}

#[tokio::test]
async fn deadline_exceeded_is_not_a_failure() {
    let h = Harness::new(StaticMetrics::new());
    standard(&h);
    drive(&h).await;

    let (start, at) = (later(&h, 5), later(&h, 95));
    h.cluster.update_job(TRIAL, |job| {
        fixtures::fail_job(job, start, at, "DeadlineExceeded", "Job was active longer than specified deadline");
    });

    assert_eq!(drive(&h).await, Outcome::Idle);
    let trial = latest(&h);
    assert_eq!(failure(&trial), None);
    assert_eq!(trial.status.as_ref().unwrap().completion_time, Some(at));
    assert_eq!(TrialPhase::of(&trial), TrialPhase::Complete);
}

#[tokio::test]
async fn job_failure_fails_the_trial() {
    let h = Harness::new(StaticMetrics::new());
    standard(&h);
    drive(&h).await;

    let (start, at) = (later(&h, 5), later(&h, 20));
    h.cluster.update_job(TRIAL, |job| {
        fixtures::fail_job(job, start, at, "BackoffLimitExceeded", "Job has reached the specified backoff limit");
    });

    assert_eq!(drive(&h).await, Outcome::Idle);
    let trial = latest(&h);
    assert_eq!(
        failure(&trial),
        Some((
            "BackoffLimitExceeded".to_owned(),
            "Job has reached the specified backoff limit".to_owned()
        ))
    );
    assert_eq!(TrialPhase::of(&trial), TrialPhase::Failed);
}

#[tokio::test]
async fn patch_attempts_run_out() {
    let h = Harness::new(StaticMetrics::new());
    standard(&h);
    h.cluster.fail_patches(3);

    assert_eq!(drive(&h).await, Outcome::Idle);
    let trial = latest(&h);
    let op = &trial.spec.patch_operations[0];
    assert_eq!(op.budget.attempts_remaining, 0);
    assert!(op.budget.last_error.as_deref().unwrap_or_default().contains("the patch could not be applied"));
    assert_eq!(failure(&trial).map(|(reason, _)| reason).as_deref(), Some("PatchFailed"));
    assert!(h.cluster.patches().is_empty());
    // Evaluation plus one write per failed attempt
    assert_eq!(h.cluster.trial_writes(), 4);
}

#[tokio::test]
async fn patch_recovers_within_budget() {
    let h = Harness::new(StaticMetrics::new());
    standard(&h);
    h.cluster.fail_patches(2);

    assert_eq!(drive(&h).await, Outcome::RequeueAfter(Duration::from_secs(1)));
    let trial = latest(&h);
    assert_eq!(failure(&trial), None);
    assert_eq!(trial.spec.patch_operations[0].budget.attempts_remaining, 0);
    assert_eq!(h.cluster.patches().len(), 1);
}

#[tokio::test]
async fn missing_assignment_is_terminal() {
    let h = Harness::new(StaticMetrics::new());
    standard(&h);
    h.cluster.add_trial(fixtures::trial(TRIAL, "exp", &[]));

    assert_eq!(drive(&h).await, Outcome::Idle);
    assert_eq!(
        failure(&latest(&h)),
        Some((
            "InvalidAssignments".to_owned(),
            "trial t1 is missing assignments for replicas".to_owned()
        ))
    );
    assert!(h.cluster.patches().is_empty());
}

#[tokio::test]
async fn patch_without_name_or_selector_is_rejected() {
    let h = Harness::new(StaticMetrics::new());
    h.cluster.add_experiment(fixtures::experiment(
        "exp",
        vec![],
        vec![fixtures::deployment_patch("", "spec:\n  replicas: 2\n")],
        vec![],
    ));
    h.cluster.add_deployment(fixtures::deployment("web", 3));
    h.cluster.add_deployment(fixtures::deployment("unrelated-db", 1));
    h.cluster.add_trial(fixtures::trial(TRIAL, "exp", &[]));

    assert_eq!(drive(&h).await, Outcome::Idle);
    let trial = latest(&h);
    assert_eq!(
        failure(&trial),
        Some(("InvalidPatch".to_owned(), "invalid patch reference".to_owned()))
    );
    assert!(trial.spec.patch_operations.is_empty());
    assert!(h.cluster.patches().is_empty());
    assert_eq!(h.cluster.jobs_created(), 0);
}

#[tokio::test]
async fn daemon_set_rollout_is_awaited() {
    let h = Harness::new(StaticMetrics::new());
    h.cluster.add_experiment(fixtures::experiment(
        "exp",
        vec![],
        vec![fixtures::workload_patch("DaemonSet", "agent", "metadata:\n  annotations:\n    rollout: \"2\"\n")],
        vec![],
    ));
    let mut agent = fixtures::daemon_set("agent", 4);
    agent.status.as_mut().unwrap().number_available = Some(2);
    h.cluster.add_daemon_set(agent);
    h.cluster.add_trial(fixtures::trial(TRIAL, "exp", &[]));

    assert_eq!(drive(&h).await, Outcome::RequeueAfter(Duration::from_secs(5)));
    assert_eq!(h.cluster.patches().len(), 1);
    assert_eq!(TrialPhase::of(&latest(&h)), TrialPhase::Stabilizing);
    assert_eq!(h.cluster.jobs_created(), 0);

    h.cluster.update_daemon_set(NAMESPACE, "agent", |d| {
        d.status.as_mut().unwrap().number_available = Some(4);
    });
    assert_eq!(drive(&h).await, Outcome::RequeueAfter(Duration::from_secs(1)));
    assert_eq!(TrialPhase::of(&latest(&h)), TrialPhase::Running);
    assert_eq!(h.cluster.jobs_created(), 1);
}

#[tokio::test]
async fn daemon_set_without_rolling_update_fails_the_wait() {
    let h = Harness::new(StaticMetrics::new());
    h.cluster.add_experiment(fixtures::experiment(
        "exp",
        vec![],
        vec![fixtures::workload_patch("DaemonSet", "agent", "metadata:\n  annotations:\n    rollout: \"2\"\n")],
        vec![],
    ));
    let mut agent = fixtures::daemon_set("agent", 4);
    agent.spec.as_mut().unwrap().update_strategy.as_mut().unwrap().type_ = Some("OnDelete".to_owned());
    h.cluster.add_daemon_set(agent);
    h.cluster.add_trial(fixtures::trial(TRIAL, "exp", &[]));

    assert_eq!(drive(&h).await, Outcome::Idle);
    assert_eq!(
        failure(&latest(&h)),
        Some((
            "WaitFailed".to_owned(),
            "DaemonSet stability error for agent: UpdateStrategy".to_owned()
        ))
    );
    assert_eq!(h.cluster.jobs_created(), 0);
}

#[tokio::test]
async fn stale_write_retries_immediately() {
    let h = Harness::new(StaticMetrics::new());
    standard(&h);
    h.cluster.conflict_updates(1);

    assert_eq!(pass(&h).await, Outcome::RetryNow);
    assert_eq!(h.cluster.trial_writes(), 0);
    assert_eq!(pass(&h).await, Outcome::Changed);
    assert_eq!(h.cluster.trial_writes(), 1);
}

#[tokio::test]
async fn prometheus_nan_consumes_an_attempt() {
    let scraped = FixedClock::epoch().now();
    let metrics = StaticMetrics::new()
        .with_target("up", scraped)
        .with_query("scalar(avg(latency))", trial_engine::QueryValue::Scalar(f64::NAN));
    let h = Harness::new(metrics);
    observing(
        &h,
        vec![trial_api::Metric {
            name: "latency".into(),
            metric_type: trial_api::MetricType::Prometheus,
            query: "scalar(avg(latency))".into(),
            url: Some("http://prometheus:9090".into()),
            ..Default::default()
        }],
    );

    assert_eq!(pass(&h).await, Outcome::Changed);
    assert_eq!(pass(&h).await, Outcome::Changed);
    let trial = latest(&h);
    let value = &trial.spec.values[0];
    assert_eq!(value.budget.attempts_remaining, 2);
    assert!(value.budget.last_error.as_deref().unwrap_or_default().starts_with("metric data not available"));
    assert_eq!(value.value, None);
    assert_eq!(failure(&trial), None);
}

#[tokio::test]
async fn prometheus_waits_for_scrape() {
    let stale = FixedClock::epoch().now() - TimeDelta::seconds(60);
    let h = Harness::new(StaticMetrics::new().with_target("up", stale));
    observing(
        &h,
        vec![trial_api::Metric {
            name: "latency".into(),
            metric_type: trial_api::MetricType::Prometheus,
            query: "scalar(avg(latency))".into(),
            url: Some("http://prometheus:9090".into()),
            ..Default::default()
        }],
    );

    assert_eq!(pass(&h).await, Outcome::Changed);
    let writes = h.cluster.trial_writes();
    assert_eq!(pass(&h).await, Outcome::RequeueAfter(Duration::from_secs(5)));
    assert_eq!(h.cluster.trial_writes(), writes);
    assert!(latest(&h).spec.values.is_empty());
}

#[tokio::test]
async fn json_path_metric_is_captured() {
    let metrics = StaticMetrics::new().with_document(
        "http://stats:8080/",
        serde_json::json!({"data": {"v": "42.5"}}),
    );
    let h = Harness::new(metrics);
    observing(
        &h,
        vec![trial_api::Metric {
            name: "throughput".into(),
            metric_type: trial_api::MetricType::JsonPath,
            query: "data.v".into(),
            url: Some("http://stats:8080/".into()),
            ..Default::default()
        }],
    );

    assert_eq!(drive(&h).await, Outcome::Idle);
    let trial = latest(&h);
    assert_eq!(trial.spec.values[0].value.as_deref(), Some("42.5"));
    assert_eq!(TrialPhase::of(&trial), TrialPhase::Complete);
}

#[tokio::test]
async fn unanswered_json_endpoint_fails_the_metric() {
    let h = Harness::new(StaticMetrics::new());
    observing(
        &h,
        vec![trial_api::Metric {
            name: "throughput".into(),
            metric_type: trial_api::MetricType::JsonPath,
            query: "data.v".into(),
            url: Some("http://stats:8080/".into()),
            ..Default::default()
        }],
    );

    assert_eq!(drive(&h).await, Outcome::Idle);
    let trial = latest(&h);
    assert_eq!(
        failure(&trial),
        Some(("MetricFailed".to_owned(), "no value yet (HTTP 404)".to_owned()))
    );
    assert_eq!(trial.spec.values[0].budget.attempts_remaining, 0);
    assert_eq!(h.metrics.requests().len(), 3);
}

#[tokio::test]
async fn teardown_holds_the_trial() {
    let h = Harness::new(StaticMetrics::new());
    h.cluster.add_experiment(fixtures::experiment("exp", vec![], vec![], vec![]));
    let mut trial = fixtures::trial(TRIAL, "exp", &[]);
    trial.spec.setup_tasks = vec![SetupTask {
        name: "db".into(),
        ..Default::default()
    }];
    h.cluster.add_trial(trial);

    // Conditions, finalizer, create job, then the job is seen pending
    assert_eq!(drive(&h).await, Outcome::RequeueAfter(Duration::from_secs(1)));
    let trial = latest(&h);
    assert!(trial.has_finalizer(labels::SETUP_FINALIZER));
    assert!(trial.has_condition(ConditionType::SetupCreated, ConditionStatus::False));

    let (start, end) = (later(&h, 1), later(&h, 30));
    h.cluster.update_job("t1-create", |job| fixtures::complete_job(job, start, end));
    assert_eq!(pass(&h).await, Outcome::Changed);
    assert!(latest(&h).has_condition(ConditionType::SetupCreated, ConditionStatus::True));

    // Delete the trial while it runs
    let mut deleting = latest(&h);
    deleting.metadata.deletion_timestamp = Some(Time(later(&h, 40)));
    h.cluster.add_trial(deleting);

    assert_eq!(drive(&h).await, Outcome::RequeueAfter(Duration::from_secs(1)));
    let trial = latest(&h);
    assert!(h.cluster.jobs().iter().any(|j| j.metadata.name.as_deref() == Some("t1-delete")));
    assert!(trial.has_condition(ConditionType::SetupDeleted, ConditionStatus::False));
    assert!(trial.has_finalizer(labels::SETUP_FINALIZER));

    let (start, end) = (later(&h, 41), later(&h, 50));
    h.cluster.update_job("t1-delete", |job| fixtures::complete_job(job, start, end));
    assert_eq!(pass(&h).await, Outcome::Changed);
    assert!(latest(&h).has_finalizer(labels::SETUP_FINALIZER));
    assert_eq!(pass(&h).await, Outcome::Changed);
    assert!(h.cluster.trial(NAMESPACE, TRIAL).is_none());
}

#[tokio::test]
async fn failed_setup_fails_the_trial() {
    let h = Harness::new(StaticMetrics::new());
    h.cluster.add_experiment(fixtures::experiment("exp", vec![], vec![], vec![]));
    let mut trial = fixtures::trial(TRIAL, "exp", &[]);
    trial.spec.setup_tasks = vec![SetupTask {
        name: "db".into(),
        ..Default::default()
    }];
    h.cluster.add_trial(trial);
    drive(&h).await;

    let (start, at) = (later(&h, 1), later(&h, 30));
    h.cluster.update_job("t1-create", |job| {
        fixtures::fail_job(job, start, at, "BackoffLimitExceeded", "Job has reached the specified backoff limit");
    });
    assert_eq!(pass(&h).await, Outcome::Changed);

    let trial = latest(&h);
    assert_eq!(
        failure(&trial),
        Some((
            "SetupJobFailed".to_owned(),
            "Setup job did not complete successfully".to_owned()
        ))
    );
    assert!(!trial.has_finalizer(labels::SETUP_FINALIZER));
}
