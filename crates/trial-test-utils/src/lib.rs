//! Testing utilities for the trial workspace
//!
//! An in-memory cluster, scripted metric backends, a settable clock and resource
//! fixtures for driving reconciliation passes without an API server.

pub mod fixtures;

use async_trait::async_trait;
use chrono::{DateTime, Duration as TimeDelta, TimeZone, Utc};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ObjectReference, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use trial_api::{selector, Experiment, PatchType, Trial};
use trial_engine::metric::{MetricBackend, QueryValue, ScrapeTarget};
use trial_engine::{CaptureError, Clock, Cluster, ClusterError, Context, EngineConfig, Workload};

/// A patch the fake cluster received
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedPatch {
    /// Patched object
    pub target: ObjectReference,
    /// Encoding of `data`
    pub patch_type: PatchType,
    /// Patch body as sent
    pub data: String,
}

#[derive(Default)]
struct State {
    experiments: BTreeMap<(String, String), Experiment>,
    trials: BTreeMap<(String, String), Trial>,
    jobs: Vec<Job>,
    pods: Vec<Pod>,
    services: Vec<Service>,
    workloads: Vec<(ObjectReference, BTreeMap<String, String>, Workload)>,
    patches: Vec<AppliedPatch>,
    trial_writes: usize,
    jobs_created: usize,
    patch_failures: u32,
    conflicts: u32,
}

/// In-memory [`Cluster`]
#[derive(Default, Clone)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
}

fn key(namespace: Option<String>, name: String) -> (String, String) {
    (namespace.unwrap_or_else(|| "default".to_owned()), name)
}

fn reference(api_version: &str, kind: &str, namespace: &str, name: &str) -> ObjectReference {
    ObjectReference {
        api_version: Some(api_version.to_owned()),
        kind: Some(kind.to_owned()),
        namespace: Some(namespace.to_owned()),
        name: Some(name.to_owned()),
        ..Default::default()
    }
}

impl FakeCluster {
    /// An empty cluster
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an experiment
    pub fn add_experiment(&self, experiment: Experiment) {
        let k = key(experiment.namespace(), experiment.name_any());
        self.state.lock().experiments.insert(k, experiment);
    }

    /// Store a trial without counting it as a write
    pub fn add_trial(&self, trial: Trial) {
        let k = key(trial.namespace(), trial.name_any());
        self.state.lock().trials.insert(k, trial);
    }

    /// Latest stored copy of a trial
    pub fn trial(&self, namespace: &str, name: &str) -> Option<Trial> {
        self.state
            .lock()
            .trials
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
    }

    /// Store a job as if something else created it
    pub fn add_job(&self, job: Job) {
        self.state.lock().jobs.push(job);
    }

    /// Every stored job, created or added
    pub fn jobs(&self) -> Vec<Job> {
        self.state.lock().jobs.clone()
    }

    /// Mutate a stored job in place
    pub fn update_job(&self, name: &str, f: impl FnOnce(&mut Job)) {
        let mut state = self.state.lock();
        if let Some(job) = state.jobs.iter_mut().find(|j| j.name_any() == name) {
            f(job);
        }
    }

    /// Store a pod
    pub fn add_pod(&self, pod: Pod) {
        self.state.lock().pods.push(pod);
    }

    /// Store a service
    pub fn add_service(&self, service: Service) {
        self.state.lock().services.push(service);
    }

    /// Store a deployment, replacing one with the same name
    pub fn add_deployment(&self, deployment: Deployment) {
        let r = reference(
            "apps/v1",
            "Deployment",
            &deployment.namespace().unwrap_or_default(),
            &deployment.name_any(),
        );
        let labels = deployment.labels().clone();
        self.put_workload(r, labels, Workload::Deployment(deployment));
    }

    /// Store a stateful set, replacing one with the same name
    pub fn add_stateful_set(&self, sts: StatefulSet) {
        let r = reference("apps/v1", "StatefulSet", &sts.namespace().unwrap_or_default(), &sts.name_any());
        let labels = sts.labels().clone();
        self.put_workload(r, labels, Workload::StatefulSet(sts));
    }

    /// Store a daemon set, replacing one with the same name
    pub fn add_daemon_set(&self, daemon: DaemonSet) {
        let r = reference("apps/v1", "DaemonSet", &daemon.namespace().unwrap_or_default(), &daemon.name_any());
        let labels = daemon.labels().clone();
        self.put_workload(r, labels, Workload::DaemonSet(daemon));
    }

    /// An object of a kind without a rollout check
    pub fn add_object(&self, api_version: &str, kind: &str, namespace: &str, name: &str, labels: BTreeMap<String, String>) {
        let r = reference(api_version, kind, namespace, name);
        self.put_workload(r, labels, Workload::Other { kind: kind.to_owned() });
    }

    /// Mutate a stored deployment in place
    pub fn update_deployment(&self, namespace: &str, name: &str, f: impl FnOnce(&mut Deployment)) {
        let mut state = self.state.lock();
        for (r, _, w) in &mut state.workloads {
            if r.namespace.as_deref() == Some(namespace) && r.name.as_deref() == Some(name) {
                if let Workload::Deployment(d) = w {
                    f(d);
                    return;
                }
            }
        }
    }

    /// Mutate a stored daemon set in place
    pub fn update_daemon_set(&self, namespace: &str, name: &str, f: impl FnOnce(&mut DaemonSet)) {
        let mut state = self.state.lock();
        for (r, _, w) in &mut state.workloads {
            if r.namespace.as_deref() == Some(namespace) && r.name.as_deref() == Some(name) {
                if let Workload::DaemonSet(d) = w {
                    f(d);
                    return;
                }
            }
        }
    }

    fn put_workload(&self, r: ObjectReference, labels: BTreeMap<String, String>, workload: Workload) {
        let mut state = self.state.lock();
        state.workloads.retain(|(existing, _, _)| !same_object(existing, &r));
        state.workloads.push((r, labels, workload));
    }

    /// Fail the next `n` patch requests
    pub fn fail_patches(&self, n: u32) {
        self.state.lock().patch_failures = n;
    }

    /// Reject the next `n` trial updates as stale
    pub fn conflict_updates(&self, n: u32) {
        self.state.lock().conflicts = n;
    }

    /// Patches that were applied, in order
    pub fn patches(&self) -> Vec<AppliedPatch> {
        self.state.lock().patches.clone()
    }

    /// Number of successful trial updates
    pub fn trial_writes(&self) -> usize {
        self.state.lock().trial_writes
    }

    /// Number of jobs created through the [`Cluster`] seam
    pub fn jobs_created(&self) -> usize {
        self.state.lock().jobs_created
    }
}

fn same_object(a: &ObjectReference, b: &ObjectReference) -> bool {
    a.kind == b.kind && a.namespace == b.namespace && a.name == b.name
}

fn in_namespace(namespace: Option<String>, wanted: &str) -> bool {
    namespace.as_deref().unwrap_or("default") == wanted
}

#[async_trait]
impl Cluster for FakeCluster {
    async fn get_experiment(&self, namespace: &str, name: &str) -> Result<Option<Experiment>, ClusterError> {
        Ok(self
            .state
            .lock()
            .experiments
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned())
    }

    async fn update_trial(&self, trial: &Trial) -> Result<Trial, ClusterError> {
        let mut state = self.state.lock();
        if state.conflicts > 0 {
            state.conflicts -= 1;
            return Err(ClusterError::Conflict(format!(
                "the object has been modified; trial {}",
                trial.name_any()
            )));
        }
        let mut stored = trial.clone();
        let version = stored
            .metadata
            .resource_version
            .as_deref()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or_default();
        stored.metadata.resource_version = Some((version + 1).to_string());

        // A deleted trial goes away with its last finalizer
        let k = key(stored.namespace(), stored.name_any());
        if stored.metadata.deletion_timestamp.is_some() && stored.finalizers().is_empty() {
            state.trials.remove(&k);
        } else {
            state.trials.insert(k, stored.clone());
        }
        state.trial_writes += 1;
        Ok(stored)
    }

    async fn list_jobs(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<Job>, ClusterError> {
        Ok(self
            .state
            .lock()
            .jobs
            .iter()
            .filter(|j| in_namespace(j.namespace(), namespace) && selector::matches(selector, j.labels()))
            .cloned()
            .collect())
    }

    async fn create_job(&self, job: &Job) -> Result<(), ClusterError> {
        let mut state = self.state.lock();
        let exists = state
            .jobs
            .iter()
            .any(|j| j.name_any() == job.name_any() && j.namespace() == job.namespace());
        if exists {
            return Err(ClusterError::AlreadyExists(format!("jobs \"{}\" already exists", job.name_any())));
        }
        state.jobs.push(job.clone());
        state.jobs_created += 1;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<Pod>, ClusterError> {
        Ok(self
            .state
            .lock()
            .pods
            .iter()
            .filter(|p| in_namespace(p.namespace(), namespace) && selector::matches(selector, p.labels()))
            .cloned()
            .collect())
    }

    async fn list_services(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<Service>, ClusterError> {
        Ok(self
            .state
            .lock()
            .services
            .iter()
            .filter(|s| in_namespace(s.namespace(), namespace) && selector::matches(selector, s.labels()))
            .cloned()
            .collect())
    }

    async fn list_references(
        &self,
        namespace: &str,
        api_version: &str,
        kind: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<ObjectReference>, ClusterError> {
        Ok(self
            .state
            .lock()
            .workloads
            .iter()
            .filter(|(r, labels, _)| {
                r.kind.as_deref() == Some(kind)
                    && r.api_version.as_deref() == Some(api_version)
                    && r.namespace.as_deref() == Some(namespace)
                    && selector::matches(selector, labels)
            })
            .map(|(r, _, _)| r.clone())
            .collect())
    }

    async fn patch(&self, target: &ObjectReference, patch_type: PatchType, data: &str) -> Result<(), ClusterError> {
        let mut state = self.state.lock();
        if state.patch_failures > 0 {
            state.patch_failures -= 1;
            return Err(ClusterError::Api {
                code: 422,
                message: "the patch could not be applied".to_owned(),
            });
        }
        if !state.workloads.iter().any(|(r, _, _)| same_object(r, target)) {
            return Err(ClusterError::NotFound(format!(
                "{} \"{}\" not found",
                target.kind.as_deref().unwrap_or_default(),
                target.name.as_deref().unwrap_or_default()
            )));
        }
        state.patches.push(AppliedPatch {
            target: target.clone(),
            patch_type,
            data: data.to_owned(),
        });
        Ok(())
    }

    async fn get_workload(&self, target: &ObjectReference) -> Result<Option<Workload>, ClusterError> {
        Ok(self
            .state
            .lock()
            .workloads
            .iter()
            .find(|(r, _, _)| same_object(r, target))
            .map(|(_, _, w)| w.clone()))
    }
}

/// A request the scripted backend answered
#[derive(Debug, Clone, PartialEq)]
pub enum MetricRequest {
    /// Scrape targets of a server
    Targets(String),
    /// Instant query
    Query {
        /// Server address
        address: String,
        /// Rendered query
        query: String,
        /// Evaluation time
        time: DateTime<Utc>,
    },
    /// JSON document fetch, by URL
    Json(String),
}

#[derive(Default)]
struct Script {
    targets: Vec<ScrapeTarget>,
    queries: HashMap<String, QueryValue>,
    documents: HashMap<String, serde_json::Value>,
    requests: Vec<MetricRequest>,
}

/// Scripted [`MetricBackend`]
///
/// Queries and URLs without a scripted answer behave like a backend that has no data:
/// a query fails with "not available", a URL answers with a non-200 status.
#[derive(Default, Clone)]
pub struct StaticMetrics {
    script: Arc<Mutex<Script>>,
}

impl StaticMetrics {
    /// A backend with nothing scripted
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an active scrape target
    pub fn with_target(self, health: &str, last_scrape: DateTime<Utc>) -> Self {
        self.script.lock().targets.push(ScrapeTarget {
            health: health.to_owned(),
            last_scrape,
        });
        self
    }

    /// Answer `query` with `value`
    pub fn with_query(self, query: &str, value: QueryValue) -> Self {
        self.script.lock().queries.insert(query.to_owned(), value);
        self
    }

    /// Serve `document` at `url`
    pub fn with_document(self, url: &str, document: serde_json::Value) -> Self {
        self.script.lock().documents.insert(url.to_owned(), document);
        self
    }

    /// Replace the scrape targets
    pub fn set_targets(&self, targets: Vec<ScrapeTarget>) {
        self.script.lock().targets = targets;
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<MetricRequest> {
        self.script.lock().requests.clone()
    }
}

#[async_trait]
impl MetricBackend for StaticMetrics {
    async fn prometheus_targets(&self, address: &str) -> Result<Vec<ScrapeTarget>, CaptureError> {
        let mut script = self.script.lock();
        script.requests.push(MetricRequest::Targets(address.to_owned()));
        Ok(script.targets.clone())
    }

    async fn prometheus_query(&self, address: &str, query: &str, time: DateTime<Utc>) -> Result<QueryValue, CaptureError> {
        let mut script = self.script.lock();
        script.requests.push(MetricRequest::Query {
            address: address.to_owned(),
            query: query.to_owned(),
            time,
        });
        script
            .queries
            .get(query)
            .cloned()
            .ok_or_else(|| CaptureError::not_available(query))
    }

    async fn fetch_json(&self, url: &str) -> Result<serde_json::Value, CaptureError> {
        let mut script = self.script.lock();
        script.requests.push(MetricRequest::Json(url.to_owned()));
        script.documents.get(url).cloned().ok_or(CaptureError::NoValueYet(404))
    }
}

/// A clock that only moves when told to
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    /// A clock stopped at `now`
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    /// A clock at a fixed, arbitrary instant
    pub fn epoch() -> Self {
        Self::new(Utc.timestamp_opt(1_700_000_000, 0).single().unwrap_or_default())
    }

    /// Move the clock forward
    pub fn advance(&self, secs: i64) {
        let mut now = self.now.lock();
        *now += TimeDelta::seconds(secs);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Everything a reconciliation test needs
pub struct Harness {
    /// Cluster behind `ctx`
    pub cluster: FakeCluster,
    /// Metric backend behind `ctx`
    pub metrics: StaticMetrics,
    /// Clock behind `ctx`
    pub clock: Arc<FixedClock>,
    /// Engine context to reconcile with
    pub ctx: Context,
}

impl Harness {
    /// Harness with the default engine configuration
    pub fn new(metrics: StaticMetrics) -> Self {
        Self::with_config(metrics, EngineConfig::default())
    }

    /// Harness with a custom engine configuration
    pub fn with_config(metrics: StaticMetrics, config: EngineConfig) -> Self {
        let cluster = FakeCluster::new();
        let clock = Arc::new(FixedClock::epoch());
        let ctx = Context::new(Arc::new(cluster.clone()), Arc::new(metrics.clone()))
            .with_clock(clock.clone())
            .with_config(config);
        Self {
            cluster,
            metrics,
            clock,
            ctx,
        }
    }
}
