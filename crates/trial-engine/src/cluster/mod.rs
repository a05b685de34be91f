//! Cluster access seam
//!
//! Every read and write the engine performs goes through [`Cluster`], so a pass can be
//! driven against the real API server ([`KubeCluster`]) or an in-memory double.

mod client;

pub use client::KubeCluster;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ObjectReference, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
#[cfg(test)]
use mockall::automock;
use trial_api::{Experiment, PatchType, Trial};

use crate::error::ClusterError;

/// A patch target, fetched for a stability check
#[derive(Debug, Clone)]
pub enum Workload {
    /// apps/v1 Deployment
    Deployment(Deployment),
    /// apps/v1 DaemonSet
    DaemonSet(DaemonSet),
    /// apps/v1 StatefulSet
    StatefulSet(StatefulSet),
    /// Any kind without a rollout check
    Other {
        /// Object kind
        kind: String,
    },
}

impl Workload {
    /// Whether the kind has a rollout check
    #[must_use]
    pub fn is_checked_kind(kind: &str) -> bool {
        matches!(kind, "Deployment" | "DaemonSet" | "StatefulSet")
    }
}

/// Operations the engine needs from the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Fetch an experiment, `None` if it does not exist
    async fn get_experiment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Experiment>, ClusterError>;

    /// Persist a trial's metadata, spec and status
    async fn update_trial(&self, trial: &Trial) -> Result<Trial, ClusterError>;

    /// Jobs matching a selector
    async fn list_jobs(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Job>, ClusterError>;

    /// Create a job
    async fn create_job(&self, job: &Job) -> Result<(), ClusterError>;

    /// Pods matching a selector
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Pod>, ClusterError>;

    /// Services matching a selector
    async fn list_services(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Service>, ClusterError>;

    /// References to every object of a kind matching a selector
    async fn list_references(
        &self,
        namespace: &str,
        api_version: &str,
        kind: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<ObjectReference>, ClusterError>;

    /// Apply a patch to an object
    async fn patch(
        &self,
        target: &ObjectReference,
        patch_type: PatchType,
        data: &str,
    ) -> Result<(), ClusterError>;

    /// Fetch a patch target for a stability check, `None` if it is gone
    async fn get_workload(&self, target: &ObjectReference)
        -> Result<Option<Workload>, ClusterError>;
}
