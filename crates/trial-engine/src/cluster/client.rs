use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ObjectReference, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::{Client, ResourceExt};
use tracing::debug;
use trial_api::{selector, Experiment, PatchType, Trial};

use super::{Cluster, Workload};
use crate::error::ClusterError;

/// [`Cluster`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Wrap a kube client
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn dynamic(&self, namespace: Option<&str>, api_version: &str, kind: &str) -> Api<DynamicObject> {
        let (group, version) = parse_api_version(api_version);
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, kind));
        match namespace.filter(|ns| !ns.is_empty()) {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }
}

impl From<kube::Error> for ClusterError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) if ae.code == 404 => Self::NotFound(ae.message),
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                Self::AlreadyExists(ae.message)
            }
            kube::Error::Api(ae) if ae.code == 409 => Self::Conflict(ae.message),
            kube::Error::Api(ae) => Self::Api {
                code: ae.code,
                message: ae.message,
            },
            kube::Error::SerdeError(e) => Self::Payload(e.to_string()),
            other => Self::Transport(other.to_string()),
        }
    }
}

fn list_params(selector: &LabelSelector) -> Result<ListParams, ClusterError> {
    let query = selector::to_query(selector)?;
    if query.is_empty() {
        Ok(ListParams::default())
    } else {
        Ok(ListParams::default().labels(&query))
    }
}

/// Split an apiVersion into group and version
fn parse_api_version(api_version: &str) -> (&str, &str) {
    match api_version.rsplit_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn get_experiment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Experiment>, ClusterError> {
        let api: Api<Experiment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn update_trial(&self, trial: &Trial) -> Result<Trial, ClusterError> {
        let namespace = trial.namespace_or_default();
        let name = trial.name_any();
        let api: Api<Trial> = Api::namespaced(self.client.clone(), &namespace);

        let mut updated = api.replace(&name, &PostParams::default(), trial).await?;

        // Dropping the last finalizer of a deleted trial removes it
        if updated.is_deleting() && updated.finalizers().is_empty() {
            return Ok(updated);
        }
        if updated.status == trial.status {
            return Ok(updated);
        }

        updated.status.clone_from(&trial.status);
        let data = serde_json::to_vec(&updated).map_err(|e| ClusterError::Payload(e.to_string()))?;
        let updated = api.replace_status(&name, &PostParams::default(), data).await?;
        debug!(trial = %name, namespace = %namespace, "Trial updated");
        Ok(updated)
    }

    async fn list_jobs(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Job>, ClusterError> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&list_params(selector)?).await?.items)
    }

    async fn create_job(&self, job: &Job) -> Result<(), ClusterError> {
        let namespace = job.namespace().unwrap_or_default();
        let api: Api<Job> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), job).await?;
        Ok(())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Pod>, ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&list_params(selector)?).await?.items)
    }

    async fn list_services(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Service>, ClusterError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&list_params(selector)?).await?.items)
    }

    async fn list_references(
        &self,
        namespace: &str,
        api_version: &str,
        kind: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<ObjectReference>, ClusterError> {
        let api = self.dynamic(Some(namespace), api_version, kind);
        let list = api.list(&list_params(selector)?).await?;
        Ok(list
            .items
            .into_iter()
            .map(|obj| ObjectReference {
                api_version: Some(api_version.to_owned()),
                kind: Some(kind.to_owned()),
                name: obj.metadata.name,
                namespace: obj.metadata.namespace,
                ..Default::default()
            })
            .collect())
    }

    async fn patch(
        &self,
        target: &ObjectReference,
        patch_type: PatchType,
        data: &str,
    ) -> Result<(), ClusterError> {
        let api = self.dynamic(
            target.namespace.as_deref(),
            target.api_version.as_deref().unwrap_or("v1"),
            target.kind.as_deref().unwrap_or_default(),
        );
        let name = target.name.as_deref().unwrap_or_default();
        let params = PatchParams::default();
        let payload = |e: serde_json::Error| ClusterError::Payload(e.to_string());

        match patch_type {
            PatchType::Json => {
                let ops: json_patch::Patch = serde_json::from_str(data).map_err(payload)?;
                api.patch(name, &params, &Patch::<()>::Json(ops)).await?;
            }
            PatchType::Merge => {
                let value: serde_json::Value = serde_json::from_str(data).map_err(payload)?;
                api.patch(name, &params, &Patch::Merge(&value)).await?;
            }
            PatchType::Strategic => {
                let value: serde_json::Value = serde_json::from_str(data).map_err(payload)?;
                api.patch(name, &params, &Patch::Strategic(&value)).await?;
            }
        }
        Ok(())
    }

    async fn get_workload(
        &self,
        target: &ObjectReference,
    ) -> Result<Option<Workload>, ClusterError> {
        let namespace = target.namespace.as_deref().unwrap_or("default");
        let name = target.name.as_deref().unwrap_or_default();
        let client = self.client.clone();

        let workload = match target.kind.as_deref().unwrap_or_default() {
            "Deployment" => Api::<Deployment>::namespaced(client, namespace)
                .get_opt(name)
                .await?
                .map(Workload::Deployment),
            "DaemonSet" => Api::<DaemonSet>::namespaced(client, namespace)
                .get_opt(name)
                .await?
                .map(Workload::DaemonSet),
            "StatefulSet" => Api::<StatefulSet>::namespaced(client, namespace)
                .get_opt(name)
                .await?
                .map(Workload::StatefulSet),
            other => Some(Workload::Other {
                kind: other.to_owned(),
            }),
        };
        Ok(workload)
    }
}
