//! Trial resource
//!
//! A trial is one run of an experiment with fixed assignments. Its spec carries the
//! bookkeeping the controller derives (patch operations, metric values); its status
//! carries timing and the condition list.

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::JobTemplateSpec;
use k8s_openapi::api::core::v1::{ObjectReference, Volume, VolumeMount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::budget::RetryBudget;
use crate::condition::{self, Applied, ConditionStatus, ConditionType, TrialCondition};
use crate::experiment::PatchType;
use crate::labels;

/// One concrete run of an experiment
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "trialrunner.dev",
    version = "v1alpha1",
    kind = "Trial",
    namespaced,
    status = "TrialStatus",
    shortname = "tr"
)]
#[serde(rename_all = "camelCase")]
pub struct TrialSpec {
    /// Experiment this trial belongs to; defaults to the experiment label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_ref: Option<ObjectReference>,
    /// Namespace of patched objects; defaults to the trial namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,
    /// Parameter values for this run
    #[serde(default)]
    pub assignments: Vec<Assignment>,
    /// Selector for the trial's jobs; defaults to the job template labels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
    /// Template of the trial job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<JobTemplateSpec>,
    /// Seconds added to the observed job start time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time_offset_seconds: Option<i64>,
    /// Expected run time of the default sleep workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approximate_runtime_seconds: Option<i64>,
    /// Captured metric values
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<TrialValue>,
    /// Patches derived from the experiment, computed once
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patch_operations: Vec<PatchOperation>,
    /// One-shot tasks run before and after the trial
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub setup_tasks: Vec<SetupTask>,
    /// Volumes available to setup task containers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub setup_volumes: Vec<Volume>,
    /// Service account used by setup jobs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_service_account_name: Option<String>,
}

/// A parameter assignment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Assignment {
    /// Parameter name
    pub name: String,
    /// Assigned value
    pub value: i64,
}

/// A captured metric value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrialValue {
    /// Metric name
    pub name: String,
    /// Captured value, formatted as a float
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Captured standard deviation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Capture attempts
    #[serde(flatten)]
    pub budget: RetryBudget,
}

/// A concrete patch against one object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PatchOperation {
    /// Object to patch
    pub target_ref: ObjectReference,
    /// Patch encoding
    pub patch_type: PatchType,
    /// JSON patch payload; empty for stability-only operations
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
    /// Apply attempts
    #[serde(flatten)]
    pub budget: RetryBudget,
    /// Whether the target must roll out before the trial job runs
    #[serde(default)]
    pub wait: bool,
}

/// A setup or teardown task
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SetupTask {
    /// Task name, used as the container name suffix
    pub name: String,
    /// Container image; defaults to the setup tools image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Container command, only honored with an explicit image
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    /// Container arguments; defaults to the mode
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Do not run this task when setting up
    #[serde(default)]
    pub skip_create: bool,
    /// Do not run this task when tearing down
    #[serde(default)]
    pub skip_delete: bool,
    /// Mounts of `setup_volumes`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
    /// Helm chart installed by the task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm_chart: Option<String>,
    /// Helm chart version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm_chart_version: Option<String>,
    /// Helm repository URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm_repository: Option<String>,
    /// Helm values
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub helm_values: Vec<HelmValue>,
    /// Config maps holding additional values files
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub helm_values_from: Vec<String>,
}

/// A single Helm value
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HelmValue {
    /// Dotted value path
    pub name: String,
    /// Pass the value with `--set-string`
    #[serde(default)]
    pub force_string: bool,
    /// Template rendered against the assignments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Parameter whose assignment is the value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
}

/// Observed state of a trial
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrialStatus {
    /// Assignments, as `a=1, b=2`
    #[serde(default)]
    pub assignments: String,
    /// Captured values, as `name=value`
    #[serde(default)]
    pub values: String,
    /// Start of the trial job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// Completion of the trial job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
    /// Progress conditions
    #[serde(default)]
    pub conditions: Vec<TrialCondition>,
}

impl TrialStatus {
    /// Condition of the given kind
    #[must_use]
    pub fn condition(&self, type_: ConditionType) -> Option<&TrialCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

impl Trial {
    /// Namespace of the trial
    #[must_use]
    pub fn namespace_or_default(&self) -> String {
        self.namespace().unwrap_or_else(|| "default".to_owned())
    }

    /// Namespace of patched objects
    #[must_use]
    pub fn target_namespace(&self) -> String {
        self.spec
            .target_namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| self.namespace_or_default())
    }

    /// `(namespace, name)` of the owning experiment
    #[must_use]
    pub fn experiment_key(&self) -> (String, String) {
        let mut namespace = self.namespace_or_default();
        let mut name = self.name_any();
        if let Some(label) = self.labels().get(labels::EXPERIMENT) {
            name.clone_from(label);
        } else if let Some(r) = &self.spec.experiment_ref {
            if let Some(n) = &r.name {
                name.clone_from(n);
            }
            if let Some(ns) = r.namespace.as_ref().filter(|ns| !ns.is_empty()) {
                namespace.clone_from(ns);
            }
        }
        (namespace, name)
    }

    /// Status of a condition, if present
    #[must_use]
    pub fn condition_status(&self, type_: ConditionType) -> Option<ConditionStatus> {
        self.status
            .as_ref()
            .and_then(|s| s.condition(type_))
            .map(|c| c.status)
    }

    /// Whether a condition is present with the given status
    #[must_use]
    pub fn has_condition(&self, type_: ConditionType, status: ConditionStatus) -> bool {
        self.condition_status(type_) == Some(status)
    }

    /// Whether the trial completed or failed
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.has_condition(ConditionType::Complete, ConditionStatus::True)
            || self.has_condition(ConditionType::Failed, ConditionStatus::True)
    }

    /// Whether deletion was requested
    #[must_use]
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Status, created on first use
    pub fn status_mut(&mut self) -> &mut TrialStatus {
        self.status.get_or_insert_with(TrialStatus::default)
    }

    /// Apply a condition, see [`condition`](crate::condition)
    pub fn apply_condition(
        &mut self,
        type_: ConditionType,
        status: ConditionStatus,
        reason: Option<&str>,
        message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Applied {
        condition::apply(
            &mut self.status_mut().conditions,
            type_,
            status,
            reason,
            message,
            now,
        )
    }

    /// Mark the trial failed
    pub fn fail(&mut self, reason: &str, message: &str, now: DateTime<Utc>) -> Applied {
        self.apply_condition(
            ConditionType::Failed,
            ConditionStatus::True,
            Some(reason),
            Some(message),
            now,
        )
    }

    /// Whether the finalizer is present
    #[must_use]
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers().iter().any(|f| f == finalizer)
    }

    /// Add a finalizer, returning `true` if it was missing
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers_mut().push(finalizer.to_owned());
        true
    }

    /// Remove a finalizer, returning `true` if it was present
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers().len();
        self.finalizers_mut().retain(|f| f != finalizer);
        before != self.finalizers().len()
    }

    /// Assignment for a parameter
    #[must_use]
    pub fn assignment(&self, name: &str) -> Option<i64> {
        self.spec
            .assignments
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value)
    }

    /// Labels put on the trial job when none are configured
    #[must_use]
    pub fn default_job_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (labels::TRIAL.to_owned(), self.name_any()),
            (labels::TRIAL_ROLE.to_owned(), labels::ROLE_TRIAL_RUN.to_owned()),
        ])
    }

    /// Selector matching the trial job
    #[must_use]
    pub fn job_selector(&self) -> LabelSelector {
        if let Some(selector) = &self.spec.selector {
            return selector.clone();
        }
        let template_labels = self
            .spec
            .template
            .as_ref()
            .and_then(|t| t.metadata.as_ref())
            .and_then(|m| m.labels.clone())
            .filter(|l| !l.is_empty());
        LabelSelector {
            match_labels: Some(template_labels.unwrap_or_else(|| self.default_job_labels())),
            ..Default::default()
        }
    }

    /// Value for a metric, created with `attempts` on first use
    pub fn value_mut(&mut self, name: &str, attempts: u32) -> &mut TrialValue {
        let idx = match self.spec.values.iter().position(|v| v.name == name) {
            Some(idx) => idx,
            None => {
                self.spec.values.push(TrialValue {
                    name: name.to_owned(),
                    budget: RetryBudget::new(attempts),
                    ..Default::default()
                });
                self.spec.values.len() - 1
            }
        };
        &mut self.spec.values[idx]
    }

    /// Recompute `status.assignments` and `status.values`
    pub fn refresh_summaries(&mut self) {
        let assignments = self
            .spec
            .assignments
            .iter()
            .map(|a| format!("{}={}", a.name, a.value))
            .collect::<Vec<_>>()
            .join(", ");
        let values = self
            .spec
            .values
            .iter()
            .filter_map(|v| v.value.as_ref().map(|value| format!("{}={value}", v.name)))
            .collect::<Vec<_>>()
            .join(", ");
        let status = self.status_mut();
        status.assignments = assignments;
        status.values = values;
    }
}
