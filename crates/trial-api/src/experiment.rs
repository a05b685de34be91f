//! Experiment resource
//!
//! An experiment is read-only input to the controller. It supplies the parameter
//! space, the patch templates, the metrics to collect and the template trials are
//! stamped from.

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::trial::TrialSpec;

/// Experiment definition shared by many trials
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "trialrunner.dev",
    version = "v1alpha1",
    kind = "Experiment",
    namespaced,
    shortname = "exp"
)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentSpec {
    /// Parameters a trial must assign
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    /// Templates rendered into patch operations for every trial
    #[serde(default)]
    pub patches: Vec<PatchTemplate>,
    /// Values collected once a trial's job completes
    #[serde(default)]
    pub metrics: Vec<Metric>,
    /// Template new trials are created from
    #[serde(default)]
    pub template: TrialTemplateSpec,
}

/// Template for trials of an experiment
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrialTemplateSpec {
    /// Labels copied onto new trials
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Spec copied onto new trials
    #[serde(default)]
    pub spec: TrialSpec,
}

/// A tunable parameter
///
/// Numeric parameters are bounded by `min..=max`. A parameter with `values` is
/// categorical: its assignment is an index into the list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    /// Parameter name
    pub name: String,
    /// Inclusive lower bound
    #[serde(default)]
    pub min: i64,
    /// Inclusive upper bound
    #[serde(default)]
    pub max: i64,
    /// Categorical labels
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl Parameter {
    /// Whether `value` lies within the parameter's bounds
    #[must_use]
    pub fn contains(&self, value: i64) -> bool {
        if self.values.is_empty() {
            (self.min..=self.max).contains(&value)
        } else {
            usize::try_from(value).is_ok_and(|i| i < self.values.len())
        }
    }

    /// Value exposed to templates for an assignment
    #[must_use]
    pub fn template_value(&self, value: i64) -> serde_json::Value {
        usize::try_from(value)
            .ok()
            .and_then(|i| self.values.get(i))
            .map_or_else(|| serde_json::Value::from(value), |label| serde_json::Value::from(label.as_str()))
    }
}

/// Encoding of a patch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PatchType {
    /// RFC 6902 JSON patch document
    Json,
    /// RFC 7386 merge patch
    Merge,
    /// Kubernetes strategic merge patch
    #[default]
    Strategic,
}

impl fmt::Display for PatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PatchType::Json => "json",
            PatchType::Merge => "merge",
            PatchType::Strategic => "strategic",
        })
    }
}

/// Template producing patches for one or more targets
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PatchTemplate {
    /// Patch encoding
    #[serde(rename = "type", default)]
    pub patch_type: PatchType,
    /// Template text rendering to a YAML or JSON patch
    #[serde(default)]
    pub patch: String,
    /// Target object; a missing name selects every object of the kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ref: Option<ObjectReference>,
    /// Labels used to select targets when the reference has no name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
}

/// Source a metric is collected from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    /// The rendered query is the value
    #[default]
    Local,
    /// Prometheus instant query
    Prometheus,
    /// JSON document fetched over HTTP
    #[serde(rename = "jsonpath")]
    JsonPath,
}

/// A value to collect for every trial
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    /// Metric name
    pub name: String,
    /// Whether lower values are better
    #[serde(default)]
    pub minimize: bool,
    /// Collection source
    #[serde(rename = "type", default)]
    pub metric_type: MetricType,
    /// Query template
    pub query: String,
    /// Template for the standard deviation query
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_query: Option<String>,
    /// URL scheme for service targets (`http` or `https`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    /// Services to query
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
    /// Service port, by number or name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<IntOrString>,
    /// Request path on the service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Fixed endpoint, used instead of service discovery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_bounds_are_inclusive() {
        let p = Parameter {
            name: "cpu".into(),
            min: 100,
            max: 4000,
            values: vec![],
        };
        assert!(p.contains(100));
        assert!(p.contains(4000));
        assert!(!p.contains(4001));
        assert_eq!(p.template_value(250), serde_json::json!(250));
    }

    #[test]
    fn categorical_values_index_labels() {
        let p = Parameter {
            name: "gc".into(),
            values: vec!["serial".into(), "g1".into()],
            ..Default::default()
        };
        assert!(p.contains(1));
        assert!(!p.contains(2));
        assert!(!p.contains(-1));
        assert_eq!(p.template_value(1), serde_json::json!("g1"));
    }

    #[test]
    fn metric_types_parse() {
        let m: Metric = serde_json::from_value(serde_json::json!({
            "name": "latency",
            "type": "jsonpath",
            "query": "data.v",
        }))
        .unwrap();
        assert_eq!(m.metric_type, MetricType::JsonPath);

        let p: PatchTemplate = serde_json::from_value(serde_json::json!({ "patch": "{}" })).unwrap();
        assert_eq!(p.patch_type, PatchType::Strategic);
    }

    #[test]
    fn unknown_patch_type_is_rejected() {
        let p = serde_json::from_value::<PatchTemplate>(serde_json::json!({ "type": "replace" }));
        assert!(p.is_err());
    }
}
