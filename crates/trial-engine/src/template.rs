//! Patch, query and Helm value templates
//!
//! Templates use Jinja syntax. Patch templates see `values.<parameter>` and `trial`;
//! metric queries additionally see `start_time`, `completion_time` and `range`.
//!
//! ```text
//! spec:
//!   replicas: {{ values.replicas }}
//!   template: {"metadata": {"labels": {"trial": "{{ trial.name }}"}}}
//! ```
//!
//! Two helpers are registered: `percent(value, pct)` and `duration(start, end)`.

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use minijinja::{Environment, ErrorKind, UndefinedBehavior};
use serde_json::{json, Map, Value};
use trial_api::{Experiment, Trial};

use crate::error::TemplateError;

/// Renders templates against a trial
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl TemplateEngine {
    /// Create an engine with the helper functions registered
    #[must_use]
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.add_function("percent", percent);
        env.add_function("duration", duration);
        Self { env }
    }

    /// Render a patch template to JSON, or an empty string for an empty patch
    ///
    /// # Errors
    ///
    /// Fails when the template does not render or the output is not YAML or JSON.
    pub fn render_patch(
        &self,
        source: &str,
        trial: &Trial,
        experiment: &Experiment,
    ) -> Result<String, TemplateError> {
        let rendered = self.env.render_str(source, base_context(trial, experiment))?;
        if rendered.trim().is_empty() {
            return Ok(String::new());
        }
        let doc: Value = serde_yaml::from_str(&rendered)?;
        if doc.is_null() {
            return Ok(String::new());
        }
        Ok(serde_json::to_string(&doc)?)
    }

    /// Render a metric query
    ///
    /// # Errors
    ///
    /// Fails when the template does not render.
    pub fn render_query(
        &self,
        source: &str,
        trial: &Trial,
        experiment: &Experiment,
    ) -> Result<String, TemplateError> {
        let mut ctx = base_context(trial, experiment);
        let status = trial.status.clone().unwrap_or_default();
        if let Some(map) = ctx.as_object_mut() {
            let start = status.start_time;
            let end = status.completion_time;
            map.insert("start_time".into(), json!(start.map(|t| t.to_rfc3339())));
            map.insert("completion_time".into(), json!(end.map(|t| t.to_rfc3339())));
            let range = match (start, end) {
                (Some(s), Some(e)) => format!("{}s", (e - s).num_seconds().max(0)),
                _ => "0s".to_owned(),
            };
            map.insert("range".into(), json!(range));
        }
        Ok(self.env.render_str(source, ctx)?)
    }

    /// Render a free-form value, such as a Helm value
    ///
    /// # Errors
    ///
    /// Fails when the template does not render.
    pub fn render_value(
        &self,
        source: &str,
        trial: &Trial,
        experiment: Option<&Experiment>,
    ) -> Result<String, TemplateError> {
        let ctx = match experiment {
            Some(exp) => base_context(trial, exp),
            None => base_context(trial, &Experiment::new("", Default::default())),
        };
        Ok(self.env.render_str(source, ctx)?)
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn base_context(trial: &Trial, experiment: &Experiment) -> Value {
    let mut values = Map::new();
    for a in &trial.spec.assignments {
        let value = experiment
            .spec
            .parameters
            .iter()
            .find(|p| p.name == a.name)
            .map_or_else(|| json!(a.value), |p| p.template_value(a.value));
        values.insert(a.name.clone(), value);
    }
    json!({
        "trial": {
            "name": trial.name_any(),
            "namespace": trial.namespace_or_default(),
        },
        "values": values,
    })
}

/// `pct` percent of `value`, truncated
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn percent(value: i64, pct: i64) -> i64 {
    (value as f64 * (pct as f64 / 100.0)) as i64
}

/// Seconds between two RFC 3339 timestamps
#[allow(clippy::cast_precision_loss)]
fn duration(start: String, end: String) -> Result<f64, minijinja::Error> {
    let parse = |s: &str| {
        DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| minijinja::Error::new(ErrorKind::InvalidOperation, format!("invalid time '{s}': {e}")))
    };
    let elapsed = parse(&end)? - parse(&start)?;
    Ok(elapsed.num_milliseconds() as f64 / 1000.0)
}
