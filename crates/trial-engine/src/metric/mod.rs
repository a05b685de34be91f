//! Metric capture
//!
//! Once the trial job has a completion time, metrics are captured one per pass, in
//! experiment order. Each metric value has its own retry budget; a Prometheus backend
//! that has not scraped past the completion time asks for a delay instead of
//! consuming an attempt.

mod http;
mod jsonpath;
mod local;
mod prometheus;
mod target;

pub use http::HttpMetricBackend;
pub use jsonpath::evaluate as evaluate_json_path;
pub use target::resolve_urls;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::ResourceExt;
#[cfg(test)]
use mockall::automock;
use std::time::Duration;
use tracing::{debug, info, warn};
use trial_api::{BudgetState, ConditionStatus, ConditionType, Experiment, Metric, MetricType, Trial};

use crate::context::{Outcome, Pass};
use crate::error::{CaptureError, ReconcileError};

/// One active Prometheus scrape target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeTarget {
    /// Reported health (`up`, `down`, `unknown`)
    pub health: String,
    /// Time of the last scrape
    pub last_scrape: DateTime<Utc>,
}

/// Result of a Prometheus instant query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    /// A scalar sample
    Scalar(f64),
    /// Any other result type, by name
    Other(String),
}

/// Remote metric sources
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MetricBackend: Send + Sync {
    /// Active targets of a Prometheus server
    async fn prometheus_targets(&self, address: &str) -> Result<Vec<ScrapeTarget>, CaptureError>;

    /// Instant query against a Prometheus server
    async fn prometheus_query(
        &self,
        address: &str,
        query: &str,
        time: DateTime<Utc>,
    ) -> Result<QueryValue, CaptureError>;

    /// Fetch a JSON document
    ///
    /// A non-200 response is [`CaptureError::NoValueYet`], which costs the metric an
    /// attempt like any other capture failure.
    async fn fetch_json(&self, url: &str) -> Result<serde_json::Value, CaptureError>;
}

/// Result of a capture attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Capture {
    /// Captured value and standard deviation
    Value {
        /// Metric value
        value: f64,
        /// Standard deviation, zero when unknown
        error: f64,
    },
    /// The source is not ready; try again after the delay
    RetryAfter(Duration),
}

/// Query inputs for one capture attempt
pub struct Query<'a> {
    /// Metric name
    pub name: &'a str,
    /// Source kind
    pub metric_type: MetricType,
    /// Rendered query
    pub query: &'a str,
    /// Rendered error query
    pub error_query: Option<&'a str>,
    /// Trial completion time
    pub completion_time: DateTime<Utc>,
    /// Delay requested while a source catches up
    pub retry_after: Duration,
}

/// Capture a metric from the first target that answers
///
/// Local metrics ignore `urls`. Remote metrics try each URL in turn; a transport
/// failure moves on to the next URL, any other failure is returned immediately.
///
/// # Errors
///
/// Returns the capture failure of the last target tried.
pub async fn capture(
    backend: &dyn MetricBackend,
    query: &Query<'_>,
    urls: &[String],
) -> Result<Capture, CaptureError> {
    let result = match query.metric_type {
        MetricType::Local => local::capture(query.query),
        MetricType::Prometheus | MetricType::JsonPath => {
            let mut last = Err(CaptureError::NoTargets(query.name.to_owned()));
            for url in urls {
                last = match query.metric_type {
                    MetricType::Prometheus => prometheus::capture(backend, url, query).await,
                    _ => jsonpath::capture(backend, url, query).await,
                };
                match &last {
                    Err(e) if e.is_transport() => continue,
                    _ => break,
                }
            }
            last
        }
    };

    match result? {
        Capture::Value { value, .. } if value.is_nan() => Err(CaptureError::not_available(query.query)),
        other => Ok(other),
    }
}

/// Capture the next open metric value
pub(crate) async fn observe(pass: &Pass<'_>, trial: &mut Trial) -> Result<Option<Outcome>, ReconcileError> {
    let Some(completion_time) = trial.status.as_ref().and_then(|s| s.completion_time) else {
        return Ok(None);
    };
    let experiment = pass.experiment(trial).await?;
    let now = pass.now;

    if !experiment.spec.metrics.is_empty() && trial.condition_status(ConditionType::Observed).is_none() {
        trial.apply_condition(ConditionType::Observed, ConditionStatus::Unknown, None, None, now);
        return pass.commit(trial).await.map(Some);
    }

    let open = experiment.spec.metrics.iter().find(|m| {
        trial
            .spec
            .values
            .iter()
            .find(|v| v.name == m.name)
            .map_or(true, |v| v.budget.is_pending())
    });

    let Some(metric) = open else {
        if trial.condition_status(ConditionType::Observed).is_some() {
            trial.apply_condition(ConditionType::Observed, ConditionStatus::True, None, None, now);
        }
        trial.apply_condition(ConditionType::Complete, ConditionStatus::True, None, None, now);
        info!(trial = %trial.name_any(), "Trial complete");
        return pass.commit(trial).await.map(Some);
    };

    let result = capture_one(pass, trial, experiment, metric, completion_time).await?;
    let attempts = pass.config().metric_attempts;
    let value = trial.value_mut(&metric.name, attempts);
    match result {
        Ok(Capture::RetryAfter(delay)) => {
            debug!(metric = %metric.name, ?delay, "Metric source not ready");
            return Ok(Some(Outcome::RequeueAfter(delay)));
        }
        Ok(Capture::Value { value: v, error }) => {
            value.value = Some(format!("{v}"));
            value.error = (error != 0.0 && !error.is_nan()).then(|| format!("{error}"));
            value.budget.succeed();
            info!(metric = %metric.name, value = v, "Metric captured");
        }
        Err(e) => {
            let message = e.to_string();
            match value.budget.fail(message.clone()) {
                BudgetState::Retry => {
                    warn!(metric = %metric.name, error = %message, remaining = value.budget.attempts_remaining, "Metric capture failed");
                }
                BudgetState::Exhausted => {
                    warn!(metric = %metric.name, error = %message, "Metric capture attempts exhausted");
                    trial.fail("MetricFailed", &message, now);
                }
            }
        }
    }

    trial.apply_condition(ConditionType::Observed, ConditionStatus::False, None, None, now);
    pass.commit(trial).await.map(Some)
}

/// Render and run one metric; cluster failures abort the pass, everything else is a capture result
async fn capture_one(
    pass: &Pass<'_>,
    trial: &Trial,
    experiment: &Experiment,
    metric: &Metric,
    completion_time: DateTime<Utc>,
) -> Result<Result<Capture, CaptureError>, ReconcileError> {
    let templates = &pass.ctx.templates;
    let rendered = templates.render_query(&metric.query, trial, experiment);
    let rendered_error = metric
        .error_query
        .as_deref()
        .filter(|q| !q.is_empty())
        .map(|q| templates.render_query(q, trial, experiment))
        .transpose();
    let (rendered, rendered_error) = match (rendered, rendered_error) {
        (Ok(q), Ok(e)) => (q, e),
        (Err(e), _) | (_, Err(e)) => return Ok(Err(e.into())),
    };

    let urls = match metric.metric_type {
        MetricType::Local => Vec::new(),
        _ => match target::resolve_urls(pass.cluster(), &trial.namespace_or_default(), metric).await? {
            Ok(urls) => urls,
            Err(e) => return Ok(Err(e)),
        },
    };

    let query = Query {
        name: &metric.name,
        metric_type: metric.metric_type,
        query: &rendered,
        error_query: rendered_error.as_deref(),
        completion_time,
        retry_after: pass.config().metrics_retry(),
    };
    Ok(capture(pass.ctx.metrics.as_ref(), &query, &urls).await)
}
