//! Error types for the trial engine
//!
//! Errors fall in four groups:
//! - Cluster API failures, which abort the pass and leave the trial untouched
//! - Capture failures, which consume a metric value's retry budget
//! - Template failures, which are permanent for the patch or query that caused them
//! - Stability failures, either "try again later" or terminal

use std::time::Duration;
use trial_api::{PhaseError, SelectorError};

/// Error aborting a reconciliation pass
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// Cluster API call failed
    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// The trial references a missing experiment
    #[error("experiment {namespace}/{name} not found")]
    ExperimentNotFound {
        /// Experiment namespace
        namespace: String,
        /// Experiment name
        name: String,
    },

    /// A write would move the trial backwards through its lifecycle
    #[error(transparent)]
    Phase(#[from] PhaseError),

    /// Label selector could not be rendered
    #[error("invalid label selector: {0}")]
    Selector(#[from] SelectorError),

    /// A generated child object could not be encoded
    #[error("encoding failed: {0}")]
    Encoding(String),
}

impl ReconcileError {
    /// Check if the pass should simply be retried
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cluster(e) => e.is_transient(),
            Self::ExperimentNotFound { .. } => true,
            Self::Phase(_) | Self::Selector(_) | Self::Encoding(_) => false,
        }
    }

    /// Check if a write lost a race with another writer
    #[inline]
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Cluster(ClusterError::Conflict(_)))
    }
}

/// Cluster API errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    /// Object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Stale write
    #[error("conflict: {0}")]
    Conflict(String),

    /// Object already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// API server rejected the request
    #[error("api error {code}: {message}")]
    Api {
        /// HTTP status code
        code: u16,
        /// Server message
        message: String,
    },

    /// Request never reached the API server
    #[error("transport error: {0}")]
    Transport(String),

    /// Payload could not be encoded or decoded
    #[error("invalid payload: {0}")]
    Payload(String),

    /// Selector could not be rendered
    #[error("invalid selector: {0}")]
    Selector(#[from] SelectorError),
}

impl ClusterError {
    /// Check if the error may clear on its own
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Conflict(_) | Self::Transport(_) => true,
            Self::Api { code, .. } => *code >= 500 || *code == 429,
            _ => false,
        }
    }
}

/// Template rendering errors
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    /// The template failed to render
    #[error("template error: {0}")]
    Render(#[from] minijinja::Error),

    /// The rendered patch is neither YAML nor JSON
    #[error("rendered patch is not a valid document: {0}")]
    Document(#[from] serde_yaml::Error),

    /// The rendered patch could not be re-encoded as JSON
    #[error("rendered patch could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A setup task that cannot be turned into a container
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    /// Helm value refers to a parameter the trial has no assignment for
    #[error("invalid parameter reference '{parameter}' for Helm value '{value}'")]
    UnknownParameter {
        /// Referenced parameter
        parameter: String,
        /// Helm value name
        value: String,
    },

    /// Helm value template failed
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Helm configuration could not be encoded
    #[error("helm configuration could not be encoded: {0}")]
    Encode(#[from] serde_yaml::Error),
}

/// Metric capture errors
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// Query produced no data
    #[error("metric data not available{hint}")]
    NotAvailable {
        /// Extra context appended to the message
        hint: String,
    },

    /// Query produced a vector, matrix or string
    #[error("expected scalar query result, got {0}")]
    NotScalar(String),

    /// Path expression matched nothing, or more than one value
    #[error("query '{0}' did not match")]
    NoMatch(String),

    /// Matched value is not numeric
    #[error("could not convert match to a floating point number")]
    NotNumeric,

    /// Rendered local query is not a number
    #[error("invalid metric value '{0}'")]
    InvalidValue(String),

    /// Path expression does not parse
    #[error("invalid path expression '{path}': {message}")]
    InvalidPath {
        /// Expression text
        path: String,
        /// Parser message
        message: String,
    },

    /// Service port could not be resolved
    #[error("metric '{0}' has unresolvable port")]
    UnresolvablePort(String),

    /// No service matched the metric selector
    #[error("unable to find metric targets for '{0}'")]
    NoTargets(String),

    /// Unsupported URL scheme
    #[error("metric '{name}' has unsupported scheme '{scheme}'")]
    Scheme {
        /// Metric name
        name: String,
        /// Configured scheme
        scheme: String,
    },

    /// Query template failed
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Endpoint answered with something other than 200
    #[error("no value yet (HTTP {0})")]
    NoValueYet(u16),

    /// Backend returned an error response
    #[error("metrics backend error: {0}")]
    Backend(String),

    /// Backend could not be reached
    #[error("metrics request failed: {0}")]
    Http(String),
}

impl CaptureError {
    /// No data for `query`
    #[must_use]
    pub fn not_available(query: &str) -> Self {
        let hint = if query.trim_start().starts_with("scalar(") {
            " (the scalar function may have received an input vector whose size is not 1)".to_owned()
        } else {
            String::new()
        };
        Self::NotAvailable { hint }
    }

    /// Whether another target may succeed where this one failed
    #[inline]
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Http(_))
    }
}

impl From<reqwest::Error> for CaptureError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Backend(e.to_string())
        } else {
            Self::Http(e.to_string())
        }
    }
}

/// Result of a stability check that did not pass
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StabilityError {
    /// The object is still converging
    #[error("{kind}/{name} is not ready: {reason}")]
    RetryAfter {
        /// Object kind
        kind: String,
        /// Object name
        name: String,
        /// Failed check
        reason: String,
        /// Minimum time until the object may converge
        delay: Duration,
    },

    /// The object can never converge
    #[error("{kind} stability error for {name}: {reason}")]
    Terminal {
        /// Object kind
        kind: String,
        /// Object name
        name: String,
        /// Failed check
        reason: String,
    },
}

impl StabilityError {
    /// Failed check
    #[must_use]
    pub fn reason(&self) -> &str {
        match self {
            Self::RetryAfter { reason, .. } | Self::Terminal { reason, .. } => reason,
        }
    }
}
