//! Reconciliation context
//!
//! A [`Context`] holds the injected collaborators shared by every pass. A [`Pass`] is
//! created per reconciliation: it fixes the pass time, remembers the phase the trial
//! started in, and caches the experiment for the duration of that one pass.

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use trial_api::{validate_transition, Experiment, Trial, TrialPhase};

use crate::cluster::Cluster;
use crate::config::EngineConfig;
use crate::error::{ClusterError, ReconcileError};
use crate::metric::MetricBackend;
use crate::template::TemplateEngine;

/// Source of the current time
pub trait Clock: Send + Sync {
    /// Current time
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// What the caller should do after a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// An object was written; its watch event triggers the next pass
    Changed,
    /// Nothing changed; run again after the delay
    RequeueAfter(Duration),
    /// A write lost a race; run again from a fresh read
    RetryNow,
    /// Nothing left to do until the trial changes
    Idle,
}

/// Collaborators shared by every reconciliation
pub struct Context {
    pub(crate) cluster: Arc<dyn Cluster>,
    pub(crate) metrics: Arc<dyn MetricBackend>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: EngineConfig,
    pub(crate) templates: TemplateEngine,
}

impl Context {
    /// Create a context with the default configuration and the wall clock
    #[must_use]
    pub fn new(cluster: Arc<dyn Cluster>, metrics: Arc<dyn MetricBackend>) -> Self {
        Self {
            cluster,
            metrics,
            clock: Arc::new(SystemClock),
            config: EngineConfig::default(),
            templates: TemplateEngine::new(),
        }
    }

    /// With clock
    #[inline]
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// With configuration
    #[inline]
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Engine configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

/// State of a single reconciliation pass
pub(crate) struct Pass<'a> {
    pub(crate) ctx: &'a Context,
    pub(crate) now: DateTime<Utc>,
    pub(crate) phase: TrialPhase,
    experiment: OnceCell<Experiment>,
}

impl<'a> Pass<'a> {
    pub(crate) fn new(ctx: &'a Context, trial: &Trial) -> Self {
        Self {
            ctx,
            now: ctx.clock.now(),
            phase: TrialPhase::of(trial),
            experiment: OnceCell::new(),
        }
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    pub(crate) fn cluster(&self) -> &dyn Cluster {
        self.ctx.cluster.as_ref()
    }

    /// The trial's experiment, fetched at most once per pass
    pub(crate) async fn experiment(&self, trial: &Trial) -> Result<&Experiment, ReconcileError> {
        self.experiment
            .get_or_try_init(|| async {
                let (namespace, name) = trial.experiment_key();
                self.cluster()
                    .get_experiment(&namespace, &name)
                    .await?
                    .ok_or(ReconcileError::ExperimentNotFound { namespace, name })
            })
            .await
    }

    /// Persist the trial
    ///
    /// This is the single write of the pass; a conflict asks for an immediate retry.
    pub(crate) async fn commit(&self, trial: &mut Trial) -> Result<Outcome, ReconcileError> {
        trial.refresh_summaries();
        let next = TrialPhase::of(trial);
        validate_transition(self.phase, next)?;

        match self.cluster().update_trial(trial).await {
            Ok(_) => {
                if next != self.phase {
                    info!(trial = %trial.name_any(), from = %self.phase, to = %next, "Trial phase changed");
                }
                Ok(Outcome::Changed)
            }
            Err(ClusterError::Conflict(message)) => {
                debug!(trial = %trial.name_any(), %message, "Trial update conflicted, retrying");
                Ok(Outcome::RetryNow)
            }
            Err(e) => Err(e.into()),
        }
    }
}
