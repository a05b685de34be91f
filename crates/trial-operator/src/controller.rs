//! Controller wiring
//!
//! Trials are watched directly; jobs are watched through their owner reference so a
//! finished trial or setup job triggers a pass for its trial.

use anyhow::Context as _;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use trial_api::Trial;
use trial_engine::{Context, HttpMetricBackend, KubeCluster, Outcome, ReconcileError};

use crate::config::OperatorConfig;

/// Delay before retrying a pass that failed with a permanent error
const FAILED_PASS_DELAY: Duration = Duration::from_secs(60);

/// Run the controller until the process is signalled
pub(crate) async fn run(client: Client, config: OperatorConfig) -> anyhow::Result<()> {
    let (trials, jobs): (Api<Trial>, Api<Job>) = match config.namespace.as_deref() {
        Some(ns) => (Api::namespaced(client.clone(), ns), Api::namespaced(client.clone(), ns)),
        None => (Api::all(client.clone()), Api::all(client.clone())),
    };

    let metrics = HttpMetricBackend::new(config.engine.http_timeout()).context("unable to create metrics client")?;
    let ctx = Arc::new(
        Context::new(Arc::new(KubeCluster::new(client)), Arc::new(metrics)).with_config(config.engine.clone()),
    );

    info!(namespace = ?config.namespace, max_concurrent = config.max_concurrent, "Watching trials");
    Controller::new(trials, watcher::Config::default())
        .owns(jobs, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(config.max_concurrent))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((trial, action)) => debug!(trial = %trial.name, ?action, "Reconciled"),
                Err(e) => debug!(error = %e, "Reconcile loop error"),
            }
        })
        .await;

    info!("Controller stopped");
    Ok(())
}

async fn reconcile(trial: Arc<Trial>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let outcome = trial_engine::reconcile(&trial, &ctx).await?;
    Ok(action(outcome, ctx.config().generic_retry()))
}

/// Map a pass outcome onto a controller action
fn action(outcome: Outcome, generic_retry: Duration) -> Action {
    match outcome {
        Outcome::Changed | Outcome::Idle => Action::await_change(),
        Outcome::RequeueAfter(delay) if delay.is_zero() => Action::requeue(generic_retry),
        Outcome::RequeueAfter(delay) => Action::requeue(delay),
        Outcome::RetryNow => Action::requeue(Duration::ZERO),
    }
}

fn error_policy(trial: Arc<Trial>, error: &ReconcileError, ctx: Arc<Context>) -> Action {
    warn!(trial = %trial.name_any(), namespace = ?trial.namespace(), %error, "Reconciliation failed");
    if error.is_retryable() {
        Action::requeue(ctx.config().generic_retry())
    } else {
        Action::requeue(FAILED_PASS_DELAY)
    }
}
