//! Trial Engine - lifecycle reconciliation for trials
//!
//! Each call to [`reconcile`] moves one trial one step through its lifecycle:
//! - Setup and teardown jobs around the trial
//! - Rendering patch templates into operations and applying them one at a time
//! - Waiting for patched workloads to roll out
//! - Running the trial job and recording its measurement window
//! - Capturing metrics from local values, Prometheus or JSON endpoints
//!
//! All cluster access goes through [`Cluster`] and all metric requests through
//! [`MetricBackend`], both injected through the [`Context`].
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use trial_engine::prelude::*;
//!
//! let client = kube::Client::try_default().await?;
//! let ctx = Context::new(
//!     Arc::new(KubeCluster::new(client)),
//!     Arc::new(HttpMetricBackend::new(std::time::Duration::from_secs(10))?),
//! );
//! match reconcile(&trial, &ctx).await? {
//!     Outcome::RequeueAfter(delay) => println!("check again in {delay:?}"),
//!     outcome => println!("{outcome:?}"),
//! }
//! ```

#![warn(unreachable_pub)]

pub mod cluster;
pub mod config;
pub mod context;
pub mod error;
pub mod job;
pub mod metric;
pub mod patch;
pub mod reconciler;
pub mod setup;
pub mod stability;
pub mod template;

pub use cluster::{Cluster, KubeCluster, Workload};
pub use config::EngineConfig;
pub use context::{Clock, Context, Outcome, SystemClock};
pub use error::{
    CaptureError, ClusterError, ReconcileError, SetupError, StabilityError, TemplateError,
};
pub use metric::{Capture, HttpMetricBackend, MetricBackend, QueryValue, ScrapeTarget};
pub use reconciler::reconcile;
pub use template::TemplateEngine;

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for driving the engine
    pub use crate::{
        reconcile, Cluster, Context, EngineConfig, HttpMetricBackend, KubeCluster, MetricBackend,
        Outcome, ReconcileError,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
