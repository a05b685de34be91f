//! Trial API - resource model for the trial lifecycle controller
//!
//! Defines the objects the reconciler reads and writes:
//! - `Experiment`: parameters, patch templates, metrics and the trial template
//! - `Trial`: assignments, derived patch operations and metric values, status conditions
//! - `TrialPhase`: the explicit lifecycle state derived from a trial's conditions
//! - `RetryBudget`: bounded attempt counters carried by patch operations and values
//!
//! # Example
//!
//! ```rust,ignore
//! use trial_api::prelude::*;
//!
//! let trial: Trial = serde_yaml::from_str(manifest)?;
//! match TrialPhase::of(&trial) {
//!     TrialPhase::Complete | TrialPhase::Failed => println!("finished"),
//!     phase => println!("in progress: {phase}"),
//! }
//! ```

#![warn(unreachable_pub)]

pub mod budget;
pub mod condition;
pub mod experiment;
pub mod labels;
pub mod phase;
pub mod selector;
pub mod trial;

pub use budget::{BudgetState, RetryBudget};
pub use condition::{Applied, ConditionStatus, ConditionType, TrialCondition};
pub use experiment::{
    Experiment, ExperimentSpec, Metric, MetricType, Parameter, PatchTemplate, PatchType,
    TrialTemplateSpec,
};
pub use phase::{allowed_transitions, validate_transition, PhaseError, TrialPhase};
pub use selector::SelectorError;
pub use trial::{
    Assignment, HelmValue, PatchOperation, SetupTask, Trial, TrialSpec, TrialStatus, TrialValue,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with trial resources
    pub use crate::labels;
    pub use crate::{
        ConditionStatus, ConditionType, Experiment, Metric, MetricType, PatchOperation, PatchType,
        RetryBudget, Trial, TrialCondition, TrialPhase, TrialSpec, TrialStatus, TrialValue,
    };
}

/// API group of the custom resources
pub const GROUP: &str = "trialrunner.dev";

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
