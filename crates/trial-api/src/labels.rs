//! Well-known labels, roles and finalizers

/// Label carrying the experiment name on trials and the jobs they own
pub const EXPERIMENT: &str = "trialrunner.dev/experiment";

/// Label carrying the trial name on jobs
pub const TRIAL: &str = "trialrunner.dev/trial";

/// Label describing what a job does for its trial
pub const TRIAL_ROLE: &str = "trialrunner.dev/trial-role";

/// Label recording whether a setup job creates or deletes
pub const SETUP_MODE: &str = "trialrunner.dev/setup-mode";

/// Role of the workload job
pub const ROLE_TRIAL_RUN: &str = "trialRun";

/// Role of setup and teardown jobs
pub const ROLE_TRIAL_SETUP: &str = "trialSetup";

/// Finalizer that keeps a trial alive until its teardown job completes
pub const SETUP_FINALIZER: &str = "setup.trialrunner.dev/finalizer";
