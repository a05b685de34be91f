//! Operator configuration
//!
//! Settings are layered: defaults, then the TOML file, then the environment, then
//! command line flags.

use anyhow::{bail, Context as _};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use trial_engine::EngineConfig;

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum LogFormat {
    /// Human readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => bail!("unknown log format '{other}'"),
        }
    }
}

/// Settings for the controller process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct OperatorConfig {
    /// Only watch trials in this namespace
    pub(crate) namespace: Option<String>,
    /// Trials reconciled at the same time
    pub(crate) max_concurrent: u16,
    /// Log output format
    pub(crate) log_format: LogFormat,
    /// Engine tunables
    pub(crate) engine: EngineConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            max_concurrent: 8,
            log_format: LogFormat::Text,
            engine: EngineConfig::default(),
        }
    }
}

impl OperatorConfig {
    /// Read a TOML configuration file
    pub(crate) fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read configuration file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("invalid configuration file {}", path.display()))
    }

    /// Apply environment overrides from `lookup`
    pub(crate) fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(image) = lookup("DEFAULT_SETUP_IMAGE").filter(|v| !v.is_empty()) {
            self.engine.setup_image = image;
        }
        if let Some(policy) = lookup("DEFAULT_SETUP_IMAGE_PULL_POLICY").filter(|v| !v.is_empty()) {
            self.engine.setup_image_pull_policy = policy;
        }
    }
}
