//! Trial Operator
//!
//! Watches `Trial` resources and drives them through setup, patching, stabilization,
//! the trial run and metric capture.

mod config;
mod controller;
mod telemetry;

use anyhow::Context as _;
use clap::{value_parser, Arg, ArgMatches, Command};
use std::path::PathBuf;
use tracing::info;

use config::{LogFormat, OperatorConfig};

fn cli() -> Command {
    Command::new("trial-operator")
        .version(trial_engine::VERSION)
        .about("Kubernetes controller for trial lifecycles")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .env("TRIAL_OPERATOR_CONFIG")
                .value_parser(value_parser!(PathBuf))
                .help("Path to a TOML configuration file"),
        )
        .arg(
            Arg::new("namespace")
                .long("namespace")
                .short('n')
                .help("Only watch trials in this namespace"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_parser(["text", "json"])
                .help("Log output format"),
        )
        .arg(
            Arg::new("max-concurrent")
                .long("max-concurrent")
                .value_parser(value_parser!(u16).range(1..))
                .help("Trials reconciled at the same time"),
        )
}

/// Layer file, environment and flags into one configuration
fn load_config(matches: &ArgMatches) -> anyhow::Result<OperatorConfig> {
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => OperatorConfig::from_file(path)?,
        None => OperatorConfig::default(),
    };
    config.apply_env(|key| std::env::var(key).ok());

    if let Some(ns) = matches.get_one::<String>("namespace") {
        config.namespace = Some(ns.clone());
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.log_format = format.parse::<LogFormat>()?;
    }
    if let Some(n) = matches.get_one::<u16>("max-concurrent") {
        config.max_concurrent = *n;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    let config = load_config(&matches)?;
    telemetry::init(config.log_format)?;

    info!(version = trial_engine::VERSION, "Starting trial operator");
    let client = kube::Client::try_default()
        .await
        .context("unable to create Kubernetes client")?;

    controller::run(client, config).await
}
