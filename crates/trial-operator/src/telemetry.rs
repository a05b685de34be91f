//! Log setup

use tracing_subscriber::EnvFilter;

use crate::config::LogFormat;

/// Install the global subscriber; `RUST_LOG` overrides the default `info` level
pub(crate) fn init(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    let installed = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("unable to install logger: {e}"))
}
