//! Start command implementation.

use crate::core::config::{Config, ConfigOverrides};
use crate::core::runtime::Runtime;
use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;

/// Start the control plane.
#[derive(Args, Debug, Default)]
pub struct StartArgs {
    /// Discovery bind address, overriding `discovery.bind`.
    #[arg(long)]
    pub bind: Option<String>,

    /// Manifest directory, overriding `manifests.dir`.
    #[arg(long)]
    pub manifests: Option<String>,
}

/// Initialize tracing subscriber if the telemetry feature is enabled.
#[cfg(feature = "telemetry")]
fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

#[cfg(not(feature = "telemetry"))]
fn init_tracing(_level: &str) {}

/// Run the start command.
///
/// A missing config file at the default location is not an error; the
/// built-in defaults are used instead.
pub async fn run_start(
    config_path: &Path,
    explicit: bool,
    log_level: Option<String>,
    args: StartArgs,
) -> Result<()> {
    let mut config = if explicit || config_path.exists() {
        Config::from_file(config_path)
            .with_context(|| format!("failed to load config from {:?}", config_path))?
    } else {
        Config::default()
    };
    config.apply_overrides(&ConfigOverrides {
        log_level,
        bind: args.bind,
        manifest_dir: args.manifests,
    });
    config.validate().context("invalid configuration")?;

    init_tracing(&config.telemetry.log_level);

    let mut runtime = Runtime::new(config)?;
    runtime.run().await
}
