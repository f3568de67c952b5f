//! Tessera - unified CLI entrypoint.
//!
//! Usage:
//!   tessera start --config config/tessera.toml [--bind ADDR] [--manifests DIR]
//!   tessera config validate --config config/tessera.toml
//!   tessera hash --manifest manifests/n1.yaml

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tessera::cli::commands::{run_config, run_hash, run_start};
use tessera::cli::{Cli, Commands};
use tessera::config::DEFAULT_CONFIG_PATH;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Determine config path - use global --config or default
    let explicit = cli.config.is_some();
    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    match cli.command {
        Commands::Start(args) => run_start(&config_path, explicit, cli.log_level, args).await,
        Commands::Config(args) => run_config(args),
        Commands::Hash(args) => run_hash(args),
    }
}
