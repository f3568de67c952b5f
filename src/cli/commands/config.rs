//! Config command implementation.

use crate::core::config::{Config, DEFAULT_CONFIG_PATH};
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate configuration file.
    Validate {
        /// Config file path.
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Print configuration with defaults filled in.
    Show {
        /// Config file path.
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
        /// Output format (toml, json).
        #[arg(long, default_value = "toml")]
        format: String,
    },
}

/// Run the config command.
pub fn run_config(args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommand::Validate { config } => validate_config(&config),
        ConfigCommand::Show { config, format } => show_config(&config, &format),
    }
}

fn validate_config(path: &Path) -> Result<()> {
    let config = Config::from_file(path)?;
    println!("✓ {} is valid", path.display());
    println!("  discovery: {}", config.discovery.bind);
    if config.discovery.tls_chain_path.is_none() {
        println!("  ⚠ Warning: discovery TLS not configured");
    }
    match config.manifest_dir() {
        Some(dir) => println!("  manifests: {}", dir.display()),
        None => println!("  ⚠ Warning: no manifest directory, nothing will be served"),
    }
    Ok(())
}

fn show_config(path: &Path, format: &str) -> Result<()> {
    let config = Config::from_file(path)?;
    println!("{}", render(&config, format)?);
    Ok(())
}

fn render(config: &Config, format: &str) -> Result<String> {
    match format {
        "json" => serde_json::to_string_pretty(config).context("failed to render config"),
        "toml" => toml::to_string_pretty(config).context("failed to render config"),
        other => anyhow::bail!("unknown format: {} (expected toml or json)", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_defaults_parse_back() {
        let rendered = render(&Config::default(), "toml").unwrap();
        let parsed = Config::from_toml(&rendered).unwrap();
        assert_eq!(parsed.discovery.bind, "0.0.0.0:18000");
        assert_eq!(parsed.controller.max_revisions, 10);
    }

    #[test]
    fn unknown_format_is_rejected() {
        assert!(render(&Config::default(), "yaml").is_err());
    }
}
