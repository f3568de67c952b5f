//! Command-line interface.
//!
//! Unified CLI for Tessera operations.

pub mod commands;

use clap::{Parser, Subcommand};

/// Tessera - discovery control plane with automatic rollback.
#[derive(Parser, Debug)]
#[command(name = "tessera")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the control plane.
    Start(commands::StartArgs),
    /// Configuration operations.
    Config(commands::ConfigArgs),
    /// Print the desired version of each ConfigRequest in a manifest.
    Hash(commands::HashArgs),
}
