//! CLI command implementations.

mod config;
mod hash;
mod start;

pub use config::{run_config, ConfigArgs};
pub use hash::{run_hash, HashArgs};
pub use start::{run_start, StartArgs};
