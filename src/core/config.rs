//! Configuration parsing and validation.
//!
//! Tessera configuration is loaded from a TOML file with CLI overrides.
//! Every section is optional and falls back to its defaults.

use crate::api::ApiVersion;
use crate::reconcile::ControllerSettings;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/tessera.toml";

/// Top-level Tessera configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Discovery server.
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Reconciliation controllers.
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Manifest directory.
    #[serde(default)]
    pub manifests: ManifestConfig,

    /// Logging and metrics.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Discovery server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Bind address (e.g., "0.0.0.0:18000").
    #[serde(default = "default_discovery_bind")]
    pub bind: String,

    /// Served API version.
    #[serde(default)]
    pub api_version: ApiVersion,

    /// TLS certificate chain path.
    pub tls_chain_path: Option<String>,

    /// TLS private key path.
    pub tls_key_path: Option<String>,

    /// Client CA path for mTLS.
    pub client_ca_path: Option<String>,

    /// Responses queued per stream before the stream waits on its client.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bind: default_discovery_bind(),
            api_version: ApiVersion::default(),
            tls_chain_path: None,
            tls_key_path: None,
            client_ca_path: None,
            stream_buffer: default_stream_buffer(),
        }
    }
}

/// Controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Workers per controller.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Revisions kept per node and API version.
    #[serde(default = "default_max_revisions")]
    pub max_revisions: usize,

    /// First retry delay after a failed reconcile.
    #[serde(default = "default_requeue_base_ms")]
    pub requeue_base_ms: u64,

    /// Retry delay ceiling.
    #[serde(default = "default_requeue_max_ms")]
    pub requeue_max_ms: u64,

    /// Full resync period in seconds; 0 disables.
    #[serde(default = "default_resync_interval_seconds")]
    pub resync_interval_seconds: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_revisions: default_max_revisions(),
            requeue_base_ms: default_requeue_base_ms(),
            requeue_max_ms: default_requeue_max_ms(),
            resync_interval_seconds: default_resync_interval_seconds(),
        }
    }
}

impl ControllerConfig {
    pub fn settings(&self) -> ControllerSettings {
        ControllerSettings {
            workers: self.workers,
            requeue_base: Duration::from_millis(self.requeue_base_ms),
            requeue_max: Duration::from_millis(self.requeue_max_ms),
        }
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_seconds)
    }
}

/// Manifest loading configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestConfig {
    /// Directory of ConfigRequest and Secret manifests.
    pub dir: Option<String>,

    /// Rescan period in seconds; 0 loads once.
    #[serde(default = "default_rescan_interval_seconds")]
    pub rescan_interval_seconds: u64,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            dir: None,
            rescan_interval_seconds: default_rescan_interval_seconds(),
        }
    }
}

/// Telemetry and observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus text file rewritten periodically (optional).
    pub metrics_file: Option<String>,

    /// Metrics file rewrite period in seconds.
    #[serde(default = "default_metrics_interval_seconds")]
    pub metrics_interval_seconds: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            metrics_file: None,
            metrics_interval_seconds: default_metrics_interval_seconds(),
        }
    }
}

// Default value functions

fn default_discovery_bind() -> String {
    "0.0.0.0:18000".to_string()
}

fn default_stream_buffer() -> usize {
    16
}

fn default_workers() -> usize {
    4
}

fn default_max_revisions() -> usize {
    crate::reconcile::DEFAULT_MAX_REVISIONS
}

fn default_requeue_base_ms() -> u64 {
    100
}

fn default_requeue_max_ms() -> u64 {
    30_000
}

fn default_resync_interval_seconds() -> u64 {
    300
}

fn default_rescan_interval_seconds() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_interval_seconds() -> u64 {
    15
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(ref bind) = overrides.bind {
            self.discovery.bind = bind.clone();
        }
        if let Some(ref dir) = overrides.manifest_dir {
            self.manifests.dir = Some(dir.clone());
        }
    }

    /// Parsed discovery bind address.
    pub fn discovery_addr(&self) -> Result<SocketAddr> {
        self.discovery
            .bind
            .parse()
            .with_context(|| format!("discovery.bind is not a socket address: {}", self.discovery.bind))
    }

    /// Manifest directory, if configured.
    pub fn manifest_dir(&self) -> Option<PathBuf> {
        self.manifests.dir.as_ref().map(PathBuf::from)
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_discovery()?;
        self.validate_controller()?;
        self.validate_telemetry()?;
        Ok(())
    }

    fn validate_discovery(&self) -> Result<()> {
        self.discovery_addr()?;
        if self.discovery.stream_buffer == 0 {
            anyhow::bail!("discovery.stream_buffer must be > 0");
        }
        self.validate_tls_config(
            "discovery",
            &self.discovery.tls_chain_path,
            &self.discovery.tls_key_path,
            &self.discovery.client_ca_path,
        )
    }

    fn validate_controller(&self) -> Result<()> {
        if self.controller.workers == 0 {
            anyhow::bail!("controller.workers must be > 0");
        }
        if self.controller.max_revisions == 0 {
            anyhow::bail!("controller.max_revisions must be > 0");
        }
        if self.controller.requeue_base_ms == 0 {
            anyhow::bail!("controller.requeue_base_ms must be > 0");
        }
        if self.controller.requeue_max_ms < self.controller.requeue_base_ms {
            anyhow::bail!(
                "controller.requeue_max_ms ({}) cannot be below requeue_base_ms ({})",
                self.controller.requeue_max_ms,
                self.controller.requeue_base_ms
            );
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        if self.telemetry.metrics_file.is_some() && self.telemetry.metrics_interval_seconds == 0 {
            anyhow::bail!("telemetry.metrics_interval_seconds must be > 0 when metrics_file is set");
        }
        Ok(())
    }

    fn validate_tls_config(
        &self,
        prefix: &str,
        chain_path: &Option<String>,
        key_path: &Option<String>,
        client_ca_path: &Option<String>,
    ) -> Result<()> {
        // If either chain or key is specified, both must be specified
        match (chain_path, key_path) {
            (Some(_), None) => {
                anyhow::bail!(
                    "{}.tls_key_path required when tls_chain_path is set",
                    prefix
                );
            }
            (None, Some(_)) => {
                anyhow::bail!(
                    "{}.tls_chain_path required when tls_key_path is set",
                    prefix
                );
            }
            (Some(chain), Some(key)) => {
                if !Path::new(chain).exists() {
                    anyhow::bail!("{}.tls_chain_path does not exist: {}", prefix, chain);
                }
                if !Path::new(key).exists() {
                    anyhow::bail!("{}.tls_key_path does not exist: {}", prefix, key);
                }
            }
            (None, None) => {
                if client_ca_path.is_some() {
                    anyhow::bail!("{}.client_ca_path requires tls_chain_path and tls_key_path", prefix);
                }
            }
        }
        Ok(())
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Override discovery bind address.
    pub bind: Option<String>,
    /// Override manifest directory.
    pub manifest_dir: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.discovery.bind, "0.0.0.0:18000");
        assert_eq!(config.discovery.stream_buffer, 16);
        assert_eq!(config.controller.max_revisions, 10);
        assert_eq!(config.controller.settings().workers, 4);
        assert_eq!(config.manifests.rescan_interval_seconds, 10);
        assert_eq!(config.telemetry.log_level, "info");
    }

    #[test]
    fn overrides_replace_values() {
        let mut config = Config::default();
        config.apply_overrides(&ConfigOverrides {
            log_level: Some("debug".into()),
            bind: Some("127.0.0.1:0".into()),
            manifest_dir: Some("manifests".into()),
        });
        assert_eq!(config.telemetry.log_level, "debug");
        assert_eq!(config.discovery_addr().unwrap().port(), 0);
        assert_eq!(config.manifest_dir(), Some(PathBuf::from("manifests")));
    }
}
