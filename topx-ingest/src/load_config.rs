//! `load_config`: reads the static YAML run configuration and validates it.
//!
//! The YAML carries no secrets. Repository credentials come from the
//! environment (`PRESERVICA_USERNAME`, `PRESERVICA_PASSWORD`, see
//! [`crate::session::Credentials`]) and the staging bucket uses the default
//! AWS credential chain.
//!
//! ```yaml
//! preservica:
//!   server: https://eu.preservica.com
//!   tenant: ARCHIEF
//! ingest:
//!   parent_folder: 9fd239eb-19a3-4a46-9495-40fd9a5d8f93
//!   security_tag: open
//!   data_folder: /data/topx
//!   group_size: 10
//!   bucket: archief-ingest
//! retry:
//!   max_attempts: 5
//! ```
//!
//! # Errors
//! Everything surfaces as `anyhow::Error` with the offending path or key in the message.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use topx_ingest_core::config::SynchroniseConfig;
use topx_ingest_core::retry::RetryPolicy;
use tracing::{error, info};

pub const DEFAULT_XIP_NAMESPACE: &str = "http://preservica.com/XIP/v6.5";
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

fn default_xip_namespace() -> String {
    DEFAULT_XIP_NAMESPACE.to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

#[derive(Debug, Clone, Deserialize)]
pub struct CliConfig {
    pub preservica: PreservicaSection,
    pub ingest: SynchroniseConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Where the repository lives.
#[derive(Debug, Clone, Deserialize)]
pub struct PreservicaSection {
    /// Base URL, e.g. `https://eu.preservica.com`.
    pub server: String,
    pub tenant: String,
    #[serde(default = "default_xip_namespace")]
    pub xip_namespace: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl PreservicaSection {
    fn validate(&self) -> Result<()> {
        if !(self.server.starts_with("https://") || self.server.starts_with("http://")) {
            anyhow::bail!(
                "preservica.server must be an http(s) URL, got {:?}",
                self.server
            );
        }
        if self.tenant.trim().is_empty() {
            anyhow::bail!("preservica.tenant must not be empty");
        }
        if self.timeout_secs == 0 {
            anyhow::bail!("preservica.timeout_secs must be positive");
        }
        Ok(())
    }
}

/// Loads and validates the YAML config at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CliConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = fs::read_to_string(path_ref).map_err(|e| {
        error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
        anyhow::anyhow!("Failed to read config file {:?}: {}", path_ref, e)
    })?;

    let config: CliConfig = serde_yaml::from_str(&config_content).map_err(|e| {
        error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
        anyhow::anyhow!("Failed to parse config YAML: {e}")
    })?;
    info!(config_path = ?path_ref, "Parsed config YAML successfully");

    config.preservica.validate()?;
    config
        .ingest
        .validate()
        .context("Invalid ingest section")?;
    config.retry.validate().context("Invalid retry section")?;

    config.ingest.trace_loaded();
    info!(
        server = %config.preservica.server,
        tenant = %config.preservica.tenant,
        max_attempts = config.retry.max_attempts,
        "Loaded repository settings"
    );
    Ok(config)
}
