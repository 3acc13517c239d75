//! ---
//! ams_section: "01-core-functionality"
//! ams_subsection: "module"
//! ams_type: "source"
//! ams_scope: "code"
//! ams_description: "Shared primitives and utilities for the core runtime."
//! ams_version: "v0.0.0-prealpha"
//! ams_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9899))
}

fn default_actuator_queue_warn() -> usize {
    1024
}

/// Primary configuration object for the R-AMS runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub linking: LinkingConfig,
    #[serde(default)]
    pub seed: SeedConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "R_AMS_CONFIG";

    /// Load configuration from disk, respecting the `R_AMS_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("failed to load config file {}", path.display()))
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.linking.validate()?;
        if let Some(path) = &self.seed.path {
            if path.as_os_str().is_empty() {
                return Err(anyhow!("seed.path must not be empty when set"));
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

/// Settings for the agent linking service.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkingConfig {
    /// Upper bound for a single discovery or import task.
    #[serde(default)]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub discovery_timeout: Option<Duration>,
    /// Actuator backlog depth that triggers a warning from the dispatcher.
    #[serde(default = "default_actuator_queue_warn")]
    pub actuator_queue_warn: usize,
}

impl Default for LinkingConfig {
    fn default() -> Self {
        Self {
            discovery_timeout: None,
            actuator_queue_warn: default_actuator_queue_warn(),
        }
    }
}

impl LinkingConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(timeout) = self.discovery_timeout {
            if timeout.is_zero() {
                return Err(anyhow!("linking.discovery_timeout must be greater than zero"));
            }
        }
        if self.actuator_queue_warn == 0 {
            return Err(anyhow!("linking.actuator_queue_warn must be greater than zero"));
        }
        Ok(())
    }
}

/// Optional asset seed loaded into the in-memory store at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config: AppConfig = "[linking]\ndiscovery_timeout = 30\n".parse().unwrap();
        assert_eq!(
            config.linking.discovery_timeout,
            Some(Duration::from_secs(30))
        );
        assert_eq!(config.linking.actuator_queue_warn, 1024);
        assert!(config.metrics.enabled);
        assert_eq!(config.logging.format, LogFormat::StructuredJson);
    }

    #[test]
    fn rejects_zero_discovery_timeout() {
        let err = "[linking]\ndiscovery_timeout = 0\n"
            .parse::<AppConfig>()
            .unwrap_err();
        assert!(format!("{err:#}").contains("discovery_timeout"));
    }

    #[test]
    fn load_prefers_first_existing_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ams.toml");
        std::fs::write(&path, "[seed]\npath = \"seed.yaml\"\n").unwrap();
        let missing = dir.path().join("missing.toml");
        let loaded = AppConfig::load_with_source(&[missing, path.clone()]).unwrap();
        assert_eq!(loaded.source, path);
        assert_eq!(
            loaded.config.seed.path.as_deref(),
            Some(Path::new("seed.yaml"))
        );
    }
}
