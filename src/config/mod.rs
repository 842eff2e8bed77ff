use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::constants;

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Registry assumed for references that name none
    #[serde(default = "default_registry")]
    pub default_registry: String,

    /// Project assumed for single-component names
    #[serde(default = "default_project")]
    pub default_project: String,

    /// Number of concurrent workers
    #[serde(default = "default_jobs")]
    pub jobs: usize,

    /// Per-image timeout in seconds; 0 disables the deadline
    #[serde(default)]
    pub timeout_secs: u64,

    /// Archive settings
    #[serde(default)]
    pub archive: ArchiveConfig,

    /// Registries reached over plain HTTP
    #[serde(default)]
    pub insecure_registries: Vec<String>,

    /// Registry authentication configuration
    #[serde(default)]
    pub registries: HashMap<String, RegistryAuth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Maximum size of one archive part in bytes; 0 disables splitting
    #[serde(default)]
    pub part_size: u64,

    /// Compression applied to the archive stream
    #[serde(default)]
    pub compression: Compression,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryAuth {
    pub username: Option<String>,
    pub password: Option<String>,
    pub auth: Option<String>,
}

fn default_registry() -> String {
    constants::reference::DEFAULT_REGISTRY.to_string()
}

fn default_project() -> String {
    constants::reference::DEFAULT_PROJECT.to_string()
}

fn default_jobs() -> usize {
    constants::jobs::DEFAULT
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            part_size: 0,
            compression: Compression::None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_registry: default_registry(),
            default_project: default_project(),
            jobs: default_jobs(),
            timeout_secs: 0,
            archive: ArchiveConfig::default(),
            insecure_registries: Vec::new(),
            registries: HashMap::new(),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        if let Some(config_dir) = dirs::config_dir() {
            let config_path = config_dir.join("ferry").join("config.toml");
            if config_path.exists() {
                return Self::from_file(&config_path);
            }
        }
        Ok(Config::default())
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Worker count clamped to the supported range
    pub fn workers(&self) -> usize {
        self.jobs.clamp(1, constants::jobs::MAX)
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}
