//! Credential lookup by registry host

use super::{AuthConfig, DockerConfig};
use crate::config::Config;
use oci_distribution::secrets::RegistryAuth;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Resolves credentials for registry hosts. Built once per run.
#[derive(Debug, Clone, Default)]
pub struct Keychain {
    configured: HashMap<String, AuthConfig>,
    docker: DockerConfig,
}

impl Keychain {
    /// Keychain over the ferry config and the first readable Docker config
    pub fn new(config: &Config) -> Self {
        let docker = Self::config_paths()
            .iter()
            .find_map(|path| Self::load_docker_config(path))
            .unwrap_or_default();
        Self::with_docker_config(config, docker)
    }

    pub fn with_docker_config(config: &Config, docker: DockerConfig) -> Self {
        let configured = config
            .registries
            .iter()
            .map(|(host, entry)| (host.clone(), AuthConfig::from(entry)))
            .collect();
        Self { configured, docker }
    }

    fn config_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Ok(docker_config) = std::env::var("DOCKER_CONFIG") {
            paths.push(PathBuf::from(docker_config).join("config.json"));
        }

        if let Ok(auth_file) = std::env::var("REGISTRY_AUTH_FILE") {
            paths.push(PathBuf::from(auth_file));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".docker/config.json"));
        }

        paths
    }

    fn load_docker_config(path: &Path) -> Option<DockerConfig> {
        if !path.exists() {
            return None;
        }
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to read Docker config at {}: {}", path.display(), e);
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(config) => {
                debug!("Loaded Docker config from: {}", path.display());
                Some(config)
            }
            Err(e) => {
                warn!("Failed to parse Docker config at {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Keys a registry may be stored under
    fn normalize_registry(registry: &str) -> Vec<String> {
        let mut variants = vec![registry.to_string()];

        if registry == "docker.io" || registry == "index.docker.io" {
            variants.push("docker.io".to_string());
            variants.push("index.docker.io".to_string());
            variants.push("https://index.docker.io/v1/".to_string());
            variants.push("https://index.docker.io/v2/".to_string());
        } else {
            variants.push(format!("https://{}", registry));
            variants.push(format!("http://{}", registry));
        }

        variants
    }

    /// Credentials for `registry`, anonymous when none are stored
    pub fn resolve(&self, registry: &str) -> AuthConfig {
        let variants = Self::normalize_registry(registry);

        if let Some(auth) = variants.iter().find_map(|key| self.configured.get(key)) {
            debug!("Using configured credentials for {}", registry);
            return auth.clone();
        }

        if let Some(entry) = variants.iter().find_map(|key| self.docker.auths.get(key)) {
            debug!("Using Docker config credentials for {}", registry);
            return entry.to_auth_config();
        }

        AuthConfig::anonymous()
    }

    pub fn registry_auth(&self, registry: &str) -> RegistryAuth {
        self.resolve(registry).to_registry_auth()
    }
}
