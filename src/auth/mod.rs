//! Registry credentials.
//!
//! Credentials come from the `registries` table of the ferry config file and,
//! failing that, from the `auths` section of the Docker client config
//! (`$DOCKER_CONFIG/config.json` or `~/.docker/config.json`). Anything else
//! is anonymous.

use base64::Engine;
use oci_distribution::secrets::RegistryAuth;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

mod keychain;


pub use keychain::Keychain;

/// User name registries expect alongside an identity or registry token
const TOKEN_USER: &str = "<token>";

/// Credentials for one registry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    /// base64 `user:password`
    pub auth: Option<String>,
    pub identity_token: Option<String>,
    pub registry_token: Option<String>,
}

impl AuthConfig {
    pub fn new(username: String, password: String) -> Self {
        Self {
            username: Some(username),
            password: Some(password),
            ..Default::default()
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_none()
            && self.password.is_none()
            && self.auth.is_none()
            && self.identity_token.is_none()
            && self.registry_token.is_none()
    }

    /// Convert to the registry client's auth value
    pub fn to_registry_auth(&self) -> RegistryAuth {
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            return RegistryAuth::Basic(username.clone(), password.clone());
        }

        if let Some((user, pass)) = self.auth.as_deref().and_then(decode_basic) {
            return RegistryAuth::Basic(user, pass);
        }

        // tokens are exchanged as the password of a fixed user
        if let Some(token) = self.identity_token.as_ref().or(self.registry_token.as_ref()) {
            return RegistryAuth::Basic(TOKEN_USER.to_string(), token.clone());
        }

        RegistryAuth::Anonymous
    }
}

impl From<&crate::config::RegistryAuth> for AuthConfig {
    fn from(entry: &crate::config::RegistryAuth) -> Self {
        Self {
            username: entry.username.clone(),
            password: entry.password.clone(),
            auth: entry.auth.clone(),
            ..Default::default()
        }
    }
}

/// Decode a base64 `user:password` pair
fn decode_basic(auth: &str) -> Option<(String, String)> {
    let decoded = base64::engine::general_purpose::STANDARD.decode(auth).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Docker config file structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DockerConfig {
    #[serde(default)]
    pub auths: HashMap<String, DockerAuthEntry>,
}

/// Entry in the Docker config auths section
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DockerAuthEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(rename = "identitytoken", skip_serializing_if = "Option::is_none")]
    pub identity_token: Option<String>,
    #[serde(rename = "registrytoken", skip_serializing_if = "Option::is_none")]
    pub registry_token: Option<String>,
}

impl DockerAuthEntry {
    pub fn to_auth_config(&self) -> AuthConfig {
        AuthConfig {
            username: self.username.clone(),
            password: self.password.clone(),
            auth: self.auth.clone(),
            identity_token: self.identity_token.clone(),
            registry_token: self.registry_token.clone(),
        }
    }
}
