//! Agent configuration.

use std::path::Path;

use dlmp_common::CommonError;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::AgentError;

/// Configuration injected into an [`Agent`](crate::Agent) at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Build/version tag reported over the control channel.
    pub version: String,

    /// Prefix of the cache namespace name.
    pub cache_prefix: String,

    /// Origin of the host application.
    pub origin: Url,

    /// Path prefix of API traffic.
    pub api_root: String,

    /// Root-level paths written during installation.
    pub precache: Vec<String>,

    /// Document served to navigations that cannot be satisfied.
    pub offline_page: String,

    /// Path patterns that are never cached.
    pub no_cache_patterns: Vec<String>,

    /// API path patterns whose responses are persisted.
    pub api_cache_patterns: Vec<String>,

    /// Tag of the reconnect-triggered sync event.
    pub sync_tag: String,

    /// Notification presentation defaults.
    pub notification: NotificationDefaults,
}

/// Values used when a push message leaves presentation fields out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationDefaults {
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            cache_prefix: "dlmp-cache".to_string(),
            origin: Url::parse("http://localhost:3000/").expect("static URL is valid"),
            api_root: "/api/".to_string(),
            precache: vec![
                "/".to_string(),
                "/index.html".to_string(),
                "/manifest.json".to_string(),
                "/offline.html".to_string(),
            ],
            offline_page: "/offline.html".to_string(),
            no_cache_patterns: vec![
                r"^/api/auth/login$".to_string(),
                r"^/api/auth/logout$".to_string(),
                r"^/api/files/upload$".to_string(),
            ],
            api_cache_patterns: vec![
                r"^/api/users/me$".to_string(),
                r"^/api/dashboard/statistics$".to_string(),
                r"^/api/system/config$".to_string(),
            ],
            sync_tag: "background-sync".to_string(),
            notification: NotificationDefaults::default(),
        }
    }
}

impl Default for NotificationDefaults {
    fn default() -> Self {
        Self {
            icon: "/icons/icon-192x192.png".to_string(),
            badge: "/icons/badge-72x72.png".to_string(),
            vibrate: vec![200, 100, 200],
        }
    }
}

impl AgentConfig {
    /// Create a default configuration for another origin.
    pub fn for_origin(origin: Url) -> Self {
        Self {
            origin,
            ..Default::default()
        }
    }

    /// Set the version tag.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self, AgentError> {
        let config: Self = serde_json::from_str(json).map_err(|e| {
            AgentError::Common(CommonError::config_with_source("invalid agent config", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Common(CommonError::config_with_source(
                format!("cannot read {}", path.display()),
                e,
            ))
        })?;
        Self::from_json_str(&json)
    }

    /// Check invariants serde cannot express.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.version.trim().is_empty() {
            return Err(AgentError::Config("version must not be empty".to_string()));
        }
        if !self.api_root.starts_with('/') {
            return Err(AgentError::Config(format!(
                "api_root must start with '/': {}",
                self.api_root
            )));
        }
        if self.origin.cannot_be_a_base() {
            return Err(AgentError::Config(format!(
                "origin cannot be a base URL: {}",
                self.origin
            )));
        }
        Ok(())
    }

    /// Name of this version's cache namespace.
    pub fn namespace(&self) -> String {
        format!("{}-{}", self.cache_prefix, self.version)
    }

    /// Resolve a path (or absolute URL) against the host origin.
    pub fn resolve(&self, path: &str) -> Result<Url, AgentError> {
        self.origin
            .join(path)
            .map_err(|e| AgentError::Config(format!("cannot resolve {path}: {e}")))
    }
}
