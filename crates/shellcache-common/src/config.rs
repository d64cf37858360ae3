//! Agent configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Version tag of the cache bucket owned by this agent build.
pub const DEFAULT_CACHE_NAME: &str = "proscool-v1";

/// Key the latest navigation response is stored under.
pub const DEFAULT_SHELL_PATH: &str = "/redirection/";

/// Assets precached on install: the app shell, manifest and icons.
pub const DEFAULT_ASSETS: &[&str] = &[
    "/redirection/",
    "/static/manifest.json",
    "/static/icons/icon-192.svg",
    "/static/icons/icon-512.svg",
];

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            ConfigError::Io(_) => "io",
            ConfigError::Parse(_) => "parse",
            ConfigError::Invalid(_) => "invalid",
        }
    }
}

/// Offline agent configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Name of the current cache bucket; bump it to roll out new assets
    pub cache_name: String,

    /// Paths fetched and stored on install, resolved against the agent origin
    pub assets: Vec<String>,

    /// Path the navigation shell snapshot is stored under
    pub shell_path: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cache_name: DEFAULT_CACHE_NAME.to_string(),
            assets: DEFAULT_ASSETS.iter().map(|s| s.to_string()).collect(),
            shell_path: DEFAULT_SHELL_PATH.to_string(),
        }
    }
}

impl AgentConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Replace the cache version tag.
    pub fn with_cache_name(mut self, name: impl Into<String>) -> Self {
        self.cache_name = name.into();
        self
    }

    /// Replace the asset list.
    pub fn with_assets<I, S>(mut self, assets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.assets = assets.into_iter().map(Into::into).collect();
        self
    }

    /// Check the invariants the agent relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_name.trim().is_empty() {
            return Err(ConfigError::Invalid("cache_name must not be empty".into()));
        }
        if !self.shell_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "shell_path must be an absolute path, got {:?}",
                self.shell_path
            )));
        }
        if let Some(asset) = self.assets.iter().find(|a| !a.starts_with('/')) {
            return Err(ConfigError::Invalid(format!(
                "asset paths must be absolute, got {:?}",
                asset
            )));
        }
        Ok(())
    }
}
