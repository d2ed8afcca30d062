use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use ulink::{AcceptancePolicy, CapabilityPolicy, RemoteNode, UlConfig, UlError};

use crate::config::{LoggingConfig, NodeConfig};
use crate::services;
use crate::storage::StorageConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration syntax: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("node id must not be empty")]
    InvalidNodeId,

    #[error("log_file_path is required when log_to_file is enabled")]
    MissingLogFile,

    #[error("invalid listener settings: {0}")]
    Listener(#[source] UlError),

    #[error("no capabilities configured")]
    NoCapabilities,

    #[error("capability '{0}' lists no encodings")]
    EmptyEncodings(String),

    #[error("capability '{capability}' names unknown handler '{handler}'")]
    UnknownHandler { capability: String, handler: String },

    #[error("unknown storage backend '{0}'")]
    UnknownStorageBackend(String),

    #[error("location '{0}' has an empty path")]
    EmptyLocation(String),

    #[error("remote '{name}' is invalid: {source}")]
    Remote {
        name: String,
        #[source]
        source: UlError,
    },

    #[error("no remote named '{0}'")]
    UnknownRemote(String),
}

/// One negotiable capability and the handler serving it
#[derive(Debug, Clone, Deserialize)]
pub struct CapabilityConfig {
    /// Acceptable encodings, most preferred first
    pub encodings: Vec<String>,
    #[serde(default)]
    pub mandatory: bool,
    pub handler: String,
}

/// A storage location that may be named in availability updates
#[derive(Debug, Clone, Deserialize)]
pub struct LocationConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub listener: UlConfig,
    #[serde(default)]
    pub capabilities: BTreeMap<String, CapabilityConfig>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub locations: BTreeMap<String, LocationConfig>,
    #[serde(default)]
    pub remotes: BTreeMap<String, RemoteNode>,
}

impl Config {
    /// Read, parse and validate the configuration file at `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.node.validate()?;

        if self.logging.log_to_file && self.logging.log_file_path.trim().is_empty() {
            return Err(ConfigError::MissingLogFile);
        }

        self.listener.validate().map_err(ConfigError::Listener)?;

        if self.capabilities.is_empty() {
            return Err(ConfigError::NoCapabilities);
        }
        for (name, capability) in &self.capabilities {
            if capability.encodings.is_empty() {
                return Err(ConfigError::EmptyEncodings(name.clone()));
            }
            if !services::HANDLERS.contains(&capability.handler.as_str()) {
                return Err(ConfigError::UnknownHandler {
                    capability: name.clone(),
                    handler: capability.handler.clone(),
                });
            }
        }

        if self.storage.backend != "filesystem" {
            return Err(ConfigError::UnknownStorageBackend(self.storage.backend.clone()));
        }

        for (name, location) in &self.locations {
            if location.path.as_os_str().is_empty() {
                return Err(ConfigError::EmptyLocation(name.clone()));
            }
        }

        for (name, remote) in &self.remotes {
            remote.validate().map_err(|source| ConfigError::Remote {
                name: name.clone(),
                source,
            })?;
        }

        Ok(())
    }

    /// Acceptance policy for the listener, one entry per configured capability
    pub fn acceptance_policy(&self) -> AcceptancePolicy {
        self.capabilities
            .iter()
            .fold(AcceptancePolicy::new(), |policy, (name, capability)| {
                let mut supported = CapabilityPolicy::new(capability.encodings.iter().cloned());
                if capability.mandatory {
                    supported = supported.mandatory();
                }
                policy.with_capability(name.clone(), supported)
            })
    }

    pub fn remote(&self, name: &str) -> Result<&RemoteNode, ConfigError> {
        self.remotes
            .get(name)
            .ok_or_else(|| ConfigError::UnknownRemote(name.to_string()))
    }
}
